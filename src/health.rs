//! Background health probing.
//!
//! Grounded on `api_claude::health_checks::HealthCheckConfig`'s
//! timeout/strategy shape, adapted to drive `Endpoint::record_probe`
//! across an entire inventory with the probe concurrency cap the data
//! model calls for.

use std::{ sync::Arc, time::Duration };
use tokio::sync::Semaphore;

use crate::{ config::HealthConfig, endpoint::Endpoint, error::ErrorKind, secret::Credential, transport::Transport };

/// At most this many probes run concurrently.
const MAX_CONCURRENT_PROBES : usize = 20;

/// Runs health probes against an endpoint inventory.
#[ derive( Debug ) ]
pub struct HealthProber< T >
{
  transport : Arc< T >,
  config : HealthConfig,
}

impl< T : Transport + 'static > HealthProber< T >
{
  /// Build a prober over `transport` using `config`.
  #[ must_use ]
  pub fn new( transport : Arc< T >, config : HealthConfig ) -> Self
  {
    Self { transport, config }
  }

  /// Probe a single endpoint and record the result. Returns `true` if
  /// this probe flipped the endpoint from unhealthy to healthy.
  pub async fn probe_one( &self, endpoint : &Endpoint ) -> bool
  {
    let snapshot = endpoint.snapshot();
    let url = format!( "{}{}", snapshot.url, self.config.health_path );
    let credential = endpoint.single_token().or_else( || endpoint.single_api_key() )
      .or_else( || endpoint.tokens().into_iter().next() )
      .or_else( || endpoint.api_keys().into_iter().next() )
      .map( Credential::new );

    match self.transport.probe( &url, self.config.timeout, credential.as_ref() ).await
    {
      Ok( latency ) => endpoint.record_probe( true, latency ),
      Err( ErrorKind::ClientCancel ) => false,
      Err( _ ) => { endpoint.record_probe( false, self.config.timeout ); false }
    }
  }

  /// Probe every endpoint in `endpoints`, capped at
  /// [`MAX_CONCURRENT_PROBES`] concurrent in-flight probes. Returns the
  /// keys of endpoints that transitioned from unhealthy to healthy,
  /// which the caller should feed into `ChannelManager::update_active`.
  pub async fn probe_all( &self, endpoints : &[ Arc< Endpoint > ] ) -> Vec< String >
  {
    let semaphore = Arc::new( Semaphore::new( MAX_CONCURRENT_PROBES ) );
    let mut handles = Vec::with_capacity( endpoints.len() );

    for endpoint in endpoints
    {
      let semaphore = Arc::clone( &semaphore );
      let transport = Arc::clone( &self.transport );
      let config = self.config.clone();
      let endpoint = Arc::clone( endpoint );
      handles.push( tokio::spawn( async move
      {
        let _permit = semaphore.acquire().await.expect( "semaphore never closed" );
        let prober = HealthProber { transport, config };
        let transitioned = prober.probe_one( &endpoint ).await;
        ( endpoint.key(), transitioned )
      } ) );
    }

    let mut transitioned_keys = Vec::new();
    for handle in handles
    {
      if let Ok( ( key, transitioned ) ) = handle.await
      {
        if transitioned { transitioned_keys.push( key ); }
      }
    }
    transitioned_keys
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;
  use crate::{ config::EndpointConfig, transport::mock::{ MockTransport, Scripted } };
  use std::collections::HashMap;

  fn endpoint() -> Arc< Endpoint >
  {
    Arc::new( Endpoint::new( EndpointConfig
    {
      channel : "a".to_string(),
      name : "a1".to_string(),
      url : "https://example.invalid".to_string(),
      priority : 10,
      timeout : Duration::from_secs( 30 ),
      headers : HashMap::new(),
      cooldown : None,
      failover_enabled : true,
      supports_count_tokens : false,
      enabled : true,
      token : None,
      tokens : Vec::new(),
      api_key : None,
      api_keys : Vec::new(),
      cost_multiplier : 1.0,
      category_multipliers : crate::cost::CategoryMultipliers::default(),
    } ) )
  }

  #[ tokio::test ]
  async fn probe_one_success_marks_healthy()
  {
    let transport = Arc::new( MockTransport::new( vec![] ).with_probes( vec![ Scripted::Ok( bytes::Bytes::new(), Duration::from_millis( 5 ) ) ] ) );
    let prober = HealthProber::new( transport, HealthConfig::default() );
    let endpoint = endpoint();
    assert!( prober.probe_one( &endpoint ).await );
    assert!( endpoint.snapshot().healthy );
  }

  #[ tokio::test ]
  async fn probe_one_failure_marks_unhealthy_and_increments_failures()
  {
    let transport = Arc::new( MockTransport::new( vec![] ).with_probes( vec![ Scripted::Err( ErrorKind::Network ) ] ) );
    let prober = HealthProber::new( transport, HealthConfig::default() );
    let endpoint = endpoint();
    assert!( !prober.probe_one( &endpoint ).await );
    let snap = endpoint.snapshot();
    assert!( !snap.healthy );
    assert_eq!( snap.consecutive_failures, 1 );
  }

  #[ tokio::test ]
  async fn probe_all_reports_transitions()
  {
    let transport = Arc::new( MockTransport::new( vec![] ).with_probes( vec![ Scripted::Ok( bytes::Bytes::new(), Duration::from_millis( 1 ) ) ] ) );
    let prober = HealthProber::new( transport, HealthConfig::default() );
    let endpoints = vec![ endpoint(), endpoint() ];
    let transitioned = prober.probe_all( &endpoints ).await;
    assert_eq!( transitioned.len(), 2 );
  }
}
