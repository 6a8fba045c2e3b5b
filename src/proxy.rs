//! The facade wiring every subsystem into one request path.
//!
//! Grounded on `api_claude::client::implementation::Client`'s role as the
//! single owned handle wrapping a `reqwest::Client`, generalized here to
//! own the whole proxy core rather than one upstream connection: the
//! endpoint/channel inventory, health prober, retry/failover policy,
//! suspension queue, hot pool, and archive batcher all live behind this
//! one struct.

use std::{ sync::Arc, time::{ Duration, Instant } };
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
  active_request::{ ActiveRequest, RequestStatus },
  archive::{ ArchiveBatcher, OverflowCounter },
  channel_manager::ChannelManager,
  config::ProxyConfig,
  cost::CostEngine,
  endpoint_manager::EndpointManager,
  error::{ ErrorKind, ProxyError, ProxyResult },
  failover::{ FailoverOrchestrator, Outcome as FailoverOutcome },
  health::HealthProber,
  hotpool::HotPool,
  logging::{ log_channel_activated, RequestContext },
  retry::{ Decision, RetryPolicy },
  store::Store,
  stream_parser::{ StreamEvent, StreamParser },
  suspension::SuspensionQueue,
  transport::{ OutboundRequest, Transport },
};

/// The result of one fully-resolved (non-streaming) proxied request.
#[ derive( Debug, Clone ) ]
pub struct ProxyResponse
{
  /// The endpoint the response actually came from.
  pub endpoint_key : String,
  /// Raw response body.
  pub body : Bytes,
  /// Observed latency of the winning attempt.
  pub latency : Duration,
}

/// Owns every proxy subsystem and drives the accept → route → retry →
/// failover → archive pipeline.
pub struct ProxyCore< T >
{
  /// Endpoint inventory and credential resolution.
  pub endpoints : Arc< EndpointManager >,
  /// Channel inventory and activation state machine.
  pub channels : Arc< ChannelManager >,
  /// Background health prober.
  pub health : Arc< HealthProber< T > >,
  /// Retry backoff/decision policy.
  pub retry : RetryPolicy,
  /// Cross-channel failover orchestration.
  pub failover : FailoverOrchestrator,
  /// Suspended-request queue.
  pub suspension : Arc< SuspensionQueue >,
  /// In-flight/recently-finished request pool.
  pub hotpool : Arc< HotPool >,
  /// Durable store.
  pub store : Arc< Store >,
  transport : Arc< T >,
  archive_tx : mpsc::Sender< ActiveRequest >,
  archive_overflow : Arc< OverflowCounter >,
  config : ProxyConfig,
}

impl< T > std::fmt::Debug for ProxyCore< T >
{
  fn fmt( &self, f : &mut std::fmt::Formatter< '_ > ) -> std::fmt::Result
  {
    f.debug_struct( "ProxyCore" )
      .field( "endpoint_count", &self.endpoints.all().len() )
      .field( "channel_count", &self.channels.all().len() )
      .finish_non_exhaustive()
  }
}

impl< T : Transport + 'static > ProxyCore< T >
{
  /// Build a proxy core from `config`, connecting to the durable store
  /// and populating the endpoint/channel inventory.
  ///
  /// # Errors
  ///
  /// Propagates `Store::connect` failures and any `EndpointManager::add`
  /// rejection (duplicate identities in config).
  pub async fn new( config : ProxyConfig, transport : Arc< T > ) -> ProxyResult< Self >
  {
    let store = Arc::new( Store::connect( &config.usage_tracking.database ).await? );
    let pricing = store.load_pricing().await?;
    let cost_engine = Arc::new( CostEngine::new( pricing ) );

    let endpoints = Arc::new( EndpointManager::new() );
    for endpoint_config in &config.endpoints
    {
      endpoints.add( endpoint_config.clone() )?;
    }

    let channels = Arc::new( ChannelManager::new( config.strategy.r#type ) );
    channels.rebuild( &endpoints.all() );
    channels.update_active( Instant::now() );

    let health = Arc::new( HealthProber::new( Arc::clone( &transport ), config.health.clone() ) );

    let suspension_capacity = config.suspension_capacity();
    let suspension = Arc::new( SuspensionQueue::new( config.request_suspend.clone(), suspension_capacity ) );

    let ( archive_tx, archive_rx ) = mpsc::channel( config.usage_tracking.buffer_size );
    let hotpool = Arc::new( HotPool::new( archive_tx.clone(), config.usage_tracking.max_age ) );
    let archive_overflow = Arc::new( OverflowCounter::default() );
    let batcher = ArchiveBatcher::new(
      Arc::clone( &store ),
      Arc::clone( &cost_engine ),
      Arc::clone( &endpoints ),
      config.usage_tracking.batch_size,
      config.usage_tracking.flush_interval,
      config.usage_tracking.max_retry,
      Arc::clone( &archive_overflow ),
    );
    tokio::spawn( async move { batcher.run( archive_rx ).await; } );

    Ok( Self
    {
      endpoints,
      channels,
      health,
      retry : RetryPolicy::new( config.retry.clone() ),
      failover : FailoverOrchestrator::new( config.failover.clone() ),
      suspension,
      hotpool,
      store,
      transport,
      archive_tx,
      archive_overflow,
      config,
    } )
  }

  /// Spawn the background health-probe loop at `health.check_interval`.
  pub fn start_health_loop( self : &Arc< Self > ) -> tokio::task::JoinHandle< () >
  {
    let core = Arc::clone( self );
    tokio::spawn( async move
    {
      let mut ticker = tokio::time::interval( core.config.health.check_interval );
      loop
      {
        ticker.tick().await;
        let endpoints = core.endpoints.all();
        let transitioned = core.health.probe_all( &endpoints ).await;
        if !transitioned.is_empty()
        {
          core.channels.rebuild( &core.endpoints.all() );
          let before = core.channels.active().map( | c | c.key.clone() );
          core.channels.update_active( Instant::now() );
          let after = core.channels.active().map( | c | c.key.clone() );
          if before != after
          {
            log_channel_activated( before.as_deref(), after.as_deref().unwrap_or( "<none>" ) );
          }
        }
      }
    } )
  }

  /// Spawn the background hot-pool archival sweep.
  pub fn start_hotpool_sweeper( self : &Arc< Self > ) -> tokio::task::JoinHandle< () >
  {
    let hotpool = Arc::clone( &self.hotpool );
    tokio::spawn( async move { hotpool.run_background_sweeper( Duration::from_secs( 1 ) ).await; } )
  }

  /// Number of requests dropped because the archive channel was full.
  #[ must_use ]
  pub fn archive_overflow_count( &self ) -> u64
  {
    self.archive_overflow.count()
  }

  /// Resolve the active channel's best candidate endpoint, excluding
  /// `exclude` (already-tried endpoints in this request).
  fn next_candidate( &self, exclude : &[ String ] ) -> Option< Arc< crate::endpoint::Endpoint > >
  {
    let channel = self.channels.active()?;
    channel.members.iter()
      .filter( | ep | !exclude.contains( &ep.key() ) && ep.snapshot().is_selectable() )
      .min_by_key( | ep | ep.snapshot().priority )
      .cloned()
  }

  /// Whether failover is even worth attempting: is there any endpoint
  /// anywhere in the inventory (not just the active channel) still
  /// eligible for failover, excluding `exclude`? The active channel's own
  /// member list is too narrow a check here, since a whole-channel
  /// exhaustion is exactly the case that should hand off to another
  /// channel instead of failing outright.
  fn any_failover_candidate_elsewhere( &self, exclude : &[ String ] ) -> bool
  {
    self.endpoints.all().iter().any( | ep |
      !exclude.contains( &ep.key() ) && ep.snapshot().is_failover_candidate()
    )
  }

  /// Send one non-streaming request body to the currently-active channel,
  /// following the retry/failover/suspension pipeline.
  ///
  /// # Errors
  ///
  /// `ProxyError::NoHealthyEndpoints` if nothing is ever available and
  /// suspension is disabled or exhausted; `ProxyError::Upstream` if every
  /// candidate fails without a retryable/switchable path remaining.
  pub async fn send_request( &self, request_id : &str, body : Bytes ) -> ProxyResult< ProxyResponse >
  {
    let context = RequestContext::new( request_id, false );
    let _span = context.span().entered();

    let mut tried = Vec::new();
    let mut attempt_on_endpoint = 0_u32;
    let mut active_request = None::< ActiveRequest >;

    loop
    {
      let Some( endpoint ) = self.next_candidate( &tried ) else
      {
        if let Some( outcome ) = self.suspension.wait_for_recovery( &self.channels ).await
        {
          match outcome
          {
            crate::error::SuspensionOutcome::Success =>
            {
              tried.clear();
              attempt_on_endpoint = 0;
              continue;
            }
            other => return Err( ProxyError::Suspension( other ) ),
          }
        }
        return Err( ProxyError::NoHealthyEndpoints );
      };

      let channel_key = endpoint.snapshot().channel_key.clone();
      let endpoint_key = endpoint.key();
      if active_request.is_none()
      {
        active_request = Some( ActiveRequest::new( request_id, channel_key.clone(), endpoint_key.clone(), false ) );
      }

      attempt_on_endpoint += 1;
      let authorization = self.endpoints.resolve_credential( &endpoint_key )?;
      let snapshot = endpoint.snapshot();
      let outbound = OutboundRequest
      {
        url : snapshot.url.clone(),
        body : body.clone(),
        authorization,
        headers : Vec::new(),
        timeout : snapshot.timeout,
        streaming : false,
      };

      match self.transport.send( outbound ).await
      {
        Ok( response ) =>
        {
          endpoint.record_probe( true, response.latency );
          if let Some( mut request ) = active_request.take()
          {
            request.finish( RequestStatus::Completed, None );
            self.archive_request( request );
          }
          return Ok( ProxyResponse { endpoint_key, body : response.body, latency : response.latency } );
        }
        Err( kind ) =>
        {
          endpoint.record_request_failure();
          let another_available = self.any_failover_candidate_elsewhere( &tried );
          match self.retry.decide( kind, attempt_on_endpoint, another_available, self.config.request_suspend.enabled )
          {
            Decision::Retry( delay ) =>
            {
              tokio::time::sleep( delay ).await;
              continue;
            }
            Decision::Switch =>
            {
              tried.push( endpoint_key.clone() );
              attempt_on_endpoint = 0;
              let failed = vec![ endpoint ];
              match self.failover.handle_failure( &self.channels, &channel_key, &failed )
              {
                FailoverOutcome::NoneAvailable => {}
                _ => { tried.clear(); }
              }
              continue;
            }
            Decision::Suspend | Decision::Fail =>
            {
              if let Some( mut request ) = active_request.take()
              {
                if kind == ErrorKind::ClientCancel
                {
                  request.finish_cancelled( kind.failure_reason() );
                }
                else
                {
                  let status = if kind.may_be_billed() { RequestStatus::Truncated } else { RequestStatus::Failed };
                  request.finish( status, Some( kind.failure_reason().to_string() ) );
                }
                self.archive_request( request );
              }
              return Err( ProxyError::Upstream { kind, detail : endpoint_key } );
            }
          }
        }
      }
    }
  }

  /// Parse a streamed response body incrementally, merging usage into
  /// `request` as SSE events arrive. Returns the final
  /// `StreamParser` so the caller can inspect completeness.
  #[ must_use ]
  pub fn new_stream_parser( &self ) -> StreamParser
  {
    StreamParser::new()
  }

  /// Feed one chunk of a streaming response through `parser`, merging
  /// any usage events into `request`'s running total.
  pub fn observe_stream_chunk( &self, parser : &mut StreamParser, request : &mut ActiveRequest, chunk : &[ u8 ] ) -> Vec< StreamEvent >
  {
    let events = parser.push_chunk( chunk );
    request.record_usage( parser.usage() );
    events
  }

  /// Finalize a streamed request once the upstream body ends, archiving
  /// it per the stream's completeness classification: `Completed` for a
  /// clean finish, `Truncated` (with whatever usage was observed and a
  /// `failure_reason` naming which completeness rule fired) otherwise.
  pub fn finish_stream( &self, parser : &mut StreamParser, mut request : ActiveRequest )
  {
    if let Some( trailing ) = parser.flush_pending()
    {
      if let StreamEvent::MessageDelta { usage, .. } | StreamEvent::MessageStart { usage, .. } = trailing
      {
        request.record_usage( usage );
      }
    }
    request.record_usage( parser.usage() );
    let completeness = parser.completeness();
    match completeness.failure_reason()
    {
      None => request.finish( RequestStatus::Completed, None ),
      Some( reason ) => request.finish( RequestStatus::Truncated, Some( reason.to_string() ) ),
    }
    self.archive_request( request );
  }

  fn archive_request( &self, request : ActiveRequest )
  {
    match self.archive_tx.try_send( request )
    {
      Ok( () ) => {}
      Err( _ ) => self.archive_overflow.record(),
    }
  }
}
