//! End-to-end scenarios driving `ProxyCore` against `MockTransport`,
//! exercising the full accept → route → retry → failover → archive
//! pipeline without any real sockets or a pre-existing database.

#![ cfg( feature = "test-support" ) ]

use std::{ collections::HashMap, sync::Arc, time::Duration };

use bytes::Bytes;

use relay_core::{
  config::{ EndpointConfig, FailoverConfig, ProxyConfig, RequestSuspendConfig, RetryConfig, Strategy, UsageTrackingConfig },
  proxy::ProxyCore,
  store::Store,
  transport::mock::{ MockTransport, Scripted },
};

fn endpoint_config( channel : &str, name : &str, priority : i64 ) -> EndpointConfig
{
  EndpointConfig
  {
    channel : channel.to_string(),
    name : name.to_string(),
    url : "https://example.invalid".to_string(),
    priority,
    timeout : Duration::from_secs( 5 ),
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
    category_multipliers : relay_core::cost::CategoryMultipliers::default(),
  }
}

fn database_url( dir : &tempfile::TempDir, name : &str ) -> String
{
  format!( "sqlite://{}?mode=rwc", dir.path().join( name ).display() )
}

fn config( endpoints : Vec< EndpointConfig >, database : String ) -> ProxyConfig
{
  let mut config = ProxyConfig
  {
    retry : RetryConfig { max_attempts : 3, base_delay : Duration::from_millis( 1 ), max_delay : Duration::from_millis( 5 ), multiplier : 2.0 },
    failover : FailoverConfig { enabled : true, default_cooldown : Duration::from_secs( 60 ) },
    usage_tracking : UsageTrackingConfig
    {
      enabled : true,
      database,
      buffer_size : 100,
      batch_size : 1,
      flush_interval : Duration::from_millis( 20 ),
      max_retry : 1,
      retention_days : 90,
      cleanup_interval : Duration::from_secs( 60 ),
      max_age : Duration::from_secs( 3600 ),
    },
    endpoints,
    ..ProxyConfig::default()
  };
  config.strategy.r#type = Strategy::Priority;
  config
}

#[ tokio::test ]
async fn priority_within_channel_picks_lowest_priority()
{
  let dir = tempfile::tempdir().unwrap();
  let cfg = config(
    vec![ endpoint_config( "a", "hi", 20 ), endpoint_config( "a", "lo", 5 ) ],
    database_url( &dir, "priority.db" ),
  );

  let transport = Arc::new(
    MockTransport::new( vec![ Scripted::Ok( Bytes::from_static( b"ok" ), Duration::from_millis( 1 ) ) ] )
      .with_probes( vec![ Scripted::Ok( Bytes::new(), Duration::from_millis( 1 ) ) ] ),
  );
  let core = ProxyCore::new( cfg, transport ).await.unwrap();
  core.health.probe_all( &core.endpoints.all() ).await;
  core.channels.rebuild( &core.endpoints.all() );
  core.channels.update_active( std::time::Instant::now() );

  let response = core.send_request( "req-1", Bytes::from_static( b"{}" ) ).await.unwrap();
  assert_eq!( response.endpoint_key, "a::lo" );
}

#[ tokio::test ]
async fn channel_failover_on_exhaustion()
{
  let dir = tempfile::tempdir().unwrap();
  let cfg = config(
    vec![ endpoint_config( "a", "x", 1 ), endpoint_config( "b", "y", 2 ) ],
    database_url( &dir, "failover.db" ),
  );

  let transport = Arc::new(
    MockTransport::new( vec![
      Scripted::Err( relay_core::ErrorKind::Network ),
      Scripted::Err( relay_core::ErrorKind::Network ),
      Scripted::Err( relay_core::ErrorKind::Network ),
      Scripted::Ok( Bytes::from_static( b"ok" ), Duration::from_millis( 1 ) ),
    ] )
    .with_probes( vec![ Scripted::Ok( Bytes::new(), Duration::from_millis( 1 ) ) ] ),
  );
  let core = ProxyCore::new( cfg, transport ).await.unwrap();
  core.health.probe_all( &core.endpoints.all() ).await;
  core.channels.rebuild( &core.endpoints.all() );
  core.channels.update_active( std::time::Instant::now() );
  assert_eq!( core.channels.active().unwrap().key, "a" );

  let response = core.send_request( "req-1", Bytes::from_static( b"{}" ) ).await.unwrap();
  assert_eq!( response.endpoint_key, "b::y" );
}

#[ tokio::test ]
async fn fastest_strategy_selects_lowest_latency_channel()
{
  let dir = tempfile::tempdir().unwrap();
  let mut cfg = config(
    vec![ endpoint_config( "a", "a1", 10 ), endpoint_config( "b", "b1", 10 ) ],
    database_url( &dir, "fastest.db" ),
  );
  cfg.strategy.r#type = Strategy::Fastest;

  let transport = Arc::new( MockTransport::new( vec![ Scripted::Ok( Bytes::from_static( b"ok" ), Duration::from_millis( 1 ) ) ] ) );
  let core = ProxyCore::new( cfg, transport ).await.unwrap();

  core.endpoints.get( "a::a1" ).unwrap().record_probe( true, Duration::from_millis( 50 ) );
  core.endpoints.get( "b::b1" ).unwrap().record_probe( true, Duration::from_millis( 5 ) );
  core.channels.rebuild( &core.endpoints.all() );
  core.channels.update_active( std::time::Instant::now() );
  assert_eq!( core.channels.active().unwrap().key, "b" );

  let response = core.send_request( "req-1", Bytes::from_static( b"{}" ) ).await.unwrap();
  assert_eq!( response.endpoint_key, "b::b1" );
}

#[ tokio::test ]
async fn per_request_token_rotation_is_operator_driven_not_automatic()
{
  let dir = tempfile::tempdir().unwrap();
  let mut endpoint = endpoint_config( "a", "a1", 10 );
  endpoint.tokens = vec![ "t0".to_string(), "t1".to_string() ];
  let cfg = config( vec![ endpoint ], database_url( &dir, "rotation.db" ) );

  let transport = Arc::new(
    MockTransport::new( vec![
      Scripted::Ok( Bytes::from_static( b"first" ), Duration::from_millis( 1 ) ),
      Scripted::Ok( Bytes::from_static( b"second" ), Duration::from_millis( 1 ) ),
    ] )
    .with_probes( vec![ Scripted::Ok( Bytes::new(), Duration::from_millis( 1 ) ) ] ),
  );
  let core = ProxyCore::new( cfg, transport ).await.unwrap();
  core.health.probe_all( &core.endpoints.all() ).await;
  core.channels.rebuild( &core.endpoints.all() );
  core.channels.update_active( std::time::Instant::now() );

  assert_eq!( core.endpoints.resolve_credential( "a::a1" ).unwrap().unwrap().as_str(), "t0" );
  let first = core.send_request( "req-1", Bytes::from_static( b"{}" ) ).await.unwrap();
  assert_eq!( first.body, Bytes::from_static( b"first" ) );
  assert_eq!( core.endpoints.resolve_credential( "a::a1" ).unwrap().unwrap().as_str(), "t0" );

  core.endpoints.switch_token( "a::a1", 1 ).unwrap();
  assert_eq!( core.endpoints.resolve_credential( "a::a1" ).unwrap().unwrap().as_str(), "t1" );
  let second = core.send_request( "req-2", Bytes::from_static( b"{}" ) ).await.unwrap();
  assert_eq!( second.body, Bytes::from_static( b"second" ) );
}

#[ tokio::test ]
async fn truncated_stream_is_archived_with_partial_usage_and_cost()
{
  let dir = tempfile::tempdir().unwrap();
  let database = database_url( &dir, "truncation.db" );

  {
    let setup = Store::connect( &database ).await.unwrap();
    setup.upsert_pricing( "claude-x", relay_core::cost::ModelPricing
    {
      input_per_million : 3.0,
      output_per_million : 15.0,
      cache_write_5m_per_million : 3.75,
      cache_creation_1h_per_million : 6.0,
      cache_read_per_million : 0.3,
    } ).await.unwrap();
  }

  let cfg = config( vec![ endpoint_config( "a", "a1", 10 ) ], database );
  let transport = Arc::new( MockTransport::new( vec![] ) );
  let core = ProxyCore::new( cfg, transport ).await.unwrap();

  let mut parser = core.new_stream_parser();
  let mut request = relay_core::active_request::ActiveRequest::new( "req-1", "a", "a::a1", true );

  let events = core.observe_stream_chunk(
    &mut parser,
    &mut request,
    b"event : message_start\ndata : {\"message\":{\"id\":\"m1\",\"model\":\"claude-x\",\"usage\":{\"input_tokens\":5}}}\n\n",
  );
  assert_eq!( events.len(), 1 );
  request.model = Some( "claude-x".to_string() );

  core.observe_stream_chunk(
    &mut parser,
    &mut request,
    b"event : message_delta\ndata : {\"usage\":{\"output_tokens\":3}}\n",
  );
  // No trailing blank line and no `message_stop`: the connection dropped
  // mid-stream, leaving the complete-but-unterminated event pending until
  // `finish_stream`'s `flush_pending` call recovers it.

  assert!( !parser.is_complete() );
  core.finish_stream( &mut parser, request );

  tokio::time::sleep( Duration::from_millis( 200 ) ).await;

  let rows = core.store.query_requests( "a", 10 ).await.unwrap();
  assert_eq!( rows.len(), 1 );
  let row = &rows[ 0 ];
  assert_eq!( row.request_id, "req-1" );
  assert_eq!( row.status, "Truncated" );
  assert_eq!( row.failure_reason.as_deref(), Some( "incomplete_stream" ) );
  assert_eq!( row.model.as_deref(), Some( "claude-x" ) );
  let cost = row.cost_usd.expect( "pricing was seeded before the core connected" );
  assert!( ( cost - ( 5.0 * 3.0 / 1_000_000.0 + 3.0 * 15.0 / 1_000_000.0 ) ).abs() < 1e-9 );
}

#[ tokio::test ]
async fn start_only_stream_is_archived_as_truncated_with_stream_truncated_reason()
{
  let dir = tempfile::tempdir().unwrap();
  let database = database_url( &dir, "start_only_truncation.db" );

  let cfg = config( vec![ endpoint_config( "a", "a1", 10 ) ], database );
  let transport = Arc::new( MockTransport::new( vec![] ) );
  let core = ProxyCore::new( cfg, transport ).await.unwrap();

  let mut parser = core.new_stream_parser();
  let mut request = relay_core::active_request::ActiveRequest::new( "req-1", "a", "a::a1", true );

  let events = core.observe_stream_chunk(
    &mut parser,
    &mut request,
    b"event : message_start\ndata : {\"message\":{\"id\":\"m1\",\"model\":\"claude-x\",\"usage\":{\"input_tokens\":5}}}\n\n",
  );
  assert_eq!( events.len(), 1 );
  request.model = Some( "claude-x".to_string() );

  // The connection drops right after `message_start`: no `message_delta`
  // usage and no `message_stop` ever arrive.
  assert!( !parser.is_complete() );
  core.finish_stream( &mut parser, request );

  tokio::time::sleep( Duration::from_millis( 200 ) ).await;

  let rows = core.store.query_requests( "a", 10 ).await.unwrap();
  assert_eq!( rows.len(), 1 );
  let row = &rows[ 0 ];
  assert_eq!( row.status, "Truncated" );
  assert_eq!( row.failure_reason.as_deref(), Some( "stream_truncated" ) );
}

#[ tokio::test ]
async fn suspended_request_resumes_once_a_channel_recovers()
{
  let dir = tempfile::tempdir().unwrap();
  let mut cfg = config( vec![ endpoint_config( "a", "a1", 10 ) ], database_url( &dir, "suspension.db" ) );
  cfg.request_suspend = RequestSuspendConfig { enabled : true, timeout : Duration::from_secs( 5 ), max_suspended_requests : 10, eof_retry_hint : true };

  let transport = Arc::new( MockTransport::new( vec![ Scripted::Ok( Bytes::from_static( b"ok" ), Duration::from_millis( 1 ) ) ] ) );
  let core = Arc::new( ProxyCore::new( cfg, transport ).await.unwrap() );
  assert!( core.channels.active().is_none(), "the only endpoint starts never-checked and unselectable" );

  let waiter = Arc::clone( &core );
  let handle = tokio::spawn( async move { waiter.send_request( "req-1", Bytes::from_static( b"{}" ) ).await } );

  tokio::time::sleep( Duration::from_millis( 30 ) ).await;
  core.endpoints.get( "a::a1" ).unwrap().record_probe( true, Duration::from_millis( 1 ) );
  core.channels.rebuild( &core.endpoints.all() );
  core.channels.update_active( std::time::Instant::now() );

  let response = handle.await.unwrap().unwrap();
  assert_eq!( response.endpoint_key, "a::a1" );
}
