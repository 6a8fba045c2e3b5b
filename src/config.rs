//! Typed shapes for the recognized external configuration surface.
//! Parsing the YAML file itself, watching it for changes, and
//! hot-swapping a running `ProxyCore` are out of this crate's scope — an
//! external loader is expected to deserialize into these types and hand
//! the result to `ProxyCore::new`.

use std::{ collections::HashMap, time::Duration };
use serde::{ Deserialize, Serialize };

use crate::error::{ ProxyError, ProxyResult };

/// Endpoint candidate ordering strategy.
#[ derive( Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize ) ]
#[ serde( rename_all = "snake_case" ) ]
pub enum Strategy
{
  /// Ascending static priority.
  Priority,
  /// Ascending last-probed latency.
  Fastest,
}

impl Default for Strategy
{
  fn default() -> Self { Strategy::Priority }
}

/// `strategy.*` config block.
#[ derive( Debug, Clone, Serialize, Deserialize ) ]
#[ serde( default ) ]
pub struct StrategyConfig
{
  /// Candidate ordering strategy.
  pub r#type : Strategy,
  /// Enables an auxiliary pre-request probe with caching.
  pub fast_test_enabled : bool,
  /// Cache lifetime for a fast-test result.
  pub fast_test_ttl : Duration,
  /// Timeout for a single fast-test probe.
  pub fast_test_timeout : Duration,
  /// Path appended to the endpoint base URL for the fast-test probe.
  pub fast_test_path : String,
}

impl Default for StrategyConfig
{
  fn default() -> Self
  {
    Self
    {
      r#type : Strategy::Priority,
      fast_test_enabled : false,
      fast_test_ttl : Duration::from_secs( 30 ),
      fast_test_timeout : Duration::from_secs( 2 ),
      fast_test_path : "/v1/models".to_string(),
    }
  }
}

/// `retry.*` config block.
#[ derive( Debug, Clone, Serialize, Deserialize ) ]
#[ serde( default ) ]
pub struct RetryConfig
{
  /// Maximum local attempts against one endpoint before switching.
  pub max_attempts : u32,
  /// Base delay for exponential backoff.
  pub base_delay : Duration,
  /// Delay ceiling.
  pub max_delay : Duration,
  /// Exponential backoff multiplier.
  pub multiplier : f64,
}

impl Default for RetryConfig
{
  fn default() -> Self
  {
    Self
    {
      max_attempts : 3,
      base_delay : Duration::from_millis( 500 ),
      max_delay : Duration::from_secs( 30 ),
      multiplier : 2.0,
    }
  }
}

/// `health.*` config block.
#[ derive( Debug, Clone, Serialize, Deserialize ) ]
#[ serde( default ) ]
pub struct HealthConfig
{
  /// Interval between background probe sweeps.
  pub check_interval : Duration,
  /// Per-probe timeout.
  pub timeout : Duration,
  /// Path appended to the endpoint base URL for health probes.
  pub health_path : String,
}

impl Default for HealthConfig
{
  fn default() -> Self
  {
    Self
    {
      check_interval : Duration::from_secs( 30 ),
      timeout : Duration::from_secs( 5 ),
      health_path : "/health".to_string(),
    }
  }
}

/// `failover.*` config block (legacy `group.{cooldown,
/// auto_switch_between_groups}` is mapped into this by the external
/// loader before reaching this crate).
#[ derive( Debug, Clone, Serialize, Deserialize ) ]
#[ serde( default ) ]
pub struct FailoverConfig
{
  /// Enables cross-channel failover / auto activation.
  pub enabled : bool,
  /// Default per-endpoint/per-channel cooldown when none is overridden.
  pub default_cooldown : Duration,
}

impl Default for FailoverConfig
{
  fn default() -> Self
  {
    Self { enabled : true, default_cooldown : Duration::from_secs( 60 ) }
  }
}

/// `request_suspend.*` config block.
#[ derive( Debug, Clone, Serialize, Deserialize ) ]
#[ serde( default ) ]
pub struct RequestSuspendConfig
{
  /// Enables suspension instead of terminal failure during an outage.
  pub enabled : bool,
  /// Maximum time a request may wait suspended.
  pub timeout : Duration,
  /// Hard bound on concurrently suspended requests.
  pub max_suspended_requests : usize,
  /// Whether a retryable-style SSE error event is emitted to clients that
  /// already received bytes on an EOF-mid-stream failure.
  pub eof_retry_hint : bool,
}

impl Default for RequestSuspendConfig
{
  fn default() -> Self
  {
    Self
    {
      enabled : false,
      timeout : Duration::from_secs( 300 ),
      max_suspended_requests : 100,
      eof_retry_hint : true,
    }
  }
}

/// Hard cap on `max_suspended_requests`, regardless of configuration.
pub const SUSPENSION_HARD_CAP : usize = 10_000;

/// `usage_tracking.*` config block.
#[ derive( Debug, Clone, Serialize, Deserialize ) ]
#[ serde( default ) ]
pub struct UsageTrackingConfig
{
  /// Enables the hot-pool / archive-batcher pipeline.
  pub enabled : bool,
  /// Durable store connection string (e.g. `sqlite://usage.db`).
  pub database : String,
  /// Hot-pool capacity.
  pub buffer_size : usize,
  /// Number of records per archive batch write.
  pub batch_size : usize,
  /// Maximum time between archive batch flushes.
  pub flush_interval : Duration,
  /// Maximum retry attempts for a failed batch write.
  pub max_retry : u32,
  /// Retention window for `usage_summary` rollups.
  pub retention_days : u32,
  /// Interval between hot-pool leaked-record sweeps.
  pub cleanup_interval : Duration,
  /// Maximum time a hot-pool record may stay in-flight before the sweep
  /// evicts it as `Timeout` (a crashed or leaked caller never called
  /// back to finish it).
  pub max_age : Duration,
}

impl Default for UsageTrackingConfig
{
  fn default() -> Self
  {
    Self
    {
      enabled : true,
      database : "sqlite://relay.db".to_string(),
      buffer_size : 10_000,
      batch_size : 50,
      flush_interval : Duration::from_secs( 5 ),
      max_retry : 5,
      retention_days : 90,
      cleanup_interval : Duration::from_secs( 60 ),
      max_age : Duration::from_secs( 3600 ),
    }
  }
}

/// `endpoints_storage.type`.
#[ derive( Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize ) ]
#[ serde( rename_all = "snake_case" ) ]
pub enum EndpointsStorage
{
  /// Endpoints come from the static YAML config; `is_active` is not
  /// preserved across `ChannelManager` rebuilds.
  Yaml,
  /// Endpoints are owned by an external store; `is_active` is preserved
  /// across rebuilds and all endpoints are probed regardless of
  /// `enabled`.
  External,
}

impl Default for EndpointsStorage
{
  fn default() -> Self { EndpointsStorage::Yaml }
}

/// Per-endpoint config block.
#[ derive( Debug, Clone, Serialize, Deserialize ) ]
pub struct EndpointConfig
{
  /// Channel label; absent (empty string) means legacy one-per-endpoint
  /// mode where the channel key falls back to `name`.
  #[ serde( default ) ]
  pub channel : String,
  /// Endpoint name, unique within its channel.
  pub name : String,
  /// Base URL.
  pub url : String,
  /// Smaller is higher priority.
  #[ serde( default = "default_priority" ) ]
  pub priority : i64,
  /// Per-request timeout.
  #[ serde( default = "default_timeout" ) ]
  pub timeout : Duration,
  /// Extra headers forwarded on every request.
  #[ serde( default ) ]
  pub headers : HashMap< String, String >,
  /// Per-endpoint cooldown override; `None` uses `failover.default_cooldown`.
  #[ serde( default ) ]
  pub cooldown : Option< Duration >,
  /// Whether this endpoint participates in cross-channel failover.
  #[ serde( default = "default_true" ) ]
  pub failover_enabled : bool,
  /// Whether the upstream supports a dedicated count-tokens endpoint.
  #[ serde( default ) ]
  pub supports_count_tokens : bool,
  /// Whether this endpoint is eligible for proxying at all.
  #[ serde( default = "default_true" ) ]
  pub enabled : bool,
  /// Single token, if the endpoint has only one.
  #[ serde( default ) ]
  pub token : Option< String >,
  /// Multiple rotation tokens, if configured.
  #[ serde( default ) ]
  pub tokens : Vec< String >,
  /// Single api-key, if the endpoint has only one.
  #[ serde( rename = "api-key", default ) ]
  pub api_key : Option< String >,
  /// Multiple rotation api-keys, if configured.
  #[ serde( rename = "api-keys", default ) ]
  pub api_keys : Vec< String >,
  /// Single overall cost-billing multiplier. A positive value overrides
  /// `category_multipliers` entirely; defaults to `1.0` (a no-op
  /// overall multiplier). Set to `0.0` to defer to `category_multipliers`
  /// instead.
  #[ serde( default = "default_cost_multiplier" ) ]
  pub cost_multiplier : f64,
  /// Per-category cost-billing multipliers, used only when
  /// `cost_multiplier` is `0.0`.
  #[ serde( default ) ]
  pub category_multipliers : crate::cost::CategoryMultipliers,
}

fn default_priority() -> i64 { 100 }
fn default_timeout() -> Duration { Duration::from_secs( 60 ) }
fn default_true() -> bool { true }
fn default_cost_multiplier() -> f64 { 1.0 }

impl EndpointConfig
{
  /// The channel key this endpoint buckets into: its `channel` label, or
  /// (legacy mode) its own `name`.
  #[ must_use ]
  pub fn channel_key( &self ) -> &str
  {
    if self.channel.is_empty() { &self.name } else { &self.channel }
  }

  /// The `channel::name` identity string.
  #[ must_use ]
  pub fn identity( &self ) -> String
  {
    format!( "{}::{}", self.channel_key(), self.name )
  }
}

/// Start-up override forcing one named endpoint to priority 1. Every
/// other endpoint with priority <= 1 is bumped by 2, to keep priorities
/// a strict linear order without collisions.
#[ derive( Debug, Clone ) ]
pub struct PrimaryEndpointOverride
{
  /// Name or `channel::name` of the endpoint to force to priority 1.
  pub endpoint : String,
}

/// Top-level recognized configuration surface.
#[ derive( Debug, Clone, Serialize, Deserialize ) ]
#[ serde( default ) ]
pub struct ProxyConfig
{
  /// Candidate selection strategy.
  pub strategy : StrategyConfig,
  /// Retry backoff policy.
  pub retry : RetryConfig,
  /// Health probe cadence.
  pub health : HealthConfig,
  /// Cross-channel failover policy.
  pub failover : FailoverConfig,
  /// Suspension policy during outages.
  pub request_suspend : RequestSuspendConfig,
  /// Telemetry / archive pipeline policy.
  pub usage_tracking : UsageTrackingConfig,
  /// Endpoint inventory storage mode.
  pub endpoints_storage : EndpointsStorage,
  /// Statically configured endpoints (ignored in `External` storage mode,
  /// where the store is authoritative).
  pub endpoints : Vec< EndpointConfig >,
}

impl Default for ProxyConfig
{
  fn default() -> Self
  {
    Self
    {
      strategy : StrategyConfig::default(),
      retry : RetryConfig::default(),
      health : HealthConfig::default(),
      failover : FailoverConfig::default(),
      request_suspend : RequestSuspendConfig::default(),
      usage_tracking : UsageTrackingConfig::default(),
      endpoints_storage : EndpointsStorage::default(),
      endpoints : Vec::new(),
    }
  }
}

impl ProxyConfig
{
  /// Apply the start-up primary-endpoint override.
  ///
  /// # Errors
  ///
  /// Returns `ProxyError::NotFound` if no endpoint matches `name` or
  /// `channel::name`, listing the known identities in the message.
  pub fn apply_primary_override( &mut self, over : &PrimaryEndpointOverride ) -> ProxyResult< () >
  {
    let position = self.endpoints.iter().position( | ep |
      ep.name == over.endpoint || ep.identity() == over.endpoint
    );

    let Some( position ) = position else
    {
      let known : Vec< String > = self.endpoints.iter().map( EndpointConfig::identity ).collect();
      return Err( ProxyError::NotFound(
        format!( "primary endpoint '{}' not found; known endpoints: [{}]", over.endpoint, known.join( ", " ) )
      ) );
    };

    for ( index, ep ) in self.endpoints.iter_mut().enumerate()
    {
      if index == position
      {
        ep.priority = 1;
      }
      else if ep.priority <= 1
      {
        ep.priority += 2;
      }
    }

    Ok( () )
  }

  /// Effective suspension bound, clamped to `SUSPENSION_HARD_CAP`.
  #[ must_use ]
  pub fn suspension_capacity( &self ) -> usize
  {
    self.request_suspend.max_suspended_requests.min( SUSPENSION_HARD_CAP )
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  fn endpoint( name : &str, channel : &str, priority : i64 ) -> EndpointConfig
  {
    EndpointConfig
    {
      channel : channel.to_string(),
      name : name.to_string(),
      url : "https://example.invalid".to_string(),
      priority,
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
    }
  }

  #[ test ]
  fn primary_override_forces_priority_one_and_bumps_collisions()
  {
    let mut config = ProxyConfig::default();
    config.endpoints.push( endpoint( "a1", "a", 0 ) );
    config.endpoints.push( endpoint( "a2", "a", 1 ) );
    config.endpoints.push( endpoint( "b1", "b", 5 ) );

    config.apply_primary_override( &PrimaryEndpointOverride { endpoint : "a2".to_string() } ).unwrap();

    assert_eq!( config.endpoints[ 0 ].priority, 2 ); // bumped from 0
    assert_eq!( config.endpoints[ 1 ].priority, 1 ); // forced primary
    assert_eq!( config.endpoints[ 2 ].priority, 5 ); // untouched, was > 1
  }

  #[ test ]
  fn primary_override_missing_endpoint_lists_known_names()
  {
    let mut config = ProxyConfig::default();
    config.endpoints.push( endpoint( "a1", "a", 0 ) );

    let err = config.apply_primary_override( &PrimaryEndpointOverride { endpoint : "missing".to_string() } )
      .unwrap_err();
    assert!( err.to_string().contains( "a::a1" ) );
  }

  #[ test ]
  fn suspension_capacity_is_clamped_to_hard_cap()
  {
    let mut config = ProxyConfig::default();
    config.request_suspend.max_suspended_requests = 999_999;
    assert_eq!( config.suspension_capacity(), SUSPENSION_HARD_CAP );
  }
}
