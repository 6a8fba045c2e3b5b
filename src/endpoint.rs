//! A single upstream target and its mutable health/rotation status.
//!
//! Grounded on `api_claude::failover::FailoverEndpoint` (id/url/priority/
//! health/last_checked fields), generalized with the channel-aware
//! identity and cooldown bookkeeping this proxy core needs. Each endpoint
//! carries its own `RwLock` over `{config, status}` together, so a
//! config replace and a status mutation can never interleave torn.

use std::time::{ Duration, Instant };
use parking_lot::RwLock;

use crate::{ config::EndpointConfig, cooldown::Cooldown, cost::CategoryMultipliers };

/// Mutable runtime status of an endpoint.
#[ derive( Debug, Clone ) ]
pub struct EndpointStatus
{
  /// Whether the last probe (or never) found this endpoint healthy.
  pub healthy : bool,
  /// `true` until the first probe completes.
  pub never_checked : bool,
  /// When the endpoint was last probed.
  pub last_check_time : Option< Instant >,
  /// Latency of the last probe (or proxied request, when used to order
  /// the `fastest` strategy).
  pub last_response_time : Option< Duration >,
  /// Consecutive probe/request failures since the last success.
  pub consecutive_failures : u32,
  /// Per-endpoint cooldown state.
  pub cooldown : Cooldown,
}

impl Default for EndpointStatus
{
  fn default() -> Self
  {
    Self
    {
      healthy : false,
      never_checked : true,
      last_check_time : None,
      last_response_time : None,
      consecutive_failures : 0,
      cooldown : Cooldown::none(),
    }
  }
}

struct Inner
{
  config : EndpointConfig,
  status : EndpointStatus,
}

/// An upstream endpoint: immutable-ish config plus mutable health status,
/// both behind one lock, so a status mutation always holds the
/// endpoint's own lock.
pub struct Endpoint
{
  inner : RwLock< Inner >,
}

impl std::fmt::Debug for Endpoint
{
  fn fmt( &self, f : &mut std::fmt::Formatter< '_ > ) -> std::fmt::Result
  {
    let guard = self.inner.read();
    f.debug_struct( "Endpoint" )
      .field( "key", &guard.config.identity() )
      .field( "healthy", &guard.status.healthy )
      .finish_non_exhaustive()
  }
}

/// A point-in-time copy of an endpoint's config and status, safe to hold
/// without the endpoint's lock.
#[ derive( Debug, Clone ) ]
pub struct EndpointSnapshot
{
  /// `channel::name` identity.
  pub key : String,
  /// Bucketing channel key (`channel`, or `name` in legacy mode).
  pub channel_key : String,
  /// Bare endpoint name.
  pub name : String,
  /// Base URL.
  pub url : String,
  /// Static priority (smaller = higher).
  pub priority : i64,
  /// Per-request timeout.
  pub timeout : Duration,
  /// Whether this endpoint participates in cross-channel failover.
  pub failover_enabled : bool,
  /// Whether this endpoint is proxy-eligible at all.
  pub enabled : bool,
  /// Whether the upstream exposes a dedicated count-tokens endpoint.
  pub supports_count_tokens : bool,
  /// Status fields, copied out.
  pub healthy : bool,
  /// See `EndpointStatus::never_checked`.
  pub never_checked : bool,
  /// See `EndpointStatus::last_response_time`.
  pub last_response_time : Option< Duration >,
  /// See `EndpointStatus::consecutive_failures`.
  pub consecutive_failures : u32,
  /// Whether this endpoint is currently cooling down.
  pub cooling : bool,
  /// Cooldown reason, if cooling.
  pub cooldown_reason : Option< String >,
  /// Overall cost-billing multiplier; a positive value overrides
  /// `category_multipliers`.
  pub cost_multiplier : f64,
  /// Per-category cost-billing multipliers, used when `cost_multiplier`
  /// is `0.0`.
  pub category_multipliers : CategoryMultipliers,
}

impl EndpointSnapshot
{
  /// Whether this endpoint is a selectable candidate right now: healthy,
  /// not cooling, and participating in failover.
  #[ must_use ]
  pub fn is_selectable( &self ) -> bool
  {
    self.enabled && self.healthy && !self.cooling && self.failover_enabled
  }

  /// Whether this endpoint is usable as a *forced-activation* fallback:
  /// healthy or never checked, not cooling, failover-enabled.
  #[ must_use ]
  pub fn is_failover_candidate( &self ) -> bool
  {
    ( self.healthy || self.never_checked ) && !self.cooling && self.failover_enabled
  }
}

impl Endpoint
{
  /// Build a new endpoint in its default (unhealthy, never-checked)
  /// status.
  #[ must_use ]
  pub fn new( config : EndpointConfig ) -> Self
  {
    Self { inner : RwLock::new( Inner { config, status : EndpointStatus::default() } ) }
  }

  /// The `channel::name` identity, read under the endpoint's own lock.
  #[ must_use ]
  pub fn key( &self ) -> String
  {
    self.inner.read().config.identity()
  }

  /// Copy out a consistent snapshot of config + status.
  #[ must_use ]
  pub fn snapshot( &self ) -> EndpointSnapshot
  {
    let guard = self.inner.read();
    let now = Instant::now();
    EndpointSnapshot
    {
      key : guard.config.identity(),
      channel_key : guard.config.channel_key().to_string(),
      name : guard.config.name.clone(),
      url : guard.config.url.clone(),
      priority : guard.config.priority,
      timeout : guard.config.timeout,
      failover_enabled : guard.config.failover_enabled,
      enabled : guard.config.enabled,
      supports_count_tokens : guard.config.supports_count_tokens,
      healthy : guard.status.healthy,
      never_checked : guard.status.never_checked,
      last_response_time : guard.status.last_response_time,
      consecutive_failures : guard.status.consecutive_failures,
      cooling : guard.status.cooldown.is_active( now ),
      cooldown_reason : guard.status.cooldown.reason().map( str::to_string ),
      cost_multiplier : guard.config.cost_multiplier,
      category_multipliers : guard.config.category_multipliers,
    }
  }

  /// Replace the config in place, returning the previous identity so the
  /// caller (`EndpointManager::update`) can rename the `KeyStore` entry if
  /// it changed.
  pub fn replace_config( &self, config : EndpointConfig ) -> String
  {
    let mut guard = self.inner.write();
    let old_identity = guard.config.identity();
    guard.config = config;
    old_identity
  }

  /// Record the outcome of a health probe or proxied attempt. Returns
  /// `true` if this flipped the endpoint from unhealthy to healthy (the
  /// transition that should trigger a `ChannelManager` re-evaluation).
  pub fn record_probe( &self, healthy : bool, latency : Duration ) -> bool
  {
    let mut guard = self.inner.write();
    let was_healthy = guard.status.healthy;
    guard.status.healthy = healthy;
    guard.status.never_checked = false;
    guard.status.last_check_time = Some( Instant::now() );
    guard.status.last_response_time = Some( latency );
    if healthy { guard.status.consecutive_failures = 0; }
    else { guard.status.consecutive_failures += 1; }
    !was_healthy && healthy
  }

  /// Record a failed proxied *request* (as opposed to a dedicated health
  /// probe): marks the endpoint unhealthy and bumps the failure streak
  /// without touching `last_response_time`, since a failure carries no
  /// meaningful latency sample for the `fastest` strategy to compare.
  pub fn record_request_failure( &self )
  {
    let mut guard = self.inner.write();
    guard.status.healthy = false;
    guard.status.never_checked = false;
    guard.status.last_check_time = Some( Instant::now() );
    guard.status.consecutive_failures += 1;
  }

  /// Apply a cooldown with the given duration and reason.
  pub fn apply_cooldown( &self, duration : Duration, reason : impl Into< String > )
  {
    self.inner.write().status.cooldown.apply( duration, reason );
  }

  /// Clear the cooldown if it has expired as of `now`.
  pub fn clear_expired_cooldown( &self, now : Instant ) -> bool
  {
    self.inner.write().status.cooldown.clear_if_expired( now )
  }

  /// Current per-endpoint cooldown override, if any.
  #[ must_use ]
  pub fn cooldown_override( &self ) -> Option< Duration >
  {
    self.inner.read().config.cooldown
  }

  /// Copy of the raw tokens list (may be empty).
  #[ must_use ]
  pub fn tokens( &self ) -> Vec< String >
  {
    self.inner.read().config.tokens.clone()
  }

  /// Copy of the raw api-keys list (may be empty).
  #[ must_use ]
  pub fn api_keys( &self ) -> Vec< String >
  {
    self.inner.read().config.api_keys.clone()
  }

  /// The single `token`, if configured (never the multi-valued list).
  #[ must_use ]
  pub fn single_token( &self ) -> Option< String >
  {
    self.inner.read().config.token.clone()
  }

  /// The single `api_key`, if configured (never the multi-valued list).
  #[ must_use ]
  pub fn single_api_key( &self ) -> Option< String >
  {
    self.inner.read().config.api_key.clone()
  }

  /// Copy of the full config, for code paths that need more than the
  /// snapshot exposes (e.g. the transport layer building a request).
  #[ must_use ]
  pub fn config( &self ) -> EndpointConfig
  {
    self.inner.read().config.clone()
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;
  use std::collections::HashMap;

  fn config( name : &str, channel : &str ) -> EndpointConfig
  {
    EndpointConfig
    {
      channel : channel.to_string(),
      name : name.to_string(),
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
      category_multipliers : CategoryMultipliers::default(),
    }
  }

  #[ test ]
  fn new_endpoint_is_unhealthy_and_never_checked()
  {
    let ep = Endpoint::new( config( "a1", "a" ) );
    let snap = ep.snapshot();
    assert!( !snap.healthy );
    assert!( snap.never_checked );
    assert!( !snap.is_selectable() );
  }

  #[ test ]
  fn first_probe_success_flips_transition_flag()
  {
    let ep = Endpoint::new( config( "a1", "a" ) );
    let transitioned = ep.record_probe( true, Duration::from_millis( 10 ) );
    assert!( transitioned );
    assert!( ep.snapshot().is_selectable() );

    let transitioned_again = ep.record_probe( true, Duration::from_millis( 5 ) );
    assert!( !transitioned_again );
  }

  #[ test ]
  fn record_request_failure_leaves_last_response_time_untouched()
  {
    let ep = Endpoint::new( config( "a1", "a" ) );
    ep.record_probe( true, Duration::from_millis( 7 ) );
    ep.record_request_failure();
    let snap = ep.snapshot();
    assert!( !snap.healthy );
    assert_eq!( snap.last_response_time, Some( Duration::from_millis( 7 ) ) );
    assert_eq!( snap.consecutive_failures, 1 );
  }

  #[ test ]
  fn cooldown_blocks_selection_until_expiry()
  {
    let ep = Endpoint::new( config( "a1", "a" ) );
    ep.record_probe( true, Duration::from_millis( 1 ) );
    ep.apply_cooldown( Duration::from_millis( 10 ), "all_retries_exhausted" );
    assert!( !ep.snapshot().is_selectable() );

    std::thread::sleep( Duration::from_millis( 15 ) );
    assert!( ep.clear_expired_cooldown( Instant::now() ) );
    assert!( ep.snapshot().is_selectable() );
  }
}
