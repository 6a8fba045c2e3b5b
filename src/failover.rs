//! Cross-endpoint and cross-channel failover orchestration.
//!
//! Grounded on `api_claude::failover::{FailoverConfig, FailoverStrategy}`,
//! generalized from a flat endpoint list into a channel-aware algorithm:
//! cooldown the endpoints that just
//! failed, cool the channel down if every member is now exhausted, then
//! hand activation to the next-best channel (falling back to a forced
//! activation if nothing is currently healthy anywhere).

use std::{ sync::Arc, time::{ Duration, Instant } };

use crate::{
  channel_manager::{ ChannelManager, CooldownMode },
  config::FailoverConfig,
  endpoint::Endpoint,
  logging::log_failover_triggered,
};

/// Result of one failover pass.
#[ derive( Debug, Clone ) ]
pub enum Outcome
{
  /// `key` is now the active channel.
  SwitchedTo( String ),
  /// No channel had an eligible member; `key` was force-activated as a
  /// last resort.
  ForcedTo( String ),
  /// No channel could be activated at all, forced or otherwise.
  NoneAvailable,
}

/// Drives the channel-level response to one or more endpoint failures.
#[ derive( Debug ) ]
pub struct FailoverOrchestrator
{
  config : FailoverConfig,
}

impl FailoverOrchestrator
{
  /// Build an orchestrator from `config`.
  #[ must_use ]
  pub fn new( config : FailoverConfig ) -> Self
  {
    Self { config }
  }

  /// Run one failover pass after `failed_endpoints` (deduplicated by
  /// identity) have been exhausted on the currently-active channel.
  ///
  /// 1. Deduplicate the failed endpoint list.
  /// 2. Apply each failed endpoint's cooldown (its own override, or the
  ///    configured default).
  /// 3. If the channel now has no eligible member, cool the channel down
  ///    too and deactivate it.
  /// 4. Re-run automatic activation.
  /// 5. If nothing became active, scan all channels in priority order for
  ///    any failover-enabled member and force-activate the first one found.
  /// 6. If still nothing, report `NoneAvailable`.
  pub fn handle_failure( &self, channels : &ChannelManager, channel_key : &str, failed_endpoints : &[ Arc< Endpoint > ] ) -> Outcome
  {
    if !self.config.enabled
    {
      return Outcome::NoneAvailable;
    }

    let mut seen = std::collections::HashSet::new();
    for endpoint in failed_endpoints
    {
      let key = endpoint.key();
      if !seen.insert( key ) { continue; }
      let duration = endpoint.cooldown_override().unwrap_or( self.config.default_cooldown );
      endpoint.apply_cooldown( duration, "all_retries_exhausted" );
    }

    let now = Instant::now();
    if let Some( channel ) = channels.get( channel_key )
    {
      if !channel.has_eligible_member()
      {
        let _ = channels.set_channel_cooldown( channel_key, self.config.default_cooldown, "no_eligible_member", CooldownMode::Automatic );
      }
    }

    channels.update_active( now );

    if let Some( active ) = channels.active()
    {
      log_failover_triggered( channel_key, &active.key, "auto" );
      return Outcome::SwitchedTo( active.key.clone() );
    }

    if let Some( forced ) = self.force_activate_any( channels )
    {
      log_failover_triggered( channel_key, &forced, "forced" );
      return Outcome::ForcedTo( forced );
    }

    Outcome::NoneAvailable
  }

  /// Scan all channels, best priority first, and force-activate the
  /// first one whose members are still eligible for failover at all
  /// (healthy-or-never-checked, not cooling), even if none is currently
  /// healthy.
  fn force_activate_any( &self, channels : &ChannelManager ) -> Option< String >
  {
    let mut all = channels.all();
    all.sort_by_key( | c | c.priority );
    let now = Instant::now();

    let candidate = all.iter().find( | c |
      c.members.iter().any( | ep | ep.snapshot().is_failover_candidate() )
      && !c.state().cooldown.is_active( now )
      && !c.state().manually_paused
    )?;

    channels.manual_activate_force( &candidate.key ).ok()?;
    Some( candidate.key.clone() )
  }

  /// Default per-endpoint cooldown used when an endpoint has no override.
  #[ must_use ]
  pub fn default_cooldown( &self ) -> Duration
  {
    self.config.default_cooldown
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;
  use crate::{ channel_manager::ChannelManager, config::{ EndpointConfig, Strategy } };
  use std::collections::HashMap;

  fn endpoint( channel : &str, name : &str, priority : i64 ) -> Arc< Endpoint >
  {
    Arc::new( Endpoint::new( EndpointConfig
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
    } ) )
  }

  #[ test ]
  fn exhausting_one_channel_switches_to_the_next()
  {
    let channels = ChannelManager::new( Strategy::Priority );
    let a1 = endpoint( "a", "a1", 10 );
    a1.record_probe( true, Duration::from_millis( 1 ) );
    let b1 = endpoint( "b", "b1", 20 );
    b1.record_probe( true, Duration::from_millis( 1 ) );
    channels.rebuild( &[ Arc::clone( &a1 ), Arc::clone( &b1 ) ] );
    channels.update_active( Instant::now() );
    assert_eq!( channels.active().unwrap().key, "a" );

    let orchestrator = FailoverOrchestrator::new( FailoverConfig { enabled : true, default_cooldown : Duration::from_secs( 60 ) } );
    let outcome = orchestrator.handle_failure( &channels, "a", &[ a1 ] );
    assert!( matches!( outcome, Outcome::SwitchedTo( key ) if key == "b" ) );
  }

  #[ test ]
  fn no_eligible_anywhere_forces_a_never_checked_channel()
  {
    let channels = ChannelManager::new( Strategy::Priority );
    let a1 = endpoint( "a", "a1", 10 );
    a1.record_probe( true, Duration::from_millis( 1 ) );
    let b1 = endpoint( "b", "b1", 20 );
    channels.rebuild( &[ Arc::clone( &a1 ), b1 ] );
    channels.update_active( Instant::now() );

    let orchestrator = FailoverOrchestrator::new( FailoverConfig { enabled : true, default_cooldown : Duration::from_secs( 60 ) } );
    let outcome = orchestrator.handle_failure( &channels, "a", &[ a1 ] );
    assert!( matches!( outcome, Outcome::ForcedTo( key ) if key == "b" ) );
  }

  #[ test ]
  fn disabled_failover_reports_none_available()
  {
    let channels = ChannelManager::new( Strategy::Priority );
    let a1 = endpoint( "a", "a1", 10 );
    channels.rebuild( &[ Arc::clone( &a1 ) ] );
    let orchestrator = FailoverOrchestrator::new( FailoverConfig { enabled : false, default_cooldown : Duration::from_secs( 60 ) } );
    let outcome = orchestrator.handle_failure( &channels, "a", &[ a1 ] );
    assert!( matches!( outcome, Outcome::NoneAvailable ) );
  }
}
