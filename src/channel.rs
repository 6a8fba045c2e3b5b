//! A channel: a named, priority-ordered group of endpoints that activate
//! and deactivate together.
//!
//! Grounded on `api_claude::health_checks::EndpointHealthStatus` for the
//! enum-of-reasons shape, generalized to a channel-level activation
//! status rather than a per-endpoint health status. Each channel carries
//! its own lock over `{priority, activation, cooldown}`; the channel's
//! member list is fixed at construction (membership changes go through
//! `ChannelManager::rebuild`, which replaces the whole `Channel`).

use std::{ sync::Arc, time::{ Duration, Instant } };
use parking_lot::RwLock;

use crate::{ cooldown::Cooldown, endpoint::Endpoint };

/// Why a channel is currently active or inactive.
#[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
pub enum ActivationReason
{
  /// Chosen automatically because it is the best eligible channel.
  Auto,
  /// Pinned active by an operator, overriding automatic selection.
  ManualActive,
  /// Forced active despite having no currently-healthy member, via
  /// `manual_activate_force`.
  ManualForced,
  /// Paused by an operator; excluded from automatic selection until
  /// resumed.
  ManuallyPaused,
  /// Deactivated because no member is currently eligible.
  NoEligibleMembers,
  /// Deactivated because the channel itself is cooling down.
  Cooling,
}

/// Mutable activation state of a channel.
#[ derive( Debug, Clone ) ]
pub struct ActivationState
{
  /// Whether this channel is the currently active one for its strategy
  /// group.
  pub is_active : bool,
  /// Why it is in its current state.
  pub reason : ActivationReason,
  /// Set when an operator pins this channel active; cleared by
  /// `deactivate` or a later manual pause.
  pub manually_paused : bool,
  /// When this channel was last manually activated (drives "stickiness"
  /// against automatic re-evaluation flapping it back).
  pub last_manual_activation : Option< Instant >,
  /// Channel-level cooldown (distinct from any member endpoint's own
  /// cooldown).
  pub cooldown : Cooldown,
  /// When a timed manual pause should lift itself. `None` means either
  /// not paused, or paused indefinitely until an explicit `manual_resume`.
  pub pause_until : Option< Instant >,
}

impl Default for ActivationState
{
  fn default() -> Self
  {
    Self
    {
      is_active : false,
      reason : ActivationReason::NoEligibleMembers,
      manually_paused : false,
      last_manual_activation : None,
      cooldown : Cooldown::none(),
      pause_until : None,
    }
  }
}

/// A priority-ordered group of endpoints that activate together.
#[ derive( Debug ) ]
pub struct Channel
{
  /// Channel label (`EndpointConfig::channel`, or the endpoint's own name
  /// in legacy one-per-endpoint mode).
  pub key : String,
  /// Static priority (smaller = higher), taken from the best-priority
  /// member at rebuild time.
  pub priority : i64,
  /// Members, in ascending-priority order.
  pub members : Vec< Arc< Endpoint > >,
  state : RwLock< ActivationState >,
}

impl Channel
{
  /// Build a channel from its (already priority-sorted) members.
  #[ must_use ]
  pub fn new( key : impl Into< String >, priority : i64, members : Vec< Arc< Endpoint > > ) -> Self
  {
    Self { key : key.into(), priority, members, state : RwLock::new( ActivationState::default() ) }
  }

  /// Snapshot of the current activation state.
  #[ must_use ]
  pub fn state( &self ) -> ActivationState
  {
    self.state.read().clone()
  }

  /// Whether any member is currently a usable failover candidate.
  #[ must_use ]
  pub fn has_eligible_member( &self ) -> bool
  {
    self.members.iter().any( | ep | ep.snapshot().is_selectable() )
  }

  /// The highest-priority currently-selectable member, if any.
  #[ must_use ]
  pub fn best_member( &self ) -> Option< Arc< Endpoint > >
  {
    self.members.iter()
      .filter( | ep | ep.snapshot().is_selectable() )
      .min_by_key( | ep | ep.snapshot().priority )
      .cloned()
  }

  /// Mark this channel active for `reason`.
  pub fn activate( &self, reason : ActivationReason )
  {
    let mut guard = self.state.write();
    guard.is_active = true;
    guard.reason = reason;
    if matches!( reason, ActivationReason::ManualActive | ActivationReason::ManualForced )
    {
      guard.last_manual_activation = Some( Instant::now() );
    }
  }

  /// Mark this channel inactive for `reason`.
  pub fn deactivate( &self, reason : ActivationReason )
  {
    let mut guard = self.state.write();
    guard.is_active = false;
    guard.reason = reason;
  }

  /// Operator pause: inactive and excluded from automatic selection
  /// until `resume`, or until `duration` elapses if it is non-zero.
  pub fn manual_pause( &self, duration : Duration )
  {
    let mut guard = self.state.write();
    guard.manually_paused = true;
    guard.is_active = false;
    guard.reason = ActivationReason::ManuallyPaused;
    guard.pause_until = if duration > Duration::ZERO { Some( Instant::now() + duration ) } else { None };
  }

  /// Clear a manual pause; does not itself activate the channel.
  pub fn manual_resume( &self )
  {
    let mut guard = self.state.write();
    guard.manually_paused = false;
    guard.pause_until = None;
  }

  /// Clear a timed manual pause if its scheduled resume time has passed.
  /// Returns `true` if it just lifted the pause.
  pub fn clear_expired_manual_pause( &self, now : Instant ) -> bool
  {
    let mut guard = self.state.write();
    if guard.manually_paused
    {
      if let Some( until ) = guard.pause_until
      {
        if now >= until
        {
          guard.manually_paused = false;
          guard.pause_until = None;
          return true;
        }
      }
    }
    false
  }

  /// Apply a channel-level cooldown; used when failover exhausts every
  /// member of this channel.
  pub fn apply_cooldown( &self, duration : std::time::Duration, reason : impl Into< String > )
  {
    self.state.write().cooldown.apply( duration, reason );
  }

  /// Clear the channel cooldown if it has expired as of `now`.
  pub fn clear_expired_cooldown( &self, now : Instant ) -> bool
  {
    self.state.write().cooldown.clear_if_expired( now )
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;
  use crate::config::EndpointConfig;
  use std::{ collections::HashMap, time::Duration };

  fn endpoint( name : &str, priority : i64 ) -> Arc< Endpoint >
  {
    let ep = Arc::new( Endpoint::new( EndpointConfig
    {
      channel : "g".to_string(),
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
    } ) );
    ep.record_probe( true, Duration::from_millis( 1 ) );
    ep
  }

  #[ test ]
  fn best_member_picks_lowest_priority_among_selectable()
  {
    let channel = Channel::new( "g", 10, vec![ endpoint( "b", 20 ), endpoint( "a", 10 ) ] );
    assert_eq!( channel.best_member().unwrap().key(), "g::a" );
  }

  #[ test ]
  fn channel_cooldown_does_not_affect_member_eligibility()
  {
    let channel = Channel::new( "g", 10, vec![ endpoint( "a", 10 ) ] );
    channel.apply_cooldown( Duration::from_secs( 60 ), "exhausted" );
    assert!( channel.has_eligible_member() );
    assert!( channel.state().cooldown.is_active( Instant::now() ) );
  }

  #[ test ]
  fn manual_pause_then_resume_clears_pause_flag()
  {
    let channel = Channel::new( "g", 10, vec![ endpoint( "a", 10 ) ] );
    channel.manual_pause( Duration::ZERO );
    assert!( channel.state().manually_paused );
    assert!( !channel.state().is_active );
    channel.manual_resume();
    assert!( !channel.state().manually_paused );
  }

  #[ test ]
  fn timed_manual_pause_lifts_itself_once_elapsed()
  {
    let channel = Channel::new( "g", 10, vec![ endpoint( "a", 10 ) ] );
    channel.manual_pause( Duration::from_millis( 10 ) );
    assert!( !channel.clear_expired_manual_pause( Instant::now() ) );
    std::thread::sleep( Duration::from_millis( 15 ) );
    assert!( channel.clear_expired_manual_pause( Instant::now() ) );
    assert!( !channel.state().manually_paused );
  }
}
