//! Channel inventory and the activation state machine.
//!
//! Grounded on `api_claude::failover::FailoverConfig`/`FailoverStrategy`
//! for the priority-vs-fastest split, and on the map-level `RwLock`
//! discipline established in `keystore.rs`. Activation transitions are
//! broadcast on a `tokio::sync::broadcast` channel so the suspension
//! queue (`suspension.rs`) can wake waiters without polling.

use std::{ collections::HashMap, sync::Arc, time::{ Duration, Instant } };
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::{
  channel::{ ActivationReason, Channel },
  config::Strategy,
  endpoint::Endpoint,
  error::{ ProxyError, ProxyResult },
};

/// A channel activation transition, broadcast to waiters so suspended
/// requests wake on a channel switch.
#[ derive( Debug, Clone ) ]
pub enum ChannelEvent
{
  /// `key` became the active channel.
  Activated( String ),
  /// `key` stopped being active.
  Deactivated( String ),
  /// The whole inventory was rebuilt (membership changed).
  Rebuilt,
}

/// Whether a cooldown is an automatic, time-expiring backoff, or an
/// operator-driven pause requiring explicit (or timed) resume.
#[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
pub enum CooldownMode
{
  /// The retry/failover pipeline's own backoff; lifts itself once
  /// `duration` elapses and is picked back up by automatic selection.
  Automatic,
  /// An operator-requested pause; behaves like `manual_pause` rather
  /// than a plain `Cooldown`.
  Manual,
}

/// Owns the channel inventory and decides which channel is active.
pub struct ChannelManager
{
  channels : RwLock< HashMap< String, Arc< Channel > > >,
  strategy : RwLock< Strategy >,
  events : broadcast::Sender< ChannelEvent >,
}

impl std::fmt::Debug for ChannelManager
{
  fn fmt( &self, f : &mut std::fmt::Formatter< '_ > ) -> std::fmt::Result
  {
    f.debug_struct( "ChannelManager" )
      .field( "channel_count", &self.channels.read().len() )
      .field( "strategy", &*self.strategy.read() )
      .finish()
  }
}

impl ChannelManager
{
  /// Build an empty manager for the given strategy.
  #[ must_use ]
  pub fn new( strategy : Strategy ) -> Self
  {
    let ( events, _ ) = broadcast::channel( 256 );
    Self { channels : RwLock::new( HashMap::new() ), strategy : RwLock::new( strategy ), events }
  }

  /// Subscribe to activation transitions.
  #[ must_use ]
  pub fn subscribe( &self ) -> broadcast::Receiver< ChannelEvent >
  {
    self.events.subscribe()
  }

  /// Current strategy.
  #[ must_use ]
  pub fn strategy( &self ) -> Strategy
  {
    *self.strategy.read()
  }

  /// Change strategy; does not itself re-run activation (caller should
  /// follow with `update_active`).
  pub fn set_strategy( &self, strategy : Strategy )
  {
    *self.strategy.write() = strategy;
  }

  /// Rebuild the channel inventory from a flat endpoint list, grouping by
  /// `channel_key` and sorting members by ascending priority. Preserves
  /// `manually_paused` / forced-active flags for channel keys that survive
  /// the rebuild.
  pub fn rebuild( &self, endpoints : &[ Arc< Endpoint > ] )
  {
    let mut groups : HashMap< String, Vec< Arc< Endpoint > > > = HashMap::new();
    for ep in endpoints
    {
      groups.entry( ep.snapshot().channel_key ).or_default().push( Arc::clone( ep ) );
    }

    let previous = self.channels.read().clone();
    let mut rebuilt = HashMap::new();
    for ( key, mut members ) in groups
    {
      members.sort_by_key( | ep | ep.snapshot().priority );
      let priority = members.first().map( | ep | ep.snapshot().priority ).unwrap_or( i64::MAX );
      let channel = Channel::new( key.clone(), priority, members );
      if let Some( prior ) = previous.get( &key )
      {
        let state = prior.state();
        if state.manually_paused
        {
          let remaining = state.pause_until.map( | until | until.saturating_duration_since( Instant::now() ) ).unwrap_or( Duration::ZERO );
          channel.manual_pause( remaining );
        }
        if matches!( state.reason, ActivationReason::ManualForced ) && state.is_active
        {
          channel.activate( ActivationReason::ManualForced );
        }
      }
      rebuilt.insert( key, Arc::new( channel ) );
    }

    *self.channels.write() = rebuilt;
    let _ = self.events.send( ChannelEvent::Rebuilt );
  }

  /// Look up a channel by key.
  #[ must_use ]
  pub fn get( &self, key : &str ) -> Option< Arc< Channel > >
  {
    self.channels.read().get( key ).cloned()
  }

  /// All channels, in no particular order.
  #[ must_use ]
  pub fn all( &self ) -> Vec< Arc< Channel > >
  {
    self.channels.read().values().cloned().collect()
  }

  /// The currently active channel, if any.
  #[ must_use ]
  pub fn active( &self ) -> Option< Arc< Channel > >
  {
    self.channels.read().values().find( | c | c.state().is_active ).cloned()
  }

  /// Re-run automatic channel selection: among channels that are not
  /// manually paused and have at least one eligible member, activate the
  /// best one per strategy and deactivate the rest. A channel already
  /// active under `ManualActive`/`ManualForced` keeps its pin unless it
  /// has lost all eligible members.
  pub fn update_active( &self, now : Instant )
  {
    let channels : Vec< Arc< Channel > > = self.channels.read().values().cloned().collect();
    for channel in &channels
    {
      channel.clear_expired_cooldown( now );
      channel.clear_expired_manual_pause( now );
    }

    if let Some( pinned ) = channels.iter().find( | c |
    {
      let state = c.state();
      matches!( state.reason, ActivationReason::ManualActive | ActivationReason::ManualForced ) && state.is_active
    } )
    {
      if pinned.has_eligible_member() || matches!( pinned.state().reason, ActivationReason::ManualForced )
      {
        for other in &channels
        {
          if !Arc::ptr_eq( other, pinned ) && other.state().is_active
          {
            other.deactivate( ActivationReason::NoEligibleMembers );
            let _ = self.events.send( ChannelEvent::Deactivated( other.key.clone() ) );
          }
        }
        return;
      }
    }

    let strategy = self.strategy();
    let best = channels.iter()
      .filter( | c | !c.state().manually_paused && !c.state().cooldown.is_active( now ) && c.has_eligible_member() )
      .min_by( | a, b | match strategy
      {
        Strategy::Priority => a.priority.cmp( &b.priority ),
        Strategy::Fastest => fastest_key( a ).cmp( &fastest_key( b ) ),
      } )
      .cloned();

    for channel in &channels
    {
      let is_best = best.as_ref().is_some_and( | b | Arc::ptr_eq( b, channel ) );
      let was_active = channel.state().is_active;
      if is_best
      {
        channel.activate( ActivationReason::Auto );
        if !was_active { let _ = self.events.send( ChannelEvent::Activated( channel.key.clone() ) ); }
      }
      else
      {
        if was_active
        {
          channel.deactivate( ActivationReason::NoEligibleMembers );
          let _ = self.events.send( ChannelEvent::Deactivated( channel.key.clone() ) );
        }
      }
    }
  }

  /// Operator: pin `key` active, bypassing automatic selection. Fails if
  /// the channel has no eligible member (use `manual_activate_force` for
  /// that case).
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if unknown, `ProxyError::NoEligibleChannel` if
  /// no member is selectable.
  pub fn manual_activate( &self, key : &str ) -> ProxyResult< () >
  {
    let channel = self.get( key ).ok_or_else( || ProxyError::NotFound( key.to_string() ) )?;
    if channel.state().cooldown.is_active( Instant::now() )
    {
      return Err( ProxyError::NoEligibleChannel );
    }
    if !channel.has_eligible_member()
    {
      return Err( ProxyError::NoEligibleChannel );
    }
    self.pin_active( &channel, ActivationReason::ManualActive );
    Ok( () )
  }

  /// Operator: pin `key` active even with zero currently-healthy members,
  /// as a last-resort fallback.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if unknown.
  pub fn manual_activate_force( &self, key : &str ) -> ProxyResult< () >
  {
    let channel = self.get( key ).ok_or_else( || ProxyError::NotFound( key.to_string() ) )?;
    self.pin_active( &channel, ActivationReason::ManualForced );
    Ok( () )
  }

  fn pin_active( &self, channel : &Arc< Channel >, reason : ActivationReason )
  {
    for other in self.channels.read().values()
    {
      if !Arc::ptr_eq( other, channel ) && other.state().is_active
      {
        other.deactivate( ActivationReason::NoEligibleMembers );
        let _ = self.events.send( ChannelEvent::Deactivated( other.key.clone() ) );
      }
    }
    let was_active = channel.state().is_active;
    channel.activate( reason );
    if !was_active { let _ = self.events.send( ChannelEvent::Activated( channel.key.clone() ) ); }
  }

  /// Operator: pause `key`, excluding it from automatic selection until
  /// `manual_resume`, or until `duration` elapses if it is non-zero (the
  /// expiry is picked up by the next `update_active` sweep).
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if unknown.
  pub fn manual_pause( &self, key : &str, duration : Duration ) -> ProxyResult< () >
  {
    let channel = self.get( key ).ok_or_else( || ProxyError::NotFound( key.to_string() ) )?;
    let was_active = channel.state().is_active;
    channel.manual_pause( duration );
    if was_active { let _ = self.events.send( ChannelEvent::Deactivated( key.to_string() ) ); }
    Ok( () )
  }

  /// Operator: clear a manual pause on `key`. Does not itself activate;
  /// call `update_active` afterwards.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if unknown.
  pub fn manual_resume( &self, key : &str ) -> ProxyResult< () >
  {
    let channel = self.get( key ).ok_or_else( || ProxyError::NotFound( key.to_string() ) )?;
    channel.manual_resume();
    Ok( () )
  }

  /// Operator: explicitly deactivate `key`, clearing any manual pin.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if unknown.
  pub fn deactivate( &self, key : &str ) -> ProxyResult< () >
  {
    let channel = self.get( key ).ok_or_else( || ProxyError::NotFound( key.to_string() ) )?;
    let was_active = channel.state().is_active;
    channel.deactivate( ActivationReason::NoEligibleMembers );
    if was_active { let _ = self.events.send( ChannelEvent::Deactivated( key.to_string() ) ); }
    Ok( () )
  }

  /// Apply a cooldown to `key`; used when failover exhausts a channel.
  /// `CooldownMode::Automatic` applies a plain, time-expiring `Cooldown`
  /// (the failover pipeline's own backoff); `CooldownMode::Manual` instead
  /// behaves like `manual_pause`, since an operator-requested cooldown
  /// should require the same explicit-or-timed resume as an explicit
  /// pause rather than silently rejoining automatic selection.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if unknown.
  pub fn set_channel_cooldown( &self, key : &str, duration : Duration, reason : impl Into< String >, mode : CooldownMode ) -> ProxyResult< () >
  {
    match mode
    {
      CooldownMode::Automatic =>
      {
        let channel = self.get( key ).ok_or_else( || ProxyError::NotFound( key.to_string() ) )?;
        channel.apply_cooldown( duration, reason );
        Ok( () )
      }
      CooldownMode::Manual => self.manual_pause( key, duration ),
    }
  }
}

/// Ordering key for the `fastest` strategy: channels with an unmeasured
/// member sort last, then by the minimum observed member latency.
fn fastest_key( channel : &Channel ) -> ( bool, std::time::Duration )
{
  let fastest = channel.members.iter()
    .filter_map( | ep | ep.snapshot().last_response_time )
    .min();
  match fastest
  {
    Some( d ) => ( false, d ),
    None => ( true, std::time::Duration::MAX ),
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;
  use crate::config::EndpointConfig;
  use std::{ collections::HashMap as StdHashMap, time::Duration };

  fn endpoint( channel : &str, name : &str, priority : i64 ) -> Arc< Endpoint >
  {
    let ep = Arc::new( Endpoint::new( EndpointConfig
    {
      channel : channel.to_string(),
      name : name.to_string(),
      url : "https://example.invalid".to_string(),
      priority,
      timeout : Duration::from_secs( 30 ),
      headers : StdHashMap::new(),
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
    ep
  }

  #[ test ]
  fn update_active_picks_best_priority_channel()
  {
    let manager = ChannelManager::new( Strategy::Priority );
    let a1 = endpoint( "a", "a1", 10 );
    a1.record_probe( true, Duration::from_millis( 1 ) );
    let b1 = endpoint( "b", "b1", 5 );
    b1.record_probe( true, Duration::from_millis( 1 ) );
    manager.rebuild( &[ a1, b1 ] );
    manager.update_active( Instant::now() );
    assert_eq!( manager.active().unwrap().key, "b" );
  }

  #[ test ]
  fn manual_activate_force_pins_despite_no_eligible_member()
  {
    let manager = ChannelManager::new( Strategy::Priority );
    let a1 = endpoint( "a", "a1", 10 );
    manager.rebuild( &[ a1 ] );
    assert!( matches!( manager.manual_activate( "a" ), Err( ProxyError::NoEligibleChannel ) ) );
    manager.manual_activate_force( "a" ).unwrap();
    assert!( manager.active().is_some() );
  }

  #[ test ]
  fn rebuild_preserves_manual_pause()
  {
    let manager = ChannelManager::new( Strategy::Priority );
    let a1 = endpoint( "a", "a1", 10 );
    manager.rebuild( &[ Arc::clone( &a1 ) ] );
    manager.manual_pause( "a", Duration::ZERO ).unwrap();
    manager.rebuild( &[ a1 ] );
    assert!( manager.get( "a" ).unwrap().state().manually_paused );
  }

  #[ test ]
  fn timed_manual_pause_survives_rebuild_with_remaining_duration()
  {
    let manager = ChannelManager::new( Strategy::Priority );
    let a1 = endpoint( "a", "a1", 10 );
    manager.rebuild( &[ Arc::clone( &a1 ) ] );
    manager.manual_pause( "a", Duration::from_secs( 60 ) ).unwrap();
    manager.rebuild( &[ a1 ] );
    let state = manager.get( "a" ).unwrap().state();
    assert!( state.manually_paused );
    assert!( state.pause_until.is_some() );
  }

  #[ test ]
  fn set_channel_cooldown_manual_mode_pauses_instead_of_cooling_down()
  {
    let manager = ChannelManager::new( Strategy::Priority );
    let a1 = endpoint( "a", "a1", 10 );
    a1.record_probe( true, Duration::from_millis( 1 ) );
    manager.rebuild( &[ a1 ] );
    manager.set_channel_cooldown( "a", Duration::from_secs( 30 ), "operator_request", CooldownMode::Manual ).unwrap();
    let state = manager.get( "a" ).unwrap().state();
    assert!( state.manually_paused );
    assert!( !state.cooldown.is_active( Instant::now() ) );
  }

  #[ test ]
  fn set_channel_cooldown_automatic_mode_applies_plain_cooldown()
  {
    let manager = ChannelManager::new( Strategy::Priority );
    let a1 = endpoint( "a", "a1", 10 );
    a1.record_probe( true, Duration::from_millis( 1 ) );
    manager.rebuild( &[ a1 ] );
    manager.set_channel_cooldown( "a", Duration::from_secs( 30 ), "no_eligible_member", CooldownMode::Automatic ).unwrap();
    let state = manager.get( "a" ).unwrap().state();
    assert!( !state.manually_paused );
    assert!( state.cooldown.is_active( Instant::now() ) );
  }

  #[ test ]
  fn manual_activate_rejects_a_cooling_channel()
  {
    let manager = ChannelManager::new( Strategy::Priority );
    let a1 = endpoint( "a", "a1", 10 );
    a1.record_probe( true, Duration::from_millis( 1 ) );
    manager.rebuild( &[ a1 ] );
    manager.set_channel_cooldown( "a", Duration::from_secs( 30 ), "no_eligible_member", CooldownMode::Automatic ).unwrap();
    assert!( matches!( manager.manual_activate( "a" ), Err( ProxyError::NoEligibleChannel ) ) );
  }
}
