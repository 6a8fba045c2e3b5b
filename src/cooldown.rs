//! Cooldown bookkeeping shared by `Endpoint` and `Channel`.
//! Grounded on `api_claude::circuit_breaker`'s timestamp/duration
//! state tracking, narrowed to the single `until`/`reason` pair the data
//! model calls for rather than a full breaker state machine.

use std::time::{ Duration, Instant };

/// A cooldown window: `until == None` means "not cooling".
#[ derive( Debug, Clone, Default, PartialEq, Eq ) ]
pub struct Cooldown
{
  until : Option< Instant >,
  reason : Option< String >,
}

impl Cooldown
{
  /// No active cooldown.
  #[ must_use ]
  pub fn none() -> Self
  {
    Self { until : None, reason : None }
  }

  /// Begin a cooldown of `duration`, stamping `reason`.
  pub fn apply( &mut self, duration : Duration, reason : impl Into< String > )
  {
    self.until = Some( Instant::now() + duration );
    self.reason = Some( reason.into() );
  }

  /// Whether this is still cooling as of `now`. Mirrors the
  /// `cooldown_until <= now => zero` clearing rule: an expired cooldown
  /// reports `false` here, but callers should call `clear_expired` to
  /// actually reset `until`/`reason` to `None`.
  #[ must_use ]
  pub fn is_active( &self, now : Instant ) -> bool
  {
    self.until.is_some_and( | until | until > now )
  }

  /// If the cooldown has expired as of `now`, reset it to "not cooling"
  /// and report whether a reset happened.
  pub fn clear_if_expired( &mut self, now : Instant ) -> bool
  {
    if let Some( until ) = self.until
    {
      if until <= now
      {
        self.until = None;
        self.reason = None;
        return true;
      }
    }
    false
  }

  /// The cooldown deadline, if any.
  #[ must_use ]
  pub fn until( &self ) -> Option< Instant >
  {
    self.until
  }

  /// The stamped reason, if any.
  #[ must_use ]
  pub fn reason( &self ) -> Option< &str >
  {
    self.reason.as_deref()
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  #[ test ]
  fn apply_then_is_active_then_expires()
  {
    let mut cooldown = Cooldown::none();
    assert!( !cooldown.is_active( Instant::now() ) );

    cooldown.apply( Duration::from_millis( 10 ), "boom" );
    assert!( cooldown.is_active( Instant::now() ) );
    assert_eq!( cooldown.reason(), Some( "boom" ) );

    let later = Instant::now() + Duration::from_millis( 20 );
    assert!( !cooldown.is_active( later ) );
    assert!( cooldown.clear_if_expired( later ) );
    assert!( cooldown.until().is_none() );
    assert!( cooldown.reason().is_none() );
  }

  #[ test ]
  fn clear_if_expired_is_noop_while_still_cooling()
  {
    let mut cooldown = Cooldown::none();
    cooldown.apply( Duration::from_secs( 60 ), "r" );
    assert!( !cooldown.clear_if_expired( Instant::now() ) );
    assert!( cooldown.until().is_some() );
  }
}
