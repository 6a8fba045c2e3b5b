//! Per-attempt retry decisions.
//!
//! Grounded on `api_claude::retry_logic::RetryConfig`'s exponential
//! backoff/jitter shape, generalized into a `Decision` the caller
//! (`proxy.rs`) executes: keep retrying the same endpoint, switch to a
//! different one, suspend the request, or give up.

use std::time::Duration;

use crate::{ config::RetryConfig, error::ErrorKind };

/// What the proxy should do after a failed attempt.
#[ derive( Debug, Clone, PartialEq ) ]
pub enum Decision
{
  /// Retry the same endpoint after `delay`.
  Retry( Duration ),
  /// Abandon this endpoint and ask the failover pipeline for another.
  Switch,
  /// No endpoint is currently usable; suspend the request if suspension
  /// is enabled, otherwise fail.
  Suspend,
  /// Give up and report the error to the caller.
  Fail,
}

/// Decides what to do after attempt `attempt` (1-based) failed with
/// `kind`.
#[ derive( Debug, Clone ) ]
pub struct RetryPolicy
{
  config : RetryConfig,
}

impl RetryPolicy
{
  /// Build a policy from `config`.
  #[ must_use ]
  pub fn new( config : RetryConfig ) -> Self
  {
    Self { config }
  }

  /// Exponential backoff with full jitter: `base * multiplier^(attempt-1)`,
  /// capped at `max_delay`, then uniformly scaled into `[0, cap]`.
  #[ must_use ]
  pub fn backoff_delay( &self, attempt : u32 ) -> Duration
  {
    let exponent = attempt.saturating_sub( 1 );
    let scaled = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi( exponent as i32 );
    let capped = scaled.min( self.config.max_delay.as_secs_f64() );
    let jittered = capped * fastrand::f64();
    Duration::from_secs_f64( jittered.max( 0.0 ) )
  }

  /// Rate-limit responses never back off less than one full second,
  /// regardless of attempt count.
  #[ must_use ]
  pub fn rate_limit_delay( &self, attempt : u32 ) -> Duration
  {
    self.backoff_delay( attempt ).max( Duration::from_secs( 1 ) )
  }

  /// Decide the next action after `kind` on attempt `attempt` of this
  /// endpoint, given whether another endpoint is currently a candidate
  /// and whether suspension is enabled.
  #[ must_use ]
  pub fn decide( &self, kind : ErrorKind, attempt : u32, another_endpoint_available : bool, suspension_enabled : bool ) -> Decision
  {
    if matches!( kind, ErrorKind::ClientCancel )
    {
      return Decision::Fail;
    }

    if kind.is_retryable() && attempt < self.config.max_attempts
    {
      let delay = if kind.is_rate_limit_class() { self.rate_limit_delay( attempt ) } else { self.backoff_delay( attempt ) };
      return Decision::Retry( delay );
    }

    if kind.should_switch() && another_endpoint_available
    {
      return Decision::Switch;
    }

    if suspension_enabled && matches!( kind, ErrorKind::NoHealthyEndpoints )
    {
      return Decision::Suspend;
    }

    Decision::Fail
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  fn policy() -> RetryPolicy
  {
    RetryPolicy::new( RetryConfig { max_attempts : 3, base_delay : Duration::from_millis( 100 ), max_delay : Duration::from_secs( 1 ), multiplier : 2.0 } )
  }

  #[ test ]
  fn retryable_error_within_attempt_budget_retries()
  {
    let decision = policy().decide( ErrorKind::Network, 1, true, false );
    assert!( matches!( decision, Decision::Retry( _ ) ) );
  }

  #[ test ]
  fn retryable_error_past_attempt_budget_switches_if_available()
  {
    let decision = policy().decide( ErrorKind::Network, 3, true, false );
    assert_eq!( decision, Decision::Switch );
  }

  #[ test ]
  fn auth_error_never_retries_but_switches()
  {
    let decision = policy().decide( ErrorKind::Http4xxAuth, 1, true, false );
    assert_eq!( decision, Decision::Switch );
  }

  #[ test ]
  fn client_cancel_always_fails()
  {
    let decision = policy().decide( ErrorKind::ClientCancel, 1, true, true );
    assert_eq!( decision, Decision::Fail );
  }

  #[ test ]
  fn no_healthy_endpoints_suspends_when_enabled()
  {
    let decision = policy().decide( ErrorKind::NoHealthyEndpoints, 1, false, true );
    assert_eq!( decision, Decision::Suspend );
  }

  #[ test ]
  fn rate_limit_delay_never_below_one_second()
  {
    let delay = policy().rate_limit_delay( 1 );
    assert!( delay >= Duration::from_secs( 1 ) );
  }

  #[ test ]
  fn backoff_delay_caps_at_max_delay()
  {
    let delay = policy().backoff_delay( 10 );
    assert!( delay <= Duration::from_secs( 1 ) );
  }
}
