//! Bounded queue of requests waiting for a channel to become usable
//! again.
//!
//! Grounded on `channel_manager.rs`'s `broadcast` of activation
//! transitions; a suspended request waits on that broadcast (or a
//! timeout, or its own cancellation token) rather than polling.

use std::sync::Arc;
use tokio::sync::{ Notify, Semaphore };

use crate::{
  channel_manager::{ ChannelEvent, ChannelManager },
  config::RequestSuspendConfig,
  error::SuspensionOutcome,
};

/// Gates how many requests may be suspended concurrently and wakes them
/// on channel activation or explicit cancellation.
#[ derive( Debug ) ]
pub struct SuspensionQueue
{
  config : RequestSuspendConfig,
  capacity : Arc< Semaphore >,
  cancel : Arc< Notify >,
}

impl SuspensionQueue
{
  /// Build a queue honoring `capacity` (already clamped by
  /// `ProxyConfig::suspension_capacity`).
  #[ must_use ]
  pub fn new( config : RequestSuspendConfig, capacity : usize ) -> Self
  {
    Self { config, capacity : Arc::new( Semaphore::new( capacity ) ), cancel : Arc::new( Notify::new() ) }
  }

  /// Wake every request waiting in this queue with `Cancelled` (e.g. on
  /// shutdown).
  pub fn cancel_all( &self )
  {
    self.cancel.notify_waiters();
  }

  /// Suspend the caller until `channels` reports an `Activated` event,
  /// the configured timeout elapses, or `cancel_all` fires. Returns
  /// `None` if suspension is disabled or the queue is at capacity (the
  /// caller should fail the request immediately in that case).
  pub async fn wait_for_recovery( &self, channels : &ChannelManager ) -> Option< SuspensionOutcome >
  {
    if !self.config.enabled
    {
      return None;
    }

    let Ok( _permit ) = Arc::clone( &self.capacity ).try_acquire_owned() else
    {
      return None;
    };

    let mut events = channels.subscribe();
    let timeout = tokio::time::sleep( self.config.timeout );
    tokio::pin!( timeout );

    loop
    {
      tokio::select!
      {
        event = events.recv() =>
        {
          match event
          {
            Ok( ChannelEvent::Activated( _ ) ) => return Some( SuspensionOutcome::Success ),
            Ok( _ ) => continue,
            Err( _ ) => return Some( SuspensionOutcome::Timeout ),
          }
        }
        () = self.cancel.notified() => return Some( SuspensionOutcome::Cancelled ),
        () = &mut timeout => return Some( SuspensionOutcome::Timeout ),
      }
    }
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;
  use crate::config::Strategy;
  use std::time::Duration;

  #[ tokio::test ]
  async fn disabled_queue_returns_none_immediately()
  {
    let queue = SuspensionQueue::new( RequestSuspendConfig { enabled : false, ..RequestSuspendConfig::default() }, 10 );
    let channels = ChannelManager::new( Strategy::Priority );
    assert!( queue.wait_for_recovery( &channels ).await.is_none() );
  }

  #[ tokio::test ]
  async fn timeout_elapses_to_timeout_outcome()
  {
    let queue = SuspensionQueue::new(
      RequestSuspendConfig { enabled : true, timeout : Duration::from_millis( 10 ), ..RequestSuspendConfig::default() },
      10,
    );
    let channels = ChannelManager::new( Strategy::Priority );
    let outcome = queue.wait_for_recovery( &channels ).await;
    assert_eq!( outcome, Some( SuspensionOutcome::Timeout ) );
  }

  #[ tokio::test ]
  async fn activation_event_resumes_with_success()
  {
    use crate::{ config::EndpointConfig, endpoint::Endpoint };
    use std::collections::HashMap;

    let queue = Arc::new( SuspensionQueue::new(
      RequestSuspendConfig { enabled : true, timeout : Duration::from_secs( 5 ), ..RequestSuspendConfig::default() },
      10,
    ) );
    let channels = Arc::new( ChannelManager::new( Strategy::Priority ) );
    let endpoint = Arc::new( Endpoint::new( EndpointConfig
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
    } ) );
    endpoint.record_probe( true, Duration::from_millis( 1 ) );
    channels.rebuild( &[ endpoint ] );

    let waiter_queue = Arc::clone( &queue );
    let waiter_channels = Arc::clone( &channels );
    let handle = tokio::spawn( async move { waiter_queue.wait_for_recovery( &waiter_channels ).await } );

    tokio::time::sleep( Duration::from_millis( 20 ) ).await;
    channels.update_active( std::time::Instant::now() );

    let outcome = handle.await.unwrap();
    assert_eq!( outcome, Some( SuspensionOutcome::Success ) );
  }
}
