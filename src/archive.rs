//! Batches finished requests from the hot pool into durable storage.
//!
//! Grounded on the bounded-channel-plus-overflow-counter shape common to
//! the pack's gateway services, paired with the `CostEngine` to compute
//! `cost_usd` once per request rather than on every hot-pool read.

use std::{ sync::Arc, time::Duration };
use tokio::sync::mpsc;

use crate::{ active_request::ActiveRequest, cost::{ CostEngine, MultiplierMode }, endpoint_manager::EndpointManager, logging::log_archive_batch, store::Store };

/// Counts requests dropped because the inbound archive channel was full.
/// Kept separate from
/// `ArchiveBatcher` so the hot pool's send path can share one counter
/// without needing a `Store` handle.
#[ derive( Debug, Default ) ]
pub struct OverflowCounter( std::sync::atomic::AtomicU64 );

impl OverflowCounter
{
  /// Record one dropped request.
  pub fn record( &self )
  {
    self.0.fetch_add( 1, std::sync::atomic::Ordering::Relaxed );
  }

  /// Total dropped so far.
  #[ must_use ]
  pub fn count( &self ) -> u64
  {
    self.0.load( std::sync::atomic::Ordering::Relaxed )
  }
}

/// Receives finished requests, batches them by size or interval
/// (whichever comes first), computes cost, and writes them to the
/// store with bounded retry.
#[ derive( Debug ) ]
pub struct ArchiveBatcher
{
  store : Arc< Store >,
  cost_engine : Arc< CostEngine >,
  endpoints : Arc< EndpointManager >,
  batch_size : usize,
  flush_interval : Duration,
  max_retry : u32,
  /// Shared with the hot pool's send path.
  overflow : Arc< OverflowCounter >,
}

impl ArchiveBatcher
{
  /// Build a batcher over `store`/`cost_engine` with the given batching
  /// parameters, sharing `overflow` with the caller. `endpoints` supplies
  /// each request's per-endpoint `cost_multiplier`/`category_multipliers`
  /// at flush time, since those may have changed since the request
  /// started.
  #[ must_use ]
  pub fn new( store : Arc< Store >, cost_engine : Arc< CostEngine >, endpoints : Arc< EndpointManager >, batch_size : usize, flush_interval : Duration, max_retry : u32, overflow : Arc< OverflowCounter > ) -> Self
  {
    Self { store, cost_engine, endpoints, batch_size, flush_interval, max_retry, overflow }
  }

  /// Number of requests dropped so far because the inbound buffer was
  /// full.
  #[ must_use ]
  pub fn dropped_count( &self ) -> u64
  {
    self.overflow.count()
  }

  /// Drain `receiver` until it closes, flushing whenever a batch reaches
  /// `batch_size` or `flush_interval` elapses since the last flush.
  pub async fn run( &self, mut receiver : mpsc::Receiver< ActiveRequest > )
  {
    let mut pending = Vec::with_capacity( self.batch_size );
    let mut ticker = tokio::time::interval( self.flush_interval );
    ticker.tick().await; // first tick fires immediately; consume it

    loop
    {
      tokio::select!
      {
        received = receiver.recv() =>
        {
          match received
          {
            Some( request ) =>
            {
              pending.push( request );
              if pending.len() >= self.batch_size
              {
                self.flush( &mut pending ).await;
              }
            }
            None =>
            {
              if !pending.is_empty() { self.flush( &mut pending ).await; }
              return;
            }
          }
        }
        _ = ticker.tick() =>
        {
          if !pending.is_empty() { self.flush( &mut pending ).await; }
        }
      }
    }
  }

  async fn flush( &self, pending : &mut Vec< ActiveRequest > )
  {
    let batch : Vec< ( ActiveRequest, Option< f64 > ) > = pending.drain( .. )
      .map( | request |
      {
        let mode = self.endpoints.get( &request.endpoint_key )
          .map( | endpoint | { let snapshot = endpoint.snapshot(); MultiplierMode::from_endpoint( snapshot.cost_multiplier, snapshot.category_multipliers ) } )
          .unwrap_or( MultiplierMode::Overall( 1.0 ) );
        let cost = request.model.as_deref()
          .and_then( | model | self.cost_engine.compute( model, request.usage, mode ) );
        ( request, cost )
      } )
      .collect();

    let batch_size = batch.len();
    let mut attempt = 0;
    loop
    {
      attempt += 1;
      match self.store.insert_batch( &batch ).await
      {
        Ok( () ) => { log_archive_batch( batch_size, batch_size, 0 ); return; }
        Err( _err ) if attempt < self.max_retry =>
        {
          tokio::time::sleep( Duration::from_millis( 100 * u64::from( attempt ) ) ).await;
        }
        Err( _err ) =>
        {
          log_archive_batch( batch_size, 0, batch_size );
          return;
        }
      }
    }
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  #[ test ]
  fn overflow_counter_increments_independently_of_the_batcher()
  {
    let counter = OverflowCounter::default();
    counter.record();
    counter.record();
    assert_eq!( counter.count(), 2 );
  }
}
