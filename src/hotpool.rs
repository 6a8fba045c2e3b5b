//! The hot pool of in-flight/recently-finished requests.
//!
//! Grounded on the map-level/per-entry `RwLock` split established in
//! `keystore.rs`: the map lock only ever guards insert/remove, never a
//! usage update, so two requests updating their own usage concurrently
//! never contend.

use std::{ collections::HashMap, sync::Arc, time::Duration };
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::active_request::{ ActiveRequest, RequestStatus };

/// How long a completed/truncated request is kept in the hot pool before
/// the background sweep archives it, giving late telemetry readers a
/// window to observe the final state.
const ARCHIVE_GRACE : Duration = Duration::from_secs( 2 );

/// Owns in-flight requests and hands finished ones off to the archive
/// batcher once their grace window elapses.
#[ derive( Debug ) ]
pub struct HotPool
{
  requests : RwLock< HashMap< String, Arc< RwLock< ActiveRequest > > > >,
  archive_tx : mpsc::Sender< ActiveRequest >,
  /// Requests still `InFlight` after this long are presumed leaked (the
  /// client connection dropped without the transport ever reporting
  /// cancellation) and are force-finished as `Timeout` by `sweep`.
  max_age : Duration,
}

impl HotPool
{
  /// Build a hot pool that forwards finished requests to `archive_tx`,
  /// force-timing-out in-flight requests older than `max_age`.
  #[ must_use ]
  pub fn new( archive_tx : mpsc::Sender< ActiveRequest >, max_age : Duration ) -> Self
  {
    Self { requests : RwLock::new( HashMap::new() ), archive_tx, max_age }
  }

  /// Register a newly accepted request.
  pub fn insert( &self, request : ActiveRequest )
  {
    self.requests.write().insert( request.request_id.clone(), Arc::new( RwLock::new( request ) ) );
  }

  /// Apply `update` to the request's own lock, without touching the map
  /// lock. Returns `false` if the request is unknown (e.g. already
  /// archived).
  pub fn update( &self, request_id : &str, update : impl FnOnce( &mut ActiveRequest ) ) -> bool
  {
    let Some( entry ) = self.requests.read().get( request_id ).cloned() else { return false };
    update( &mut entry.write() );
    true
  }

  /// Snapshot one request.
  #[ must_use ]
  pub fn get( &self, request_id : &str ) -> Option< ActiveRequest >
  {
    self.requests.read().get( request_id ).map( | entry | entry.read().clone() )
  }

  /// All requests currently in the pool.
  #[ must_use ]
  pub fn all( &self ) -> Vec< ActiveRequest >
  {
    self.requests.read().values().map( | entry | entry.read().clone() ).collect()
  }

  /// Mark a request finished and archive it immediately (used by code
  /// paths, such as tests, that don't want to wait for the background
  /// sweep).
  pub async fn complete_and_archive( &self, request_id : &str, status : RequestStatus ) -> bool
  {
    let Some( entry ) = self.requests.write().remove( request_id ) else { return false };
    let mut request = entry.read().clone();
    request.finish( status, None );
    let _ = self.archive_tx.send( request ).await;
    true
  }

  /// Sweep the pool once: force-finish any `InFlight` request older than
  /// `max_age` as `Timeout`, then archive every request that finished
  /// (whether just now or earlier) more than [`ARCHIVE_GRACE`] ago.
  /// Intended to run on a periodic background task.
  pub async fn sweep( &self )
  {
    let now = chrono::Utc::now();

    let leaked : Vec< String > = self.requests.read().iter()
      .filter_map( | ( id, entry ) |
      {
        let guard = entry.read();
        let leaked_long_enough = guard.status == RequestStatus::InFlight
          && now.signed_duration_since( guard.start_time ).to_std().unwrap_or( Duration::ZERO ) >= self.max_age;
        leaked_long_enough.then( || id.clone() )
      } )
      .collect();

    for id in &leaked
    {
      if let Some( entry ) = self.requests.read().get( id ).cloned()
      {
        entry.write().finish( RequestStatus::Timeout, Some( "hot_pool_max_age_exceeded".to_string() ) );
      }
    }

    let stale : Vec< String > = self.requests.read().iter()
      .filter_map( | ( id, entry ) |
      {
        let guard = entry.read();
        let finished_long_enough_ago = guard.end_time
          .is_some_and( | end | now.signed_duration_since( end ).to_std().unwrap_or( Duration::ZERO ) >= ARCHIVE_GRACE );
        finished_long_enough_ago.then( || id.clone() )
      } )
      .collect();

    for id in stale
    {
      let Some( entry ) = self.requests.write().remove( &id ) else { continue };
      let request = entry.read().clone();
      let _ = self.archive_tx.send( request ).await;
    }
  }

  /// Run [`Self::sweep`] on `interval` until the pool is dropped or the
  /// task is aborted.
  pub async fn run_background_sweeper( self : Arc< Self >, interval : Duration )
  {
    let mut ticker = tokio::time::interval( interval );
    loop
    {
      ticker.tick().await;
      self.sweep().await;
    }
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  #[ tokio::test ]
  async fn insert_then_update_then_complete_and_archive()
  {
    let ( tx, mut rx ) = mpsc::channel( 8 );
    let pool = HotPool::new( tx, Duration::from_secs( 3600 ) );
    pool.insert( ActiveRequest::new( "r1", "a", "a::a1", false ) );

    let updated = pool.update( "r1", | r | r.model = Some( "claude-x".to_string() ) );
    assert!( updated );
    assert_eq!( pool.get( "r1" ).unwrap().model.as_deref(), Some( "claude-x" ) );

    assert!( pool.complete_and_archive( "r1", RequestStatus::Completed ).await );
    assert!( pool.get( "r1" ).is_none() );

    let archived = rx.recv().await.unwrap();
    assert_eq!( archived.status, RequestStatus::Completed );
  }

  #[ tokio::test ]
  async fn update_on_unknown_request_returns_false()
  {
    let ( tx, _rx ) = mpsc::channel( 8 );
    let pool = HotPool::new( tx, Duration::from_secs( 3600 ) );
    assert!( !pool.update( "missing", | _ | {} ) );
  }

  #[ tokio::test ]
  async fn sweep_leaves_in_flight_requests_alone()
  {
    let ( tx, mut rx ) = mpsc::channel( 8 );
    let pool = HotPool::new( tx, Duration::from_secs( 3600 ) );
    pool.insert( ActiveRequest::new( "r1", "a", "a::a1", false ) );
    pool.sweep().await;
    assert!( pool.get( "r1" ).is_some() );
    assert!( rx.try_recv().is_err() );
  }

  #[ tokio::test ]
  async fn sweep_times_out_a_request_leaked_past_max_age()
  {
    let ( tx, mut rx ) = mpsc::channel( 8 );
    let pool = HotPool::new( tx, Duration::from_secs( 1 ) );
    pool.insert( ActiveRequest::new( "r1", "a", "a::a1", false ) );
    pool.update( "r1", | r | r.start_time = chrono::Utc::now() - chrono::Duration::hours( 2 ) );

    pool.sweep().await;
    let leaked = pool.get( "r1" ).expect( "only the terminal grace window removes it from the pool" );
    assert_eq!( leaked.status, RequestStatus::Timeout );
    assert_eq!( leaked.failure_reason.as_deref(), Some( "hot_pool_max_age_exceeded" ) );
    assert!( rx.try_recv().is_err(), "still inside ARCHIVE_GRACE, not archived yet" );
  }
}
