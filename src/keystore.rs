//! Per-endpoint active token/api-key index.
//!
//! Grounded on `api_claude::secret::Secret`'s load/validate idiom,
//! generalized from a single process-wide key to a per-endpoint rotation
//! index. Map-level mutation (add/remove/rename) takes the map's own
//! `RwLock`; per-entry index changes take only that entry's `RwLock`, so
//! concurrent rotations on different endpoints never contend.

use std::{ collections::HashMap, sync::Arc, time::Instant };
use parking_lot::RwLock;

use crate::error::{ ProxyError, ProxyResult };

/// Rotation state for one endpoint's tokens and api-keys.
#[ derive( Debug, Clone ) ]
pub struct KeyEntry
{
  /// Index into the endpoint's `tokens` list currently in use.
  pub active_token_index : usize,
  /// Index into the endpoint's `api_keys` list currently in use.
  pub active_api_key_index : usize,
  /// Number of tokens configured for this endpoint.
  pub token_count : usize,
  /// Number of api-keys configured for this endpoint.
  pub api_key_count : usize,
  /// When either active index last changed.
  pub last_switch_time : Instant,
}

impl KeyEntry
{
  fn new( token_count : usize, api_key_count : usize ) -> Self
  {
    Self
    {
      active_token_index : 0,
      active_api_key_index : 0,
      token_count,
      api_key_count,
      last_switch_time : Instant::now(),
    }
  }
}

/// Map of endpoint key (`channel::name`) to its rotation state.
#[ derive( Debug, Default ) ]
pub struct KeyStore
{
  entries : RwLock< HashMap< String, Arc< RwLock< KeyEntry > > > >,
}

impl KeyStore
{
  /// Create an empty key store.
  #[ must_use ]
  pub fn new() -> Self
  {
    Self { entries : RwLock::new( HashMap::new() ) }
  }

  /// Register or reset an endpoint's rotation state.
  pub fn init( &self, key : &str, token_count : usize, api_key_count : usize )
  {
    self.entries.write().insert( key.to_string(), Arc::new( RwLock::new( KeyEntry::new( token_count, api_key_count ) ) ) );
  }

  fn entry( &self, key : &str ) -> ProxyResult< Arc< RwLock< KeyEntry > > >
  {
    self.entries.read().get( key ).cloned()
      .ok_or_else( || ProxyError::NotFound( key.to_string() ) )
  }

  /// Snapshot the current rotation state for `key`.
  pub fn get( &self, key : &str ) -> ProxyResult< KeyEntry >
  {
    Ok( self.entry( key )?.read().clone() )
  }

  /// Switch the active token index.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if the key is unknown, `ProxyError::OutOfRange`
  /// if `index >= token_count`.
  pub fn switch_token( &self, key : &str, index : usize ) -> ProxyResult< () >
  {
    let entry = self.entry( key )?;
    let mut guard = entry.write();
    if index >= guard.token_count
    {
      return Err( ProxyError::OutOfRange { index, len : guard.token_count } );
    }
    guard.active_token_index = index;
    guard.last_switch_time = Instant::now();
    Ok( () )
  }

  /// Switch the active api-key index.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if the key is unknown, `ProxyError::OutOfRange`
  /// if `index >= api_key_count`.
  pub fn switch_api_key( &self, key : &str, index : usize ) -> ProxyResult< () >
  {
    let entry = self.entry( key )?;
    let mut guard = entry.write();
    if index >= guard.api_key_count
    {
      return Err( ProxyError::OutOfRange { index, len : guard.api_key_count } );
    }
    guard.active_api_key_index = index;
    guard.last_switch_time = Instant::now();
    Ok( () )
  }

  /// Update the known token/api-key counts for an endpoint (e.g. after a
  /// config update). Active indices that fall outside the new range reset
  /// to 0: removing the active index clamps it back to 0.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if the key is unknown.
  pub fn update_counts( &self, key : &str, token_count : usize, api_key_count : usize ) -> ProxyResult< () >
  {
    let entry = self.entry( key )?;
    let mut guard = entry.write();
    guard.token_count = token_count;
    guard.api_key_count = api_key_count;
    if guard.active_token_index >= token_count
    {
      guard.active_token_index = 0;
    }
    if guard.active_api_key_index >= api_key_count
    {
      guard.active_api_key_index = 0;
    }
    Ok( () )
  }

  /// Atomically move an entry from `old_key` to `new_key` (identity
  /// change on endpoint update).
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if `old_key` is unknown, `ProxyError::Duplicate`
  /// if `new_key` already exists and differs from `old_key`.
  pub fn rename_key( &self, old_key : &str, new_key : &str ) -> ProxyResult< () >
  {
    if old_key == new_key { return Ok( () ); }
    let mut map = self.entries.write();
    if map.contains_key( new_key )
    {
      return Err( ProxyError::Duplicate( new_key.to_string() ) );
    }
    let entry = map.remove( old_key ).ok_or_else( || ProxyError::NotFound( old_key.to_string() ) )?;
    map.insert( new_key.to_string(), entry );
    Ok( () )
  }

  /// Remove an endpoint's rotation state entirely.
  pub fn remove( &self, key : &str )
  {
    self.entries.write().remove( key );
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  #[ test ]
  fn switch_token_out_of_range_returns_out_of_range()
  {
    let store = KeyStore::new();
    store.init( "a::a1", 2, 0 );
    assert!( matches!( store.switch_token( "a::a1", 2 ), Err( ProxyError::OutOfRange { index : 2, len : 2 } ) ) );
    assert!( store.switch_token( "a::a1", 1 ).is_ok() );
  }

  #[ test ]
  fn update_counts_clamps_active_index_out_of_range_to_zero()
  {
    let store = KeyStore::new();
    store.init( "a::a1", 3, 0 );
    store.switch_token( "a::a1", 2 ).unwrap();
    store.update_counts( "a::a1", 1, 0 ).unwrap();
    assert_eq!( store.get( "a::a1" ).unwrap().active_token_index, 0 );
  }

  #[ test ]
  fn rename_key_moves_entry_atomically()
  {
    let store = KeyStore::new();
    store.init( "a::a1", 2, 0 );
    store.switch_token( "a::a1", 1 ).unwrap();
    store.rename_key( "a::a1", "a::renamed" ).unwrap();
    assert!( store.get( "a::a1" ).is_err() );
    assert_eq!( store.get( "a::renamed" ).unwrap().active_token_index, 1 );
  }

  #[ test ]
  fn rename_key_rejects_collision()
  {
    let store = KeyStore::new();
    store.init( "a::a1", 1, 0 );
    store.init( "a::a2", 1, 0 );
    assert!( matches!( store.rename_key( "a::a1", "a::a2" ), Err( ProxyError::Duplicate( _ ) ) ) );
  }
}
