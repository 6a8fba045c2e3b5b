//! Endpoint inventory and credential resolution.
//!
//! Grounded on the `keystore.rs` map-level/per-entry lock split: adding,
//! removing, or renaming an endpoint takes the map's own `RwLock`;
//! reading or mutating one endpoint's status never does.

use std::{ collections::HashMap, sync::Arc };
use parking_lot::RwLock;

use crate::{
  config::EndpointConfig,
  endpoint::{ Endpoint, EndpointSnapshot },
  error::{ ProxyError, ProxyResult },
  keystore::KeyStore,
  secret::Credential,
};

/// Owns the flat endpoint inventory (channel membership is derived from
/// it by `ChannelManager::rebuild`), plus the token/api-key rotation
/// state in `KeyStore`.
#[ derive( Debug, Default ) ]
pub struct EndpointManager
{
  endpoints : RwLock< HashMap< String, Arc< Endpoint > > >,
  keys : KeyStore,
}

impl EndpointManager
{
  /// Build an empty manager.
  #[ must_use ]
  pub fn new() -> Self
  {
    Self { endpoints : RwLock::new( HashMap::new() ), keys : KeyStore::new() }
  }

  /// Add a new endpoint from config.
  ///
  /// # Errors
  ///
  /// `ProxyError::Duplicate` if its `channel::name` identity already
  /// exists.
  pub fn add( &self, config : EndpointConfig ) -> ProxyResult< () >
  {
    let identity = config.identity();
    let mut map = self.endpoints.write();
    if map.contains_key( &identity )
    {
      return Err( ProxyError::Duplicate( identity ) );
    }
    let token_count = if config.tokens.is_empty() { usize::from( config.token.is_some() ) } else { config.tokens.len() };
    let api_key_count = if config.api_keys.is_empty() { usize::from( config.api_key.is_some() ) } else { config.api_keys.len() };
    self.keys.init( &identity, token_count, api_key_count );
    map.insert( identity, Arc::new( Endpoint::new( config ) ) );
    Ok( () )
  }

  /// Remove an endpoint entirely.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if unknown.
  pub fn remove( &self, identity : &str ) -> ProxyResult< () >
  {
    let removed = self.endpoints.write().remove( identity );
    if removed.is_none()
    {
      return Err( ProxyError::NotFound( identity.to_string() ) );
    }
    self.keys.remove( identity );
    Ok( () )
  }

  /// Replace an endpoint's config in place, renaming its map entry and
  /// `KeyStore` entry if the identity changed, and re-synchronizing the
  /// known token/api-key counts.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if `identity` is unknown, `ProxyError::Duplicate`
  /// if the new identity collides with an existing different endpoint.
  pub fn update( &self, identity : &str, config : EndpointConfig ) -> ProxyResult< () >
  {
    let new_identity = config.identity();
    let mut map = self.endpoints.write();
    let endpoint = map.get( identity ).cloned().ok_or_else( || ProxyError::NotFound( identity.to_string() ) )?;

    if new_identity != identity && map.contains_key( &new_identity )
    {
      return Err( ProxyError::Duplicate( new_identity ) );
    }

    let token_count = if config.tokens.is_empty() { usize::from( config.token.is_some() ) } else { config.tokens.len() };
    let api_key_count = if config.api_keys.is_empty() { usize::from( config.api_key.is_some() ) } else { config.api_keys.len() };

    endpoint.replace_config( config );

    if new_identity != identity
    {
      map.remove( identity );
      map.insert( new_identity.clone(), endpoint );
      self.keys.rename_key( identity, &new_identity )?;
    }
    self.keys.update_counts( &new_identity, token_count, api_key_count )?;
    Ok( () )
  }

  /// Look up one endpoint.
  #[ must_use ]
  pub fn get( &self, identity : &str ) -> Option< Arc< Endpoint > >
  {
    self.endpoints.read().get( identity ).cloned()
  }

  /// All endpoints, in no particular order.
  #[ must_use ]
  pub fn all( &self ) -> Vec< Arc< Endpoint > >
  {
    self.endpoints.read().values().cloned().collect()
  }

  /// Snapshot every endpoint.
  #[ must_use ]
  pub fn snapshots( &self ) -> Vec< EndpointSnapshot >
  {
    self.endpoints.read().values().map( | ep | ep.snapshot() ).collect()
  }

  /// Resolve the currently-active credential for `identity`: the single
  /// configured token/api-key if there is only one, or the entry at the
  /// `KeyStore`'s active rotation index. The resolution chain prefers a
  /// token over an api-key, and a single configured value over a
  /// rotation list.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if `identity` is unknown.
  pub fn resolve_credential( &self, identity : &str ) -> ProxyResult< Option< Credential > >
  {
    let endpoint = self.get( identity ).ok_or_else( || ProxyError::NotFound( identity.to_string() ) )?;

    if let Some( token ) = endpoint.single_token()
    {
      return Ok( Some( Credential::new( token ) ) );
    }
    let tokens = endpoint.tokens();
    if !tokens.is_empty()
    {
      let state = self.keys.get( identity )?;
      let index = state.active_token_index.min( tokens.len() - 1 );
      return Ok( Some( Credential::new( tokens[ index ].clone() ) ) );
    }

    if let Some( api_key ) = endpoint.single_api_key()
    {
      return Ok( Some( Credential::new( api_key ) ) );
    }
    let api_keys = endpoint.api_keys();
    if !api_keys.is_empty()
    {
      let state = self.keys.get( identity )?;
      let index = state.active_api_key_index.min( api_keys.len() - 1 );
      return Ok( Some( Credential::new( api_keys[ index ].clone() ) ) );
    }

    Ok( None )
  }

  /// Rotate `identity`'s active token index for per-request rotation.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if unknown, `ProxyError::OutOfRange` if out of
  /// bounds.
  pub fn switch_token( &self, identity : &str, index : usize ) -> ProxyResult< () >
  {
    self.keys.switch_token( identity, index )
  }

  /// Rotate `identity`'s active api-key index.
  ///
  /// # Errors
  ///
  /// `ProxyError::NotFound` if unknown, `ProxyError::OutOfRange` if out of
  /// bounds.
  pub fn switch_api_key( &self, identity : &str, index : usize ) -> ProxyResult< () >
  {
    self.keys.switch_api_key( identity, index )
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;
  use std::{ collections::HashMap as StdHashMap, time::Duration };

  fn config( name : &str ) -> EndpointConfig
  {
    EndpointConfig
    {
      channel : "a".to_string(),
      name : name.to_string(),
      url : "https://example.invalid".to_string(),
      priority : 10,
      timeout : Duration::from_secs( 30 ),
      headers : StdHashMap::new(),
      cooldown : None,
      failover_enabled : true,
      supports_count_tokens : false,
      enabled : true,
      token : None,
      tokens : vec![ "t0".to_string(), "t1".to_string() ],
      api_key : None,
      api_keys : Vec::new(),
      cost_multiplier : 1.0,
      category_multipliers : crate::cost::CategoryMultipliers::default(),
    }
  }

  #[ test ]
  fn add_duplicate_identity_is_rejected()
  {
    let manager = EndpointManager::new();
    manager.add( config( "a1" ) ).unwrap();
    assert!( matches!( manager.add( config( "a1" ) ), Err( ProxyError::Duplicate( _ ) ) ) );
  }

  #[ test ]
  fn resolve_credential_uses_active_rotation_index()
  {
    let manager = EndpointManager::new();
    manager.add( config( "a1" ) ).unwrap();
    manager.switch_token( "a::a1", 1 ).unwrap();
    let credential = manager.resolve_credential( "a::a1" ).unwrap().unwrap();
    assert_eq!( credential.as_str(), "t1" );
  }

  #[ test ]
  fn update_renaming_identity_moves_key_store_entry()
  {
    let manager = EndpointManager::new();
    manager.add( config( "a1" ) ).unwrap();
    manager.switch_token( "a::a1", 1 ).unwrap();

    let mut renamed = config( "a2" );
    renamed.tokens = vec![ "t0".to_string(), "t1".to_string() ];
    manager.update( "a::a1", renamed ).unwrap();

    assert!( manager.get( "a::a1" ).is_none() );
    assert!( manager.get( "a::a2" ).is_some() );
    assert_eq!( manager.resolve_credential( "a::a2" ).unwrap().unwrap().as_str(), "t1" );
  }
}
