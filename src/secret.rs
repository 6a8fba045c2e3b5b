//! Credential redaction for resolved upstream tokens and api-keys.
//!
//! Grounded on `api_claude::secret::Secret`'s `Debug` redaction, narrowed
//! to a plain newtype since this crate resolves *per-endpoint* credentials
//! out of configuration rather than loading a single process-wide key from
//! the environment.

use std::fmt;

/// A resolved credential (bearer token or api-key) ready to be placed in
/// an `Authorization` header. `Debug` never prints the value.
#[ derive( Clone, PartialEq, Eq ) ]
pub struct Credential( String );

impl Credential
{
  /// Wrap a raw credential string.
  #[ must_use ]
  pub fn new( value : impl Into< String > ) -> Self
  {
    Self( value.into() )
  }

  /// Borrow the raw value, for building the `Authorization` header.
  #[ must_use ]
  pub fn as_str( &self ) -> &str
  {
    &self.0
  }

  /// Render as a bearer `Authorization` header value.
  #[ must_use ]
  pub fn bearer_header( &self ) -> String
  {
    format!( "Bearer {}", self.0 )
  }
}

impl fmt::Debug for Credential
{
  fn fmt( &self, f : &mut fmt::Formatter< '_ > ) -> fmt::Result
  {
    f.debug_tuple( "Credential" ).field( &"<redacted>" ).finish()
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  #[ test ]
  fn debug_never_prints_secret()
  {
    let cred = Credential::new( "sk-super-secret" );
    assert!( !format!( "{cred:?}" ).contains( "sk-super-secret" ) );
  }

  #[ test ]
  fn bearer_header_format()
  {
    let cred = Credential::new( "tok" );
    assert_eq!( cred.bearer_header(), "Bearer tok" );
  }
}
