//! Crate-wide error type and the `ErrorKind` classification used by the
//! retry pipeline.
//!
//! Mirrors `api_claude::error::core::AnthropicError`'s hand-rolled
//! `Display` + `core::error::Error` style rather than a
//! `thiserror`-derived enum.

use std::fmt;

/// Crate-wide result alias.
pub type ProxyResult< T > = Result< T, ProxyError >;

/// Errors surfaced by the proxy core's public API.
#[ derive( Debug, Clone ) ]
pub enum ProxyError
{
  /// An endpoint or channel identity already exists.
  Duplicate( String ),
  /// No endpoint or channel matches the given key.
  NotFound( String ),
  /// A `channel::name` identity was malformed or ambiguous.
  InvalidIdentity( String ),
  /// A token/api-key index was out of range for the target list.
  OutOfRange
  {
    /// Index that was requested.
    index : usize,
    /// Length of the list it was requested against.
    len : usize,
  },
  /// No channel is eligible for activation right now.
  NoEligibleChannel,
  /// `manual_activate` was asked to force-activate a channel that already
  /// has at least one healthy endpoint.
  ForceNotAllowed( String ),
  /// A request could not find any usable endpoint and was not suspended.
  NoHealthyEndpoints,
  /// A suspended request's wait ended without success.
  Suspension( SuspensionOutcome ),
  /// An upstream attempt failed; carries the classification used by the
  /// retry pipeline.
  Upstream
  {
    /// Error classification.
    kind : ErrorKind,
    /// Human-readable detail, preserved for forensic queries
    /// (`last_failure_reason`).
    detail : String,
  },
  /// The durable store rejected or failed a write/read.
  Store( String ),
  /// A malformed SSE payload.
  Parsing( String ),
  /// A client cancelled the request.
  Cancelled( String ),
  /// Something that should not happen structurally did.
  Internal( String ),
}

impl fmt::Display for ProxyError
{
  fn fmt( &self, f : &mut fmt::Formatter< '_ > ) -> fmt::Result
  {
    match self
    {
      ProxyError::Duplicate( key ) => write!( f, "duplicate identity: {key}" ),
      ProxyError::NotFound( key ) => write!( f, "not found: {key}" ),
      ProxyError::InvalidIdentity( key ) => write!( f, "invalid identity: {key}" ),
      ProxyError::OutOfRange { index, len } =>
        write!( f, "index {index} out of range for list of length {len}" ),
      ProxyError::NoEligibleChannel => write!( f, "no channel is eligible for activation" ),
      ProxyError::ForceNotAllowed( name ) =>
        write!( f, "channel '{name}' has healthy endpoints; force activation refused" ),
      ProxyError::NoHealthyEndpoints => write!( f, "no healthy endpoints available" ),
      ProxyError::Suspension( outcome ) => write!( f, "suspended request ended: {outcome:?}" ),
      ProxyError::Upstream { kind, detail } => write!( f, "upstream error ({kind:?}): {detail}" ),
      ProxyError::Store( msg ) => write!( f, "store error: {msg}" ),
      ProxyError::Parsing( msg ) => write!( f, "parse error: {msg}" ),
      ProxyError::Cancelled( reason ) => write!( f, "cancelled: {reason}" ),
      ProxyError::Internal( msg ) => write!( f, "internal error: {msg}" ),
    }
  }
}

impl core::error::Error for ProxyError {}

impl From< sqlx::Error > for ProxyError
{
  fn from( err : sqlx::Error ) -> Self
  {
    ProxyError::Store( err.to_string() )
  }
}

/// Outcome of a request that spent time in the `SuspensionQueue`.
#[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
pub enum SuspensionOutcome
{
  /// A channel became usable and the request resumed.
  Success,
  /// The suspension timeout elapsed with no usable channel.
  Timeout,
  /// The client cancelled while suspended.
  Cancelled,
}

/// Classification of an upstream failure, independent of its concrete
/// transport representation. Drives `RetryPolicy` decisions.
#[ derive( Debug, Clone, Copy, PartialEq, Eq, Hash ) ]
pub enum ErrorKind
{
  /// TCP/TLS connect failure; no bytes were sent.
  Network,
  /// The connection attempt itself timed out.
  ConnectionTimeout,
  /// The connection dropped before any response headers arrived.
  EofBeforeHeaders,
  /// The stream was cut off mid-body after headers (and possibly bytes)
  /// were already delivered to the client.
  EofMidStream,
  /// The response did not complete within the configured timeout, after
  /// headers were received.
  ResponseTimeout,
  /// Upstream returned a 5xx.
  Http5xx,
  /// Upstream returned a 4xx classified as an authentication failure.
  Http4xxAuth,
  /// Upstream returned 429.
  RateLimited,
  /// The SSE body could not be parsed.
  StreamParse,
  /// The client disconnected or cancelled.
  ClientCancel,
  /// No endpoint in the active channel was eligible to try.
  NoHealthyEndpoints,
}

impl ErrorKind
{
  /// Whether this class of error is retryable on the *same* endpoint.
  #[ must_use ]
  pub fn is_retryable( self ) -> bool
  {
    matches!(
      self,
      ErrorKind::Network
      | ErrorKind::ConnectionTimeout
      | ErrorKind::EofBeforeHeaders
      | ErrorKind::Http5xx
      | ErrorKind::RateLimited
    )
  }

  /// Whether exhausting retries on this class should trigger a switch to
  /// the next candidate endpoint in the active channel.
  #[ must_use ]
  pub fn should_switch( self ) -> bool
  {
    !matches!( self, ErrorKind::ClientCancel )
  }

  /// Whether a response body may already have been billed for partially
  /// (i.e. we must not blindly re-attempt without accounting for it).
  #[ must_use ]
  pub fn may_be_billed( self ) -> bool
  {
    matches!( self, ErrorKind::EofMidStream | ErrorKind::ResponseTimeout )
  }

  /// Whether this error uses the longer rate-limit backoff floor and a
  /// capped global attempt budget.
  #[ must_use ]
  pub fn is_rate_limit_class( self ) -> bool
  {
    matches!( self, ErrorKind::RateLimited )
  }

  /// The static string this error class archives under `failure_reason`.
  #[ must_use ]
  pub fn failure_reason( self ) -> &'static str
  {
    match self
    {
      ErrorKind::Network => "network",
      ErrorKind::ConnectionTimeout => "connection_timeout",
      ErrorKind::EofBeforeHeaders => "eof_before_headers",
      ErrorKind::EofMidStream => "eof_mid_stream",
      ErrorKind::ResponseTimeout => "response_timeout",
      ErrorKind::Http5xx => "http_5xx",
      ErrorKind::Http4xxAuth => "http_4xx_auth",
      ErrorKind::RateLimited => "rate_limited",
      ErrorKind::StreamParse => "stream_parse",
      ErrorKind::ClientCancel => "client_cancel",
      ErrorKind::NoHealthyEndpoints => "no_healthy_endpoints",
    }
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  #[ test ]
  fn network_errors_are_retryable_and_switchable()
  {
    assert!( ErrorKind::Network.is_retryable() );
    assert!( ErrorKind::Network.should_switch() );
  }

  #[ test ]
  fn auth_errors_are_not_retryable_but_switch()
  {
    assert!( !ErrorKind::Http4xxAuth.is_retryable() );
    assert!( ErrorKind::Http4xxAuth.should_switch() );
  }

  #[ test ]
  fn client_cancel_never_switches()
  {
    assert!( !ErrorKind::ClientCancel.should_switch() );
  }

  #[ test ]
  fn eof_mid_stream_may_be_billed_but_not_retried()
  {
    assert!( !ErrorKind::EofMidStream.is_retryable() );
    assert!( ErrorKind::EofMidStream.may_be_billed() );
  }

  #[ test ]
  fn display_includes_detail()
  {
    let err = ProxyError::Upstream { kind : ErrorKind::Http5xx, detail : "boom".into() };
    assert!( err.to_string().contains( "boom" ) );
  }

  #[ test ]
  fn failure_reason_is_stable_per_variant()
  {
    assert_eq!( ErrorKind::Http5xx.failure_reason(), "http_5xx" );
    assert_eq!( ErrorKind::ClientCancel.failure_reason(), "client_cancel" );
    assert_eq!( ErrorKind::NoHealthyEndpoints.failure_reason(), "no_healthy_endpoints" );
  }
}
