//! Upstream HTTP transport and error classification.
//!
//! Grounded on `api_claude::client::implementation::Client`, which wraps
//! a single `reqwest::Client`. Generalized behind a `Transport` trait so
//! the retry/failover pipeline can be exercised against a `MockTransport`
//! without real sockets.

use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;

use crate::{ error::ErrorKind, secret::Credential };

/// An outbound request to one endpoint.
#[ derive( Debug, Clone ) ]
pub struct OutboundRequest
{
  /// Full URL (endpoint base + path).
  pub url : String,
  /// Raw JSON body forwarded from the client.
  pub body : Bytes,
  /// Resolved bearer credential, if any.
  pub authorization : Option< Credential >,
  /// Extra headers configured on the endpoint.
  pub headers : Vec< ( String, String ) >,
  /// Per-request timeout.
  pub timeout : Duration,
  /// Whether the client asked for a streamed (SSE) response.
  pub streaming : bool,
}

/// Outcome of one attempt against one endpoint.
#[ derive( Debug ) ]
pub struct UpstreamResponse
{
  /// HTTP status code.
  pub status : u16,
  /// Body bytes (complete for non-streaming; the first chunk for
  /// streaming callers that read incrementally via `body_stream`).
  pub body : Bytes,
  /// Time to first byte.
  pub latency : Duration,
}

/// Abstracts the upstream HTTP client so the retry/failover pipeline is
/// testable without real sockets.
#[ async_trait ]
pub trait Transport : Send + Sync
{
  /// Perform one request, classifying any failure into an `ErrorKind`
  /// that the retry policy's retryability table is keyed off of.
  async fn send( &self, request : OutboundRequest ) -> Result< UpstreamResponse, ErrorKind >;

  /// Probe `url` for liveness, returning the observed latency on success.
  async fn probe( &self, url : &str, timeout : Duration, authorization : Option< &Credential > ) -> Result< Duration, ErrorKind >;
}

/// `reqwest`-backed transport used in production.
#[ derive( Debug, Clone ) ]
pub struct HttpTransport
{
  client : reqwest::Client,
}

impl HttpTransport
{
  /// Build a transport from an already-configured `reqwest::Client`.
  #[ must_use ]
  pub fn new( client : reqwest::Client ) -> Self
  {
    Self { client }
  }

  fn classify( error : &reqwest::Error ) -> ErrorKind
  {
    if error.is_timeout() { ErrorKind::ConnectionTimeout }
    else if error.is_connect() { ErrorKind::Network }
    else if error.is_body() || error.is_decode() { ErrorKind::EofMidStream }
    else { ErrorKind::Network }
  }

  fn classify_status( status : u16 ) -> Option< ErrorKind >
  {
    match status
    {
      401 | 403 => Some( ErrorKind::Http4xxAuth ),
      429 => Some( ErrorKind::RateLimited ),
      500 ..= 599 => Some( ErrorKind::Http5xx ),
      _ => None,
    }
  }
}

#[ async_trait ]
impl Transport for HttpTransport
{
  async fn send( &self, request : OutboundRequest ) -> Result< UpstreamResponse, ErrorKind >
  {
    let started = std::time::Instant::now();
    let mut builder = self.client.post( &request.url ).timeout( request.timeout ).body( request.body );
    if let Some( auth ) = &request.authorization
    {
      builder = builder.header( "authorization", auth.bearer_header() );
    }
    for ( name, value ) in &request.headers
    {
      builder = builder.header( name, value );
    }

    let response = builder.send().await.map_err( | e | Self::classify( &e ) )?;
    let status = response.status().as_u16();
    let latency = started.elapsed();

    if let Some( kind ) = Self::classify_status( status )
    {
      return Err( kind );
    }

    let body = response.bytes().await.map_err( | e | Self::classify( &e ) )?;
    Ok( UpstreamResponse { status, body, latency } )
  }

  async fn probe( &self, url : &str, timeout : Duration, authorization : Option< &Credential > ) -> Result< Duration, ErrorKind >
  {
    let started = std::time::Instant::now();
    let mut builder = self.client.get( url ).timeout( timeout );
    if let Some( auth ) = authorization
    {
      builder = builder.header( "authorization", auth.bearer_header() );
    }
    let response = builder.send().await.map_err( | e | Self::classify( &e ) )?;
    let status = response.status().as_u16();
    if let Some( kind ) = Self::classify_status( status )
    {
      return Err( kind );
    }
    Ok( started.elapsed() )
  }
}

#[ cfg( any( test, feature = "test-support" ) ) ]
pub mod mock
{
  //! A scripted `Transport` for exercising retry/failover logic without
  //! the network.
  use super::{ Transport, OutboundRequest, UpstreamResponse };
  use crate::error::ErrorKind;
  use async_trait::async_trait;
  use parking_lot::Mutex;
  use std::{ collections::VecDeque, time::Duration };

  /// One scripted outcome for `MockTransport`.
  #[ derive( Debug, Clone ) ]
  pub enum Scripted
  {
    /// Succeed with this body and latency.
    Ok( bytes::Bytes, Duration ),
    /// Fail with this classified error.
    Err( ErrorKind ),
  }

  /// Replays a fixed queue of outcomes, one per call, cycling the last
  /// entry once exhausted.
  #[ derive( Debug, Default ) ]
  pub struct MockTransport
  {
    send_script : Mutex< VecDeque< Scripted > >,
    probe_script : Mutex< VecDeque< Scripted > >,
  }

  impl MockTransport
  {
    /// Build a transport that replays `send_script` for `send` calls.
    #[ must_use ]
    pub fn new( send_script : Vec< Scripted > ) -> Self
    {
      Self { send_script : Mutex::new( send_script.into() ), probe_script : Mutex::new( VecDeque::new() ) }
    }

    /// Also script `probe` outcomes.
    #[ must_use ]
    pub fn with_probes( self, probe_script : Vec< Scripted > ) -> Self
    {
      Self { send_script : self.send_script, probe_script : Mutex::new( probe_script.into() ) }
    }
  }

  #[ async_trait ]
  impl Transport for MockTransport
  {
    async fn send( &self, _request : OutboundRequest ) -> Result< UpstreamResponse, ErrorKind >
    {
      let next = { let mut guard = self.send_script.lock(); if guard.len() > 1 { guard.pop_front() } else { guard.front().cloned() } };
      match next
      {
        Some( Scripted::Ok( body, latency ) ) => Ok( UpstreamResponse { status : 200, body, latency } ),
        Some( Scripted::Err( kind ) ) => Err( kind ),
        None => Err( ErrorKind::Network ),
      }
    }

    async fn probe( &self, _url : &str, _timeout : Duration, _authorization : Option< &crate::secret::Credential > ) -> Result< Duration, ErrorKind >
    {
      let next = { let mut guard = self.probe_script.lock(); if guard.len() > 1 { guard.pop_front() } else { guard.front().cloned() } };
      match next
      {
        Some( Scripted::Ok( _, latency ) ) => Ok( latency ),
        Some( Scripted::Err( kind ) ) => Err( kind ),
        None => Ok( Duration::from_millis( 1 ) ),
      }
    }
  }
}
