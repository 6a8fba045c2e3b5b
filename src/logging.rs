//! Structured logging helpers built on `tracing`.
//!
//! Grounded on `api_ollama::logging` (`LoggingConfig`, `RequestContext`),
//! but always compiled in: observability is ambient infrastructure for a
//! proxy, not an optional client-library capability.

use std::time::Instant;

/// Per-request correlation context threaded through the proxy's tracing
/// spans.
#[ derive( Debug, Clone ) ]
pub struct RequestContext
{
  /// Opaque request identifier, shared with `ActiveRequest::request_id`.
  pub request_id : String,
  /// Model name, once known.
  pub model : Option< String >,
  /// `true` for streaming requests.
  pub is_streaming : bool,
  /// When the request was accepted.
  pub started_at : Instant,
}

impl RequestContext
{
  /// Start a new correlation context for an incoming request.
  #[ must_use ]
  pub fn new( request_id : impl Into< String >, is_streaming : bool ) -> Self
  {
    Self
    {
      request_id : request_id.into(),
      model : None,
      is_streaming,
      started_at : Instant::now(),
    }
  }

  /// Open the top-level tracing span for a request. Attempts, retries, and
  /// failover steps should nest inside it via `tracing::info_span!`.
  pub fn span( &self ) -> tracing::Span
  {
    tracing::info_span!(
      "request",
      request_id = %self.request_id,
      is_streaming = self.is_streaming,
      model = tracing::field::Empty,
    )
  }
}

/// Emit a structured event for a channel activation change.
pub fn log_channel_activated( previous : Option< &str >, next : &str )
{
  tracing::info!( previous = previous.unwrap_or( "<none>" ), next, "channel activated" );
}

/// Emit a structured event when failover moves traffic off a channel.
pub fn log_failover_triggered( old : &str, new : &str, reason : &str )
{
  tracing::warn!( old_channel = old, new_channel = new, reason, "failover triggered" );
}

/// Emit a structured event for an endpoint health transition.
pub fn log_health_transition( endpoint_key : &str, was_healthy : bool, is_healthy : bool, latency_ms : u64 )
{
  if was_healthy != is_healthy
  {
    tracing::info!( endpoint = endpoint_key, was_healthy, is_healthy, latency_ms, "endpoint health changed" );
  }
  else
  {
    tracing::debug!( endpoint = endpoint_key, is_healthy, latency_ms, "endpoint probed" );
  }
}

/// Emit a structured event for an archive batch outcome.
pub fn log_archive_batch( batch_size : usize, succeeded : usize, failed : usize )
{
  if failed > 0
  {
    tracing::error!( batch_size, succeeded, failed, "archive batch completed with failures" );
  }
  else
  {
    tracing::debug!( batch_size, succeeded, "archive batch flushed" );
  }
}
