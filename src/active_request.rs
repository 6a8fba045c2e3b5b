//! The identity and lifecycle invariants of one in-flight proxied
//! request.
//!
//! Grounded on `RequestContext` (`logging.rs`) for the identity/timing
//! shape, extended with the token/cost bookkeeping the hot pool and
//! archive batcher need once the request completes.

use chrono::{ DateTime, Utc };

use crate::stream_parser::UsagePartial;

/// Why an `ActiveRequest` stopped being active.
#[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
pub enum RequestStatus
{
  /// Still streaming or awaiting a non-streaming response.
  InFlight,
  /// Completed with a proper `message_stop` / final response.
  Completed,
  /// The connection dropped before completion; `usage` may still reflect
  /// real, billable token counts.
  Truncated,
  /// Failed with no usable partial usage at all.
  Failed,
  /// The client disconnected or explicitly cancelled the request.
  Cancelled,
  /// Evicted by the hot pool's max-age sweep; left in-flight by a bug or
  /// a crash rather than by any observed terminal event.
  Timeout,
}

/// One request's identity, timing, and accumulated usage, tracked from
/// acceptance through archival.
#[ derive( Debug, Clone ) ]
pub struct ActiveRequest
{
  /// Opaque, globally-unique request id.
  pub request_id : String,
  /// The channel the request was (or is being) served from.
  pub channel_key : String,
  /// The endpoint actually used for the final/only attempt.
  pub endpoint_key : String,
  /// Model name, once known from the upstream response.
  pub model : Option< String >,
  /// `true` for SSE requests.
  pub is_streaming : bool,
  /// When the request was accepted.
  pub start_time : DateTime< Utc >,
  /// When the request stopped being active, once it has.
  pub end_time : Option< DateTime< Utc > >,
  /// Current lifecycle state.
  pub status : RequestStatus,
  /// Usage accumulated so far (merged across SSE events).
  pub usage : UsagePartial,
  /// Why the request failed or was truncated, once it has (a static
  /// `ErrorKind::failure_reason()` string, or a stream completeness
  /// reason for a truncated SSE response).
  pub failure_reason : Option< String >,
  /// Why the request was cancelled, once it has.
  pub cancel_reason : Option< String >,
}

impl ActiveRequest
{
  /// Start tracking a new in-flight request.
  #[ must_use ]
  pub fn new( request_id : impl Into< String >, channel_key : impl Into< String >, endpoint_key : impl Into< String >, is_streaming : bool ) -> Self
  {
    Self
    {
      request_id : request_id.into(),
      channel_key : channel_key.into(),
      endpoint_key : endpoint_key.into(),
      model : None,
      is_streaming,
      start_time : Utc::now(),
      end_time : None,
      status : RequestStatus::InFlight,
      usage : UsagePartial::default(),
      failure_reason : None,
      cancel_reason : None,
    }
  }

  /// Merge newly observed usage into the running total. Usage only ever
  /// grows: token counts are monotonic non-decreasing while in flight.
  pub fn record_usage( &mut self, usage : UsagePartial )
  {
    self.usage.merge( usage );
  }

  /// Mark the request finished with `status`, stamping `end_time` exactly
  /// once. `end_time` is set iff `status != InFlight`. `failure_reason`
  /// is recorded only on a non-clean finish; a `Completed` finish clears
  /// it (the field reflects the terminal outcome, not transient retries).
  pub fn finish( &mut self, status : RequestStatus, failure_reason : Option< String > )
  {
    debug_assert!( status != RequestStatus::InFlight, "finish() must receive a terminal status" );
    self.status = status;
    if status == RequestStatus::Completed { self.failure_reason = None; } else { self.failure_reason = failure_reason; }
    self.end_time.get_or_insert_with( Utc::now );
  }

  /// Convenience for the `ClientCancel` / operator-cancel path: finishes
  /// as `Cancelled`, recording `reason` under `cancel_reason` rather than
  /// `failure_reason`.
  pub fn finish_cancelled( &mut self, reason : impl Into< String > )
  {
    self.cancel_reason = Some( reason.into() );
    self.finish( RequestStatus::Cancelled, None );
  }

  /// Wall-clock duration, `None` while still in flight.
  #[ must_use ]
  pub fn duration_ms( &self ) -> Option< i64 >
  {
    self.end_time.map( | end | ( end - self.start_time ).num_milliseconds() )
  }

  /// Whether this request may carry real, billable usage despite not
  /// completing cleanly (an `EofMidStream`/`ResponseTimeout` failure, or
  /// a client cancellation mid-stream, may still carry billable partial
  /// usage).
  #[ must_use ]
  pub fn may_be_billed( &self ) -> bool
  {
    matches!( self.status, RequestStatus::Completed | RequestStatus::Truncated | RequestStatus::Cancelled )
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  #[ test ]
  fn finish_stamps_end_time_exactly_once()
  {
    let mut request = ActiveRequest::new( "r1", "a", "a::a1", false );
    assert!( request.end_time.is_none() );
    request.finish( RequestStatus::Completed, None );
    let first_end = request.end_time;
    request.finish( RequestStatus::Completed, None );
    assert_eq!( request.end_time, first_end );
  }

  #[ test ]
  fn failed_finish_records_failure_reason()
  {
    let mut request = ActiveRequest::new( "r1", "a", "a::a1", false );
    request.finish( RequestStatus::Failed, Some( "http_5xx".to_string() ) );
    assert_eq!( request.failure_reason.as_deref(), Some( "http_5xx" ) );
  }

  #[ test ]
  fn finish_cancelled_records_cancel_reason_not_failure_reason()
  {
    let mut request = ActiveRequest::new( "r1", "a", "a::a1", true );
    request.finish_cancelled( "client_disconnect" );
    assert_eq!( request.status, RequestStatus::Cancelled );
    assert_eq!( request.cancel_reason.as_deref(), Some( "client_disconnect" ) );
    assert!( request.failure_reason.is_none() );
    assert!( request.may_be_billed() );
  }

  #[ test ]
  fn usage_merge_never_loses_earlier_fields()
  {
    let mut request = ActiveRequest::new( "r1", "a", "a::a1", true );
    request.record_usage( UsagePartial { input_tokens : Some( 10 ), ..UsagePartial::default() } );
    request.record_usage( UsagePartial { output_tokens : Some( 5 ), ..UsagePartial::default() } );
    assert_eq!( request.usage.input_tokens, Some( 10 ) );
    assert_eq!( request.usage.output_tokens, Some( 5 ) );
  }

  #[ test ]
  fn truncated_request_may_be_billed()
  {
    let mut request = ActiveRequest::new( "r1", "a", "a::a1", true );
    request.finish( RequestStatus::Truncated, Some( "incomplete_stream".to_string() ) );
    assert!( request.may_be_billed() );
    assert_eq!( request.failure_reason.as_deref(), Some( "incomplete_stream" ) );
  }
}
