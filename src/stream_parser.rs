//! Incremental Server-Sent-Events parser for streamed chat completions.
//!
//! Grounded on `api_claude::streaming::types::parse_sse_events`'s
//! line-based `event : ` / `data : ` grammar, turned into an incremental
//! state machine that accepts arbitrarily-chunked bytes (a real upstream
//! response is not guaranteed to deliver whole events per `poll_next`)
//! and merges partial usage fields across `message_start` /
//! `message_delta` the way the wire format splits them.

use serde::Deserialize;

/// Token usage as reported across one or more SSE events. Later
/// non-`None` fields overwrite earlier ones; the merge never needs to
/// "undo" a count, since upstreams only ever add detail.
#[ derive( Debug, Clone, Copy, Default, PartialEq, Eq ) ]
pub struct UsagePartial
{
  /// Prompt tokens.
  pub input_tokens : Option< u64 >,
  /// Completion tokens.
  pub output_tokens : Option< u64 >,
  /// Legacy, unsplit cache-creation tokens (pre-tiered wire format).
  pub cache_creation_input_tokens : Option< u64 >,
  /// Tokens written to the 5-minute cache tier.
  pub cache_creation_5m_tokens : Option< u64 >,
  /// Tokens written to the 1-hour cache tier.
  pub cache_creation_1h_tokens : Option< u64 >,
  /// Tokens served from the prompt cache.
  pub cache_read_input_tokens : Option< u64 >,
}

impl UsagePartial
{
  /// Overlay `other` on top of `self`, keeping `self`'s value wherever
  /// `other` is `None`.
  pub fn merge( &mut self, other : UsagePartial )
  {
    if other.input_tokens.is_some() { self.input_tokens = other.input_tokens; }
    if other.output_tokens.is_some() { self.output_tokens = other.output_tokens; }
    if other.cache_creation_input_tokens.is_some() { self.cache_creation_input_tokens = other.cache_creation_input_tokens; }
    if other.cache_creation_5m_tokens.is_some() { self.cache_creation_5m_tokens = other.cache_creation_5m_tokens; }
    if other.cache_creation_1h_tokens.is_some() { self.cache_creation_1h_tokens = other.cache_creation_1h_tokens; }
    if other.cache_read_input_tokens.is_some() { self.cache_read_input_tokens = other.cache_read_input_tokens; }
  }
}

#[ derive( Debug, Default, Deserialize ) ]
struct WireCacheCreation
{
  #[ serde( default ) ]
  ephemeral_5m_input_tokens : Option< u64 >,
  #[ serde( default ) ]
  ephemeral_1h_input_tokens : Option< u64 >,
}

#[ derive( Debug, Default, Deserialize ) ]
struct WireUsage
{
  #[ serde( default ) ]
  input_tokens : Option< u64 >,
  #[ serde( default ) ]
  output_tokens : Option< u64 >,
  #[ serde( default ) ]
  cache_creation_input_tokens : Option< u64 >,
  #[ serde( default ) ]
  cache_creation : Option< WireCacheCreation >,
  #[ serde( default ) ]
  cache_read_input_tokens : Option< u64 >,
}

impl From< WireUsage > for UsagePartial
{
  fn from( w : WireUsage ) -> Self
  {
    let ( cache_5m, cache_1h ) = match w.cache_creation
    {
      Some( split ) => ( split.ephemeral_5m_input_tokens, split.ephemeral_1h_input_tokens ),
      None => ( None, None ),
    };
    Self
    {
      input_tokens : w.input_tokens,
      output_tokens : w.output_tokens,
      cache_creation_input_tokens : w.cache_creation_input_tokens,
      cache_creation_5m_tokens : cache_5m,
      cache_creation_1h_tokens : cache_1h,
      cache_read_input_tokens : w.cache_read_input_tokens,
    }
  }
}

#[ derive( Debug, Deserialize ) ]
struct MessageStartData
{
  message : MessageStartInner,
}

#[ derive( Debug, Deserialize ) ]
struct MessageStartInner
{
  id : String,
  model : String,
  #[ serde( default ) ]
  usage : WireUsage,
}

#[ derive( Debug, Deserialize ) ]
struct MessageDeltaData
{
  #[ serde( default ) ]
  delta : MessageDeltaInner,
  #[ serde( default ) ]
  usage : WireUsage,
}

#[ derive( Debug, Default, Deserialize ) ]
struct MessageDeltaInner
{
  #[ serde( default ) ]
  stop_reason : Option< String >,
}

/// One parsed SSE event, narrowed to the fields the proxy's telemetry
/// actually consumes.
#[ derive( Debug, Clone ) ]
pub enum StreamEvent
{
  /// The message began; carries its id/model and initial (input-side)
  /// usage.
  MessageStart { message_id : String, model : String, usage : UsagePartial },
  /// A delta update, usually carrying the final output usage and stop
  /// reason.
  MessageDelta { usage : UsagePartial, stop_reason : Option< String > },
  /// The message ended; no further content follows.
  MessageStop,
  /// An event type this parser does not need to act on (e.g.
  /// `content_block_delta`), preserved only for completeness tracking.
  Other( String ),
  /// The upstream sent a malformed payload for a recognized event type.
  Malformed { event_type : String, detail : String },
}

/// Whether, and why, a stream's observed events amount to a clean
/// finish. Drives both `RequestStatus` and the archived `failure_reason`.
#[ derive( Debug, Clone, Copy, PartialEq, Eq ) ]
pub enum Completeness
{
  /// Saw `message_start`, a `message_delta` usage, and `message_stop`.
  Complete,
  /// `message_stop` never arrived despite a `message_delta` usage being
  /// seen, or `message_stop` arrived but no `message_delta` usage ever
  /// did (the parser fell back to `message_start`'s seed usage).
  IncompleteStream,
  /// No `message_start` was ever seen, or the stream ended with nothing
  /// beyond whatever `message_start` itself seeded.
  StreamTruncated,
}

impl Completeness
{
  /// The `failure_reason` string this completeness classification
  /// archives under, or `None` for a clean finish.
  #[ must_use ]
  pub fn failure_reason( self ) -> Option< &'static str >
  {
    match self
    {
      Completeness::Complete => None,
      Completeness::IncompleteStream => Some( "incomplete_stream" ),
      Completeness::StreamTruncated => Some( "stream_truncated" ),
    }
  }
}

/// Parse-loop state: a single-pass line scanner that stays resumable
/// across chunk boundaries.
#[ derive( Debug, Clone, Default ) ]
enum State
{
  #[ default ]
  Idle,
  CollectingEvent { event_type : String, data : String },
}

/// Incremental SSE parser plus the merged-usage / completeness
/// bookkeeping the proxy needs once the stream ends.
#[ derive( Debug, Default ) ]
pub struct StreamParser
{
  buffer : String,
  state : State,
  usage : UsagePartial,
  message_id : Option< String >,
  model : Option< String >,
  stop_reason : Option< String >,
  has_message_start : bool,
  has_message_delta_usage : bool,
  has_message_stop : bool,
}

/// Tolerate `field:value`, `field: value`, and the teacher wire's
/// `field : value` spacing uniformly; returns the trimmed value.
fn strip_sse_field< 'a >( line : &'a str, field : &str ) -> Option< &'a str >
{
  let rest = line.strip_prefix( field )?.trim_start();
  let rest = rest.strip_prefix( ':' )?;
  Some( rest.trim_start() )
}

/// Repair a malformed `event: foo: bar` header (an event-type value that
/// itself looks like another `field: value` pair) down to the trailing
/// value, per the wire grammar's tolerance rule.
fn repair_event_type( raw : &str ) -> String
{
  match raw.rsplit_once( ": " )
  {
    Some( ( _, tail ) ) => tail.to_string(),
    None => raw.to_string(),
  }
}

impl StreamParser
{
  /// Build an empty parser.
  #[ must_use ]
  pub fn new() -> Self
  {
    Self::default()
  }

  /// Feed a raw chunk of bytes (need not align with event boundaries),
  /// returning every event completed by this chunk.
  pub fn push_chunk( &mut self, chunk : &[ u8 ] ) -> Vec< StreamEvent >
  {
    self.buffer.push_str( &String::from_utf8_lossy( chunk ) );
    let mut events = Vec::new();

    loop
    {
      let Some( newline_at ) = self.buffer.find( '\n' ) else { break };
      let line = self.buffer[ ..newline_at ].trim_end_matches( '\r' ).trim().to_string();
      self.buffer.drain( ..=newline_at );

      if line.is_empty()
      {
        if let State::CollectingEvent { event_type, data } = std::mem::take( &mut self.state )
        {
          events.push( self.finish_event( event_type, data ) );
        }
        continue;
      }

      if let Some( event_type ) = strip_sse_field( &line, "event" )
      {
        self.state = State::CollectingEvent { event_type : repair_event_type( event_type ), data : String::new() };
      }
      else if let Some( data_line ) = strip_sse_field( &line, "data" )
      {
        if let State::CollectingEvent { data, .. } = &mut self.state
        {
          if !data.is_empty() { data.push( '\n' ); }
          data.push_str( data_line );
        }
      }
    }

    events
  }

  /// If a chunk boundary left a complete-but-unterminated event sitting
  /// in the buffer (no trailing blank line), flush it. Call once after
  /// the upstream body ends.
  pub fn flush_pending( &mut self ) -> Option< StreamEvent >
  {
    if let State::CollectingEvent { event_type, data } = std::mem::take( &mut self.state )
    {
      Some( self.finish_event( event_type, data ) )
    }
    else
    {
      None
    }
  }

  fn finish_event( &mut self, event_type : String, data : String ) -> StreamEvent
  {
    match event_type.as_str()
    {
      "message_start" => match serde_json::from_str::< MessageStartData >( &data )
      {
        Ok( parsed ) =>
        {
          let usage : UsagePartial = parsed.message.usage.into();
          self.usage.merge( usage );
          self.message_id = Some( parsed.message.id.clone() );
          self.model = Some( parsed.message.model.clone() );
          self.has_message_start = true;
          StreamEvent::MessageStart { message_id : parsed.message.id, model : parsed.message.model, usage }
        }
        Err( e ) => StreamEvent::Malformed { event_type, detail : e.to_string() },
      },
      "message_delta" => match serde_json::from_str::< MessageDeltaData >( &data )
      {
        Ok( parsed ) =>
        {
          let usage : UsagePartial = parsed.usage.into();
          if usage != UsagePartial::default() { self.has_message_delta_usage = true; }
          self.usage.merge( usage );
          if parsed.delta.stop_reason.is_some() { self.stop_reason = parsed.delta.stop_reason.clone(); }
          StreamEvent::MessageDelta { usage, stop_reason : parsed.delta.stop_reason }
        }
        Err( e ) => StreamEvent::Malformed { event_type, detail : e.to_string() },
      },
      "message_stop" =>
      {
        self.has_message_stop = true;
        StreamEvent::MessageStop
      }
      other => StreamEvent::Other( other.to_string() ),
    }
  }

  /// The completeness classification per the oracle:
  /// - no `message_start` ⇒ `StreamTruncated`.
  /// - missing `message_stop`, with a `message_delta` usage seen ⇒
  ///   `IncompleteStream`.
  /// - missing `message_stop`, without one ⇒ `StreamTruncated`.
  /// - `message_stop` seen but no `message_delta` usage ever arrived
  ///   (start-only fallback despite a clean stop) ⇒ `IncompleteStream`.
  /// - otherwise `Complete`.
  #[ must_use ]
  pub fn completeness( &self ) -> Completeness
  {
    if !self.has_message_start { return Completeness::StreamTruncated; }
    if !self.has_message_stop
    {
      return if self.has_message_delta_usage { Completeness::IncompleteStream } else { Completeness::StreamTruncated };
    }
    if !self.has_message_delta_usage { return Completeness::IncompleteStream; }
    Completeness::Complete
  }

  /// Whether the stream reached a proper, fully-accounted finish (the
  /// completeness oracle distinguishing a clean finish from a truncation
  /// that must be billed from partial usage).
  #[ must_use ]
  pub fn is_complete( &self ) -> bool
  {
    self.completeness() == Completeness::Complete
  }

  /// The merged usage observed so far, regardless of completion.
  #[ must_use ]
  pub fn usage( &self ) -> UsagePartial
  {
    self.usage
  }

  /// The message id, once `message_start` has been seen.
  #[ must_use ]
  pub fn message_id( &self ) -> Option< &str >
  {
    self.message_id.as_deref()
  }

  /// The model name, once `message_start` has been seen.
  #[ must_use ]
  pub fn model( &self ) -> Option< &str >
  {
    self.model.as_deref()
  }

  /// The stop reason, once a `message_delta` carrying one has been seen.
  #[ must_use ]
  pub fn stop_reason( &self ) -> Option< &str >
  {
    self.stop_reason.as_deref()
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  #[ test ]
  fn parses_full_message_lifecycle_across_one_chunk()
  {
    let mut parser = StreamParser::new();
    let sse = "event : message_start\ndata : {\"message\":{\"id\":\"m1\",\"model\":\"claude-x\",\"usage\":{\"input_tokens\":10}}}\n\n\
               event : message_delta\ndata : {\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":42}}\n\n\
               event : message_stop\ndata : {}\n\n";
    let events = parser.push_chunk( sse.as_bytes() );
    assert_eq!( events.len(), 3 );
    assert!( parser.is_complete() );
    assert_eq!( parser.completeness(), Completeness::Complete );
    assert_eq!( parser.usage().input_tokens, Some( 10 ) );
    assert_eq!( parser.usage().output_tokens, Some( 42 ) );
    assert_eq!( parser.stop_reason(), Some( "end_turn" ) );
  }

  #[ test ]
  fn event_split_across_chunks_still_parses()
  {
    let mut parser = StreamParser::new();
    let first = parser.push_chunk( b"event : message_start\ndata : {\"message\":{\"id\":\"m1\"" );
    assert!( first.is_empty() );
    let second = parser.push_chunk( b",\"model\":\"x\",\"usage\":{}}}\n\n" );
    assert_eq!( second.len(), 1 );
    assert_eq!( parser.message_id(), Some( "m1" ) );
  }

  #[ test ]
  fn start_only_close_is_stream_truncated_with_billable_partial_usage()
  {
    let mut parser = StreamParser::new();
    let events = parser.push_chunk( b"event: message_start\ndata: {\"message\":{\"id\":\"m1\",\"model\":\"x\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n" );
    assert_eq!( events.len(), 1 );
    assert_eq!( parser.completeness(), Completeness::StreamTruncated );
    assert_eq!( parser.completeness().failure_reason(), Some( "stream_truncated" ) );
    assert_eq!( parser.usage().input_tokens, Some( 10 ) );
  }

  #[ test ]
  fn truncation_mid_stream_leaves_incomplete_but_flush_recovers_pending_event()
  {
    let mut parser = StreamParser::new();
    let events = parser.push_chunk( b"event : message_start\ndata : {\"message\":{\"id\":\"m1\",\"model\":\"x\",\"usage\":{\"input_tokens\":5}}}\n\nevent : message_delta\ndata : {\"usage\":{\"output_tokens\":3}}" );
    assert_eq!( events.len(), 1 );
    assert!( !parser.is_complete() );

    let flushed = parser.flush_pending();
    assert!( matches!( flushed, Some( StreamEvent::MessageDelta { .. } ) ) );
    assert_eq!( parser.usage().output_tokens, Some( 3 ) );
    assert_eq!( parser.completeness(), Completeness::IncompleteStream );
    assert_eq!( parser.completeness().failure_reason(), Some( "incomplete_stream" ) );
  }

  #[ test ]
  fn malformed_payload_is_reported_without_panicking()
  {
    let mut parser = StreamParser::new();
    let events = parser.push_chunk( b"event : message_start\ndata : not-json\n\n" );
    assert!( matches!( events.as_slice(), [ StreamEvent::Malformed { .. } ] ) );
  }

  #[ test ]
  fn no_space_prefixes_and_malformed_header_repair_still_parse()
  {
    let mut parser = StreamParser::new();
    let events = parser.push_chunk( b"event:message_start: message_start\ndata:{\"message\":{\"id\":\"m1\",\"model\":\"x\",\"usage\":{}}}\n\n" );
    assert_eq!( events.len(), 1 );
    assert!( matches!( events[ 0 ], StreamEvent::MessageStart { .. } ) );
    assert_eq!( parser.message_id(), Some( "m1" ) );
  }

  #[ test ]
  fn split_cache_creation_tokens_are_parsed_and_total_reconstructed_when_absent()
  {
    let mut parser = StreamParser::new();
    parser.push_chunk( b"event: message_start\ndata: {\"message\":{\"id\":\"m1\",\"model\":\"x\",\"usage\":{\"cache_creation\":{\"ephemeral_5m_input_tokens\":7,\"ephemeral_1h_input_tokens\":2}}}}\n\n" );
    assert_eq!( parser.usage().cache_creation_5m_tokens, Some( 7 ) );
    assert_eq!( parser.usage().cache_creation_1h_tokens, Some( 2 ) );
  }
}
