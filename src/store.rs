//! Durable request/endpoint/pricing storage.
//!
//! Grounded on the `sqlx::SqlitePool` + single-writer/many-reader split
//! seen in the pack's gateway-shaped services (e.g. the
//! `RwLock<HashMap<...>>` in-memory half of `zhubby-moltis`'s gateway
//! state, here backed by sqlite instead of memory so usage survives
//! restarts). No teacher module in `api/claude` persists anything; this
//! is the crate's one genuinely new ambient subsystem.

use std::{ collections::HashMap, time::Duration };
use sqlx::sqlite::{ SqlitePool, SqlitePoolOptions };

use crate::{ active_request::ActiveRequest, cost::ModelPricing, error::ProxyResult };

/// Owns the durable store: one single-connection pool for writes (sqlite
/// only allows one writer at a time) and a separate multi-connection pool
/// for reads, so telemetry queries never stall behind archive writes.
#[ derive( Debug, Clone ) ]
pub struct Store
{
  writer : SqlitePool,
  reader : SqlitePool,
}

impl Store
{
  /// Connect to `database_url`, running embedded migrations, and size
  /// the writer pool to exactly one connection.
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` connection or migration failure.
  pub async fn connect( database_url : &str ) -> ProxyResult< Self >
  {
    let writer = SqlitePoolOptions::new()
      .max_connections( 1 )
      .connect( database_url )
      .await?;
    let reader = SqlitePoolOptions::new()
      .max_connections( 8 )
      .connect( database_url )
      .await?;

    sqlx::migrate!( "./migrations" ).run( &writer ).await
      .map_err( | e | crate::error::ProxyError::Store( e.to_string() ) )?;

    Ok( Self { writer, reader } )
  }

  /// Insert a batch of finished requests in one transaction.
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` failure; the whole batch rolls back together.
  pub async fn insert_batch( &self, requests : &[ ( ActiveRequest, Option< f64 > ) ] ) -> ProxyResult< () >
  {
    let mut tx = self.writer.begin().await?;
    for ( request, cost_usd ) in requests
    {
      sqlx::query(
        "INSERT INTO requests \
         ( request_id, channel_key, endpoint_key, model, is_streaming, start_time, end_time, \
           status, failure_reason, cancel_reason, input_tokens, output_tokens, \
           cache_creation_input_tokens, cache_creation_5m_tokens, cache_creation_1h_tokens, \
           cache_read_input_tokens, cost_usd ) \
         VALUES ( ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ? )"
      )
      .bind( &request.request_id )
      .bind( &request.channel_key )
      .bind( &request.endpoint_key )
      .bind( &request.model )
      .bind( request.is_streaming )
      .bind( request.start_time )
      .bind( request.end_time )
      .bind( format!( "{:?}", request.status ) )
      .bind( &request.failure_reason )
      .bind( &request.cancel_reason )
      .bind( request.usage.input_tokens.map( | v | v as i64 ) )
      .bind( request.usage.output_tokens.map( | v | v as i64 ) )
      .bind( request.usage.cache_creation_input_tokens.map( | v | v as i64 ) )
      .bind( request.usage.cache_creation_5m_tokens.map( | v | v as i64 ) )
      .bind( request.usage.cache_creation_1h_tokens.map( | v | v as i64 ) )
      .bind( request.usage.cache_read_input_tokens.map( | v | v as i64 ) )
      .bind( *cost_usd )
      .execute( &mut *tx )
      .await?;

      let date = request.start_time.format( "%Y-%m-%d" ).to_string();
      let model = request.model.as_deref().unwrap_or( "_unknown" );
      sqlx::query(
        "INSERT INTO usage_summary ( date, model, endpoint_key, channel_key, request_count, input_tokens, output_tokens, cost_usd ) \
         VALUES ( ?, ?, ?, ?, 1, ?, ?, ? ) \
         ON CONFLICT( date, model, endpoint_key, channel_key ) DO UPDATE SET \
           request_count = request_count + 1, \
           input_tokens = input_tokens + excluded.input_tokens, \
           output_tokens = output_tokens + excluded.output_tokens, \
           cost_usd = cost_usd + excluded.cost_usd"
      )
      .bind( &date )
      .bind( model )
      .bind( &request.endpoint_key )
      .bind( &request.channel_key )
      .bind( request.usage.input_tokens.unwrap_or( 0 ) as i64 )
      .bind( request.usage.output_tokens.unwrap_or( 0 ) as i64 )
      .bind( cost_usd.unwrap_or( 0.0 ) )
      .execute( &mut *tx )
      .await?;
    }
    tx.commit().await?;
    Ok( () )
  }

  /// Read the daily rollup rows for `date` (`YYYY-MM-DD`), used by
  /// historical reporting without scanning the full `requests` table.
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` failure.
  pub async fn query_usage_summary( &self, date : &str ) -> ProxyResult< Vec< UsageSummaryRow > >
  {
    let rows = sqlx::query_as::< _, UsageSummaryRow >(
      "SELECT date, model, endpoint_key, channel_key, request_count, input_tokens, output_tokens, cost_usd \
       FROM usage_summary WHERE date = ?"
    )
    .bind( date )
    .fetch_all( &self.reader )
    .await?;
    Ok( rows )
  }

  /// Query archived requests for `channel_key` within a time range,
  /// used by both the live `hotpool` double-source read and historical
  /// reporting.
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` failure.
  pub async fn query_requests( &self, channel_key : &str, limit : i64 ) -> ProxyResult< Vec< ArchivedRequestRow > >
  {
    let rows = sqlx::query_as::< _, ArchivedRequestRow >(
      "SELECT request_id, channel_key, endpoint_key, model, status, failure_reason, cancel_reason, cost_usd \
       FROM requests WHERE channel_key = ? ORDER BY start_time DESC LIMIT ?"
    )
    .bind( channel_key )
    .bind( limit )
    .fetch_all( &self.reader )
    .await?;
    Ok( rows )
  }

  /// Upsert one endpoint's config row (for the `External` endpoints
  /// storage mode). Identity is `(channel, name)`, matching
  /// the corrected `UNIQUE(channel, name)` constraint rather than the
  /// legacy name-only uniqueness.
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` failure.
  pub async fn upsert_endpoint( &self, channel : &str, name : &str, url : &str, priority : i64, enabled : bool ) -> ProxyResult< () >
  {
    sqlx::query(
      "INSERT INTO endpoints ( channel, name, url, priority, enabled ) VALUES ( ?, ?, ?, ?, ? ) \
       ON CONFLICT( channel, name ) DO UPDATE SET url = excluded.url, priority = excluded.priority, enabled = excluded.enabled"
    )
    .bind( channel )
    .bind( name )
    .bind( url )
    .bind( priority )
    .bind( enabled )
    .execute( &self.writer )
    .await?;
    Ok( () )
  }

  /// Upsert a channel's static priority (derived at rebuild time).
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` failure.
  pub async fn upsert_channel( &self, channel_key : &str, priority : i64 ) -> ProxyResult< () >
  {
    sqlx::query(
      "INSERT INTO channels ( channel_key, priority ) VALUES ( ?, ? ) \
       ON CONFLICT( channel_key ) DO UPDATE SET priority = excluded.priority"
    )
    .bind( channel_key )
    .bind( priority )
    .execute( &self.writer )
    .await?;
    Ok( () )
  }

  /// Upsert one model's pricing row.
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` failure.
  pub async fn upsert_pricing( &self, model : &str, pricing : ModelPricing ) -> ProxyResult< () >
  {
    sqlx::query(
      "INSERT INTO pricing \
       ( model, input_per_million, output_per_million, cache_write_5m_per_million, cache_creation_1h_per_million, cache_read_per_million ) \
       VALUES ( ?, ?, ?, ?, ?, ? ) \
       ON CONFLICT( model ) DO UPDATE SET \
         input_per_million = excluded.input_per_million, \
         output_per_million = excluded.output_per_million, \
         cache_write_5m_per_million = excluded.cache_write_5m_per_million, \
         cache_creation_1h_per_million = excluded.cache_creation_1h_per_million, \
         cache_read_per_million = excluded.cache_read_per_million"
    )
    .bind( model )
    .bind( pricing.input_per_million )
    .bind( pricing.output_per_million )
    .bind( pricing.cache_write_5m_per_million )
    .bind( pricing.cache_creation_1h_per_million )
    .bind( pricing.cache_read_per_million )
    .execute( &self.writer )
    .await?;
    Ok( () )
  }

  /// Load the whole pricing table.
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` failure.
  pub async fn load_pricing( &self ) -> ProxyResult< HashMap< String, ModelPricing > >
  {
    let rows = sqlx::query_as::< _, PricingRow >( "SELECT * FROM pricing" )
      .fetch_all( &self.reader )
      .await?;
    Ok( rows.into_iter().map( | r | ( r.model, ModelPricing
    {
      input_per_million : r.input_per_million,
      output_per_million : r.output_per_million,
      cache_write_5m_per_million : r.cache_write_5m_per_million,
      cache_creation_1h_per_million : r.cache_creation_1h_per_million,
      cache_read_per_million : r.cache_read_per_million,
    } ) ).collect() )
  }

  /// Read a persisted setting, used for the `primary_endpoint_override`
  /// and similar operator-set values that must survive a restart.
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` failure.
  pub async fn get_setting( &self, key : &str ) -> ProxyResult< Option< String > >
  {
    let row : Option< ( String, ) > = sqlx::query_as( "SELECT value FROM settings WHERE key = ?" )
      .bind( key )
      .fetch_optional( &self.reader )
      .await?;
    Ok( row.map( | ( value, ) | value ) )
  }

  /// Persist a setting.
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` failure.
  pub async fn set_setting( &self, key : &str, value : &str ) -> ProxyResult< () >
  {
    sqlx::query( "INSERT INTO settings ( key, value ) VALUES ( ?, ? ) ON CONFLICT( key ) DO UPDATE SET value = excluded.value" )
      .bind( key )
      .bind( value )
      .execute( &self.writer )
      .await?;
    Ok( () )
  }

  /// Delete archived requests older than `retention`, run periodically
  /// per `usage_tracking.retention_days`/`cleanup_interval`.
  ///
  /// # Errors
  ///
  /// Propagates any `sqlx` failure.
  pub async fn cleanup_expired( &self, retention : Duration ) -> ProxyResult< u64 >
  {
    let cutoff = chrono::Utc::now() - chrono::Duration::from_std( retention ).unwrap_or( chrono::Duration::zero() );
    let result = sqlx::query( "DELETE FROM requests WHERE start_time < ?" )
      .bind( cutoff )
      .execute( &self.writer )
      .await?;
    Ok( result.rows_affected() )
  }
}

/// One row returned by [`Store::query_requests`].
#[ derive( Debug, Clone, sqlx::FromRow ) ]
pub struct ArchivedRequestRow
{
  /// Request id.
  pub request_id : String,
  /// Channel key.
  pub channel_key : String,
  /// Endpoint key.
  pub endpoint_key : String,
  /// Model name, if known.
  pub model : Option< String >,
  /// Terminal status, stored as its `Debug` rendering.
  pub status : String,
  /// Why the request failed or was truncated, if it did.
  pub failure_reason : Option< String >,
  /// Why the request was cancelled, if it was.
  pub cancel_reason : Option< String >,
  /// Computed cost in USD, if pricing was available.
  pub cost_usd : Option< f64 >,
}

/// One row returned by [`Store::query_usage_summary`].
#[ derive( Debug, Clone, sqlx::FromRow ) ]
pub struct UsageSummaryRow
{
  /// Rollup date, `YYYY-MM-DD`.
  pub date : String,
  /// Model name (`"_unknown"` when the request never resolved one).
  pub model : String,
  /// Endpoint key.
  pub endpoint_key : String,
  /// Channel key.
  pub channel_key : String,
  /// Requests archived under this rollup bucket.
  pub request_count : i64,
  /// Summed input tokens.
  pub input_tokens : i64,
  /// Summed output tokens.
  pub output_tokens : i64,
  /// Summed computed cost.
  pub cost_usd : f64,
}

#[ derive( Debug, Clone, sqlx::FromRow ) ]
struct PricingRow
{
  model : String,
  input_per_million : f64,
  output_per_million : f64,
  cache_write_5m_per_million : f64,
  cache_creation_1h_per_million : f64,
  cache_read_per_million : f64,
}
