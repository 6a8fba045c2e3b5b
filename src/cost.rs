//! Per-request cost computation from model pricing and endpoint
//! multipliers.
//!
//! Built fresh as a pure-function module, in the style of the ambient
//! `config.rs`/`store.rs` plain-data modules, with a `_default` pricing
//! fallback and legacy 5-minute cache-category attribution.

use std::collections::HashMap;
use serde::{ Deserialize, Serialize };

use crate::stream_parser::UsagePartial;

/// Per-million-token pricing for one model, in USD.
#[ derive( Debug, Clone, Copy, Default ) ]
pub struct ModelPricing
{
  /// Price per million input tokens.
  pub input_per_million : f64,
  /// Price per million output tokens.
  pub output_per_million : f64,
  /// Price per million tokens written to the 5-minute cache tier.
  pub cache_write_5m_per_million : f64,
  /// Price per million tokens written to the 1-hour cache tier.
  pub cache_creation_1h_per_million : f64,
  /// Price per million tokens read from any cache tier.
  pub cache_read_per_million : f64,
}

/// Per-category multiplier factors, applied independently when an
/// endpoint has no single `cost_multiplier` override.
#[ derive( Debug, Clone, Copy, PartialEq, Serialize, Deserialize ) ]
#[ serde( default ) ]
pub struct CategoryMultipliers
{
  /// Input-token multiplier.
  pub input : f64,
  /// Output-token multiplier.
  pub output : f64,
  /// 5-minute cache-write multiplier.
  pub cache_5m : f64,
  /// 1-hour cache-write multiplier.
  pub cache_1h : f64,
  /// Cache-read multiplier.
  pub cache_read : f64,
}

impl Default for CategoryMultipliers
{
  fn default() -> Self
  {
    Self { input : 1.0, output : 1.0, cache_5m : 1.0, cache_1h : 1.0, cache_read : 1.0 }
  }
}

/// How an endpoint's configured multiplier is applied: either a single
/// overall factor, or independent per-category factors.
#[ derive( Debug, Clone, Copy, PartialEq ) ]
pub enum MultiplierMode
{
  /// Multiply the whole computed cost by one factor.
  Overall( f64 ),
  /// Multiply each cost category by its own factor.
  PerCategory( CategoryMultipliers ),
}

impl MultiplierMode
{
  /// Pick the mode an endpoint's configured `cost_multiplier` /
  /// `category_multipliers` imply: a positive `cost_multiplier` wins as a
  /// single overall override, otherwise the per-category factors apply.
  #[ must_use ]
  pub fn from_endpoint( cost_multiplier : f64, category_multipliers : CategoryMultipliers ) -> Self
  {
    if cost_multiplier > 0.0 { MultiplierMode::Overall( cost_multiplier ) } else { MultiplierMode::PerCategory( category_multipliers ) }
  }
}

/// Resolves model pricing (with a `_default` fallback) and applies
/// per-endpoint multipliers.
#[ derive( Debug, Default ) ]
pub struct CostEngine
{
  pricing : HashMap< String, ModelPricing >,
}

fn tokens_as_f64( tokens : Option< u64 > ) -> f64
{
  f64::from( u32::try_from( tokens.unwrap_or( 0 ) ).unwrap_or( u32::MAX ) )
}

impl CostEngine
{
  /// Build an engine from a pricing table. A `"_default"` entry, if
  /// present, is used for any model not otherwise listed.
  #[ must_use ]
  pub fn new( pricing : HashMap< String, ModelPricing > ) -> Self
  {
    Self { pricing }
  }

  /// Look up pricing for `model`, falling back to `"_default"`.
  #[ must_use ]
  pub fn pricing_for( &self, model : &str ) -> Option< ModelPricing >
  {
    self.pricing.get( model ).or_else( || self.pricing.get( "_default" ) ).copied()
  }

  /// Compute the USD cost of `usage` against `model`, applying `mode`.
  /// Legacy usage that reports only `cache_creation_input_tokens` with no
  /// 5m/1h split is attributed entirely to the 5-minute cache category.
  #[ must_use ]
  pub fn compute( &self, model : &str, usage : UsagePartial, mode : MultiplierMode ) -> Option< f64 >
  {
    let pricing = self.pricing_for( model )?;

    let ( cache_5m_tokens, cache_1h_tokens ) = match ( usage.cache_creation_5m_tokens, usage.cache_creation_1h_tokens )
    {
      ( None, None ) => ( usage.cache_creation_input_tokens, None ),
      split => split,
    };

    let input = tokens_as_f64( usage.input_tokens ) * pricing.input_per_million / 1_000_000.0;
    let output = tokens_as_f64( usage.output_tokens ) * pricing.output_per_million / 1_000_000.0;
    let cache_5m = tokens_as_f64( cache_5m_tokens ) * pricing.cache_write_5m_per_million / 1_000_000.0;
    let cache_1h = tokens_as_f64( cache_1h_tokens ) * pricing.cache_creation_1h_per_million / 1_000_000.0;
    let cache_read = tokens_as_f64( usage.cache_read_input_tokens ) * pricing.cache_read_per_million / 1_000_000.0;

    Some( match mode
    {
      MultiplierMode::Overall( factor ) => ( input + output + cache_5m + cache_1h + cache_read ) * factor,
      MultiplierMode::PerCategory( m ) =>
        input * m.input + output * m.output + cache_5m * m.cache_5m + cache_1h * m.cache_1h + cache_read * m.cache_read,
    } )
  }
}

#[ cfg( test ) ]
mod tests
{
  use super::*;

  fn engine() -> CostEngine
  {
    let mut pricing = HashMap::new();
    pricing.insert( "claude-x".to_string(), ModelPricing
    {
      input_per_million : 3.0,
      output_per_million : 15.0,
      cache_write_5m_per_million : 3.75,
      cache_creation_1h_per_million : 6.0,
      cache_read_per_million : 0.3,
    } );
    pricing.insert( "_default".to_string(), ModelPricing
    {
      input_per_million : 1.0,
      output_per_million : 1.0,
      cache_write_5m_per_million : 1.0,
      cache_creation_1h_per_million : 1.0,
      cache_read_per_million : 1.0,
    } );
    CostEngine::new( pricing )
  }

  #[ test ]
  fn unknown_model_falls_back_to_default_pricing()
  {
    let usage = UsagePartial { input_tokens : Some( 1_000_000 ), ..UsagePartial::default() };
    let cost = engine().compute( "unknown-model", usage, MultiplierMode::Overall( 1.0 ) ).unwrap();
    assert!( ( cost - 1.0 ).abs() < f64::EPSILON );
  }

  #[ test ]
  fn overall_multiplier_scales_the_whole_cost()
  {
    let usage = UsagePartial { input_tokens : Some( 1_000_000 ), output_tokens : Some( 1_000_000 ), ..UsagePartial::default() };
    let cost = engine().compute( "claude-x", usage, MultiplierMode::Overall( 2.0 ) ).unwrap();
    assert!( ( cost - 36.0 ).abs() < 1e-9 );
  }

  #[ test ]
  fn per_category_multiplier_scales_each_category_independently()
  {
    let usage = UsagePartial { input_tokens : Some( 1_000_000 ), output_tokens : Some( 1_000_000 ), ..UsagePartial::default() };
    let multipliers = CategoryMultipliers { input : 1.0, output : 2.0, ..CategoryMultipliers::default() };
    let cost = engine().compute( "claude-x", usage, MultiplierMode::PerCategory( multipliers ) ).unwrap();
    assert!( ( cost - ( 3.0 + 30.0 ) ).abs() < 1e-9 );
  }

  #[ test ]
  fn legacy_cache_creation_total_is_attributed_to_the_5m_category()
  {
    let usage = UsagePartial { cache_creation_input_tokens : Some( 1_000_000 ), ..UsagePartial::default() };
    let cost = engine().compute( "claude-x", usage, MultiplierMode::Overall( 1.0 ) ).unwrap();
    assert!( ( cost - 3.75 ).abs() < 1e-9 );
  }

  #[ test ]
  fn split_cache_creation_tokens_price_against_their_own_tiers()
  {
    let usage = UsagePartial { cache_creation_5m_tokens : Some( 1_000_000 ), cache_creation_1h_tokens : Some( 1_000_000 ), ..UsagePartial::default() };
    let cost = engine().compute( "claude-x", usage, MultiplierMode::Overall( 1.0 ) ).unwrap();
    assert!( ( cost - ( 3.75 + 6.0 ) ).abs() < 1e-9 );
  }

  #[ test ]
  fn from_endpoint_prefers_positive_overall_multiplier()
  {
    assert!( matches!( MultiplierMode::from_endpoint( 2.0, CategoryMultipliers::default() ), MultiplierMode::Overall( f ) if ( f - 2.0 ).abs() < f64::EPSILON ) );
    assert!( matches!( MultiplierMode::from_endpoint( 0.0, CategoryMultipliers::default() ), MultiplierMode::PerCategory( _ ) ) );
  }

  #[ test ]
  fn no_pricing_and_no_default_returns_none()
  {
    let engine = CostEngine::new( HashMap::new() );
    let cost = engine.compute( "anything", UsagePartial::default(), MultiplierMode::Overall( 1.0 ) );
    assert!( cost.is_none() );
  }
}
