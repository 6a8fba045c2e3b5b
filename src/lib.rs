//! Core routing, failover, and telemetry engine for a multi-endpoint LLM
//! chat-completion reverse proxy.
//!
//! # Governing principle: "thin boundary, rich core"
//!
//! This crate owns exactly the four subsystems that make the proxy worth
//! writing: endpoint/channel inventory, channel activation, retry/failover
//! policy, and streaming telemetry. It does not authenticate clients, does
//! not translate between upstream API dialects, and does not parse its own
//! YAML configuration file — those are thin collaborators living outside
//! this crate's boundary (see `config` for the typed shapes they produce).
//!
//! ## Core principles
//!
//! - **Explicit control.** Channel activation, pausing, and forced
//!   activation are developer/operator actions, never silent magic.
//! - **At-most-once billing.** A stream is archived exactly once; a
//!   truncated stream is archived with whatever usage was observed.
//! - **Runtime-stateful, process-stateless.** Endpoint health, cooldowns,
//!   and the hot pool live only in memory; only completed, archived
//!   requests are durable.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use relay_core::{ ProxyCore, config::ProxyConfig, transport::HttpTransport };
//!
//! # async fn example() -> Result< (), Box< dyn std::error::Error > > {
//! let config = ProxyConfig::default();
//! let transport = Arc::new( HttpTransport::new( reqwest::Client::new() ) );
//! let core = Arc::new( ProxyCore::new( config, transport ).await? );
//! core.start_health_loop();
//! core.start_hotpool_sweeper();
//! # Ok( () )
//! # }
//! ```

#![ allow( clippy::missing_inline_in_public_items ) ]

pub mod error;
pub mod logging;
pub mod config;
pub mod secret;
pub mod keystore;
pub mod cooldown;
pub mod endpoint;
pub mod endpoint_manager;
pub mod channel;
pub mod channel_manager;
pub mod health;
pub mod retry;
pub mod suspension;
pub mod failover;
pub mod stream_parser;
pub mod active_request;
pub mod hotpool;
pub mod cost;
pub mod store;
pub mod archive;
pub mod transport;
pub mod proxy;

pub use error::{ ProxyError, ProxyResult, ErrorKind };
pub use proxy::ProxyCore;

/// Error-related exports, re-exported at the crate root for convenience.
pub mod error_tools
{
  pub use error_tools::*;
}
