//! merge-engine
//!
//! A request-merging layer between an RPC client and its HTTP transport.
//! Concurrent identical requests collapse onto one underlying call whose
//! result is fanned out to every caller; total in-flight work is bounded
//! by a concurrency budget with FIFO overflow queuing.
//!
//! # Guarantees
//!
//! - At most one underlying call per distinct dedup key at any time
//! - At most `concurrency_limit` underlying calls dispatched concurrently
//! - Every caller receives exactly one completion, success or failure
//! - Failures propagate verbatim to all merged callers; nothing is retried
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use merge_engine::{HttpMethod, HttpRequest, MergeEngine, Transport};
//!
//! # async fn run(transport: Arc<dyn Transport>) {
//! let engine = MergeEngine::with_limit(transport, 50).unwrap();
//! let request = HttpRequest::new(HttpMethod::Post, "https://example.com/graphql")
//!     .with_body(br#"{"query":"{ me { name } }"}"#.to_vec());
//! let response = engine.execute(request).await.unwrap();
//! assert!(response.is_success());
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod telemetry;
pub mod transport;

mod budget;
mod queue;

pub use config::{EffectiveConfig, EngineConfig};
pub use engine::{EngineStats, MergeEngine};
pub use error::{CallResult, ConfigError, MergeError};
pub use key::{DedupKey, KeyPolicy};
pub use transport::{
    HttpHeader, HttpMethod, HttpRequest, HttpResponse, MergeHint, Transport, TransportError,
};
