//! Panoptikon engine: a local media-indexing and retrieval library built
//! around an embedded SQLite store, a PQL query compiler that lowers a typed
//! filter tree to stacked CTEs, a rule-gated extraction job runner, and a
//! vector-similarity search facade.
//!
//! Module map:
//! - [`store`] — the Store Adapter: schema, connection handles, transactions.
//! - [`model`] — plain entity types mirroring the schema.
//! - [`types`] — validated newtypes enforcing invariants at construction.
//! - [`rules`] — the Rule Engine: rule CRUD and candidate-item computation.
//! - [`registry`] — the Extractor Registry: inference-service metadata cache.
//! - [`inference`] — the inference-service RPC client trait and HTTP binding.
//! - [`extraction`] — the Extraction Job Runner: batches candidates through
//!   an extractor and writes results back through [`mcut`]-aware tag logic.
//! - [`mcut`] — the MCut tag-confidence thresholding algorithm.
//! - [`jobs`] — the Job Manager: a cooperative, cancellable serial queue.
//! - [`pql`] — the PQL AST, compiler, and similarity planner.
//! - [`search`] — the Search Facade: the request-facing surface over PQL,
//!   plus stats/autocomplete/bookmark operations.
//! - [`error`] — the engine's closed error type.
//! - [`config`] — engine configuration, built explicitly via a builder.
//! - [`observability`] — structured logging/tracing setup.

pub mod config;
pub mod error;
pub mod extraction;
pub mod inference;
pub mod jobs;
pub mod mcut;
pub mod model;
pub mod observability;
pub mod pql;
pub mod registry;
pub mod rules;
pub mod search;
pub mod store;
pub mod types;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{EngineError, EngineResult};
pub use store::StoreHandle;
