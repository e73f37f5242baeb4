//! A normalized GraphQL client cache.
//!
//! Documents compile once into value-typed plans; payloads normalize into a
//! flat graph of records with explicit reference semantics; per-page
//! connection fetches fold into canonical views with splice-at-cursor
//! merging; optimistic transactions overlay the base graph and replay on
//! every base write; and an async pipeline executes operations under four
//! cache policies with inflight de-duplication and watcher dispatch.
//!
//! The cache owns all of its state behind one coarse lock. The planner,
//! normalizer, canonical engine and graph store are synchronous; only the
//! pipeline suspends, and only while waiting on the transport.

mod cache;
mod connection;
pub mod config;
pub mod error;
pub mod graph;
mod hydration;
mod materialize;
mod normalize;
mod optimistic;
mod pipeline;
pub mod plan;
pub mod transport;

pub use cache::GraphCache;
pub use cache::OptimisticHandle;
pub use config::CacheOptions;
pub use config::ConnectionMode;
pub use config::ConnectionSpec;
pub use config::KeyFn;
pub use error::CacheError;
pub use error::GraphQLError;
pub use error::PathSegment;
pub use graph::Record;
pub use graph::RecordPatch;
pub use graph::RecordValue;
pub use graph::ROOT_ID;
pub use materialize::live::LiveResult;
pub use optimistic::AddPosition;
pub use optimistic::ConnectionEditor;
pub use optimistic::ConnectionTarget;
pub use optimistic::OptimisticTxn;
pub use pipeline::CachePolicy;
pub use pipeline::MutationRequest;
pub use pipeline::QueryRequest;
pub use pipeline::QueryResponse;
pub use pipeline::ResponseSource;
pub use pipeline::SubscriptionRequest;
pub use pipeline::WatchHandle;
pub use pipeline::WatchRequest;
pub use plan::MaskMode;
pub use plan::OperationKind;
pub use plan::Plan;
pub use plan::PlanField;
pub use plan::Variables;
pub use transport::Transport;
pub use transport::TransportRequest;
pub use transport::TransportResponse;
