//! Streaming erasure-coded object pipeline.
//!
//! Chunks an arbitrary byte stream, erasure-encodes each chunk with a
//! (K, M) Reed-Solomon/Cauchy code, and fans the resulting shards out to
//! (or back in from) a set of node sinks/sources. Provides:
//! - A lazy streaming chunker over `tokio::io::AsyncRead` sources
//! - A stateless (K, M) erasure codec
//! - A per-object metadata envelope attached alongside the shards
//! - Write/read pipelines that drive caller-supplied node collaborators
//!   with a bounded-failure durability policy

pub mod chunk;
pub mod config;
pub mod envelope;
pub mod erasure;
pub mod error;
pub mod node;
pub mod read;
pub mod write;

pub use chunk::Chunker;
pub use config::EngineConfig;
pub use envelope::Envelope;
pub use erasure::{Codec, Params, Technique};
pub use error::{CoreError, Result};
pub use node::{NodeReader, NodeWriter};
pub use read::ReadHandle;
pub use write::WriteHandle;

/// Default DataUnit size: 10 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 10 * 1024 * 1024;

/// Default data-shard count.
pub const DEFAULT_K: usize = 8;

/// Default total-shard count: no parity by default, matching the source
/// domain's historical (8, 8) configuration. Deployments wanting
/// tolerance to node loss raise M past K explicitly.
pub const DEFAULT_M: usize = 8;
