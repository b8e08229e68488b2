//! # Image Retrieval
//!
//! Content-based image retrieval over an inverted-file (IVF) approximate
//! nearest-neighbor index.
//!
//! This library provides:
//! - Vector normalization (L1 / L2) applied symmetrically on ingest and query
//! - An IVF index with seeded k-means clustering and `nprobe`-bounded search
//! - A durable correlator mapping every vector id to its image name
//! - Named collections with a Created → IndexBuilt → Loaded lifecycle
//! - A retrieval pipeline that keeps index and correlator consistent across failures
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use image_retrieval::{
//!     CollectionManager, CollectionSchema, EngineConfig, Norm, RetrievalPipeline, Vector,
//! };
//!
//! let manager = Arc::new(CollectionManager::open(EngineConfig::default())?);
//! manager.create("photos", CollectionSchema::new(3).with_norm(Norm::L2).with_nlist(2))?;
//!
//! let pipeline = RetrievalPipeline::new(Arc::clone(&manager));
//! pipeline.ingest("photos", vec![
//!     ("cat.jpg".to_string(), Vector::new(vec![0.9, 0.1, 0.0])),
//!     ("dog.jpg".to_string(), Vector::new(vec![0.1, 0.9, 0.0])),
//!     ("car.jpg".to_string(), Vector::new(vec![0.0, 0.1, 0.9])),
//! ])?;
//! pipeline.build_and_load("photos")?;
//!
//! let hits = pipeline.query_one("photos", &Vector::new(vec![1.0, 0.0, 0.0]), 1, Some(2))?;
//! assert_eq!(hits[0].entry.name(), Some("cat.jpg"));
//! # Ok::<(), image_retrieval::RetrievalError>(())
//! ```

pub mod collection;
pub mod config;
pub mod correlator;
pub mod distance;
pub mod embedding;
pub mod error;
pub mod flat_index;
pub mod index;
pub mod ivf;
pub mod manager;
pub mod metrics;
pub mod normalize;
pub mod persistence;
pub mod pipeline;
pub mod vector;

pub use collection::{Collection, CollectionInfo, CollectionSchema, CollectionState};
pub use config::EngineConfig;
pub use correlator::{CorrelationStore, Correlator, LookupEntry};
pub use distance::Metric;
pub use error::{Result, RetrievalError};
pub use flat_index::FlatIndex;
pub use index::{Index, ScoredId};
pub use ivf::{IvfIndex, KMeansParams};
pub use manager::CollectionManager;
pub use metrics::MetricsCollector;
pub use normalize::{normalize, Norm};
pub use pipeline::{screen, IngestReport, Match, QueryOutcome, RecoveryPolicy, RetrievalPipeline};
pub use vector::{Vector, VectorId};
