//! facekeep-core: sample collection, label storage and descriptor matching.
//!
//! Face detection and descriptor extraction are delegated to an external
//! oracle behind [`EmbeddingOracle`]; this crate sequences its results into
//! labeled sample sets, persists them, and matches new descriptors against
//! the stored labels.

pub mod matcher;
pub mod oracle;
pub mod session;
pub mod sqlite;
pub mod store;
pub mod types;

pub use matcher::{MatchResult, MatcherBuilder, MatcherError, MatcherIndex, Metric};
pub use oracle::{
    Detection, DrawingSurface, EmbeddingOracle, Frame, FrameSource, OracleError, OracleShape,
    Overlay,
};
pub use session::{Collector, CollectorState, Progress, SessionError};
pub use sqlite::SqliteKv;
pub use store::{KeyValue, KvLabelStore, LabelRecord, LabelStore, MemoryKv, StoreError};
pub use types::{BoundingBox, Descriptor, Point, Sample};

/// Default location of the label database: `$XDG_DATA_HOME/facekeep/faces.db`.
pub fn default_db_path() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("facekeep")
        .join("faces.db")
}
