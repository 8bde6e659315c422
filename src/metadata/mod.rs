//! PNG text-chunk extraction and the generation-record history built on it.

pub mod analytics;
pub mod chunk_reader;
pub mod extract;
pub mod history;
pub mod normalize;

pub use extract::{extract, ChunkKind, RawChunk};
pub use history::{HistoryStore, HISTORY_MAX_ENTRIES, HISTORY_STORAGE_KEY};
pub use normalize::{normalize, GenerationRecord};
