pub mod memory;
pub mod qdrant;
mod snapshot;

pub use memory::{InMemoryChunkIndex, InMemoryDocumentStore};
pub use qdrant::QdrantChunkIndex;

pub(crate) use snapshot::{load_json, write_json_atomic};
