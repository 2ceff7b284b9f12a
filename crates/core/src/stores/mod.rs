pub mod local;
pub mod memory;
pub mod qdrant;

pub use local::LocalRecordStore;
pub use memory::MemoryVectorIndex;
pub use qdrant::QdrantStore;
