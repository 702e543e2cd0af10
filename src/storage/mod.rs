pub mod local;
pub mod object;
pub mod traits;
pub mod watermark;

pub use local::LocalSink;
pub use object::ObjectStoreSink;
pub use traits::{StorageError, StorageSink};
pub use watermark::{FileWatermarkStore, MemoryWatermarkStore, WatermarkError, WatermarkStore};
