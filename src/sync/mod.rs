pub mod cache;
pub mod daemon;
pub mod paginate;
pub mod processor;
pub mod spans;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::PipelineCache;
pub use daemon::{SyncDaemon, SyncSettings};
pub use paginate::DEFAULT_PAGE_SIZE;
