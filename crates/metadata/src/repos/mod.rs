//! Repository traits for metadata operations.

pub mod chunk_sessions;
pub mod files;
pub mod transfers;
pub mod user_files;

pub use chunk_sessions::ChunkSessionRepo;
pub use files::FileRepo;
pub use transfers::TransferQueueRepo;
pub use user_files::UserFileRepo;
