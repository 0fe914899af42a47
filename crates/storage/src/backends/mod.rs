//! Storage backend implementations.

pub mod cos;
pub mod filesystem;
pub mod s3;
