//! Common test utilities and fixtures.

pub mod fixtures;
pub mod multipart;
pub mod remote;
pub mod server;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use multipart::*;
#[allow(unused_imports)]
pub use remote::*;
#[allow(unused_imports)]
pub use server::*;
