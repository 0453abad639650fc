// kconn-common - Shared types and framing for the kconn broker client
//
// This crate holds the stateless pieces: host list parsing, the
// length-prefixed frame codec and the error taxonomy.

pub mod endpoint;
pub mod error;
pub mod frame;

// Re-export for convenience
pub use endpoint::*;
pub use error::*;
pub use frame::*;
