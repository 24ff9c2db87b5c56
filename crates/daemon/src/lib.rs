// Daemon modules for the secretfs binary.
pub mod cli;
pub mod client;
pub mod fuse;
pub mod ownership;
pub mod process;

// Re-exports for consumers (integration tests, embedding).
pub use client::{ClientError, SecretClient};
pub use fuse::SecretFs;
pub use ownership::Ownership;
