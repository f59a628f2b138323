//! pycast-core — wire format, integrity checks, session descriptors,
//! and configuration shared by every other pycast crate.

pub mod config;
pub mod error;
pub mod integrity;
pub mod session;
pub mod wire;

pub use config::PycastConfig;
pub use session::{FileDescriptor, Session, Status, TransferParams};
