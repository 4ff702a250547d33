//! CLI commands implementation

pub mod chat;
pub mod ingest;
pub mod init;
pub mod query;
pub mod status;

pub use chat::*;
pub use ingest::*;
pub use init::*;
pub use query::*;
pub use status::*;
