//! # Repository Pattern Implementation
//!
//! Each table has a repository trait and a SQLite implementation backed by a
//! shared `sqlx` pool. Callers hold the traits as `Arc<dyn ...>` so tests can
//! substitute them.
//!
//! ## Available Repositories
//!
//! - `RootRepository` - Library roots hosted by a node
//! - `FileRepository` - Scanned local files and downloaded remote files
//! - `TrustStore` - Nodes that are admitted without asking the owner
//! - `RecentServerRepository` - Servers this node connected to

pub mod files;
pub mod recent_servers;
pub mod roots;
pub mod trust;

pub use files::{FileRepository, NewFile, SqliteFileRepository};
pub use recent_servers::{RecentServerRepository, SqliteRecentServerRepository};
pub use roots::{RootRepository, SqliteRootRepository};
pub use trust::{SqliteTrustStore, TrustStore};
