//! # Library Management Module
//!
//! Owns the library database and the content index a node offers to peers.
//!
//! ## Overview
//!
//! This module manages:
//! - SQLite database schema and migrations
//! - Repositories for roots, files, trusted nodes and recent servers
//! - Building the local index from the configured roots
//! - Reconciling a remote index against what has already been downloaded

pub mod db;
pub mod error;
pub mod index;
pub mod library;
pub mod models;
pub mod repositories;

pub use error::{LibraryError, Result};
pub use index::{build_local_index, mark_downloaded, plan_partial, reconcile, LocalIndex, RootScanError};
pub use library::{Library, ScanReport};
pub use models::{FileRecord, FileSize, IndexItem, ItemKey, LibraryRoot, RecentServer, TrustedNode};
