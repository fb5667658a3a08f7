//! # notebase-core
//!
//! A local-first sync and indexing engine that mirrors directories of Markdown notes into a
//! queryable SQLite index.
//!
//! ## Overview
//!
//! Every registered **project** is a directory of Markdown files. Each file becomes one
//! **entity** with a stable **permalink**, plus the **observations** (categorized facts) and
//! **relations** (typed links to other entities) written in its body. The files stay the source
//! of truth: the index is rebuilt from them, never the other way round.
//!
//! ### Key Features
//!
//! - **Tolerant parsing**: malformed frontmatter still indexes the file, with the error recorded
//! - **Stable identity**: permalinks survive edits and renames, collisions get a deterministic suffix
//! - **Forward references**: links to notes that don't exist yet stay pending and resolve the moment the target appears
//! - **Full-text search**: SQLite FTS5 over entities, observations and relations with filters
//! - **Incremental sync**: debounced file events, periodic scans, move detection, bounded retries
//! - **Crash consistency**: every file commits in a single transaction
//!
//! ## Architecture
//!
//! - **[`codec`]**: Markdown parsing into a [`codec::ParsedDocument`]
//! - **[`nodekey`]**: Permalink and lookup key normalization
//! - **[`changes`]**: Directory scans, checksums and change sets
//! - **[`db`]**: The SQLite schema and per-file index transactions
//! - **[`identity`]**: Permalink assignment and relation resolution
//! - **[`search`]** / **[`query`]**: Full-text index maintenance and read access
//! - **[`sync`]**: The per-project [`sync::SyncCoordinator`]
//! - **[`registry`]**: Project registration and lifecycle
//! - **[`watch`]**: The [`watch::WatchService`] running one watcher and sync loop per active project
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use notebase_core::{
//!     query::{search_text, SearchQuery},
//!     watch::WatchService,
//! };
//! use std::{path::PathBuf, sync::mpsc::channel};
//!
//! let (tx, _rx) = channel();
//! let service = WatchService::new(PathBuf::from("/workspace"), tx)?;
//! let project = service.add_project("notes", &PathBuf::from("/workspace/notes"))?;
//! let report = service.sync_now("notes")?;
//! println!("{} files changed", report.changed());
//!
//! let db = service.db_connection();
//! let page = service.block_on(search_text(&db, project.id, &SearchQuery::text("coffee").into()))?;
//! for hit in page.results {
//!     println!("{} {}", hit.permalink, hit.score);
//! }
//! # Ok::<(), notebase_core::NotebaseError>(())
//! ```
//!
//! ## Features
//!
//! - **service** (default): SQLite index (`sqlx`), file watching (`notify`) and synchronization
//! - **stemming**: English stemming of indexed text and query terms
//! - **demo**: logging setup for the `watch_project` demo
//!
//! Without `service` only the codec, permalink rules and change detection primitives are built.

pub mod changes;
pub mod codec;
#[cfg(feature = "service")]
pub mod commands;
pub mod config;
#[cfg(feature = "service")]
pub mod db;
pub mod error;
pub mod event;
#[cfg(feature = "service")]
pub mod identity;
pub mod nodekey;
pub mod paths;
pub mod properties;
#[cfg(feature = "service")]
pub mod query;
#[cfg(feature = "service")]
pub mod registry;
#[cfg(feature = "service")]
pub mod search;
pub mod status;
#[cfg(feature = "service")]
pub mod sync;
#[cfg(test)]
mod tests;
#[cfg(feature = "service")]
pub mod watch;

pub use error::*;
