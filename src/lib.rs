//! Keeps a remote code-search index in sync with local git working copies.
//!
//! The engine tracks each workspace folder's branch, reconciles changed files
//! against the server's manifest of already-indexed files, and uploads only
//! what differs, with bounded concurrency. [`indexer::ManagedIndexer`] is the
//! entry point; the collaborator traits in [`collab`] are the seams to git,
//! the network, and the filesystem.

pub mod cmd;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod git;
pub mod indexer;
pub mod listeners;
pub mod manifest;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod store;
pub mod types;
pub mod watcher;

pub use error::{Error, Result};
