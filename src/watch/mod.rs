// src/watch/mod.rs

//! Event-log change detection.
//!
//! This module wires up a cross-platform filesystem watcher (`notify`) on
//! the node event log, plus a poll ticker as fallback. Both only say "the
//! log may have grown"; reading and parsing happen in the runtime.

pub mod watcher;

pub use watcher::{spawn_log_poller, spawn_log_watcher, WatcherHandle};
