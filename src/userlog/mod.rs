// src/userlog/mod.rs

//! The append-only job event log ("user log").
//!
//! - [`event`] is the record model.
//! - [`reader`] reads complete records incrementally and resynchronizes
//!   after corruption.
//! - [`writer`] renders and appends records.
//!
//! The DAG engine reads this log to learn about submissions and
//! terminations; the grid job machinery writes to it.

pub mod event;
pub mod reader;
pub mod writer;

pub use event::{LogEvent, LogEventKind, Termination};
pub use reader::{EventLogReader, ReadBatch};
pub use writer::{format_event, UserLogWriter};
