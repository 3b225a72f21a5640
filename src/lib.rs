//! Tails a configured set of log files, parses newly appended text into
//! structured records with regular expressions, and forwards those records
//! as parameterised INSERTs to a PostgreSQL database.
//!
//! The runtime is three cooperating OS threads connected by two bounded
//! queues: [`watcher`] reacts to filesystem events and emits FILE-UPDATE /
//! FILE-CLOSE notifications, [`parser`] turns newly appended bytes into
//! [`row::RowTuple`]s, and [`writer`] batches those rows into PostgreSQL
//! transactions and recovers from connection loss by replaying the rows
//! sent since the last commit.

pub mod config;
pub mod discard;
pub mod error;
pub mod format;
pub mod parser;
pub mod queue;
pub mod row;
pub mod signals;
pub mod table;
pub mod watched;
pub mod watcher;
pub mod writer;

pub use error::{Error, Result};
