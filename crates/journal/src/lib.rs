//! The journal directory: GHAP state machine, session identity, and the
//! hook tool counter.
//!
//! This is the only legitimate shared mutable state in the service. One
//! process owns the directory at a time; all mutations go through a single
//! in-process lock held only around synchronous file operations.

mod fsio;
mod store;

pub use fsio::{append_json_line, read_json_lines, write_atomic};
pub use store::{JournalStore, ResolveGhap, SessionInfo, UpdateGhap};
