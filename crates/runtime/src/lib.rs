//! Service wiring, the tool dispatcher, and the unix-socket server.
//!
//! Every operation the outside world can invoke is a pure function of
//! `(JSON arguments, &Services)`. The dispatcher validates input before any
//! mutation, retries transient store/embed failures once, and converts the
//! error taxonomy into `{"error": {"type", "message"}}` responses at the
//! boundary.

mod args;
mod client;
mod dispatch;
mod ops;
mod server;
mod services;

pub use client::DaemonClient;
pub use dispatch::{dispatch, OPERATIONS};
pub use server::run_server;
pub use services::Services;
