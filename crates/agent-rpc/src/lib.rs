//! Instrument agent web API.
//!
//! Exposes driver commands and driver locks from `instrument-agent` over HTTP
//! under `/instrument/api`.

pub mod handlers;
pub mod server;
pub mod setup;

pub use server::{router, start_server, AppState};
