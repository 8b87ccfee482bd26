//! HTTP and WebSocket surface of the coordinator.
//!
//! Two routers: the coordinator API (register/list/upload/sources/download
//! plus the signaling WebSocket) and a separate file-serving router every
//! deployment binds on the fixed file port so other peers can fetch blobs
//! during orchestrated transfers.

pub mod fileserver;
pub mod server;
pub mod ws;

pub use fileserver::{build_file_router, start_file_server};
pub use server::{start_server, AppState};

#[cfg(test)]
mod server_tests;
