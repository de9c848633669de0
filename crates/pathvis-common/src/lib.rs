//! Shared types for the pathvis daemon.
//!
//! This crate contains:
//! - **Data models** — hops, trace records, destination snapshots
//! - **Protocol messages** — the frames pushed to websocket subscribers

pub mod models;
pub mod protocol;
