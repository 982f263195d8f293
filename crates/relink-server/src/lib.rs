//! # relink-server
//!
//! HTTP server library for relink, the foreground process.
//!
//! This library provides the API handlers and shared state; `main.rs` wires
//! them to a radio, the file store, and a running tracker.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod state;
