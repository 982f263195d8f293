//! # relink-core
//!
//! Core logic for relink: keep paired BLE peripherals connected and record
//! everything that happens to them.
//!
//! This crate provides:
//! - A durable pairing registry shared by the foreground and background processes
//! - A connection tracker that auto-connects paired devices when they are discovered
//! - A bounded, time-windowed event log per device
//! - A watch loop that keeps scanning alive while anything is paired
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`storage`] - Key-value persistence (file-backed and in-memory)
//! - [`pairing`] - The set of paired device ids
//! - [`log_entry`] / [`log_store`] - Event records and their per-device store
//! - [`tracker`] - The auto-reconnect actor and its handle
//! - [`bus`] - Broadcast of tracker events to observers
//! - [`watch`] - Periodic re-arm loop for the background process
//! - [`radio`], [`notify`], [`autostart`] - Platform collaborators
//! - [`config`] - Configuration loading, saving, and validation
//! - [`logging`] - Tracing subscriber setup
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod autostart;
pub mod bus;
pub mod config;
pub mod error;
pub mod log_entry;
pub mod log_store;
pub mod logging;
pub mod notify;
pub mod pairing;
pub mod radio;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod watch;

// Re-export primary types for convenience
pub use autostart::{AutostartError, AutostartHook, SystemdUserUnit};
pub use bus::{EventBus, StatusLevel, Subscription, TrackerEvent};
pub use config::{
    Config, ConfigError, ConfigResult, LoggingConfig, RetentionConfig, ServerConfig,
    StorageConfig, TrackerConfig, WatchConfig,
};
pub use error::{RelinkError, Result};
pub use log_entry::{format_hex, parse_hex, printable_text, Direction, LogEntry, LogKind};
pub use log_store::{LogStore, RetentionPolicy};
pub use notify::{Notifier, NotifyError, TracingNotifier};
pub use pairing::PairingRegistry;
#[cfg(feature = "bluetooth")]
pub use radio::BluezRadio;
#[cfg(any(test, feature = "mock-radio"))]
pub use radio::{ConnectBehavior, MockRadio};
#[cfg(any(test, feature = "bluetooth", feature = "mock-radio"))]
pub use radio::platform_radio;
pub use radio::{Radio, RadioError, RadioResult};
pub use storage::{default_data_dir, FileStore, KeyValueStore, MemoryStore, StorageError};
pub use tracker::{Tracker, TrackerHandle};
pub use types::{
    is_valid_mac_address, CharacteristicRef, ConnectionEvent, ConnectionState, DeviceId,
    DiscoveredDevice, DiscoveryEvent,
};
pub use watch::{WatchExit, WatchLoop};
