//! Session and offline transaction engine for a walk-up public-service kiosk.
//!
//! The engine is a crux [`App`]: each `update` takes one [`Event`], mutates
//! the [`Model`] and asks the shell for [`Effect`]s through its
//! [`Capabilities`]: rendering, timers, delivery to the back office, queue
//! storage and receipts. The clock and the id source live in the model. The
//! same engine runs on a virtual clock in [`testing::Simulator`] and on
//! tokio in [`shell::Shell`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod app;
pub mod auth;
pub mod capabilities;
pub mod config;
pub mod event;
pub mod model;
pub mod offline_store;
pub mod outbox;
pub mod session;
pub mod shell;
pub mod sync;
pub mod testing;
pub mod workflow;

pub use app::{App, Model, ViewModel};
pub use capabilities::{Capabilities, Effect};
pub use config::{ConfigError, KioskConfig};
pub use event::Event;
pub use outbox::{OfflineQueue, QueueError, QueueRecord, MAX_QUEUE_RECORDS};
pub use session::{Screen, ScreenKind, Session};

/// Seconds without activity before a non-admin session is reset.
pub const IDLE_TIMEOUT_SECS: u64 = 120;
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const BASE_RETRY_DELAY_MS: u64 = 1000;
pub const MAX_RETRY_DELAY_MS: u64 = 60000;
pub const JITTER_MAX_MS: u64 = 500;
