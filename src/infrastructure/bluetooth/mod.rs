//! Bluetooth Module
//!
//! Provides BLE communication with the Cosinuss earpiece.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     SensorService                        │
//! │   (event loop - commands, platform events, ticks)        │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!                       ▼
//!              ┌─────────────────┐
//!              │ CosinussManager │──────▶ Aggregator
//!              └────────┬────────┘
//!         ┌─────────────┼─────────────┐
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │
//! │           │  │            │  │          │
//! │ - name    │  │ - CCC      │  │ - UUIDs  │
//! │   filter  │  │   writes   │  │ - Parsing│
//! │ - watchdog│  │   queue    │  │          │
//! └───────────┘  └────────────┘  └──────────┘
//!         │             │
//!         └──────┬──────┘
//!                ▼
//!          BlePlatform (OS stack or simulator)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Characteristic UUIDs and payload decoding
//! - [`platform`] - Commands and events of the platform Bluetooth stack
//! - [`scanner`] - BLE device discovery with restart watchdog
//! - [`connection`] - Notification subscription over a serialized write queue
//! - [`manager`] - Pairing and connection state machine
//! - [`service`] - Event loop and application handle
//! - [`system`] - Operating system Bluetooth stack via btleplug
//! - [`simulated`] - In-process platform for tests and the demo

pub mod connection;
pub mod manager;
pub mod platform;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod system;

// Re-export main service for convenience
pub use service::{CosinussHandle, SensorService, SensorServiceConfig};
