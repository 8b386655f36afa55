//! Domain layer: sensor data types, aggregation, settings and status.

pub mod aggregator;
pub mod clock;
pub mod error;
pub mod models;
pub mod quality;
pub mod reminder;
pub mod sensor;
pub mod settings;
pub mod status;
