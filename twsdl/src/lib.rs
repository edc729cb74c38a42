// twsdl/src/lib.rs
// Batch download engine for the Interactive Brokers TWS API

//! # twsdl
//!
//! Downloads historical bars, contract details and account state from TWS
//! and places orders, one request at a time and within the server's pacing
//! limits.
//!
//! - Work comes from job documents (`job_file`) and sits in queues (`todo`)
//! - `orchestrator::TwsDl` runs the connect / dispatch / collect loop
//! - `pacing_god` and `data_farm` decide when the next historical request may go out
//! - Finished requests are written back as answered job documents

mod base;
mod protocol_encoder;
mod protocol_decoder;
mod protocol_dec_parser;
pub mod account;
pub mod clock;
pub mod config;
pub mod conn;
pub mod conn_mock;
pub mod contract;
pub mod data;
pub mod data_farm;
pub mod error_class;
pub mod event;
pub mod job_file;
pub mod orchestrator;
pub mod order;
pub mod pacing;
pub mod pacing_god;
pub mod packet;
pub mod request;
pub mod todo;

pub use base::TwsDlError;
pub use config::{Config, ViolationPolicy};
pub use orchestrator::{RunSummary, TwsDl};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const API_VERSION: i32 = protocol_encoder::PROTOCOL_VERSION;
