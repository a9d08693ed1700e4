//! Tape Signal Engine
//!
//! Wires the feed, the reference-rate fetcher and operator controls into the
//! signal pipeline and risk gate, and writes accepted signals to a sink.

pub mod config;
pub mod control;
pub mod event_bus;
pub mod runtime;
pub mod sink;

pub use config::{create_config_template, save_config, EngineConfig, RuntimeConfig};
pub use control::Control;
pub use event_bus::{run_event_logger, EventBus};
pub use runtime::{run_state_writer, DataClock, Engine, EngineInputs, EngineReport};
pub use sink::JsonLinesSink;
