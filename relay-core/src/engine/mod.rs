//! The stream interception engine.
//!
//! Competing protocol parsers cooperatively inspect the same live duplex
//! byte stream, decide which one matches, optionally mutate or replay
//! bytes, and hand control back to raw proxying when finished.

pub mod conn;
pub mod error;
pub mod interceptor;
pub mod registry;
pub mod ring;
pub mod shadow;
pub mod view;

pub use conn::{ConnOutcome, ConnShared};
pub use error::EngineError;
pub use interceptor::{Instance, PluginSet, ProtocolPlugin, Status};
pub use view::StreamView;
