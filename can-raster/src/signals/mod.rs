//! Signal database and DBC parser
//!
//! `dbc` turns a DBC file into message definitions; `database` holds them
//! keyed by CAN ID for the frame decoder.

pub mod database;
pub mod dbc;

// Re-export key types for convenience
pub use database::{
    ByteOrder, DatabaseStats, MessageDefinition, MultiplexerInfo, SignalDatabase,
    SignalDefinition, ValueType,
};
