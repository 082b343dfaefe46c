//! Signal database
//!
//! Holds the message definitions of one DBC file. A database is loaded once
//! per work unit and never mutated afterwards; the frame decoder compiles it
//! into its lookup table.

use crate::types::{Result, CAN_ID_MASK};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A complete CAN message definition
#[derive(Debug, Clone)]
pub struct MessageDefinition {
    /// CAN message ID (extended flag stripped)
    pub id: u32,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
    /// True if this message has multiplexed signals
    pub is_multiplexed: bool,
    /// Multiplexer signal name (if multiplexed)
    pub multiplexer_signal: Option<String>,
}

/// A CAN signal definition
#[derive(Debug, Clone)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    /// Start bit in the CAN frame (DBC numbering)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Multiplexer info (None if not multiplexed)
    pub multiplexer_info: Option<MultiplexerInfo>,
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

/// The signal database of one DBC file
#[derive(Debug)]
pub struct SignalDatabase {
    /// File the definitions were loaded from
    source: PathBuf,

    /// Message definitions by CAN ID
    messages: HashMap<u32, MessageDefinition>,

    /// Signal name lookup: signal name -> CAN IDs carrying it
    signal_lookup: HashMap<String, Vec<u32>>,
}

impl SignalDatabase {
    /// Create a new empty signal database
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            messages: HashMap::new(),
            signal_lookup: HashMap::new(),
        }
    }

    /// Load a DBC file into a fresh database
    pub fn load(path: &Path) -> Result<Self> {
        let messages = crate::signals::dbc::parse_dbc_file(path)?;

        let mut db = Self::new(path);
        for message in messages {
            db.add_message(message);
        }

        let stats = db.stats();
        log::info!(
            "Database {:?}: {} messages, {} signals",
            path,
            stats.num_messages,
            stats.num_signals
        );
        Ok(db)
    }

    /// Add a message definition to the database
    ///
    /// The first definition for a CAN ID wins; later duplicates are ignored.
    pub fn add_message(&mut self, mut message: MessageDefinition) {
        message.id &= CAN_ID_MASK;
        let can_id = message.id;

        if let Some(existing) = self.messages.get(&can_id) {
            log::warn!(
                "Duplicate definition for CAN ID 0x{:X} ({} vs {}), keeping the first",
                can_id,
                existing.name,
                message.name
            );
            return;
        }

        for signal in &message.signals {
            self.signal_lookup
                .entry(signal.name.clone())
                .or_default()
                .push(can_id);
        }

        self.messages.insert(can_id, message);
    }

    /// Get the message definition for a CAN ID
    pub fn get_message(&self, can_id: u32) -> Option<&MessageDefinition> {
        self.messages.get(&(can_id & CAN_ID_MASK))
    }

    /// Iterate over all message definitions
    pub fn messages(&self) -> impl Iterator<Item = &MessageDefinition> {
        self.messages.values()
    }

    /// Find the CAN IDs carrying a signal name
    pub fn find_signal(&self, signal_name: &str) -> &[u32] {
        self.signal_lookup
            .get(signal_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// File the database was loaded from
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Get database statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.values().map(|msg| msg.signals.len()).sum(),
        }
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}
