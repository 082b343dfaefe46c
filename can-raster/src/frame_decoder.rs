//! Frame Decoding Engine
//!
//! Extracts physical signal values from raw CAN payloads. The decoder is
//! compiled once per signal database into an identifier-indexed table; each
//! compiled signal carries a precomputed bit plan so the per-frame work is a
//! hash lookup plus bit extraction.

use crate::outcome::DecodeErrorKind;
use crate::signals::database::{ByteOrder, MessageDefinition, SignalDatabase, SignalDefinition, ValueType};
use crate::types::CAN_ID_MASK;
use byteorder::{ByteOrder as _, LittleEndian};
use std::collections::{BTreeSet, HashMap};

/// How the bits of one signal are laid out in the payload
#[derive(Debug, Clone)]
enum BitPlan {
    /// Intel layout: contiguous bits starting at the LSB
    LittleEndian { start_bit: usize, length: usize },
    /// Motorola layout: absolute payload bit positions, MSB first
    BigEndian { positions: Vec<usize> },
}

#[derive(Debug, Clone)]
struct CompiledSignal {
    name: String,
    plan: BitPlan,
    length: usize,
    value_type: ValueType,
    factor: f64,
    offset: f64,
    /// Payload bytes needed to extract this signal
    required_bytes: usize,
    /// Multiplexer values selecting this signal (None if always present)
    mux_values: Option<Vec<u64>>,
}

#[derive(Debug, Clone)]
struct CompiledMessage {
    name: String,
    signals: Vec<CompiledSignal>,
    /// Index of the multiplexer switch in `signals`
    multiplexer: Option<usize>,
    /// Every multiplexer value some signal group is defined for
    mux_groups: BTreeSet<u64>,
}

/// Decoder for one signal database
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    messages: HashMap<u32, CompiledMessage>,
}

impl FrameDecoder {
    /// Compile every message of a database
    pub fn new(database: &SignalDatabase) -> Self {
        let messages = database
            .messages()
            .map(|msg| (msg.id & CAN_ID_MASK, compile_message(msg)))
            .collect::<HashMap<_, _>>();

        log::debug!(
            "Compiled {} messages from {:?}",
            messages.len(),
            database.source()
        );

        Self { messages }
    }

    /// Number of compiled messages
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// True if the identifier is defined in the database
    pub fn knows(&self, can_id: u32) -> bool {
        self.messages.contains_key(&(can_id & CAN_ID_MASK))
    }

    /// Name of the message defined for an identifier
    pub fn message_name(&self, can_id: u32) -> Option<&str> {
        self.messages
            .get(&(can_id & CAN_ID_MASK))
            .map(|msg| msg.name.as_str())
    }

    /// Decode one frame, handing each `(signal name, physical value)` to `sink`
    ///
    /// Returns the number of values emitted. Nothing is emitted when an error
    /// is returned.
    pub fn decode_with<F>(&self, can_id: u32, payload: &[u8], mut sink: F) -> Result<usize, DecodeErrorKind>
    where
        F: FnMut(&str, f64),
    {
        let message = self
            .messages
            .get(&(can_id & CAN_ID_MASK))
            .ok_or(DecodeErrorKind::UnknownMessage)?;

        let mux_value = match message.multiplexer {
            Some(idx) => {
                let switch = &message.signals[idx];
                if switch.required_bytes > payload.len() {
                    return Err(DecodeErrorKind::MalformedPayload);
                }
                let value = extract_raw(payload, &switch.plan) as u64;
                if !message.mux_groups.contains(&value) {
                    return Err(DecodeErrorKind::MultiplexerMismatch);
                }
                Some(value)
            }
            None => None,
        };

        let is_active = |signal: &CompiledSignal| match (&signal.mux_values, mux_value) {
            (None, _) => true,
            (Some(values), Some(current)) => values.contains(&current),
            (Some(_), None) => false,
        };

        // Check every active signal fits before emitting anything
        if message
            .signals
            .iter()
            .any(|signal| is_active(signal) && signal.required_bytes > payload.len())
        {
            return Err(DecodeErrorKind::MalformedPayload);
        }

        let mut emitted = 0;
        for signal in message.signals.iter().filter(|s| is_active(s)) {
            sink(&signal.name, physical_value(payload, signal));
            emitted += 1;
        }

        Ok(emitted)
    }

    /// Decode one frame into owned `(signal name, physical value)` pairs
    pub fn decode(&self, can_id: u32, payload: &[u8]) -> Result<Vec<(String, f64)>, DecodeErrorKind> {
        let mut values = Vec::new();
        self.decode_with(can_id, payload, |name, value| {
            values.push((name.to_string(), value))
        })?;
        Ok(values)
    }
}

fn compile_message(msg: &MessageDefinition) -> CompiledMessage {
    let signals: Vec<CompiledSignal> = msg.signals.iter().map(compile_signal).collect();

    let multiplexer = msg
        .multiplexer_signal
        .as_ref()
        .and_then(|name| signals.iter().position(|s| &s.name == name));

    let mux_groups = signals
        .iter()
        .filter_map(|s| s.mux_values.as_ref())
        .flatten()
        .copied()
        .collect();

    CompiledMessage {
        name: msg.name.clone(),
        signals,
        multiplexer,
        mux_groups,
    }
}

fn compile_signal(signal: &SignalDefinition) -> CompiledSignal {
    let start_bit = signal.start_bit as usize;
    let length = signal.length as usize;

    let (plan, required_bytes) = match signal.byte_order {
        ByteOrder::LittleEndian => (
            BitPlan::LittleEndian { start_bit, length },
            (start_bit + length + 7) / 8,
        ),
        ByteOrder::BigEndian => {
            let positions = motorola_positions(start_bit, length);
            let required = positions.iter().max().map(|p| p / 8 + 1).unwrap_or(0);
            (BitPlan::BigEndian { positions }, required)
        }
    };

    CompiledSignal {
        name: signal.name.clone(),
        plan,
        length,
        value_type: signal.value_type,
        factor: signal.factor,
        offset: signal.offset,
        required_bytes,
        mux_values: signal
            .multiplexer_info
            .as_ref()
            .map(|info| info.multiplexer_values.clone()),
    }
}

/// Payload bit positions of a Motorola signal, MSB first
///
/// DBC numbers Motorola start bits at the MSB using the sawtooth layout:
/// within a byte the walk goes from bit 7 down to bit 0, then continues at
/// bit 7 of the next byte.
fn motorola_positions(start_bit: usize, length: usize) -> Vec<usize> {
    let mut positions = Vec::with_capacity(length);
    let mut pos = start_bit;
    for _ in 0..length {
        positions.push(pos);
        if pos % 8 == 0 {
            pos += 15;
        } else {
            pos -= 1;
        }
    }
    positions
}

fn physical_value(payload: &[u8], signal: &CompiledSignal) -> f64 {
    let raw = extract_raw(payload, &signal.plan);
    let raw = match signal.value_type {
        ValueType::Unsigned => raw as f64,
        ValueType::Signed => sign_extend(raw, signal.length) as f64,
    };
    signal.offset + signal.factor * raw
}

fn extract_raw(payload: &[u8], plan: &BitPlan) -> u64 {
    match plan {
        BitPlan::LittleEndian { start_bit, length } => {
            extract_little_endian(payload, *start_bit, *length)
        }
        BitPlan::BigEndian { positions } => extract_big_endian(payload, positions),
    }
}

/// Extract an Intel signal: start bit is the LSB, bits ascend through the payload
fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
    if length == 0 {
        return 0;
    }
    if data.len() <= 8 && start_bit + length <= 64 {
        let mut padded = [0u8; 8];
        padded[..data.len()].copy_from_slice(data);
        let word = LittleEndian::read_u64(&padded) >> start_bit;
        return if length >= 64 {
            word
        } else {
            word & ((1u64 << length) - 1)
        };
    }

    let mut result: u64 = 0;
    for i in 0..length.min(64) {
        let bit_pos = start_bit + i;
        let byte_idx = bit_pos / 8;
        if byte_idx < data.len() {
            let bit_value = (data[byte_idx] >> (bit_pos % 8)) & 0x01;
            result |= (bit_value as u64) << i;
        }
    }
    result
}

/// Extract a Motorola signal from its precomputed bit positions
fn extract_big_endian(data: &[u8], positions: &[usize]) -> u64 {
    positions.iter().fold(0u64, |acc, &pos| {
        let bit = data
            .get(pos / 8)
            .map(|byte| (byte >> (pos % 8)) & 0x01)
            .unwrap_or(0);
        (acc << 1) | bit as u64
    })
}

/// Sign-extend a value from N bits to 64 bits
fn sign_extend(value: u64, bit_length: usize) -> i64 {
    if bit_length == 0 || bit_length >= 64 {
        return value as i64;
    }

    let sign_bit = 1u64 << (bit_length - 1);
    if (value & sign_bit) != 0 {
        let mask = !0u64 << bit_length;
        (value | mask) as i64
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::database::MultiplexerInfo;

    fn signal(name: &str, start_bit: u16, length: u16, byte_order: ByteOrder) -> SignalDefinition {
        SignalDefinition {
            name: name.to_string(),
            start_bit,
            length,
            byte_order,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            unit: None,
            multiplexer_info: None,
        }
    }

    fn message(id: u32, signals: Vec<SignalDefinition>) -> MessageDefinition {
        MessageDefinition {
            id,
            name: format!("Msg_{:X}", id),
            size: 8,
            sender: None,
            signals,
            is_multiplexed: false,
            multiplexer_signal: None,
        }
    }

    fn decoder_for(messages: Vec<MessageDefinition>) -> FrameDecoder {
        let mut db = SignalDatabase::new("test.dbc");
        for msg in messages {
            db.add_message(msg);
        }
        FrameDecoder::new(&db)
    }

    #[test]
    fn test_extract_little_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract_little_endian(&data, 0, 8), 0xAB);
    }

    #[test]
    fn test_extract_little_endian_cross_byte() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        assert_eq!(extract_little_endian(&data, 0, 16), 0xCDAB);
        assert_eq!(extract_little_endian(&data, 4, 8), 0xDA);
    }

    #[test]
    fn test_extract_little_endian_fd_payload() {
        let mut data = vec![0u8; 16];
        data[10] = 0x34;
        data[11] = 0x12;
        assert_eq!(extract_little_endian(&data, 80, 16), 0x1234);
    }

    #[test]
    fn test_extract_big_endian_simple() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        let positions = motorola_positions(7, 8);
        assert_eq!(extract_big_endian(&data, &positions), 0xAB);
    }

    #[test]
    fn test_extract_big_endian_cross_byte() {
        let data = vec![0xAB, 0xCD, 0xEF, 0x12];
        let positions = motorola_positions(7, 16);
        assert_eq!(positions[7], 0);
        assert_eq!(positions[8], 15);
        assert_eq!(extract_big_endian(&data, &positions), 0xABCD);
    }

    #[test]
    fn test_extract_big_endian_nibble() {
        // Upper nibble of byte 1
        let data = vec![0x00, 0xA5];
        let positions = motorola_positions(15, 4);
        assert_eq!(extract_big_endian(&data, &positions), 0xA);
    }

    #[test]
    fn test_sign_extend_positive() {
        assert_eq!(sign_extend(0x7F, 8), 127);
    }

    #[test]
    fn test_sign_extend_negative() {
        assert_eq!(sign_extend(0xFF, 8), -1);
    }

    #[test]
    fn test_sign_extend_negative_16bit() {
        assert_eq!(sign_extend(0x8000, 16), -32768);
    }

    #[test]
    fn test_physical_value_scaling() {
        let mut speed = signal("WhlSpdFL_122", 0, 16, ByteOrder::LittleEndian);
        speed.factor = 0.01;
        speed.offset = -1.0;
        let decoder = decoder_for(vec![message(0x122, vec![speed])]);

        let values = decoder.decode(0x122, &[0x10, 0x27, 0, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].0, "WhlSpdFL_122");
        assert!((values[0].1 - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_signed_signal() {
        let mut temp = signal("Temp", 0, 8, ByteOrder::LittleEndian);
        temp.value_type = ValueType::Signed;
        let decoder = decoder_for(vec![message(0x10, vec![temp])]);

        let values = decoder.decode(0x10, &[0xFE]).unwrap();
        assert_eq!(values[0].1, -2.0);
    }

    #[test]
    fn test_unknown_message() {
        let decoder = decoder_for(vec![message(0x10, vec![signal("A", 0, 8, ByteOrder::LittleEndian)])]);
        assert_eq!(decoder.decode(0x11, &[0]), Err(DecodeErrorKind::UnknownMessage));
    }

    #[test]
    fn test_extended_id_matches_masked_definition() {
        let decoder = decoder_for(vec![message(
            0x8000_0123,
            vec![signal("A", 0, 8, ByteOrder::LittleEndian)],
        )]);
        assert!(decoder.knows(0x123));
        assert_eq!(decoder.decode(0x123, &[7]).unwrap(), vec![("A".to_string(), 7.0)]);
    }

    #[test]
    fn test_short_payload_is_malformed() {
        let decoder = decoder_for(vec![message(
            0x10,
            vec![
                signal("A", 0, 8, ByteOrder::LittleEndian),
                signal("B", 8, 16, ByteOrder::LittleEndian),
            ],
        )]);

        let mut seen = Vec::new();
        let result = decoder.decode_with(0x10, &[1, 2], |name, _| seen.push(name.to_string()));
        assert_eq!(result, Err(DecodeErrorKind::MalformedPayload));
        assert!(seen.is_empty());
    }

    #[test]
    fn test_multiplexed_message() {
        let mode = signal("Mode", 0, 8, ByteOrder::LittleEndian);
        let mut a = signal("SignalA", 8, 8, ByteOrder::LittleEndian);
        a.multiplexer_info = Some(MultiplexerInfo {
            multiplexer_signal: "Mode".to_string(),
            multiplexer_values: vec![0],
        });
        let mut b = signal("SignalB", 8, 8, ByteOrder::LittleEndian);
        b.multiplexer_info = Some(MultiplexerInfo {
            multiplexer_signal: "Mode".to_string(),
            multiplexer_values: vec![1],
        });
        let mut msg = message(0x200, vec![mode, a, b]);
        msg.is_multiplexed = true;
        msg.multiplexer_signal = Some("Mode".to_string());
        let decoder = decoder_for(vec![msg]);

        let values = decoder.decode(0x200, &[1, 42]).unwrap();
        assert_eq!(
            values,
            vec![("Mode".to_string(), 1.0), ("SignalB".to_string(), 42.0)]
        );

        assert_eq!(
            decoder.decode(0x200, &[5, 42]),
            Err(DecodeErrorKind::MultiplexerMismatch)
        );
    }
}
