//! Event-stream (de)serialization.
//!
//! A serialized program is a flat stream of tagged events: negative tags are
//! builder-level directives (`CreateLabel`, `CreateLocal`, `CreateObject`,
//! `End`), non-negative tags are `(opId << 1) | isEnd` for an operation
//! begin/end, and `emit*` calls serialize as a begin+end pair with no
//! children. Deserializing replays the same event stream into a fresh
//! [`crate::builder::Builder`] driven by the corresponding operation
//! registry: this module owns the wire format and the dense object-id
//! table, not the replay dispatch itself (a front-end already knows how to
//! map an `opId` back onto the right `begin*`/`end*` call).
//!
//! On disk the event stream sits behind a small header: a 4-byte magic,
//! then a CRC32 of everything that follows, so a truncated or bit-flipped
//! trace is caught at load time instead of misparsing into garbage events.

use thiserror::Error;

use crate::constant_pool::Constant;

const MAGIC: [u8; 4] = *b"OPFB";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SerializeError {
    #[error("truncated trace: missing header")]
    TruncatedHeader,
    #[error("not an opforge trace (bad magic)")]
    InvalidMagic,
    #[error("trace checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}

pub const CODE_CREATE_LABEL: i16 = -2;
pub const CODE_CREATE_LOCAL: i16 = -3;
pub const CODE_CREATE_OBJECT: i16 = -4;
pub const CODE_END: i16 = -5;

fn operation_tag(op_id: u32, is_end: bool) -> i16 {
    ((op_id as i32) << 1 | is_end as i32) as i16
}

fn decode_operation_tag(tag: i16) -> (u32, bool) {
    let raw = tag as i32;
    ((raw >> 1) as u32, raw & 1 == 1)
}

/// One builder-level event in the serialized trace.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CreateLabel,
    CreateLocal,
    /// `objectId` is assigned densely, in first-use order, by the serializer.
    CreateObject(Constant),
    OperationBegin { op_id: u32, immediates: Vec<i16> },
    OperationEnd { op_id: u32 },
    End,
}

/// Encodes a stream of builder events into bytes.
#[derive(Debug, Default)]
pub struct Serializer {
    buffer: Vec<u8>,
    objects: Vec<Constant>,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    fn write_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_event(&mut self, event: &Event) {
        match event {
            Event::CreateLabel => self.write_i16(CODE_CREATE_LABEL),
            Event::CreateLocal => self.write_i16(CODE_CREATE_LOCAL),
            Event::CreateObject(value) => {
                self.write_i16(CODE_CREATE_OBJECT);
                let object_id = self.intern(value.clone());
                self.write_i16(object_id as i16);
            }
            Event::OperationBegin { op_id, immediates } => {
                self.write_i16(operation_tag(*op_id, false));
                self.write_i16(immediates.len() as i16);
                for imm in immediates {
                    self.write_i16(*imm);
                }
            }
            Event::OperationEnd { op_id } => {
                self.write_i16(operation_tag(*op_id, true));
            }
            Event::End => self.write_i16(CODE_END),
        }
    }

    /// Assign a dense id to `value`, reusing an existing one if this exact
    /// constant was already interned.
    fn intern(&mut self, value: Constant) -> usize {
        if let Some(idx) = self.objects.iter().position(|v| *v == value) {
            return idx;
        }
        self.objects.push(value);
        self.objects.len() - 1
    }

    /// Finish the trace: magic + CRC32(payload) header followed by the raw
    /// event bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        let checksum = crc32fast::hash(&self.buffer);
        let mut out = Vec::with_capacity(8 + self.buffer.len());
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&self.buffer);
        out
    }

    pub fn objects(&self) -> &[Constant] {
        &self.objects
    }
}

/// Decodes a byte stream produced by [`Serializer`] back into [`Event`]s.
pub struct Deserializer<'a> {
    bytes: &'a [u8],
    pos: usize,
    objects: &'a [Constant],
}

impl<'a> Deserializer<'a> {
    /// Validate the header and checksum, then build a deserializer over the
    /// payload that follows.
    pub fn new(bytes: &'a [u8], objects: &'a [Constant]) -> Result<Self, SerializeError> {
        if bytes.len() < 8 {
            return Err(SerializeError::TruncatedHeader);
        }
        if bytes[0..4] != MAGIC {
            return Err(SerializeError::InvalidMagic);
        }
        let expected = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let payload = &bytes[8..];
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(SerializeError::ChecksumMismatch { expected, actual });
        }
        Ok(Self { bytes: payload, pos: 0, objects })
    }

    fn read_i16(&mut self) -> Option<i16> {
        if self.pos + 2 > self.bytes.len() {
            return None;
        }
        let value = i16::from_le_bytes(self.bytes[self.pos..self.pos + 2].try_into().unwrap());
        self.pos += 2;
        Some(value)
    }

    pub fn next_event(&mut self) -> Option<Event> {
        let tag = self.read_i16()?;
        match tag {
            CODE_CREATE_LABEL => Some(Event::CreateLabel),
            CODE_CREATE_LOCAL => Some(Event::CreateLocal),
            CODE_CREATE_OBJECT => {
                let object_id = self.read_i16()? as usize;
                Some(Event::CreateObject(self.objects[object_id].clone()))
            }
            CODE_END => Some(Event::End),
            _ => {
                let (op_id, is_end) = decode_operation_tag(tag);
                if is_end {
                    Some(Event::OperationEnd { op_id })
                } else {
                    let count = self.read_i16()? as usize;
                    let mut immediates = Vec::with_capacity(count);
                    for _ in 0..count {
                        immediates.push(self.read_i16()?);
                    }
                    Some(Event::OperationBegin { op_id, immediates })
                }
            }
        }
    }
}

/// Decode an entire stream at once, for callers that want the whole trace
/// before replaying it (rather than streaming event-by-event).
pub fn decode_all(bytes: &[u8], objects: &[Constant]) -> Result<Vec<Event>, SerializeError> {
    let mut de = Deserializer::new(bytes, objects)?;
    let mut events = Vec::new();
    while let Some(event) = de.next_event() {
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_small_trace() {
        let mut ser = Serializer::new();
        ser.write_event(&Event::CreateLocal);
        ser.write_event(&Event::CreateObject(Constant::Int(42)));
        ser.write_event(&Event::OperationBegin {
            op_id: 3,
            immediates: vec![0],
        });
        ser.write_event(&Event::OperationEnd { op_id: 3 });
        ser.write_event(&Event::End);

        let objects = ser.objects().to_vec();
        let bytes = ser.into_bytes();
        let events = decode_all(&bytes, &objects).unwrap();

        assert_eq!(
            events,
            vec![
                Event::CreateLocal,
                Event::CreateObject(Constant::Int(42)),
                Event::OperationBegin { op_id: 3, immediates: vec![0] },
                Event::OperationEnd { op_id: 3 },
                Event::End,
            ]
        );
    }

    #[test]
    fn duplicate_objects_share_one_dense_id() {
        let mut ser = Serializer::new();
        ser.write_event(&Event::CreateObject(Constant::Str("x".into())));
        ser.write_event(&Event::CreateObject(Constant::Str("x".into())));
        assert_eq!(ser.objects().len(), 1);
    }

    #[test]
    fn operation_tag_round_trips() {
        let tag = operation_tag(12, true);
        assert_eq!(decode_operation_tag(tag), (12, true));
        let tag = operation_tag(12, false);
        assert_eq!(decode_operation_tag(tag), (12, false));
    }

    #[test]
    fn corrupted_trace_fails_the_checksum() {
        let mut ser = Serializer::new();
        ser.write_event(&Event::End);
        let mut bytes = ser.into_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let err = Deserializer::new(&bytes, &[]).unwrap_err();
        assert!(matches!(err, SerializeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn rejects_bytes_without_the_magic_header() {
        let err = Deserializer::new(&[0u8; 8], &[]).unwrap_err();
        assert_eq!(err, SerializeError::InvalidMagic);
    }
}
