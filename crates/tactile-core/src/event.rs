//! Event records
//!
//! An input event is a variable-length binary record: a fixed 24-byte
//! header followed by an opaque payload whose layout is owned by the
//! event type.
//!
//! ```text
//! 0        4        8        12       16                24
//! +--------+--------+--------+--------+-----------------+------------
//! | type   | size   | device | id     | time (f64)      | payload ...
//! +--------+--------+--------+--------+-----------------+------------
//! ```
//!
//! All fields are little-endian. `size` covers header and payload. Inside
//! the event queue records are padded to `RECORD_ALIGNMENT`.

use std::fmt;

use bytes::Bytes;

use crate::{DeviceId, EventId, InputTime, TactileError, TactileResult};

/// Size of the fixed event header
pub const EVENT_HEADER_SIZE: usize = 24;

/// Alignment of packed records inside a queue buffer
pub const RECORD_ALIGNMENT: usize = 8;

/// Round a record size up to the packed-record stride
#[inline]
pub const fn aligned_size(size: usize) -> usize {
    (size + RECORD_ALIGNMENT - 1) & !(RECORD_ALIGNMENT - 1)
}

/// Four-character type code
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const NONE: FourCC = FourCC([0; 4]);

    #[inline]
    pub const fn new(code: &[u8; 4]) -> Self {
        FourCC(*code)
    }

    #[inline]
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    #[inline]
    pub fn from_u32(value: u32) -> Self {
        FourCC(value.to_le_bytes())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

/// Well-known event type codes
pub mod event_types {
    use super::FourCC;

    /// Full state snapshot of a device
    pub const STATE: FourCC = FourCC::new(b"STAT");
    /// Partial state change
    pub const DELTA: FourCC = FourCC::new(b"DLTA");
    /// Text input
    pub const TEXT: FourCC = FourCC::new(b"TEXT");
    /// Device configuration changed
    pub const CONFIG_CHANGED: FourCC = FourCC::new(b"DCFG");
    /// Device removed
    pub const DEVICE_REMOVED: FourCC = FourCC::new(b"DREM");
}

/// Fixed event header
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EventHeader {
    pub event_type: FourCC,
    /// Total record size including this header
    pub size: u32,
    pub device: DeviceId,
    pub id: EventId,
    pub time: InputTime,
}

impl EventHeader {
    pub fn new(event_type: FourCC, device: DeviceId, payload_len: usize, time: InputTime) -> Self {
        EventHeader {
            event_type,
            size: (EVENT_HEADER_SIZE + payload_len) as u32,
            device,
            id: EventId::ZERO,
            time,
        }
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.size as usize).saturating_sub(EVENT_HEADER_SIZE)
    }

    /// Write the header into the first `EVENT_HEADER_SIZE` bytes of `buf`
    pub fn write(&self, buf: &mut [u8]) -> TactileResult<()> {
        if buf.len() < EVENT_HEADER_SIZE {
            return Err(TactileError::BufferTooShort {
                expected: EVENT_HEADER_SIZE,
                actual: buf.len(),
            });
        }
        buf[0..4].copy_from_slice(&self.event_type.0);
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..12].copy_from_slice(&self.device.to_bytes());
        buf[12..16].copy_from_slice(&self.id.0.to_le_bytes());
        buf[16..24].copy_from_slice(&self.time.to_bits().to_le_bytes());
        Ok(())
    }

    /// Parse and validate a header at the start of `buf`
    pub fn parse(buf: &[u8]) -> TactileResult<Self> {
        if buf.len() < EVENT_HEADER_SIZE {
            return Err(TactileError::BufferTooShort {
                expected: EVENT_HEADER_SIZE,
                actual: buf.len(),
            });
        }
        let header = EventHeader {
            event_type: FourCC([buf[0], buf[1], buf[2], buf[3]]),
            size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            device: DeviceId::from_bytes([buf[8], buf[9], buf[10], buf[11]]),
            id: EventId(u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]])),
            time: InputTime::from_bits(u64::from_le_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ])),
        };

        let size = header.size as usize;
        if size < EVENT_HEADER_SIZE {
            return Err(TactileError::InvalidRecord(format!(
                "record size {} smaller than header",
                size
            )));
        }
        if size > buf.len() {
            return Err(TactileError::BufferTooShort {
                expected: size,
                actual: buf.len(),
            });
        }
        Ok(header)
    }

    /// Overwrite the event id of an encoded record in place
    #[inline]
    pub fn patch_id(buf: &mut [u8], id: EventId) {
        buf[12..16].copy_from_slice(&id.0.to_le_bytes());
    }
}

/// Owned event record
///
/// This is what producers build and what consumers copy out of a batch
/// when they need an event to outlive the update callback.
#[derive(Clone, PartialEq)]
pub struct EventRecord {
    pub event_type: FourCC,
    pub device: DeviceId,
    pub id: EventId,
    pub time: InputTime,
    pub payload: Bytes,
}

impl EventRecord {
    pub fn new(event_type: FourCC, device: DeviceId, payload: impl Into<Bytes>) -> Self {
        EventRecord {
            event_type,
            device,
            id: EventId::ZERO,
            time: InputTime::ZERO,
            payload: payload.into(),
        }
    }

    pub fn with_time(mut self, time: InputTime) -> Self {
        self.time = time;
        self
    }

    #[inline]
    pub fn size(&self) -> usize {
        EVENT_HEADER_SIZE + self.payload.len()
    }

    pub fn header(&self) -> EventHeader {
        EventHeader {
            event_type: self.event_type,
            size: self.size() as u32,
            device: self.device,
            id: self.id,
            time: self.time,
        }
    }

    /// Encode to the binary record format
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.size()];
        // Length checked by construction
        let _ = self.header().write(&mut buf);
        buf[EVENT_HEADER_SIZE..].copy_from_slice(&self.payload);
        buf
    }

    /// Decode a record, copying the payload
    pub fn decode(buf: &[u8]) -> TactileResult<Self> {
        let header = EventHeader::parse(buf)?;
        let payload = &buf[EVENT_HEADER_SIZE..header.size as usize];
        Ok(EventRecord {
            event_type: header.event_type,
            device: header.device,
            id: header.id,
            time: header.time,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

impl fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRecord")
            .field("type", &self.event_type)
            .field("device", &self.device)
            .field("id", &self.id)
            .field("time", &self.time)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Borrowed view of one record inside a batch
#[derive(Clone, Copy, Debug)]
pub struct EventView<'a> {
    header: EventHeader,
    payload: &'a [u8],
}

impl<'a> EventView<'a> {
    #[inline]
    pub fn header(&self) -> &EventHeader {
        &self.header
    }

    #[inline]
    pub fn event_type(&self) -> FourCC {
        self.header.event_type
    }

    #[inline]
    pub fn device(&self) -> DeviceId {
        self.header.device
    }

    #[inline]
    pub fn id(&self) -> EventId {
        self.header.id
    }

    #[inline]
    pub fn time(&self) -> InputTime {
        self.header.time
    }

    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Copy the record out of the batch
    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            event_type: self.header.event_type,
            device: self.header.device,
            id: self.header.id,
            time: self.header.time,
            payload: Bytes::copy_from_slice(self.payload),
        }
    }
}

/// A drained batch of packed records
///
/// Borrows the queue's drain buffer, so it cannot outlive the callback
/// it is handed to.
#[derive(Clone, Copy, Debug)]
pub struct EventBatch<'a> {
    bytes: &'a [u8],
    count: usize,
}

impl<'a> EventBatch<'a> {
    /// Wrap a buffer of `count` packed records
    pub fn new(bytes: &'a [u8], count: usize) -> Self {
        EventBatch { bytes, count }
    }

    pub fn empty() -> EventBatch<'static> {
        EventBatch { bytes: &[], count: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Total packed size in bytes
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn iter(&self) -> EventIter<'a> {
        EventIter {
            bytes: self.bytes,
            remaining: self.count,
        }
    }

    /// Copy every record out of the batch
    pub fn to_records(&self) -> Vec<EventRecord> {
        self.iter().map(|view| view.to_record()).collect()
    }
}

impl<'a> IntoIterator for EventBatch<'a> {
    type Item = EventView<'a>;
    type IntoIter = EventIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over packed records
pub struct EventIter<'a> {
    bytes: &'a [u8],
    remaining: usize,
}

impl<'a> Iterator for EventIter<'a> {
    type Item = EventView<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let header = EventHeader::parse(self.bytes).ok()?;
        let size = header.size as usize;
        let payload = &self.bytes[EVENT_HEADER_SIZE..size];
        let stride = aligned_size(size).min(self.bytes.len());
        self.bytes = &self.bytes[stride..];
        self.remaining -= 1;
        Some(EventView { header, payload })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
