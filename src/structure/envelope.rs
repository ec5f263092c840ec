use speedy::{Endianness, Readable, Writable};
use static_assertions as sa;

use crate::structure::time::Time;

/// The sequence id reserved for the closing marker of a stream.
pub const CLOSING_SEQUENCE_ID: i32 = i32::MAX;

/// Metadata stamped on every message that travels on a stream.
///
/// The wire layout (for components that persist messages) is fixed:
/// 4-byte `source_id`, 4-byte `sequence_id`, 8-byte originating-time ticks,
/// 8-byte creation-time ticks, little-endian.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Readable, Writable)]
pub struct Envelope {
  /// Id of the emitter that posted the message.
  pub source_id: i32,

  /// Per-emitter sequence number. Strictly increasing, starting at 1;
  /// `i32::MAX` is reserved for the closing marker.
  pub sequence_id: i32,

  /// Virtual timestamp of the real-world event the message describes.
  /// This is the scheduling key.
  pub originating_time: Time,

  /// Virtual time at which the message entered the pipeline.
  pub creation_time: Time,
}

sa::assert_eq_size!(Envelope, [u8; 24]);
sa::assert_impl_all!(Envelope: Send, Sync);

impl Envelope {
  pub fn new(source_id: i32, sequence_id: i32, originating_time: Time, creation_time: Time) -> Self {
    Envelope {
      source_id,
      sequence_id,
      originating_time,
      creation_time,
    }
  }

  /// Is this the closing marker of its stream?
  pub fn is_closing(&self) -> bool {
    self.sequence_id == CLOSING_SEQUENCE_ID
  }

  /// Serializes to the persistent wire layout (little-endian).
  pub fn to_wire_bytes(&self) -> Result<Vec<u8>, speedy::Error> {
    self.write_to_vec_with_ctx(Endianness::LittleEndian)
  }

  /// Deserializes from the persistent wire layout (little-endian).
  pub fn from_wire_bytes(bytes: &[u8]) -> Result<Envelope, speedy::Error> {
    Envelope::read_from_buffer_with_ctx(Endianness::LittleEndian, bytes)
  }
}

/// A payload together with its envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
  pub data: T,
  pub envelope: Envelope,
}

impl<T> Message<T> {
  pub fn new(data: T, envelope: Envelope) -> Message<T> {
    Message { data, envelope }
  }

  pub fn originating_time(&self) -> Time {
    self.envelope.originating_time
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn wire_layout_little_endian() {
    let e = Envelope::new(1, 42, Time::from_ticks(10), Time::from_ticks(20));
    let le = e.to_wire_bytes().unwrap();
    assert_eq!(
      le,
      [
        0x01, 0x00, 0x00, 0x00, // source_id
        0x2A, 0x00, 0x00, 0x00, // sequence_id
        0x0A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // originating_time
        0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // creation_time
      ]
    );
    assert_eq!(Envelope::from_wire_bytes(&le).unwrap(), e);
  }

  #[test]
  fn wire_layout_big_endian() {
    let e = Envelope::new(1, 42, Time::from_ticks(10), Time::from_ticks(20));
    let be = e.write_to_vec_with_ctx(Endianness::BigEndian).unwrap();
    assert_eq!(
      be,
      [
        0x00, 0x00, 0x00, 0x01, //
        0x00, 0x00, 0x00, 0x2A, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x0A, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x14, //
      ]
    );
  }

  #[test]
  fn closing_marker() {
    let e = Envelope::new(7, CLOSING_SEQUENCE_ID, Time::from_ticks(1), Time::from_ticks(1));
    assert!(e.is_closing());
    assert!(!Envelope::new(7, 1, Time::from_ticks(1), Time::from_ticks(1)).is_closing());
  }
}
