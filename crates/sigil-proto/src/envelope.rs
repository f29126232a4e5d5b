//! Transport envelope.
//!
//! Everything the transport carries is an [`Envelope`]: a fixed 69-byte
//! header followed by the payload. The receiver routes on the fingerprint
//! alone; the MAC authenticates the payload under whichever key the
//! fingerprint selects.
//!
//! ```text
//! [ kind : 1 ][ fingerprint : 32 ][ mac : 32 ][ payload len : 4 (BE) ][ payload ]
//! ```

use bytes::{BufMut, Bytes};
use sigil_crypto::{FINGERPRINT_LEN, Fingerprint, MAC_LEN};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::{ProtocolError, Result};

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Channel request, routed by request fingerprint
    Request = 0x01,
    /// Request that replaces an existing channel
    Reset = 0x02,
    /// Reply to a request, routed by ownership proof fingerprint
    Confirm = 0x03,
    /// Requester's acknowledgement of a confirm (end-to-end encrypted)
    Ack = 0x10,
    /// New ratchet public key offered during rekey (end-to-end encrypted)
    RekeyTrigger = 0x11,
    /// Receipt of a rekey trigger (end-to-end encrypted)
    RekeyConfirm = 0x12,
    /// Application message (end-to-end encrypted)
    Message = 0x20,
}

impl MessageKind {
    /// Decode a kind byte.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownKind` for unassigned bytes
    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x01 => Self::Request,
            0x02 => Self::Reset,
            0x03 => Self::Confirm,
            0x10 => Self::Ack,
            0x11 => Self::RekeyTrigger,
            0x12 => Self::RekeyConfirm,
            0x20 => Self::Message,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }

    /// Whether the payload is a negotiation format rather than channel
    /// ciphertext.
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Request | Self::Reset | Self::Confirm)
    }
}

/// Fixed envelope header.
///
/// All fields are byte arrays, so every 69-byte pattern is a valid header.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct EnvelopeHeader {
    kind: u8,
    fingerprint: [u8; FINGERPRINT_LEN],
    mac: [u8; MAC_LEN],
    payload_size: [u8; 4],
}

impl EnvelopeHeader {
    /// Serialized header size.
    pub const SIZE: usize = 1 + FINGERPRINT_LEN + MAC_LEN + 4;

    /// Maximum payload size (64 KiB).
    pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024;
}

/// Routed transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Payload type
    pub kind: MessageKind,
    /// Routing tag
    pub fingerprint: Fingerprint,
    /// MAC over `payload`
    pub mac: [u8; MAC_LEN],
    /// Negotiation format or channel ciphertext
    pub payload: Bytes,
}

impl Envelope {
    /// Build an envelope.
    pub fn new(
        kind: MessageKind,
        fingerprint: Fingerprint,
        mac: [u8; MAC_LEN],
        payload: impl Into<Bytes>,
    ) -> Self {
        Self { kind, fingerprint, mac, payload: payload.into() }
    }

    /// Split channel ciphertext (`MAC || body`) into an envelope.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TooShort` if `ciphertext` has no room for a MAC
    pub fn from_ciphertext(
        kind: MessageKind,
        fingerprint: Fingerprint,
        ciphertext: &[u8],
    ) -> Result<Self> {
        if ciphertext.len() < MAC_LEN {
            return Err(ProtocolError::TooShort {
                what: "channel ciphertext",
                expected: MAC_LEN,
                actual: ciphertext.len(),
            });
        }
        let (mac, body) = ciphertext.split_at(MAC_LEN);
        let mut tag = [0u8; MAC_LEN];
        tag.copy_from_slice(mac);
        Ok(Self::new(kind, fingerprint, tag, Bytes::copy_from_slice(body)))
    }

    /// Rejoin into channel ciphertext (`MAC || body`).
    pub fn to_ciphertext(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAC_LEN + self.payload.len());
        out.extend_from_slice(&self.mac);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Write header and payload.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TooLarge` if the payload exceeds
    ///   [`EnvelopeHeader::MAX_PAYLOAD_SIZE`]
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let max = EnvelopeHeader::MAX_PAYLOAD_SIZE as usize;
        if self.payload.len() > max {
            return Err(ProtocolError::TooLarge {
                what: "envelope payload",
                size: self.payload.len(),
                max,
            });
        }

        let header = EnvelopeHeader {
            kind: self.kind as u8,
            fingerprint: *self.fingerprint.as_bytes(),
            mac: self.mac,
            payload_size: (self.payload.len() as u32).to_be_bytes(),
        };
        dst.put_slice(header.as_bytes());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Parse from bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::TooShort` if the header or declared payload is cut off
    /// - `ProtocolError::UnknownKind` for unassigned kinds
    /// - `ProtocolError::TooLarge` if the declared payload exceeds the maximum
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (header, rest) =
            EnvelopeHeader::ref_from_prefix(bytes).map_err(|_| ProtocolError::TooShort {
                what: "envelope header",
                expected: EnvelopeHeader::SIZE,
                actual: bytes.len(),
            })?;

        let kind = MessageKind::from_u8(header.kind)?;
        let size = u32::from_be_bytes(header.payload_size);
        if size > EnvelopeHeader::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::TooLarge {
                what: "envelope payload",
                size: size as usize,
                max: EnvelopeHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }
        let size = size as usize;
        if rest.len() < size {
            return Err(ProtocolError::TooShort {
                what: "envelope payload",
                expected: EnvelopeHeader::SIZE + size,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            kind,
            fingerprint: Fingerprint::new(header.fingerprint),
            mac: header.mac,
            payload: Bytes::copy_from_slice(&rest[..size]),
        })
    }
}
