//! CBOR bodies of end-to-end encrypted channel messages.
//!
//! The envelope's [`MessageKind`] names the body type, so bodies are encoded
//! without a variant tag.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sigil_crypto::RatchetId;

use crate::{
    MessageKind,
    errors::{ProtocolError, Result},
};

/// Requester's acknowledgement of a confirm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Id of the ratchet pair the confirm established
    pub ratchet_id: RatchetId,
}

/// Offer of a new send-side public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyTrigger {
    /// Id of the ratchet being replaced
    pub previous: RatchetId,
    /// Encoded hybrid public key of the successor
    pub public_key: Vec<u8>,
}

/// Receipt of a [`RekeyTrigger`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyConfirm {
    /// Id of the ratchet the receiver built
    pub ratchet_id: RatchetId,
}

/// Application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMessage {
    /// Opaque application bytes
    pub body: Vec<u8>,
}

/// Decoded body of a channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    /// See [`Ack`]
    Ack(Ack),
    /// See [`RekeyTrigger`]
    RekeyTrigger(RekeyTrigger),
    /// See [`RekeyConfirm`]
    RekeyConfirm(RekeyConfirm),
    /// See [`AppMessage`]
    Message(AppMessage),
}

impl ChannelPayload {
    /// Envelope kind for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ack(_) => MessageKind::Ack,
            Self::RekeyTrigger(_) => MessageKind::RekeyTrigger,
            Self::RekeyConfirm(_) => MessageKind::RekeyConfirm,
            Self::Message(_) => MessageKind::Message,
        }
    }

    /// Serialize the inner struct.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Self::Ack(inner) => to_cbor(inner),
            Self::RekeyTrigger(inner) => to_cbor(inner),
            Self::RekeyConfirm(inner) => to_cbor(inner),
            Self::Message(inner) => to_cbor(inner),
        }
    }

    /// Deserialize the body of an envelope of `kind`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::UnknownKind` if `kind` is a negotiation kind
    /// - `ProtocolError::Serialization` if the body does not decode
    pub fn decode(kind: MessageKind, bytes: &[u8]) -> Result<Self> {
        match kind {
            MessageKind::Ack => from_cbor(bytes).map(Self::Ack),
            MessageKind::RekeyTrigger => from_cbor(bytes).map(Self::RekeyTrigger),
            MessageKind::RekeyConfirm => from_cbor(bytes).map(Self::RekeyConfirm),
            MessageKind::Message => from_cbor(bytes).map(Self::Message),
            MessageKind::Request | MessageKind::Reset | MessageKind::Confirm => {
                Err(ProtocolError::UnknownKind(kind as u8))
            },
        }
    }
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(out)
}

fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Serialization(e.to_string()))
}
