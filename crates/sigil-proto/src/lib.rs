//! Sigil Wire Formats
//!
//! Byte layouts for everything exchanged between two Sigil peers:
//!
//! - [`Envelope`]: the routed transport unit (`kind`, fingerprint, MAC,
//!   payload)
//! - [`BaseFormat`] / [`EcrFormat`] / [`RequestFormat`]: nested negotiation
//!   framing that exactly fills one transport payload
//! - [`ChannelPayload`]: CBOR bodies of end-to-end encrypted channel messages
//!
//! This crate only frames bytes. Encryption, authentication and replay checks
//! live in `sigil-crypto` and `sigil-core`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod envelope;
pub mod errors;
pub mod formats;
pub mod partner;
pub mod payloads;
pub mod version;

pub use envelope::{Envelope, EnvelopeHeader, MessageKind};
pub use errors::{ProtocolError, Result};
pub use formats::{BaseFormat, EcrFormat, FACT_TERMINATOR, RequestFormat};
pub use partner::PartnerId;
pub use payloads::{Ack, AppMessage, ChannelPayload, RekeyConfirm, RekeyTrigger};
pub use version::{FormatLayout, WireVersion};
