//! Fuzz target for `Envelope::decode` and `ChannelPayload::decode`.
//!
//! Arbitrary bytes must either decode or return an error. A decoded envelope
//! re-encodes to the prefix it was read from.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sigil_proto::{ChannelPayload, Envelope, MessageKind};

const KINDS: [MessageKind; 7] = [
    MessageKind::Request,
    MessageKind::Reset,
    MessageKind::Confirm,
    MessageKind::Ack,
    MessageKind::RekeyTrigger,
    MessageKind::RekeyConfirm,
    MessageKind::Message,
];

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::decode(data) {
        let mut encoded = Vec::new();
        envelope.encode(&mut encoded).unwrap();
        assert_eq!(encoded.as_slice(), &data[..encoded.len()]);
    }

    // CBOR bodies under every kind, including ones that never carry CBOR
    for kind in KINDS {
        let _ = ChannelPayload::decode(kind, data);
    }
});
