//! Property-based tests for negotiation framing and envelopes
//!
//! Decoders face untrusted bytes, so besides round trips these check that
//! arbitrary input is rejected with an error rather than a panic.

use proptest::prelude::*;
use sigil_crypto::{Fingerprint, OwnershipProof};
use sigil_proto::{
    BaseFormat, EcrFormat, Envelope, MessageKind, PartnerId, RequestFormat, WireVersion,
};

fn arbitrary_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![
        Just(MessageKind::Request),
        Just(MessageKind::Reset),
        Just(MessageKind::Confirm),
        Just(MessageKind::Ack),
        Just(MessageKind::RekeyTrigger),
        Just(MessageKind::RekeyConfirm),
        Just(MessageKind::Message),
    ]
}

fn arbitrary_fact() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9@. _-]{1,24}"
}

#[test]
fn prop_envelope_roundtrip() {
    proptest!(|(
        kind in arbitrary_kind(),
        fingerprint in any::<[u8; 32]>(),
        mac in any::<[u8; 32]>(),
        payload in prop::collection::vec(any::<u8>(), 0..2048),
    )| {
        let envelope = Envelope::new(kind, Fingerprint::new(fingerprint), mac, payload);
        let mut buf = Vec::new();
        envelope.encode(&mut buf).unwrap();

        // PROPERTY: decode inverts encode
        prop_assert_eq!(Envelope::decode(&buf).unwrap(), envelope);
    });
}

#[test]
fn prop_request_fills_exactly() {
    proptest!(|(
        sender in any::<[u8; 32]>(),
        facts in prop::collection::vec(arbitrary_fact(), 0..8),
        total in 1024usize..4096,
    )| {
        let version = WireVersion::CURRENT;
        let ecr_len = BaseFormat::ecr_len(version, total).unwrap();
        let inner_len = EcrFormat::payload_len(version, ecr_len).unwrap();

        let request = RequestFormat { sender: PartnerId::new(sender), facts };
        let inner = request.encode(inner_len).unwrap();

        // PROPERTY: every layer is exactly the size its parent leaves
        prop_assert_eq!(inner.len(), inner_len);
        let ecr = EcrFormat {
            ownership: OwnershipProof::new([0; 32]),
            pq_public_key: vec![0; version.layout().pq_key_size],
            payload: inner,
        }
        .encode(version, ecr_len)
        .unwrap();
        let base = BaseFormat::new(version, vec![0; version.layout().public_key_size], ecr)
            .unwrap()
            .encode();
        prop_assert_eq!(base.len(), total);

        // PROPERTY: padding is stripped on decode
        let decoded = BaseFormat::decode(&base).unwrap();
        let ecr = EcrFormat::decode(decoded.version(), decoded.ecr_payload()).unwrap();
        prop_assert_eq!(RequestFormat::decode(&ecr.payload).unwrap(), request);
    });
}

#[test]
fn prop_decoders_reject_garbage_without_panicking() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..600))| {
        // PROPERTY: untrusted input never panics a decoder
        let _ = Envelope::decode(&bytes);
        let _ = BaseFormat::decode(&bytes);
        let _ = EcrFormat::decode(WireVersion::V1, &bytes);
        let _ = RequestFormat::decode(&bytes);
    });
}
