//! Fuzz target for the nested negotiation formats.
//!
//! Decodes arbitrary bytes as a base format, then its encrypted payload and
//! the request payload inside that. No layer may panic, and every layer that
//! decodes must re-encode to the same bytes at the same length.

#![no_main]

use libfuzzer_sys::fuzz_target;
use sigil_proto::{BaseFormat, EcrFormat, RequestFormat};

fuzz_target!(|data: &[u8]| {
    let Ok(base) = BaseFormat::decode(data) else {
        let _ = RequestFormat::decode(data);
        return;
    };
    assert_eq!(base.encode().as_slice(), data);

    let version = base.version();
    let ecr_bytes = base.ecr_payload();
    let Ok(ecr) = EcrFormat::decode(version, ecr_bytes) else {
        return;
    };
    assert_eq!(ecr.encode(version, ecr_bytes.len()).unwrap().as_slice(), ecr_bytes);

    let _ = RequestFormat::decode(&ecr.payload);
});
