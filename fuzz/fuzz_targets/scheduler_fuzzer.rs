//! Fuzz target for the key scheduler.
//!
//! Two schedulers over the same secret and salt play sender and receiver
//! while the fuzzer interleaves honest traffic, tampering and replays.
//!
//! # Invariants
//!
//! - Honest ciphertexts decrypt to their plaintext exactly once
//! - Tampered ciphertexts fail and leave the key usable
//! - Replays of consumed keys fail
//! - Arbitrary persisted bytes never panic on load

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sigil_crypto::{CryptoError, EncryptedMessage, KeyScheduler};

#[derive(Debug, Arbitrary)]
struct Scenario {
    secret: [u8; 32],
    salt: Vec<u8>,
    size: u8,
    operations: Vec<Operation>,
    snapshot: Vec<u8>,
}

#[derive(Debug, Arbitrary)]
enum Operation {
    Send(Vec<u8>),
    Tamper { plaintext: Vec<u8>, position: usize, flip: u8 },
    Replay,
}

fuzz_target!(|scenario: Scenario| {
    let size = u32::from(scenario.size.max(1));
    let mut sender = KeyScheduler::new(&scenario.secret, &scenario.salt, size);
    let mut receiver = KeyScheduler::new(&scenario.secret, &scenario.salt, size);
    let mut delivered: Option<EncryptedMessage> = None;

    for operation in scenario.operations {
        match operation {
            Operation::Send(plaintext) => {
                let Ok(message) = sender.encrypt(&plaintext) else { break };
                assert_eq!(receiver.decrypt(&message).unwrap(), plaintext);
                delivered = Some(message);
            },
            Operation::Tamper { plaintext, position, flip } => {
                let Ok(message) = sender.encrypt(&plaintext) else { break };
                let mut tampered = message.clone();
                let position = position % tampered.ciphertext.len();
                tampered.ciphertext[position] ^= flip.max(1);
                assert!(matches!(
                    receiver.decrypt(&tampered),
                    Err(CryptoError::AuthenticationFailure)
                ));
                assert_eq!(receiver.decrypt(&message).unwrap(), plaintext);
            },
            Operation::Replay => {
                if let Some(message) = &delivered {
                    assert!(matches!(
                        receiver.decrypt(message),
                        Err(CryptoError::KeyReused { .. })
                    ));
                }
            },
        }
    }

    assert_eq!(sender.state().num_available(), receiver.state().num_available());
    let _ = KeyScheduler::from_bytes(&scenario.snapshot);
});
