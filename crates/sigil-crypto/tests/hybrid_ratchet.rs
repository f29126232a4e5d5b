//! End-to-end ratchet exchange over the hybrid key exchange.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sigil_crypto::{
    CryptoError, DefaultNike, MAC_LEN, Nike, NikePublicKey, ReceiveRatchet, SendRatchet,
    make_relationship_fingerprint,
};

const MAX_KEYS: u32 = 2000;

#[test]
fn alice_to_bob_until_rekey() {
    let mut rng = ChaCha20Rng::seed_from_u64(0x5161);
    let (alice_priv, alice_pub) = DefaultNike::new_keypair(&mut rng);
    let (bob_priv, bob_pub) = DefaultNike::new_keypair(&mut rng);

    let salt = make_relationship_fingerprint(
        &alice_pub.to_bytes(),
        &bob_pub.to_bytes(),
        b"alice",
        b"bob",
    );
    let mut alice =
        SendRatchet::<DefaultNike>::new(alice_priv, alice_pub.clone(), bob_pub, &salt, MAX_KEYS);
    let mut bob = ReceiveRatchet::<DefaultNike>::new(bob_priv, alice_pub, &salt, MAX_KEYS);

    assert_eq!(alice.id(), bob.id());
    assert_eq!(bob.fingerprints().len(), MAX_KEYS as usize);

    for _ in 0..MAX_KEYS {
        let msg = alice.encrypt(b"hi bob").unwrap();
        assert_eq!(bob.decrypt(&msg).unwrap(), b"hi bob");
    }

    let err = alice.encrypt(b"hi bob").unwrap_err();
    assert!(err.requires_rekey());
    assert_eq!(bob.num_available(), 0);

    let mut next_alice = alice.next(&mut rng);
    let mut next_bob = bob.next(next_alice.my_public_key().clone());
    let msg = next_alice.encrypt(b"after rekey").unwrap();
    assert_eq!(next_bob.decrypt(&msg).unwrap(), b"after rekey");
}

#[test]
fn every_flipped_mac_bit_is_rejected() {
    let mut rng = ChaCha20Rng::seed_from_u64(0x7a3b);
    let (alice_priv, alice_pub) = DefaultNike::new_keypair(&mut rng);
    let (bob_priv, bob_pub) = DefaultNike::new_keypair(&mut rng);
    let secret = DefaultNike::derive_secret(&alice_priv, &bob_pub);

    let mut alice = SendRatchet::<DefaultNike>::from_secret(
        &secret,
        alice_priv,
        alice_pub.clone(),
        bob_pub,
        b"salt",
        8,
    );
    let mut bob = ReceiveRatchet::<DefaultNike>::new(bob_priv, alice_pub, b"salt", 8);

    let original = alice.encrypt(b"do not touch").unwrap();
    for byte in 0..MAC_LEN {
        for bit in 0..8 {
            let mut tampered = original.clone();
            tampered.ciphertext[byte] ^= 1 << bit;
            assert_eq!(
                bob.decrypt(&tampered),
                Err(CryptoError::AuthenticationFailure),
                "byte {byte} bit {bit}"
            );
        }
    }
    assert_eq!(bob.decrypt(&original).unwrap(), b"do not touch");
}
