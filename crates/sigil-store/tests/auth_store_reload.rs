//! Auth store crash recovery on the durable backend.

use sigil_crypto::Fingerprint;
use sigil_proto::PartnerId;
use sigil_store::{AuthStore, Confirmation, RedbStorage, ReceivedRequest, SentRequest};
use tempfile::tempdir;

fn partner(byte: u8) -> PartnerId {
    PartnerId::new([byte; PartnerId::LEN])
}

fn sent(byte: u8) -> SentRequest {
    SentRequest {
        partner: partner(byte),
        partner_historical_public: vec![byte; 256],
        my_dh_private: vec![0x11; 32],
        my_dh_public: vec![0x22; 256],
        my_pq_private: vec![0x03; 74],
        my_pq_public: vec![0x44; 64],
        confirm_fingerprint: Fingerprint::new([byte; 32]),
        facts: vec!["Ubob".into(), "Ebob@example.com".into()],
        reset: true,
    }
}

fn received(byte: u8) -> ReceivedRequest {
    ReceivedRequest {
        partner: partner(byte),
        partner_dh_public: vec![0x55; 256],
        partner_pq_public: vec![0x66; 64],
        ownership_proof: [byte; 32],
        facts: vec!["Ucarol".into()],
        reset: false,
        round: 1234,
    }
}

#[test]
fn reopen_restores_requests_history_and_confirmations() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("auth.redb");
    let confirmation =
        Confirmation { payload: vec![9; 300], fingerprint: Fingerprint::new([8; 32]), mac: [7; 32] };

    {
        let store = AuthStore::open(RedbStorage::open(&path).unwrap()).unwrap();
        store.add_sent(sent(1)).unwrap();
        store.add_received(received(2)).unwrap();
        store.add_received(received(3)).unwrap();
        store.delete_received_request(&partner(3)).unwrap();
        store.check_if_negotiation_is_new(&partner(2), &[1; 32]).unwrap();
        store.check_if_negotiation_is_new(&partner(2), &[2; 32]).unwrap();
        store.store_confirmation(&partner(2), &confirmation).unwrap();
    }

    let store = AuthStore::open(RedbStorage::open(&path).unwrap()).unwrap();

    assert_eq!(store.get_sent_request(&partner(1)).unwrap(), sent(1));
    assert_eq!(store.get_all_received(), vec![received(2)]);
    assert_eq!(store.check_if_negotiation_is_new(&partner(2), &[1; 32]).unwrap(), (false, 1));
    assert_eq!(store.check_if_negotiation_is_new(&partner(2), &[2; 32]).unwrap(), (false, 0));
    assert_eq!(store.load_confirmation(&partner(2)).unwrap(), confirmation);
}

#[test]
fn open_on_empty_database_creates_store() {
    let dir = tempdir().unwrap();
    let storage = RedbStorage::open(dir.path().join("auth.redb")).unwrap();

    let store = AuthStore::open(storage.clone()).unwrap();
    assert!(store.get_all_sent().is_empty());
    assert!(storage.keys().unwrap().contains(&"requestMap".to_string()));
}

#[test]
fn storage_keys_use_base64_partner_ids() {
    let dir = tempdir().unwrap();
    let storage = RedbStorage::open(dir.path().join("auth.redb")).unwrap();
    let store = AuthStore::open(storage.clone()).unwrap();

    store.add_sent(sent(0)).unwrap();
    store.check_if_negotiation_is_new(&partner(0), &[1; 32]).unwrap();

    let keys = storage.keys().unwrap();
    let encoded = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";
    assert!(keys.contains(&format!("sentRequest/{encoded}")));
    assert!(keys.contains(&format!("NegotiationFingerprints/{encoded}")));
    assert!(keys.contains(&"NegotiationPartners".to_string()));
}
