//! End-to-end negotiation between managers over the loopback network.
//!
//! Sessions run over `Hybrid<FfDh, SparseCsidh>`: full CSIDH-512 curves and
//! wire format, but private keys that take only a few isogeny steps so each
//! negotiation finishes quickly.

use std::sync::Arc;

mod common;

use common::{PAYLOAD_SIZE, SparseCsidh, identity, params};
use sigil_client::{
    CallbackKind, ClientError, DropReason, Identity, LoopbackNetwork, LoopbackTransport, Manager,
    Processed, RecordingCallbacks, TransportError,
};
use sigil_core::{Params, SeededEnv};
use sigil_proto::PartnerId;
use sigil_store::{AuthStoreError, MemoryStorage};

type TestManager = Manager<MemoryStorage, LoopbackTransport, SeededEnv, SparseCsidh>;

struct Peer {
    identity: Identity,
    storage: MemoryStorage,
    callbacks: Arc<RecordingCallbacks>,
    manager: TestManager,
}

impl Peer {
    fn id(&self) -> PartnerId {
        self.identity.id()
    }
}

fn peer(network: &LoopbackNetwork, byte: u8, params: Params) -> Peer {
    open(network, identity(byte), MemoryStorage::new(), params, u64::from(byte) + 100)
}

fn open(
    network: &LoopbackNetwork,
    identity: Identity,
    storage: MemoryStorage,
    params: Params,
    seed: u64,
) -> Peer {
    let callbacks = Arc::new(RecordingCallbacks::new());
    let manager = Manager::new(
        identity.clone(),
        storage.clone(),
        network.join(identity.id(), PAYLOAD_SIZE),
        SeededEnv::new(seed),
        params,
        callbacks.clone(),
    )
    .unwrap();
    Peer { identity, storage, callbacks, manager }
}

/// Deliver everything queued for `peer`.
fn pump(network: &LoopbackNetwork, peer: &Peer) -> Vec<Processed> {
    network
        .drain(&peer.id())
        .into_iter()
        .map(|delivery| peer.manager.receive(&delivery.frame, delivery.round).unwrap())
        .collect()
}

/// Request from `alice`, confirm from `bob`, ack back to `bob`.
fn connect(network: &LoopbackNetwork, alice: &Peer, bob: &Peer) {
    alice.manager.request(&bob.identity.contact(), &["name:alice".to_string()]).unwrap();
    assert_eq!(pump(network, bob), [Processed::RequestReceived { partner: alice.id() }]);
    bob.manager.confirm(&alice.id()).unwrap();
    assert_eq!(pump(network, alice), [Processed::Confirmed { partner: bob.id() }]);
    assert_eq!(pump(network, bob), [Processed::Acknowledged { partner: alice.id() }]);
}

fn messages(events: &[Processed]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|event| match event {
            Processed::Message { body, .. } => Some(body.clone()),
            _ => None,
        })
        .collect()
}

#[test]
fn request_confirm_and_traffic_both_ways() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());

    connect(&network, &alice, &bob);

    let requests = bob.callbacks.take();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, CallbackKind::Request);
    assert_eq!(requests[0].facts, ["name:alice"]);
    assert_eq!(alice.callbacks.count(CallbackKind::Confirm), 1);
    assert!(bob.manager.auth_store().get_all_received().is_empty());
    assert!(alice.manager.auth_store().get_all_sent().is_empty());

    alice.manager.send_message(&bob.id(), b"hello bob").unwrap();
    bob.manager.send_message(&alice.id(), b"hello alice").unwrap();
    assert_eq!(messages(&pump(&network, &bob)), [b"hello bob".to_vec()]);
    assert_eq!(messages(&pump(&network, &alice)), [b"hello alice".to_vec()]);
}

#[test]
fn sustained_traffic_rekeys_without_losing_messages() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());
    connect(&network, &alice, &bob);

    let first = alice.manager.send_ratchets(&bob.id());
    let mut rekeys = 0;
    for i in 0..40u32 {
        let to_bob = format!("a{i}").into_bytes();
        let to_alice = format!("b{i}").into_bytes();
        alice.manager.send_message(&bob.id(), &to_bob).unwrap();
        bob.manager.send_message(&alice.id(), &to_alice).unwrap();

        let at_bob = pump(&network, &bob);
        let at_alice = pump(&network, &alice);
        assert_eq!(messages(&at_bob), [to_bob]);
        assert_eq!(messages(&at_alice), [to_alice]);
        rekeys += at_alice
            .iter()
            .chain(&at_bob)
            .filter(|event| matches!(event, Processed::RekeyConfirmed { .. }))
            .count();
        assert!(!at_bob.iter().chain(&at_alice).any(|event| matches!(event, Processed::Dropped(_))));
    }

    assert!(rekeys >= 2, "only {rekeys} rekeys in 80 messages");
    assert_ne!(alice.manager.send_ratchets(&bob.id()), first);
}

#[test]
fn crossed_requests_settle_on_one_channel() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());

    alice.manager.request(&bob.identity.contact(), &[]).unwrap();
    bob.manager.request(&alice.identity.contact(), &[]).unwrap();

    // Larger id keeps its request for the smaller one to confirm.
    assert_eq!(pump(&network, &bob), [Processed::Deferred { partner: alice.id() }]);
    assert_eq!(pump(&network, &alice), [Processed::Confirmed { partner: bob.id() }]);
    assert_eq!(pump(&network, &bob), [Processed::Confirmed { partner: alice.id() }]);
    assert_eq!(pump(&network, &alice), [Processed::Acknowledged { partner: bob.id() }]);

    assert_eq!(alice.callbacks.count(CallbackKind::Confirm), 1);
    assert_eq!(bob.callbacks.count(CallbackKind::Confirm), 1);
    assert_eq!(alice.callbacks.count(CallbackKind::Request), 0);
    assert!(alice.manager.auth_store().get_all_sent().is_empty());
    assert!(bob.manager.auth_store().get_all_sent().is_empty());

    bob.manager.send_message(&alice.id(), b"crossed").unwrap();
    assert_eq!(messages(&pump(&network, &alice)), [b"crossed".to_vec()]);
}

#[test]
fn duplicate_request_is_answered_with_stored_confirm() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());

    alice.manager.request(&bob.identity.contact(), &[]).unwrap();
    pump(&network, &bob);
    bob.manager.confirm(&alice.id()).unwrap();

    // Alice has not seen the confirm yet and asks again.
    alice.manager.request(&bob.identity.contact(), &[]).unwrap();
    assert_eq!(pump(&network, &bob), [Processed::Dropped(DropReason::Duplicate)]);

    assert_eq!(
        pump(&network, &alice),
        [
            Processed::Confirmed { partner: bob.id() },
            Processed::Dropped(DropReason::UnknownFingerprint),
        ]
    );
    assert_eq!(alice.callbacks.count(CallbackKind::Confirm), 1);
    assert_eq!(bob.callbacks.count(CallbackKind::Request), 1);
}

#[test]
fn duplicate_request_replays_callback_when_configured() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, Params { replay_requests: true, ..params() });

    alice.manager.request(&bob.identity.contact(), &["fact".to_string()]).unwrap();
    pump(&network, &bob);
    alice.manager.request(&bob.identity.contact(), &[]).unwrap();
    assert_eq!(pump(&network, &bob), [Processed::Dropped(DropReason::Duplicate)]);

    let events = bob.callbacks.take();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|event| event.kind == CallbackKind::Request));
    // Resent request carries the facts it was first sent with.
    assert_eq!(events[1].facts, ["fact"]);
}

#[test]
fn request_to_existing_channel_is_refused() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());
    connect(&network, &alice, &bob);

    assert_eq!(
        alice.manager.request(&bob.identity.contact(), &[]),
        Err(ClientError::ChannelExists { partner: bob.id() })
    );
    assert_eq!(
        bob.manager.confirm(&alice.id()),
        Err(ClientError::ChannelExists { partner: alice.id() })
    );
}

#[test]
fn reset_replaces_channel_on_both_ends() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());
    connect(&network, &alice, &bob);
    let before = alice.manager.send_ratchets(&bob.id());

    bob.manager.reset(&alice.identity.contact()).unwrap();
    assert!(!bob.manager.has_channel(&alice.id()));

    assert_eq!(pump(&network, &alice), [Processed::Reset { partner: bob.id() }]);
    assert_eq!(pump(&network, &bob), [Processed::Confirmed { partner: alice.id() }]);
    assert_eq!(pump(&network, &alice), [Processed::Acknowledged { partner: bob.id() }]);

    assert_eq!(alice.callbacks.count(CallbackKind::Reset), 1);
    assert_ne!(alice.manager.send_ratchets(&bob.id()), before);

    alice.manager.send_message(&bob.id(), b"after reset").unwrap();
    assert_eq!(messages(&pump(&network, &bob)), [b"after reset".to_vec()]);
}

#[test]
fn tampered_request_is_dropped_and_original_still_accepted() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());

    alice.manager.request(&bob.identity.contact(), &[]).unwrap();
    let delivery = network.drain(&bob.id()).remove(0);

    let mut tampered = delivery.frame.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;
    assert_eq!(
        bob.manager.receive(&tampered, delivery.round).unwrap(),
        Processed::Dropped(DropReason::AuthenticationFailed)
    );
    assert_eq!(
        bob.manager.receive(&delivery.frame[..10], delivery.round).unwrap(),
        Processed::Dropped(DropReason::Malformed)
    );
    assert_eq!(
        bob.manager.receive(&delivery.frame, delivery.round).unwrap(),
        Processed::RequestReceived { partner: alice.id() }
    );
}

#[test]
fn request_for_someone_else_is_dropped() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());
    let carol = peer(&network, 3, params());

    alice.manager.request(&carol.identity.contact(), &[]).unwrap();
    let delivery = network.drain(&carol.id()).remove(0);
    network.inject(bob.id(), delivery.frame);

    assert_eq!(pump(&network, &bob), [Processed::Dropped(DropReason::UnknownFingerprint)]);
    assert_eq!(bob.callbacks.count(CallbackKind::Request), 0);
}

#[test]
fn failed_confirm_is_replayed_verbatim() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());

    alice.manager.request(&bob.identity.contact(), &[]).unwrap();
    pump(&network, &bob);

    network.set_online(alice.id(), false);
    assert_eq!(
        bob.manager.confirm(&alice.id()),
        Err(ClientError::Transport(TransportError::Unreachable { partner: alice.id() }))
    );
    assert!(bob.manager.has_channel(&alice.id()));

    network.set_online(alice.id(), true);
    bob.manager.replay_confirm(&alice.id()).unwrap();
    assert_eq!(pump(&network, &alice), [Processed::Confirmed { partner: bob.id() }]);
    assert_eq!(pump(&network, &bob), [Processed::Acknowledged { partner: alice.id() }]);

    bob.manager.send_message(&alice.id(), b"late but fine").unwrap();
    assert_eq!(messages(&pump(&network, &alice)), [b"late but fine".to_vec()]);
}

#[test]
fn replay_requests_fires_stored_requests_again() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());
    let carol = peer(&network, 3, params());

    alice.manager.request(&bob.identity.contact(), &["from alice".to_string()]).unwrap();
    carol.manager.request(&bob.identity.contact(), &[]).unwrap();
    pump(&network, &bob);
    let first = bob.callbacks.take();
    assert_eq!(first.len(), 2);

    assert_eq!(bob.manager.replay_requests(), 2);
    let replayed = bob.callbacks.take();
    assert_eq!(replayed, first);

    let contact = bob.manager.get_received_request(&alice.id()).unwrap();
    assert_eq!(contact.facts, ["from alice"]);
    assert!(contact.ownership_proof.is_some());
}

#[test]
fn deleting_requests_forgets_them() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());

    alice.manager.request(&bob.identity.contact(), &[]).unwrap();
    pump(&network, &bob);

    bob.manager.delete_request(&alice.id()).unwrap();
    assert!(matches!(
        bob.manager.confirm(&alice.id()),
        Err(ClientError::AuthStore(err)) if err.is_not_found()
    ));

    // Alice's confirm route is gone with her request.
    alice.manager.delete_all_requests().unwrap();
    assert!(alice.manager.auth_store().get_all_sent().is_empty());
    assert!(matches!(
        alice.manager.delete_request(&bob.id()),
        Err(ClientError::AuthStore(AuthStoreError::NotFound { .. }))
    ));
}

#[test]
fn deleted_partner_traffic_is_dropped() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());
    connect(&network, &alice, &bob);

    alice.manager.delete_partner(&bob.id()).unwrap();
    assert!(!alice.manager.has_channel(&bob.id()));
    assert_eq!(alice.manager.keys().count_for(&bob.id()), 0);

    bob.manager.send_message(&alice.id(), b"anyone there").unwrap();
    assert_eq!(pump(&network, &alice), [Processed::Dropped(DropReason::UnknownFingerprint)]);
    assert!(matches!(
        alice.manager.send_message(&bob.id(), b"x"),
        Err(ClientError::NoChannel { .. })
    ));
}

#[test]
fn channels_survive_restart() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());
    connect(&network, &alice, &bob);
    alice.manager.send_message(&bob.id(), b"before").unwrap();
    pump(&network, &bob);

    let Peer { identity, storage, .. } = alice;
    let alice = open(&network, identity, storage, params(), 7);
    assert_eq!(alice.manager.partners(), [bob.id()]);
    assert!(alice.manager.keys().count_for(&bob.id()) > 0);

    alice.manager.send_message(&bob.id(), b"after").unwrap();
    bob.manager.send_message(&alice.id(), b"welcome back").unwrap();
    assert_eq!(messages(&pump(&network, &bob)), [b"after".to_vec()]);
    assert_eq!(messages(&pump(&network, &alice)), [b"welcome back".to_vec()]);
}

#[test]
fn pending_request_survives_restart() {
    let network = LoopbackNetwork::new();
    let alice = peer(&network, 1, params());
    let bob = peer(&network, 2, params());

    alice.manager.request(&bob.identity.contact(), &[]).unwrap();
    let Peer { identity, storage, .. } = alice;
    let alice = open(&network, identity, storage, params(), 8);

    pump(&network, &bob);
    bob.manager.confirm(&alice.id()).unwrap();
    assert_eq!(pump(&network, &alice), [Processed::Confirmed { partner: bob.id() }]);
}

#[test]
fn undersized_transport_is_rejected() {
    let network = LoopbackNetwork::new();
    let result: Result<TestManager, _> = Manager::new(
        identity(9),
        MemoryStorage::new(),
        network.join(PartnerId::new([9; PartnerId::LEN]), 300),
        SeededEnv::new(9),
        params(),
        Arc::new(RecordingCallbacks::new()),
    );
    assert!(matches!(result, Err(ClientError::Config { .. })));
}
