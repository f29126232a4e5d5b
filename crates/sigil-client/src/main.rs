//! Sigil loopback demo.
//!
//! Two identities negotiate a channel over an in-process network and then
//! exchange messages through it, rekeying as keys run low.
//!
//! # Usage
//!
//! ```bash
//! # Everything in memory
//! sigil-loopback --messages 20
//!
//! # Persist both sides with redb
//! sigil-loopback --db-dir /tmp/sigil --log-level debug
//! ```

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use sigil_client::{
    ClientError, Contact, Identity, LoopbackNetwork, Manager, Processed, Round, SystemEnv,
    Transport,
};
use sigil_core::{Environment, Params};
use sigil_crypto::Nike;
use sigil_proto::PartnerId;
use sigil_store::{MemoryStorage, RedbStorage, Storage};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Sigil loopback demo
#[derive(Parser, Debug)]
#[command(name = "sigil-loopback")]
#[command(about = "Negotiate a Sigil channel between two local identities")]
#[command(version)]
struct Args {
    /// Messages to send each way once the channel is up
    #[arg(short, long, default_value = "8")]
    messages: usize,

    /// Transport payload size in bytes
    #[arg(long, default_value = "1024")]
    payload_size: usize,

    /// Directory for redb databases (in memory if unset)
    #[arg(long)]
    db_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Logs every negotiation callback.
struct LogCallbacks {
    name: &'static str,
}

impl sigil_client::Callbacks for LogCallbacks {
    fn request(&self, partner: &Contact, round: Round) {
        tracing::info!(me = self.name, partner = %partner.id, facts = ?partner.facts, round, "request callback");
    }

    fn confirm(&self, partner: &Contact, round: Round) {
        tracing::info!(me = self.name, partner = %partner.id, round, "confirm callback");
    }

    fn reset(&self, partner: &Contact, round: Round) {
        tracing::info!(me = self.name, partner = %partner.id, round, "reset callback");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Sigil loopback starting");

    match &args.db_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            tracing::info!("Persisting to {}", dir.display());
            run(&args, RedbStorage::open(dir.join("alice.redb"))?, RedbStorage::open(dir.join("bob.redb"))?)
        },
        None => run(&args, MemoryStorage::new(), MemoryStorage::new()),
    }
}

fn run<S: Storage>(args: &Args, alice_storage: S, bob_storage: S) -> Result<(), Box<dyn std::error::Error>> {
    let env = SystemEnv::new();
    let network = LoopbackNetwork::new();

    let alice_identity = identity(&env);
    let bob_identity = identity(&env);
    let alice_id = alice_identity.id();
    let bob_id = bob_identity.id();
    let bob_contact = bob_identity.contact();

    let alice: Manager<S, _, SystemEnv> = Manager::new(
        alice_identity,
        alice_storage,
        network.join(alice_id, args.payload_size),
        SystemEnv::new(),
        Params::default(),
        Arc::new(LogCallbacks { name: "alice" }),
    )?;
    let bob: Manager<S, _, SystemEnv> = Manager::new(
        bob_identity,
        bob_storage,
        network.join(bob_id, args.payload_size),
        SystemEnv::new(),
        Params::default(),
        Arc::new(LogCallbacks { name: "bob" }),
    )?;

    tracing::info!(alice = %alice_id, bob = %bob_id, "negotiating");
    alice.request(&bob_contact, &["name:alice".to_string()])?;
    pump(&network, &bob)?;
    bob.confirm(&alice_id)?;
    pump(&network, &alice)?;
    pump(&network, &bob)?;

    for i in 0..args.messages {
        alice.send_message(&bob_id, format!("alice #{i}").as_bytes())?;
        bob.send_message(&alice_id, format!("bob #{i}").as_bytes())?;
        pump(&network, &bob)?;
        pump(&network, &alice)?;
    }

    tracing::info!(
        alice_ratchets = alice.send_ratchets(&bob_id).len(),
        bob_ratchets = bob.send_ratchets(&alice_id).len(),
        "done"
    );
    Ok(())
}

fn identity(env: &SystemEnv) -> Identity {
    let mut id = [0u8; PartnerId::LEN];
    env.random_bytes(&mut id);
    Identity::generate(PartnerId::new(id), &mut env.rng())
}

/// Deliver everything queued for `manager`.
fn pump<S: Storage, T: Transport, E: Environment, Q: Nike>(
    network: &LoopbackNetwork,
    manager: &Manager<S, T, E, Q>,
) -> Result<(), ClientError> {
    let me = manager.identity().id();
    for delivery in network.drain(&me) {
        match manager.receive(&delivery.frame, delivery.round)? {
            Processed::Message { partner, body } => {
                tracing::info!(%me, %partner, body = %String::from_utf8_lossy(&body), "message");
            },
            Processed::Dropped(reason) => tracing::warn!(%me, ?reason, "frame dropped"),
            other => tracing::debug!(%me, event = ?other, "processed"),
        }
    }
    Ok(())
}
