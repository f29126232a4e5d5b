//! Sigil channel manager.
//!
//! Runs request, confirm and reset negotiation for one identity and drives
//! every authenticated channel that identity has, on top of
//! [`sigil_core`]'s channels and [`sigil_store`]'s auth store.
//!
//! # Architecture
//!
//! The [`Manager`] is synchronous and transport-agnostic. Outbound envelopes
//! go to a [`Transport`]; inbound frames are handed to
//! [`Manager::receive`] by whoever owns the network. Negotiation outcomes are
//! reported twice: as a [`Processed`] value to the caller and as
//! [`Callbacks`] to the application.
//!
//! # Components
//!
//! - [`Manager`]: negotiation and channel traffic for one identity
//! - [`Identity`], [`Contact`]: our historical key pair and what we know of a
//!   partner
//! - [`Callbacks`]: request, confirm and reset notifications
//! - [`KeyRegistry`]: routes inbound fingerprints to partners
//! - [`LoopbackNetwork`]: in-process transport for tests and the demo binary
//! - [`SystemEnv`]: production environment (OS randomness)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod callbacks;
mod contact;
mod error;
mod event;
mod keys;
mod manager;
mod system_env;
mod transport;

pub use callbacks::{CallbackEvent, CallbackKind, Callbacks, RecordingCallbacks};
pub use contact::{Contact, Identity};
pub use error::ClientError;
pub use event::{DropReason, Processed};
pub use keys::KeyRegistry;
pub use manager::{ManagedChannel, Manager, SharedChannel};
pub use system_env::SystemEnv;
pub use transport::{Delivery, LoopbackNetwork, LoopbackTransport, Round, Transport, TransportError};
