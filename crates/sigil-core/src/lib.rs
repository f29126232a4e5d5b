//! Sigil Channel Core
//!
//! Negotiation state and key budgets for pairwise end-to-end channels.
//!
//! # Components
//!
//! - [`NegotiationTracker`]: send ratchet ids grouped by [`NegotiationState`],
//!   restricted to the legal-transition table
//! - [`SendSession`]: a send ratchet with its key budget and [`SessionStatus`]
//! - [`AuthenticatedChannel`]: every ratchet shared with one partner,
//!   persisted through a [`sigil_store::Storage`]
//! - [`Params`]: budget and retry configuration
//! - [`Environment`]: injectable randomness
//!
//! Channels are pure state: they never talk to a transport. Operations that
//! require sending something return a [`ChannelAction`] for the caller.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod channel;
pub mod env;
pub mod error;
pub mod negotiation;
pub mod params;
pub mod session;

pub use channel::{
    AuthenticatedChannel, ChannelAction, ChannelKeys, CypherHandler, Opened, Role, Sealed,
};
pub use env::{EnvRng, Environment, SeededEnv};
pub use error::NegotiationError;
pub use negotiation::{NegotiationState, NegotiationTracker};
pub use params::Params;
pub use session::{Budget, SendSession, SessionStatus};
