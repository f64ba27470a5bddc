//! # Weft Identity
//!
//! Who may post to a channel, and how that right is handed on.
//!
//! An [`Identity`] owns a signing keypair and a chain per channel it has
//! joined. Owning a channel needs no chain; everyone else posts through a
//! [`Chain`](weft_core::Chain) rooted at the owner's key.
//!
//! New members join through invites:
//!
//! 1. The requester publishes an [`InviteRequest`] carrying its signing key
//!    and a fresh X25519 box key.
//! 2. A member issues a link to the requester, appends it to its own chain,
//!    and seals the result in an [`Invite`] only the box key can open.
//! 3. The requester opens the invite, checks the chain ends at its own key,
//!    and registers it.
//!
//! ## Key Types
//!
//! - [`Identity`] - Keypair plus per-channel chains
//! - [`IdentityRecord`] - Persisted form
//! - [`InviteRequest`] / [`Invite`] / [`InvitePayload`] - Invite exchange

pub mod crypto;
pub mod error;
pub mod identity;
pub mod invite;

pub use crypto::{X25519PublicKey, X25519StaticSecret};
pub use error::{IdentityError, Result};
pub use identity::{ChannelChain, Identity, IdentityRecord};
pub use invite::{ChannelInfo, Invite, InvitePayload, InviteRequest};
