//! SealChat - End-to-end encrypted direct messaging core
//!
//! X25519 identity keys, HKDF-SHA256 conversation keys, ChaCha20-Poly1305
//! message encryption, Argon2id PIN recovery and conversation sync over a
//! REST backend with a real-time event channel.

mod types;
mod keys;
mod crypto;
mod storage;
mod vault;
mod recovery;
mod secrets;
mod directory;
mod models;
mod queue;
mod api;
mod events;
mod store;
mod sync;
mod client;

pub use types::*;
pub use keys::*;
pub use crypto::*;
pub use storage::*;
pub use vault::*;
pub use recovery::*;
pub use secrets::*;
pub use directory::*;
pub use models::*;
pub use queue::*;
pub use api::*;
pub use events::*;
pub use store::*;
pub use sync::*;
pub use client::*;
