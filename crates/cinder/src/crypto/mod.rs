//! Message stream encryption.
//!
//! Peers that opt in agree on a shared secret with Diffie-Hellman, derive
//! one ARC4 key per direction and either encrypt the whole stream or just
//! the handshake that negotiates it. [`mse`] drives the handshake,
//! [`stream::CryptoStream`] is the resulting transport.
pub mod arc4;
pub mod dh;
pub mod mse;
pub mod stream;

pub use mse::{initiate, is_plaintext_handshake, respond, Accepted, CryptoMode, CryptoPolicy};
pub use stream::CryptoStream;
