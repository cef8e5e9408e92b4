//! vita-ske1 Key Exchange Protocol
//!
//! Implements the authenticated Diffie-Hellman exchange used to negotiate
//! ephemeral Security Associations between two gateways sharing a 32-byte
//! pre-shared key and a route SPI. The key agreement is X25519, message
//! authentication is HMAC-SHA-512 truncated to 32 bytes (the libsodium
//! `crypto_auth_hmacsha512256` construction), and key derivation is a
//! 20-byte BLAKE2b digest over the shared secret and both public keys.
//!
//! ## Message flow
//!
//! The protocol is symmetric: either side may initiate, and two
//! simultaneous initiations converge without extra round trips.
//!
//! ```text
//!   A                                B
//!   |------ nonce_A (32 bytes) ----->|
//!   |<----- nonce_B (32 bytes) ------|
//!   |------ key_A  (68 bytes) ------>|
//!   |<----- key_B  (68 bytes) -------|
//! ```
//!
//! A key message carries `{spi, public_key, auth_code}` where the auth
//! code binds the route SPI, both nonces, the chosen SPI and the public
//! key to the pre-shared key. After both key messages are exchanged each
//! side derives one inbound and one outbound SA; the inbound SPI is the
//! one it chose itself, the outbound SPI the one the peer chose.
//!
//! ## Separation of concerns
//!
//! This module is pure protocol: it never reads the clock (deadlines are
//! driven by the caller-supplied `now_ms`), never performs I/O, and never
//! allocates after construction. Framing and dispatch live in [`crate::wire`]
//! and [`crate::manager`].

mod fsm;

#[cfg(test)]
mod tests;

pub use self::fsm::{Exchange, State};

use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Size of a pre-shared key.
pub const PRESHARED_KEY_SIZE: usize = 32;

/// Size of an exchange nonce.
pub const NONCE_SIZE: usize = 32;

/// Size of an X25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a message authentication code.
pub const AUTH_CODE_SIZE: usize = 32;

/// Size of a serialized nonce message.
pub const NONCE_MESSAGE_SIZE: usize = NONCE_SIZE;

/// Size of a serialized key message: SPI + public key + auth code.
pub const KEY_MESSAGE_SIZE: usize = 4 + PUBLIC_KEY_SIZE + AUTH_CODE_SIZE;

/// Size of a derived AEAD key (aes-gcm-16-icv).
pub const EPHEMERAL_KEY_SIZE: usize = 16;

/// Size of a derived AEAD salt.
pub const EPHEMERAL_SALT_SIZE: usize = 4;

/// Smallest ephemeral SPI ever allocated; the range below is left to
/// statically configured route SPIs.
pub const MIN_EPHEMERAL_SPI: u32 = 256;

/// Errors from exchange operations.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ExchangeError {
    /// The operation is not permitted in the current exchange state.
    #[error("operation not permitted in the current exchange state")]
    Protocol,

    /// The authentication code of a key message did not verify.
    #[error("key message failed authentication")]
    Authentication,

    /// The peer supplied an unsafe public key (zero shared secret).
    #[error("unsafe peer public key")]
    Parameter,
}

/// A nonce message: the opening half-round of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NonceMessage {
    pub nonce: [u8; NONCE_SIZE],
}

impl NonceMessage {
    /// Parse a nonce message from exactly [`NONCE_MESSAGE_SIZE`] bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let nonce: [u8; NONCE_SIZE] = data.try_into().ok()?;
        Some(Self { nonce })
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_MESSAGE_SIZE] {
        &self.nonce
    }
}

/// A key message: `{spi, public_key, auth_code}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyMessage {
    /// The sender's chosen ephemeral SPI, big-endian.
    pub spi: [u8; 4],
    /// The sender's X25519 public key.
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// HMAC over the exchange transcript, keyed on the pre-shared key.
    pub auth_code: [u8; AUTH_CODE_SIZE],
}

impl KeyMessage {
    /// Parse a key message from exactly [`KEY_MESSAGE_SIZE`] bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != KEY_MESSAGE_SIZE {
            return None;
        }
        let mut spi = [0u8; 4];
        let mut public_key = [0u8; PUBLIC_KEY_SIZE];
        let mut auth_code = [0u8; AUTH_CODE_SIZE];
        spi.copy_from_slice(&data[..4]);
        public_key.copy_from_slice(&data[4..4 + PUBLIC_KEY_SIZE]);
        auth_code.copy_from_slice(&data[4 + PUBLIC_KEY_SIZE..]);
        Some(Self {
            spi,
            public_key,
            auth_code,
        })
    }

    pub fn to_bytes(&self) -> [u8; KEY_MESSAGE_SIZE] {
        let mut out = [0u8; KEY_MESSAGE_SIZE];
        out[..4].copy_from_slice(&self.spi);
        out[4..4 + PUBLIC_KEY_SIZE].copy_from_slice(&self.public_key);
        out[4 + PUBLIC_KEY_SIZE..].copy_from_slice(&self.auth_code);
        out
    }

    /// The sender's ephemeral SPI as an integer.
    pub fn spi(&self) -> u32 {
        u32::from_be_bytes(self.spi)
    }
}

/// Keying material for one direction of a negotiated SA pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EphemeralKeys {
    pub spi: u32,
    pub key: [u8; EPHEMERAL_KEY_SIZE],
    pub salt: [u8; EPHEMERAL_SALT_SIZE],
}

/// The outcome of a completed exchange: one inbound and one outbound SA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EphemeralKeyPair {
    pub rx: EphemeralKeys,
    pub tx: EphemeralKeys,
}

/// Ephemeral SPIs live in `[MIN_EPHEMERAL_SPI, u32::MAX]`; the counter
/// wraps modulo this before the offset is applied.
const SPI_COUNTER_MODULUS: u32 = u32::MAX - 256;

static SPI_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Allocate the next ephemeral SPI.
///
/// The counter is process-wide so SPIs chosen by different routes never
/// repeat within the wrap period. Only the manager thread allocates.
pub fn next_ephemeral_spi() -> u32 {
    let n = SPI_COUNTER.fetch_add(1, Ordering::Relaxed) % SPI_COUNTER_MODULUS;
    n + MIN_EPHEMERAL_SPI
}
