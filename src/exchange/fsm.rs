use super::{
    next_ephemeral_spi, EphemeralKeyPair, EphemeralKeys, ExchangeError, KeyMessage, NonceMessage,
    EPHEMERAL_KEY_SIZE, EPHEMERAL_SALT_SIZE, NONCE_SIZE, PRESHARED_KEY_SIZE, PUBLIC_KEY_SIZE,
};
use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use std::fmt;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroize;

type HmacSha512 = Hmac<Sha512>;

/// Combined length of the derived key and salt.
const KDF_OUTPUT_SIZE: usize = EPHEMERAL_KEY_SIZE + EPHEMERAL_SALT_SIZE;

/// Exchange state.
///
/// Deadlines are absolute milliseconds on the caller's timebase. The two
/// intermediate states `SendKey` and `Complete` exist so that emitting the
/// key message and consuming the derived keys each happen exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// No exchange in flight. Also the passive-responder resting state.
    Idle,
    /// We initiated and are waiting for the peer's nonce.
    WaitNonce { deadline: u64 },
    /// Both nonces are known; our key message has not been emitted yet.
    SendKey { deadline: u64 },
    /// Our key message is out; waiting for the peer's.
    WaitKey { deadline: u64 },
    /// Both key messages verified; ephemeral keys are ready to derive.
    Complete,
}

impl State {
    fn deadline(&self) -> Option<u64> {
        match self {
            State::WaitNonce { deadline }
            | State::SendKey { deadline }
            | State::WaitKey { deadline } => Some(*deadline),
            State::Idle | State::Complete => None,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Idle => write!(f, "idle"),
            State::WaitNonce { .. } => write!(f, "wait_nonce"),
            State::SendKey { .. } => write!(f, "send_key"),
            State::WaitKey { .. } => write!(f, "wait_key"),
            State::Complete => write!(f, "complete"),
        }
    }
}

/// One vita-ske1 exchange endpoint.
///
/// Owned by a route; long-lived. All scratch state of the active exchange
/// lives here and is zeroized whenever the exchange returns to [`State::Idle`].
/// The pre-shared key and route SPI survive resets.
pub struct Exchange {
    /// Route SPI, big-endian, as bound into every auth code.
    route_spi: [u8; 4],
    preshared_key: [u8; PRESHARED_KEY_SIZE],
    /// Upper bound on an in-flight exchange, in milliseconds.
    negotiation_ttl: u64,
    state: State,
    /// The nonce we sent (active initiation or passive reply).
    local_nonce: [u8; NONCE_SIZE],
    /// The nonce we received from the peer.
    remote_nonce: [u8; NONCE_SIZE],
    /// Our ephemeral scalar; consumed by key derivation.
    secret: Option<EphemeralSecret>,
    local_key: [u8; PUBLIC_KEY_SIZE],
    remote_key: [u8; PUBLIC_KEY_SIZE],
    /// The ephemeral SPI we chose and sent.
    local_spi: u32,
    /// The ephemeral SPI the peer chose.
    remote_spi: u32,
}

impl Exchange {
    /// Create an idle exchange for a route.
    ///
    /// `negotiation_ttl_ms` bounds how long an in-flight exchange may
    /// remain incomplete before [`Exchange::reset_if_expired`] reclaims it.
    pub fn new(
        route_spi: u32,
        preshared_key: [u8; PRESHARED_KEY_SIZE],
        negotiation_ttl_ms: u64,
    ) -> Self {
        Self {
            route_spi: route_spi.to_be_bytes(),
            preshared_key,
            negotiation_ttl: negotiation_ttl_ms,
            state: State::Idle,
            local_nonce: [0u8; NONCE_SIZE],
            remote_nonce: [0u8; NONCE_SIZE],
            secret: None,
            local_key: [0u8; PUBLIC_KEY_SIZE],
            remote_key: [0u8; PUBLIC_KEY_SIZE],
            local_spi: 0,
            remote_spi: 0,
        }
    }

    /// Current exchange state.
    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Open an exchange: emit our nonce and wait for the peer's.
    pub fn initiate_exchange(&mut self, now_ms: u64) -> Result<NonceMessage, ExchangeError> {
        match self.state {
            State::Idle => {
                OsRng.fill_bytes(&mut self.local_nonce);
                self.state = State::WaitNonce {
                    deadline: now_ms + self.negotiation_ttl,
                };
                Ok(NonceMessage {
                    nonce: self.local_nonce,
                })
            }
            _ => Err(ExchangeError::Protocol),
        }
    }

    /// Consume a peer nonce.
    ///
    /// From [`State::Idle`] this is the passive path: we record both nonces
    /// and reply with our own, without leaving `Idle`; a stranger's nonces
    /// cost us a random draw and a buffer copy, nothing more. From
    /// [`State::WaitNonce`] the exchange advances and the caller is expected
    /// to emit our key message next via [`Exchange::exchange_key`].
    pub fn receive_nonce(
        &mut self,
        now_ms: u64,
        message: &NonceMessage,
    ) -> Result<Option<NonceMessage>, ExchangeError> {
        match self.state {
            State::Idle => {
                self.remote_nonce = message.nonce;
                OsRng.fill_bytes(&mut self.local_nonce);
                Ok(Some(NonceMessage {
                    nonce: self.local_nonce,
                }))
            }
            State::WaitNonce { .. } => {
                self.remote_nonce = message.nonce;
                self.state = State::SendKey {
                    deadline: now_ms + self.negotiation_ttl,
                };
                Ok(None)
            }
            _ => Err(ExchangeError::Protocol),
        }
    }

    /// Emit our key message. Permitted exactly once per exchange.
    pub fn exchange_key(&mut self) -> Result<KeyMessage, ExchangeError> {
        match self.state {
            State::SendKey { deadline } => {
                let message = self.make_key_message();
                self.state = State::WaitKey { deadline };
                Ok(message)
            }
            _ => Err(ExchangeError::Protocol),
        }
    }

    /// Consume the peer's key message.
    ///
    /// From [`State::WaitKey`] this completes our half of the exchange. From
    /// [`State::Idle`] it is the passive completion path: a peer that ran the
    /// nonce phase against our passive replies sends its key message first,
    /// and we answer with ours. In both cases the message only advances the
    /// state if its auth code verifies against the recorded nonces.
    pub fn receive_key(
        &mut self,
        message: &KeyMessage,
    ) -> Result<Option<KeyMessage>, ExchangeError> {
        match self.state {
            State::WaitKey { .. } => {
                self.verify_auth_code(message)?;
                self.remote_spi = message.spi();
                self.remote_key = message.public_key;
                self.state = State::Complete;
                Ok(None)
            }
            State::Idle => {
                self.verify_auth_code(message)?;
                self.remote_spi = message.spi();
                self.remote_key = message.public_key;
                let reply = self.make_key_message();
                self.state = State::Complete;
                Ok(Some(reply))
            }
            _ => Err(ExchangeError::Protocol),
        }
    }

    /// Derive the negotiated SA pair and return to idle.
    ///
    /// `rx` is keyed for traffic the peer encrypts to us, `tx` for traffic
    /// we encrypt to the peer; the KDF inputs are mirrored so both ends
    /// derive the same pairing. Scratch state is destroyed on the way out,
    /// so this can succeed at most once per completed exchange.
    pub fn derive_ephemeral_keys(&mut self) -> Result<EphemeralKeyPair, ExchangeError> {
        match self.state {
            State::Complete => {
                let secret = self
                    .secret
                    .take()
                    .expect("complete exchange holds a local secret");
                let shared = secret.diffie_hellman(&PublicKey::from(self.remote_key));
                let contributory = shared.was_contributory();
                let rx = kdf(
                    shared.as_bytes(),
                    &self.local_key,
                    &self.remote_key,
                    self.local_spi,
                );
                let tx = kdf(
                    shared.as_bytes(),
                    &self.remote_key,
                    &self.local_key,
                    self.remote_spi,
                );
                self.reset();
                if !contributory {
                    return Err(ExchangeError::Parameter);
                }
                Ok(EphemeralKeyPair { rx, tx })
            }
            _ => Err(ExchangeError::Protocol),
        }
    }

    /// Reclaim an exchange whose deadline has elapsed.
    ///
    /// Returns `true` if the exchange expired and was reset to idle. States
    /// without a deadline (`Idle`, `Complete`) never expire.
    pub fn reset_if_expired(&mut self, now_ms: u64) -> bool {
        match self.state.deadline() {
            Some(deadline) if now_ms >= deadline => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Generate our half of the key material and authenticate it.
    fn make_key_message(&mut self) -> KeyMessage {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        self.local_key = PublicKey::from(&secret).to_bytes();
        self.secret = Some(secret);
        self.local_spi = next_ephemeral_spi();
        let spi = self.local_spi.to_be_bytes();
        let auth_code = self.auth_code(&self.local_nonce, &self.remote_nonce, &spi, &self.local_key);
        KeyMessage {
            spi,
            public_key: self.local_key,
            auth_code,
        }
    }

    /// Auth code over `route_spi || sent_nonce || received_nonce || spi || public_key`.
    fn auth_code(
        &self,
        sent_nonce: &[u8; NONCE_SIZE],
        received_nonce: &[u8; NONCE_SIZE],
        spi: &[u8; 4],
        public_key: &[u8; PUBLIC_KEY_SIZE],
    ) -> [u8; super::AUTH_CODE_SIZE] {
        let tag = self
            .transcript_mac(sent_nonce, received_nonce, spi, public_key)
            .finalize()
            .into_bytes();
        let mut out = [0u8; super::AUTH_CODE_SIZE];
        out.copy_from_slice(&tag[..super::AUTH_CODE_SIZE]);
        out
    }

    /// Verify an incoming key message.
    ///
    /// The sender computed its code with its own sent/received nonce order,
    /// so verification swaps ours. The comparison is constant-time.
    fn verify_auth_code(&self, message: &KeyMessage) -> Result<(), ExchangeError> {
        self.transcript_mac(
            &self.remote_nonce,
            &self.local_nonce,
            &message.spi,
            &message.public_key,
        )
        .verify_truncated_left(&message.auth_code)
        .map_err(|_| ExchangeError::Authentication)
    }

    fn transcript_mac(
        &self,
        sent_nonce: &[u8; NONCE_SIZE],
        received_nonce: &[u8; NONCE_SIZE],
        spi: &[u8; 4],
        public_key: &[u8; PUBLIC_KEY_SIZE],
    ) -> HmacSha512 {
        let mut mac = HmacSha512::new_from_slice(&self.preshared_key)
            .expect("HMAC accepts any key length");
        hmac::Mac::update(&mut mac, &self.route_spi);
        hmac::Mac::update(&mut mac, sent_nonce);
        hmac::Mac::update(&mut mac, received_nonce);
        hmac::Mac::update(&mut mac, spi);
        hmac::Mac::update(&mut mac, public_key);
        mac
    }

    /// Destroy scratch state and return to idle. The pre-shared key and
    /// route SPI are kept.
    fn reset(&mut self) {
        self.local_nonce.zeroize();
        self.remote_nonce.zeroize();
        self.local_key.zeroize();
        self.remote_key.zeroize();
        self.secret = None;
        self.local_spi = 0;
        self.remote_spi = 0;
        self.state = State::Idle;
    }
}

/// Derive `{key, salt}` for one direction: a 20-byte BLAKE2b digest over
/// the shared secret and the two public keys, split as key then salt.
fn kdf(shared_secret: &[u8; 32], a: &[u8; 32], b: &[u8; 32], spi: u32) -> EphemeralKeys {
    let mut hasher = Blake2bVar::new(KDF_OUTPUT_SIZE).expect("20 bytes is a valid output length");
    hasher.update(shared_secret);
    hasher.update(a);
    hasher.update(b);
    let mut output = [0u8; KDF_OUTPUT_SIZE];
    hasher
        .finalize_variable(&mut output)
        .expect("output buffer matches the configured length");

    let mut key = [0u8; EPHEMERAL_KEY_SIZE];
    let mut salt = [0u8; EPHEMERAL_SALT_SIZE];
    key.copy_from_slice(&output[..EPHEMERAL_KEY_SIZE]);
    salt.copy_from_slice(&output[EPHEMERAL_KEY_SIZE..]);
    output.zeroize();
    EphemeralKeys { spi, key, salt }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("route_spi", &u32::from_be_bytes(self.route_spi))
            .field("state", &self.state)
            .field("has_secret", &self.secret.is_some())
            .field("preshared_key", &"[redacted]")
            .finish()
    }
}
