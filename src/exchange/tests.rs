use super::*;

const ROUTE_SPI: u32 = 1234;
const TTL_MS: u64 = 5_000;

fn pair_with_keys(
    key_a: [u8; PRESHARED_KEY_SIZE],
    key_b: [u8; PRESHARED_KEY_SIZE],
) -> (Exchange, Exchange) {
    (
        Exchange::new(ROUTE_SPI, key_a, TTL_MS),
        Exchange::new(ROUTE_SPI, key_b, TTL_MS),
    )
}

fn pair() -> (Exchange, Exchange) {
    pair_with_keys([0u8; PRESHARED_KEY_SIZE], [0u8; PRESHARED_KEY_SIZE])
}

/// Run a full active/passive exchange and return both derived key pairs.
fn negotiate(a: &mut Exchange, b: &mut Exchange) -> (EphemeralKeyPair, EphemeralKeyPair) {
    let nonce_a = a.initiate_exchange(0).unwrap();
    let nonce_b = b.receive_nonce(0, &nonce_a).unwrap().unwrap();
    assert!(a.receive_nonce(0, &nonce_b).unwrap().is_none());

    let key_a = a.exchange_key().unwrap();
    let key_b = b.receive_key(&key_a).unwrap().unwrap();
    assert!(a.receive_key(&key_b).unwrap().is_none());

    assert_eq!(a.state(), State::Complete);
    assert_eq!(b.state(), State::Complete);

    (
        a.derive_ephemeral_keys().unwrap(),
        b.derive_ephemeral_keys().unwrap(),
    )
}

fn assert_mirrored(a: &EphemeralKeyPair, b: &EphemeralKeyPair) {
    assert_eq!(a.rx.key, b.tx.key);
    assert_eq!(a.rx.salt, b.tx.salt);
    assert_eq!(a.rx.spi, b.tx.spi);
    assert_eq!(a.tx.key, b.rx.key);
    assert_eq!(a.tx.salt, b.rx.salt);
    assert_eq!(a.tx.spi, b.rx.spi);
}

#[test]
fn test_full_exchange() {
    let (mut a, mut b) = pair();

    let (keys_a, keys_b) = negotiate(&mut a, &mut b);

    assert_mirrored(&keys_a, &keys_b);
    assert_ne!(keys_a.rx.key, keys_a.tx.key);

    // Exactly-once derivation: both sides are idle again.
    assert!(a.is_idle());
    assert!(b.is_idle());
    assert_eq!(a.derive_ephemeral_keys(), Err(ExchangeError::Protocol));
}

#[test]
fn test_exchange_is_repeatable() {
    let (mut a, mut b) = pair();

    let (first_a, _) = negotiate(&mut a, &mut b);
    let (second_a, second_b) = negotiate(&mut a, &mut b);

    assert_mirrored(&second_a, &second_b);
    // Fresh scalars and SPIs each round.
    assert_ne!(first_a.rx.key, second_a.rx.key);
    assert_ne!(first_a.rx.spi, second_a.rx.spi);
}

#[test]
fn test_wrong_preshared_key_rejected() {
    let mut other_key = [0u8; PRESHARED_KEY_SIZE];
    other_key[0] = 1;
    let (mut a, mut b) = pair_with_keys([0u8; PRESHARED_KEY_SIZE], other_key);

    let nonce_a = a.initiate_exchange(0).unwrap();
    let nonce_b = b.receive_nonce(0, &nonce_a).unwrap().unwrap();
    a.receive_nonce(0, &nonce_b).unwrap();
    let key_a = a.exchange_key().unwrap();

    assert_eq!(b.receive_key(&key_a), Err(ExchangeError::Authentication));
    // The failed message leaves the passive side untouched.
    assert!(b.is_idle());
}

#[test]
fn test_corrupt_auth_code_rejected() {
    let (mut a, mut b) = pair();

    let nonce_a = a.initiate_exchange(0).unwrap();
    let nonce_b = b.receive_nonce(0, &nonce_a).unwrap().unwrap();
    a.receive_nonce(0, &nonce_b).unwrap();
    let key_a = a.exchange_key().unwrap();

    // Any single flipped bit must fail verification.
    for bit in [0, 7, 131, 255] {
        let mut corrupt = key_a;
        corrupt.auth_code[bit / 8] ^= 1 << (bit % 8);
        assert_eq!(b.receive_key(&corrupt), Err(ExchangeError::Authentication));
    }

    // The unmodified original still verifies.
    assert!(b.receive_key(&key_a).unwrap().is_some());
}

#[test]
fn test_simultaneous_initiation_converges() {
    let (mut a, mut b) = pair();

    let nonce_a = a.initiate_exchange(0).unwrap();
    let nonce_b = b.initiate_exchange(0).unwrap();

    // Each side consumes the other's nonce from wait_nonce.
    assert!(a.receive_nonce(0, &nonce_b).unwrap().is_none());
    assert!(b.receive_nonce(0, &nonce_a).unwrap().is_none());

    let key_a = a.exchange_key().unwrap();
    let key_b = b.exchange_key().unwrap();

    assert!(a.receive_key(&key_b).unwrap().is_none());
    assert!(b.receive_key(&key_a).unwrap().is_none());

    let keys_a = a.derive_ephemeral_keys().unwrap();
    let keys_b = b.derive_ephemeral_keys().unwrap();
    assert_mirrored(&keys_a, &keys_b);
}

#[test]
fn test_expiry_resets_to_idle() {
    let mut a = Exchange::new(ROUTE_SPI, [0u8; PRESHARED_KEY_SIZE], 2_000);

    a.initiate_exchange(0).unwrap();
    assert!(!a.reset_if_expired(1_999));
    assert!(matches!(a.state(), State::WaitNonce { .. }));

    assert!(a.reset_if_expired(2_500));
    assert_eq!(a.state(), State::Idle);

    // A reset exchange can open again immediately.
    a.initiate_exchange(2_500).unwrap();
}

#[test]
fn test_expiry_in_wait_key() {
    let (mut a, mut b) = pair();

    let nonce_a = a.initiate_exchange(0).unwrap();
    let nonce_b = b.receive_nonce(0, &nonce_a).unwrap().unwrap();
    a.receive_nonce(100, &nonce_b).unwrap();
    a.exchange_key().unwrap();

    // The deadline was re-armed on entering send_key.
    assert!(!a.reset_if_expired(TTL_MS));
    assert!(a.reset_if_expired(100 + TTL_MS));
    assert!(a.is_idle());
}

#[test]
fn test_idle_and_complete_never_expire() {
    let (mut a, mut b) = pair();
    assert!(!a.reset_if_expired(u64::MAX));

    let nonce_a = a.initiate_exchange(0).unwrap();
    let nonce_b = b.receive_nonce(0, &nonce_a).unwrap().unwrap();
    a.receive_nonce(0, &nonce_b).unwrap();
    let key_a = a.exchange_key().unwrap();
    let key_b = b.receive_key(&key_a).unwrap().unwrap();
    a.receive_key(&key_b).unwrap();

    assert_eq!(a.state(), State::Complete);
    assert!(!a.reset_if_expired(u64::MAX));
    assert_eq!(a.state(), State::Complete);
}

#[test]
fn test_reset_clears_scratch() {
    let (mut a, mut b) = pair();

    // Run the nonce phase, then let the exchange expire.
    let nonce_a = a.initiate_exchange(0).unwrap();
    let nonce_b = b.receive_nonce(0, &nonce_a).unwrap().unwrap();
    a.receive_nonce(0, &nonce_b).unwrap();
    let key_a = a.exchange_key().unwrap();
    assert!(a.reset_if_expired(u64::MAX / 2));

    // B completes against the stale transcript; A's nonces are gone, so
    // B's key message can no longer authenticate against A.
    let key_b = b.receive_key(&key_a).unwrap().unwrap();
    assert_eq!(a.receive_key(&key_b), Err(ExchangeError::Authentication));
}

#[test]
fn test_operations_rejected_outside_their_states() {
    let (mut a, mut b) = pair();
    let nonce = NonceMessage {
        nonce: [7u8; NONCE_SIZE],
    };

    // Idle: only initiate/receive_nonce/receive_key are meaningful.
    assert_eq!(a.exchange_key(), Err(ExchangeError::Protocol));
    assert_eq!(a.derive_ephemeral_keys(), Err(ExchangeError::Protocol));

    // wait_nonce: no second initiation, no key emission.
    a.initiate_exchange(0).unwrap();
    assert_eq!(a.initiate_exchange(0), Err(ExchangeError::Protocol));
    assert_eq!(a.exchange_key(), Err(ExchangeError::Protocol));
    assert_eq!(a.derive_ephemeral_keys(), Err(ExchangeError::Protocol));

    // wait_key: nonces are no longer accepted.
    a.receive_nonce(0, &nonce).unwrap();
    a.exchange_key().unwrap();
    assert_eq!(a.receive_nonce(0, &nonce), Err(ExchangeError::Protocol));
    assert_eq!(a.initiate_exchange(0), Err(ExchangeError::Protocol));
    assert_eq!(a.exchange_key(), Err(ExchangeError::Protocol));

    // complete: everything but derivation is refused.
    let nonce_a = b.initiate_exchange(0).unwrap();
    let (mut c, _) = pair();
    let nonce_c = c.receive_nonce(0, &nonce_a).unwrap().unwrap();
    b.receive_nonce(0, &nonce_c).unwrap();
    let key_b = b.exchange_key().unwrap();
    let key_c = c.receive_key(&key_b).unwrap().unwrap();
    b.receive_key(&key_c).unwrap();
    assert_eq!(b.state(), State::Complete);
    assert_eq!(b.initiate_exchange(0), Err(ExchangeError::Protocol));
    assert_eq!(b.receive_nonce(0, &nonce), Err(ExchangeError::Protocol));
    assert_eq!(b.exchange_key(), Err(ExchangeError::Protocol));
    assert_eq!(b.receive_key(&key_c), Err(ExchangeError::Protocol));
}

/// Compute the auth code a peer would attach to its key message, from
/// material visible on the wire plus the pre-shared key.
fn peer_auth_code(
    preshared_key: &[u8; PRESHARED_KEY_SIZE],
    route_spi: u32,
    sent_nonce: &[u8; NONCE_SIZE],
    received_nonce: &[u8; NONCE_SIZE],
    spi: &[u8; 4],
    public_key: &[u8; PUBLIC_KEY_SIZE],
) -> [u8; AUTH_CODE_SIZE] {
    use hmac::{Hmac, Mac};
    use sha2::Sha512;

    let mut mac = Hmac::<Sha512>::new_from_slice(preshared_key).unwrap();
    mac.update(&route_spi.to_be_bytes());
    mac.update(sent_nonce);
    mac.update(received_nonce);
    mac.update(spi);
    mac.update(public_key);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; AUTH_CODE_SIZE];
    out.copy_from_slice(&tag[..AUTH_CODE_SIZE]);
    out
}

#[test]
fn test_unsafe_peer_public_key_rejected() {
    let preshared_key = [0u8; PRESHARED_KEY_SIZE];
    let mut a = Exchange::new(ROUTE_SPI, preshared_key, TTL_MS);

    let nonce_a = a.initiate_exchange(0).unwrap();
    let nonce_b = NonceMessage {
        nonce: [7u8; NONCE_SIZE],
    };
    a.receive_nonce(0, &nonce_b).unwrap();
    a.exchange_key().unwrap();

    // A peer holding the pre-shared key can present the all-zero
    // (small-order) curve point under a valid auth code. The message
    // authenticates, but the zero shared secret must never be keyed from.
    let spi = 999u32.to_be_bytes();
    let public_key = [0u8; PUBLIC_KEY_SIZE];
    let auth_code = peer_auth_code(
        &preshared_key,
        ROUTE_SPI,
        &nonce_b.nonce,
        &nonce_a.nonce,
        &spi,
        &public_key,
    );
    let forged = KeyMessage {
        spi,
        public_key,
        auth_code,
    };

    assert!(a.receive_key(&forged).unwrap().is_none());
    assert_eq!(a.derive_ephemeral_keys(), Err(ExchangeError::Parameter));
    // The failed derivation still consumes the exchange.
    assert!(a.is_idle());
}

#[test]
fn test_stray_key_message_in_idle_fails_authentication() {
    let (mut a, _) = pair();
    let stray = KeyMessage {
        spi: 4321u32.to_be_bytes(),
        public_key: [9u8; PUBLIC_KEY_SIZE],
        auth_code: [0u8; AUTH_CODE_SIZE],
    };
    assert_eq!(a.receive_key(&stray), Err(ExchangeError::Authentication));
    assert!(a.is_idle());
}

#[test]
fn test_passive_side_stays_idle_through_nonce_phase() {
    let (mut a, mut b) = pair();
    let nonce_a = a.initiate_exchange(0).unwrap();
    b.receive_nonce(0, &nonce_a).unwrap();
    assert!(b.is_idle());
}

#[test]
fn test_message_codecs_round_trip() {
    let nonce = NonceMessage {
        nonce: [0xAB; NONCE_SIZE],
    };
    assert_eq!(NonceMessage::parse(nonce.as_bytes()), Some(nonce));
    assert_eq!(NonceMessage::parse(&[0u8; 31]), None);

    let key = KeyMessage {
        spi: 0xDEADBEEFu32.to_be_bytes(),
        public_key: [0x42; PUBLIC_KEY_SIZE],
        auth_code: [0x17; AUTH_CODE_SIZE],
    };
    let bytes = key.to_bytes();
    assert_eq!(bytes.len(), KEY_MESSAGE_SIZE);
    assert_eq!(KeyMessage::parse(&bytes), Some(key));
    assert_eq!(key.spi(), 0xDEADBEEF);
    assert_eq!(KeyMessage::parse(&bytes[..KEY_MESSAGE_SIZE - 1]), None);
}

#[test]
fn test_ephemeral_spis_are_distinct_and_offset() {
    let first = next_ephemeral_spi();
    let second = next_ephemeral_spi();
    assert!(first >= MIN_EPHEMERAL_SPI);
    assert!(second >= MIN_EPHEMERAL_SPI);
    assert_ne!(first, second);
}

#[test]
fn test_zero_ttl_expires_immediately() {
    let mut a = Exchange::new(ROUTE_SPI, [0u8; PRESHARED_KEY_SIZE], 0);
    a.initiate_exchange(10).unwrap();
    assert!(a.reset_if_expired(10));
    assert!(a.is_idle());
}
