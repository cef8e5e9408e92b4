//! Vita Key Manager
//!
//! Top-level controller of the key-management core. The manager owns one
//! [`Route`] (and its [`Exchange`]) per configured tunnel, dispatches
//! inbound exchange datagrams, drives all time-based transitions, installs
//! negotiated SA pairs, and publishes the SA database for the
//! encrypt/decrypt workers.
//!
//! ## Scheduling model
//!
//! The manager is single-threaded and cooperative: a host run-loop calls
//! [`KeyManager::tick`] at a bounded rate with the current time and the
//! datagrams that arrived since the last call. Nothing here blocks; the
//! only I/O is the atomic, once-per-second SA database replace at the end
//! of a tick. Within a tick, inbound handling strictly precedes timer
//! processing, which precedes negotiation initiation, which precedes the
//! database commit.

mod rate_limit;
mod route;


pub use self::route::{Route, RouteStatus};

use crate::config::{Config, ConfigError};
use crate::exchange::{
    EphemeralKeyPair, Exchange, ExchangeError, KeyMessage, NonceMessage, PRESHARED_KEY_SIZE,
};
use crate::sa::{EspAead, SaDatabase, SaDatabaseError, SaPublisher, SecurityAssociation};
use crate::wire::{self, Payload};
use self::rate_limit::AuditRateLimiter;
use self::route::timer_fired;
use rand::Rng;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors related to manager construction and reconfiguration.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("SA database error: {0}")]
    SaDatabase(#[from] SaDatabaseError),
}

/// Datagram and negotiation statistics, updated only from the manager's
/// thread and exported for operator observability.
#[derive(Clone, Copy, Debug, Default)]
pub struct Counters {
    /// Datagrams addressed at an unknown route SPI.
    pub route_errors: u64,
    /// Malformed datagrams and messages rejected by exchange state.
    pub protocol_errors: u64,
    /// Key messages whose auth code did not verify.
    pub authentication_errors: u64,
    /// Exchanges aborted over an unsafe peer public key.
    pub public_key_errors: u64,
    pub negotiations_initiated: u64,
    pub negotiations_expired: u64,
    pub nonces_negotiated: u64,
    pub keypairs_negotiated: u64,
    pub keypairs_expired: u64,
    /// SA database rewrites that actually hit the filesystem.
    pub sa_database_commits: u64,
}

impl Counters {
    /// Total rejected datagrams across all error categories.
    pub fn rxerrors(&self) -> u64 {
        self.route_errors + self.protocol_errors + self.authentication_errors
            + self.public_key_errors
    }
}

/// The per-process key management controller.
pub struct KeyManager {
    node_ip4: Ipv4Addr,
    /// Upper bound on an in-flight exchange, in ms.
    negotiation_ttl: u64,
    /// Lifetime of a negotiated SA pair, in ms.
    sa_ttl: u64,
    routes: Vec<Route>,
    sa_db: SaDatabase,
    publisher: SaPublisher,
    counters: Counters,
    audit: AuditRateLimiter,
    outbox: Vec<Vec<u8>>,
}

impl KeyManager {
    /// Build a manager from a validated configuration and write the
    /// initial (empty) SA database.
    ///
    /// An unwritable database path is fatal here: the worker processes
    /// have nothing to watch without it.
    pub fn new(config: &Config, now_ms: u64) -> Result<Self, ManagerError> {
        config.validate()?;
        let mut routes = Vec::with_capacity(config.routes.len());
        for route_config in &config.routes {
            let preshared_key = route_config.preshared_key_bytes()?;
            routes.push(Route::new(
                route_config,
                preshared_key,
                config.negotiation_ttl_ms(),
            ));
        }

        let sa_db = SaDatabase::default();
        let mut publisher = SaPublisher::new(&config.sa_database);
        publisher.commit(&sa_db, now_ms)?;

        Ok(Self {
            node_ip4: config.node_ip4,
            negotiation_ttl: config.negotiation_ttl_ms(),
            sa_ttl: config.sa_ttl_ms(),
            routes,
            sa_db,
            publisher,
            counters: Counters::default(),
            audit: AuditRateLimiter::new(),
            outbox: Vec::new(),
        })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn route(&self, id: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.id == id)
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn sa_database(&self) -> &SaDatabase {
        &self.sa_db
    }

    /// Run one tick: drain inbound datagrams, advance every route's
    /// timers, and commit the SA database if due. Returns the IPv4-framed
    /// datagrams to transmit.
    pub fn tick(&mut self, now_ms: u64, inbound: &[Vec<u8>]) -> Vec<Vec<u8>> {
        for datagram in inbound {
            self.handle_datagram(now_ms, datagram);
        }
        for index in 0..self.routes.len() {
            self.poll_route_timers(index, now_ms);
        }
        self.commit_sa_database(now_ms);
        std::mem::take(&mut self.outbox)
    }

    /// Apply a configuration reload without disturbing unaffected routes.
    ///
    /// A route whose pre-shared key, route SPI and gateway are unchanged
    /// keeps its SAs, timers and exchange untouched. A changed negotiation
    /// TTL replaces only the exchange. Any other change, or a removed
    /// identifier, tears the route's SAs down.
    pub fn reconfigure(&mut self, config: &Config, now_ms: u64) -> Result<(), ManagerError> {
        config.validate()?;
        let mut preshared_keys: Vec<[u8; PRESHARED_KEY_SIZE]> =
            Vec::with_capacity(config.routes.len());
        for route_config in &config.routes {
            preshared_keys.push(route_config.preshared_key_bytes()?);
        }

        if config.sa_database != *self.publisher.path() {
            warn!(
                configured = %config.sa_database.display(),
                active = %self.publisher.path().display(),
                "SA database path changes require a restart; keeping the active path"
            );
        }
        let negotiation_ttl = config.negotiation_ttl_ms();
        let ttl_changed = negotiation_ttl != self.negotiation_ttl;
        self.node_ip4 = config.node_ip4;
        self.negotiation_ttl = negotiation_ttl;
        self.sa_ttl = config.sa_ttl_ms();

        let mut previous = std::mem::take(&mut self.routes);
        let mut rebuilt = Vec::with_capacity(config.routes.len());
        for (route_config, preshared_key) in config.routes.iter().zip(preshared_keys) {
            let position = previous
                .iter()
                .position(|route| route.id == route_config.id);
            let existing = position.map(|index| previous.swap_remove(index));
            match existing {
                Some(mut route)
                    if route.preshared_key == preshared_key
                        && route.spi == route_config.spi
                        && route.gateway == route_config.gateway =>
                {
                    if ttl_changed {
                        route.exchange =
                            Exchange::new(route_config.spi, preshared_key, negotiation_ttl);
                        debug!(route = %route.id, "exchange reset (negotiation TTL changed)");
                    }
                    rebuilt.push(route);
                }
                Some(route) => {
                    if remove_route_sas(&mut self.sa_db, &route) {
                        self.publisher.mark_dirty();
                    }
                    info!(route = %route.id, "route replaced (key, SPI or gateway changed)");
                    rebuilt.push(Route::new(route_config, preshared_key, negotiation_ttl));
                }
                None => {
                    info!(route = %route_config.id, "route added");
                    rebuilt.push(Route::new(route_config, preshared_key, negotiation_ttl));
                }
            }
        }
        for route in &previous {
            if remove_route_sas(&mut self.sa_db, route) {
                self.publisher.mark_dirty();
            }
            info!(route = %route.id, "route removed");
        }
        self.routes = rebuilt;
        self.commit_sa_database(now_ms);
        Ok(())
    }

    fn handle_datagram(&mut self, now_ms: u64, datagram: &[u8]) {
        let (route_spi, payload) = match wire::parse_frame(datagram) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.counters.protocol_errors += 1;
                if self.audit.should_log("", now_ms) {
                    debug!(%error, "dropped malformed exchange datagram");
                }
                return;
            }
        };
        let Some(index) = self.routes.iter().position(|route| route.spi == route_spi) else {
            self.counters.route_errors += 1;
            if self.audit.should_log("", now_ms) {
                debug!(route_spi, "dropped datagram for unknown route SPI");
            }
            return;
        };
        match payload {
            Payload::Nonce(message) => self.handle_nonce(index, now_ms, &message),
            Payload::Key(message) => self.handle_key(index, now_ms, &message),
        }
    }

    fn handle_nonce(&mut self, index: usize, now_ms: u64, message: &NonceMessage) {
        let outcome = {
            let route = &mut self.routes[index];
            route.exchange.receive_nonce(now_ms, message).map(|reply| {
                match reply {
                    // Passive path: answer with our own nonce.
                    Some(nonce) => Some(Payload::Nonce(nonce)),
                    // Active path: both nonces known, emit our key message.
                    None => route.exchange.exchange_key().ok().map(Payload::Key),
                }
            })
        };
        match outcome {
            Ok(response) => {
                self.counters.nonces_negotiated += 1;
                let route = &self.routes[index];
                debug!(route = %route.id, "nonce exchanged");
                let (gateway, spi) = (route.gateway, route.spi);
                if let Some(payload) = response {
                    self.transmit(gateway, spi, &payload);
                }
            }
            Err(error) => self.count_exchange_error(index, now_ms, error),
        }
    }

    fn handle_key(&mut self, index: usize, now_ms: u64, message: &KeyMessage) {
        match self.routes[index].exchange.receive_key(message) {
            Ok(reply) => {
                let route = &self.routes[index];
                let (gateway, spi) = (route.gateway, route.spi);
                if let Some(key) = reply {
                    self.transmit(gateway, spi, &Payload::Key(key));
                }
                // A verified key message always completes the exchange;
                // derive and install in the same tick.
                match self.routes[index].exchange.derive_ephemeral_keys() {
                    Ok(pair) => self.install_key_pair(index, now_ms, pair),
                    Err(error) => self.count_exchange_error(index, now_ms, error),
                }
            }
            Err(error) => self.count_exchange_error(index, now_ms, error),
        }
    }

    /// Advance one route through its timer-driven transitions.
    fn poll_route_timers(&mut self, index: usize, now_ms: u64) {
        let negotiation_ttl = self.negotiation_ttl;

        // Expired in-flight exchange: back off with jitter so peers that
        // expired together do not retry in lockstep.
        {
            let route = &mut self.routes[index];
            if route.exchange.reset_if_expired(now_ms) {
                self.counters.negotiations_expired += 1;
                route.negotiation_delay = Some(now_ms + negotiation_ttl + jitter_ms());
                debug!(route = %route.id, "negotiation expired");
            }
        }

        // SA lifetime exhausted: drop the whole SA set.
        if self.routes[index].status > RouteStatus::Expired
            && timer_fired(self.routes[index].sa_timeout, now_ms)
        {
            self.expire_route_sas(index);
        }

        // Cutover window closed: retire the superseded inbound SA.
        if timer_fired(self.routes[index].prev_sa_timeout, now_ms) {
            let route = &mut self.routes[index];
            route.prev_sa_timeout = None;
            if let Some(prev) = route.prev_rx_sa.take() {
                self.sa_db.inbound_sa.remove(&prev.spi);
                self.publisher.mark_dirty();
                debug!(route = %route.id, spi = prev.spi, "previous inbound SA retired");
            }
        }

        // Aging SAs: become eligible for a replacement exchange.
        if self.routes[index].status > RouteStatus::Rekey
            && timer_fired(self.routes[index].rekey_timeout, now_ms)
        {
            let route = &mut self.routes[index];
            route.status = RouteStatus::Rekey;
            route.rekey_timeout = None;
            debug!(route = %route.id, "eligible for rekey");
        }

        // Initiate when the route needs keys, no exchange is already in
        // flight, and the retry delay allows.
        if self.routes[index].status < RouteStatus::Ready
            && self.routes[index].exchange.is_idle()
            && self.routes[index]
                .negotiation_delay
                .is_none_or(|delay| now_ms >= delay)
        {
            if let Ok(nonce) = self.routes[index].exchange.initiate_exchange(now_ms) {
                self.counters.negotiations_initiated += 1;
                let route = &self.routes[index];
                debug!(route = %route.id, "initiated key negotiation");
                let (gateway, spi) = (route.gateway, route.spi);
                self.transmit(gateway, spi, &Payload::Nonce(nonce));
            }
        }

        // Activate a pending outbound successor.
        if timer_fired(self.routes[index].next_tx_sa_activation, now_ms) {
            let route = &mut self.routes[index];
            route.next_tx_sa_activation = None;
            if let Some(next) = route.next_tx_sa.take() {
                if let Some(old) = route.tx_sa.take() {
                    self.sa_db.outbound_sa.remove(&old.spi);
                }
                info!(route = %route.id, spi = next.spi, "outbound SA activated");
                self.sa_db.outbound_sa.insert(next.spi, next.clone());
                route.tx_sa = Some(next);
                self.publisher.mark_dirty();
            }
        }
    }

    /// Install a freshly derived SA pair on a route.
    fn install_key_pair(&mut self, index: usize, now_ms: u64, pair: EphemeralKeyPair) {
        // An inbound SPI that shadows a live one would make inbound
        // dispatch ambiguous across the whole process. The allocator makes
        // this unreachable; anything else is an invariant violation.
        if self.sa_db.inbound_sa.contains_key(&pair.rx.spi) {
            panic!(
                "ephemeral SPI collision on inbound SA {} (route {})",
                pair.rx.spi, self.routes[index].id
            );
        }
        self.counters.keypairs_negotiated += 1;
        let sa_ttl = self.sa_ttl;
        let activation_delay = self.negotiation_ttl + self.negotiation_ttl / 2;

        let route = &mut self.routes[index];
        route.status = RouteStatus::Ready;

        // Keep the superseded inbound SA alive for whatever remains of its
        // lifetime, so in-flight ciphertext still decrypts during cutover.
        if let Some(stale) = route.prev_rx_sa.take() {
            self.sa_db.inbound_sa.remove(&stale.spi);
        }
        route.prev_rx_sa = route.rx_sa.take();
        route.prev_sa_timeout = route.sa_timeout;

        let rx_sa = SecurityAssociation {
            route: route.id.clone(),
            spi: pair.rx.spi,
            aead: EspAead::AesGcm16Icv,
            key: pair.rx.key,
            salt: pair.rx.salt,
        };
        self.sa_db.inbound_sa.insert(rx_sa.spi, rx_sa.clone());
        route.rx_sa = Some(rx_sa);

        let tx_sa = SecurityAssociation {
            route: route.id.clone(),
            spi: pair.tx.spi,
            aead: EspAead::AesGcm16Icv,
            key: pair.tx.key,
            salt: pair.tx.salt,
        };
        if route.tx_sa.is_none() || route.next_tx_sa.is_some() {
            // No outbound SA yet, or the pending successor just went
            // stale: encrypt under the new SA right away.
            if let Some(old) = route.tx_sa.take() {
                self.sa_db.outbound_sa.remove(&old.spi);
            }
            route.next_tx_sa = None;
            route.next_tx_sa_activation = None;
            self.sa_db.outbound_sa.insert(tx_sa.spi, tx_sa.clone());
            route.tx_sa = Some(tx_sa);
        } else {
            // Hold the new outbound SA back until the peer has had time
            // to install its matching inbound SA.
            route.next_tx_sa = Some(tx_sa);
            route.next_tx_sa_activation = Some(now_ms + activation_delay);
        }

        route.sa_timeout = Some(now_ms + sa_ttl);
        route.rekey_timeout = Some(now_ms + sa_ttl / 2 + jitter_ms());
        info!(
            route = %route.id,
            rx_spi = pair.rx.spi,
            tx_spi = pair.tx.spi,
            "ephemeral key pair negotiated"
        );
        self.publisher.mark_dirty();
    }

    fn expire_route_sas(&mut self, index: usize) {
        self.counters.keypairs_expired += 1;
        let route = &mut self.routes[index];
        info!(route = %route.id, "SAs expired");
        remove_route_sas(&mut self.sa_db, route);
        route.clear_sas();
        route.status = RouteStatus::Expired;
        self.publisher.mark_dirty();
    }

    fn count_exchange_error(&mut self, index: usize, now_ms: u64, error: ExchangeError) {
        match error {
            ExchangeError::Protocol => self.counters.protocol_errors += 1,
            ExchangeError::Authentication => self.counters.authentication_errors += 1,
            ExchangeError::Parameter => self.counters.public_key_errors += 1,
        }
        if self.audit.should_log(&self.routes[index].id, now_ms) {
            warn!(route = %self.routes[index].id, %error, "exchange message rejected");
        }
    }

    fn transmit(&mut self, gateway: Ipv4Addr, route_spi: u32, payload: &Payload) {
        let frame = wire::frame(route_spi, payload);
        self.outbox
            .push(wire::encapsulate_ip4(self.node_ip4, gateway, &frame));
    }

    fn commit_sa_database(&mut self, now_ms: u64) {
        match self.publisher.maybe_commit(&self.sa_db, now_ms) {
            Ok(true) => {
                self.counters.sa_database_commits += 1;
                debug!(path = %self.publisher.path().display(), "SA database committed");
            }
            Ok(false) => {}
            Err(error) => warn!(%error, "failed to commit SA database"),
        }
    }
}

/// Remove all of a route's published SAs. Returns whether anything was
/// actually removed.
fn remove_route_sas(database: &mut SaDatabase, route: &Route) -> bool {
    let mut removed = false;
    for sa in [&route.rx_sa, &route.prev_rx_sa].into_iter().flatten() {
        removed |= database.inbound_sa.remove(&sa.spi).is_some();
    }
    if let Some(sa) = &route.tx_sa {
        removed |= database.outbound_sa.remove(&sa.spi).is_some();
    }
    removed
}

/// Anti-synchronisation jitter, uniform over [0, 250) ms.
fn jitter_ms() -> u64 {
    rand::thread_rng().gen_range(0..250)
}
