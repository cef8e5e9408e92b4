//! Per-route negotiation state.

use crate::config::RouteConfig;
use crate::exchange::{Exchange, PRESHARED_KEY_SIZE};
use crate::sa::SecurityAssociation;
use std::fmt;
use std::net::Ipv4Addr;

/// Route lifecycle status. Ordered: a route climbs from `Expired` to
/// `Ready` as exchanges complete and falls back as SAs age out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouteStatus {
    /// No usable SAs; negotiation is required.
    Expired,
    /// SAs are usable but aging; a replacement exchange may be initiated.
    Rekey,
    /// SAs are fresh; no negotiation needed.
    Ready,
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteStatus::Expired => write!(f, "expired"),
            RouteStatus::Rekey => write!(f, "rekey"),
            RouteStatus::Ready => write!(f, "ready"),
        }
    }
}

/// A configured tunnel and everything negotiated for it.
///
/// Holds up to four SA slots: the active inbound/outbound pair, the
/// superseded inbound SA kept through the rekey cutover window, and a
/// pending outbound successor whose activation is delayed until the peer
/// has had time to install its matching inbound SA. All deadlines are
/// absolute milliseconds on the manager's timebase.
pub struct Route {
    pub(super) id: String,
    pub(super) gateway: Ipv4Addr,
    pub(super) preshared_key: [u8; PRESHARED_KEY_SIZE],
    pub(super) spi: u32,
    pub(super) exchange: Exchange,
    pub(super) status: RouteStatus,
    /// Earliest time the next exchange may be initiated.
    pub(super) negotiation_delay: Option<u64>,
    pub(super) rx_sa: Option<SecurityAssociation>,
    pub(super) prev_rx_sa: Option<SecurityAssociation>,
    pub(super) tx_sa: Option<SecurityAssociation>,
    pub(super) next_tx_sa: Option<SecurityAssociation>,
    pub(super) sa_timeout: Option<u64>,
    pub(super) prev_sa_timeout: Option<u64>,
    pub(super) rekey_timeout: Option<u64>,
    pub(super) next_tx_sa_activation: Option<u64>,
}

impl Route {
    pub(super) fn new(
        config: &RouteConfig,
        preshared_key: [u8; PRESHARED_KEY_SIZE],
        negotiation_ttl_ms: u64,
    ) -> Self {
        Self {
            id: config.id.clone(),
            gateway: config.gateway,
            preshared_key,
            spi: config.spi,
            exchange: Exchange::new(config.spi, preshared_key, negotiation_ttl_ms),
            status: RouteStatus::Expired,
            negotiation_delay: None,
            rx_sa: None,
            prev_rx_sa: None,
            tx_sa: None,
            next_tx_sa: None,
            sa_timeout: None,
            prev_sa_timeout: None,
            rekey_timeout: None,
            next_tx_sa_activation: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn spi(&self) -> u32 {
        self.spi
    }

    pub fn status(&self) -> RouteStatus {
        self.status
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn rx_sa(&self) -> Option<&SecurityAssociation> {
        self.rx_sa.as_ref()
    }

    pub fn prev_rx_sa(&self) -> Option<&SecurityAssociation> {
        self.prev_rx_sa.as_ref()
    }

    pub fn tx_sa(&self) -> Option<&SecurityAssociation> {
        self.tx_sa.as_ref()
    }

    pub fn next_tx_sa(&self) -> Option<&SecurityAssociation> {
        self.next_tx_sa.as_ref()
    }

    pub fn sa_timeout(&self) -> Option<u64> {
        self.sa_timeout
    }

    pub fn prev_sa_timeout(&self) -> Option<u64> {
        self.prev_sa_timeout
    }

    pub fn rekey_timeout(&self) -> Option<u64> {
        self.rekey_timeout
    }

    pub fn next_tx_sa_activation(&self) -> Option<u64> {
        self.next_tx_sa_activation
    }

    /// Drop every SA slot and SA timer.
    pub(super) fn clear_sas(&mut self) {
        self.rx_sa = None;
        self.prev_rx_sa = None;
        self.tx_sa = None;
        self.next_tx_sa = None;
        self.sa_timeout = None;
        self.prev_sa_timeout = None;
        self.rekey_timeout = None;
        self.next_tx_sa_activation = None;
    }
}

/// Whether an armed deadline has been reached.
pub(super) fn timer_fired(deadline: Option<u64>, now_ms: u64) -> bool {
    deadline.is_some_and(|d| now_ms >= d)
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("id", &self.id)
            .field("gateway", &self.gateway)
            .field("spi", &self.spi)
            .field("status", &self.status)
            .field("exchange", &self.exchange)
            .field("rx_sa", &self.rx_sa.as_ref().map(|sa| sa.spi))
            .field("prev_rx_sa", &self.prev_rx_sa.as_ref().map(|sa| sa.spi))
            .field("tx_sa", &self.tx_sa.as_ref().map(|sa| sa.spi))
            .field("next_tx_sa", &self.next_tx_sa.as_ref().map(|sa| sa.spi))
            .finish()
    }
}
