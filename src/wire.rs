//! Wire Format for Key-Exchange Datagrams
//!
//! Every exchange message travels behind a fixed 8-byte transport header
//! that names the target route and the message type, letting the manager
//! dispatch a datagram to the right exchange without touching the body.
//!
//! ## Transport header (8 bytes)
//!
//! ```text
//! [route_spi:4 BE][message_type:1][reserved:3 = 0]
//! ```
//!
//! | Type | Body            | Size     |
//! |------|-----------------|----------|
//! | 1    | Nonce message   | 32 bytes |
//! | 3    | Key message     | 68 bytes |
//!
//! Parsing is strict: the header must be present and the body length must
//! match the declared type exactly. For transmission the frame is wrapped
//! in an IPv4 header carrying protocol number 99 ("any private encryption
//! scheme").

use crate::exchange::{KeyMessage, NonceMessage, KEY_MESSAGE_SIZE, NONCE_MESSAGE_SIZE};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Size of the transport header.
pub const TRANSPORT_HEADER_SIZE: usize = 8;

/// Message type carried by a nonce message.
pub const MESSAGE_TYPE_NONCE: u8 = 1;

/// Message type carried by a key message.
pub const MESSAGE_TYPE_KEY: u8 = 3;

/// IP protocol number for key-exchange traffic.
pub const IP_PROTOCOL_KEY_EXCHANGE: u8 = 99;

/// Size of the IPv4 header we emit (no options).
pub const IPV4_HEADER_SIZE: usize = 20;

/// TTL of emitted datagrams.
pub const IPV4_TTL: u8 = 64;

/// Errors from wire parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too short: expected at least {expected}, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("body length {got} does not match message type (expected {expected})")]
    BodyLength { expected: usize, got: usize },

    #[error("not an IPv4 packet")]
    NotIpv4,

    #[error("unexpected IP protocol: {0}")]
    UnexpectedProtocol(u8),
}

/// A decoded exchange message body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Payload {
    Nonce(NonceMessage),
    Key(KeyMessage),
}

impl Payload {
    /// The message type code this body travels under.
    pub fn message_type(&self) -> u8 {
        match self {
            Payload::Nonce(_) => MESSAGE_TYPE_NONCE,
            Payload::Key(_) => MESSAGE_TYPE_KEY,
        }
    }
}

/// Compose a transport frame: header followed by the message body.
pub fn frame(route_spi: u32, payload: &Payload) -> Vec<u8> {
    let body_len = match payload {
        Payload::Nonce(_) => NONCE_MESSAGE_SIZE,
        Payload::Key(_) => KEY_MESSAGE_SIZE,
    };
    let mut out = Vec::with_capacity(TRANSPORT_HEADER_SIZE + body_len);
    out.extend_from_slice(&route_spi.to_be_bytes());
    out.push(payload.message_type());
    out.extend_from_slice(&[0u8; 3]);
    match payload {
        Payload::Nonce(message) => out.extend_from_slice(message.as_bytes()),
        Payload::Key(message) => out.extend_from_slice(&message.to_bytes()),
    }
    out
}

/// Parse a transport frame into its route SPI and message body.
pub fn parse_frame(data: &[u8]) -> Result<(u32, Payload), WireError> {
    if data.len() < TRANSPORT_HEADER_SIZE {
        return Err(WireError::Truncated {
            expected: TRANSPORT_HEADER_SIZE,
            got: data.len(),
        });
    }
    let route_spi = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let message_type = data[4];
    let body = &data[TRANSPORT_HEADER_SIZE..];

    let payload = match message_type {
        MESSAGE_TYPE_NONCE => {
            if body.len() != NONCE_MESSAGE_SIZE {
                return Err(WireError::BodyLength {
                    expected: NONCE_MESSAGE_SIZE,
                    got: body.len(),
                });
            }
            Payload::Nonce(NonceMessage::parse(body).expect("length checked"))
        }
        MESSAGE_TYPE_KEY => {
            if body.len() != KEY_MESSAGE_SIZE {
                return Err(WireError::BodyLength {
                    expected: KEY_MESSAGE_SIZE,
                    got: body.len(),
                });
            }
            Payload::Key(KeyMessage::parse(body).expect("length checked"))
        }
        other => return Err(WireError::UnknownMessageType(other)),
    };
    Ok((route_spi, payload))
}

/// Wrap a transport frame in an IPv4 header for transmission.
pub fn encapsulate_ip4(source: Ipv4Addr, destination: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let total_len = (IPV4_HEADER_SIZE + payload.len()) as u16;
    let mut packet = Vec::with_capacity(IPV4_HEADER_SIZE + payload.len());
    packet.push(0x45); // version 4, IHL 5
    packet.push(0); // DSCP/ECN
    packet.extend_from_slice(&total_len.to_be_bytes());
    packet.extend_from_slice(&[0u8; 4]); // identification, flags, fragment offset
    packet.push(IPV4_TTL);
    packet.push(IP_PROTOCOL_KEY_EXCHANGE);
    packet.extend_from_slice(&[0u8; 2]); // checksum placeholder
    packet.extend_from_slice(&source.octets());
    packet.extend_from_slice(&destination.octets());
    let checksum = ip4_checksum(&packet[..IPV4_HEADER_SIZE]);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Strip the IPv4 header off a received datagram, checking the protocol
/// number, and return the transport-framed payload.
pub fn decapsulate_ip4(packet: &[u8]) -> Result<&[u8], WireError> {
    if packet.len() < IPV4_HEADER_SIZE {
        return Err(WireError::Truncated {
            expected: IPV4_HEADER_SIZE,
            got: packet.len(),
        });
    }
    if packet[0] >> 4 != 4 {
        return Err(WireError::NotIpv4);
    }
    let header_len = ((packet[0] & 0x0F) as usize) * 4;
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if header_len < IPV4_HEADER_SIZE || total_len < header_len || packet.len() < total_len {
        return Err(WireError::Truncated {
            expected: total_len.max(header_len),
            got: packet.len(),
        });
    }
    if packet[9] != IP_PROTOCOL_KEY_EXCHANGE {
        return Err(WireError::UnexpectedProtocol(packet[9]));
    }
    Ok(&packet[header_len..total_len])
}

/// Destination address of an emitted IPv4 datagram.
pub fn ip4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = packet.get(16..20)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// Ones'-complement sum over the IPv4 header.
fn ip4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        let word = u16::from_be_bytes([chunk[0], *chunk.get(1).unwrap_or(&0)]);
        sum += u32::from(word);
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
