//! Types shared between the Chelsio driver core and the Ethernet device
//! framework it registers its ports with.
//!
//! The bit values follow the host framework's encoding, so they can be
//! handed over without translation.

#![no_std]

use bitflags::bitflags;
use strum_macros::{Display, FromRepr};

bitflags! {
    /// Link speeds a port is able to run at.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkSpeeds: u32 {
        /// Autonegotiation is not available.
        const FIXED = 1 << 0;
        const SPEED_100M = 1 << 4;
        const SPEED_1G = 1 << 5;
        const SPEED_10G = 1 << 8;
        const SPEED_25G = 1 << 10;
        const SPEED_40G = 1 << 11;
        const SPEED_50G = 1 << 12;
        const SPEED_100G = 1 << 14;
    }
}

bitflags! {
    /// Packet types the receive side scaling hash can be computed over.
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RssHashFunctions: u64 {
        const IPV4 = 1 << 2;
        const FRAG_IPV4 = 1 << 3;
        const NONFRAG_IPV4_TCP = 1 << 4;
        const NONFRAG_IPV4_UDP = 1 << 5;
        const NONFRAG_IPV4_SCTP = 1 << 6;
        const NONFRAG_IPV4_OTHER = 1 << 7;
        const IPV6 = 1 << 8;
        const FRAG_IPV6 = 1 << 9;
        const NONFRAG_IPV6_TCP = 1 << 10;
        const NONFRAG_IPV6_UDP = 1 << 11;
        const NONFRAG_IPV6_SCTP = 1 << 12;
        const NONFRAG_IPV6_OTHER = 1 << 13;
        const L2_PAYLOAD = 1 << 14;
        const IPV6_EX = 1 << 15;
        const IPV6_TCP_EX = 1 << 16;
        const IPV6_UDP_EX = 1 << 17;
    }
}

#[repr(u8)]
#[derive(Default, Debug, Display, FromRepr, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    #[default]
    Down = 0,
    Up = 1,
}

/// Ethernet header plus CRC, subtracted from the maximum frame length to get the MTU.
pub const ETHER_OVERHEAD: u32 = 14 + 4;

/// What the framework asked for when it configured a port.
#[derive(Debug, Clone)]
pub struct EthDevConfig {
    /// Largest frame the port should receive, including header and CRC.
    pub max_rx_pkt_len: u32,
    pub vlan_strip: bool,
    pub nb_rx_queues: u16,
    pub nb_tx_queues: u16,
}

impl EthDevConfig {
    pub fn mtu(&self) -> u32 {
        self.max_rx_pkt_len.saturating_sub(ETHER_OVERHEAD)
    }
}

impl Default for EthDevConfig {
    fn default() -> Self {
        Self {
            max_rx_pkt_len: 1518,
            vlan_strip: false,
            nb_rx_queues: 1,
            nb_tx_queues: 1,
        }
    }
}

/// An opaque handle for a port that has been registered with the framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortHandle(pub u16);

/// The part of the Ethernet device framework a driver uses to publish its ports.
pub trait PortRegistrar {
    /// Reserve a framework device for port `port_id` of the adapter.
    ///
    /// Returns `None` if the framework has no room left.
    fn allocate(&mut self, name: &str, port_id: u8) -> Option<PortHandle>;

    /// Tell the framework that the port is ready to be used.
    fn probing_finished(&mut self, handle: PortHandle);

    /// Give a previously allocated device back.
    fn release(&mut self, handle: PortHandle);
}
