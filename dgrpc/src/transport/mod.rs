//! Transport abstraction.
//!
//! The engine never touches a NIC directly. A [`Transport`] moves whole
//! packets (a 16-byte header followed by up to `max_data_per_pkt` payload
//! bytes) between endpoints identified by opaque [`RoutingInfo`] blobs, and
//! registers memory regions for zero-copy transmission.

use std::fmt;

use crate::error::Result;
use crate::packet::PKT_HDR_SIZE;

pub mod loopback;

pub use loopback::{Fabric, LoopbackTransport};

/// Maximum size of transport-specific routing info.
pub const MAX_ROUTING_INFO_SIZE: usize = 128;

/// Maximum size of transport-specific memory registration info.
pub const MAX_MEM_REG_INFO_SIZE: usize = 64;

/// Generic routing information for a remote endpoint.
///
/// The engine treats the contents as opaque; only the transport interprets
/// them, first when filling in local info and again when resolving info
/// received from a peer.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RoutingInfo {
    pub buf: [u8; MAX_ROUTING_INFO_SIZE],
}

impl Default for RoutingInfo {
    fn default() -> Self {
        Self {
            buf: [0; MAX_ROUTING_INFO_SIZE],
        }
    }
}

impl fmt::Debug for RoutingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingInfo")
            .field("prefix", &&self.buf[..16])
            .finish_non_exhaustive()
    }
}

/// Memory registration info returned by [`MemRegistrar::reg_mr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegInfo {
    /// Transport-specific handle for the registered region.
    pub transport_mr: u64,
    /// Local key used when transmitting from the region.
    pub lkey: u32,
}

const _: () = assert!(std::mem::size_of::<MemRegInfo>() <= MAX_MEM_REG_INFO_SIZE);

/// Underlying network flavor of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    InfiniBand,
    RoCE,
    OmniPath,
    Invalid,
}

impl TransportType {
    pub fn name(&self) -> &'static str {
        match self {
            TransportType::InfiniBand => "[InfiniBand]",
            TransportType::RoCE => "[RoCE]",
            TransportType::OmniPath => "[OmniPath]",
            TransportType::Invalid => "[Invalid transport]",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One outgoing packet, in scatter form.
///
/// `hdr` and `payload` point into a registered message buffer (or into a
/// stack header for control packets with no payload). The transport may
/// read them only until `enqueue` returns.
#[derive(Debug, Clone, Copy)]
pub struct TxItem<'a> {
    pub routing_info: &'a RoutingInfo,
    pub hdr: &'a [u8; PKT_HDR_SIZE],
    pub payload: &'a [u8],
    pub lkey: u32,
}

/// Memory registration, split out so the allocator can register regions
/// without holding the whole transport.
pub trait MemRegistrar {
    /// Register `len` bytes at `addr` for transmission.
    fn reg_mr(&mut self, addr: *mut u8, len: usize) -> Result<MemRegInfo>;

    /// Release a registration previously returned by `reg_mr`.
    fn dereg_mr(&mut self, mr: MemRegInfo);
}

/// Unreliable datagram transport contract.
///
/// Packets may be dropped or duplicated but never partially delivered.
/// Reordering across different exchanges is tolerated by the engine.
pub trait Transport: MemRegistrar {
    fn transport_type(&self) -> TransportType;

    /// Largest packet (header included) the transport can carry.
    fn mtu(&self) -> usize;

    /// Largest payload per packet.
    #[inline]
    fn max_data_per_pkt(&self) -> usize {
        self.mtu().saturating_sub(PKT_HDR_SIZE)
    }

    /// Describe the local endpoint so peers can address it.
    fn fill_local_routing_info(&self, info: &mut RoutingInfo);

    /// Convert routing info received from a peer into the form `enqueue`
    /// expects, in place.
    fn resolve_remote_routing_info(&mut self, info: &mut RoutingInfo) -> Result<()>;

    /// Queue one packet for transmission.
    fn enqueue(&mut self, item: TxItem<'_>) -> Result<()>;

    /// Force out every queued packet.
    fn tx_flush(&mut self) -> Result<()>;

    /// Copy the next received packet into `buf`, returning its length.
    fn poll_recv(&mut self, buf: &mut [u8]) -> Option<usize>;
}
