//! In-process loopback transport.
//!
//! Endpoints attached to the same [`Fabric`] exchange packets through
//! per-port FIFO queues. Every packet is copied on `enqueue`, so message
//! buffers may be reused as soon as the call returns. Drops, duplicates and
//! transmit failures can be injected to exercise the engine's loss handling,
//! and every transmitted header is logged for inspection.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::packet::{PKT_HDR_SIZE, PacketHeader};

use super::{MemRegInfo, MemRegistrar, RoutingInfo, Transport, TransportType, TxItem};

const ROUTING_MAGIC: &[u8; 4] = b"lpbk";

/// Default MTU, giving 1008 payload bytes per packet.
pub const LOOPBACK_MTU: usize = 1024;

/// Shared medium connecting loopback endpoints.
#[derive(Debug, Default)]
pub struct Fabric {
    ports: RefCell<Vec<VecDeque<Vec<u8>>>>,
}

impl Fabric {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn attach(&self) -> u16 {
        let mut ports = self.ports.borrow_mut();
        ports.push(VecDeque::new());
        (ports.len() - 1) as u16
    }

    fn has_port(&self, port: u16) -> bool {
        (port as usize) < self.ports.borrow().len()
    }

    /// Place a raw packet on `port`'s receive queue.
    pub fn inject(&self, port: u16, pkt: &[u8]) {
        if let Some(q) = self.ports.borrow_mut().get_mut(port as usize) {
            q.push_back(pkt.to_vec());
        }
    }

    fn pop(&self, port: u16) -> Option<Vec<u8>> {
        self.ports.borrow_mut().get_mut(port as usize)?.pop_front()
    }

    /// Packets queued but not yet received, across all ports.
    pub fn in_flight(&self) -> usize {
        self.ports.borrow().iter().map(VecDeque::len).sum()
    }
}

/// One endpoint on a [`Fabric`].
pub struct LoopbackTransport {
    fabric: Rc<Fabric>,
    port: u16,
    mtu: usize,
    drop_next: usize,
    duplicate_next: usize,
    fail_next: usize,
    tx_log: Vec<PacketHeader>,
    tx_flush_count: usize,
    next_lkey: u32,
    num_regions: usize,
}

impl LoopbackTransport {
    /// Attach a new endpoint to `fabric` with the default MTU.
    pub fn new(fabric: &Rc<Fabric>) -> Self {
        Self::with_mtu(fabric, LOOPBACK_MTU)
    }

    pub fn with_mtu(fabric: &Rc<Fabric>, mtu: usize) -> Self {
        let port = fabric.attach();
        Self {
            fabric: Rc::clone(fabric),
            port,
            mtu,
            drop_next: 0,
            duplicate_next: 0,
            fail_next: 0,
            tx_log: Vec::new(),
            tx_flush_count: 0,
            next_lkey: 1,
            num_regions: 0,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn fabric(&self) -> &Rc<Fabric> {
        &self.fabric
    }

    /// Silently discard the next `n` transmitted packets.
    pub fn drop_next(&mut self, n: usize) {
        self.drop_next = n;
    }

    /// Deliver each of the next `n` transmitted packets twice.
    pub fn duplicate_next(&mut self, n: usize) {
        self.duplicate_next = n;
    }

    /// Fail the next `n` calls to `enqueue` with an I/O error.
    pub fn fail_next(&mut self, n: usize) {
        self.fail_next = n;
    }

    /// Headers of every packet accepted by `enqueue`, including dropped ones.
    pub fn tx_log(&self) -> &[PacketHeader] {
        &self.tx_log
    }

    pub fn take_tx_log(&mut self) -> Vec<PacketHeader> {
        std::mem::take(&mut self.tx_log)
    }

    pub fn tx_flush_count(&self) -> usize {
        self.tx_flush_count
    }

    /// Regions currently registered through this endpoint.
    pub fn num_registered_regions(&self) -> usize {
        self.num_regions
    }

    fn decode_port(info: &RoutingInfo) -> Option<u16> {
        if &info.buf[..4] != ROUTING_MAGIC {
            return None;
        }
        Some(u16::from_le_bytes([info.buf[4], info.buf[5]]))
    }
}

impl MemRegistrar for LoopbackTransport {
    fn reg_mr(&mut self, addr: *mut u8, _len: usize) -> Result<MemRegInfo> {
        let lkey = self.next_lkey;
        self.next_lkey = self.next_lkey.wrapping_add(1);
        self.num_regions += 1;
        Ok(MemRegInfo {
            transport_mr: addr as u64,
            lkey,
        })
    }

    fn dereg_mr(&mut self, _mr: MemRegInfo) {
        self.num_regions = self.num_regions.saturating_sub(1);
    }
}

impl Transport for LoopbackTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Invalid
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn fill_local_routing_info(&self, info: &mut RoutingInfo) {
        *info = RoutingInfo::default();
        info.buf[..4].copy_from_slice(ROUTING_MAGIC);
        info.buf[4..6].copy_from_slice(&self.port.to_le_bytes());
    }

    fn resolve_remote_routing_info(&mut self, info: &mut RoutingInfo) -> Result<()> {
        match Self::decode_port(info) {
            Some(port) if self.fabric.has_port(port) => Ok(()),
            Some(port) => Err(Error::RoutingInfo(format!("no loopback port {port}"))),
            None => Err(Error::RoutingInfo("not a loopback address".into())),
        }
    }

    fn enqueue(&mut self, item: TxItem<'_>) -> Result<()> {
        let len = PKT_HDR_SIZE + item.payload.len();
        if len > self.mtu {
            return Err(Error::MessageTooLarge {
                size: len,
                max: self.mtu,
            });
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(Error::Io(std::io::Error::other("loopback: injected tx failure")));
        }
        self.tx_log.push(PacketHeader::decode(item.hdr));

        if self.drop_next > 0 {
            self.drop_next -= 1;
            tracing::trace!(port = self.port, "loopback: dropping packet");
            return Ok(());
        }

        let Some(dest) = Self::decode_port(item.routing_info) else {
            tracing::trace!(port = self.port, "loopback: unroutable packet");
            return Ok(());
        };

        let mut pkt = Vec::with_capacity(len);
        pkt.extend_from_slice(item.hdr);
        pkt.extend_from_slice(item.payload);
        if self.duplicate_next > 0 {
            self.duplicate_next -= 1;
            tracing::trace!(port = self.port, "loopback: duplicating packet");
            self.fabric.inject(dest, &pkt);
        }
        self.fabric.inject(dest, &pkt);
        Ok(())
    }

    fn tx_flush(&mut self) -> Result<()> {
        self.tx_flush_count += 1;
        Ok(())
    }

    fn poll_recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        let pkt = self.fabric.pop(self.port)?;
        let n = pkt.len().min(buf.len());
        buf[..n].copy_from_slice(&pkt[..n]);
        Some(n)
    }
}
