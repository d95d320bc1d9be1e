//! Registered memory and message buffers.
//!
//! [`HugeAlloc`] maps memory in 2 MiB hugepage-backed regions, registers each
//! region with the transport once, and hands out power-of-two [`Buffer`]s
//! carved from them. [`MsgBuffer`] lays a message out inside a `Buffer` so
//! that every packet's header sits in registered memory next to its payload.

use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::packet::{PKT_HDR_SIZE, PacketHeader};
use crate::transport::{MemRegInfo, MemRegistrar};

/// Size of one hugepage region.
pub const HUGEPAGE_SIZE: usize = 2 * 1024 * 1024;

/// Smallest buffer class.
pub const MIN_CLASS_SIZE: usize = 64;

const MIN_CLASS_SHIFT: u32 = MIN_CLASS_SIZE.trailing_zeros();

/// Classes from 64 B up to 1 GiB.
const NUM_CLASSES: usize = 25;

/// Largest single allocation.
pub const MAX_CLASS_SIZE: usize = MIN_CLASS_SIZE << (NUM_CLASSES - 1);

#[inline]
const fn round_up8(n: usize) -> usize {
    (n + 7) & !7
}

fn class_index(class_size: usize) -> usize {
    debug_assert!(class_size.is_power_of_two() && class_size >= MIN_CLASS_SIZE);
    (class_size.trailing_zeros() - MIN_CLASS_SHIFT) as usize
}

/// An mmap'd region, unmapped when the last buffer carved from it drops.
struct Region {
    ptr: NonNull<u8>,
    len: usize,
    hugepages: bool,
    mr: Cell<Option<MemRegInfo>>,
}

impl Region {
    fn map(len: usize) -> std::io::Result<Self> {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

        #[cfg(target_os = "linux")]
        {
            // SAFETY: fresh anonymous mapping, no address hint.
            let p = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    prot,
                    flags | libc::MAP_HUGETLB,
                    -1,
                    0,
                )
            };
            if p != libc::MAP_FAILED
                && let Some(ptr) = NonNull::new(p.cast::<u8>())
            {
                return Ok(Self {
                    ptr,
                    len,
                    hugepages: true,
                    mr: Cell::new(None),
                });
            }
        }

        // SAFETY: as above, without MAP_HUGETLB.
        let p = unsafe { libc::mmap(std::ptr::null_mut(), len, prot, flags, -1, 0) };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        let ptr = NonNull::new(p.cast::<u8>())
            .ok_or_else(|| std::io::Error::other("mmap returned a null mapping"))?;
        Ok(Self {
            ptr,
            len,
            hugepages: false,
            mr: Cell::new(None),
        })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and nothing borrows the
        // region once the last Rc is gone.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// A power-of-two chunk of registered memory.
///
/// Each `Buffer` exclusively owns its byte range. It keeps its region mapped
/// even if the allocator is dropped first.
pub struct Buffer {
    region: Rc<Region>,
    ptr: NonNull<u8>,
    class_size: usize,
    lkey: u32,
}

impl Buffer {
    /// Get the buffer size (a power of two).
    #[inline]
    pub fn class_size(&self) -> usize {
        self.class_size
    }

    /// Get the local key of the containing region.
    #[inline]
    pub fn lkey(&self) -> u32 {
        self.lkey
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: [ptr, ptr + class_size) lies inside the live region and is
        // owned by this buffer alone.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.class_size) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; &mut self guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.class_size) }
    }

    /// Split into two halves of the next smaller class.
    fn split(self) -> (Buffer, Buffer) {
        let half = self.class_size / 2;
        // SAFETY: half < class_size, so the upper half stays in bounds.
        let upper_ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(half)) };
        let upper = Buffer {
            region: Rc::clone(&self.region),
            ptr: upper_ptr,
            class_size: half,
            lkey: self.lkey,
        };
        let lower = Buffer {
            class_size: half,
            ..self
        };
        (lower, upper)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("ptr", &self.ptr)
            .field("class_size", &self.class_size)
            .field("lkey", &self.lkey)
            .finish()
    }
}

/// Hugepage-backed size-class allocator.
///
/// Regions are registered once, at map time. Freed buffers go back to their
/// class's free list; a request for an empty class splits the smallest larger
/// free buffer, and only when none exists is a new region mapped.
pub struct HugeAlloc {
    regions: Vec<Rc<Region>>,
    free_lists: Vec<Vec<Buffer>>,
    total_mapped: usize,
}

impl Default for HugeAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl HugeAlloc {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            free_lists: (0..NUM_CLASSES).map(|_| Vec::new()).collect(),
            total_mapped: 0,
        }
    }

    /// Allocate a buffer of at least `size` bytes.
    pub fn alloc(&mut self, size: usize, reg: &mut dyn MemRegistrar) -> Result<Buffer> {
        if size > MAX_CLASS_SIZE {
            return Err(Error::MessageTooLarge {
                size,
                max: MAX_CLASS_SIZE,
            });
        }
        let class_size = size.max(MIN_CLASS_SIZE).next_power_of_two();
        let class = class_index(class_size);

        if let Some(buf) = self.free_lists[class].pop() {
            return Ok(buf);
        }

        let larger = (class + 1..NUM_CLASSES).find(|&c| !self.free_lists[c].is_empty());
        let mut buf = match larger.and_then(|c| self.free_lists[c].pop()) {
            Some(buf) => buf,
            None => self.map_region(class_size.max(HUGEPAGE_SIZE), reg)?,
        };

        while buf.class_size > class_size {
            let (lower, upper) = buf.split();
            self.free_lists[class_index(upper.class_size)].push(upper);
            buf = lower;
        }
        Ok(buf)
    }

    /// Return a buffer to its class.
    pub fn free(&mut self, buf: Buffer) {
        self.free_lists[class_index(buf.class_size)].push(buf);
    }

    fn map_region(&mut self, len: usize, reg: &mut dyn MemRegistrar) -> Result<Buffer> {
        let region = Region::map(len).map_err(Error::AllocFailed)?;
        let mr = reg.reg_mr(region.ptr.as_ptr(), region.len)?;
        region.mr.set(Some(mr));

        tracing::debug!(
            len,
            hugepages = region.hugepages,
            lkey = mr.lkey,
            "mapped buffer region"
        );
        if !region.hugepages {
            tracing::trace!("hugepages unavailable, using regular pages");
        }

        let region = Rc::new(region);
        self.regions.push(Rc::clone(&region));
        self.total_mapped += len;
        Ok(Buffer {
            ptr: region.ptr,
            region,
            class_size: len,
            lkey: mr.lkey,
        })
    }

    /// Deregister every region. Called once, when the owning engine shuts
    /// down; outstanding buffers stay mapped but must not be transmitted.
    pub fn deregister_all(&mut self, reg: &mut dyn MemRegistrar) {
        for region in &self.regions {
            if let Some(mr) = region.mr.take() {
                reg.dereg_mr(mr);
            }
        }
    }

    /// Number of regions mapped so far.
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Bytes mapped across all regions.
    pub fn total_mapped(&self) -> usize {
        self.total_mapped
    }

    /// Bytes sitting in free lists.
    pub fn free_bytes(&self) -> usize {
        self.free_lists
            .iter()
            .flat_map(|l| l.iter())
            .map(|b| b.class_size)
            .sum()
    }
}

/// A message laid out for zero-copy transmission.
///
/// ```text
/// offset 0                 header 0
/// offset 16                payload, data_size bytes, padded to 8
/// 16 + round_up8(size)     header 1
/// ... + 16 * (n - 1)       header n
/// ```
///
/// Header 0 immediately precedes the payload, so a single-packet message is
/// one contiguous span. Headers of later packets trail the padded payload.
pub struct MsgBuffer {
    buffer: Buffer,
    max_data_size: usize,
    max_num_pkts: usize,
    max_data_per_pkt: usize,
    data_size: usize,
    num_pkts: usize,
    data_sent: usize,
    pkts_sent: usize,
}

impl MsgBuffer {
    /// Bytes of backing storage needed for a message of up to
    /// `max_data_size` bytes split into `max_num_pkts` packets.
    pub fn required_capacity(max_data_size: usize, max_num_pkts: usize) -> usize {
        debug_assert!(max_num_pkts >= 1);
        PKT_HDR_SIZE + round_up8(max_data_size) + (max_num_pkts - 1) * PKT_HDR_SIZE
    }

    /// Lay out a message of `max_data_size` bytes inside `buffer`.
    ///
    /// The message starts at its maximum size.
    pub fn from_buffer(
        buffer: Buffer,
        max_data_size: usize,
        max_data_per_pkt: usize,
    ) -> Result<Self> {
        let max_num_pkts = PacketHeader::calc_num_pkts(max_data_size, max_data_per_pkt);
        let required = Self::required_capacity(max_data_size, max_num_pkts);
        if buffer.class_size() < required {
            return Err(Error::BufferTooSmall {
                required,
                available: buffer.class_size(),
            });
        }
        Ok(Self {
            buffer,
            max_data_size,
            max_num_pkts,
            max_data_per_pkt,
            data_size: max_data_size,
            num_pkts: max_num_pkts,
            data_sent: 0,
            pkts_sent: 0,
        })
    }

    /// Change the message size without moving the payload.
    ///
    /// Trailing headers move with the new size and must be rewritten.
    pub fn resize(&mut self, new_data_size: usize) -> Result<()> {
        if new_data_size > self.max_data_size {
            return Err(Error::MessageTooLarge {
                size: new_data_size,
                max: self.max_data_size,
            });
        }
        self.data_size = new_data_size;
        self.num_pkts = PacketHeader::calc_num_pkts(new_data_size, self.max_data_per_pkt);
        Ok(())
    }

    #[inline]
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    #[inline]
    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    #[inline]
    pub fn num_pkts(&self) -> usize {
        self.num_pkts
    }

    #[inline]
    pub fn max_num_pkts(&self) -> usize {
        self.max_num_pkts
    }

    #[inline]
    pub fn max_data_per_pkt(&self) -> usize {
        self.max_data_per_pkt
    }

    /// Payload bytes handed to the transport so far.
    #[inline]
    pub fn data_sent(&self) -> usize {
        self.data_sent
    }

    /// Packets handed to the transport so far.
    #[inline]
    pub fn pkts_sent(&self) -> usize {
        self.pkts_sent
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        self.buffer.lkey()
    }

    pub(crate) fn record_sent(&mut self, bytes: usize) {
        self.data_sent += bytes;
        self.pkts_sent += 1;
    }

    pub(crate) fn reset_progress(&mut self) {
        self.data_sent = 0;
        self.pkts_sent = 0;
    }

    /// Get the payload.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buffer.as_slice()[PKT_HDR_SIZE..PKT_HDR_SIZE + self.data_size]
    }

    /// Get the payload as a mutable slice.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let end = PKT_HDR_SIZE + self.data_size;
        &mut self.buffer.as_mut_slice()[PKT_HDR_SIZE..end]
    }

    /// Offset of header `n` from the start of the buffer.
    #[inline]
    pub fn pkthdr_offset(&self, n: usize) -> usize {
        if n == 0 {
            0
        } else {
            PKT_HDR_SIZE + round_up8(self.data_size) + (n - 1) * PKT_HDR_SIZE
        }
    }

    /// Raw bytes of header `n`.
    ///
    /// # Panics
    /// Panics if `n >= num_pkts()`.
    pub fn pkthdr_bytes(&self, n: usize) -> &[u8; PKT_HDR_SIZE] {
        assert!(n < self.num_pkts, "header {n} of {}", self.num_pkts);
        let off = self.pkthdr_offset(n);
        // SAFETY: the layout reserves num_pkts <= max_num_pkts header slots
        // inside the buffer, checked in from_buffer.
        unsafe { &*self.buffer.as_ptr().add(off).cast::<[u8; PKT_HDR_SIZE]>() }
    }

    /// Decode header `n`.
    pub fn pkthdr(&self, n: usize) -> PacketHeader {
        PacketHeader::decode(self.pkthdr_bytes(n))
    }

    /// Encode `hdr` into header slot `n`.
    ///
    /// # Panics
    /// Panics if `n >= num_pkts()`.
    pub fn set_pkthdr(&mut self, n: usize, hdr: &PacketHeader) {
        assert!(n < self.num_pkts, "header {n} of {}", self.num_pkts);
        let off = self.pkthdr_offset(n);
        self.buffer.as_mut_slice()[off..off + PKT_HDR_SIZE].copy_from_slice(&hdr.encode());
    }

    /// Check that header 0 carries the magic.
    pub fn check_magic(&self) -> Result<()> {
        self.pkthdr(0).validate()
    }

    /// Payload byte range carried by packet `n`.
    #[inline]
    pub fn pkt_data_range(&self, n: usize) -> std::ops::Range<usize> {
        let start = (n * self.max_data_per_pkt).min(self.data_size);
        let end = (start + self.max_data_per_pkt).min(self.data_size);
        start..end
    }

    /// Header and payload of packet `n`, ready for transmission.
    pub fn pkt(&self, n: usize) -> (&[u8; PKT_HDR_SIZE], &[u8]) {
        let range = self.pkt_data_range(n);
        (self.pkthdr_bytes(n), &self.data()[range])
    }

    /// Give back the underlying buffer.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

impl fmt::Debug for MsgBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgBuffer")
            .field("data_size", &self.data_size)
            .field("max_data_size", &self.max_data_size)
            .field("num_pkts", &self.num_pkts)
            .field("pkts_sent", &self.pkts_sent)
            .finish_non_exhaustive()
    }
}
