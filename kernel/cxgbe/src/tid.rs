//! Bookkeeping of the hardware's TIDs.
//!
//! There are three separate spaces:
//! * general slots (with an optional hash region at the top) that the
//!   firmware assigns and we only record,
//! * active-open ids that we hand out from a free stack,
//! * filter slots that we hand out from a bitmap.

use alloc::vec::Vec;
use core::{
    fmt,
    mem::size_of,
    sync::atomic::{AtomicU32, Ordering},
};

use byteorder::BigEndian;
use spin::Mutex;
use strum_macros::Display;
use zerocopy::{AsBytes, FromBytes, U32, U64};

use crate::{bitmap::BitmapAllocator, sge::ControlChannel};

/// Upper limit for active-open ids, independent of what the firmware offers.
pub const MAX_ATIDS: u32 = 8192;

/// Filter slots an IPv6 rule occupies.
const IPV6_FILTER_SLOTS: usize = 4;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TidError {
    OutOfMemory,
    /// The ranges don't fit together.
    InvalidRanges,
}

impl fmt::Display for TidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str((*self).into())
    }
}

impl From<TidError> for &'static str {
    fn from(error: TidError) -> Self {
        match error {
            TidError::OutOfMemory => "out of memory for the TID tables",
            TidError::InvalidRanges => "inconsistent TID ranges",
        }
    }
}

/// The sizes of the TID spaces, as reported by the firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TidRanges {
    pub ntids: u32,
    pub natids: u32,
    pub nftids: u32,
    /// first hardware filter id
    pub ftid_base: u32,
    /// first TID of the hash region, 0 if there is none
    pub hash_base: u32,
}

struct ActiveOpenTable<T> {
    entries: Vec<Option<T>>,
    /// free ids, the next one to hand out last
    free: Vec<u32>,
    in_use: u32,
}

/// The TID tables of an adapter.
///
/// Every general slot has its own lock, but a slot only ever has one
/// writer, so those locks are never contended.
pub struct TidTable<T> {
    ranges: TidRanges,
    slots: Vec<Mutex<Option<T>>>,
    atids: Mutex<ActiveOpenTable<T>>,
    ftids: Mutex<BitmapAllocator>,
    tids_in_use: AtomicU32,
    hash_tids_in_use: AtomicU32,
    conns_in_use: AtomicU32,
}

fn decrement(counter: &AtomicU32) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
}

impl<T> TidTable<T> {
    /// Allocate the tables.
    ///
    /// Either everything is allocated or nothing is.
    pub fn init(ranges: TidRanges) -> Result<Self, TidError> {
        if ranges.natids > ranges.ntids / 2 || ranges.hash_base > ranges.ntids {
            return Err(TidError::InvalidRanges);
        }
        let ntids = ranges.ntids as usize;
        let natids = ranges.natids as usize;

        let mut slots = Vec::new();
        slots.try_reserve_exact(ntids).map_err(|_| TidError::OutOfMemory)?;
        slots.extend((0..ntids).map(|_| Mutex::new(None)));

        let mut entries = Vec::new();
        entries.try_reserve_exact(natids).map_err(|_| TidError::OutOfMemory)?;
        entries.extend((0..natids).map(|_| None));

        // id 0 is on top of the stack
        let mut free = Vec::new();
        free.try_reserve_exact(natids).map_err(|_| TidError::OutOfMemory)?;
        free.extend((0..ranges.natids).rev());

        let ftids = BitmapAllocator::new(ranges.nftids as usize)
            .map_err(|_| TidError::OutOfMemory)?;

        debug!("TID tables: {ranges:?}");
        Ok(Self {
            ranges,
            slots,
            atids: Mutex::new(ActiveOpenTable { entries, free, in_use: 0 }),
            ftids: Mutex::new(ftids),
            tids_in_use: AtomicU32::new(0),
            hash_tids_in_use: AtomicU32::new(0),
            conns_in_use: AtomicU32::new(0),
        })
    }

    pub fn ranges(&self) -> TidRanges {
        self.ranges
    }

    /// Take an active-open id and remember `data` for it.
    ///
    /// Returns `None` if all ids are taken.
    pub fn allocate_active_open(&self, data: T) -> Option<u32> {
        let mut atids = self.atids.lock();
        let atid = atids.free.pop()?;
        atids.entries[atid as usize] = Some(data);
        atids.in_use += 1;
        Some(atid)
    }

    /// Give an active-open id back and return what was stored for it.
    ///
    /// The id must have been allocated and not released since.
    pub fn release_active_open(&self, atid: u32) -> Option<T> {
        let mut atids = self.atids.lock();
        let data = atids.entries.get_mut(atid as usize)?.take();
        debug_assert!(data.is_some(), "active-open id {atid} released twice");
        atids.free.push(atid);
        atids.in_use = atids.in_use.saturating_sub(1);
        data
    }

    pub fn active_opens_in_use(&self) -> u32 {
        self.atids.lock().in_use
    }

    fn in_hash_region(&self, tid: u32) -> bool {
        self.ranges.hash_base != 0 && tid >= self.ranges.hash_base
    }

    fn family_counter(&self, tid: u32) -> &AtomicU32 {
        if self.in_hash_region(tid) {
            &self.hash_tids_in_use
        } else {
            &self.tids_in_use
        }
    }

    /// Record `data` for a TID the firmware assigned.
    pub fn insert(&self, tid: u32, data: T, family: AddressFamily) {
        let Some(slot) = self.slots.get(tid as usize) else {
            warn!("inserting TID {tid} beyond {} TIDs", self.ranges.ntids);
            return;
        };
        *slot.lock() = Some(data);
        if family == AddressFamily::Ipv4 {
            self.family_counter(tid).fetch_add(1, Ordering::AcqRel);
        }
        self.conns_in_use.fetch_add(1, Ordering::AcqRel);
    }

    /// Forget a TID and tell the hardware it is free again.
    ///
    /// The release message goes out even if nothing was stored for the TID.
    /// If `channel` has no buffer for it, it is dropped.
    pub fn remove(&self, tid: u32, channel: &dyn ControlChannel, family: AddressFamily) -> Option<T> {
        let Some(slot) = self.slots.get(tid as usize) else {
            warn!("removing TID {tid} beyond {} TIDs", self.ranges.ntids);
            return None;
        };
        let data = slot.lock().take();
        if data.is_some() {
            decrement(&self.conns_in_use);
            if family == AddressFamily::Ipv4 {
                decrement(self.family_counter(tid));
            }
        }

        match channel.allocate(size_of::<TidReleaseMessage>()) {
            Some(mut buffer) if buffer.len() >= size_of::<TidReleaseMessage>() => {
                buffer.truncate(size_of::<TidReleaseMessage>());
                buffer.copy_from_slice(TidReleaseMessage::new(tid).as_bytes());
                channel.transmit(buffer);
            }
            _ => trace!("no buffer to release TID {tid}, dropping the notification"),
        }
        data
    }

    pub fn is_occupied(&self, tid: u32) -> bool {
        self.slots
            .get(tid as usize)
            .is_some_and(|slot| slot.lock().is_some())
    }

    /// IPv4 TIDs in use below the hash region
    pub fn tids_in_use(&self) -> u32 {
        self.tids_in_use.load(Ordering::Acquire)
    }

    /// IPv4 TIDs in use in the hash region
    pub fn hash_tids_in_use(&self) -> u32 {
        self.hash_tids_in_use.load(Ordering::Acquire)
    }

    pub fn conns_in_use(&self) -> u32 {
        self.conns_in_use.load(Ordering::Acquire)
    }

    /// Take filter slots for a rule.
    ///
    /// IPv6 rules need four consecutive, aligned slots. The returned index
    /// is relative to the filter region; add [`TidRanges::ftid_base`] to get
    /// the hardware id.
    pub fn allocate_filter(&self, family: AddressFamily) -> Option<u32> {
        let mut ftids = self.ftids.lock();
        let index = match family {
            AddressFamily::Ipv4 => ftids.allocate(),
            AddressFamily::Ipv6 => ftids.allocate_aligned(IPV6_FILTER_SLOTS, IPV6_FILTER_SLOTS),
        }?;
        Some(index as u32)
    }

    pub fn release_filter(&self, index: u32, family: AddressFamily) {
        let count = match family {
            AddressFamily::Ipv4 => 1,
            AddressFamily::Ipv6 => IPV6_FILTER_SLOTS,
        };
        self.ftids.lock().release(index as usize, count);
    }

    pub fn filters_in_use(&self) -> usize {
        self.ftids.lock().in_use()
    }

    /// Free all storage and zero the counters.
    ///
    /// No fast path code may be using any TID anymore.
    pub fn teardown(&mut self) {
        self.slots = Vec::new();
        *self.atids.get_mut() = ActiveOpenTable { entries: Vec::new(), free: Vec::new(), in_use: 0 };
        if let Ok(empty) = BitmapAllocator::new(0) {
            *self.ftids.get_mut() = empty;
        }
        *self.tids_in_use.get_mut() = 0;
        *self.hash_tids_in_use.get_mut() = 0;
        *self.conns_in_use.get_mut() = 0;
        self.ranges = TidRanges::default();
    }
}

const CPL_TID_RELEASE: u32 = 0x1a;
const FW_TP_WR: u32 = 0x05;

/// The message telling the hardware that a TID is free.
#[derive(AsBytes, FromBytes)]
#[repr(C, packed)]
pub(crate) struct TidReleaseMessage {
    wr_hi: U32<BigEndian>,
    wr_mid: U32<BigEndian>,
    wr_lo: U64<BigEndian>,
    opcode_tid: U32<BigEndian>,
    _reserved: U32<BigEndian>,
}

impl TidReleaseMessage {
    const WR_HDR_LEN: u32 = 16;

    pub(crate) fn new(tid: u32) -> Self {
        let mut msg = Self::new_zeroed();
        let len = size_of::<Self>() as u32;
        msg.wr_hi = ((FW_TP_WR << 24) | (len - Self::WR_HDR_LEN)).into();
        msg.wr_mid = ((tid << 8) | len.div_ceil(16)).into();
        msg.opcode_tid = ((CPL_TID_RELEASE << 24) | (tid & 0xff_ffff)).into();
        msg
    }

    pub(crate) fn tid(&self) -> u32 {
        self.opcode_tid.get() & 0xff_ffff
    }

    pub(crate) fn opcode(&self) -> u32 {
        self.opcode_tid.get() >> 24
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cmd::decode, testing::RecordingChannel};

    fn table(ntids: u32, natids: u32, nftids: u32, hash_base: u32) -> TidTable<u32> {
        TidTable::init(TidRanges { ntids, natids, nftids, ftid_base: 0, hash_base }).unwrap()
    }

    #[test]
    fn active_open_exhaustion() {
        let t = table(100, 10, 20, 80);
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(t.allocate_active_open(i).unwrap());
        }
        assert_eq!(t.allocate_active_open(10), None);
        assert_eq!(t.active_opens_in_use(), 10);

        // all ids are distinct and in range
        ids.sort();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());

        assert_eq!(t.release_active_open(6), Some(6));
        assert_eq!(t.allocate_active_open(11), Some(6));
        assert_eq!(t.allocate_active_open(12), None);
    }

    #[test]
    fn active_open_reuse_is_lifo() {
        let t = table(100, 10, 0, 0);
        assert_eq!(t.allocate_active_open(0), Some(0));
        let a = t.allocate_active_open(1).unwrap();
        let b = t.allocate_active_open(2).unwrap();
        t.release_active_open(a);
        t.release_active_open(b);
        assert_eq!(t.allocate_active_open(3), Some(b));
        assert_eq!(t.allocate_active_open(4), Some(a));
        assert_eq!(t.active_opens_in_use(), 3);
    }

    #[test]
    fn no_active_open_ids() {
        let t = table(1, 0, 0, 0);
        assert_eq!(t.allocate_active_open(0), None);
    }

    #[test]
    fn invalid_ranges() {
        let too_many_atids = TidRanges { ntids: 10, natids: 6, ..Default::default() };
        assert_eq!(TidTable::<u32>::init(too_many_atids).err(), Some(TidError::InvalidRanges));
        let hash_beyond = TidRanges { ntids: 10, hash_base: 11, ..Default::default() };
        assert_eq!(TidTable::<u32>::init(hash_beyond).err(), Some(TidError::InvalidRanges));
    }

    #[test]
    fn insert_and_remove_count_per_region() {
        let t = table(100, 10, 20, 80);
        let chan = RecordingChannel::new();
        t.insert(5, 50, AddressFamily::Ipv4);
        t.insert(6, 60, AddressFamily::Ipv6);
        t.insert(85, 850, AddressFamily::Ipv4);
        assert_eq!(t.tids_in_use(), 1);
        assert_eq!(t.hash_tids_in_use(), 1);
        assert_eq!(t.conns_in_use(), 3);
        assert!(t.is_occupied(85));

        assert_eq!(t.remove(85, &chan, AddressFamily::Ipv4), Some(850));
        assert_eq!(t.hash_tids_in_use(), 0);
        assert_eq!(t.remove(6, &chan, AddressFamily::Ipv6), Some(60));
        assert_eq!(t.tids_in_use(), 1);
        assert_eq!(t.conns_in_use(), 1);
        assert!(!t.is_occupied(6));
    }

    #[test]
    fn without_hash_region_everything_is_general() {
        let t = table(100, 10, 20, 0);
        t.insert(95, 1, AddressFamily::Ipv4);
        assert_eq!(t.tids_in_use(), 1);
        assert_eq!(t.hash_tids_in_use(), 0);
    }

    #[test]
    fn remove_always_notifies() {
        let t = table(100, 10, 20, 80);
        let chan = RecordingChannel::new();
        assert_eq!(t.remove(7, &chan, AddressFamily::Ipv4), None);
        // nothing was stored, so nothing was decremented
        assert_eq!(t.conns_in_use(), 0);
        assert_eq!(t.tids_in_use(), 0);

        let sent = chan.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), size_of::<TidReleaseMessage>());
        let msg: TidReleaseMessage = decode(&sent[0]).unwrap();
        assert_eq!(msg.tid(), 7);
        assert_eq!(msg.opcode(), CPL_TID_RELEASE);
    }

    #[test]
    fn remove_without_buffer_still_frees() {
        let t = table(100, 10, 20, 80);
        let chan = RecordingChannel::new();
        chan.set_buffers_available(false);
        t.insert(3, 30, AddressFamily::Ipv4);
        assert_eq!(t.remove(3, &chan, AddressFamily::Ipv4), Some(30));
        assert!(chan.sent().is_empty());
        assert_eq!(t.tids_in_use(), 0);
        assert!(!t.is_occupied(3));
    }

    #[test]
    fn out_of_range_tids_are_ignored() {
        let t = table(10, 2, 0, 0);
        let chan = RecordingChannel::new();
        t.insert(10, 1, AddressFamily::Ipv4);
        assert_eq!(t.conns_in_use(), 0);
        assert_eq!(t.remove(10, &chan, AddressFamily::Ipv4), None);
        assert!(chan.sent().is_empty());
    }

    #[test]
    fn filters() {
        let t = table(100, 10, 8, 0);
        assert_eq!(t.allocate_filter(AddressFamily::Ipv4), Some(0));
        assert_eq!(t.allocate_filter(AddressFamily::Ipv6), Some(4));
        assert_eq!(t.allocate_filter(AddressFamily::Ipv6), None);
        assert_eq!(t.allocate_filter(AddressFamily::Ipv4), Some(1));
        t.release_filter(4, AddressFamily::Ipv6);
        assert_eq!(t.filters_in_use(), 2);
        assert_eq!(t.allocate_filter(AddressFamily::Ipv6), Some(4));
    }

    #[test]
    fn teardown_zeroes_everything() {
        let mut t = table(100, 10, 20, 80);
        t.insert(1, 1, AddressFamily::Ipv4);
        t.allocate_active_open(2);
        t.allocate_filter(AddressFamily::Ipv4);
        t.teardown();
        assert_eq!(t.conns_in_use(), 0);
        assert_eq!(t.tids_in_use(), 0);
        assert_eq!(t.active_opens_in_use(), 0);
        assert_eq!(t.filters_in_use(), 0);
        assert_eq!(t.ranges(), TidRanges::default());
        assert_eq!(t.allocate_active_open(3), None);
        assert!(!t.is_occupied(1));
    }

    #[test]
    fn release_message_layout() {
        let msg = TidReleaseMessage::new(0x1234);
        let bytes = msg.as_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[0..4], &[0x05, 0, 0, 8]);
        assert_eq!(&bytes[4..8], &[0, 0x12, 0x34, 2]);
        assert_eq!(&bytes[16..20], &[0x1a, 0, 0x12, 0x34]);
    }
}
