//! Receive queues: batched buffer refill, completion/delivery and the
//! flush-driven stop sequence.

use super::adapter::Adapter;
use super::driver::DriverConfig;
use super::efx::{self, RxFlags, RxHashFlags, RxqHandle, EFX_RSS_KEY_SIZE, EFX_RSS_TBL_SIZE, EFX_RXQ_DESC_SIZE};
use super::{AtomicFlushState, FlushState, QueueState, QueueStats, RingCounters};
use super::{FLUSH_POLL_COUNT, FLUSH_POLL_INTERVAL_US};
use crate::dma::DmaMem;
use crate::provider::{DmaDirection, PktHandle, Provider, SgElem};
use crate::util::{drop_reverse, p2roundup};
use crate::{Result, SfvmkError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use core::mem;
use core::sync::atomic::Ordering;
use spin::Mutex;

/// Outstanding completions that trigger processing before the poll ends.
pub const RX_BATCH: u32 = 128;
/// Buffers handed to the hardware per post call.
pub const RX_REFILL_BATCH: usize = 64;
pub const RXQ_FLUSH_RETRIES: u32 = 3;

const ETHER_HDR_LEN: usize = 14;

const RSS_KEY: [u8; EFX_RSS_KEY_SIZE] = [
    0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3, 0x8f,
    0xb0, 0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30,
    0xf2, 0x0c, 0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac, 0x01, 0xfa,
];

#[derive(Default)]
pub(crate) struct RxSwDesc {
    pkt: Option<PktHandle>,
    io_addr: u64,
    map_len: usize,
    pub(crate) flags: RxFlags,
    pub(crate) size: u32,
}

pub(crate) struct RxqRing {
    pub(crate) state: QueueState,
    hw: Option<RxqHandle>,
    pub(crate) added: u32,
    pub(crate) pushed: u32,
    pub(crate) pending: u32,
    pub(crate) completed: u32,
    pub(crate) descs: Vec<RxSwDesc>,
    stats: QueueStats,
}

pub struct Rxq {
    index: usize,
    evq_index: usize,
    entries: u32,
    ptr_mask: u32,
    mem: DmaMem,
    flush_state: AtomicFlushState,
    pub(crate) inner: Mutex<RxqRing>,
}

impl Rxq {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn evq_index(&self) -> usize {
        self.evq_index
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn ptr_mask(&self) -> u32 {
        self.ptr_mask
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    pub fn flush_state(&self) -> FlushState {
        self.flush_state.load()
    }

    pub fn counters(&self) -> RingCounters {
        let ring = self.inner.lock();
        RingCounters {
            added: ring.added,
            pushed: ring.pushed,
            pending: ring.pending,
            completed: ring.completed,
            reaped: ring.completed,
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats
    }
}

/// One RXQ per EVQ, each paired with the EVQ of the same index.
pub(crate) fn init(provider: &Arc<dyn Provider>, count: usize, config: &DriverConfig) -> Result<Vec<Rxq>> {
    let entries = config.rx_ring_entries;
    if !entries.is_power_of_two() {
        return Err(SfvmkError::NotPowerOfTwo(entries));
    }
    let mut rxqs = Vec::with_capacity(count);
    for index in 0..count {
        let mem = match DmaMem::alloc(provider, entries as usize * EFX_RXQ_DESC_SIZE) {
            Ok(mem) => mem,
            Err(err) => {
                drv_error!("sfvmk rx: RXQ {} ring allocation failed: {}", index, err);
                drop_reverse(rxqs);
                return Err(err);
            }
        };
        let mut descs = Vec::new();
        descs.resize_with(entries as usize, RxSwDesc::default);
        rxqs.push(Rxq {
            index,
            evq_index: index,
            entries,
            ptr_mask: entries - 1,
            mem,
            flush_state: AtomicFlushState::new(FlushState::Done),
            inner: Mutex::new(RxqRing {
                state: QueueState::Initialized,
                hw: None,
                added: 0,
                pushed: 0,
                pending: 0,
                completed: 0,
                descs,
                stats: QueueStats::default(),
            }),
        });
    }
    Ok(rxqs)
}

impl Adapter {
    /// Post up to `num_bufs` fresh buffers; returns how many were posted.
    pub(crate) fn rxq_fill(&self, rxq: &Rxq, ring: &mut RxqRing, num_bufs: u32, retrying: bool) -> u32 {
        let hw = match (ring.state, ring.hw) {
            (QueueState::Started, Some(hw)) => hw,
            _ => return 0,
        };
        let level = ring.added.wrapping_sub(ring.completed);
        let max_bufs = min(efx::ring_limit(rxq.entries).saturating_sub(level), num_bufs);
        if max_bufs == 0 {
            return 0;
        }

        let buf_size = self.rx_buffer_size.load(Ordering::Acquire)
            - self.rx_buffer_align.load(Ordering::Acquire);
        let mut addrs = [0u64; RX_REFILL_BATCH];
        let mut batch = 0;
        let mut posted = 0;

        for _ in 0..max_bufs {
            let pkt = match self.provider.pkt_alloc(buf_size) {
                Ok(pkt) => pkt,
                Err(_) => break,
            };
            let frag = match self.provider.pkt_frag(pkt, 0) {
                Some(frag) => frag,
                None => {
                    self.provider.pkt_release(pkt);
                    break;
                }
            };
            let len = min(frag.len, buf_size);
            let io_addr = match self
                .provider
                .dma_map(SgElem { va: frag.va, len }, DmaDirection::FromDevice)
            {
                Ok(addr) => addr,
                Err(_) => {
                    self.provider.pkt_release(pkt);
                    break;
                }
            };

            let slot = (ring.added.wrapping_add(batch as u32) & rxq.ptr_mask) as usize;
            ring.descs[slot] = RxSwDesc {
                pkt: Some(pkt),
                io_addr,
                map_len: len,
                flags: RxFlags::DISCARD,
                size: 0,
            };
            addrs[batch] = io_addr;
            batch += 1;

            if batch == RX_REFILL_BATCH {
                self.nic.rx_qpost(hw, &addrs[..batch], buf_size, ring.completed, ring.added);
                ring.added = ring.added.wrapping_add(batch as u32);
                posted += batch as u32;
                batch = 0;
            }
        }
        if batch > 0 {
            self.nic.rx_qpost(hw, &addrs[..batch], buf_size, ring.completed, ring.added);
            ring.added = ring.added.wrapping_add(batch as u32);
            posted += batch as u32;
        }

        if posted < max_bufs && !retrying {
            drv_debug!(
                "sfvmk {}: RXQ {} short fill, {} of {} buffers",
                self.name(),
                rxq.index,
                posted,
                max_bufs
            );
        }

        let mut pushed = ring.pushed;
        self.nic.rx_qpush(hw, ring.added, &mut pushed);
        ring.pushed = pushed;
        posted
    }

    // Top the ring up once it falls below 90% of its limit.
    pub(crate) fn rxq_refill(&self, rxq: &Rxq, ring: &mut RxqRing) {
        if ring.state != QueueState::Started {
            return;
        }
        let limit = efx::ring_limit(rxq.entries);
        let level = ring.added.wrapping_sub(ring.completed);
        if level < limit * 9 / 10 {
            self.rxq_fill(rxq, ring, limit - level, true);
        }
    }

    /// Refill RXQ `index` with up to `num_bufs` buffers.
    pub fn rxq_post_buffers(&self, index: usize, num_bufs: u32) -> Result<u32> {
        let rxq = self.rxqs.get(index).ok_or(SfvmkError::BadParam)?;
        let mut ring = rxq.inner.lock();
        if ring.state != QueueState::Started {
            return Err(SfvmkError::InvalidState);
        }
        Ok(self.rxq_fill(rxq, &mut ring, num_bufs, false))
    }

    /// Walk `completed..pending`, delivering good packets and releasing the rest.
    pub(crate) fn rxq_complete(&self, rxq: &Rxq, ring: &mut RxqRing, eop: bool) {
        let started = ring.state == QueueState::Started;
        let mut prev: Option<(PktHandle, u32, RxFlags)> = None;
        let mut completed = ring.completed;

        while completed != ring.pending {
            let slot = (completed & rxq.ptr_mask) as usize;
            completed = completed.wrapping_add(1);

            let desc = mem::take(&mut ring.descs[slot]);
            let pkt = match desc.pkt {
                Some(pkt) => pkt,
                None => continue,
            };
            self.provider.dma_unmap(desc.io_addr, desc.map_len, DmaDirection::FromDevice);

            if !started || desc.flags.intersects(RxFlags::ADDR_MISMATCH | RxFlags::DISCARD) {
                self.provider.pkt_release(pkt);
                if started {
                    ring.stats.drops += 1;
                }
                continue;
            }

            let mut flags = desc.flags;
            let ip = flags & (RxFlags::PKT_IPV4 | RxFlags::PKT_IPV6);
            if ip == RxFlags::PKT_IPV4 {
                if !self.config.rx_csum_ipv4 {
                    flags.remove(RxFlags::CKSUM_IPV4 | RxFlags::CKSUM_TCPUDP);
                }
            } else if ip == RxFlags::PKT_IPV6 {
                flags.remove(RxFlags::CKSUM_IPV4);
                if !self.config.rx_csum_ipv6 {
                    flags.remove(RxFlags::CKSUM_TCPUDP);
                }
            } else if !ip.is_empty() {
                drv_error!(
                    "sfvmk {}: RXQ {} descriptor flagged both IPv4 and IPv6 ({:?})",
                    self.name(),
                    rxq.index,
                    flags
                );
                self.provider.pkt_release(pkt);
                ring.stats.drops += 1;
                continue;
            }

            // Deliver one behind so the burst's last packet goes out after the loop
            if let Some(prev) = prev.replace((pkt, desc.size, flags)) {
                self.rx_deliver(rxq, ring, prev);
            }
        }
        ring.completed = completed;

        if let Some(prev) = prev.take() {
            self.rx_deliver(rxq, ring, prev);
        }

        if eop {
            self.rxq_refill(rxq, ring);
        }
    }

    fn rx_deliver(&self, rxq: &Rxq, ring: &mut RxqRing, (pkt, size, flags): (PktHandle, u32, RxFlags)) {
        let csum_verified = if flags.contains(RxFlags::PKT_IPV4) {
            flags.contains(RxFlags::CKSUM_IPV4 | RxFlags::CKSUM_TCPUDP)
        } else {
            flags.contains(RxFlags::CKSUM_TCPUDP)
        };
        ring.stats.packets += 1;
        ring.stats.bytes += u64::from(size);
        self.provider.rx_deliver(rxq.index, pkt, size as usize, csum_verified);
    }

    pub(crate) fn rxq_flush_done(&self, index: usize) {
        match self.rxqs.get(index) {
            Some(rxq) => {
                if !rxq.flush_state.transition(FlushState::Pending, FlushState::Done) {
                    drv_debug!("sfvmk {}: RXQ {} stray flush done", self.name(), index);
                }
            }
            None => drv_error!("sfvmk {}: flush done for unknown RXQ {}", self.name(), index),
        }
    }

    pub(crate) fn rxq_flush_failed(&self, index: usize) {
        match self.rxqs.get(index) {
            Some(rxq) => {
                if !rxq.flush_state.transition(FlushState::Pending, FlushState::Failed) {
                    drv_debug!("sfvmk {}: RXQ {} stray flush failure", self.name(), index);
                }
            }
            None => drv_error!("sfvmk {}: flush failed for unknown RXQ {}", self.name(), index),
        }
    }

    fn rxq_start(&self, index: usize) -> Result {
        let rxq = &self.rxqs[index];
        let evq_hw = self.evqs[rxq.evq_index]
            .handle()
            .ok_or(SfvmkError::InvalidState)?;

        let mut ring = rxq.inner.lock();
        if ring.state != QueueState::Initialized {
            return Err(SfvmkError::InvalidState);
        }
        let hw = self.nic.rx_qcreate(index as u32, &rxq.mem, rxq.entries, evq_hw)?;
        self.nic.rx_qenable(hw);
        ring.hw = Some(hw);
        ring.state = QueueState::Started;
        rxq.flush_state.store(FlushState::Required);

        let posted = self.rxq_fill(rxq, &mut ring, efx::ring_limit(rxq.entries), false);
        drv_debug!("sfvmk {}: RXQ {} started with {} buffers", self.name(), index, posted);
        Ok(())
    }

    fn rxq_stop(&self, index: usize) {
        let rxq = &self.rxqs[index];
        let hw = {
            let mut ring = rxq.inner.lock();
            if ring.state != QueueState::Started {
                return;
            }
            ring.state = QueueState::Initialized;
            ring.hw
        };
        let hw = match hw {
            Some(hw) => hw,
            None => return,
        };

        // The ring lock is not held here so event dispatch can report the flush.
        for attempt in 0..RXQ_FLUSH_RETRIES {
            rxq.flush_state.store(FlushState::Pending);
            if let Err(err) = self.nic.rx_qflush(hw) {
                drv_error!("sfvmk {}: RXQ {} flush request failed: {}", self.name(), index, err);
                rxq.flush_state.store(FlushState::Failed);
                break;
            }

            let mut count = 0;
            loop {
                self.provider.delay_us(FLUSH_POLL_INTERVAL_US);
                count += 1;
                if rxq.flush_state.load() != FlushState::Pending || count >= FLUSH_POLL_COUNT {
                    break;
                }
            }

            match rxq.flush_state.load() {
                FlushState::Done => break,
                FlushState::Pending => {
                    drv_error!(
                        "sfvmk {}: RXQ {} flush timeout (attempt {})",
                        self.name(),
                        index,
                        attempt + 1
                    );
                    rxq.flush_state.transition(FlushState::Pending, FlushState::Done);
                }
                FlushState::Failed => {
                    drv_warn!("sfvmk {}: RXQ {} flush failed (attempt {})", self.name(), index, attempt + 1);
                }
                FlushState::Required => {}
            }
        }

        if rxq.flush_state.load() == FlushState::Failed {
            drv_error!("sfvmk {}: RXQ {} flushing failed, forcing done", self.name(), index);
            rxq.flush_state.store(FlushState::Done);
        }

        let mut ring = rxq.inner.lock();
        ring.pending = ring.added;
        self.rxq_complete(rxq, &mut ring, true);
        ring.added = 0;
        ring.pushed = 0;
        ring.pending = 0;
        ring.completed = 0;
        ring.hw = None;
        self.nic.rx_qdestroy(hw);
    }

    pub(crate) fn rx_start(&self) -> Result {
        self.nic.rx_init()?;

        let prefix = self.nic_cfg.rx_prefix_size;
        let hdr_len = prefix + ETHER_HDR_LEN;
        let align = p2roundup(hdr_len, 4) - hdr_len;
        let align_end = self.nic_cfg.rx_buf_align_end.max(1).next_power_of_two();
        let size = p2roundup(efx::mac_pdu(self.mtu() as usize) + prefix + align, align_end);
        self.rx_buffer_size.store(size, Ordering::Release);
        self.rx_buffer_align.store(align, Ordering::Release);

        if let Err(err) = self.rx_scale_setup() {
            drv_error!("sfvmk {}: RSS setup failed: {}", self.name(), err);
            self.nic.rx_fini();
            return Err(err);
        }

        for index in 0..self.rxqs.len() {
            if let Err(err) = self.rxq_start(index) {
                drv_error!("sfvmk {}: RXQ {} start failed: {}", self.name(), index, err);
                for started in (0..index).rev() {
                    self.rxq_stop(started);
                }
                self.nic.rx_fini();
                return Err(err);
            }
        }

        let default_rxq = self.rxqs.first().and_then(|rxq| rxq.inner.lock().hw);
        if let Some(hw) = default_rxq {
            if let Err(err) = self.nic.mac_filter_default_rxq_set(hw, self.rxqs.len() > 1) {
                drv_error!("sfvmk {}: default RXQ filter failed: {}", self.name(), err);
                for index in (0..self.rxqs.len()).rev() {
                    self.rxq_stop(index);
                }
                self.nic.rx_fini();
                return Err(err);
            }
        }
        Ok(())
    }

    fn rx_scale_setup(&self) -> Result {
        let count = self.rxqs.len();
        if count < 2 {
            return Ok(());
        }
        self.nic.rx_scale_mode_set(
            RxHashFlags::IPV4 | RxHashFlags::TCP_IPV4 | RxHashFlags::IPV6 | RxHashFlags::TCP_IPV6,
        )?;
        self.nic.rx_scale_key_set(&RSS_KEY)?;
        let mut table = [0u32; EFX_RSS_TBL_SIZE];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = (i % count) as u32;
        }
        self.nic.rx_scale_tbl_set(&table)
    }

    pub(crate) fn rx_stop(&self) {
        self.nic.mac_filter_default_rxq_clear();
        for index in (0..self.rxqs.len()).rev() {
            self.rxq_stop(index);
        }
        self.rx_buffer_size.store(0, Ordering::Release);
        self.rx_buffer_align.store(0, Ordering::Release);
        self.nic.rx_fini();
    }
}
