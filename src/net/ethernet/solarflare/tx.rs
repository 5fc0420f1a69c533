//! Transmit queues: per checksum-offload class, submission with
//! backpressure and completion reaping.

use super::adapter::Adapter;
use super::driver::DriverConfig;
use super::efx::{self, EfxBuffer, TxqFlags, TxqHandle, EFX_TXQ_DESC_SIZE};
use super::{AtomicFlushState, FlushState, QueueState, QueueStats, RingCounters};
use super::{FLUSH_POLL_COUNT, FLUSH_POLL_INTERVAL_US};
use crate::dma::DmaMem;
use crate::provider::{DmaDirection, PktHandle, Provider};
use crate::util::drop_reverse;
use crate::{Result, SfvmkError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use core::mem;
use spin::Mutex;

/// Outstanding completions that trigger reaping before the poll ends.
pub const TX_BATCH: u32 = 64;
/// Free slots kept so the largest packet always fits once unblocked.
pub const TX_MAX_SEGS: u32 = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxqType {
    NonCksum = 0,
    IpCksum = 1,
    IpTcpUdpCksum = 2,
}

pub const TXQ_NTYPES: usize = 3;

impl TxqType {
    fn flags(&self) -> TxqFlags {
        match self {
            TxqType::NonCksum => TxqFlags::empty(),
            TxqType::IpCksum => TxqFlags::CKSUM_IPV4,
            TxqType::IpTcpUdpCksum => TxqFlags::CKSUM_IPV4 | TxqFlags::CKSUM_TCPUDP,
        }
    }
}

/// TXQ index for a completion `label` reported on EVQ `evq_index`.
///
/// EVQ 0 services one queue of each type, labelled by type; every other EVQ
/// services only its own TCP/UDP queue.
pub fn txq_index_for_label(evq_index: usize, label: u32) -> usize {
    if evq_index == 0 {
        label as usize
    } else {
        evq_index - 1 + TXQ_NTYPES
    }
}

/// Completion level at which a blocked queue is reopened.
fn unblock_level(entries: u32) -> u32 {
    efx::ring_limit(entries) / 4
}

#[derive(Default)]
struct TxSwDesc {
    pkt: Option<PktHandle>,
    io_addr: u64,
    map_len: usize,
}

pub(crate) struct TxqRing {
    pub(crate) state: QueueState,
    hw: Option<TxqHandle>,
    pub(crate) added: u32,
    pub(crate) pushed: u32,
    pub(crate) reaped: u32,
    pub(crate) pending: u32,
    pub(crate) completed: u32,
    blocked: bool,
    descs: Vec<TxSwDesc>,
    stats: QueueStats,
}

pub struct Txq {
    index: usize,
    ty: TxqType,
    evq_index: usize,
    entries: u32,
    ptr_mask: u32,
    mem: DmaMem,
    flush_state: AtomicFlushState,
    pub(crate) inner: Mutex<TxqRing>,
}

impl Txq {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn queue_type(&self) -> TxqType {
        self.ty
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

    pub fn blocked(&self) -> bool {
        self.inner.lock().blocked
    }

    pub fn counters(&self) -> RingCounters {
        let ring = self.inner.lock();
        RingCounters {
            added: ring.added,
            pushed: ring.pushed,
            pending: ring.pending,
            completed: ring.completed,
            reaped: ring.reaped,
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats
    }
}

fn txq_init(
    provider: &Arc<dyn Provider>,
    index: usize,
    ty: TxqType,
    evq_index: usize,
    entries: u32,
) -> Result<Txq> {
    let mem = DmaMem::alloc(provider, entries as usize * EFX_TXQ_DESC_SIZE)?;
    let mut descs = Vec::new();
    descs.resize_with(entries as usize, TxSwDesc::default);
    drv_debug!("sfvmk tx: TXQ {} {:?} on EVQ {}", index, ty, evq_index);
    Ok(Txq {
        index,
        ty,
        evq_index,
        entries,
        ptr_mask: entries - 1,
        mem,
        flush_state: AtomicFlushState::new(FlushState::Done),
        inner: Mutex::new(TxqRing {
            state: QueueState::Initialized,
            hw: None,
            added: 0,
            pushed: 0,
            reaped: 0,
            pending: 0,
            completed: 0,
            blocked: false,
            descs,
            stats: QueueStats::default(),
        }),
    })
}

/// Two shared queues on EVQ 0 plus one TCP/UDP queue per EVQ.
pub(crate) fn init(
    provider: &Arc<dyn Provider>,
    num_evqs: usize,
    config: &DriverConfig,
    txqs_allotted: u32,
) -> Result<Vec<Txq>> {
    let entries = config.tx_ring_entries;
    if !entries.is_power_of_two() {
        drv_error!("sfvmk tx: descriptor count {} is not a power of two", entries);
        return Err(SfvmkError::NotPowerOfTwo(entries));
    }
    let count = min(num_evqs + TXQ_NTYPES - 1, txqs_allotted as usize);
    if count < TXQ_NTYPES {
        drv_error!("sfvmk tx: only {} TXQs allotted, need at least {}", count, TXQ_NTYPES);
        return Err(SfvmkError::NoSpace);
    }

    let mut layout = Vec::with_capacity(count);
    layout.push((TxqType::NonCksum, 0));
    layout.push((TxqType::IpCksum, 0));
    for evq in 0..count - (TXQ_NTYPES - 1) {
        layout.push((TxqType::IpTcpUdpCksum, evq));
    }

    let mut txqs = Vec::with_capacity(count);
    for (index, (ty, evq)) in layout.into_iter().enumerate() {
        match txq_init(provider, index, ty, evq, entries) {
            Ok(txq) => txqs.push(txq),
            Err(err) => {
                drv_error!("sfvmk tx: TXQ {} init failed: {}", index, err);
                drop_reverse(txqs);
                return Err(err);
            }
        }
    }
    Ok(txqs)
}

impl Adapter {
    /// Queue `pkt` on TXQ `index`.
    ///
    /// On error the packet has been released. `QueueFull` means the queue is
    /// now blocked and the uplink was told to stop feeding it.
    pub fn transmit(&self, index: usize, pkt: PktHandle) -> Result {
        let txq = match self.txqs.get(index) {
            Some(txq) => txq,
            None => {
                self.provider.pkt_release(pkt);
                return Err(SfvmkError::BadParam);
            }
        };
        let mut ring = txq.inner.lock();
        let result = self.txq_post(txq, &mut ring, pkt);
        if result.is_err() {
            ring.stats.drops += 1;
            self.provider.pkt_release(pkt);
        }
        result
    }

    fn txq_post(&self, txq: &Txq, ring: &mut TxqRing, pkt: PktHandle) -> Result {
        let hw = match (ring.state, ring.hw) {
            (QueueState::Started, Some(hw)) => hw,
            _ => return Err(SfvmkError::InvalidState),
        };
        if ring.blocked {
            return Err(SfvmkError::QueueFull);
        }
        let nfrags = self.provider.pkt_frag_count(pkt);
        if nfrags == 0 {
            return Err(SfvmkError::BadParam);
        }

        let limit = efx::ring_limit(txq.entries);
        ring.reaped = ring.completed;
        let free = limit - ring.added.wrapping_sub(ring.reaped);
        if nfrags as u32 > free {
            self.txq_block(txq, ring);
            return Err(SfvmkError::QueueFull);
        }

        let mut bufs: Vec<EfxBuffer> = Vec::with_capacity(nfrags);
        let mut len = 0;
        for i in 0..nfrags {
            let mapped = self
                .provider
                .pkt_frag(pkt, i)
                .ok_or(SfvmkError::BadParam)
                .and_then(|frag| {
                    self.provider
                        .dma_map(frag, DmaDirection::ToDevice)
                        .map(|addr| (addr, frag.len))
                });
            match mapped {
                Ok((addr, size)) => {
                    len += size;
                    bufs.push(EfxBuffer {
                        addr,
                        size,
                        eop: i == nfrags - 1,
                    })
                }
                Err(err) => {
                    self.tx_unmap(&bufs);
                    return Err(err);
                }
            }
        }

        let start = ring.added;
        let mut added = ring.added;
        if let Err(err) = self.nic.tx_qpost(hw, &bufs, ring.completed, &mut added) {
            drv_error!("sfvmk {}: TXQ {} post failed: {}", self.name(), txq.index, err);
            self.tx_unmap(&bufs);
            return Err(err);
        }
        for (i, buf) in bufs.iter().enumerate() {
            let slot = (start.wrapping_add(i as u32) & txq.ptr_mask) as usize;
            ring.descs[slot] = TxSwDesc {
                pkt: if buf.eop { Some(pkt) } else { None },
                io_addr: buf.addr,
                map_len: buf.size,
            };
        }
        ring.added = added;
        self.nic.tx_qpush(hw, ring.added, ring.pushed);
        ring.pushed = ring.added;

        ring.stats.packets += 1;
        ring.stats.bytes += len as u64;

        if limit - ring.added.wrapping_sub(ring.reaped) < TX_MAX_SEGS {
            self.txq_block(txq, ring);
        }
        Ok(())
    }

    fn tx_unmap(&self, bufs: &[EfxBuffer]) {
        for buf in bufs {
            self.provider.dma_unmap(buf.addr, buf.size, DmaDirection::ToDevice);
        }
    }

    fn txq_block(&self, txq: &Txq, ring: &mut TxqRing) {
        if !ring.blocked {
            ring.blocked = true;
            drv_debug!("sfvmk {}: TXQ {} blocked", self.name(), txq.index);
            self.provider.queue_stop(txq.index);
        }
    }

    /// Release everything between `completed` and `pending`.
    pub(crate) fn txq_complete(&self, txq: &Txq, ring: &mut TxqRing) {
        let mut completed = ring.completed;
        while completed != ring.pending {
            let slot = (completed & txq.ptr_mask) as usize;
            completed = completed.wrapping_add(1);
            let desc = mem::take(&mut ring.descs[slot]);
            if desc.map_len != 0 {
                self.provider.dma_unmap(desc.io_addr, desc.map_len, DmaDirection::ToDevice);
            }
            if let Some(pkt) = desc.pkt {
                self.provider.tx_complete(pkt);
            }
        }
        ring.completed = completed;

        if ring.blocked && ring.added.wrapping_sub(ring.completed) <= unblock_level(txq.entries) {
            self.txq_unblock(txq, ring);
        }
    }

    fn txq_unblock(&self, txq: &Txq, ring: &mut TxqRing) {
        if ring.state != QueueState::Started {
            return;
        }
        ring.reaped = ring.completed;
        if ring.added.wrapping_sub(ring.reaped) <= unblock_level(txq.entries) {
            ring.blocked = false;
            drv_debug!("sfvmk {}: TXQ {} unblocked", self.name(), txq.index);
            self.provider.queue_start(txq.index);
        }
    }

    pub(crate) fn txq_flush_done(&self, index: usize) {
        match self.txqs.get(index) {
            Some(txq) => {
                if !txq.flush_state.transition(FlushState::Pending, FlushState::Done) {
                    drv_debug!("sfvmk {}: TXQ {} stray flush done", self.name(), index);
                }
            }
            None => drv_error!("sfvmk {}: flush done for unknown TXQ {}", self.name(), index),
        }
    }

    fn txq_start(&self, index: usize) -> Result {
        let txq = &self.txqs[index];
        let evq_hw = self.evqs[txq.evq_index]
            .handle()
            .ok_or(SfvmkError::InvalidState)?;

        let mut ring = txq.inner.lock();
        if ring.state != QueueState::Initialized {
            return Err(SfvmkError::InvalidState);
        }

        let mut flags = txq.ty.flags();
        if self.config.tso && self.nic_cfg.fatsov2 && txq.ty == TxqType::IpTcpUdpCksum {
            flags |= TxqFlags::FATSOV2;
        }
        let label = txq.ty as u32;
        let created = match self
            .nic
            .tx_qcreate(index as u32, label, &txq.mem, txq.entries, flags, evq_hw)
        {
            Err(SfvmkError::NoSpace) if flags.contains(TxqFlags::FATSOV2) => {
                drv_info!("sfvmk {}: TXQ {} no FATSOv2 contexts, retrying without", self.name(), index);
                flags.remove(TxqFlags::FATSOV2);
                self.nic
                    .tx_qcreate(index as u32, label, &txq.mem, txq.entries, flags, evq_hw)
            }
            other => other,
        };
        let (hw, desc_index) = created?;

        ring.added = desc_index;
        ring.pushed = desc_index;
        ring.pending = desc_index;
        ring.completed = desc_index;
        ring.reaped = desc_index;
        self.nic.tx_qenable(hw);
        ring.hw = Some(hw);
        ring.state = QueueState::Started;
        txq.flush_state.store(FlushState::Required);
        Ok(())
    }

    fn txq_stop(&self, index: usize) {
        let txq = &self.txqs[index];
        let hw = {
            let mut ring = txq.inner.lock();
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

        if txq.flush_state.load() != FlushState::Done {
            txq.flush_state.store(FlushState::Pending);
            match self.nic.tx_qflush(hw) {
                Err(err) => {
                    drv_error!("sfvmk {}: TXQ {} flush request failed: {}", self.name(), index, err);
                    txq.flush_state.store(FlushState::Failed);
                }
                Ok(()) => {
                    let mut count = 0;
                    while count < FLUSH_POLL_COUNT {
                        self.provider.delay_us(FLUSH_POLL_INTERVAL_US);
                        count += 1;
                        if txq.flush_state.load() != FlushState::Pending {
                            break;
                        }
                    }
                }
            }
            if txq.flush_state.load() != FlushState::Done {
                drv_error!(
                    "sfvmk {}: TXQ {} flush did not complete ({:?}), forcing done",
                    self.name(),
                    index,
                    txq.flush_state.load()
                );
                txq.flush_state.store(FlushState::Done);
            }
        }

        let mut ring = txq.inner.lock();
        ring.blocked = false;
        ring.pending = ring.added;
        self.txq_complete(txq, &mut ring);
        ring.reaped = ring.completed;
        ring.added = 0;
        ring.pushed = 0;
        ring.pending = 0;
        ring.completed = 0;
        ring.reaped = 0;
        ring.hw = None;
        self.nic.tx_qdestroy(hw);
    }

    pub(crate) fn tx_start(&self) -> Result {
        self.nic.tx_init()?;
        for index in 0..self.txqs.len() {
            if let Err(err) = self.txq_start(index) {
                drv_error!("sfvmk {}: TXQ {} start failed: {}", self.name(), index, err);
                for started in (0..index).rev() {
                    self.txq_stop(started);
                }
                self.nic.tx_fini();
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn tx_stop(&self) {
        for index in (0..self.txqs.len()).rev() {
            self.txq_stop(index);
        }
        self.nic.tx_fini();
    }
}
