//! Event queues: one per interrupt vector, draining hardware completions
//! and routing them to the receive and transmit queues they belong to.

use super::adapter::Adapter;
use super::driver::DriverConfig;
use super::efx::{EvCallbacks, EvqHandle, ExceptionCode, RxFlags, EFX_EV_SIZE};
use super::intr::{Intr, IntrState};
use super::rx::RX_BATCH;
use super::tx::{txq_index_for_label, TX_BATCH};
use super::{FLUSH_POLL_COUNT, FLUSH_POLL_INTERVAL_US};
use crate::dma::DmaMem;
use crate::net::ethernet::structs::LinkMode;
use crate::provider::{Provider, ResetReason};
use crate::util::drop_reverse;
use crate::{Result, SfvmkError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use core::sync::atomic::Ordering;
use spin::Mutex;

/// Room for events that are neither RX nor TX completions.
pub const EXTRA_EVENT_SPACE: u32 = 128;
/// Default number of RX or TX events handled per poll.
pub const EV_BATCH: u32 = 16384;

/// Software event asking an RXQ to refill; the low byte carries the RXQ index.
pub const SW_EV_RX_QREFILL: u16 = 1;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EvqState {
    Uninitialized,
    Initialized,
    Starting,
    Started,
}

pub struct Evq {
    index: usize,
    entries: u32,
    mem: DmaMem,
    inner: Mutex<EvqRing>,
}

pub(crate) struct EvqRing {
    state: EvqState,
    hw: Option<EvqHandle>,
    read_ptr: u32,
    exception: bool,
    rx_done: u32,
    tx_done: u32,
    // TXQs with completions waiting, in the order their events arrived
    txqs: Vec<usize>,
}

impl Evq {
    fn new(index: usize, entries: u32, mem: DmaMem) -> Evq {
        Evq {
            index,
            entries,
            mem,
            inner: Mutex::new(EvqRing {
                state: EvqState::Initialized,
                hw: None,
                read_ptr: 0,
                exception: false,
                rx_done: 0,
                tx_done: 0,
                txqs: Vec::new(),
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn state(&self) -> EvqState {
        self.inner.lock().state
    }

    pub fn read_ptr(&self) -> u32 {
        self.inner.lock().read_ptr
    }

    pub fn exception(&self) -> bool {
        self.inner.lock().exception
    }

    pub(crate) fn handle(&self) -> Option<EvqHandle> {
        self.inner.lock().hw
    }
}

/// Slots needed by EVQ `index`: EVQ 0 also carries the two shared TXQs.
pub fn evq_entries(index: usize, config: &DriverConfig) -> u32 {
    let raw = if index == 0 {
        config.rx_ring_entries + 3 * config.tx_ring_entries + EXTRA_EVENT_SPACE
    } else {
        config.rx_ring_entries + config.tx_ring_entries
    };
    raw.next_power_of_two()
}

/// Create one EVQ per allocated vector, up to the configured count.
pub(crate) fn init(
    provider: &Arc<dyn Provider>,
    intr: &Intr,
    config: &DriverConfig,
) -> Result<Vec<Evq>> {
    if intr.state() != IntrState::Initialized {
        drv_error!("sfvmk ev: interrupts not initialized");
        return Err(SfvmkError::InvalidState);
    }
    let count = min(intr.num_alloc(), config.evqs_desired as usize);
    let mut evqs = Vec::with_capacity(count);

    for index in 0..count {
        let entries = evq_entries(index, config);
        match DmaMem::alloc(provider, entries as usize * EFX_EV_SIZE) {
            Ok(mem) => evqs.push(Evq::new(index, entries, mem)),
            Err(err) => {
                drv_error!("sfvmk ev: EVQ {} ring allocation failed: {}", index, err);
                drop_reverse(evqs);
                return Err(err);
            }
        }
        drv_debug!("sfvmk ev: EVQ {} with {} entries", index, entries);
    }
    Ok(evqs)
}

struct EvqDispatch<'a> {
    adapter: &'a Adapter,
    evq_index: usize,
    ring: &'a mut EvqRing,
    budget: u32,
}

// Slots between the consumer position and the slot after `id`.
fn completion_delta(pending: u32, id: u32, ptr_mask: u32, entries: u32) -> (u32, u32, u32) {
    let stop = id.wrapping_add(1) & ptr_mask;
    let start = pending & ptr_mask;
    let delta = if stop >= start {
        stop - start
    } else {
        entries - start + stop
    };
    (start, stop, delta)
}

impl<'a> EvqDispatch<'a> {
    fn rx_budget_spent(&self) -> bool {
        self.ring.rx_done >= self.budget
    }

    fn tx_budget_spent(&self) -> bool {
        self.ring.tx_done >= self.budget
    }
}

impl<'a> EvCallbacks for EvqDispatch<'a> {
    fn initialized(&mut self) -> bool {
        if self.ring.state == EvqState::Starting {
            self.ring.state = EvqState::Started;
        } else {
            drv_warn!(
                "sfvmk {}: EVQ {} unexpected init event in {:?}",
                self.adapter.name(),
                self.evq_index,
                self.ring.state
            );
        }
        false
    }

    fn rx(&mut self, label: u32, id: u32, size: u32, flags: RxFlags) -> bool {
        if self.ring.exception {
            return self.rx_budget_spent();
        }
        let adapter = self.adapter;
        let rxq = match adapter.rxqs.get(label as usize) {
            Some(rxq) => rxq,
            None => {
                drv_error!("sfvmk {}: RX event for unknown RXQ {}", adapter.name(), label);
                return false;
            }
        };
        let mut ring = rxq.inner.lock();
        if ring.state != super::QueueState::Started {
            return self.rx_budget_spent();
        }

        let (start, stop, delta) = completion_delta(ring.pending, id, rxq.ptr_mask(), rxq.entries());
        if delta == 0 || delta > adapter.nic_cfg.rx_batch_max {
            self.ring.exception = true;
            drv_error!(
                "sfvmk {}: RXQ {} completion out of order (delta {})",
                adapter.name(),
                label,
                delta
            );
            adapter.schedule_reset(ResetReason::EvqException);
            return self.rx_budget_spent();
        }
        ring.pending = ring.pending.wrapping_add(delta);

        let mut slot = start;
        while slot != stop {
            let desc = &mut ring.descs[slot as usize];
            desc.flags = flags;
            desc.size = size;
            slot = (slot + 1) & rxq.ptr_mask();
        }

        self.ring.rx_done += 1;
        if ring.pending.wrapping_sub(ring.completed) >= RX_BATCH {
            adapter.rxq_complete(rxq, &mut ring, false);
        }
        self.rx_budget_spent()
    }

    fn tx(&mut self, label: u32, id: u32) -> bool {
        if self.ring.exception {
            return self.tx_budget_spent();
        }
        let adapter = self.adapter;
        let index = txq_index_for_label(self.evq_index, label);
        let txq = match adapter.txqs.get(index) {
            Some(txq) => txq,
            None => {
                drv_error!(
                    "sfvmk {}: EVQ {} TX event for unknown label {}",
                    adapter.name(),
                    self.evq_index,
                    label
                );
                return false;
            }
        };
        if txq.evq_index() != self.evq_index {
            drv_warn!(
                "sfvmk {}: TXQ {} completion arrived on EVQ {}",
                adapter.name(),
                index,
                self.evq_index
            );
        }
        let mut ring = txq.inner.lock();
        if ring.state != super::QueueState::Started {
            return self.tx_budget_spent();
        }

        let (_, _, delta) = completion_delta(ring.pending, id, txq.ptr_mask(), txq.entries());
        ring.pending = ring.pending.wrapping_add(delta);
        self.ring.tx_done += 1;

        if !self.ring.txqs.contains(&index) {
            self.ring.txqs.push(index);
        }
        if ring.pending.wrapping_sub(ring.completed) >= TX_BATCH {
            adapter.txq_complete(txq, &mut ring);
        }
        self.tx_budget_spent()
    }

    fn exception(&mut self, code: ExceptionCode, data: u32) -> bool {
        self.ring.exception = true;
        if code != ExceptionCode::UnknownSensorEvent {
            let adapter = self.adapter;
            drv_error!(
                "sfvmk {}: hardware exception {:?} (data {:#x}) on EVQ {}",
                adapter.name(),
                code,
                data,
                self.evq_index
            );
            adapter.nic.intr_disable();
            adapter.nic.intr_fatal();
            adapter.schedule_reset(ResetReason::EvqException);
        }
        false
    }

    fn rxq_flush_done(&mut self, rxq_index: u32) -> bool {
        self.adapter.rxq_flush_done(rxq_index as usize);
        false
    }

    fn rxq_flush_failed(&mut self, rxq_index: u32) -> bool {
        self.adapter.rxq_flush_failed(rxq_index as usize);
        false
    }

    fn txq_flush_done(&mut self, txq_index: u32) -> bool {
        self.adapter.txq_flush_done(txq_index as usize);
        false
    }

    fn software(&mut self, magic: u16) -> bool {
        let label = usize::from(magic & 0xff);
        match magic >> 8 {
            SW_EV_RX_QREFILL => {
                if let Some(rxq) = self.adapter.rxqs.get(label) {
                    let mut ring = rxq.inner.lock();
                    self.adapter.rxq_refill(rxq, &mut ring);
                }
            }
            other => drv_warn!(
                "sfvmk {}: unknown software event {:#x} on EVQ {}",
                self.adapter.name(),
                other,
                self.evq_index
            ),
        }
        false
    }

    fn link_change(&mut self, mode: LinkMode) -> bool {
        self.adapter.port_link_update(mode);
        false
    }
}

impl Adapter {
    pub(crate) fn ev_start(&self) -> Result {
        self.nic.ev_init()?;
        for index in 0..self.evqs.len() {
            if let Err(err) = self.evq_start(index) {
                drv_error!("sfvmk {}: EVQ {} start failed: {}", self.name(), index, err);
                for started in (0..index).rev() {
                    self.evq_stop(started);
                }
                self.nic.ev_fini();
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn ev_stop(&self) {
        for index in (0..self.evqs.len()).rev() {
            self.evq_stop(index);
        }
        self.nic.ev_fini();
    }

    fn evq_start(&self, index: usize) -> Result {
        let evq = &self.evqs[index];
        {
            let mut ring = evq.inner.lock();
            if ring.state != EvqState::Initialized {
                return Err(SfvmkError::InvalidState);
            }
            // Unwritten events read as all-ones
            evq.mem.fill(0xff);
            let moderation = self.moderation_us.load(Ordering::Acquire);
            let hw = self.nic.ev_qcreate(index as u32, &evq.mem, evq.entries, moderation)?;
            ring.read_ptr = 0;
            if let Err(err) = self.nic.ev_qprime(hw, 0) {
                self.nic.ev_qdestroy(hw);
                return Err(err);
            }
            ring.hw = Some(hw);
            ring.state = EvqState::Starting;
        }
        self.provider.netpoll_enable(index);

        // Wait for the hardware's initialised event
        let mut count = 0;
        loop {
            if let Err(err) = self.evq_poll(index, EV_BATCH) {
                drv_warn!("sfvmk {}: EVQ {} poll during start: {}", self.name(), index, err);
            }
            if evq.state() == EvqState::Started {
                drv_debug!("sfvmk {}: EVQ {} started", self.name(), index);
                return Ok(());
            }
            if count >= FLUSH_POLL_COUNT {
                break;
            }
            self.provider.delay_us(FLUSH_POLL_INTERVAL_US);
            count += 1;
        }

        drv_error!("sfvmk {}: EVQ {} init event timeout", self.name(), index);
        self.evq_stop(index);
        Err(SfvmkError::Timeout)
    }

    fn evq_stop(&self, index: usize) {
        let evq = &self.evqs[index];
        self.provider.netpoll_disable(index);
        let mut ring = evq.inner.lock();
        if ring.state != EvqState::Started && ring.state != EvqState::Starting {
            return;
        }
        ring.state = EvqState::Initialized;
        ring.read_ptr = 0;
        ring.exception = false;
        ring.txqs.clear();
        if let Some(hw) = ring.hw.take() {
            self.nic.ev_qdestroy(hw);
        }
    }

    /// Drain up to `budget` RX and TX events from EVQ `index`.
    ///
    /// Returns true when the budget ran out and more work may be pending.
    pub fn evq_poll(&self, index: usize, budget: u32) -> Result<bool> {
        let evq = self.evqs.get(index).ok_or(SfvmkError::BadParam)?;
        let mut ring = evq.inner.lock();
        if ring.state != EvqState::Starting && ring.state != EvqState::Started {
            return Err(SfvmkError::InvalidState);
        }
        let hw = ring.hw.ok_or(SfvmkError::InvalidState)?;

        let mut read_ptr = ring.read_ptr;
        ring.rx_done = 0;
        ring.tx_done = 0;
        let exhausted = {
            let mut dispatch = EvqDispatch {
                adapter: self,
                evq_index: index,
                ring: &mut *ring,
                budget: budget.max(1),
            };
            self.nic.ev_qpoll(hw, &mut read_ptr, &mut dispatch);
            dispatch.rx_budget_spent() || dispatch.tx_budget_spent()
        };
        ring.read_ptr = read_ptr;
        ring.rx_done = 0;
        ring.tx_done = 0;

        self.evq_complete(index, &mut ring, true);

        self.nic.ev_qprime(hw, ring.read_ptr)?;
        Ok(exhausted)
    }

    // Finish completion work deferred during the poll.
    fn evq_complete(&self, index: usize, ring: &mut EvqRing, eop: bool) {
        for txq_index in ring.txqs.drain(..) {
            let txq = &self.txqs[txq_index];
            let mut tring = txq.inner.lock();
            if tring.pending != tring.completed {
                self.txq_complete(txq, &mut tring);
            }
        }
        if let Some(rxq) = self.rxqs.get(index) {
            let mut rring = rxq.inner.lock();
            if rring.pending != rring.completed {
                self.rxq_complete(rxq, &mut rring, eop);
            }
        }
    }

    /// Change interrupt moderation on every running EVQ.
    pub fn set_intr_moderation(&self, us: u32) -> Result {
        self.moderation_us.store(us, Ordering::Release);
        for evq in self.evqs.iter() {
            let ring = evq.inner.lock();
            if let (EvqState::Started, Some(hw)) = (ring.state, ring.hw) {
                self.nic.ev_qmoderate(hw, us)?;
            }
        }
        Ok(())
    }

    pub fn intr_moderation(&self) -> u32 {
        self.moderation_us.load(Ordering::Acquire)
    }
}
