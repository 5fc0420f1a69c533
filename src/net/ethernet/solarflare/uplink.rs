//! Uplink I/O orchestration: ordered bring-up and tear-down of the
//! interrupt, event, port, receive and transmit subsystems.

use super::adapter::Adapter;
use super::driver::{MTU_MAX, MTU_MIN};
use super::efx::DrvLimits;
use super::tx::TXQ_NTYPES;
use crate::{Result, SfvmkError};
use core::sync::atomic::Ordering;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UplinkState {
    Uninitialized,
    Registered,
    Started,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum IoStage {
    Intr,
    Ev,
    Port,
    Rx,
    Tx,
}

// Each stage depends on the ones before it.
const IO_STAGES: [IoStage; 5] = [IoStage::Intr, IoStage::Ev, IoStage::Port, IoStage::Rx, IoStage::Tx];

impl Adapter {
    fn io_stage_start(&self, stage: IoStage) -> Result {
        match stage {
            IoStage::Intr => self.intr_start(),
            IoStage::Ev => self.ev_start(),
            IoStage::Port => self.port_start(),
            IoStage::Rx => self.rx_start(),
            IoStage::Tx => self.tx_start(),
        }
    }

    fn io_stage_stop(&self, stage: IoStage) {
        match stage {
            IoStage::Intr => self.intr_stop(),
            IoStage::Ev => self.ev_stop(),
            IoStage::Port => self.port_stop(),
            IoStage::Rx => self.rx_stop(),
            IoStage::Tx => self.tx_stop(),
        }
    }

    fn drv_limits(&self) -> DrvLimits {
        let evqs = self.evqs.len() as u32;
        DrvLimits {
            min_evq_count: 1,
            max_evq_count: evqs,
            min_rxq_count: 1,
            max_rxq_count: self.rxqs.len() as u32,
            min_txq_count: TXQ_NTYPES as u32,
            max_txq_count: self.txqs.len() as u32,
        }
    }

    /// Bring the datapath up. On failure everything started so far is
    /// stopped again in reverse order.
    pub fn start_io(&self) -> Result {
        let mut state = self.state.lock();
        if *state != UplinkState::Registered {
            drv_error!("sfvmk {}: start I/O in state {:?}", self.name(), *state);
            return Err(SfvmkError::InvalidState);
        }

        self.nic.nic_set_drv_limits(&self.drv_limits())?;
        self.nic.nic_init()?;

        for (done, &stage) in IO_STAGES.iter().enumerate() {
            if let Err(err) = self.io_stage_start(stage) {
                drv_error!("sfvmk {}: {:?} start failed: {}", self.name(), stage, err);
                for &started in IO_STAGES[..done].iter().rev() {
                    self.io_stage_stop(started);
                }
                self.nic.nic_fini();
                return Err(err);
            }
        }

        *state = UplinkState::Started;
        drv_info!("sfvmk {}: I/O started", self.name());
        Ok(())
    }

    /// Stop the datapath; the reverse of [`Adapter::start_io`].
    pub fn quiesce_io(&self) -> Result {
        let mut state = self.state.lock();
        if *state != UplinkState::Started {
            drv_error!("sfvmk {}: quiesce I/O in state {:?}", self.name(), *state);
            return Err(SfvmkError::InvalidState);
        }
        for &stage in IO_STAGES.iter().rev() {
            self.io_stage_stop(stage);
        }
        self.nic.nic_fini();
        *state = UplinkState::Registered;
        drv_info!("sfvmk {}: I/O quiesced", self.name());
        Ok(())
    }

    /// Recover from a fatal condition by restarting the datapath.
    pub fn reset(&self) -> Result {
        // Requests raised while recovering schedule another reset
        self.reset_pending.store(false, Ordering::Release);
        if self.uplink_state() != UplinkState::Started {
            drv_info!("sfvmk {}: reset requested while not started", self.name());
            return Ok(());
        }
        drv_warn!("sfvmk {}: resetting", self.name());
        self.quiesce_io()?;
        self.nic.nic_reset()?;
        self.start_io()
    }

    pub fn set_mtu(&self, mtu: u32) -> Result {
        if !(MTU_MIN..=MTU_MAX).contains(&mtu) {
            return Err(SfvmkError::BadParam);
        }
        if self.uplink_state() != UplinkState::Started {
            self.mtu.store(mtu, Ordering::Release);
            return Ok(());
        }
        self.quiesce_io()?;
        self.mtu.store(mtu, Ordering::Release);
        self.start_io()
    }

    /// Poll-context entry point; returns true if EVQ `evq` should be polled again.
    pub fn netpoll(&self, evq: usize, budget: u32) -> bool {
        match self.evq_poll(evq, budget) {
            Ok(more) => more,
            Err(err) => {
                drv_debug!("sfvmk {}: EVQ {} poll skipped: {}", self.name(), evq, err);
                false
            }
        }
    }
}
