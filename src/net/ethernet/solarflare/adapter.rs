//! Per-PCI-function adapter object and its attach/detach sequence.

use super::driver::DriverConfig;
use super::efx::{IntrType, McdiException, Nic, NicCfg};
use super::ev::{self, Evq};
use super::intr::{Intr, IntrState};
use super::mcdi::{Mcdi, McdiEvents, McdiRequest};
use super::port::Port;
use super::rx::{self, Rxq};
use super::tx::{self, Txq};
use super::uplink::UplinkState;
use crate::net::ethernet::structs::EthernetAddress;
use crate::provider::{Provider, ResetReason};
use crate::util::{drop_reverse, OnDrop};
use crate::Result;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

pub struct Adapter {
    name: String,
    pub(crate) config: DriverConfig,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) nic: Arc<dyn Nic>,
    pub(crate) nic_cfg: NicCfg,
    pub(crate) mcdi: Mcdi,
    pub(crate) intr: Intr,
    pub(crate) evqs: Vec<Evq>,
    pub(crate) rxqs: Vec<Rxq>,
    pub(crate) txqs: Vec<Txq>,
    pub(crate) port: Port,
    pub(crate) rx_buffer_size: AtomicUsize,
    pub(crate) rx_buffer_align: AtomicUsize,
    pub(crate) state: Mutex<UplinkState>,
    pub(crate) mtu: AtomicU32,
    pub(crate) moderation_us: AtomicU32,
    pub(crate) mc_logging: AtomicBool,
    pub(crate) reset_pending: AtomicBool,
}

impl Adapter {
    pub(crate) fn attach(
        config: &DriverConfig,
        name: &str,
        provider: Arc<dyn Provider>,
        nic: Arc<dyn Nic>,
    ) -> Result<Adapter> {
        drv_info!("sfvmk {}: attach begin", name);

        let mcdi = Mcdi::init(&provider, &nic).map_err(|err| {
            drv_error!("sfvmk {}: MCDI init failed: {}", name, err);
            err
        })?;

        nic.nic_probe().map_err(|err| {
            drv_error!("sfvmk {}: NIC probe failed: {}", name, err);
            err
        })?;
        let probed = nic.clone();
        let unprobe = OnDrop::new(move || probed.nic_unprobe());

        nic.nic_reset()?;
        let nic_cfg = nic.nic_cfg();
        drv_debug!(
            "sfvmk {}: mac {} intr limit {} txq limit {}",
            name,
            nic_cfg.mac,
            nic_cfg.intr_limit,
            nic_cfg.txq_limit
        );

        let intr = Intr::init(&provider, nic_cfg.intr_limit, config.evqs_desired)?;
        let evqs = ev::init(&provider, &intr, config)?;
        let rxqs = rx::init(&provider, evqs.len(), config)?;
        let txqs = tx::init(&provider, evqs.len(), config, nic_cfg.txq_limit)?;
        let port = Port::new(nic_cfg.mac);

        unprobe.disarm();

        drv_info!(
            "sfvmk {}: attached with {} EVQs, {} RXQs, {} TXQs",
            name,
            evqs.len(),
            rxqs.len(),
            txqs.len()
        );

        Ok(Adapter {
            name: name.to_string(),
            config: config.clone(),
            mtu: AtomicU32::new(config.mtu),
            moderation_us: AtomicU32::new(config.intr_moderation_us),
            provider,
            nic,
            nic_cfg,
            mcdi,
            intr,
            evqs,
            rxqs,
            txqs,
            port,
            rx_buffer_size: AtomicUsize::new(0),
            rx_buffer_align: AtomicUsize::new(0),
            state: Mutex::new(UplinkState::Uninitialized),
            mc_logging: AtomicBool::new(false),
            reset_pending: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mac(&self) -> EthernetAddress {
        self.nic_cfg.mac
    }

    pub fn nic_cfg(&self) -> &NicCfg {
        &self.nic_cfg
    }

    pub fn mtu(&self) -> u32 {
        self.mtu.load(Ordering::Acquire)
    }

    pub fn uplink_state(&self) -> UplinkState {
        *self.state.lock()
    }

    pub(crate) fn set_uplink_state(&self, state: UplinkState) {
        *self.state.lock() = state;
    }

    pub fn intr_type(&self) -> IntrType {
        self.intr.kind()
    }

    pub fn intr_state(&self) -> IntrState {
        self.intr.state()
    }

    pub fn num_intr_alloc(&self) -> usize {
        self.intr.num_alloc()
    }

    pub fn evqs(&self) -> &[Evq] {
        &self.evqs
    }

    pub fn rxqs(&self) -> &[Rxq] {
        &self.rxqs
    }

    pub fn txqs(&self) -> &[Txq] {
        &self.txqs
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::Acquire)
    }

    /// Ask the platform to run [`Adapter::reset`]; repeated requests coalesce.
    pub fn schedule_reset(&self, reason: ResetReason) {
        if self.reset_pending.swap(true, Ordering::AcqRel) {
            drv_debug!("sfvmk {}: reset already pending ({:?})", self.name, reason);
            return;
        }
        drv_warn!("sfvmk {}: scheduling reset ({:?})", self.name, reason);
        self.provider.schedule_reset(reason);
    }

    /// Run one MCDI command to completion.
    pub fn mcdi_execute(&self, req: &mut McdiRequest) -> Result {
        self.mcdi.execute(req, self)
    }

    /// Abort an in-flight MCDI wait.
    pub fn mcdi_cancel(&self) {
        self.mcdi.cancel();
    }
}

impl McdiEvents for Adapter {
    fn mcdi_timeout(&self) {
        drv_error!("sfvmk {}: MC_TIMEOUT", self.name);
        self.schedule_reset(ResetReason::McdiTimeout);
    }

    fn mcdi_exception(&self, eme: McdiException) {
        match eme {
            McdiException::McReboot => {
                drv_error!("sfvmk {}: MC_REBOOT", self.name);
                self.schedule_reset(ResetReason::McReboot);
            }
            McdiException::McBadAssert => {
                drv_error!("sfvmk {}: MC_BADASSERT", self.name);
                self.schedule_reset(ResetReason::McBadAssert);
            }
        }
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        if *self.state.get_mut() == UplinkState::Started {
            if let Err(err) = self.quiesce_io() {
                drv_error!("sfvmk {}: quiesce on teardown failed: {}", self.name, err);
            }
        }
        drop_reverse(mem::take(&mut self.txqs));
        drop_reverse(mem::take(&mut self.rxqs));
        drop_reverse(mem::take(&mut self.evqs));
        self.intr.release();
        self.nic.nic_unprobe();
        self.mcdi.fini();
        drv_info!("sfvmk {}: torn down", self.name);
    }
}
