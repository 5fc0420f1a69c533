//! Boundary to the NIC hardware/firmware library ("common code").
//!
//! The library owns every hardware descriptor and register layout. The
//! driver core only sees opaque queue handles, software flags and the event
//! callbacks below.

use crate::dma::DmaMem;
use crate::net::ethernet::structs::{EthernetAddress, LinkMode};
use crate::util::p2roundup;
use crate::Result;
use bitflags::*;

/// Bytes per hardware event record.
pub const EFX_EV_SIZE: usize = 8;
pub const EFX_RXQ_DESC_SIZE: usize = 8;
pub const EFX_TXQ_DESC_SIZE: usize = 8;

/// Slots kept free in every descriptor ring.
pub const EFX_RING_RESERVE: u32 = 16;

// Ethernet header + VLAN tag + FCS + hardware padding
const EFX_MAC_PDU_ADJUSTMENT: usize = 14 + 4 + 4 + 16;

pub const EFX_RSS_TBL_SIZE: usize = 128;
pub const EFX_RSS_KEY_SIZE: usize = 40;

/// Usable slots of a ring with `entries` descriptors.
pub const fn ring_limit(entries: u32) -> u32 {
    entries - EFX_RING_RESERVE
}

/// Largest frame the MAC must accept for a given MTU.
pub const fn mac_pdu(sdu: usize) -> usize {
    p2roundup(sdu + EFX_MAC_PDU_ADJUSTMENT, 8)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EvqHandle(pub u32);
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RxqHandle(pub u32);
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TxqHandle(pub u32);

bitflags! {
    /// Per-descriptor receive flags.
    #[derive(Default)]
    pub struct RxFlags: u16 {
        const ADDR_MISMATCH = 1 << 0;
        const DISCARD = 1 << 1;
        const PKT_START = 1 << 2;
        const PKT_CONT = 1 << 3;
        // hardware validated the L4 checksum
        const CKSUM_TCPUDP = 1 << 4;
        // hardware validated the IPv4 header checksum
        const CKSUM_IPV4 = 1 << 5;
        const PKT_TCP = 1 << 6;
        const PKT_UDP = 1 << 7;
        const PKT_IPV4 = 1 << 8;
        const PKT_IPV6 = 1 << 9;
        const PKT_VLAN_TAGGED = 1 << 10;
    }
}

bitflags! {
    pub struct TxqFlags: u16 {
        const CKSUM_IPV4 = 1 << 0;
        const CKSUM_TCPUDP = 1 << 1;
        const FATSOV2 = 1 << 2;
    }
}

bitflags! {
    pub struct RxHashFlags: u16 {
        const IPV4 = 1 << 0;
        const TCP_IPV4 = 1 << 1;
        const IPV6 = 1 << 2;
        const TCP_IPV6 = 1 << 3;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntrType {
    /// MSI or MSI-X
    Message,
    /// Legacy INTx line
    Line,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExceptionCode {
    RxRecovery,
    RxDscError,
    TxDscError,
    UnknownSensorEvent,
    FwAlertSram,
    UnknownFwAlert,
    RxError,
    TxError,
    EvError,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum McdiException {
    McReboot,
    McBadAssert,
}

/// One DMA segment handed to the transmit descriptor builder.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EfxBuffer {
    pub addr: u64,
    pub size: usize,
    pub eop: bool,
}

/// Capabilities and limits read from the NIC after reset.
#[derive(Clone, Debug)]
pub struct NicCfg {
    pub mac: EthernetAddress,
    pub intr_limit: u32,
    pub evq_limit: u32,
    pub rxq_limit: u32,
    pub txq_limit: u32,
    pub rx_prefix_size: usize,
    pub rx_buf_align_end: usize,
    /// Largest number of descriptors one RX event may complete.
    pub rx_batch_max: u32,
    pub fatsov2: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DrvLimits {
    pub min_evq_count: u32,
    pub max_evq_count: u32,
    pub min_rxq_count: u32,
    pub max_rxq_count: u32,
    pub min_txq_count: u32,
    pub max_txq_count: u32,
}

/// Decoded-event sink driven by [`EfxEv::ev_qpoll`].
///
/// Each method returns `true` to stop the poll early.
pub trait EvCallbacks {
    fn initialized(&mut self) -> bool;
    fn rx(&mut self, label: u32, id: u32, size: u32, flags: RxFlags) -> bool;
    fn tx(&mut self, label: u32, id: u32) -> bool;
    fn exception(&mut self, code: ExceptionCode, data: u32) -> bool;
    fn rxq_flush_done(&mut self, rxq_index: u32) -> bool;
    fn rxq_flush_failed(&mut self, rxq_index: u32) -> bool;
    fn txq_flush_done(&mut self, txq_index: u32) -> bool;
    fn software(&mut self, magic: u16) -> bool;
    fn link_change(&mut self, mode: LinkMode) -> bool;
}

pub trait EfxNic: Send + Sync {
    fn nic_probe(&self) -> Result;
    fn nic_unprobe(&self);
    fn nic_reset(&self) -> Result;
    fn nic_cfg(&self) -> NicCfg;
    fn nic_set_drv_limits(&self, limits: &DrvLimits) -> Result;
    fn nic_init(&self) -> Result;
    fn nic_fini(&self);
}

pub trait EfxIntr: Send + Sync {
    fn intr_init(&self, kind: IntrType) -> Result;
    fn intr_fini(&self);
    fn intr_enable(&self);
    fn intr_disable(&self);
    /// Latch and report the fatal condition behind a fatal interrupt.
    fn intr_fatal(&self);
    /// Returns true if the message interrupt `index` reports a fatal error.
    fn intr_status_message(&self, index: u32) -> bool;
    /// Returns (fatal, queue mask) for the legacy line.
    fn intr_status_line(&self) -> (bool, u32);
}

pub trait EfxEv: Send + Sync {
    fn ev_init(&self) -> Result;
    fn ev_fini(&self);
    fn ev_qcreate(&self, index: u32, mem: &DmaMem, entries: u32, moderation_us: u32) -> Result<EvqHandle>;
    fn ev_qdestroy(&self, evq: EvqHandle);
    fn ev_qprime(&self, evq: EvqHandle, read_ptr: u32) -> Result;
    fn ev_qpoll(&self, evq: EvqHandle, read_ptr: &mut u32, callbacks: &mut dyn EvCallbacks);
    fn ev_qmoderate(&self, evq: EvqHandle, us: u32) -> Result;
}

pub trait EfxRx: Send + Sync {
    fn rx_init(&self) -> Result;
    fn rx_fini(&self);
    fn rx_scale_mode_set(&self, hash: RxHashFlags) -> Result;
    fn rx_scale_key_set(&self, key: &[u8]) -> Result;
    fn rx_scale_tbl_set(&self, table: &[u32]) -> Result;
    fn rx_qcreate(&self, index: u32, mem: &DmaMem, entries: u32, evq: EvqHandle) -> Result<RxqHandle>;
    fn rx_qenable(&self, rxq: RxqHandle);
    fn rx_qpost(&self, rxq: RxqHandle, addrs: &[u64], size: usize, completed: u32, added: u32);
    fn rx_qpush(&self, rxq: RxqHandle, added: u32, pushed: &mut u32);
    fn rx_qflush(&self, rxq: RxqHandle) -> Result;
    fn rx_qdestroy(&self, rxq: RxqHandle);
    fn mac_filter_default_rxq_set(&self, rxq: RxqHandle, using_rss: bool) -> Result;
    fn mac_filter_default_rxq_clear(&self);
}

pub trait EfxTx: Send + Sync {
    fn tx_init(&self) -> Result;
    fn tx_fini(&self);
    /// Returns the queue handle and the descriptor index the ring starts at.
    fn tx_qcreate(
        &self,
        index: u32,
        label: u32,
        mem: &DmaMem,
        entries: u32,
        flags: TxqFlags,
        evq: EvqHandle,
    ) -> Result<(TxqHandle, u32)>;
    fn tx_qenable(&self, txq: TxqHandle);
    fn tx_qpost(&self, txq: TxqHandle, bufs: &[EfxBuffer], completed: u32, added: &mut u32) -> Result;
    fn tx_qpush(&self, txq: TxqHandle, added: u32, pushed: u32);
    fn tx_qflush(&self, txq: TxqHandle) -> Result;
    fn tx_qdestroy(&self, txq: TxqHandle);
}

pub trait EfxPort: Send + Sync {
    fn port_init(&self) -> Result;
    fn port_fini(&self);
    fn mac_pdu_set(&self, pdu: usize) -> Result;
    fn mac_addr_set(&self, mac: EthernetAddress) -> Result;
    fn mac_filter_set(&self, all_unicast: bool, mulcst: bool, all_mulcst: bool, brdcst: bool) -> Result;
    fn mac_drain(&self, enabled: bool) -> Result;
}

pub trait EfxMcdi: Send + Sync {
    fn mcdi_init(&self) -> Result;
    fn mcdi_fini(&self);
    /// Tell the MC a request of `len` bytes is waiting in `mem`.
    fn mcdi_doorbell(&self, mem: &DmaMem, len: usize);
    /// Report an MC reboot or assertion seen since the last call.
    fn mcdi_poll_reboot(&self) -> Option<McdiException>;
}

/// Everything the driver core needs from the hardware library.
pub trait Nic: EfxNic + EfxIntr + EfxEv + EfxRx + EfxTx + EfxPort + EfxMcdi {}

impl<T> Nic for T where T: EfxNic + EfxIntr + EfxEv + EfxRx + EfxTx + EfxPort + EfxMcdi {}
