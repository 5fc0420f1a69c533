use crate::net::ethernet::structs::LinkStatus;
use crate::Result;
use alloc::string::String;
use alloc::vec::Vec;

/// Coherent DMA memory handed out by the platform.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DmaRegion {
    pub va: usize,
    pub io_addr: u64,
    pub size: usize,
}

/// Opaque platform packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PktHandle(pub usize);

/// One scatter-gather fragment of a packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SgElem {
    pub va: usize,
    pub len: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DmaDirection {
    ToDevice,
    FromDevice,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IntrCookie(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntrAllocKind {
    MsiX,
    Msi,
    Legacy,
}

/// Why a reset was requested.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetReason {
    FatalInterrupt,
    EvqException,
    McdiTimeout,
    McReboot,
    McBadAssert,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PciInfo {
    pub bdf: String,
    pub vendor_id: u16,
    pub device_id: u16,
    pub sub_vendor_id: u16,
    pub sub_device_id: u16,
}

/// Services the hypervisor kernel offers one PCI function.
pub trait Provider: Sync + Send {
    /// Get page size
    fn page_size(&self) -> usize;

    // Zeroed, physically contiguous, device-visible memory
    fn dma_alloc_coherent(&self, size: usize) -> Result<DmaRegion>;
    fn dma_free_coherent(&self, region: DmaRegion);

    fn pkt_alloc(&self, size: usize) -> Result<PktHandle>;
    fn pkt_release(&self, pkt: PktHandle);
    fn pkt_frag_count(&self, pkt: PktHandle) -> usize;
    fn pkt_frag(&self, pkt: PktHandle, index: usize) -> Option<SgElem>;

    fn dma_map(&self, elem: SgElem, dir: DmaDirection) -> Result<u64>;
    fn dma_unmap(&self, io_addr: u64, len: usize, dir: DmaDirection);

    // Busy-wait; never called from interrupt context
    fn delay_us(&self, us: u32);

    fn intr_alloc(&self, kind: IntrAllocKind, count: u32) -> Result<Vec<IntrCookie>>;
    fn intr_free(&self, cookies: &[IntrCookie]);
    // The platform calls back Adapter::intr_ack / Adapter::intr_handler with `evq`
    fn intr_register(&self, cookie: IntrCookie, evq: usize) -> Result;
    fn intr_unregister(&self, cookie: IntrCookie, evq: usize);
    fn intr_enable(&self, cookie: IntrCookie) -> Result;
    fn intr_disable(&self, cookie: IntrCookie);
    // Wait until no handler for `cookie` is running on any CPU
    fn intr_sync(&self, cookie: IntrCookie);

    // Poll contexts call back Adapter::netpoll with `evq`
    fn netpoll_bind(&self, evq: usize, cookie: IntrCookie) -> Result;
    fn netpoll_unbind(&self, evq: usize);
    fn netpoll_enable(&self, evq: usize);
    fn netpoll_disable(&self, evq: usize);
    fn netpoll_activate(&self, evq: usize);

    fn rx_deliver(&self, rxq: usize, pkt: PktHandle, len: usize, csum_verified: bool);
    fn tx_complete(&self, pkt: PktHandle);
    fn queue_stop(&self, txq: usize);
    fn queue_start(&self, txq: usize);
    fn link_changed(&self, link: LinkStatus);

    /// Queue Adapter::reset on a worker context.
    fn schedule_reset(&self, reason: ResetReason);

    fn pci_info(&self) -> PciInfo;
}
