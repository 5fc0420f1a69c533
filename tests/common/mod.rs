//! Mock platform and NIC shared by the integration tests.
//!
//! `MockProvider` stands in for the hypervisor: DMA memory comes from the
//! test allocator, delays advance a virtual clock and packets live in a pool
//! with leak accounting. `MockNic` stands in for the hardware library: it
//! logs calls, fails on request, queues scripted events per EVQ and answers
//! MCDI commands from a small simulated MC firmware.

#![allow(dead_code)]

use sfvmk_drivers::net::ethernet::solarflare::efx::*;
use sfvmk_drivers::net::ethernet::solarflare::mcdi::*;
use sfvmk_drivers::net::ethernet::solarflare::nvram::{self, NvramType};
use sfvmk_drivers::net::ethernet::solarflare::{Adapter, AdapterId, DriverConfig, DriverContext};
use sfvmk_drivers::net::ethernet::structs::{EthernetAddress, LinkMode, LinkStatus};
use sfvmk_drivers::dma::DmaMem;
use sfvmk_drivers::provider::*;
use sfvmk_drivers::{Result, SfvmkError};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};

pub const PAGE_SIZE: usize = 4096;
pub const TEST_MAC: EthernetAddress = EthernetAddress([0x00, 0x0f, 0x53, 0x01, 0x02, 0x03]);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct MockPkt {
    frags: Vec<Vec<u8>>,
}

pub type DelayHook = Arc<dyn Fn(u64) + Send + Sync>;
pub type BringUpHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct ProviderState {
    pub clock_us: u64,
    dma: HashMap<usize, Layout>,
    pub dma_allocs: usize,
    pub dma_frees: usize,
    pkts: HashMap<usize, MockPkt>,
    next_pkt: usize,
    pub pkt_alloc_budget: Option<usize>,
    pub mapped: isize,
    pub fail_dma_map: bool,
    pub msix_limit: Option<u32>,
    pub msi_ok: bool,
    pub intr_allocs: Vec<(IntrAllocKind, u32)>,
    pub intr_freed: usize,
    pub registered: HashSet<u32>,
    pub enabled: HashSet<u32>,
    pub bound: HashSet<usize>,
    pub netpoll_enabled: HashSet<usize>,
    pub activations: Vec<usize>,
    pub delivered: Vec<(usize, PktHandle, usize, bool)>,
    pub tx_completed: Vec<PktHandle>,
    pub queue_stops: Vec<usize>,
    pub queue_starts: Vec<usize>,
    pub links: Vec<LinkStatus>,
    pub resets: Vec<ResetReason>,
}

pub struct MockProvider {
    pub state: Mutex<ProviderState>,
    hook: Mutex<Option<DelayHook>>,
}

impl MockProvider {
    pub fn new() -> Arc<MockProvider> {
        Arc::new(MockProvider {
            state: Mutex::new(ProviderState {
                msix_limit: Some(64),
                msi_ok: true,
                next_pkt: 1,
                ..ProviderState::default()
            }),
            hook: Mutex::new(None),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ProviderState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn now(&self) -> u64 {
        self.with(|s| s.clock_us)
    }

    /// Run `hook` after every delay, with the virtual time in microseconds.
    pub fn set_delay_hook(&self, hook: DelayHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    pub fn clear_delay_hook(&self) {
        *self.hook.lock().unwrap() = None;
    }

    /// Build a transmit packet with one fragment per entry of `frags`.
    pub fn make_pkt(&self, frags: &[usize]) -> PktHandle {
        self.with(|s| {
            let id = s.next_pkt;
            s.next_pkt += 1;
            s.pkts.insert(
                id,
                MockPkt {
                    frags: frags.iter().map(|&len| vec![0xa5; len]).collect(),
                },
            );
            PktHandle(id)
        })
    }

    pub fn live_pkts(&self) -> usize {
        self.with(|s| s.pkts.len())
    }

    pub fn live_dma(&self) -> usize {
        self.with(|s| s.dma.len())
    }

    pub fn mapped(&self) -> isize {
        self.with(|s| s.mapped)
    }

    pub fn resets(&self) -> Vec<ResetReason> {
        self.with(|s| s.resets.clone())
    }
}

impl Provider for MockProvider {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn dma_alloc_coherent(&self, size: usize) -> Result<DmaRegion> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).map_err(|_| SfvmkError::BadParam)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(SfvmkError::NoMemory);
        }
        self.with(|s| {
            s.dma.insert(ptr as usize, layout);
            s.dma_allocs += 1;
        });
        Ok(DmaRegion {
            va: ptr as usize,
            io_addr: ptr as u64,
            size,
        })
    }

    fn dma_free_coherent(&self, region: DmaRegion) {
        let layout = self.with(|s| {
            s.dma_frees += 1;
            s.dma.remove(&region.va)
        });
        let layout = layout.expect("freeing unknown DMA region");
        unsafe { dealloc(region.va as *mut u8, layout) };
    }

    fn pkt_alloc(&self, size: usize) -> Result<PktHandle> {
        let exhausted = self.with(|s| match s.pkt_alloc_budget.as_mut() {
            Some(0) => true,
            Some(n) => {
                *n -= 1;
                false
            }
            None => false,
        });
        if exhausted {
            return Err(SfvmkError::NoMemory);
        }
        Ok(self.make_pkt(&[size]))
    }

    fn pkt_release(&self, pkt: PktHandle) {
        let found = self.with(|s| s.pkts.remove(&pkt.0).is_some());
        assert!(found, "double release of {:?}", pkt);
    }

    fn pkt_frag_count(&self, pkt: PktHandle) -> usize {
        self.with(|s| s.pkts.get(&pkt.0).map_or(0, |p| p.frags.len()))
    }

    fn pkt_frag(&self, pkt: PktHandle, index: usize) -> Option<SgElem> {
        self.with(|s| {
            let frag = s.pkts.get(&pkt.0)?.frags.get(index)?;
            Some(SgElem {
                va: frag.as_ptr() as usize,
                len: frag.len(),
            })
        })
    }

    fn dma_map(&self, elem: SgElem, _dir: DmaDirection) -> Result<u64> {
        self.with(|s| {
            if s.fail_dma_map {
                return Err(SfvmkError::DmaMapFailed);
            }
            s.mapped += 1;
            Ok(elem.va as u64)
        })
    }

    fn dma_unmap(&self, _io_addr: u64, _len: usize, _dir: DmaDirection) {
        self.with(|s| s.mapped -= 1);
    }

    fn delay_us(&self, us: u32) {
        let now = self.with(|s| {
            s.clock_us += u64::from(us);
            s.clock_us
        });
        let hook = self.hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(now);
        }
    }

    fn intr_alloc(&self, kind: IntrAllocKind, count: u32) -> Result<Vec<IntrCookie>> {
        self.with(|s| {
            s.intr_allocs.push((kind, count));
            let granted = match kind {
                IntrAllocKind::MsiX => s.msix_limit.map(|limit| count.min(limit)),
                IntrAllocKind::Msi if s.msi_ok => Some(1),
                IntrAllocKind::Msi => None,
                IntrAllocKind::Legacy => Some(1),
            };
            match granted {
                Some(n) if n > 0 => Ok((0..n).map(IntrCookie).collect()),
                _ => Err(SfvmkError::NotSupported),
            }
        })
    }

    fn intr_free(&self, cookies: &[IntrCookie]) {
        self.with(|s| s.intr_freed += cookies.len());
    }

    fn intr_register(&self, cookie: IntrCookie, _evq: usize) -> Result {
        self.with(|s| s.registered.insert(cookie.0));
        Ok(())
    }

    fn intr_unregister(&self, cookie: IntrCookie, _evq: usize) {
        self.with(|s| {
            assert!(!s.enabled.contains(&cookie.0), "unregistering an enabled vector");
            s.registered.remove(&cookie.0)
        });
    }

    fn intr_enable(&self, cookie: IntrCookie) -> Result {
        self.with(|s| s.enabled.insert(cookie.0));
        Ok(())
    }

    fn intr_disable(&self, cookie: IntrCookie) {
        self.with(|s| s.enabled.remove(&cookie.0));
    }

    fn intr_sync(&self, _cookie: IntrCookie) {}

    fn netpoll_bind(&self, evq: usize, _cookie: IntrCookie) -> Result {
        self.with(|s| s.bound.insert(evq));
        Ok(())
    }

    fn netpoll_unbind(&self, evq: usize) {
        self.with(|s| s.bound.remove(&evq));
    }

    fn netpoll_enable(&self, evq: usize) {
        self.with(|s| s.netpoll_enabled.insert(evq));
    }

    fn netpoll_disable(&self, evq: usize) {
        self.with(|s| s.netpoll_enabled.remove(&evq));
    }

    fn netpoll_activate(&self, evq: usize) {
        self.with(|s| s.activations.push(evq));
    }

    fn rx_deliver(&self, rxq: usize, pkt: PktHandle, len: usize, csum_verified: bool) {
        self.with(|s| {
            // the stack consumes delivered packets
            s.pkts.remove(&pkt.0).expect("delivering unknown packet");
            s.delivered.push((rxq, pkt, len, csum_verified));
        });
    }

    fn tx_complete(&self, pkt: PktHandle) {
        self.with(|s| {
            s.pkts.remove(&pkt.0).expect("completing unknown packet");
            s.tx_completed.push(pkt);
        });
    }

    fn queue_stop(&self, txq: usize) {
        self.with(|s| s.queue_stops.push(txq));
    }

    fn queue_start(&self, txq: usize) {
        self.with(|s| s.queue_starts.push(txq));
    }

    fn link_changed(&self, link: LinkStatus) {
        self.with(|s| s.links.push(link));
    }

    fn schedule_reset(&self, reason: ResetReason) {
        self.with(|s| s.resets.push(reason));
    }

    fn pci_info(&self) -> PciInfo {
        PciInfo {
            bdf: "0000:03:00.0".to_string(),
            vendor_id: 0x1924,
            device_id: 0x0a03,
            sub_vendor_id: 0x1924,
            sub_device_id: 0x8022,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MockEvent {
    Initialized,
    Rx { label: u32, id: u32, size: u32, flags: RxFlags },
    Tx { label: u32, id: u32 },
    Exception(ExceptionCode, u32),
    RxqFlushDone(u32),
    RxqFlushFailed(u32),
    TxqFlushDone(u32),
    Software(u16),
    LinkChange(LinkMode),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FlushMode {
    Done,
    Fail,
    Never,
}

struct MockRing {
    evq: u32,
    entries: u32,
    label: u32,
    next_id: u32,
}

pub const MC_CMD_ERR_ENOENT: u32 = 2;
pub const MC_CMD_ERR_EINVAL: u32 = 22;
pub const MC_CMD_ERR_ENOSYS: u32 = 38;

/// Simulated MC firmware state.
pub struct Firmware {
    pub respond: bool,
    pub version: [u16; 4],
    pub partitions: HashMap<u32, Vec<u8>>,
    pub metadata: HashMap<u32, (u32, [u16; 4])>,
    pub updating: HashSet<u32>,
    pub link_caps: u32,
    pub link_up: bool,
    pub link_speed: u32,
    pub commands: Vec<u32>,
    pub pending_reboot: Option<McdiException>,
}

/// A VPD image in PCI format: ID string, RO section with `PN` and the
/// checksum, end tag, padded with erased-flash bytes.
pub fn vpd_image(part_number: &[u8], size: usize) -> Vec<u8> {
    let id = b"Solarflare SFN8522";
    let mut out = vec![0x82, id.len() as u8, 0];
    out.extend_from_slice(id);

    let mut ro = vec![b'P', b'N', part_number.len() as u8];
    ro.extend_from_slice(part_number);
    ro.extend_from_slice(&[b'R', b'V', 1, 0]);
    out.push(0x90);
    out.extend_from_slice(&(ro.len() as u16).to_le_bytes());
    out.extend_from_slice(&ro);
    let sum = out.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    *out.last_mut().unwrap() = 0u8.wrapping_sub(sum);

    out.push(0x78);
    out.resize(size, 0xff);
    out
}

impl Firmware {
    fn new() -> Firmware {
        let mut partitions = HashMap::new();
        let mut metadata = HashMap::new();
        let partn = |ty: NvramType| ty.partition().unwrap();
        partitions.insert(partn(NvramType::Mc), vec![0x11; 4096]);
        partitions.insert(partn(NvramType::BootRom), vec![0x22; 2048]);
        partitions.insert(partn(NvramType::UefiRom), vec![0x33; 2048]);
        partitions.insert(partn(NvramType::DynamicCfg), vpd_image(b"PN123-45", 1024));
        metadata.insert(partn(NvramType::BootRom), (0x1c, [5, 1, 0, 2]));
        metadata.insert(partn(NvramType::UefiRom), (0x1d, [2, 3, 4, 5]));
        Firmware {
            respond: true,
            version: [6, 2, 7, 1001],
            partitions,
            metadata,
            updating: HashSet::new(),
            link_caps: 0x7fe,
            link_up: true,
            link_speed: 10000,
            commands: Vec::new(),
            pending_reboot: None,
        }
    }

    fn word(input: &[u8], index: usize) -> u32 {
        let off = index * 4;
        input
            .get(off..off + 4)
            .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn words(out: &[u32]) -> Vec<u8> {
        out.iter().flat_map(|w| w.to_le_bytes().to_vec()).collect()
    }

    fn handle(&mut self, cmd: u32, input: &[u8]) -> std::result::Result<Vec<u8>, u32> {
        self.commands.push(cmd);
        let partn = Firmware::word(input, 0);
        match cmd {
            MC_CMD_GET_VERSION => {
                let mut out = vec![0u8; nvram::GET_VERSION_OUT_LEN];
                for (i, v) in self.version.iter().enumerate() {
                    let off = nvram::GET_VERSION_OUT_VERSION_OFST + 2 * i;
                    out[off..off + 2].copy_from_slice(&v.to_le_bytes());
                }
                Ok(out)
            }
            MC_CMD_GET_LINK => {
                let flags = if self.link_up { 1 << 1 | 1 << 2 } else { 0 };
                let speed = if self.link_up { self.link_speed } else { 0 };
                Ok(Firmware::words(&[self.link_caps, 0, speed, 0, flags, 0, 0]))
            }
            MC_CMD_SET_LINK => {
                let caps = Firmware::word(input, 0);
                let flags = Firmware::word(input, 1);
                self.link_caps = caps;
                self.link_up = flags & 1 == 0 && caps != 0;
                Ok(Vec::new())
            }
            MC_CMD_NVRAM_INFO => {
                let size = self.partitions.get(&partn).ok_or(MC_CMD_ERR_ENOENT)?.len() as u32;
                Ok(Firmware::words(&[partn, size, 1024, 0]))
            }
            MC_CMD_NVRAM_UPDATE_START => {
                if !self.partitions.contains_key(&partn) {
                    return Err(MC_CMD_ERR_ENOENT);
                }
                self.updating.insert(partn);
                Ok(Vec::new())
            }
            MC_CMD_NVRAM_UPDATE_FINISH => {
                if !self.updating.remove(&partn) {
                    return Err(MC_CMD_ERR_EINVAL);
                }
                Ok(Vec::new())
            }
            MC_CMD_NVRAM_READ | MC_CMD_NVRAM_WRITE | MC_CMD_NVRAM_ERASE => {
                let off = Firmware::word(input, 1) as usize;
                let len = Firmware::word(input, 2) as usize;
                if !self.updating.contains(&partn) {
                    return Err(MC_CMD_ERR_EINVAL);
                }
                let data = self.partitions.get_mut(&partn).ok_or(MC_CMD_ERR_ENOENT)?;
                if off + len > data.len() {
                    return Err(MC_CMD_ERR_EINVAL);
                }
                match cmd {
                    MC_CMD_NVRAM_READ => Ok(data[off..off + len].to_vec()),
                    MC_CMD_NVRAM_WRITE => {
                        data[off..off + len].copy_from_slice(&input[12..12 + len]);
                        Ok(Vec::new())
                    }
                    _ => {
                        data[off..off + len].iter_mut().for_each(|b| *b = 0xff);
                        Ok(Vec::new())
                    }
                }
            }
            MC_CMD_NVRAM_METADATA => {
                let (subtype, v) = *self.metadata.get(&partn).ok_or(MC_CMD_ERR_ENOENT)?;
                let mut out = Firmware::words(&[partn, nvram::NVRAM_METADATA_OUT_VERSION_VALID, subtype]);
                for w in v.iter() {
                    out.extend_from_slice(&w.to_le_bytes());
                }
                Ok(out)
            }
            _ => Err(MC_CMD_ERR_ENOSYS),
        }
    }
}

#[derive(Default)]
pub struct NicState {
    pub calls: Vec<&'static str>,
    pub fail: HashSet<&'static str>,
    pub events: HashMap<u32, VecDeque<MockEvent>>,
    pub init_event: bool,
    pub rx_flush: Option<FlushMode>,
    pub tx_flush: Option<FlushMode>,
    rxqs: HashMap<u32, MockRing>,
    txqs: HashMap<u32, MockRing>,
    pub rx_post_batches: Vec<(u32, usize)>,
    pub rx_flushes: usize,
    pub tx_flushes: usize,
    pub tx_posted: HashMap<u32, Vec<EfxBuffer>>,
    pub tx_flags: HashMap<u32, TxqFlags>,
    pub tx_desc_index: u32,
    pub fatsov2_contexts: bool,
    pub moderation: HashMap<u32, u32>,
    pub rss_table: Vec<u32>,
    pub default_rxq: Option<(u32, bool)>,
    pub line_qmask: u32,
    pub fatal: bool,
    pub cfg_txq_limit: u32,
    /// Runs once, at the start of the next adapter bring-up on this NIC.
    pub bring_up_hook: Option<BringUpHook>,
}

pub struct MockNic {
    pub state: Mutex<NicState>,
    pub fw: Mutex<Firmware>,
}

impl MockNic {
    pub fn new() -> Arc<MockNic> {
        Arc::new(MockNic {
            state: Mutex::new(NicState {
                init_event: true,
                rx_flush: Some(FlushMode::Done),
                tx_flush: Some(FlushMode::Done),
                fatsov2_contexts: true,
                cfg_txq_limit: 64,
                ..NicState::default()
            }),
            fw: Mutex::new(Firmware::new()),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut NicState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn firmware<R>(&self, f: impl FnOnce(&mut Firmware) -> R) -> R {
        f(&mut self.fw.lock().unwrap())
    }

    pub fn fail_on(&self, call: &'static str) {
        self.with(|s| s.fail.insert(call));
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.with(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with(|s| s.calls.clear());
    }

    fn call(&self, name: &'static str) -> Result {
        self.with(|s| {
            s.calls.push(name);
            if s.fail.contains(name) {
                Err(SfvmkError::IoError)
            } else {
                Ok(())
            }
        })
    }

    pub fn push_event(&self, evq: u32, event: MockEvent) {
        self.with(|s| s.events.entry(evq).or_default().push_back(event));
    }

    /// Queue an RX event completing `count` descriptors of RXQ `rxq`.
    pub fn rx_arrive(&self, rxq: u32, count: u32, size: u32, flags: RxFlags) {
        let (evq, event) = self.with(|s| {
            let ring = s.rxqs.get_mut(&rxq).expect("RXQ not created");
            ring.next_id = ring.next_id.wrapping_add(count);
            let id = ring.next_id.wrapping_sub(1) & (ring.entries - 1);
            (ring.evq, MockEvent::Rx { label: rxq, id, size, flags })
        });
        self.push_event(evq, event);
    }

    /// Queue a TX event completing `count` descriptors of TXQ `txq`.
    pub fn tx_done(&self, txq: u32, count: u32) {
        let (evq, event) = self.with(|s| {
            let ring = s.txqs.get_mut(&txq).expect("TXQ not created");
            ring.next_id = ring.next_id.wrapping_add(count);
            let id = ring.next_id.wrapping_sub(1) & (ring.entries - 1);
            (ring.evq, MockEvent::Tx { label: ring.label, id })
        });
        self.push_event(evq, event);
    }

    pub fn rxq_evq(&self, rxq: u32) -> Option<u32> {
        self.with(|s| s.rxqs.get(&rxq).map(|r| r.evq))
    }
}

impl EfxNic for MockNic {
    fn nic_probe(&self) -> Result {
        if let Some(hook) = self.with(|s| s.bring_up_hook.take()) {
            hook();
        }
        self.call("nic_probe")
    }
    fn nic_unprobe(&self) {
        let _ = self.call("nic_unprobe");
    }
    fn nic_reset(&self) -> Result {
        self.call("nic_reset")
    }
    fn nic_cfg(&self) -> NicCfg {
        NicCfg {
            mac: TEST_MAC,
            intr_limit: 32,
            evq_limit: 32,
            rxq_limit: 32,
            txq_limit: self.with(|s| s.cfg_txq_limit),
            rx_prefix_size: 14,
            rx_buf_align_end: 64,
            rx_batch_max: 64,
            fatsov2: true,
        }
    }
    fn nic_set_drv_limits(&self, _limits: &DrvLimits) -> Result {
        self.call("nic_set_drv_limits")
    }
    fn nic_init(&self) -> Result {
        self.call("nic_init")
    }
    fn nic_fini(&self) {
        let _ = self.call("nic_fini");
    }
}

impl EfxIntr for MockNic {
    fn intr_init(&self, _kind: IntrType) -> Result {
        self.call("intr_init")
    }
    fn intr_fini(&self) {
        let _ = self.call("intr_fini");
    }
    fn intr_enable(&self) {
        let _ = self.call("intr_enable");
    }
    fn intr_disable(&self) {
        let _ = self.call("intr_disable");
    }
    fn intr_fatal(&self) {
        let _ = self.call("intr_fatal");
    }
    fn intr_status_message(&self, _index: u32) -> bool {
        self.with(|s| s.fatal)
    }
    fn intr_status_line(&self) -> (bool, u32) {
        self.with(|s| (s.fatal, s.line_qmask))
    }
}

impl EfxEv for MockNic {
    fn ev_init(&self) -> Result {
        self.call("ev_init")
    }
    fn ev_fini(&self) {
        let _ = self.call("ev_fini");
    }
    fn ev_qcreate(&self, index: u32, mem: &DmaMem, entries: u32, moderation_us: u32) -> Result<EvqHandle> {
        self.call("ev_qcreate")?;
        assert!(mem.size() >= entries as usize * EFX_EV_SIZE);
        assert_eq!(mem.read_u32(0), 0xffff_ffff);
        self.with(|s| {
            s.moderation.insert(index, moderation_us);
            let queue = s.events.entry(index).or_default();
            queue.clear();
            if s.init_event {
                queue.push_back(MockEvent::Initialized);
            }
        });
        Ok(EvqHandle(index))
    }
    fn ev_qdestroy(&self, evq: EvqHandle) {
        let _ = self.call("ev_qdestroy");
        self.with(|s| s.events.remove(&evq.0));
    }
    fn ev_qprime(&self, _evq: EvqHandle, _read_ptr: u32) -> Result {
        Ok(())
    }
    fn ev_qpoll(&self, evq: EvqHandle, read_ptr: &mut u32, callbacks: &mut dyn EvCallbacks) {
        loop {
            let event = match self.with(|s| s.events.get_mut(&evq.0).and_then(|q| q.pop_front())) {
                Some(event) => event,
                None => break,
            };
            *read_ptr = read_ptr.wrapping_add(1);
            let stop = match event {
                MockEvent::Initialized => callbacks.initialized(),
                MockEvent::Rx { label, id, size, flags } => callbacks.rx(label, id, size, flags),
                MockEvent::Tx { label, id } => callbacks.tx(label, id),
                MockEvent::Exception(code, data) => callbacks.exception(code, data),
                MockEvent::RxqFlushDone(q) => callbacks.rxq_flush_done(q),
                MockEvent::RxqFlushFailed(q) => callbacks.rxq_flush_failed(q),
                MockEvent::TxqFlushDone(q) => callbacks.txq_flush_done(q),
                MockEvent::Software(magic) => callbacks.software(magic),
                MockEvent::LinkChange(mode) => callbacks.link_change(mode),
            };
            if stop {
                break;
            }
        }
    }
    fn ev_qmoderate(&self, evq: EvqHandle, us: u32) -> Result {
        self.call("ev_qmoderate")?;
        self.with(|s| s.moderation.insert(evq.0, us));
        Ok(())
    }
}

impl EfxRx for MockNic {
    fn rx_init(&self) -> Result {
        self.call("rx_init")
    }
    fn rx_fini(&self) {
        let _ = self.call("rx_fini");
    }
    fn rx_scale_mode_set(&self, _hash: RxHashFlags) -> Result {
        self.call("rx_scale_mode_set")
    }
    fn rx_scale_key_set(&self, key: &[u8]) -> Result {
        assert_eq!(key.len(), EFX_RSS_KEY_SIZE);
        self.call("rx_scale_key_set")
    }
    fn rx_scale_tbl_set(&self, table: &[u32]) -> Result {
        self.call("rx_scale_tbl_set")?;
        self.with(|s| s.rss_table = table.to_vec());
        Ok(())
    }
    fn rx_qcreate(&self, index: u32, _mem: &DmaMem, entries: u32, evq: EvqHandle) -> Result<RxqHandle> {
        self.call("rx_qcreate")?;
        self.with(|s| {
            s.rxqs.insert(
                index,
                MockRing {
                    evq: evq.0,
                    entries,
                    label: index,
                    next_id: 0,
                },
            )
        });
        Ok(RxqHandle(index))
    }
    fn rx_qenable(&self, _rxq: RxqHandle) {}
    fn rx_qpost(&self, rxq: RxqHandle, addrs: &[u64], size: usize, _completed: u32, _added: u32) {
        assert!(size > 0);
        self.with(|s| s.rx_post_batches.push((rxq.0, addrs.len())));
    }
    fn rx_qpush(&self, _rxq: RxqHandle, added: u32, pushed: &mut u32) {
        *pushed = added;
    }
    fn rx_qflush(&self, rxq: RxqHandle) -> Result {
        self.call("rx_qflush")?;
        let (evq, mode) = self.with(|s| {
            s.rx_flushes += 1;
            (s.rxqs.get(&rxq.0).map(|r| r.evq), s.rx_flush)
        });
        if let Some(evq) = evq {
            match mode {
                Some(FlushMode::Done) => self.push_event(evq, MockEvent::RxqFlushDone(rxq.0)),
                Some(FlushMode::Fail) => self.push_event(evq, MockEvent::RxqFlushFailed(rxq.0)),
                _ => {}
            }
        }
        Ok(())
    }
    fn rx_qdestroy(&self, rxq: RxqHandle) {
        let _ = self.call("rx_qdestroy");
        self.with(|s| s.rxqs.remove(&rxq.0));
    }
    fn mac_filter_default_rxq_set(&self, rxq: RxqHandle, using_rss: bool) -> Result {
        self.call("mac_filter_default_rxq_set")?;
        self.with(|s| s.default_rxq = Some((rxq.0, using_rss)));
        Ok(())
    }
    fn mac_filter_default_rxq_clear(&self) {
        let _ = self.call("mac_filter_default_rxq_clear");
        self.with(|s| s.default_rxq = None);
    }
}

impl EfxTx for MockNic {
    fn tx_init(&self) -> Result {
        self.call("tx_init")
    }
    fn tx_fini(&self) {
        let _ = self.call("tx_fini");
    }
    fn tx_qcreate(
        &self,
        index: u32,
        label: u32,
        _mem: &DmaMem,
        entries: u32,
        flags: TxqFlags,
        evq: EvqHandle,
    ) -> Result<(TxqHandle, u32)> {
        self.call("tx_qcreate")?;
        self.with(|s| {
            if flags.contains(TxqFlags::FATSOV2) && !s.fatsov2_contexts {
                return Err(SfvmkError::NoSpace);
            }
            s.tx_flags.insert(index, flags);
            s.txqs.insert(
                index,
                MockRing {
                    evq: evq.0,
                    entries,
                    label,
                    next_id: s.tx_desc_index,
                },
            );
            Ok((TxqHandle(index), s.tx_desc_index))
        })
    }
    fn tx_qenable(&self, _txq: TxqHandle) {}
    fn tx_qpost(&self, txq: TxqHandle, bufs: &[EfxBuffer], _completed: u32, added: &mut u32) -> Result {
        self.call("tx_qpost")?;
        self.with(|s| s.tx_posted.entry(txq.0).or_default().extend_from_slice(bufs));
        *added = added.wrapping_add(bufs.len() as u32);
        Ok(())
    }
    fn tx_qpush(&self, _txq: TxqHandle, _added: u32, _pushed: u32) {}
    fn tx_qflush(&self, txq: TxqHandle) -> Result {
        self.call("tx_qflush")?;
        let (evq, mode) = self.with(|s| {
            s.tx_flushes += 1;
            (s.txqs.get(&txq.0).map(|r| r.evq), s.tx_flush)
        });
        if let (Some(evq), Some(FlushMode::Done)) = (evq, mode) {
            self.push_event(evq, MockEvent::TxqFlushDone(txq.0));
        }
        Ok(())
    }
    fn tx_qdestroy(&self, txq: TxqHandle) {
        let _ = self.call("tx_qdestroy");
        self.with(|s| s.txqs.remove(&txq.0));
    }
}

impl EfxPort for MockNic {
    fn port_init(&self) -> Result {
        self.call("port_init")
    }
    fn port_fini(&self) {
        let _ = self.call("port_fini");
    }
    fn mac_pdu_set(&self, _pdu: usize) -> Result {
        self.call("mac_pdu_set")
    }
    fn mac_addr_set(&self, _mac: EthernetAddress) -> Result {
        self.call("mac_addr_set")
    }
    fn mac_filter_set(&self, _all_unicast: bool, _mulcst: bool, _all_mulcst: bool, _brdcst: bool) -> Result {
        self.call("mac_filter_set")
    }
    fn mac_drain(&self, enabled: bool) -> Result {
        self.call(if enabled { "mac_drain_on" } else { "mac_drain_off" })
    }
}

impl EfxMcdi for MockNic {
    fn mcdi_init(&self) -> Result {
        self.call("mcdi_init")
    }
    fn mcdi_fini(&self) {
        let _ = self.call("mcdi_fini");
    }
    fn mcdi_doorbell(&self, mem: &DmaMem, len: usize) {
        let hdr = McdiHeader::decode([mem.read_u32(0), mem.read_u32(4)]);
        assert_eq!(hdr.len + MCDI_HDR_LEN, len);
        let mut input = vec![0u8; hdr.len];
        mem.read_bytes(MCDI_HDR_LEN, &mut input);

        let mut fw = self.fw.lock().unwrap();
        if !fw.respond {
            fw.commands.push(hdr.cmd);
            return;
        }
        let (error, payload) = match fw.handle(hdr.cmd, &input) {
            Ok(out) => (false, out),
            Err(errno) => (true, errno.to_le_bytes().to_vec()),
        };
        mem.write_bytes(MCDI_HDR_LEN, &payload);
        let [v1, v2] = McdiHeader {
            cmd: hdr.cmd,
            len: payload.len(),
            seq: hdr.seq,
            response: true,
            error,
            ..McdiHeader::default()
        }
        .encode();
        mem.write_u32(4, v2);
        mem.write_u32(0, v1);
    }
    fn mcdi_poll_reboot(&self) -> Option<McdiException> {
        self.fw.lock().unwrap().pending_reboot.take()
    }
}

/// A driver context with one adapter named `name` attached to the mocks.
pub fn attach(
    config: DriverConfig,
    name: &str,
    provider: &Arc<MockProvider>,
    nic: &Arc<MockNic>,
) -> (Arc<DriverContext>, AdapterId, Arc<Adapter>) {
    init_logging();
    let ctx = DriverContext::new(config).expect("config");
    let id = ctx
        .attach(name, provider.clone(), nic.clone())
        .expect("attach");
    let adapter = ctx.adapter(id).expect("adapter");
    (ctx, id, adapter)
}

/// Poll every EVQ of `adapter` after each delay, as the platform's poll
/// contexts would while the driver sleeps.
pub fn poll_on_delay(provider: &MockProvider, adapter: &Arc<Adapter>) {
    let weak: Weak<Adapter> = Arc::downgrade(adapter);
    provider.set_delay_hook(Arc::new(move |_now| {
        if let Some(adapter) = weak.upgrade() {
            for evq in 0..adapter.evqs().len() {
                adapter.netpoll(evq, 64);
            }
        }
    }));
}

/// One adapter on fresh mocks, torn down with leak checks.
pub struct Harness {
    pub provider: Arc<MockProvider>,
    pub nic: Arc<MockNic>,
    pub ctx: Arc<DriverContext>,
    pub id: AdapterId,
    pub adapter: Arc<Adapter>,
}

impl Harness {
    pub fn new(config: DriverConfig) -> Harness {
        let provider = MockProvider::new();
        let nic = MockNic::new();
        let (ctx, id, adapter) = attach(config, "vmnic0", &provider, &nic);
        poll_on_delay(&provider, &adapter);
        Harness {
            provider,
            nic,
            ctx,
            id,
            adapter,
        }
    }

    /// Attached and with I/O running.
    pub fn started(config: DriverConfig) -> Harness {
        let h = Harness::new(config);
        h.adapter.start_io().expect("start_io");
        h
    }

    /// Detach, drop the adapter and check nothing the platform handed out is still held.
    pub fn teardown(self) -> (Arc<MockProvider>, Arc<MockNic>) {
        let Harness {
            provider,
            nic,
            ctx,
            id,
            adapter,
        } = self;
        ctx.detach(id).expect("detach");
        drop(adapter);
        drop(ctx);
        assert_eq!(provider.live_dma(), 0, "DMA regions leaked");
        assert_eq!(provider.live_pkts(), 0, "packets leaked");
        assert_eq!(provider.mapped(), 0, "DMA mappings leaked");
        (provider, nic)
    }
}

pub fn single_queue_config() -> DriverConfig {
    DriverConfig {
        evqs_desired: 1,
        ..DriverConfig::default()
    }
}
