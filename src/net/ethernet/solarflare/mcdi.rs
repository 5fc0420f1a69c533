//! Synchronous MCDI command transport to the management controller.
//!
//! A request is copied into a DMA buffer behind an MCDI v2 header, the NIC
//! library rings the doorbell and the transport polls the buffer for the
//! MC's response with exponential backoff. The transport lock is held for
//! the whole exchange, so at most one command is outstanding per adapter.

use super::efx::{McdiException, Nic};
use crate::dma::DmaMem;
use crate::provider::Provider;
use crate::util::Backoff;
use crate::{Result, SfvmkError};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bit_field::BitField;
use core::cmp::min;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use spin::Mutex;

/// Largest MCDI v2 message, header included.
pub const MCDI_CTL_SDU_LEN_MAX_V2: usize = 0x400;
/// v1 header dword plus the v2 extended header dword.
pub const MCDI_HDR_LEN: usize = 8;
const MCDI_BUF_LEN: usize = 4 + MCDI_CTL_SDU_LEN_MAX_V2;
pub const MCDI_MAX_PAYLOAD: usize = MCDI_BUF_LEN - MCDI_HDR_LEN;

/// v1 code announcing that a v2 extended header follows.
pub const MC_CMD_V2_EXTN: u32 = 0x7f;
pub const MCDI_SEQ_MASK: u8 = 0xf;

const MCDI_POLL_MIN_US: u32 = 10;
const MCDI_POLL_MAX_US: u32 = 100_000;
pub const MCDI_WATCHDOG_US: u64 = 10_000_000;

pub const MC_CMD_GET_VERSION: u32 = 0x08;
pub const MC_CMD_GET_LINK: u32 = 0x29;
pub const MC_CMD_SET_LINK: u32 = 0x2a;
pub const MC_CMD_NVRAM_INFO: u32 = 0x37;
pub const MC_CMD_NVRAM_UPDATE_START: u32 = 0x38;
pub const MC_CMD_NVRAM_READ: u32 = 0x39;
pub const MC_CMD_NVRAM_WRITE: u32 = 0x3a;
pub const MC_CMD_NVRAM_ERASE: u32 = 0x3b;
pub const MC_CMD_NVRAM_UPDATE_FINISH: u32 = 0x3c;
pub const MC_CMD_NVRAM_METADATA: u32 = 0x52;

/// The two header dwords in front of every request and response.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct McdiHeader {
    pub cmd: u32,
    pub len: usize,
    pub seq: u8,
    pub resync: bool,
    pub response: bool,
    pub error: bool,
}

impl McdiHeader {
    pub fn encode(&self) -> [u32; 2] {
        let mut v1 = 0u32;
        v1.set_bits(0..7, MC_CMD_V2_EXTN);
        v1.set_bit(7, self.resync);
        v1.set_bits(16..20, u32::from(self.seq & MCDI_SEQ_MASK));
        v1.set_bit(22, self.error);
        v1.set_bit(23, self.response);

        let mut v2 = 0u32;
        v2.set_bits(0..15, self.cmd);
        v2.set_bits(16..26, self.len as u32);
        [v1, v2]
    }

    pub fn decode(words: [u32; 2]) -> McdiHeader {
        let [v1, v2] = words;
        McdiHeader {
            cmd: v2.get_bits(0..15),
            len: v2.get_bits(16..26) as usize,
            seq: v1.get_bits(16..20) as u8,
            resync: v1.get_bit(7),
            response: v1.get_bit(23),
            error: v1.get_bit(22),
        }
    }

    pub fn is_v2(words: [u32; 2]) -> bool {
        words[0].get_bits(0..7) == MC_CMD_V2_EXTN
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum McdiState {
    Uninitialized = 0,
    Initialized = 1,
    /// A request is being polled for.
    Busy = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum McdiRequestState {
    Pending,
    Completed,
    Aborted,
    Failed,
}

/// One command and, once executed, its response.
#[derive(Clone, Debug)]
pub struct McdiRequest {
    pub cmd: u32,
    pub input: Vec<u8>,
    pub out_len: usize,
    output: Vec<u8>,
    state: McdiRequestState,
    errno: Option<u32>,
}

impl McdiRequest {
    pub fn new(cmd: u32, input: &[u8], out_len: usize) -> McdiRequest {
        McdiRequest {
            cmd,
            input: input.to_vec(),
            out_len,
            output: Vec::new(),
            state: McdiRequestState::Pending,
            errno: None,
        }
    }

    /// Build a request whose input is a list of little-endian dwords.
    pub fn with_dwords(cmd: u32, input: &[u32], out_len: usize) -> McdiRequest {
        let mut bytes = Vec::with_capacity(input.len() * 4);
        for word in input {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        McdiRequest::new(cmd, &bytes, out_len)
    }

    pub fn state(&self) -> McdiRequestState {
        self.state
    }

    /// MC errno of a failed request.
    pub fn errno(&self) -> Option<u32> {
        self.errno
    }

    /// Response payload, truncated to what the MC actually returned.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn out_u32(&self, offset: usize) -> Result<u32> {
        let bytes = self.output.get(offset..offset + 4).ok_or(SfvmkError::IoError)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn out_u16(&self, offset: usize) -> Result<u16> {
        let bytes = self.output.get(offset..offset + 2).ok_or(SfvmkError::IoError)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

/// Recovery hooks invoked by the transport.
pub trait McdiEvents {
    /// The watchdog expired; called once per timed-out request.
    fn mcdi_timeout(&self);
    /// The MC rebooted or asserted while a request was outstanding.
    fn mcdi_exception(&self, eme: McdiException);
}

pub struct Mcdi {
    nic: Arc<dyn Nic>,
    provider: Arc<dyn Provider>,
    mem: DmaMem,
    // held for the whole request/response exchange; guards the sequence number
    lock: Mutex<u8>,
    state: AtomicU8,
    cancel: AtomicBool,
}

impl Mcdi {
    pub(crate) fn init(provider: &Arc<dyn Provider>, nic: &Arc<dyn Nic>) -> Result<Mcdi> {
        let mem = DmaMem::alloc(provider, MCDI_BUF_LEN)?;
        nic.mcdi_init()?;
        drv_debug!("sfvmk mcdi: transport ready, buffer at {:#x}", mem.io_addr());
        Ok(Mcdi {
            nic: nic.clone(),
            provider: provider.clone(),
            mem,
            lock: Mutex::new(0),
            state: AtomicU8::new(McdiState::Initialized as u8),
            cancel: AtomicBool::new(false),
        })
    }

    pub(crate) fn fini(&self) {
        let _seq = self.lock.lock();
        if self.state() != McdiState::Uninitialized {
            self.set_state(McdiState::Uninitialized);
            self.nic.mcdi_fini();
        }
    }

    pub fn state(&self) -> McdiState {
        match self.state.load(Ordering::Acquire) {
            1 => McdiState::Initialized,
            2 => McdiState::Busy,
            _ => McdiState::Uninitialized,
        }
    }

    fn set_state(&self, state: McdiState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Abort the request currently being polled for, if any.
    pub fn cancel(&self) {
        if self.state() == McdiState::Busy {
            self.cancel.store(true, Ordering::Release);
        }
    }

    /// Send `req` and wait for the response or the watchdog.
    pub fn execute(&self, req: &mut McdiRequest, events: &dyn McdiEvents) -> Result {
        if req.input.len() > MCDI_MAX_PAYLOAD || req.out_len > MCDI_MAX_PAYLOAD {
            return Err(SfvmkError::BadParam);
        }

        let mut seq = self.lock.lock();
        if self.state() != McdiState::Initialized {
            drv_error!("sfvmk mcdi: command {:#x} issued in state {:?}", req.cmd, self.state());
            return Err(SfvmkError::InvalidState);
        }
        *seq = (*seq + 1) & MCDI_SEQ_MASK;
        self.set_state(McdiState::Busy);
        self.cancel.store(false, Ordering::Release);
        req.state = McdiRequestState::Pending;
        req.errno = None;
        req.output.clear();

        self.send(req, *seq);
        let result = self.wait(req, *seq, events);

        self.cancel.store(false, Ordering::Release);
        self.set_state(McdiState::Initialized);
        result
    }

    fn send(&self, req: &McdiRequest, seq: u8) {
        let hdr = McdiHeader {
            cmd: req.cmd,
            len: req.input.len(),
            seq,
            ..McdiHeader::default()
        };
        let [v1, v2] = hdr.encode();
        self.mem.write_u32(0, v1);
        self.mem.write_u32(4, v2);
        self.mem.write_bytes(MCDI_HDR_LEN, &req.input);
        self.nic.mcdi_doorbell(&self.mem, MCDI_HDR_LEN + req.input.len());
    }

    fn wait(&self, req: &mut McdiRequest, seq: u8, events: &dyn McdiEvents) -> Result {
        let mut backoff = Backoff::new(MCDI_POLL_MIN_US, MCDI_POLL_MAX_US, MCDI_WATCHDOG_US);
        loop {
            if let Some(eme) = self.nic.mcdi_poll_reboot() {
                drv_error!("sfvmk mcdi: MC exception {:?} during command {:#x}", eme, req.cmd);
                req.state = McdiRequestState::Failed;
                events.mcdi_exception(eme);
                return Err(SfvmkError::McReboot);
            }
            if let Some(result) = self.poll_response(req, seq) {
                return result;
            }
            if self.cancel.load(Ordering::Acquire) {
                drv_warn!("sfvmk mcdi: command {:#x} cancelled", req.cmd);
                req.state = McdiRequestState::Aborted;
                return Err(SfvmkError::Aborted);
            }
            if backoff.expired() {
                drv_error!(
                    "sfvmk mcdi: command {:#x} timed out after {}us",
                    req.cmd,
                    backoff.elapsed_us()
                );
                req.state = McdiRequestState::Aborted;
                events.mcdi_timeout();
                return Err(SfvmkError::Timeout);
            }
            self.provider.delay_us(backoff.next_interval());
        }
    }

    fn poll_response(&self, req: &mut McdiRequest, seq: u8) -> Option<Result> {
        let words = [self.mem.read_u32(0), self.mem.read_u32(4)];
        let hdr = McdiHeader::decode(words);
        if !hdr.response || hdr.seq != seq {
            return None;
        }
        if !McdiHeader::is_v2(words) || hdr.cmd != req.cmd {
            drv_error!("sfvmk mcdi: malformed response to command {:#x}", req.cmd);
            req.state = McdiRequestState::Failed;
            return Some(Err(SfvmkError::IoError));
        }
        if hdr.error {
            let errno = self.mem.read_u32(MCDI_HDR_LEN);
            drv_debug!("sfvmk mcdi: command {:#x} failed, errno {}", req.cmd, errno);
            req.errno = Some(errno);
            req.state = McdiRequestState::Failed;
            return Some(Err(SfvmkError::McdiFailed(errno)));
        }

        let len = min(min(hdr.len, req.out_len), MCDI_MAX_PAYLOAD);
        let mut output = vec![0u8; len];
        self.mem.read_bytes(MCDI_HDR_LEN, &mut output);
        req.output = output;
        req.state = McdiRequestState::Completed;
        Some(Ok(()))
    }
}

impl Drop for Mcdi {
    fn drop(&mut self) {
        self.fini();
    }
}
