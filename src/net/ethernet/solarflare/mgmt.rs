//! Management channel: typed requests addressed to an adapter by name.
//!
//! Every request reports its outcome twice. The dispatcher's `Result` says
//! whether the request could be routed at all; `MgmtDevInfo::status` says
//! whether the requested operation succeeded.

use super::adapter::Adapter;
use super::driver::{DriverContext, SFVMK_DEV_NAME_MAX};
use super::mcdi::{McdiRequest, MCDI_MAX_PAYLOAD};
use super::nvram::{NvramOp, NvramType, VersionType, NVRAM_MAX_PAYLOAD};
use super::vpd::VPD_MAX_PAYLOAD;
use crate::net::ethernet::structs::EthernetAddress;
use crate::provider::PciInfo;
use crate::{Result, SfvmkError, Status};
use alloc::string::String;
use alloc::vec::Vec;
use core::cmp::min;
use core::fmt::Write;
use core::sync::atomic::Ordering;

pub const MCDI_PAYLOAD_WORDS: usize = 255;
/// Set in [`McdiRequest2::flags`] when the MC rejected the command.
pub const EFX_MCDI_REQUEST_ERROR: u16 = 0x0001;

/// Callback identifiers of the management interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MgmtCallback {
    McdiRequest = 1,
    NvramRequest,
    VerInfoGet,
    LinkStatusUpdate,
    LinkSpeedUpdate,
    IntrModeration,
    PciInfoGet,
    VpdRequest,
    McLogging,
    ImgUpdate,
    HwQueueStats,
    MacAddress,
    IfaceList,
    ImgUpdateV2,
    FecMode,
    SensorInfo,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MgmtDevInfo {
    pub device_name: String,
    pub status: Status,
}

impl MgmtDevInfo {
    pub fn new(device_name: &str) -> MgmtDevInfo {
        MgmtDevInfo {
            device_name: String::from(device_name),
            status: Status::Ok,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MgmtOp {
    Get = 1,
    Set = 2,
}

/// Raw MCDI pass-through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct McdiRequest2 {
    pub cmd: u16,
    pub inlen: u16,
    pub outlen: u16,
    pub flags: u16,
    pub host_errno: u32,
    pub payload: [u32; MCDI_PAYLOAD_WORDS],
}

impl McdiRequest2 {
    pub fn new(cmd: u16, input: &[u32], outlen: u16) -> McdiRequest2 {
        let mut payload = [0u32; MCDI_PAYLOAD_WORDS];
        let n = min(input.len(), MCDI_PAYLOAD_WORDS);
        payload[..n].copy_from_slice(&input[..n]);
        McdiRequest2 {
            cmd,
            inlen: (n * 4) as u16,
            outlen,
            flags: 0,
            host_errno: 0,
            payload,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NvramCmd {
    pub op: u32,
    pub ty: u32,
    pub offset: u32,
    pub size: u32,
    pub subtype: u32,
    pub version: [u16; 4],
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    pub ty: u32,
    pub version: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkStatusParam {
    pub op: MgmtOp,
    pub state: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkSpeedParam {
    pub op: MgmtOp,
    pub speed: u32,
    pub autoneg: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IntrCoalsParam {
    pub op: MgmtOp,
    pub rx_usecs: u32,
    pub rx_max_frames: u32,
    pub tx_usecs: u32,
    pub tx_max_frames: u32,
    pub use_adaptive_rx: bool,
    pub use_adaptive_tx: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VpdInfo {
    pub op: MgmtOp,
    pub tag: u8,
    pub keyword: u16,
    pub payload: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct McLoggingParam {
    pub op: MgmtOp,
    pub state: bool,
}

/// Request body, one variant per callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MgmtPayload {
    McdiRequest(McdiRequest2),
    NvramRequest(NvramCmd),
    VerInfoGet(VersionInfo),
    LinkStatusUpdate(LinkStatusParam),
    LinkSpeedUpdate(LinkSpeedParam),
    IntrModeration(IntrCoalsParam),
    PciInfoGet(PciInfo),
    VpdRequest(VpdInfo),
    McLogging(McLoggingParam),
    HwQueueStats(String),
    MacAddress(EthernetAddress),
    IfaceList(Vec<String>),
    ImgUpdate,
    ImgUpdateV2,
    FecMode,
    SensorInfo,
}

impl MgmtPayload {
    pub fn callback(&self) -> MgmtCallback {
        match self {
            MgmtPayload::McdiRequest(_) => MgmtCallback::McdiRequest,
            MgmtPayload::NvramRequest(_) => MgmtCallback::NvramRequest,
            MgmtPayload::VerInfoGet(_) => MgmtCallback::VerInfoGet,
            MgmtPayload::LinkStatusUpdate(_) => MgmtCallback::LinkStatusUpdate,
            MgmtPayload::LinkSpeedUpdate(_) => MgmtCallback::LinkSpeedUpdate,
            MgmtPayload::IntrModeration(_) => MgmtCallback::IntrModeration,
            MgmtPayload::PciInfoGet(_) => MgmtCallback::PciInfoGet,
            MgmtPayload::VpdRequest(_) => MgmtCallback::VpdRequest,
            MgmtPayload::McLogging(_) => MgmtCallback::McLogging,
            MgmtPayload::HwQueueStats(_) => MgmtCallback::HwQueueStats,
            MgmtPayload::MacAddress(_) => MgmtCallback::MacAddress,
            MgmtPayload::IfaceList(_) => MgmtCallback::IfaceList,
            MgmtPayload::ImgUpdate => MgmtCallback::ImgUpdate,
            MgmtPayload::ImgUpdateV2 => MgmtCallback::ImgUpdateV2,
            MgmtPayload::FecMode => MgmtCallback::FecMode,
            MgmtPayload::SensorInfo => MgmtCallback::SensorInfo,
        }
    }
}

impl DriverContext {
    /// Route one management request to the adapter named in `dev`.
    pub fn mgmt_dispatch(&self, dev: &mut MgmtDevInfo, payload: &mut MgmtPayload) -> Result {
        if dev.device_name.len() > SFVMK_DEV_NAME_MAX {
            dev.status = Status::BadParam;
            return Err(SfvmkError::BadParam);
        }
        if let MgmtPayload::IfaceList(names) = payload {
            *names = self.adapter_names();
            dev.status = Status::Ok;
            return Ok(());
        }

        let adapter = match self.lookup(&dev.device_name) {
            Some(adapter) => adapter,
            None => {
                drv_error!("sfvmk mgmt: no adapter named {}", dev.device_name);
                dev.status = Status::NotFound;
                return Ok(());
            }
        };

        let callback = payload.callback();
        let result = adapter.mgmt_handle(payload);
        dev.status = match result {
            Ok(()) => Status::Ok,
            Err(err) => {
                drv_debug!("sfvmk {}: {:?} request failed: {}", adapter.name(), callback, err);
                err.status()
            }
        };
        Ok(())
    }
}

impl Adapter {
    fn mgmt_handle(&self, payload: &mut MgmtPayload) -> Result {
        match payload {
            MgmtPayload::McdiRequest(req) => self.mgmt_mcdi(req),
            MgmtPayload::NvramRequest(cmd) => self.mgmt_nvram(cmd),
            MgmtPayload::VerInfoGet(info) => {
                let ty = VersionType::from_u32(info.ty).ok_or(SfvmkError::BadParam)?;
                info.version = self.version_string(ty)?;
                Ok(())
            }
            MgmtPayload::LinkStatusUpdate(param) => match param.op {
                MgmtOp::Get => {
                    param.state = self.link_status()?.up();
                    Ok(())
                }
                MgmtOp::Set => self.link_set_state(param.state),
            },
            MgmtPayload::LinkSpeedUpdate(param) => match param.op {
                MgmtOp::Get => {
                    let (speed, autoneg) = self.link_speed()?;
                    param.speed = speed;
                    param.autoneg = autoneg;
                    Ok(())
                }
                MgmtOp::Set => self.link_speed_set(param.speed, param.autoneg),
            },
            MgmtPayload::IntrModeration(param) => self.mgmt_intr_moderation(param),
            MgmtPayload::PciInfoGet(info) => {
                *info = self.provider.pci_info();
                Ok(())
            }
            MgmtPayload::VpdRequest(info) => match info.op {
                MgmtOp::Get => {
                    info.payload = self.vpd_get_by_tag(info.tag, info.keyword)?;
                    Ok(())
                }
                MgmtOp::Set => {
                    if info.payload.len() > VPD_MAX_PAYLOAD {
                        return Err(SfvmkError::BadParam);
                    }
                    self.vpd_set_by_tag(info.tag, info.keyword, &info.payload)
                }
            },
            MgmtPayload::McLogging(param) => {
                match param.op {
                    MgmtOp::Get => param.state = self.mc_logging.load(Ordering::Acquire),
                    MgmtOp::Set => {
                        self.mc_logging.store(param.state, Ordering::Release);
                        drv_info!("sfvmk {}: MC logging {}", self.name(), param.state);
                    }
                }
                Ok(())
            }
            MgmtPayload::HwQueueStats(out) => {
                *out = self.hw_queue_stats();
                Ok(())
            }
            MgmtPayload::MacAddress(mac) => {
                *mac = self.mac();
                Ok(())
            }
            // Handled by the dispatcher without an adapter
            MgmtPayload::IfaceList(_) => Ok(()),
            MgmtPayload::ImgUpdate
            | MgmtPayload::ImgUpdateV2
            | MgmtPayload::FecMode
            | MgmtPayload::SensorInfo => Err(SfvmkError::NotSupported),
        }
    }

    fn mgmt_mcdi(&self, req: &mut McdiRequest2) -> Result {
        let inlen = usize::from(req.inlen);
        let outlen = usize::from(req.outlen);
        if inlen > MCDI_MAX_PAYLOAD || outlen > MCDI_MAX_PAYLOAD {
            drv_error!("sfvmk {}: MCDI request lengths {}/{} invalid", self.name(), inlen, outlen);
            return Err(SfvmkError::BadParam);
        }

        let mut input = Vec::with_capacity(MCDI_MAX_PAYLOAD);
        for word in req.payload.iter() {
            input.extend_from_slice(&word.to_le_bytes());
        }
        input.truncate(inlen);

        let mut mcdi = McdiRequest::new(u32::from(req.cmd), &input, outlen);
        req.flags &= !EFX_MCDI_REQUEST_ERROR;
        req.host_errno = 0;
        match self.mcdi_execute(&mut mcdi) {
            Ok(()) => {}
            Err(SfvmkError::McdiFailed(errno)) => {
                req.flags |= EFX_MCDI_REQUEST_ERROR;
                req.host_errno = errno;
                req.outlen = 0;
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let output = mcdi.output();
        req.payload = [0; MCDI_PAYLOAD_WORDS];
        for (word, bytes) in req.payload.iter_mut().zip(output.chunks(4)) {
            let mut le = [0u8; 4];
            le[..bytes.len()].copy_from_slice(bytes);
            *word = u32::from_le_bytes(le);
        }
        req.outlen = output.len() as u16;
        Ok(())
    }

    fn mgmt_nvram(&self, cmd: &mut NvramCmd) -> Result {
        let op = NvramOp::from_u32(cmd.op).ok_or(SfvmkError::BadParam)?;
        let ty = NvramType::from_u32(cmd.ty).ok_or(SfvmkError::BadParam)?;
        let size = cmd.size as usize;
        match op {
            NvramOp::Size => {
                cmd.size = self.nvram_size(ty)? as u32;
            }
            NvramOp::Read => {
                if size > NVRAM_MAX_PAYLOAD {
                    return Err(SfvmkError::BadParam);
                }
                let mut data = alloc::vec![0u8; size];
                self.nvram_read(ty, cmd.offset as usize, &mut data)?;
                cmd.data = data;
            }
            NvramOp::Write => {
                if size > NVRAM_MAX_PAYLOAD || size > cmd.data.len() {
                    return Err(SfvmkError::BadParam);
                }
                self.nvram_write(ty, cmd.offset as usize, &cmd.data[..size])?;
            }
            NvramOp::Erase => self.nvram_erase(ty)?,
            NvramOp::GetVer => {
                let ver = self.nvram_get_version(ty)?;
                cmd.subtype = ver.subtype;
                cmd.version = ver.version;
            }
            NvramOp::SetVer => return Err(SfvmkError::NotSupported),
        }
        Ok(())
    }

    fn mgmt_intr_moderation(&self, param: &mut IntrCoalsParam) -> Result {
        match param.op {
            MgmtOp::Get => {
                let us = self.intr_moderation();
                *param = IntrCoalsParam {
                    op: MgmtOp::Get,
                    rx_usecs: us,
                    tx_usecs: us,
                    rx_max_frames: 0,
                    tx_max_frames: 0,
                    use_adaptive_rx: false,
                    use_adaptive_tx: false,
                };
                Ok(())
            }
            MgmtOp::Set => {
                if param.use_adaptive_rx
                    || param.use_adaptive_tx
                    || param.rx_max_frames != 0
                    || param.tx_max_frames != 0
                {
                    return Err(SfvmkError::NotSupported);
                }
                // RX and TX share the event queues, so one value covers both
                if param.tx_usecs != 0 && param.tx_usecs != param.rx_usecs {
                    return Err(SfvmkError::BadParam);
                }
                self.set_intr_moderation(param.rx_usecs)
            }
        }
    }

    /// Per-queue counters, one line per queue.
    pub fn hw_queue_stats(&self) -> String {
        let mut out = String::new();
        for rxq in self.rxqs() {
            let s = rxq.stats();
            let _ = writeln!(out, "rxq{}: packets {} bytes {} drops {}", rxq.index(), s.packets, s.bytes, s.drops);
        }
        for txq in self.txqs() {
            let s = txq.stats();
            let _ = writeln!(out, "txq{}: packets {} bytes {} drops {}", txq.index(), s.packets, s.bytes, s.drops);
        }
        out
    }
}
