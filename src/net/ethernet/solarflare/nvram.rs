//! NVRAM partition access and firmware version reporting over MCDI.

use super::adapter::Adapter;
use super::mcdi::{
    McdiRequest, MC_CMD_GET_VERSION, MC_CMD_NVRAM_ERASE, MC_CMD_NVRAM_INFO, MC_CMD_NVRAM_METADATA,
    MC_CMD_NVRAM_READ, MC_CMD_NVRAM_UPDATE_FINISH, MC_CMD_NVRAM_UPDATE_START, MC_CMD_NVRAM_WRITE,
};
use crate::{Result, SfvmkError};
use alloc::format;
use alloc::string::{String, ToString};
use core::cmp::min;

/// Largest buffer one management NVRAM request may carry.
pub const NVRAM_MAX_PAYLOAD: usize = 32 * 1024;
/// Bytes moved per READ/WRITE command.
pub const NVRAM_CHUNK: usize = 0x80;

pub const NVRAM_INFO_OUT_LEN: usize = 16;
pub const NVRAM_INFO_OUT_SIZE_OFST: usize = 4;
pub const NVRAM_INFO_OUT_ERASESIZE_OFST: usize = 8;
pub const NVRAM_METADATA_OUT_LEN: usize = 20;
pub const NVRAM_METADATA_OUT_FLAGS_OFST: usize = 4;
pub const NVRAM_METADATA_OUT_SUBTYPE_OFST: usize = 8;
pub const NVRAM_METADATA_OUT_VERSION_OFST: usize = 12;
pub const NVRAM_METADATA_OUT_VERSION_VALID: u32 = 1 << 1;
pub const GET_VERSION_OUT_LEN: usize = 32;
pub const GET_VERSION_OUT_VERSION_OFST: usize = 24;

/// NVRAM partition as named on the management channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NvramType {
    BootRom = 1,
    BootRomCfg = 2,
    Mc = 3,
    McGolden = 4,
    Phy = 5,
    NullPhy = 6,
    Fpga = 7,
    Fcfw = 8,
    Cpld = 9,
    FpgaBackup = 10,
    UefiRom = 11,
    DynamicCfg = 12,
}

impl NvramType {
    pub fn from_u32(v: u32) -> Option<NvramType> {
        Some(match v {
            1 => NvramType::BootRom,
            2 => NvramType::BootRomCfg,
            3 => NvramType::Mc,
            4 => NvramType::McGolden,
            5 => NvramType::Phy,
            6 => NvramType::NullPhy,
            7 => NvramType::Fpga,
            8 => NvramType::Fcfw,
            9 => NvramType::Cpld,
            10 => NvramType::FpgaBackup,
            11 => NvramType::UefiRom,
            12 => NvramType::DynamicCfg,
            _ => return None,
        })
    }

    /// Firmware partition id, if the partition exists on this NIC family.
    pub fn partition(&self) -> Option<u32> {
        match self {
            NvramType::Mc => Some(0x100),
            NvramType::McGolden => Some(0x200),
            NvramType::BootRom => Some(0x300),
            NvramType::DynamicCfg => Some(0x500),
            NvramType::BootRomCfg => Some(0x600),
            NvramType::Phy => Some(0x900),
            NvramType::Fpga => Some(0xb00),
            NvramType::FpgaBackup => Some(0xb01),
            NvramType::Fcfw => Some(0xc00),
            NvramType::Cpld => Some(0xc01),
            NvramType::UefiRom => Some(0xd00),
            NvramType::NullPhy => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NvramOp {
    Size = 1,
    Read = 2,
    Write = 3,
    Erase = 4,
    GetVer = 5,
    SetVer = 6,
}

impl NvramOp {
    pub fn from_u32(v: u32) -> Option<NvramOp> {
        Some(match v {
            1 => NvramOp::Size,
            2 => NvramOp::Read,
            3 => NvramOp::Write,
            4 => NvramOp::Erase,
            5 => NvramOp::GetVer,
            6 => NvramOp::SetVer,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct NvramVersion {
    pub subtype: u32,
    pub version: [u16; 4],
}

/// Which version string to report.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VersionType {
    Driver = 1,
    Firmware = 2,
    BootRom = 4,
    UefiRom = 8,
}

impl VersionType {
    pub fn from_u32(v: u32) -> Option<VersionType> {
        Some(match v {
            1 => VersionType::Driver,
            2 => VersionType::Firmware,
            4 => VersionType::BootRom,
            8 => VersionType::UefiRom,
            _ => return None,
        })
    }
}

pub fn format_version(v: [u16; 4]) -> String {
    format!("{}.{}.{}.{}", v[0], v[1], v[2], v[3])
}

fn partition(ty: NvramType) -> Result<u32> {
    ty.partition().ok_or(SfvmkError::NotSupported)
}

impl Adapter {
    fn nvram_simple(&self, cmd: u32, input: &[u32]) -> Result {
        let mut req = McdiRequest::with_dwords(cmd, input, 0);
        self.mcdi_execute(&mut req)
    }

    fn nvram_info(&self, partn: u32) -> Result<(usize, usize)> {
        let mut req = McdiRequest::with_dwords(MC_CMD_NVRAM_INFO, &[partn], NVRAM_INFO_OUT_LEN);
        self.mcdi_execute(&mut req)?;
        let size = req.out_u32(NVRAM_INFO_OUT_SIZE_OFST)? as usize;
        let erase_size = req.out_u32(NVRAM_INFO_OUT_ERASESIZE_OFST)? as usize;
        Ok((size, erase_size))
    }

    // Run `op` between UPDATE_START and UPDATE_FINISH; FINISH is sent even if `op` fails.
    fn nvram_update<T>(&self, partn: u32, op: impl FnOnce() -> Result<T>) -> Result<T> {
        self.nvram_simple(MC_CMD_NVRAM_UPDATE_START, &[partn])?;
        let result = op();
        let finish = self.nvram_simple(MC_CMD_NVRAM_UPDATE_FINISH, &[partn, 0]);
        let value = result?;
        finish.map(|_| value)
    }

    fn nvram_check_range(&self, partn: u32, offset: usize, len: usize) -> Result<usize> {
        let (size, _) = self.nvram_info(partn)?;
        if offset.checked_add(len).map_or(true, |end| end > size) {
            drv_error!(
                "sfvmk {}: NVRAM {:#x} access {}+{} beyond size {}",
                self.name(),
                partn,
                offset,
                len,
                size
            );
            return Err(SfvmkError::BadParam);
        }
        Ok(size)
    }

    /// Size in bytes of an NVRAM partition.
    pub fn nvram_size(&self, ty: NvramType) -> Result<usize> {
        let partn = partition(ty)?;
        self.nvram_info(partn).map(|(size, _)| size)
    }

    pub fn nvram_read(&self, ty: NvramType, offset: usize, buf: &mut [u8]) -> Result {
        let partn = partition(ty)?;
        self.nvram_check_range(partn, offset, buf.len())?;
        self.nvram_update(partn, || {
            let mut done = 0;
            while done < buf.len() {
                let len = min(NVRAM_CHUNK, buf.len() - done);
                let mut req = McdiRequest::with_dwords(
                    MC_CMD_NVRAM_READ,
                    &[partn, (offset + done) as u32, len as u32],
                    len,
                );
                self.mcdi_execute(&mut req)?;
                if req.output().len() < len {
                    return Err(SfvmkError::IoError);
                }
                buf[done..done + len].copy_from_slice(&req.output()[..len]);
                done += len;
            }
            Ok(())
        })
    }

    pub fn nvram_write(&self, ty: NvramType, offset: usize, data: &[u8]) -> Result {
        let partn = partition(ty)?;
        self.nvram_check_range(partn, offset, data.len())?;
        self.nvram_update(partn, || {
            for (i, chunk) in data.chunks(NVRAM_CHUNK).enumerate() {
                let mut input = [0u8; 12 + NVRAM_CHUNK];
                input[0..4].copy_from_slice(&partn.to_le_bytes());
                input[4..8].copy_from_slice(&((offset + i * NVRAM_CHUNK) as u32).to_le_bytes());
                input[8..12].copy_from_slice(&(chunk.len() as u32).to_le_bytes());
                input[12..12 + chunk.len()].copy_from_slice(chunk);
                let mut req = McdiRequest::new(MC_CMD_NVRAM_WRITE, &input[..12 + chunk.len()], 0);
                self.mcdi_execute(&mut req)?;
            }
            Ok(())
        })
    }

    /// Erase a whole partition.
    pub fn nvram_erase(&self, ty: NvramType) -> Result {
        let partn = partition(ty)?;
        let (size, _) = self.nvram_info(partn)?;
        self.nvram_update(partn, || {
            self.nvram_simple(MC_CMD_NVRAM_ERASE, &[partn, 0, size as u32])
        })?;
        drv_info!("sfvmk {}: NVRAM {:?} erased ({} bytes)", self.name(), ty, size);
        Ok(())
    }

    pub fn nvram_get_version(&self, ty: NvramType) -> Result<NvramVersion> {
        let partn = partition(ty)?;
        let mut req = McdiRequest::with_dwords(MC_CMD_NVRAM_METADATA, &[partn], NVRAM_METADATA_OUT_LEN);
        self.mcdi_execute(&mut req)?;
        let subtype = req.out_u32(NVRAM_METADATA_OUT_SUBTYPE_OFST)?;
        let mut version = [0u16; 4];
        if req.out_u32(NVRAM_METADATA_OUT_FLAGS_OFST)? & NVRAM_METADATA_OUT_VERSION_VALID != 0 {
            for (i, v) in version.iter_mut().enumerate() {
                *v = req.out_u16(NVRAM_METADATA_OUT_VERSION_OFST + 2 * i)?;
            }
        }
        Ok(NvramVersion { subtype, version })
    }

    /// Running MC firmware version.
    pub fn fw_version(&self) -> Result<[u16; 4]> {
        let mut req = McdiRequest::new(MC_CMD_GET_VERSION, &[], GET_VERSION_OUT_LEN);
        self.mcdi_execute(&mut req)?;
        let mut version = [0u16; 4];
        for (i, v) in version.iter_mut().enumerate() {
            *v = req.out_u16(GET_VERSION_OUT_VERSION_OFST + 2 * i)?;
        }
        Ok(version)
    }

    pub fn version_string(&self, ty: VersionType) -> Result<String> {
        match ty {
            VersionType::Driver => Ok(env!("CARGO_PKG_VERSION").to_string()),
            VersionType::Firmware => self.fw_version().map(format_version),
            VersionType::BootRom => self
                .nvram_get_version(NvramType::BootRom)
                .map(|v| format_version(v.version)),
            VersionType::UefiRom => self
                .nvram_get_version(NvramType::UefiRom)
                .map(|v| format_version(v.version)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_format() {
        assert_eq!(format_version([6, 2, 7, 1001]), "6.2.7.1001");
    }

    #[test]
    fn type_table() {
        assert_eq!(NvramType::from_u32(12), Some(NvramType::DynamicCfg));
        assert_eq!(NvramType::from_u32(13), None);
        assert_eq!(NvramType::Mc.partition(), Some(0x100));
        assert_eq!(NvramType::NullPhy.partition(), None);
        assert_eq!(NvramOp::from_u32(6), Some(NvramOp::SetVer));
        assert_eq!(VersionType::from_u32(3), None);
    }
}
