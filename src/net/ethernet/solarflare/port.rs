//! Port: MAC bring-up, link state tracking and PHY link control over MCDI.

use super::adapter::Adapter;
use super::efx;
use super::mcdi::{McdiRequest, MC_CMD_GET_LINK, MC_CMD_SET_LINK};
use crate::net::ethernet::structs::{EthernetAddress, LinkMode, LinkStatus};
use crate::{Result, SfvmkError};
use bitflags::*;
use spin::Mutex;

const MC_CMD_GET_LINK_OUT_LEN: usize = 28;
const GET_LINK_OUT_CAP_OFST: usize = 0;
const GET_LINK_OUT_LINK_SPEED_OFST: usize = 8;
const GET_LINK_OUT_FLAGS_OFST: usize = 16;
const GET_LINK_OUT_LINK_UP_LBN: usize = 1;
const GET_LINK_OUT_FULL_DUPLEX_LBN: usize = 2;

const SET_LINK_IN_LOWPOWER: u32 = 1 << 0;

bitflags! {
    /// MCDI PHY capability bits.
    pub struct PhyCaps: u32 {
        const HDX10 = 1 << 1;
        const FDX10 = 1 << 2;
        const HDX100 = 1 << 3;
        const FDX100 = 1 << 4;
        const HDX1000 = 1 << 5;
        const FDX1000 = 1 << 6;
        const FDX10000 = 1 << 7;
        const PAUSE = 1 << 8;
        const ASYM = 1 << 9;
        const AN = 1 << 10;
        const FDX40000 = 1 << 11;
        const FDX100000 = 1 << 13;
        const FDX25000 = 1 << 14;
        const FDX50000 = 1 << 15;
    }
}

impl PhyCaps {
    pub fn speeds() -> PhyCaps {
        PhyCaps::all() - (PhyCaps::PAUSE | PhyCaps::ASYM | PhyCaps::AN)
    }

    /// Full-duplex capability for a fixed speed.
    pub fn for_speed(speed_mbps: u32) -> Option<PhyCaps> {
        Some(match speed_mbps {
            10 => PhyCaps::FDX10,
            100 => PhyCaps::FDX100,
            1000 => PhyCaps::FDX1000,
            10000 => PhyCaps::FDX10000,
            25000 => PhyCaps::FDX25000,
            40000 => PhyCaps::FDX40000,
            50000 => PhyCaps::FDX50000,
            100000 => PhyCaps::FDX100000,
            _ => return None,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PortState {
    Uninitialized,
    Initialized,
    Started,
}

struct PortInner {
    state: PortState,
    mac: EthernetAddress,
    link: LinkMode,
    // None until read back from the PHY
    adv_caps: Option<PhyCaps>,
}

pub struct Port {
    inner: Mutex<PortInner>,
}

impl Port {
    pub(crate) fn new(mac: EthernetAddress) -> Port {
        Port {
            inner: Mutex::new(PortInner {
                state: PortState::Initialized,
                mac,
                link: LinkMode::Unknown,
                adv_caps: None,
            }),
        }
    }

    pub fn state(&self) -> PortState {
        self.inner.lock().state
    }

    pub fn link_mode(&self) -> LinkMode {
        self.inner.lock().link
    }

    pub fn mac(&self) -> EthernetAddress {
        self.inner.lock().mac
    }
}

impl Adapter {
    pub(crate) fn port_start(&self) -> Result {
        let mac = {
            let inner = self.port.inner.lock();
            if inner.state != PortState::Initialized {
                return Err(SfvmkError::InvalidState);
            }
            inner.mac
        };

        self.nic.port_init()?;
        let result = self
            .nic
            .mac_pdu_set(efx::mac_pdu(self.mtu() as usize))
            .and_then(|_| self.nic.mac_addr_set(mac))
            .and_then(|_| self.nic.mac_filter_set(true, true, true, true))
            .and_then(|_| self.nic.mac_drain(false));
        if let Err(err) = result {
            drv_error!("sfvmk {}: port start failed: {}", self.name(), err);
            self.nic.port_fini();
            return Err(err);
        }

        self.port.inner.lock().state = PortState::Started;
        drv_debug!("sfvmk {}: port started, mac {}", self.name(), mac);
        Ok(())
    }

    pub(crate) fn port_stop(&self) {
        {
            let mut inner = self.port.inner.lock();
            if inner.state != PortState::Started {
                return;
            }
            inner.state = PortState::Initialized;
            inner.link = LinkMode::Unknown;
        }
        if let Err(err) = self.nic.mac_drain(true) {
            drv_warn!("sfvmk {}: MAC drain failed: {}", self.name(), err);
        }
        self.nic.port_fini();
    }

    /// Record a link change and tell the uplink about it.
    pub(crate) fn port_link_update(&self, mode: LinkMode) {
        {
            let mut inner = self.port.inner.lock();
            if inner.link == mode {
                return;
            }
            inner.link = mode;
        }
        let link = LinkStatus { mode };
        drv_info!(
            "sfvmk {}: link {} at {} Mbps",
            self.name(),
            if link.up() { "up" } else { "down" },
            link.speed_mbps()
        );
        self.provider.link_changed(link);
    }

    pub fn port_state(&self) -> PortState {
        self.port.state()
    }

    /// Query the PHY's current link state.
    pub fn link_status(&self) -> Result<LinkStatus> {
        let mut req = McdiRequest::new(MC_CMD_GET_LINK, &[], MC_CMD_GET_LINK_OUT_LEN);
        self.mcdi_execute(&mut req)?;
        let flags = req.out_u32(GET_LINK_OUT_FLAGS_OFST)?;
        let speed = req.out_u32(GET_LINK_OUT_LINK_SPEED_OFST)?;
        let caps = PhyCaps::from_bits_truncate(req.out_u32(GET_LINK_OUT_CAP_OFST)?);
        self.port.inner.lock().adv_caps = Some(caps);

        let mode = if flags & (1 << GET_LINK_OUT_LINK_UP_LBN) == 0 {
            LinkMode::Down
        } else {
            LinkMode::from_speed(speed, flags & (1 << GET_LINK_OUT_FULL_DUPLEX_LBN) != 0)
        };
        Ok(LinkStatus { mode })
    }

    fn link_set(&self, caps: PhyCaps, flags: u32) -> Result {
        let mut req = McdiRequest::with_dwords(MC_CMD_SET_LINK, &[caps.bits(), flags, 0, 0], 0);
        self.mcdi_execute(&mut req)
    }

    fn adv_caps(&self) -> Result<PhyCaps> {
        let cached = self.port.inner.lock().adv_caps;
        match cached {
            Some(caps) => Ok(caps),
            None => {
                self.link_status()?;
                Ok(self.port.inner.lock().adv_caps.unwrap_or_else(PhyCaps::empty))
            }
        }
    }

    /// Bring the PHY link up with the advertised capabilities, or power it down.
    pub fn link_set_state(&self, up: bool) -> Result {
        if up {
            let mut caps = self.adv_caps()?;
            if (caps & PhyCaps::speeds()).is_empty() {
                caps |= PhyCaps::speeds() | PhyCaps::AN | PhyCaps::PAUSE;
            }
            self.link_set(caps, 0)
        } else {
            self.link_set(PhyCaps::empty(), SET_LINK_IN_LOWPOWER)
        }
    }

    /// Current speed and whether autonegotiation is advertised.
    pub fn link_speed(&self) -> Result<(u32, bool)> {
        let status = self.link_status()?;
        let caps = self.adv_caps()?;
        Ok((status.speed_mbps(), caps.contains(PhyCaps::AN)))
    }

    /// Advertise either everything (autoneg) or a single fixed speed.
    pub fn link_speed_set(&self, speed_mbps: u32, autoneg: bool) -> Result {
        let caps = if autoneg {
            PhyCaps::speeds() | PhyCaps::AN | PhyCaps::PAUSE
        } else {
            PhyCaps::for_speed(speed_mbps).ok_or(SfvmkError::BadParam)? | PhyCaps::PAUSE
        };
        self.link_set(caps, 0)?;
        self.port.inner.lock().adv_caps = Some(caps);
        Ok(())
    }
}
