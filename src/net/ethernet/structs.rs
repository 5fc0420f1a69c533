use core::fmt;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct EthernetAddress(pub [u8; 6]);

impl EthernetAddress {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0 && self.0 != [0; 6]
    }
}

impl fmt::Display for EthernetAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Negotiated link mode as reported by the NIC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LinkMode {
    Unknown,
    Down,
    Hdx10,
    Fdx10,
    Hdx100,
    Fdx100,
    Hdx1000,
    Fdx1000,
    Fdx10000,
    Fdx25000,
    Fdx40000,
    Fdx50000,
    Fdx100000,
}

impl LinkMode {
    pub fn speed_mbps(&self) -> u32 {
        match self {
            LinkMode::Unknown | LinkMode::Down => 0,
            LinkMode::Hdx10 | LinkMode::Fdx10 => 10,
            LinkMode::Hdx100 | LinkMode::Fdx100 => 100,
            LinkMode::Hdx1000 | LinkMode::Fdx1000 => 1000,
            LinkMode::Fdx10000 => 10000,
            LinkMode::Fdx25000 => 25000,
            LinkMode::Fdx40000 => 40000,
            LinkMode::Fdx50000 => 50000,
            LinkMode::Fdx100000 => 100000,
        }
    }

    pub fn is_up(&self) -> bool {
        self.speed_mbps() != 0
    }

    pub fn full_duplex(&self) -> bool {
        !matches!(
            self,
            LinkMode::Hdx10 | LinkMode::Hdx100 | LinkMode::Hdx1000
        )
    }

    pub fn from_speed(speed_mbps: u32, full_duplex: bool) -> LinkMode {
        match (speed_mbps, full_duplex) {
            (10, false) => LinkMode::Hdx10,
            (10, true) => LinkMode::Fdx10,
            (100, false) => LinkMode::Hdx100,
            (100, true) => LinkMode::Fdx100,
            (1000, false) => LinkMode::Hdx1000,
            (1000, true) => LinkMode::Fdx1000,
            (10000, _) => LinkMode::Fdx10000,
            (25000, _) => LinkMode::Fdx25000,
            (40000, _) => LinkMode::Fdx40000,
            (50000, _) => LinkMode::Fdx50000,
            (100000, _) => LinkMode::Fdx100000,
            (0, _) => LinkMode::Down,
            _ => LinkMode::Unknown,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinkStatus {
    pub mode: LinkMode,
}

impl LinkStatus {
    pub fn up(&self) -> bool {
        self.mode.is_up()
    }

    pub fn speed_mbps(&self) -> u32 {
        self.mode.speed_mbps()
    }
}
