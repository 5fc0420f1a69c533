//! Solarflare SFC network adapter driver core for a hypervisor uplink framework.
//!
//! The crate owns the event queue, receive/transmit ring and MCDI machinery.
//! Everything the hypervisor provides (DMA, packets, interrupts, uplink
//! callbacks) is reached through [`provider::Provider`]; everything the NIC
//! hardware library provides is reached through
//! [`net::ethernet::solarflare::efx::Nic`].

#![no_std]

extern crate alloc;

#[cfg(feature = "log")]
#[macro_use]
extern crate log;

#[macro_use]
mod logging;

pub mod dma;
pub mod error;
pub mod net;
pub mod provider;
pub mod util;

pub use error::{Result, SfvmkError, Status};
