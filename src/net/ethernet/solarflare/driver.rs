//! Driver-wide context: configuration and the adapter table.

use super::adapter::Adapter;
use super::efx::Nic;
use super::uplink::UplinkState;
use crate::provider::Provider;
use crate::{Result, SfvmkError};
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub const SFVMK_NUM_RXQ_DESC: u32 = 1024;
pub const SFVMK_NUM_TXQ_DESC: u32 = 1024;
pub const SFVMK_ADAPTER_TABLE_SIZE: usize = 64;
/// Longest uplink name, excluding the terminator.
pub const SFVMK_DEV_NAME_MAX: usize = 9;

const RING_ENTRIES_MIN: u32 = 512;
const RING_ENTRIES_MAX: u32 = 4096;
pub(crate) const MTU_MIN: u32 = 68;
pub(crate) const MTU_MAX: u32 = 9000;

#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub rx_ring_entries: u32,
    pub tx_ring_entries: u32,
    pub evqs_desired: u32,
    pub intr_moderation_us: u32,
    pub mtu: u32,
    pub rx_csum_ipv4: bool,
    pub rx_csum_ipv6: bool,
    pub tso: bool,
    pub max_adapters: usize,
}

impl Default for DriverConfig {
    fn default() -> DriverConfig {
        DriverConfig {
            rx_ring_entries: SFVMK_NUM_RXQ_DESC,
            tx_ring_entries: SFVMK_NUM_TXQ_DESC,
            evqs_desired: 4,
            intr_moderation_us: 30,
            mtu: 1500,
            rx_csum_ipv4: true,
            rx_csum_ipv6: true,
            tso: true,
            max_adapters: SFVMK_ADAPTER_TABLE_SIZE,
        }
    }
}

impl DriverConfig {
    /// Sanity-check module parameters. The TX ring size is checked for a
    /// power of two when the TX queues are created.
    pub fn validate(&self) -> Result {
        let in_range = |n: u32| (RING_ENTRIES_MIN..=RING_ENTRIES_MAX).contains(&n);
        if !self.rx_ring_entries.is_power_of_two() {
            return Err(SfvmkError::NotPowerOfTwo(self.rx_ring_entries));
        }
        if !in_range(self.rx_ring_entries) || !in_range(self.tx_ring_entries) {
            return Err(SfvmkError::BadParam);
        }
        if self.evqs_desired == 0 || !(MTU_MIN..=MTU_MAX).contains(&self.mtu) {
            return Err(SfvmkError::BadParam);
        }
        if self.max_adapters == 0 {
            return Err(SfvmkError::BadParam);
        }
        Ok(())
    }
}

/// Stable index of an adapter in the driver table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdapterId(usize);

impl AdapterId {
    pub fn index(&self) -> usize {
        self.0
    }
}

struct AdapterTable {
    slots: Vec<Option<Arc<Adapter>>>,
    by_name: BTreeMap<String, AdapterId>,
}

impl AdapterTable {
    /// Whether `name` may take a slot, given the table as it stands now.
    fn admit(&self, name: &str, max_adapters: usize) -> Result {
        if self.by_name.contains_key(name) {
            drv_error!("sfvmk: {} is already attached", name);
            return Err(SfvmkError::Busy);
        }
        if self.slots.iter().filter(|s| s.is_some()).count() >= max_adapters {
            drv_error!("sfvmk: adapter table full");
            return Err(SfvmkError::NoSpace);
        }
        Ok(())
    }
}

/// State shared by every adapter the driver binds.
pub struct DriverContext {
    config: DriverConfig,
    table: Mutex<AdapterTable>,
}

impl DriverContext {
    pub fn new(config: DriverConfig) -> Result<Arc<DriverContext>> {
        config.validate()?;
        drv_info!("sfvmk: driver context created, {} adapter slots", config.max_adapters);
        Ok(Arc::new(DriverContext {
            config,
            table: Mutex::new(AdapterTable {
                slots: Vec::new(),
                by_name: BTreeMap::new(),
            }),
        }))
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Bring up a PCI function and register it as an uplink.
    pub fn attach(
        &self,
        name: &str,
        provider: Arc<dyn Provider>,
        nic: Arc<dyn Nic>,
    ) -> Result<AdapterId> {
        if name.is_empty() || name.len() > SFVMK_DEV_NAME_MAX {
            return Err(SfvmkError::BadParam);
        }
        self.table.lock().admit(name, self.config.max_adapters)?;

        // Bring-up runs unlocked, so a concurrent attach may have claimed
        // the name or the last slot in the meantime
        let adapter = Arc::new(Adapter::attach(&self.config, name, provider, nic)?);

        let mut table = self.table.lock();
        if let Err(err) = table.admit(name, self.config.max_adapters) {
            drop(table);
            drop(adapter);
            return Err(err);
        }
        let slot = match table.slots.iter().position(|s| s.is_none()) {
            Some(slot) => slot,
            None => {
                table.slots.push(None);
                table.slots.len() - 1
            }
        };
        let id = AdapterId(slot);
        adapter.set_uplink_state(UplinkState::Registered);
        table.slots[slot] = Some(adapter);
        table.by_name.insert(name.to_string(), id);
        drv_info!("sfvmk: {} attached as adapter {}", name, slot);
        Ok(id)
    }

    /// Unregister an adapter, quiescing it first if it is running.
    pub fn detach(&self, id: AdapterId) -> Result {
        let adapter = {
            let mut table = self.table.lock();
            let adapter = table
                .slots
                .get_mut(id.0)
                .and_then(|s| s.take())
                .ok_or(SfvmkError::NotFound)?;
            table.by_name.remove(adapter.name());
            adapter
        };
        if adapter.uplink_state() == UplinkState::Started {
            if let Err(err) = adapter.quiesce_io() {
                drv_error!("sfvmk: {} quiesce on detach failed: {}", adapter.name(), err);
            }
        }
        adapter.set_uplink_state(UplinkState::Uninitialized);
        drv_info!("sfvmk: {} detached", adapter.name());
        Ok(())
    }

    pub fn adapter(&self, id: AdapterId) -> Option<Arc<Adapter>> {
        self.table.lock().slots.get(id.0).and_then(|s| s.clone())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Adapter>> {
        let table = self.table.lock();
        let id = *table.by_name.get(name)?;
        table.slots.get(id.0).and_then(|s| s.clone())
    }

    /// Names of attached adapters in table order.
    pub fn adapter_names(&self) -> Vec<String> {
        self.table
            .lock()
            .slots
            .iter()
            .flatten()
            .map(|a| a.name().to_string())
            .collect()
    }
}
