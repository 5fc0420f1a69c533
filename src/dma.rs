//! Coherent DMA memory owned by a driver object.

use crate::provider::{DmaRegion, Provider};
use crate::{Result, SfvmkError};
use alloc::sync::Arc;
use core::slice;
use volatile::Volatile;

/// A coherent DMA buffer; handed back to the platform when dropped.
pub struct DmaMem {
    provider: Arc<dyn Provider>,
    region: DmaRegion,
}

impl DmaMem {
    /// Allocate at least `size` bytes, rounded up to whole pages.
    pub fn alloc(provider: &Arc<dyn Provider>, size: usize) -> Result<DmaMem> {
        if size == 0 {
            return Err(SfvmkError::BadParam);
        }
        let page = provider.page_size().max(1);
        let size = (size + page - 1) / page * page;
        let region = provider.dma_alloc_coherent(size)?;
        if region.size < size || region.va % 4 != 0 {
            provider.dma_free_coherent(region);
            return Err(SfvmkError::NoMemory);
        }
        Ok(DmaMem {
            provider: provider.clone(),
            region,
        })
    }

    pub fn io_addr(&self) -> u64 {
        self.region.io_addr
    }

    pub fn va(&self) -> usize {
        self.region.va
    }

    pub fn size(&self) -> usize {
        self.region.size
    }

    fn bytes(&self) -> &mut [Volatile<u8>] {
        unsafe { slice::from_raw_parts_mut(self.region.va as *mut Volatile<u8>, self.region.size) }
    }

    fn words(&self) -> &mut [Volatile<u32>] {
        unsafe {
            slice::from_raw_parts_mut(self.region.va as *mut Volatile<u32>, self.region.size / 4)
        }
    }

    pub fn fill(&self, byte: u8) {
        for b in self.bytes().iter_mut() {
            b.write(byte);
        }
    }

    /// Read a little-endian dword at a 4-byte aligned offset.
    pub fn read_u32(&self, offset: usize) -> u32 {
        debug_assert_eq!(offset % 4, 0);
        u32::from_le(self.words()[offset / 4].read())
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        debug_assert_eq!(offset % 4, 0);
        self.words()[offset / 4].write(value.to_le());
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        let mem = &self.bytes()[offset..offset + buf.len()];
        for (dst, src) in buf.iter_mut().zip(mem.iter()) {
            *dst = src.read();
        }
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        let mem = &mut self.bytes()[offset..offset + data.len()];
        for (dst, src) in mem.iter_mut().zip(data.iter()) {
            dst.write(*src);
        }
    }
}

impl Drop for DmaMem {
    fn drop(&mut self) {
        self.provider.dma_free_coherent(self.region);
    }
}
