//! Interrupt allocation and binding of vectors to event queue poll contexts.

use super::adapter::Adapter;
use super::efx::IntrType;
use crate::provider::{IntrAllocKind, IntrCookie, Provider, ResetReason};
use crate::{Result, SfvmkError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bit_field::BitField;
use core::cmp::min;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntrState {
    Uninitialized = 0,
    Initialized = 1,
    Testing = 2,
    Started = 3,
}

impl IntrState {
    fn from_u8(v: u8) -> IntrState {
        match v {
            1 => IntrState::Initialized,
            2 => IntrState::Testing,
            3 => IntrState::Started,
            _ => IntrState::Uninitialized,
        }
    }
}

/// Answer of the acknowledge callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IntrAck {
    Ok,
    /// Fatal condition; the vector must not be re-armed.
    Ignore,
    /// Shared legacy line raised by another device.
    NotThisDevice,
}

pub struct Intr {
    provider: Arc<dyn Provider>,
    kind: IntrType,
    cookies: Vec<IntrCookie>,
    num_desired: u32,
    state: AtomicU8,
    // queues flagged by the last legacy-line acknowledge
    line_qmask: AtomicU32,
}

#[derive(Default)]
struct IntrProgress {
    registered: usize,
    bound: usize,
    enabled: usize,
}

impl Intr {
    /// Allocate vectors, falling back MSI-X -> MSI -> legacy line.
    pub(crate) fn init(
        provider: &Arc<dyn Provider>,
        intr_limit: u32,
        evqs_desired: u32,
    ) -> Result<Intr> {
        let desired = min(evqs_desired, intr_limit).max(1);
        let attempts = [
            (IntrAllocKind::MsiX, desired),
            (IntrAllocKind::Msi, 1),
            (IntrAllocKind::Legacy, 1),
        ];
        let mut last_err = SfvmkError::NotSupported;

        for &(alloc_kind, count) in attempts.iter() {
            match provider.intr_alloc(alloc_kind, count) {
                Ok(mut cookies) if !cookies.is_empty() => {
                    if cookies.len() > count as usize {
                        provider.intr_free(&cookies[count as usize..]);
                        cookies.truncate(count as usize);
                    }
                    let kind = match alloc_kind {
                        IntrAllocKind::Legacy => IntrType::Line,
                        _ => IntrType::Message,
                    };
                    drv_info!(
                        "sfvmk intr: allocated {} of {} {:?} vectors",
                        cookies.len(),
                        desired,
                        alloc_kind
                    );
                    return Ok(Intr {
                        provider: provider.clone(),
                        kind,
                        cookies,
                        num_desired: desired,
                        state: AtomicU8::new(IntrState::Initialized as u8),
                        line_qmask: AtomicU32::new(0),
                    });
                }
                Ok(_) => {
                    drv_warn!("sfvmk intr: {:?} allocation returned no vectors", alloc_kind);
                    last_err = SfvmkError::NoSpace;
                }
                Err(err) => {
                    drv_warn!("sfvmk intr: {:?} allocation of {} failed: {}", alloc_kind, count, err);
                    last_err = err;
                }
            }
        }
        drv_error!("sfvmk intr: no interrupt type could be allocated: {}", last_err);
        Err(last_err)
    }

    pub fn kind(&self) -> IntrType {
        self.kind
    }

    pub fn state(&self) -> IntrState {
        IntrState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: IntrState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn num_alloc(&self) -> usize {
        self.cookies.len()
    }

    pub fn num_desired(&self) -> u32 {
        self.num_desired
    }

    pub fn cookies(&self) -> &[IntrCookie] {
        &self.cookies
    }

    pub(crate) fn release(&mut self) {
        if !self.cookies.is_empty() {
            self.provider.intr_free(&self.cookies);
            self.cookies.clear();
        }
        self.set_state(IntrState::Uninitialized);
    }
}

impl Drop for Intr {
    fn drop(&mut self) {
        self.release();
    }
}

impl Adapter {
    pub(crate) fn intr_start(&self) -> Result {
        if self.intr.state() != IntrState::Initialized {
            return Err(SfvmkError::InvalidState);
        }
        self.nic.intr_init(self.intr.kind())?;

        let mut progress = IntrProgress::default();
        if let Err(err) = self.intr_bind(&mut progress) {
            drv_error!(
                "sfvmk {}: interrupt start failed after {} vectors: {}",
                self.name(),
                progress.registered,
                err
            );
            self.intr_unbind(&progress);
            self.nic.intr_fini();
            return Err(err);
        }

        self.nic.intr_enable();
        self.intr.set_state(IntrState::Started);
        drv_debug!("sfvmk {}: interrupts started", self.name());
        Ok(())
    }

    fn intr_bind(&self, progress: &mut IntrProgress) -> Result {
        let cookies = self.intr.cookies();
        let count = min(cookies.len(), self.evqs.len());
        for (evq, &cookie) in cookies.iter().enumerate().take(count) {
            self.provider.intr_register(cookie, evq)?;
            progress.registered += 1;
        }
        for (evq, &cookie) in cookies.iter().enumerate().take(count) {
            self.provider.netpoll_bind(evq, cookie)?;
            progress.bound += 1;
        }
        for &cookie in cookies.iter().take(count) {
            self.provider.intr_enable(cookie)?;
            progress.enabled += 1;
        }
        Ok(())
    }

    // Sync before disable, disable before unregister.
    fn intr_unbind(&self, progress: &IntrProgress) {
        let cookies = self.intr.cookies();
        for &cookie in cookies[..progress.enabled].iter().rev() {
            self.provider.intr_sync(cookie);
            self.provider.intr_disable(cookie);
        }
        for evq in (0..progress.bound).rev() {
            self.provider.netpoll_unbind(evq);
        }
        for (evq, &cookie) in cookies[..progress.registered].iter().enumerate().rev() {
            self.provider.intr_unregister(cookie, evq);
        }
    }

    pub(crate) fn intr_stop(&self) {
        if self.intr.state() != IntrState::Started {
            return;
        }
        self.intr.set_state(IntrState::Initialized);
        // No new acknowledges past this point
        self.nic.intr_disable();

        let count = min(self.intr.num_alloc(), self.evqs.len());
        self.intr_unbind(&IntrProgress {
            registered: count,
            bound: count,
            enabled: count,
        });
        self.nic.intr_fini();
        drv_debug!("sfvmk {}: interrupts stopped", self.name());
    }

    /// Acknowledge callback for the vector bound to `evq`.
    pub fn intr_ack(&self, evq: usize) -> IntrAck {
        if self.intr.state() != IntrState::Started {
            return IntrAck::NotThisDevice;
        }
        match self.intr.kind() {
            IntrType::Message => {
                if self.nic.intr_status_message(evq as u32) {
                    self.intr_fatal();
                    return IntrAck::Ignore;
                }
                IntrAck::Ok
            }
            IntrType::Line => {
                let (fatal, qmask) = self.nic.intr_status_line();
                if fatal {
                    self.intr_fatal();
                    return IntrAck::Ignore;
                }
                if qmask == 0 {
                    return IntrAck::NotThisDevice;
                }
                self.intr.line_qmask.fetch_or(qmask, Ordering::AcqRel);
                IntrAck::Ok
            }
        }
    }

    /// Top half: only schedules the poll context.
    pub fn intr_handler(&self, evq: usize) {
        match self.intr.kind() {
            IntrType::Message => self.provider.netpoll_activate(evq),
            IntrType::Line => {
                let qmask = self.intr.line_qmask.swap(0, Ordering::AcqRel);
                for index in 0..min(self.evqs.len(), 32) {
                    if qmask.get_bit(index) {
                        self.provider.netpoll_activate(index);
                    }
                }
            }
        }
    }

    fn intr_fatal(&self) {
        drv_error!("sfvmk {}: fatal interrupt, disabling", self.name());
        self.nic.intr_disable();
        self.nic.intr_fatal();
        self.schedule_reset(ResetReason::FatalInterrupt);
    }
}
