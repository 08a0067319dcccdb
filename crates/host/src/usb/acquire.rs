//! Session acquisition
//!
//! [`RecoveryClient`] owns the backend and at most one [`DeviceSession`].
//! Opening always closes the previous session first, so there is a single
//! owner of the device at any time.

use crate::error::{AcquisitionError, Result, SessionError};
use crate::usb::backend::{CandidateInfo, UsbBackend};
use crate::usb::session::{DeviceSession, OpenPolicy};
use protocol::{DeviceInfo, DeviceMode};
use std::time::Duration;
use tracing::{debug, info};

/// Pacing of the acquisition loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquirePolicy {
    /// Sleep after each failed attempt
    pub retry_interval: Duration,
    /// Attempts that fit in one second of waiting
    pub attempts_per_second: u32,
}

impl Default for AcquirePolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(250),
            attempts_per_second: 4,
        }
    }
}

impl AcquirePolicy {
    /// Attempt budget covering roughly `seconds` of waiting
    pub fn budget_for(&self, seconds: u32) -> u32 {
        seconds.saturating_mul(self.attempts_per_second)
    }
}

/// Owner of the active device session
pub struct RecoveryClient<B: UsbBackend> {
    backend: B,
    open_policy: OpenPolicy,
    acquire_policy: AcquirePolicy,
    session: Option<DeviceSession<B::Device>>,
}

impl<B: UsbBackend> RecoveryClient<B> {
    pub fn new(backend: B, open_policy: OpenPolicy, acquire_policy: AcquirePolicy) -> Self {
        Self {
            backend,
            open_policy,
            acquire_policy,
            session: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn open_policy(&self) -> &OpenPolicy {
        &self.open_policy
    }

    pub fn acquire_policy(&self) -> &AcquirePolicy {
        &self.acquire_policy
    }

    /// Close the current session, then open a new one for `mode`
    pub fn open(&mut self, mode: DeviceMode) -> Result<&mut DeviceSession<B::Device>> {
        self.close();
        let session = DeviceSession::open(&self.backend, mode, &self.open_policy)?;
        Ok(self.session.insert(session))
    }

    /// Close the current session, if any
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_open())
    }

    /// The active session
    pub fn session(&mut self) -> Result<&mut DeviceSession<B::Device>> {
        self.session
            .as_mut()
            .filter(|s| s.is_open())
            .ok_or(SessionError::InvalidSession)
    }

    /// Identity of the active session's device, `None` without a session
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.session.as_ref().and_then(|s| s.device_info())
    }

    /// Repeatedly try to open a session for `mode`
    ///
    /// Each attempt closes any existing session first; failed attempts sleep
    /// for the policy's retry interval. Fails with
    /// [`SessionError::AcquisitionTimeout`] once `budget` attempts are spent.
    pub fn acquire_within_budget(
        &mut self,
        mode: DeviceMode,
        budget: u32,
    ) -> Result<&mut DeviceSession<B::Device>> {
        debug!("Waiting for {} device ({} attempts)", mode, budget);

        for attempt in 1..=budget {
            self.close();
            match DeviceSession::open(&self.backend, mode, &self.open_policy) {
                Ok(session) => {
                    info!("Acquired {} device on attempt {}", mode, attempt);
                    return Ok(self.session.insert(session));
                }
                Err(e) => {
                    debug!("Acquisition attempt {}/{} failed: {}", attempt, budget, e);
                    std::thread::sleep(self.acquire_policy.retry_interval);
                }
            }
        }

        Err(SessionError::AcquisitionTimeout { attempts: budget })
    }

    /// [`RecoveryClient::acquire_within_budget`] with the budget derived from
    /// a wait in seconds
    pub fn acquire_within_seconds(
        &mut self,
        mode: DeviceMode,
        seconds: u32,
    ) -> Result<&mut DeviceSession<B::Device>> {
        let budget = self.acquire_policy.budget_for(seconds);
        self.acquire_within_budget(mode, budget)
    }

    /// Devices currently attached with the configured vendor id
    pub fn list_devices(&self) -> Result<Vec<CandidateInfo>> {
        let candidates = self
            .backend
            .enumerate(self.open_policy.vendor_id, None)
            .map_err(AcquisitionError::Enumerate)?;
        Ok(candidates
            .iter()
            .map(|c| self.backend.describe(c))
            .collect())
    }
}

impl<B: UsbBackend> Drop for RecoveryClient<B> {
    fn drop(&mut self) {
        self.close();
    }
}
