//! Bounded TCP port pool for runtime dev servers.

use std::collections::BTreeSet;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Result, RunboxError};

/// Hands out ports from `[start, end]`, first free first.
///
/// The scan and the mark happen under one lock, so concurrent callers never
/// receive the same port.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start > end {
            return Err(RunboxError::InvalidConfig(format!(
                "port range start {start} is above end {end}"
            )));
        }
        Ok(Self {
            start,
            end,
            allocated: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    pub fn allocate(&self) -> Result<u16> {
        let mut allocated = self.lock();
        let port = (self.start..=self.end)
            .find(|p| !allocated.contains(p))
            .ok_or(RunboxError::PortPoolExhausted {
                start: self.start,
                end: self.end,
            })?;
        allocated.insert(port);
        debug!(port, "allocated port");
        Ok(port)
    }

    /// Return a port to the pool. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        if self.lock().remove(&port) {
            debug!(port, "released port");
        } else {
            debug!(port, "release of port that was not allocated");
        }
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    pub fn allocated(&self) -> usize {
        self.lock().len()
    }

    pub fn available(&self) -> usize {
        let capacity = (self.end - self.start) as usize + 1;
        capacity - self.allocated()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<u16>> {
        // The set is always left consistent, so a poisoned lock is still usable.
        self.allocated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
