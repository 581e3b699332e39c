//! Host port allocation for new containers.
//!
//! A candidate port is first claimed in the process-wide reservation set and
//! then bind-probed against the OS. The set lock is only held to insert or
//! remove entries, never across the probe.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use tracing::debug;

/// Inclusive range of host ports eligible for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || start > end {
            return Err(Error::Validation(format!(
                "invalid port range {}-{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 1024,
            end: 65535,
        }
    }
}

pub struct PortAllocator {
    range: PortRange,
    max_attempts: usize,
    reserved: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(range: PortRange, max_attempts: usize) -> Arc<Self> {
        Arc::new(Self {
            range,
            max_attempts: max_attempts.max(1),
            reserved: Mutex::new(HashSet::new()),
        })
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Reserve `count` distinct free ports.
    ///
    /// The returned reservation releases its ports when dropped unless it is
    /// turned into a lease that lasts until [`release`].
    ///
    /// [`release`]: PortAllocator::release
    pub fn allocate(self: &Arc<Self>, count: usize) -> Result<PortReservation> {
        let mut rng = rand::rng();
        let mut picked = Vec::with_capacity(count);
        let mut attempts = 0;

        while picked.len() < count {
            if attempts >= self.max_attempts {
                self.release(&picked);
                return Err(Error::AllocationExhausted {
                    requested: count,
                    attempts,
                });
            }
            attempts += 1;

            let candidate = rng.random_range(self.range.start..=self.range.end);
            if !self.reserved.lock().insert(candidate) {
                continue;
            }
            if probe_free(candidate) {
                picked.push(candidate);
            } else {
                debug!(port = candidate, "Port in use on host, skipping");
                self.reserved.lock().remove(&candidate);
            }
        }

        Ok(PortReservation {
            allocator: Arc::clone(self),
            ports: picked,
            leased: false,
        })
    }

    /// Mark ports as leased without probing. Used when restoring records
    /// whose containers already hold their ports.
    pub fn claim(&self, ports: &[u16]) {
        self.reserved.lock().extend(ports.iter().copied());
    }

    pub fn release(&self, ports: &[u16]) {
        let mut reserved = self.reserved.lock();
        for port in ports {
            reserved.remove(port);
        }
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }
}

fn probe_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// Ports held for an in-flight creation.
#[must_use = "dropping a reservation releases its ports"]
pub struct PortReservation {
    allocator: Arc<PortAllocator>,
    ports: Vec<u16>,
    leased: bool,
}

impl PortReservation {
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Keep the ports reserved past this guard; they stay leased until the
    /// owning record is deleted.
    pub fn into_lease(mut self) {
        self.leased = true;
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if !self.leased {
            self.allocator.release(&self.ports);
        }
    }
}
