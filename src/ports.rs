//! Local port selection for forwarding sessions.
//!
//! Ports are probed upward from a base by binding and immediately releasing
//! a listener. A port handed out stays reserved until its [`PortReservation`]
//! is dropped, so concurrent registrations never probe their way onto the
//! same port before either session has bound it.
//!
//! The probe itself is still racy against other processes on the machine.

use dashmap::DashSet;
use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use tracing::trace;

use crate::error::{Result, TunnelError};

/// Hands out unused local ports starting at `base`.
#[derive(Clone)]
pub struct PortAllocator {
    base: u16,
    reserved: Arc<DashSet<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            reserved: Arc::new(DashSet::new()),
        }
    }

    /// Picks the first port at or above the base that is not in `in_use`,
    /// not reserved by another caller, and currently bindable.
    pub fn reserve(&self, in_use: &HashSet<u16>) -> Result<PortReservation> {
        for port in self.base..u16::MAX {
            if in_use.contains(&port) || self.reserved.contains(&port) {
                continue;
            }
            if !is_port_free(port) {
                trace!("Port {} is busy", port);
                continue;
            }
            // Another caller may have claimed it between the check and here.
            if self.reserved.insert(port) {
                return Ok(PortReservation {
                    port,
                    reserved: Arc::clone(&self.reserved),
                });
            }
        }

        Err(TunnelError::NoAvailablePort(self.base))
    }
}

/// A port claimed from a [`PortAllocator`]; released on drop.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    reserved: Arc<DashSet<u16>>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.reserved.remove(&self.port);
    }
}

/// Bind-then-release availability probe on the loopback interface.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
