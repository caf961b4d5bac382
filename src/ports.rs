use parking_lot::Mutex;

use crate::config::{Config, PortPolicy};
use crate::error::{Result, SupervisorError};

/// Hands out child-process ports.
///
/// With [`PortPolicy::Incrementing`] the offset only ever grows, so a port
/// that was just released is never handed to the next instance.
#[derive(Debug)]
pub struct PortAllocator {
    policy: PortPolicy,
    base: u16,
    reserved: Vec<u16>,
    next_offset: Mutex<u32>,
}

impl PortAllocator {
    pub fn fixed(port: u16) -> Self {
        Self::new(PortPolicy::Fixed, port)
    }

    pub fn incrementing(base: u16) -> Self {
        Self::new(PortPolicy::Incrementing, base)
    }

    pub fn new(policy: PortPolicy, base: u16) -> Self {
        Self {
            policy,
            base,
            reserved: Vec::new(),
            next_offset: Mutex::new(0),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.port_policy, config.base_port).with_reserved(config.api_port)
    }

    /// Never hand out `port` (the control API's own listener).
    pub fn with_reserved(mut self, port: u16) -> Self {
        self.reserved.push(port);
        self
    }

    pub fn policy(&self) -> PortPolicy {
        self.policy
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    pub fn allocate(&self) -> Result<u16> {
        match self.policy {
            PortPolicy::Fixed => Ok(self.base),
            PortPolicy::Incrementing => {
                let mut offset = self.next_offset.lock();
                loop {
                    let candidate = u32::from(self.base) + *offset;
                    if candidate > u32::from(u16::MAX) {
                        return Err(SupervisorError::PortsExhausted(self.base));
                    }
                    *offset += 1;

                    let port = candidate as u16;
                    if !self.reserved.contains(&port) {
                        return Ok(port);
                    }
                }
            }
        }
    }
}
