//! Node configuration.
//!
//! Every node of a cluster must agree on the address space; the remaining
//! knobs are local. Values come from [`FabricConfig::default`], the builder
//! setters, and optionally the environment:
//!
//! - `MEMFABRIC_SPACE_BYTES`: length of the shared address space
//! - `MEMFABRIC_PAGE_SIZE`: default page size for new regions (`0` disables paging)
//! - `MEMFABRIC_FAULT_TRAP`: `1`/`true` to page through the fault trap
//! - `MEMFABRIC_ASYNC_PULL_LIMIT`: concurrent reads of an async bulk pull

use crate::address::{AddressSpace, RegionAddress, DEFAULT_ALIGNMENT};
use crate::error::{FabricError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration of one fabric node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Shared address space; identical on every node
    pub address_space: AddressSpace,
    /// Allocation alignment and size-class granularity
    pub alignment: usize,
    /// Page size applied to newly allocated regions (None disables paging)
    pub default_page_size: Option<usize>,
    /// Page received regions through the protection fault trap
    pub fault_trap: bool,
    /// Pull unpaged regions in full as soon as they are received
    pub eager_pull: bool,
    /// Concurrent reads issued by an async bulk pull
    pub async_pull_limit: usize,
    /// Listener back-off when no message is waiting, in microseconds
    pub listener_idle_us: u64,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            address_space: AddressSpace::default(),
            alignment: DEFAULT_ALIGNMENT,
            default_page_size: None,
            fault_trap: false,
            eager_pull: true,
            async_pull_limit: 16,
            listener_idle_us: 50,
        }
    }
}

impl FabricConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shared address space.
    pub fn address_space(mut self, start: RegionAddress, len: usize) -> Self {
        self.address_space = AddressSpace::new(start, len);
        self
    }

    /// Set the allocation alignment.
    pub fn alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Set the default page size of new regions.
    pub fn default_page_size(mut self, page_size: Option<usize>) -> Self {
        self.default_page_size = page_size;
        self
    }

    /// Enable or disable the fault trap.
    pub fn fault_trap(mut self, enabled: bool) -> Self {
        self.fault_trap = enabled;
        self
    }

    /// Enable or disable eager pulls of unpaged regions.
    pub fn eager_pull(mut self, enabled: bool) -> Self {
        self.eager_pull = enabled;
        self
    }

    /// Set the concurrency of async bulk pulls.
    pub fn async_pull_limit(mut self, limit: usize) -> Self {
        self.async_pull_limit = limit;
        self
    }

    /// Set the listener back-off.
    pub fn listener_idle(mut self, idle: Duration) -> Self {
        self.listener_idle_us = idle.as_micros() as u64;
        self
    }

    pub fn listener_idle_duration(&self) -> Duration {
        Duration::from_micros(self.listener_idle_us)
    }

    /// Apply `MEMFABRIC_*` environment overrides.
    pub fn from_env(mut self) -> Result<Self> {
        if let Some(len) = env_parse::<usize>("MEMFABRIC_SPACE_BYTES")? {
            self.address_space.len = len;
        }
        if let Some(page_size) = env_parse::<usize>("MEMFABRIC_PAGE_SIZE")? {
            self.default_page_size = (page_size > 0).then_some(page_size);
        }
        if let Ok(value) = std::env::var("MEMFABRIC_FAULT_TRAP") {
            self.fault_trap = matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(limit) = env_parse::<usize>("MEMFABRIC_ASYNC_PULL_LIMIT")? {
            self.async_pull_limit = limit;
        }
        Ok(self)
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.address_space.len == 0 {
            return Err(FabricError::Config("address space is empty".into()));
        }
        if !self.alignment.is_power_of_two() {
            return Err(FabricError::Config(format!(
                "alignment {} is not a power of two",
                self.alignment
            )));
        }
        if !self.address_space.start.is_aligned(self.alignment) {
            return Err(FabricError::Config(format!(
                "address space start {} is not aligned to {}",
                self.address_space.start, self.alignment
            )));
        }
        if self.default_page_size == Some(0) {
            return Err(FabricError::InvalidPageSize(0));
        }
        if self.async_pull_limit == 0 {
            return Err(FabricError::Config("async pull limit must be positive".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| FabricError::Config(format!("{name}={value} is not a valid value"))),
        Err(_) => Ok(None),
    }
}
