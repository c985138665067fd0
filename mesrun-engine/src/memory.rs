//! Physical memory introspection.

use mesrun_core::BoxError;
use parking_lot::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Total and per-process physical memory, in bytes.
pub trait MemoryProbe: Send + Sync {
    fn total_physical_memory(&self) -> Result<u64, BoxError>;

    fn process_physical_memory(&self) -> Result<u64, BoxError>;
}

/// Returns `percentage` percent of `total`.
pub fn memory_limit(total: u64, percentage: u64) -> u64 {
    ((total as u128 * percentage as u128) / 100) as u64
}

/// [`MemoryProbe`] backed by `sysinfo`, for the current process.
pub struct SysinfoMemoryProbe {
    system: Mutex<System>,
    pid: Pid,
}

impl SysinfoMemoryProbe {
    pub fn new() -> Result<Self, BoxError> {
        let pid = sysinfo::get_current_pid().map_err(BoxError::from)?;
        Ok(Self {
            system: Mutex::new(System::new()),
            pid,
        })
    }
}

impl MemoryProbe for SysinfoMemoryProbe {
    fn total_physical_memory(&self) -> Result<u64, BoxError> {
        let mut system = self.system.lock();
        system.refresh_memory();
        Ok(system.total_memory())
    }

    fn process_physical_memory(&self) -> Result<u64, BoxError> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        system
            .process(self.pid)
            .map(|p| p.memory())
            .ok_or_else(|| BoxError::from(format!("process {} not found", self.pid)))
    }
}
