//! Thread affinity for heater workers.
//!
//! Heaters are pinned one per CPU so that the pool loads every core of the
//! configured set evenly instead of letting the scheduler stack them.

use crate::error::{HearthError, Result};
use core_affinity::CoreId;
use tracing::{debug, warn};

/// Pin the current thread to the specified CPU.
///
/// # Errors
///
/// Returns `HearthError::AffinityFailed` if the thread cannot be pinned.
pub fn pin_to_cpu(cpu_id: usize) -> Result<()> {
    if core_affinity::set_for_current(CoreId { id: cpu_id }) {
        debug!(cpu_id, "pinned heater to CPU");
        Ok(())
    } else {
        Err(HearthError::AffinityFailed(cpu_id))
    }
}

/// Pin the calling heater thread, logging instead of failing.
///
/// A heater that cannot be pinned still produces heat, so affinity errors are
/// never fatal.
pub(crate) fn pin_heater(cpu_id: usize, name: &str) {
    if let Err(e) = pin_to_cpu(cpu_id) {
        warn!(%e, cpu_id, heater = name, "failed to pin heater thread");
    }
}

/// Hands out CPUs for heater slots.
///
/// Slot `i` always maps to the same CPU, so a respawned worker lands where its
/// predecessor ran.
#[derive(Debug, Clone)]
pub struct CpuAllocator {
    cpus: Vec<usize>,
}

impl CpuAllocator {
    /// Create an allocator over a non-empty CPU list.
    ///
    /// # Errors
    ///
    /// Returns `HearthError::NoCpusAvailable` if `cpus` is empty.
    pub fn new(cpus: Vec<usize>) -> Result<Self> {
        if cpus.is_empty() {
            return Err(HearthError::NoCpusAvailable);
        }
        Ok(Self { cpus })
    }

    /// CPU for a heater slot, wrapping when there are more slots than CPUs.
    pub fn cpu_for_slot(&self, slot: usize) -> usize {
        self.cpus[slot % self.cpus.len()]
    }

    /// Number of CPUs, i.e. the pool's full heating capacity.
    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    /// Always false; construction rejects empty sets.
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// The underlying CPU list.
    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_map_stably() {
        let allocator = CpuAllocator::new(vec![0, 2, 4, 6]).unwrap();
        assert_eq!(allocator.cpu_for_slot(0), 0);
        assert_eq!(allocator.cpu_for_slot(3), 6);
        assert_eq!(allocator.cpu_for_slot(4), 0);
        assert_eq!(allocator.cpu_for_slot(3), 6);
        assert_eq!(allocator.len(), 4);
    }

    #[test]
    fn test_empty_set_rejected() {
        assert!(matches!(
            CpuAllocator::new(vec![]),
            Err(HearthError::NoCpusAvailable)
        ));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_pin_to_cpu_zero() {
        let cpus = crate::cpuset::available_cpus();
        let handle = std::thread::spawn(move || pin_to_cpu(cpus[0]));
        assert!(handle.join().unwrap().is_ok());
    }
}
