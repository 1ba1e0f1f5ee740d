//! CPU masks and explicitly indexed per-CPU storage.
//!
//! Nothing here looks up the "current" CPU: every accessor takes the CPU
//! index, so callers state which CPU's slot they are touching.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::{Error, SseResult};

/// Logical CPU index (0..n-1).
pub type CpuId = usize;

/// Maximum supported CPUs.
pub const MAX_CPUS: usize = 256;

const MASK_WORDS: usize = MAX_CPUS / 64;

// ============================================================================
// CPU Mask
// ============================================================================

/// Fixed-size set of CPU indices.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuMask {
    bits: [u64; MASK_WORDS],
}

impl CpuMask {
    /// Empty mask.
    pub const fn new() -> Self {
        Self {
            bits: [0; MASK_WORDS],
        }
    }

    /// Mask containing CPUs `0..count`.
    pub fn first(count: usize) -> Self {
        let mut mask = Self::new();
        for cpu in 0..count.min(MAX_CPUS) {
            mask.set(cpu);
        }
        mask
    }

    /// Add a CPU. Indices beyond [`MAX_CPUS`] are ignored.
    pub fn set(&mut self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64] |= 1 << (cpu % 64);
        }
    }

    /// Remove a CPU.
    pub fn clear(&mut self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.bits[cpu / 64] &= !(1 << (cpu % 64));
        }
    }

    /// Check membership.
    pub fn contains(&self, cpu: CpuId) -> bool {
        cpu < MAX_CPUS && self.bits[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    /// Number of CPUs in the mask.
    pub fn weight(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Any member other than `cpu`, lowest index first.
    pub fn any_but(&self, cpu: CpuId) -> Option<CpuId> {
        self.iter().find(|&c| c != cpu)
    }

    /// Iterate members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..MAX_CPUS).filter(move |&cpu| self.contains(cpu))
    }
}

impl FromIterator<CpuId> for CpuMask {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut mask = Self::new();
        for cpu in iter {
            mask.set(cpu);
        }
        mask
    }
}

impl core::fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// ============================================================================
// Per-CPU Storage
// ============================================================================

/// One `T` per possible CPU, indexed by CPU id.
pub struct PerCpu<T> {
    slots: Box<[T]>,
}

impl<T> PerCpu<T> {
    /// Build one instance per CPU in `0..count`, all or nothing.
    ///
    /// If `init` fails for any CPU, every instance already built is dropped
    /// before the error is returned.
    pub fn try_new_with<F>(count: usize, mut init: F) -> SseResult<Self>
    where
        F: FnMut(CpuId) -> SseResult<T>,
    {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|_| Error::OutOfMemory)?;

        for cpu in 0..count {
            slots.push(init(cpu)?);
        }

        Ok(Self {
            slots: slots.into_boxed_slice(),
        })
    }

    /// Number of CPUs covered.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The instance belonging to `cpu`, if `cpu` is covered.
    pub fn get(&self, cpu: CpuId) -> Option<&T> {
        self.slots.get(cpu)
    }

    /// Iterate `(cpu, instance)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> + '_ {
        self.slots.iter().enumerate()
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for PerCpu<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.slots.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_membership() {
        let mut mask = CpuMask::first(4);
        assert_eq!(mask.weight(), 4);
        mask.clear(2);
        assert!(!mask.contains(2));
        assert!(mask.contains(3));
        assert_eq!(mask.iter().collect::<Vec<_>>(), [0, 1, 3]);
        assert_eq!(mask.any_but(0), Some(1));
        mask.set(MAX_CPUS + 1);
        assert_eq!(mask.weight(), 3);
    }

    #[test]
    fn test_any_but_single_cpu() {
        let mask: CpuMask = [5].into_iter().collect();
        assert_eq!(mask.any_but(5), None);
        assert_eq!(mask.any_but(0), Some(5));
    }

    #[test]
    fn test_percpu_all_or_nothing() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Slot;
        impl Drop for Slot {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let res = PerCpu::try_new_with(4, |cpu| {
            if cpu == 2 {
                Err(Error::OutOfMemory)
            } else {
                Ok(Slot)
            }
        });
        assert!(matches!(res, Err(Error::OutOfMemory)));
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);

        let ok = PerCpu::try_new_with(3, |cpu| Ok(cpu * 10)).unwrap();
        assert_eq!(ok.get(2), Some(&20));
        assert_eq!(ok.get(3), None);
    }
}
