//! Services the embedding kernel provides to this crate.
//!
//! The [`Platform`] trait is the seam between the event core and the rest
//! of the kernel: the firmware call gateway, CPU topology, address
//! translation, and the handful of CSR side effects the dispatch path
//! needs.

use crate::percpu::{CpuId, CpuMask};
use crate::sbi::{base_fid, eid, SbiRet};

/// Kernel services consumed by the SSE core and the trigger manager.
pub trait Platform: Send + Sync {
    /// Issue a synchronous SBI call on `cpu`.
    ///
    /// Hart-local calls (register/enable/disable of local events, mask,
    /// trigger installation) must execute on `cpu`; an implementation
    /// either runs the call directly when already pinned there or ships it
    /// over with a synchronous cross-CPU call.
    fn ecall(&self, cpu: CpuId, eid: usize, fid: usize, args: [usize; 6]) -> SbiRet;

    /// Number of possible CPUs (`0..n`).
    fn possible_cpus(&self) -> usize;

    /// Currently online CPUs.
    fn online_cpus(&self) -> CpuMask;

    /// CPU the caller is executing on.
    fn current_cpu(&self) -> CpuId;

    /// Map a logical CPU to its hart id.
    fn cpu_to_hartid(&self, cpu: CpuId) -> usize {
        cpu
    }

    /// Map a hart id back to its logical CPU.
    fn hartid_to_cpu(&self, hartid: usize) -> Option<CpuId> {
        Some(hartid)
    }

    /// Physical address of a kernel virtual address handed to firmware.
    fn virt_to_phys(&self, vaddr: usize) -> usize {
        vaddr
    }

    /// Address of the low-level SSE entry trampoline.
    fn sse_entry_point(&self) -> usize;

    /// Set the supervisor software interrupt pending bit on `cpu`.
    fn raise_soft_interrupt(&self, cpu: CpuId);

    /// Disable local interrupts, returning the previous state.
    fn irq_save(&self) -> usize {
        0
    }

    /// Restore local interrupts saved by [`Platform::irq_save`].
    fn irq_restore(&self, _flags: usize) {}
}

/// One platform instance shared by the SSE core and the trigger manager.
impl<T: Platform + ?Sized> Platform for alloc::sync::Arc<T> {
    fn ecall(&self, cpu: CpuId, eid: usize, fid: usize, args: [usize; 6]) -> SbiRet {
        (**self).ecall(cpu, eid, fid, args)
    }

    fn possible_cpus(&self) -> usize {
        (**self).possible_cpus()
    }

    fn online_cpus(&self) -> CpuMask {
        (**self).online_cpus()
    }

    fn current_cpu(&self) -> CpuId {
        (**self).current_cpu()
    }

    fn cpu_to_hartid(&self, cpu: CpuId) -> usize {
        (**self).cpu_to_hartid(cpu)
    }

    fn hartid_to_cpu(&self, hartid: usize) -> Option<CpuId> {
        (**self).hartid_to_cpu(hartid)
    }

    fn virt_to_phys(&self, vaddr: usize) -> usize {
        (**self).virt_to_phys(vaddr)
    }

    fn sse_entry_point(&self) -> usize {
        (**self).sse_entry_point()
    }

    fn raise_soft_interrupt(&self, cpu: CpuId) {
        (**self).raise_soft_interrupt(cpu)
    }

    fn irq_save(&self) -> usize {
        (**self).irq_save()
    }

    fn irq_restore(&self, flags: usize) {
        (**self).irq_restore(flags)
    }
}

/// Ask the base extension whether `extension` is implemented.
pub(crate) fn probe_extension<P: Platform + ?Sized>(platform: &P, cpu: CpuId, extension: usize) -> bool {
    let ret = platform.ecall(
        cpu,
        eid::BASE,
        base_fid::PROBE_EXTENSION,
        [extension, 0, 0, 0, 0, 0],
    );
    ret.is_success() && ret.value != 0
}

/// Interrupts-off section; restores the saved state on drop.
pub(crate) struct IrqGuard<'a, P: Platform + ?Sized> {
    platform: &'a P,
    flags: usize,
}

impl<'a, P: Platform + ?Sized> IrqGuard<'a, P> {
    pub(crate) fn new(platform: &'a P) -> Self {
        let flags = platform.irq_save();
        Self { platform, flags }
    }
}

impl<P: Platform + ?Sized> Drop for IrqGuard<'_, P> {
    fn drop(&mut self) {
        self.platform.irq_restore(self.flags);
    }
}
