//! Virtual machine creation and memory registration.
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to host virtual addresses:
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x1000       │ ────► │ mmap'd region│
//! │ 0x1fff       │       │              │
//! └──────────────┘       └──────────────┘
//!      4 KB                   4 KB
//! ```
//!
//! KVM translates guest physical addresses to host physical addresses through
//! EPT/NPT. Slots must be unique and their ranges must not overlap; both are
//! checked here before KVM is asked.

use super::{KvmError, VcpuFd};
use crate::hypervisor::GuestVm;
use crate::memory::GuestRegion;
use kvm_bindings::kvm_userspace_memory_region;
use log::debug;

/// A registered guest-physical range.
#[derive(Debug, Clone, Copy)]
struct Slot {
    id: u32,
    base: u64,
    size: u64,
}

impl Slot {
    fn overlaps(&self, other: &Slot) -> bool {
        self.base < other.base.saturating_add(other.size)
            && other.base < self.base.saturating_add(self.size)
    }
}

/// Slots already handed to KVM.
#[derive(Debug, Default)]
struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    /// Check that `slot` may be added next to the existing ones.
    fn check(&self, slot: &Slot) -> Result<(), KvmError> {
        let invalid = |errno| KvmError::MemoryRegistrationFailed {
            slot: slot.id,
            source: kvm_ioctls::Error::new(errno),
        };

        if slot.size == 0 {
            return Err(invalid(libc::EINVAL));
        }
        if self.slots.iter().any(|s| s.id == slot.id) {
            return Err(invalid(libc::EEXIST));
        }
        if self.slots.iter().any(|s| s.overlaps(slot)) {
            return Err(invalid(libc::EEXIST));
        }
        Ok(())
    }

    fn insert(&mut self, slot: Slot) {
        self.slots.push(slot);
    }
}

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    /// The underlying KVM VM file descriptor.
    vm: kvm_ioctls::VmFd,
    slots: SlotTable,
}

impl VmFd {
    pub fn new(vm: kvm_ioctls::VmFd) -> Self {
        Self {
            vm,
            slots: SlotTable::default(),
        }
    }
}

impl GuestVm for VmFd {
    type Vcpu = VcpuFd;

    unsafe fn register_memory(&mut self, slot: u32, region: &GuestRegion) -> Result<(), KvmError> {
        let entry = Slot {
            id: slot,
            base: region.guest_base(),
            size: region.size(),
        };
        self.slots.check(&entry)?;

        let userspace_addr = region
            .host_address()
            .map_err(|_| KvmError::MemoryRegistrationFailed {
                slot,
                source: kvm_ioctls::Error::new(libc::EFAULT),
            })?;

        let mem_region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: entry.base,
            memory_size: entry.size,
            userspace_addr,
            flags: 0,
        };

        // SAFETY: the caller guarantees the region outlives this VM.
        unsafe {
            self.vm
                .set_user_memory_region(mem_region)
                .map_err(|source| KvmError::MemoryRegistrationFailed { slot, source })?;
        }
        self.slots.insert(entry);

        debug!(
            "Registered slot {slot}: guest {:#x}..{:#x} -> host {userspace_addr:#x}",
            entry.base,
            entry.base + entry.size
        );
        Ok(())
    }

    fn create_vcpu(&self, id: u64) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::VcpuCreationFailed)?;
        debug!("Created vCPU {id}");
        Ok(VcpuFd::new(vcpu))
    }
}
