//! Hypervisor backend seam.
//!
//! The VMM drives three kinds of objects: the system handle (`/dev/kvm`), a VM
//! and a vCPU. These traits describe exactly the operations the VMM needs from
//! each of them. KVM is the production backend (see [`crate::kvm`]); tests plug
//! in a scripted backend to check ordering and exit handling without touching
//! the kernel.

use crate::kvm::KvmError;
use crate::memory::GuestRegion;
use kvm_bindings::{kvm_regs, kvm_sregs, KVM_API_VERSION};
use log::debug;

/// The only KVM API version this host speaks.
pub const SUPPORTED_API_VERSION: i32 = KVM_API_VERSION as i32;

/// System-level handle to the virtualization subsystem.
pub trait Hypervisor {
    type Vm: GuestVm;

    /// API version reported by the subsystem.
    fn api_version(&self) -> i32;

    /// Create a new, empty VM.
    fn create_vm(&self) -> Result<Self::Vm, KvmError>;

    /// Size of the shared mapping every vCPU exposes.
    fn vcpu_mmap_size(&self) -> Result<usize, KvmError>;
}

/// A virtual machine.
pub trait GuestVm {
    type Vcpu: GuestVcpu;

    /// Install `region` in guest-physical memory at `slot`.
    ///
    /// # Safety
    ///
    /// The host buffer behind `region` must stay mapped for as long as this VM
    /// exists.
    unsafe fn register_memory(&mut self, slot: u32, region: &GuestRegion) -> Result<(), KvmError>;

    /// Create the vCPU with the given id.
    fn create_vcpu(&self, id: u64) -> Result<Self::Vcpu, KvmError>;
}

/// A virtual CPU.
///
/// Implementations are expected to be `!Send`: every call must come from the
/// thread that created the vCPU.
pub trait GuestVcpu {
    /// Map the shared run structure. `size` has already been checked against
    /// the minimum `kvm_run` size.
    fn map_run_structure(&mut self, size: usize) -> Result<(), KvmError>;

    /// The shared run structure as of the last exit.
    fn run_structure(&self) -> Result<&[u8], KvmError>;

    fn get_regs(&self) -> Result<kvm_regs, KvmError>;
    fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError>;
    fn get_sregs(&self) -> Result<kvm_sregs, KvmError>;
    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError>;

    /// Enter the guest and block until it exits.
    fn resume(&mut self) -> Result<(), KvmError>;
}

/// A [`Hypervisor`] whose API version has been checked.
///
/// This is the only way to reach [`Hypervisor::create_vm`] from the VMM, so no
/// VM can exist before the version check passed.
pub struct Capability<H> {
    hypervisor: H,
}

impl<H: Hypervisor> Capability<H> {
    /// Validate the reported API version and take ownership of the handle.
    pub fn negotiate(hypervisor: H) -> Result<Self, KvmError> {
        let version = hypervisor.api_version();
        if version != SUPPORTED_API_VERSION {
            return Err(KvmError::IncompatibleVersion {
                found: version,
                expected: SUPPORTED_API_VERSION,
            });
        }
        debug!("KVM API version {version}");
        Ok(Self { hypervisor })
    }

    pub fn create_vm(&self) -> Result<H::Vm, KvmError> {
        self.hypervisor.create_vm()
    }

    pub fn vcpu_mmap_size(&self) -> Result<usize, KvmError> {
        self.hypervisor.vcpu_mmap_size()
    }
}
