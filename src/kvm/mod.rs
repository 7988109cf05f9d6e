//! KVM (Kernel-based Virtual Machine) backend.
//!
//! The VMM talks to KVM through ioctls on three kinds of file descriptors:
//!
//! - `/dev/kvm` - system-level operations (API version, create VMs, mmap size)
//! - VM file descriptor - VM-level operations (create vCPUs, set memory)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! ```text
//! User Space (VMM)                    Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │  Kvm ────────┼──────────────────►│  /dev/kvm        │
//! │  VmFd ───────┼──────────────────►│  VM state        │
//! │  VcpuFd ─────┼──────────────────►│  vCPU state      │
//! │     │        │     mmap          │     │            │
//! │  RunStructure◄───────────────────┼── kvm_run        │
//! └──────────────┘                   └──────────────────┘
//! ```
//!
//! Each wrapper closes its descriptor on drop, so resources are released in
//! reverse order of creation as long as the owners are dropped in that order.

mod run;
mod vcpu;
mod vm;

pub use run::{check_mapping_size, decode, PioDirection, PioExit, VmExit};
pub use vcpu::VcpuFd;
pub use vm::VmFd;

#[cfg(test)]
pub(crate) use run::tests as run_fixtures;

use crate::hypervisor::Hypervisor;
use thiserror::Error;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm.
    ///
    /// This usually means:
    /// - The KVM module is not loaded
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open /dev/kvm: {0}")]
    DeviceUnavailable(#[source] kvm_ioctls::Error),

    /// KVM reported an API version other than the one we speak.
    #[error("Incompatible KVM API version {found} (expected {expected})")]
    IncompatibleVersion { found: i32, expected: i32 },

    #[error("Failed to create VM: {0}")]
    VmCreationFailed(#[source] kvm_ioctls::Error),

    #[error("Failed to register memory slot {slot}: {source}")]
    MemoryRegistrationFailed {
        slot: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Failed to create vCPU: {0}")]
    VcpuCreationFailed(#[source] kvm_ioctls::Error),

    #[error("Failed to query vCPU mmap size: {0}")]
    RunStructureQueryFailed(#[source] kvm_ioctls::Error),

    #[error("Failed to map vCPU run structure ({size} bytes): {reason}")]
    RunStructureMapFailed { size: usize, reason: String },

    #[error("Failed to {op} registers: {source}")]
    RegisterAccessFailed {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("Failed to run vCPU: {0}")]
    RunFailed(#[source] kvm_ioctls::Error),

    /// The guest exited for a reason this host does not handle.
    #[error("Unhandled vCPU exit (reason {reason}): {detail}")]
    UnhandledExit { reason: u32, detail: String },

    /// The run structure contents do not make sense.
    #[error("Malformed vCPU exit: {0}")]
    MalformedExit(String),
}

/// Handle to `/dev/kvm`.
///
/// Closed when dropped. Hand it to [`crate::hypervisor::Capability::negotiate`]
/// before doing anything else with it.
pub struct Kvm {
    kvm: kvm_ioctls::Kvm,
}

impl Kvm {
    /// Open `/dev/kvm`.
    pub fn open() -> Result<Self, KvmError> {
        let kvm = kvm_ioctls::Kvm::new().map_err(KvmError::DeviceUnavailable)?;
        Ok(Self { kvm })
    }
}

impl Hypervisor for Kvm {
    type Vm = VmFd;

    fn api_version(&self) -> i32 {
        self.kvm.get_api_version()
    }

    fn create_vm(&self) -> Result<VmFd, KvmError> {
        let vm = self.kvm.create_vm().map_err(KvmError::VmCreationFailed)?;
        Ok(VmFd::new(vm))
    }

    fn vcpu_mmap_size(&self) -> Result<usize, KvmError> {
        self.kvm
            .get_vcpu_mmap_size()
            .map_err(KvmError::RunStructureQueryFailed)
    }
}
