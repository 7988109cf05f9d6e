//! Virtual CPU management and execution.
//!
//! The vCPU operates in a run loop:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                VMM (User Space)              │
//! │  ┌─────────┐         ┌─────────────┐         │
//! │  │ resume  │◄────────│ decode exit │         │
//! │  └────┬────┘         └──────▲──────┘         │
//! │       │ KVM_RUN             │ kvm_run page   │
//! ├───────┼─────────────────────┼────────────────┤
//! │       ▼    KVM (Kernel)     │                │
//! │  ┌─────────┐          ┌─────┴─────┐          │
//! │  │ VMENTER │─────────►│  VMEXIT   │          │
//! │  └─────────┘  guest   └───────────┘          │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! KVM binds vCPU state to the thread that issues the ioctls, so [`VcpuFd`]
//! is deliberately `!Send` and cannot leave the thread that created it.

use super::run::RunStructure;
use super::KvmError;
use crate::hypervisor::GuestVcpu;
use kvm_bindings::{kvm_regs, kvm_sregs};
use log::debug;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    /// Shared `kvm_run` mapping; unmapped before the descriptor is closed.
    run: Option<RunStructure>,
    /// The underlying KVM vCPU file descriptor.
    vcpu: kvm_ioctls::VcpuFd,
    /// Pins the handle to its creating thread.
    _thread_bound: PhantomData<*const ()>,
}

impl VcpuFd {
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self {
            run: None,
            vcpu,
            _thread_bound: PhantomData,
        }
    }
}

impl GuestVcpu for VcpuFd {
    fn map_run_structure(&mut self, size: usize) -> Result<(), KvmError> {
        // SAFETY: the descriptor is owned by `self.vcpu`, which is dropped
        // after `self.run`.
        let fd = unsafe { BorrowedFd::borrow_raw(self.vcpu.as_raw_fd()) };
        let run = unsafe { RunStructure::map(fd, size)? };
        debug!("Mapped {size}-byte vCPU run structure");
        self.run = Some(run);
        Ok(())
    }

    fn run_structure(&self) -> Result<&[u8], KvmError> {
        self.run
            .as_ref()
            .map(RunStructure::as_bytes)
            .ok_or_else(|| KvmError::RunStructureMapFailed {
                size: 0,
                reason: "run structure is not mapped".to_string(),
            })
    }

    fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu
            .get_regs()
            .map_err(|source| KvmError::RegisterAccessFailed { op: "get", source })
    }

    fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu
            .set_regs(regs)
            .map_err(|source| KvmError::RegisterAccessFailed { op: "set", source })
    }

    fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu
            .get_sregs()
            .map_err(|source| KvmError::RegisterAccessFailed {
                op: "get special",
                source,
            })
    }

    fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu
            .set_sregs(sregs)
            .map_err(|source| KvmError::RegisterAccessFailed {
                op: "set special",
                source,
            })
    }

    fn resume(&mut self) -> Result<(), KvmError> {
        // kvm-ioctls decodes the exit from its own mapping; the VMM reads our
        // mapping instead, so only the error matters here.
        settle_run(self.vcpu.run().map(|_| ()))
    }
}

/// Turn the outcome of `KVM_RUN` into a resume result.
///
/// A signal makes the ioctl fail with EINTR after the kernel has recorded
/// `KVM_EXIT_INTR` in the run structure, so that case is an ordinary exit.
fn settle_run(result: Result<(), kvm_ioctls::Error>) -> Result<(), KvmError> {
    match result {
        Err(e) if e.errno() == libc::EINTR => {
            debug!("KVM_RUN interrupted by a signal");
            Ok(())
        }
        other => other.map_err(KvmError::RunFailed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_interrupt_is_an_exit() {
        assert!(settle_run(Err(kvm_ioctls::Error::new(libc::EINTR))).is_ok());
    }

    #[test]
    fn test_run_error_is_fatal() {
        match settle_run(Err(kvm_ioctls::Error::new(libc::EFAULT))) {
            Err(KvmError::RunFailed(e)) => assert_eq!(e.errno(), libc::EFAULT),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_completed_run_passes() {
        assert!(settle_run(Ok(())).is_ok());
    }
}
