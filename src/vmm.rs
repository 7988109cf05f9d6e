//! VM session: setup in dependency order, then the run loop.
//!
//! ```text
//! Capability ─► guest region (alloc, load) ─► VM ─► register region ─► vCPU
//!     ─► run structure ─► entry registers ─► run loop ─► Halt
//! ```
//!
//! Every step is fatal on failure. Whatever was already created is released by
//! dropping the [`Vmm`] fields, which are declared in reverse creation order.

use crate::boot::{self, EntryState};
use crate::devices::{DeviceError, PioHandler, SerialPort};
use crate::hypervisor::{Capability, GuestVcpu, GuestVm, Hypervisor};
use crate::kvm::{self, Kvm, KvmError, VmExit};
use crate::memory::{GuestLayout, GuestRegion, MemoryError};
use log::{debug, error, info};
use std::io::Write;
use std::thread;
use thiserror::Error;

/// Memory slot of the single guest region.
const GUEST_SLOT: u32 = 0;

/// Id of the single vCPU.
const BOOT_VCPU_ID: u64 = 0;

/// Name of the thread that owns the vCPU.
const VCPU_THREAD_NAME: &str = "vcpu0";

#[derive(Error, Debug)]
pub enum VmmError {
    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Failed to spawn vCPU thread: {0}")]
    SpawnThread(#[source] std::io::Error),

    #[error("vCPU thread panicked")]
    ThreadPanicked,
}

/// Everything needed to build one VM session.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub layout: GuestLayout,
    /// Raw guest code, loaded at `layout.load_addr`.
    pub program: Vec<u8>,
    pub rax: u64,
    pub rbx: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            layout: GuestLayout::default(),
            program: boot::ADDER_PROGRAM.to_vec(),
            rax: 2,
            rbx: 2,
        }
    }
}

/// Counters from one run of the guest.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// vCPU exits observed, including the final one.
    pub exits: u64,
    pub io_exits: u64,
    pub bytes_written: u64,
}

type VcpuOf<H> = <<H as Hypervisor>::Vm as GuestVm>::Vcpu;

/// A fully set up VM, ready to run.
pub struct Vmm<H: Hypervisor> {
    // Field order is drop order.
    vcpu: VcpuOf<H>,
    _vm: H::Vm,
    memory: GuestRegion,
    _capability: Capability<H>,
}

impl<H: Hypervisor> Vmm<H> {
    /// Negotiate with `hypervisor` and build the VM described by `config`.
    pub fn new(hypervisor: H, config: &VmConfig) -> Result<Self, VmmError> {
        let capability = Capability::negotiate(hypervisor)?;

        // Declared before `vm` so that an early return drops the VM first.
        let layout = config.layout;
        let memory = GuestRegion::allocate(layout.load_addr, layout.region_size)?;
        let loaded = memory.load(&config.program, 0)?;
        debug!(
            "Loaded {loaded}-byte program at {:#x} ({:#x}-byte region)",
            layout.load_addr, layout.region_size
        );

        let mut vm = capability.create_vm()?;

        // SAFETY: `memory` outlives `vm` both here, where locals drop in
        // reverse order, and in the returned Vmm, whose fields drop in
        // declaration order.
        unsafe { vm.register_memory(GUEST_SLOT, &memory)? };

        let mut vcpu = vm.create_vcpu(BOOT_VCPU_ID)?;

        let run_size = capability.vcpu_mmap_size()?;
        kvm::check_mapping_size(run_size)?;
        vcpu.map_run_structure(run_size)?;

        boot::setup_vcpu_regs(
            &vcpu,
            &EntryState {
                rip: layout.load_addr,
                rax: config.rax,
                rbx: config.rbx,
            },
        )?;

        Ok(Self {
            vcpu,
            _vm: vm,
            memory,
            _capability: capability,
        })
    }

    /// Run the guest until it halts, routing port I/O to `pio`.
    ///
    /// A failed resume, a malformed exit and any exit other than HLT, I/O or a
    /// signal interruption end the session with an error.
    pub fn run<P: PioHandler>(&mut self, pio: &mut P) -> Result<RunSummary, VmmError> {
        let mut summary = RunSummary::default();

        loop {
            self.vcpu.resume()?;
            summary.exits += 1;

            let run = self.vcpu.run_structure()?;
            match kvm::decode(run)? {
                VmExit::Halt => {
                    info!(
                        "Guest halted after {} exits, {} I/O exits",
                        summary.exits, summary.io_exits
                    );
                    return Ok(summary);
                }
                VmExit::Io(pio_exit) => {
                    summary.io_exits += 1;
                    summary.bytes_written += pio.handle_pio(&pio_exit)? as u64;
                }
                VmExit::Intr => debug!("vCPU run interrupted, resuming"),
                exit => {
                    let detail = exit.to_string();
                    let reason = exit.reason();
                    self.log_guest_state();
                    return Err(KvmError::UnhandledExit { reason, detail }.into());
                }
            }
        }
    }

    /// Dump what the guest was doing, for post-mortem diagnostics.
    fn log_guest_state(&self) {
        let regs = match self.vcpu.get_regs() {
            Ok(regs) => regs,
            Err(e) => {
                error!("Guest state unavailable: {e}");
                return;
            }
        };
        error!(
            "Guest state: rip={:#x} rax={:#x} rbx={:#x} rdx={:#x} rflags={:#x}",
            regs.rip, regs.rax, regs.rbx, regs.rdx, regs.rflags
        );

        let mut code = [0u8; 16];
        if let Some(offset) = regs.rip.checked_sub(self.memory.guest_base()) {
            if self.memory.read(offset, &mut code).is_ok() {
                error!("Code at rip: {code:02x?}");
            }
        }
    }
}

/// Build and run a KVM guest on a dedicated OS thread.
///
/// The vCPU is created, driven and dropped on that one thread. Guest output
/// goes to `sink`, which is handed back together with the run summary.
pub fn launch<W>(config: VmConfig, sink: W) -> Result<(RunSummary, W), VmmError>
where
    W: Write + Send + 'static,
{
    let handle = thread::Builder::new()
        .name(VCPU_THREAD_NAME.to_string())
        .spawn(move || -> Result<(RunSummary, W), VmmError> {
            let kvm = Kvm::open()?;
            let mut vmm = Vmm::new(kvm, &config)?;
            let mut serial = SerialPort::new(sink);
            info!("Starting vCPU {BOOT_VCPU_ID}");
            let summary = vmm.run(&mut serial)?;
            Ok((summary, serial.into_inner()))
        })
        .map_err(VmmError::SpawnThread)?;

    handle.join().map_err(|_| VmmError::ThreadPanicked)?
}
