//! Initial vCPU state and the built-in guest program.
//!
//! The guest runs in real mode with flat addressing over its single memory
//! region: CS base and selector are zero, so RIP is a guest-physical address.
//! No GDT, IDT, paging or MSRs are set up.

use crate::hypervisor::GuestVcpu;
use crate::kvm::KvmError;
use kvm_bindings::kvm_regs;
use log::debug;

/// RFLAGS bit 1 is reserved and must always be set.
pub const RFLAGS_RESERVED: u64 = 0x2;

/// Built-in guest: print `AL + BL` as a decimal digit, then a newline, on
/// COM1, then halt.
///
/// ```text
/// mov  $0x3f8, %dx
/// add  %bl, %al
/// add  $'0', %al
/// out  %al, (%dx)
/// mov  $'\n', %al
/// out  %al, (%dx)
/// hlt
/// ```
pub const ADDER_PROGRAM: [u8; 12] = [
    0xba, 0xf8, 0x03, // mov $0x3f8, %dx
    0x00, 0xd8, // add %bl, %al
    0x04, b'0', // add $'0', %al
    0xee, // out %al, (%dx)
    0xb0, b'\n', // mov $'\n', %al
    0xee, // out %al, (%dx)
    0xf4, // hlt
];

/// Register values the guest program expects at entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryState {
    /// Initial RIP; the program's load address.
    pub rip: u64,
    pub rax: u64,
    pub rbx: u64,
}

/// Put the vCPU in its entry state.
///
/// The code segment is flattened first, then the general-purpose registers
/// are replaced wholesale: everything not named in `entry` starts at zero.
pub fn setup_vcpu_regs<V: GuestVcpu>(vcpu: &V, entry: &EntryState) -> Result<(), KvmError> {
    let mut sregs = vcpu.get_sregs()?;
    sregs.cs.base = 0;
    sregs.cs.selector = 0;
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rip: entry.rip,
        rax: entry.rax,
        rbx: entry.rbx,
        rflags: RFLAGS_RESERVED,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;

    debug!(
        "vCPU entry: rip={:#x} rax={:#x} rbx={:#x}",
        entry.rip, entry.rax, entry.rbx
    );
    Ok(())
}
