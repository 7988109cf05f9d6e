//! The shared `kvm_run` structure and exit decoding.
//!
//! After every `KVM_RUN` the kernel writes the exit reason and a
//! reason-specific payload into a page mapped from the vCPU file descriptor.
//! The payload is a C union, so it is never overlaid with a Rust struct here.
//! Instead the discriminant is read first and the payload is then picked apart
//! through fixed byte offsets:
//!
//! ```text
//! offset  width  field
//!      8  u32    exit_reason
//!     32  u8     io.direction        (KVM_EXIT_IO)
//!     33  u8     io.size
//!     34  u16    io.port
//!     36  u32    io.count
//!     40  u64    io.data_offset      (from the start of the mapping)
//!     32  u64    fail_entry.hardware_entry_failure_reason
//!     32  u32    internal.suberror
//! ```
//!
//! All fields are little-endian (x86_64 only).
//!
//! The pages are mapped a second time here rather than read through
//! kvm-ioctls, whose own mapping is private to its `VcpuFd`.

use super::KvmError;
use kvm_bindings::{
    kvm_run, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_INTR,
    KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT, KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN,
};
use log::warn;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::fmt;
use std::num::NonZeroUsize;
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;

/// Byte offsets into `struct kvm_run`.
mod offsets {
    pub const EXIT_REASON: usize = 8;
    /// Start of the exit payload union.
    pub const PAYLOAD: usize = 32;

    pub const IO_DIRECTION: usize = PAYLOAD;
    pub const IO_SIZE: usize = PAYLOAD + 1;
    pub const IO_PORT: usize = PAYLOAD + 2;
    pub const IO_COUNT: usize = PAYLOAD + 4;
    pub const IO_DATA_OFFSET: usize = PAYLOAD + 8;

    pub const FAIL_ENTRY_REASON: usize = PAYLOAD;
    pub const INTERNAL_SUBERROR: usize = PAYLOAD;
}

/// Smallest acceptable size for the vCPU mapping.
pub const MIN_RUN_SIZE: usize = std::mem::size_of::<kvm_run>();

/// Reject a vCPU mapping size that cannot hold a `kvm_run`.
///
/// This is a startup check; it must pass before the vCPU is ever resumed.
pub fn check_mapping_size(size: usize) -> Result<(), KvmError> {
    if size < MIN_RUN_SIZE {
        return Err(KvmError::RunStructureMapFailed {
            size,
            reason: format!("smaller than struct kvm_run ({MIN_RUN_SIZE} bytes)"),
        });
    }
    Ok(())
}

/// Direction of a port I/O access, from the guest's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PioDirection {
    /// `IN`: the guest reads from the port.
    In,
    /// `OUT`: the guest writes to the port.
    Out,
}

/// Decoded `KVM_EXIT_IO` payload.
///
/// Borrows the transferred bytes straight out of the run structure, so it is
/// only usable until the vCPU is resumed again.
#[derive(Debug, Clone, Copy)]
pub struct PioExit<'a> {
    pub direction: PioDirection,
    /// Operand size in bytes (1, 2 or 4).
    pub size: u8,
    pub port: u16,
    /// Repeat count for string instructions (`rep outsb` and friends).
    pub count: u32,
    /// `size * count` bytes of transferred data.
    pub data: &'a [u8],
}

/// Reason the vCPU returned to the host.
#[derive(Debug, Clone, Copy)]
pub enum VmExit<'a> {
    /// Guest executed `HLT`.
    Halt,
    /// Guest accessed an I/O port.
    Io(PioExit<'a>),
    /// `KVM_RUN` was interrupted by a host signal.
    Intr,
    /// Triple fault or explicit shutdown.
    Shutdown,
    /// Hardware refused to enter the guest.
    FailEntry { hardware_reason: u64 },
    /// KVM could not emulate something.
    InternalError { suberror: u32 },
    /// Guest touched unbacked guest-physical memory.
    Mmio,
    /// Anything else, by raw exit reason.
    Other(u32),
}

impl VmExit<'_> {
    /// Raw `exit_reason` value for this exit.
    pub fn reason(&self) -> u32 {
        match self {
            VmExit::Halt => KVM_EXIT_HLT,
            VmExit::Io(_) => KVM_EXIT_IO,
            VmExit::Intr => KVM_EXIT_INTR,
            VmExit::Shutdown => KVM_EXIT_SHUTDOWN,
            VmExit::FailEntry { .. } => KVM_EXIT_FAIL_ENTRY,
            VmExit::InternalError { .. } => KVM_EXIT_INTERNAL_ERROR,
            VmExit::Mmio => KVM_EXIT_MMIO,
            VmExit::Other(reason) => *reason,
        }
    }
}

impl fmt::Display for VmExit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmExit::Halt => write!(f, "HLT"),
            VmExit::Io(pio) => write!(
                f,
                "I/O {:?} port={:#x} size={} count={}",
                pio.direction, pio.port, pio.size, pio.count
            ),
            VmExit::Intr => write!(f, "interrupted"),
            VmExit::Shutdown => write!(f, "shutdown"),
            VmExit::FailEntry { hardware_reason } => {
                write!(f, "entry failed, hardware reason {hardware_reason:#x}")
            }
            VmExit::InternalError { suberror } => {
                write!(f, "KVM internal error, suberror {suberror}")
            }
            VmExit::Mmio => write!(f, "MMIO access to unbacked memory"),
            VmExit::Other(reason) => write!(f, "exit reason {reason}"),
        }
    }
}

fn field<const N: usize>(run: &[u8], offset: usize) -> Result<[u8; N], KvmError> {
    run.get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            KvmError::MalformedExit(format!(
                "field at offset {offset} lies outside the {}-byte run structure",
                run.len()
            ))
        })
}

fn read_u8(run: &[u8], offset: usize) -> Result<u8, KvmError> {
    field::<1>(run, offset).map(|b| b[0])
}

fn read_u16(run: &[u8], offset: usize) -> Result<u16, KvmError> {
    field(run, offset).map(u16::from_le_bytes)
}

fn read_u32(run: &[u8], offset: usize) -> Result<u32, KvmError> {
    field(run, offset).map(u32::from_le_bytes)
}

fn read_u64(run: &[u8], offset: usize) -> Result<u64, KvmError> {
    field(run, offset).map(u64::from_le_bytes)
}

/// Decode the exit reason and its payload from a run structure snapshot.
///
/// The payload is only looked at after the discriminant says which union
/// member is live.
pub fn decode(run: &[u8]) -> Result<VmExit<'_>, KvmError> {
    let reason = read_u32(run, offsets::EXIT_REASON)?;

    let exit = match reason {
        KVM_EXIT_HLT => VmExit::Halt,
        KVM_EXIT_IO => VmExit::Io(decode_pio(run)?),
        KVM_EXIT_INTR => VmExit::Intr,
        KVM_EXIT_SHUTDOWN => VmExit::Shutdown,
        KVM_EXIT_FAIL_ENTRY => VmExit::FailEntry {
            hardware_reason: read_u64(run, offsets::FAIL_ENTRY_REASON)?,
        },
        KVM_EXIT_INTERNAL_ERROR => VmExit::InternalError {
            suberror: read_u32(run, offsets::INTERNAL_SUBERROR)?,
        },
        KVM_EXIT_MMIO => VmExit::Mmio,
        other => VmExit::Other(other),
    };

    Ok(exit)
}

fn decode_pio(run: &[u8]) -> Result<PioExit<'_>, KvmError> {
    let direction = match u32::from(read_u8(run, offsets::IO_DIRECTION)?) {
        KVM_EXIT_IO_IN => PioDirection::In,
        KVM_EXIT_IO_OUT => PioDirection::Out,
        other => {
            return Err(KvmError::MalformedExit(format!(
                "unknown I/O direction {other}"
            )))
        }
    };
    let size = read_u8(run, offsets::IO_SIZE)?;
    let port = read_u16(run, offsets::IO_PORT)?;
    let count = read_u32(run, offsets::IO_COUNT)?;
    let data_offset = read_u64(run, offsets::IO_DATA_OFFSET)?;

    let len = usize::from(size) * count as usize;
    let data = usize::try_from(data_offset)
        .ok()
        .and_then(|start| run.get(start..start.checked_add(len)?))
        .ok_or_else(|| {
            KvmError::MalformedExit(format!(
                "I/O data at offset {data_offset:#x} ({len} bytes) lies outside the run structure"
            ))
        })?;

    Ok(PioExit {
        direction,
        size,
        port,
        count,
        data,
    })
}

/// Read-only shared mapping of a vCPU's `kvm_run` page(s).
///
/// The kernel writes it during `KVM_RUN`; the host reads it only between
/// runs, so no synchronization is needed beyond that alternation.
///
/// kvm-ioctls maps the same pages inside its `VcpuFd`, but only exposes them
/// as a decoded `VcpuExit`. Decoding here goes by raw byte offset, which needs
/// a byte view of the whole mapping, hence this second mapping.
pub struct RunStructure {
    ptr: NonNull<c_void>,
    len: usize,
}

impl RunStructure {
    /// Map `size` bytes of the vCPU file descriptor.
    ///
    /// # Safety
    ///
    /// `fd` must be a KVM vCPU file descriptor that stays open for as long as
    /// the returned mapping is used.
    pub unsafe fn map(fd: BorrowedFd<'_>, size: usize) -> Result<Self, KvmError> {
        check_mapping_size(size)?;
        let len = NonZeroUsize::new(size).ok_or(KvmError::RunStructureMapFailed {
            size,
            reason: "zero-length mapping".to_string(),
        })?;

        let ptr = unsafe { mmap(None, len, ProtFlags::PROT_READ, MapFlags::MAP_SHARED, fd, 0) }
            .map_err(|e| KvmError::RunStructureMapFailed {
                size,
                reason: e.to_string(),
            })?;

        Ok(Self { ptr, len: size })
    }

    /// View of the whole mapping.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the mapping is `len` bytes long, readable, and lives until
        // drop. The kernel only writes it while the owning thread is blocked
        // in KVM_RUN, which cannot overlap with this borrow.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }
}

impl Drop for RunStructure {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!("Failed to unmap vCPU run structure: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const RUN_SIZE: usize = 4096;
    const DATA_OFFSET: usize = 0x100;

    fn run_with_reason(reason: u32) -> Vec<u8> {
        let mut run = vec![0u8; RUN_SIZE];
        run[offsets::EXIT_REASON..offsets::EXIT_REASON + 4].copy_from_slice(&reason.to_le_bytes());
        run
    }

    /// Build a run structure snapshot for a `KVM_EXIT_IO`.
    pub(crate) fn pio_exit(direction: u32, port: u16, data: &[u8]) -> Vec<u8> {
        let mut run = run_with_reason(KVM_EXIT_IO);
        run[offsets::IO_DIRECTION] = direction as u8;
        run[offsets::IO_SIZE] = data.len() as u8;
        run[offsets::IO_PORT..offsets::IO_PORT + 2].copy_from_slice(&port.to_le_bytes());
        run[offsets::IO_COUNT..offsets::IO_COUNT + 4].copy_from_slice(&1u32.to_le_bytes());
        run[offsets::IO_DATA_OFFSET..offsets::IO_DATA_OFFSET + 8]
            .copy_from_slice(&(DATA_OFFSET as u64).to_le_bytes());
        run[DATA_OFFSET..DATA_OFFSET + data.len()].copy_from_slice(data);
        run
    }

    pub(crate) fn halt_exit() -> Vec<u8> {
        run_with_reason(KVM_EXIT_HLT)
    }

    pub(crate) fn shutdown_exit() -> Vec<u8> {
        run_with_reason(KVM_EXIT_SHUTDOWN)
    }

    pub(crate) fn intr_exit() -> Vec<u8> {
        run_with_reason(KVM_EXIT_INTR)
    }

    #[test]
    fn test_exit_reason_offset_matches_bindings() {
        assert_eq!(
            std::mem::offset_of!(kvm_run, exit_reason),
            offsets::EXIT_REASON
        );
        assert!(MIN_RUN_SIZE > offsets::IO_DATA_OFFSET + 8);
    }

    #[test]
    fn test_decode_halt() {
        let run = halt_exit();
        assert!(matches!(decode(&run).unwrap(), VmExit::Halt));
    }

    #[test]
    fn test_decode_pio_out() {
        let run = pio_exit(KVM_EXIT_IO_OUT, 0x3f8, b"4");
        match decode(&run).unwrap() {
            VmExit::Io(pio) => {
                assert_eq!(pio.direction, PioDirection::Out);
                assert_eq!(pio.port, 0x3f8);
                assert_eq!(pio.size, 1);
                assert_eq!(pio.count, 1);
                assert_eq!(pio.data, b"4");
            }
            other => panic!("unexpected exit {other:?}"),
        }
    }

    #[test]
    fn test_decode_pio_in() {
        let run = pio_exit(KVM_EXIT_IO_IN, 0x3fd, &[0]);
        match decode(&run).unwrap() {
            VmExit::Io(pio) => assert_eq!(pio.direction, PioDirection::In),
            other => panic!("unexpected exit {other:?}"),
        }
    }

    #[test]
    fn test_decode_fail_entry_reason() {
        let mut run = run_with_reason(KVM_EXIT_FAIL_ENTRY);
        run[offsets::FAIL_ENTRY_REASON..offsets::FAIL_ENTRY_REASON + 8]
            .copy_from_slice(&0x80000021u64.to_le_bytes());
        assert!(matches!(
            decode(&run).unwrap(),
            VmExit::FailEntry {
                hardware_reason: 0x80000021
            }
        ));
    }

    #[test]
    fn test_display_carries_detail() {
        let exit = VmExit::InternalError { suberror: 1 };
        assert_eq!(exit.to_string(), "KVM internal error, suberror 1");
    }

    #[test]
    fn test_decode_unknown_reason() {
        let run = run_with_reason(0xdead);
        let exit = decode(&run).unwrap();
        assert!(matches!(exit, VmExit::Other(0xdead)));
        assert_eq!(exit.reason(), 0xdead);
    }

    #[test]
    fn test_pio_data_out_of_bounds() {
        let mut run = pio_exit(KVM_EXIT_IO_OUT, 0x3f8, b"x");
        run[offsets::IO_DATA_OFFSET..offsets::IO_DATA_OFFSET + 8]
            .copy_from_slice(&(RUN_SIZE as u64).to_le_bytes());
        assert!(matches!(decode(&run), Err(KvmError::MalformedExit(_))));
    }

    #[test]
    fn test_bad_direction() {
        let mut run = pio_exit(KVM_EXIT_IO_OUT, 0x3f8, b"x");
        run[offsets::IO_DIRECTION] = 7;
        assert!(matches!(decode(&run), Err(KvmError::MalformedExit(_))));
    }

    #[test]
    fn test_truncated_run_structure() {
        assert!(matches!(decode(&[0u8; 4]), Err(KvmError::MalformedExit(_))));
    }

    #[test]
    fn test_mapping_size_check() {
        assert!(check_mapping_size(MIN_RUN_SIZE).is_ok());
        assert!(matches!(
            check_mapping_size(MIN_RUN_SIZE - 1),
            Err(KvmError::RunStructureMapFailed { .. })
        ));
    }
}
