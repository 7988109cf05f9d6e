//! Guest physical memory backed by vm-memory.
//!
//! The guest gets a single region, one page at `0x1000` by default:
//!
//! ```text
//! 0x0000 ┌─────────────────┐
//!        │ (unbacked)      │
//! 0x1000 ├─────────────────┤ ← load address, initial RIP
//!        │ guest program   │
//!        │ zero fill       │
//! 0x2000 └─────────────────┘
//! ```
//!
//! The host owns the buffer. KVM only holds a reference to it once the region
//! is registered, so the region must outlive the VM it is registered with.

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

/// Host page size; region sizes and bases must be multiples of it.
pub const PAGE_SIZE: u64 = 0x1000;

/// Fixed guest memory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestLayout {
    /// Guest-physical base of the region; the program is loaded here and
    /// execution starts here.
    pub load_addr: u64,
    /// Bytes available to the guest.
    pub region_size: u64,
}

impl GuestLayout {
    pub const DEFAULT_LOAD_ADDR: u64 = 0x1000;
    pub const DEFAULT_REGION_SIZE: u64 = PAGE_SIZE;
}

impl Default for GuestLayout {
    fn default() -> Self {
        Self {
            load_addr: Self::DEFAULT_LOAD_ADDR,
            region_size: Self::DEFAULT_REGION_SIZE,
        }
    }
}

/// Errors from allocating and filling guest memory.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to allocate {size:#x} bytes of guest memory at {base:#x}: {reason}")]
    AllocationFailed { base: u64, size: u64, reason: String },

    #[error("Failed to load {len} bytes at offset {offset:#x}: {reason}")]
    LoadFailed {
        len: usize,
        offset: u64,
        reason: String,
    },

    #[error("Guest memory access at {addr:#x} ({len} bytes) is out of bounds")]
    OutOfBounds { addr: u64, len: usize },
}

/// One contiguous, anonymous, zero-filled guest memory region.
pub struct GuestRegion {
    inner: GuestMemoryMmap,
    base: u64,
    size: u64,
}

impl GuestRegion {
    /// Allocate `size` bytes of read/write memory to appear at guest-physical
    /// address `base`.
    pub fn allocate(base: u64, size: u64) -> Result<Self, MemoryError> {
        let fail = |reason: String| MemoryError::AllocationFailed { base, size, reason };

        if size == 0 {
            return Err(fail("size must be nonzero".to_string()));
        }
        if !size.is_multiple_of(PAGE_SIZE) || !base.is_multiple_of(PAGE_SIZE) {
            return Err(fail(format!("must be aligned to {PAGE_SIZE:#x}")));
        }
        let len = usize::try_from(size).map_err(|e| fail(e.to_string()))?;

        let inner = GuestMemoryMmap::from_ranges(&[(GuestAddress(base), len)])
            .map_err(|e| fail(e.to_string()))?;

        Ok(Self { inner, base, size })
    }

    pub fn guest_base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Host virtual address of the start of the region, for KVM registration.
    pub fn host_address(&self) -> Result<u64, MemoryError> {
        self.inner
            .get_host_address(GuestAddress(self.base))
            .map(|ptr| ptr as u64)
            .map_err(|_| MemoryError::OutOfBounds {
                addr: self.base,
                len: 0,
            })
    }

    /// Copy `bytes` into the region starting `offset` bytes past its base.
    ///
    /// Anything short of a full copy is a failure: an empty program, or one
    /// that does not fit, is rejected instead of truncated.
    pub fn load(&self, bytes: &[u8], offset: u64) -> Result<usize, MemoryError> {
        let fail = |reason: String| MemoryError::LoadFailed {
            len: bytes.len(),
            offset,
            reason,
        };

        if bytes.is_empty() {
            return Err(fail("nothing to copy".to_string()));
        }
        let end = offset.checked_add(bytes.len() as u64);
        if !end.is_some_and(|end| end <= self.size) {
            return Err(fail(format!("does not fit in {:#x}-byte region", self.size)));
        }

        self.inner
            .write_slice(bytes, GuestAddress(self.base + offset))
            .map_err(|e| fail(e.to_string()))?;

        Ok(bytes.len())
    }

    /// Read guest memory `offset` bytes past the region base.
    pub fn read(&self, offset: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        let addr = self.base.saturating_add(offset);
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }
}
