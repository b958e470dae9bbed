//! Memory regions and the address-space backends.
//!
//! Everything that touches the process address space goes through [`AddressSpace`]:
//! region queries, protection changes, reads, writes and instruction-cache flushes.
//! [`CurrentProcess`] is the live Win32 implementation; other platforms get a stub that
//! reports [`Error::Unsupported`](crate::Error::Unsupported).

use crate::error::{Error, Result};

#[cfg(target_os = "windows")]
use windows::Win32::{
    System::Diagnostics::Debug::{FlushInstructionCache, ReadProcessMemory, WriteProcessMemory},
    System::Memory::{VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, PAGE_PROTECTION_FLAGS},
    System::SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    System::Threading::GetCurrentProcess,
};

/// Page size exponent.
pub const PAGE_SHIFT: u32 = 12;
/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

// Raw region states and types as reported by VirtualQuery.
pub const MEM_COMMIT: u32 = 0x1000;
pub const MEM_RESERVE: u32 = 0x2000;
pub const MEM_FREE: u32 = 0x10000;
pub const MEM_PRIVATE: u32 = 0x20000;
pub const MEM_MAPPED: u32 = 0x40000;
pub const MEM_IMAGE: u32 = 0x100_0000;

/// Allocation state of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionState {
    Free,
    Reserved,
    Committed,
}

impl RegionState {
    /// Decode a raw `MEM_*` state value.
    pub fn from_raw(state: u32) -> Self {
        match state {
            MEM_COMMIT => Self::Committed,
            MEM_RESERVE => Self::Reserved,
            _ => Self::Free,
        }
    }
}

/// Backing object of a reserved or committed region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    Mapped,
    Image,
    Private,
}

impl RegionKind {
    /// Decode a raw `MEM_*` type value. Anything that is neither mapped nor image is private.
    pub fn from_raw(kind: u32) -> Self {
        match kind {
            MEM_MAPPED => Self::Mapped,
            MEM_IMAGE => Self::Image,
            _ => Self::Private,
        }
    }

    /// Counter slot used by the layout snapshot.
    pub fn index(self) -> usize {
        match self {
            Self::Mapped => 0,
            Self::Image => 1,
            Self::Private => 2,
        }
    }
}

/// One region as returned by a region query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    /// Start address of the region.
    pub base: usize,
    /// Size in bytes (always a whole number of pages).
    pub size: usize,
    /// Allocation state.
    pub state: RegionState,
    /// Backing type. Ignored for free regions.
    pub kind: RegionKind,
    /// Protection flags. Only meaningful for committed regions.
    pub protect: u32,
}

impl RegionInfo {
    /// Number of whole pages in the region.
    pub fn pages(&self) -> u64 {
        (self.size >> PAGE_SHIFT) as u64
    }

    /// End address (exclusive), or `None` if it would wrap.
    pub fn end(&self) -> Option<usize> {
        self.base.checked_add(self.size)
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && self.end().map_or(true, |end| addr < end)
    }
}

/// The queryable part of an address space: `[lowest, highest)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressBounds {
    /// Lowest address that can be queried.
    pub lowest: usize,
    /// One past the highest usable address.
    pub highest: usize,
}

impl AddressBounds {
    pub fn new(lowest: usize, highest: usize) -> Self {
        Self { lowest, highest }
    }

    /// Size of the range in bytes.
    pub fn len(&self) -> usize {
        self.highest.saturating_sub(self.lowest)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AddressBounds {
    /// Classic 2 GiB user-mode layout: the first and last 64 KiB are unusable.
    fn default() -> Self {
        Self {
            lowest: 0x1_0000,
            highest: 0x7FFF_0000,
        }
    }
}

/// Read/write/query access to an address space.
///
/// Methods take `&self`: the live backend mutates the process itself, not the handle.
pub trait AddressSpace {
    /// Describe the region containing `addr`.
    fn query(&self, addr: usize) -> Result<RegionInfo>;

    /// Change the protection of `[addr, addr + len)` and return the previous value.
    fn protect(&self, addr: usize, len: usize, protect: u32) -> Result<u32>;

    /// Copy `buf.len()` bytes starting at `addr` into `buf`.
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` to `addr`. The range must already be writable.
    fn write(&self, addr: usize, data: &[u8]) -> Result<()>;

    /// Make freshly written code visible to the instruction fetcher.
    fn flush_instruction_cache(&self, _addr: usize, _len: usize) -> Result<()> {
        Ok(())
    }

    /// Queryable range of this address space.
    fn bounds(&self) -> AddressBounds;
}

/// The address space of the running process.
#[derive(Clone, Copy, Debug, Default)]
pub struct CurrentProcess;

impl CurrentProcess {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "windows")]
fn last_os_error() -> u32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32
}

#[cfg(target_os = "windows")]
fn win32_code(err: &windows::core::Error) -> u32 {
    // HRESULT_FROM_WIN32 keeps the Win32 code in the low word.
    (err.code().0 as u32) & 0xFFFF
}

#[cfg(target_os = "windows")]
impl AddressSpace for CurrentProcess {
    fn query(&self, addr: usize) -> Result<RegionInfo> {
        let mut mbi = MEMORY_BASIC_INFORMATION::default();

        let result = unsafe {
            VirtualQuery(
                Some(addr as *const _),
                &mut mbi,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };

        if result == 0 {
            return Err(Error::RegionQuery {
                addr,
                code: last_os_error(),
            });
        }

        Ok(RegionInfo {
            base: mbi.BaseAddress as usize,
            size: mbi.RegionSize,
            state: RegionState::from_raw(mbi.State.0),
            kind: RegionKind::from_raw(mbi.Type.0),
            protect: mbi.Protect.0,
        })
    }

    fn protect(&self, addr: usize, len: usize, protect: u32) -> Result<u32> {
        let mut old = PAGE_PROTECTION_FLAGS::default();

        unsafe { VirtualProtect(addr as *const _, len, PAGE_PROTECTION_FLAGS(protect), &mut old) }
            .map_err(|e| Error::Protect {
                addr,
                len,
                code: win32_code(&e),
            })?;

        Ok(old.0)
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let mut bytes_read: usize = 0;
        let ok = unsafe {
            ReadProcessMemory(
                GetCurrentProcess(),
                addr as *const _,
                buf.as_mut_ptr() as *mut _,
                buf.len(),
                Some(&mut bytes_read),
            )
            .is_ok()
        };

        if ok && bytes_read == buf.len() {
            Ok(())
        } else {
            Err(Error::MemoryReadFailed {
                addr,
                size: buf.len(),
            })
        }
    }

    fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        let mut bytes_written: usize = 0;
        let ok = unsafe {
            WriteProcessMemory(
                GetCurrentProcess(),
                addr as *const _,
                data.as_ptr() as *const _,
                data.len(),
                Some(&mut bytes_written),
            )
            .is_ok()
        };

        if ok && bytes_written == data.len() {
            Ok(())
        } else {
            Err(Error::MemoryWriteFailed {
                addr,
                size: data.len(),
            })
        }
    }

    fn flush_instruction_cache(&self, addr: usize, len: usize) -> Result<()> {
        unsafe { FlushInstructionCache(GetCurrentProcess(), Some(addr as *const _), len) }
            .map_err(|e| Error::Protect {
                addr,
                len,
                code: win32_code(&e),
            })
    }

    fn bounds(&self) -> AddressBounds {
        let mut info = SYSTEM_INFO::default();
        unsafe { GetSystemInfo(&mut info) };

        AddressBounds {
            lowest: info.lpMinimumApplicationAddress as usize,
            highest: (info.lpMaximumApplicationAddress as usize).saturating_add(1),
        }
    }
}

// Stub implementation for non-Windows
#[cfg(not(target_os = "windows"))]
impl AddressSpace for CurrentProcess {
    fn query(&self, _addr: usize) -> Result<RegionInfo> {
        Err(Error::Unsupported("region query"))
    }

    fn protect(&self, _addr: usize, _len: usize, _protect: u32) -> Result<u32> {
        Err(Error::Unsupported("protection change"))
    }

    fn read(&self, _addr: usize, _buf: &mut [u8]) -> Result<()> {
        Err(Error::Unsupported("memory read"))
    }

    fn write(&self, _addr: usize, _data: &[u8]) -> Result<()> {
        Err(Error::Unsupported("memory write"))
    }

    fn bounds(&self) -> AddressBounds {
        AddressBounds::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_decoding() {
        assert_eq!(RegionState::from_raw(MEM_COMMIT), RegionState::Committed);
        assert_eq!(RegionState::from_raw(MEM_RESERVE), RegionState::Reserved);
        assert_eq!(RegionState::from_raw(MEM_FREE), RegionState::Free);
        assert_eq!(RegionKind::from_raw(MEM_IMAGE), RegionKind::Image);
        assert_eq!(RegionKind::from_raw(MEM_MAPPED), RegionKind::Mapped);
        assert_eq!(RegionKind::from_raw(MEM_PRIVATE), RegionKind::Private);
        assert_eq!(RegionKind::from_raw(0), RegionKind::Private);
    }

    #[test]
    fn test_region_pages_and_end() {
        let region = RegionInfo {
            base: 0x10000,
            size: 0x3000,
            state: RegionState::Committed,
            kind: RegionKind::Private,
            protect: 0x04,
        };
        assert_eq!(region.pages(), 3);
        assert_eq!(region.end(), Some(0x13000));
        assert!(region.contains(0x12FFF));
        assert!(!region.contains(0x13000));
    }

    #[test]
    fn test_default_bounds() {
        let bounds = AddressBounds::default();
        assert_eq!(bounds.len(), 0x7FFE_0000);
        assert!(!bounds.is_empty());
    }
}
