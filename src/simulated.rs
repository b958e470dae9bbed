//! A synthetic address space.
//!
//! [`SimulatedMemory`] lays regions out back to back from a starting address and
//! enforces protections on reads and writes the way the live backend would, so walks and
//! patch transactions can be exercised deterministically on any platform. Failures can
//! be injected per address.

use std::cell::RefCell;

use crate::error::{Error, Result};
use crate::memory::{AddressBounds, AddressSpace, RegionInfo, RegionKind, RegionState, PAGE_SIZE};
use crate::protection::Protection;

// Win32 codes reported by the injected failures.
const ERROR_ACCESS_DENIED: u32 = 5;
const ERROR_INVALID_ADDRESS: u32 = 487;

#[derive(Clone, Debug)]
struct SimRegion {
    info: RegionInfo,
    bytes: Vec<u8>,
}

/// Builder-style synthetic address space.
#[derive(Debug)]
pub struct SimulatedMemory {
    lowest: usize,
    next: usize,
    regions: RefCell<Vec<SimRegion>>,
    failing_queries: Vec<usize>,
    denied_protect: Vec<usize>,
}

impl SimulatedMemory {
    /// Start an empty address space whose first region begins at `lowest`.
    pub fn new(lowest: usize) -> Self {
        Self {
            lowest,
            next: lowest,
            regions: RefCell::new(Vec::new()),
            failing_queries: Vec::new(),
            denied_protect: Vec::new(),
        }
    }

    fn push(mut self, size: usize, state: RegionState, kind: RegionKind, protect: u32, bytes: Vec<u8>) -> Self {
        let size = round_to_page(size);
        let info = RegionInfo {
            base: self.next,
            size,
            state,
            kind,
            protect,
        };
        self.next += size;
        self.regions.get_mut().push(SimRegion { info, bytes });
        self
    }

    /// Append a free region.
    pub fn free(self, size: usize) -> Self {
        self.push(size, RegionState::Free, RegionKind::Private, 0, Vec::new())
    }

    /// Append a reserved region.
    pub fn reserve(self, size: usize, kind: RegionKind) -> Self {
        self.push(size, RegionState::Reserved, kind, 0, Vec::new())
    }

    /// Append a zero-filled committed region.
    pub fn commit(self, size: usize, kind: RegionKind, protect: u32) -> Self {
        let size = round_to_page(size);
        self.push(size, RegionState::Committed, kind, protect, vec![0; size])
    }

    /// Append a committed region whose first bytes are `data`.
    pub fn commit_bytes(self, kind: RegionKind, protect: u32, data: &[u8]) -> Self {
        let size = round_to_page(data.len().max(1));
        let mut bytes = data.to_vec();
        bytes.resize(size, 0);
        self.push(size, RegionState::Committed, kind, protect, bytes)
    }

    /// Make every query of an address inside the region at `addr` fail.
    pub fn fail_query_at(mut self, addr: usize) -> Self {
        self.failing_queries.push(addr);
        self
    }

    /// Refuse protection changes on the region containing `addr`.
    pub fn deny_protect_at(mut self, addr: usize) -> Self {
        self.denied_protect.push(addr);
        self
    }

    /// Address the next appended region would start at.
    pub fn end(&self) -> usize {
        self.next
    }

    /// Inspect bytes regardless of protection.
    pub fn peek(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let regions = self.regions.borrow();
        let region = regions.iter().find(|r| r.info.contains(addr))?;
        let offset = addr - region.info.base;
        region.bytes.get(offset..offset + len).map(|b| b.to_vec())
    }

    /// Current protection of the region containing `addr`.
    pub fn protection_at(&self, addr: usize) -> Option<u32> {
        let regions = self.regions.borrow();
        regions
            .iter()
            .find(|r| r.info.contains(addr))
            .map(|r| r.info.protect)
    }

    fn find(&self, addr: usize, len: usize) -> Option<usize> {
        let regions = self.regions.borrow();
        regions.iter().position(|r| {
            r.info.contains(addr) && addr + len <= r.info.base + r.info.size
        })
    }

    fn committed_region(&self, addr: usize, len: usize) -> Option<usize> {
        let idx = self.find(addr, len)?;
        (self.regions.borrow()[idx].info.state == RegionState::Committed).then_some(idx)
    }
}

fn round_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

impl AddressSpace for SimulatedMemory {
    fn query(&self, addr: usize) -> Result<RegionInfo> {
        let regions = self.regions.borrow();
        let region = regions
            .iter()
            .find(|r| r.info.contains(addr))
            .ok_or(Error::RegionQuery {
                addr,
                code: ERROR_INVALID_ADDRESS,
            })?;

        if self.failing_queries.iter().any(|&a| region.info.contains(a)) {
            return Err(Error::RegionQuery {
                addr,
                code: ERROR_ACCESS_DENIED,
            });
        }

        Ok(region.info)
    }

    fn protect(&self, addr: usize, len: usize, protect: u32) -> Result<u32> {
        let idx = match self.committed_region(addr, len.max(1)) {
            Some(idx) => idx,
            None => {
                return Err(Error::Protect {
                    addr,
                    len,
                    code: ERROR_INVALID_ADDRESS,
                })
            }
        };

        let mut regions = self.regions.borrow_mut();
        let region = &mut regions[idx];
        if self.denied_protect.iter().any(|&a| region.info.contains(a)) {
            return Err(Error::Protect {
                addr,
                len,
                code: ERROR_ACCESS_DENIED,
            });
        }

        let old = region.info.protect;
        region.info.protect = protect;
        Ok(old)
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<()> {
        let size = buf.len();
        let failed = || Error::MemoryReadFailed { addr, size };
        let idx = self.committed_region(addr, size).ok_or_else(failed)?;

        let regions = self.regions.borrow();
        let region = &regions[idx];
        if !Protection(region.info.protect).is_readable() {
            return Err(failed());
        }

        let offset = addr - region.info.base;
        buf.copy_from_slice(&region.bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, addr: usize, data: &[u8]) -> Result<()> {
        let failed = || Error::MemoryWriteFailed {
            addr,
            size: data.len(),
        };
        let idx = self.committed_region(addr, data.len()).ok_or_else(failed)?;

        let mut regions = self.regions.borrow_mut();
        let region = &mut regions[idx];
        if !Protection(region.info.protect).is_writable() {
            return Err(failed());
        }

        let offset = addr - region.info.base;
        region.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn bounds(&self) -> AddressBounds {
        AddressBounds::new(self.lowest, self.next)
    }
}
