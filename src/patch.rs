//! Transactional in-process patching.
//!
//! A [`PatchTransaction`] applies writes one at a time, each under a temporary
//! `PAGE_EXECUTE_READWRITE` protection, and remembers the original bytes and protection
//! of every range it touched. The caller decides the policy: it checks every write and
//! then either commits (writes stay, records are handed back for a later uninstall) or
//! rolls back (every range is restored). Dropping an open transaction rolls it back.
//!
//! Writes inside one transaction must not overlap; an overlapping write is rejected so
//! that restoring the records in reverse order always reproduces the original bytes.

use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::memory::{AddressSpace, PAGE_SHIFT};
use crate::protection::{Protection, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE};

/// Length of an `E8`/`E9` rel32 branch.
pub const REL32_BRANCH_LEN: usize = 5;

const OPCODE_CALL_REL32: u8 = 0xE8;
const OPCODE_JMP_REL32: u8 = 0xE9;

/// Kind of relative branch written by [`PatchTransaction::write_branch`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Branch {
    Call,
    Jump,
}

impl Branch {
    pub fn opcode(self) -> u8 {
        match self {
            Self::Call => OPCODE_CALL_REL32,
            Self::Jump => OPCODE_JMP_REL32,
        }
    }
}

/// Everything needed to undo one write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    /// Start of the written range.
    pub addr: usize,
    /// Bytes that were there before the write.
    pub original: Vec<u8>,
    /// Protection the range had before the write.
    pub protect: u32,
}

impl WriteRecord {
    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }

    /// One past the last written byte, `None` if the range ends at the top of the
    /// address space.
    pub fn end(&self) -> Option<usize> {
        self.addr.checked_add(self.original.len())
    }

    fn overlaps(&self, addr: usize, len: usize) -> bool {
        let end = addr.saturating_add(len);
        addr < self.end().unwrap_or(usize::MAX) && self.addr < end
    }

    /// Whether the write at `addr..addr + len` touches any page this record touches.
    fn shares_page(&self, addr: usize, len: usize) -> bool {
        let last_page = |start: usize, len: usize| start.saturating_add(len - 1) >> PAGE_SHIFT;
        addr >> PAGE_SHIFT <= last_page(self.addr, self.len())
            && self.addr >> PAGE_SHIFT <= last_page(addr, len)
    }
}

/// Lifecycle of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

/// An ordered set of reversible writes.
///
/// Committing or rolling back consumes the transaction, so no write can follow a
/// terminal state.
pub struct PatchTransaction<'m, M: AddressSpace + ?Sized> {
    memory: &'m M,
    records: Vec<WriteRecord>,
    state: TransactionState,
}

impl<'m, M: AddressSpace + ?Sized> PatchTransaction<'m, M> {
    /// Open an empty transaction against `memory`.
    pub fn new(memory: &'m M) -> Self {
        Self {
            memory,
            records: Vec::new(),
            state: TransactionState::Open,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Writes applied so far, in order.
    pub fn records(&self) -> &[WriteRecord] {
        &self.records
    }

    /// Overwrite `data.len()` bytes at `addr`.
    ///
    /// On failure nothing is recorded and the range keeps (or gets back) its original
    /// protection. Earlier writes are left in place; rolling back is up to the caller.
    pub fn write_bytes(&mut self, addr: usize, data: &[u8]) -> Result<()> {
        let len = data.len();
        if len == 0 {
            return Err(Error::EmptyWrite(addr));
        }
        if addr.checked_add(len).is_none() {
            return Err(Error::MemoryWriteFailed { addr, size: len });
        }
        if self.records.iter().any(|r| r.overlaps(addr, len)) {
            return Err(Error::OverlappingWrite { addr, len });
        }

        let old = self.memory.protect(addr, len, PAGE_EXECUTE_READWRITE)?;
        // A page opened by an earlier write reports the temporary protection.
        let protect = self
            .records
            .iter()
            .find(|r| r.shares_page(addr, len))
            .map_or(old, |r| r.protect);

        let mut original = vec![0u8; len];
        let written = self
            .memory
            .read(addr, &mut original)
            .and_then(|_| self.memory.write(addr, data));

        if let Err(e) = written {
            if let Err(restore) = self.memory.protect(addr, len, old) {
                warn!("0x{:X}: could not restore protection after failed write: {}", addr, restore);
            }
            return Err(e);
        }

        debug!("patched {} bytes at 0x{:X} (was {})", len, addr, Protection(protect));

        self.records.push(WriteRecord {
            addr,
            original,
            protect,
        });
        Ok(())
    }

    pub fn write_u8(&mut self, addr: usize, value: u8) -> Result<()> {
        self.write_bytes(addr, &[value])
    }

    /// Write a little-endian 32-bit value.
    pub fn write_u32(&mut self, addr: usize, value: u32) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Write a pointer-sized little-endian value.
    pub fn write_usize(&mut self, addr: usize, value: usize) -> Result<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Point the rel32 operand at `operand` to `destination`.
    ///
    /// The displacement is taken from the end of the operand, which for `E8`/`E9` and
    /// `0F 8x` branches is also the end of the instruction.
    pub fn write_rel32(&mut self, operand: usize, destination: usize) -> Result<()> {
        let end = operand.checked_add(4).ok_or(Error::DisplacementOutOfRange {
            from: operand,
            to: destination,
        })?;
        let rel = displacement(end, destination)?;
        self.write_bytes(operand, &rel.to_le_bytes())
    }

    /// Write a complete `call rel32` or `jmp rel32` at `site`.
    pub fn write_branch(&mut self, site: usize, destination: usize, kind: Branch) -> Result<()> {
        let end = site.checked_add(REL32_BRANCH_LEN).ok_or(Error::DisplacementOutOfRange {
            from: site,
            to: destination,
        })?;
        let rel = displacement(end, destination)?;

        let mut buf = [0u8; REL32_BRANCH_LEN];
        buf[0] = kind.opcode();
        buf[1..].copy_from_slice(&rel.to_le_bytes());
        self.write_bytes(site, &buf)
    }

    /// Keep every write and hand back the records needed to undo them later.
    ///
    /// Each range is left at the least protection its code or data needs, which for code
    /// is `PAGE_EXECUTE_READ`.
    pub fn commit(mut self) -> Vec<WriteRecord> {
        let records = std::mem::take(&mut self.records);
        self.state = TransactionState::Committed;

        for record in &records {
            let protect = commit_protection(record.protect);
            if let Err(e) = self.memory.protect(record.addr, record.len(), protect) {
                warn!("0x{:X}: left writable after commit: {}", record.addr, e);
            }
            if let Err(e) = self.memory.flush_instruction_cache(record.addr, record.len()) {
                warn!("0x{:X}: instruction cache flush failed: {}", record.addr, e);
            }
        }

        debug!("committed {} writes", records.len());
        records
    }

    /// Undo every write of this transaction.
    ///
    /// All records are attempted even if some fail.
    pub fn rollback(mut self) -> Result<()> {
        let records = std::mem::take(&mut self.records);
        self.state = TransactionState::RolledBack;
        restore_all(self.memory, &records)
    }
}

impl<M: AddressSpace + ?Sized> Drop for PatchTransaction<'_, M> {
    fn drop(&mut self) {
        if self.state == TransactionState::Open && !self.records.is_empty() {
            warn!("open patch transaction dropped, rolling back {} writes", self.records.len());
            let records = std::mem::take(&mut self.records);
            let _ = restore_all(self.memory, &records);
        }
    }
}

/// Protection a committed range is left with.
pub fn commit_protection(original: u32) -> u32 {
    if Protection(original).is_executable() {
        PAGE_EXECUTE_READ
    } else {
        original
    }
}

/// Signed distance from `from_end` (the end of a branch) to `to`.
pub fn displacement(from_end: usize, to: usize) -> Result<i32> {
    if usize::BITS == 32 {
        // rel32 wraps around the whole 32-bit space.
        return Ok(to.wrapping_sub(from_end) as u32 as i32);
    }

    let rel = to as i128 - from_end as i128;
    i32::try_from(rel).map_err(|_| Error::DisplacementOutOfRange {
        from: from_end,
        to,
    })
}

/// Restore every record, newest first, continuing past failures.
///
/// Used both to roll back an open transaction and to uninstall a committed one. The
/// result is an error if any single restoration failed; the other ranges are still
/// restored.
pub fn restore_all<M: AddressSpace + ?Sized>(memory: &M, records: &[WriteRecord]) -> Result<()> {
    let mut failed = 0;

    for record in records.iter().rev() {
        if let Err(e) = restore_record(memory, record) {
            error!("0x{:X}: restore of {} bytes failed: {}", record.addr, record.len(), e);
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(Error::RestoreIncomplete {
            failed,
            total: records.len(),
        });
    }

    debug!("restored {} writes", records.len());
    Ok(())
}

fn restore_record<M: AddressSpace + ?Sized>(memory: &M, record: &WriteRecord) -> Result<()> {
    let len = record.len();
    let current = memory.protect(record.addr, len, PAGE_EXECUTE_READWRITE)?;

    if let Err(e) = memory.write(record.addr, &record.original) {
        if let Err(restore) = memory.protect(record.addr, len, current) {
            warn!("0x{:X}: could not restore protection after failed restore: {}", record.addr, restore);
        }
        return Err(e);
    }

    memory.protect(record.addr, len, record.protect)?;
    memory.flush_instruction_cache(record.addr, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RegionKind;
    use crate::protection::PAGE_READWRITE;
    use crate::simulated::SimulatedMemory;

    const BASE: usize = 0x401000;
    const CODE: [u8; 16] = [
        0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10, 0xE8, 0x10, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0xC3, 0xCC,
    ];

    fn code_memory() -> SimulatedMemory {
        SimulatedMemory::new(BASE).commit_bytes(RegionKind::Image, PAGE_EXECUTE_READ, &CODE)
    }

    #[test]
    fn test_displacement() {
        assert_eq!(displacement(0x1005, 0x2000).unwrap(), 0xFFB);
        assert_eq!(displacement(0x2005, 0x1000).unwrap(), -0x1005);
        if usize::BITS == 64 {
            assert!(displacement(0x1000, 0x1_0000_1000).is_err());
        }
    }

    #[test]
    fn test_commit_protection() {
        assert_eq!(commit_protection(PAGE_EXECUTE_READ), PAGE_EXECUTE_READ);
        assert_eq!(commit_protection(PAGE_EXECUTE_READWRITE), PAGE_EXECUTE_READ);
        assert_eq!(commit_protection(PAGE_READWRITE), PAGE_READWRITE);
    }

    #[test]
    fn test_write_then_rollback_restores_bytes_and_protection() {
        let mem = code_memory();
        let mut tx = PatchTransaction::new(&mem);

        tx.write_bytes(BASE + 3, &[0x90, 0x90, 0x90]).unwrap();
        assert_eq!(mem.peek(BASE + 3, 3).unwrap(), vec![0x90; 3]);
        assert_eq!(mem.protection_at(BASE), Some(PAGE_EXECUTE_READWRITE));
        assert_eq!(tx.records()[0].original, vec![0x83, 0xEC, 0x10]);

        tx.rollback().unwrap();
        assert_eq!(mem.peek(BASE, CODE.len()).unwrap(), CODE.to_vec());
        assert_eq!(mem.protection_at(BASE), Some(PAGE_EXECUTE_READ));
    }

    #[test]
    fn test_write_branch_encoding() {
        let mem = code_memory();
        let mut tx = PatchTransaction::new(&mem);

        tx.write_branch(BASE + 6, BASE + 0x100, Branch::Call).unwrap();
        tx.write_branch(BASE, BASE, Branch::Jump).unwrap();
        tx.commit();

        // call: 0x100 - (6 + 5) = 0xF5
        assert_eq!(mem.peek(BASE + 6, 5).unwrap(), vec![0xE8, 0xF5, 0x00, 0x00, 0x00]);
        // jmp to itself: -5
        assert_eq!(mem.peek(BASE, 5).unwrap(), vec![0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_write_rel32_operand_only() {
        let mem = code_memory();
        let mut tx = PatchTransaction::new(&mem);

        tx.write_rel32(BASE + 7, BASE + 0x20).unwrap();
        tx.commit();

        assert_eq!(mem.peek(BASE + 6, 5).unwrap(), vec![0xE8, 0x15, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_commit_keeps_writes_and_drops_write_access() {
        let mem = code_memory();
        let mut tx = PatchTransaction::new(&mem);

        tx.write_u32(BASE + 7, 0xAABBCCDD).unwrap();
        let records = tx.commit();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].protect, PAGE_EXECUTE_READ);
        assert_eq!(mem.peek(BASE + 7, 4).unwrap(), vec![0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(mem.protection_at(BASE), Some(PAGE_EXECUTE_READ));

        restore_all(&mem, &records).unwrap();
        assert_eq!(mem.peek(BASE, CODE.len()).unwrap(), CODE.to_vec());
    }

    #[test]
    fn test_same_page_writes_restore_original_protection() {
        let mem = code_memory();
        let mut tx = PatchTransaction::new(&mem);

        tx.write_u8(BASE, 0xCC).unwrap();
        tx.write_u8(BASE + 1, 0xCC).unwrap();
        // Both records carry the protection from before the transaction.
        assert_eq!(tx.records()[1].protect, PAGE_EXECUTE_READ);

        tx.rollback().unwrap();
        assert_eq!(mem.protection_at(BASE), Some(PAGE_EXECUTE_READ));
        assert_eq!(mem.peek(BASE, 2).unwrap(), vec![0x55, 0x8B]);
    }

    #[test]
    fn test_commit_keeps_data_page_writable() {
        let mem = SimulatedMemory::new(BASE).commit(0x1000, RegionKind::Image, PAGE_READWRITE);
        let mut tx = PatchTransaction::new(&mem);

        tx.write_u32(BASE + 0x10, 1).unwrap();
        tx.write_u32(BASE + 0x20, 2).unwrap();
        let records = tx.commit();

        assert!(records.iter().all(|r| r.protect == PAGE_READWRITE));
        assert_eq!(mem.protection_at(BASE), Some(PAGE_READWRITE));
        assert_eq!(mem.peek(BASE + 0x20, 4).unwrap(), vec![2, 0, 0, 0]);

        restore_all(&mem, &records).unwrap();
        assert_eq!(mem.protection_at(BASE), Some(PAGE_READWRITE));
        assert_eq!(mem.peek(BASE + 0x10, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_writes_on_other_pages_keep_their_own_protection() {
        let mem = SimulatedMemory::new(BASE)
            .commit(0x1000, RegionKind::Image, PAGE_READWRITE)
            .commit_bytes(RegionKind::Image, PAGE_EXECUTE_READ, &CODE);
        let mut tx = PatchTransaction::new(&mem);

        tx.write_u8(BASE, 1).unwrap();
        tx.write_u8(BASE + 0x1000, 0xCC).unwrap();
        let records = tx.commit();

        assert_eq!(records[0].protect, PAGE_READWRITE);
        assert_eq!(records[1].protect, PAGE_EXECUTE_READ);
        assert_eq!(mem.protection_at(BASE), Some(PAGE_READWRITE));
        assert_eq!(mem.protection_at(BASE + 0x1000), Some(PAGE_EXECUTE_READ));
    }

    #[test]
    fn test_address_space_top_is_not_wrapped() {
        let mem = code_memory();
        let mut tx = PatchTransaction::new(&mem);

        assert!(matches!(
            tx.write_branch(usize::MAX - 2, BASE, Branch::Jump),
            Err(Error::DisplacementOutOfRange { .. })
        ));
        assert!(matches!(
            tx.write_rel32(usize::MAX - 1, BASE),
            Err(Error::DisplacementOutOfRange { .. })
        ));
        assert!(matches!(
            tx.write_bytes(usize::MAX, &[0x90, 0x90]),
            Err(Error::MemoryWriteFailed { .. })
        ));
        assert!(tx.records().is_empty());
    }

    #[test]
    fn test_rejects_empty_and_overlapping_writes() {
        let mem = code_memory();
        let mut tx = PatchTransaction::new(&mem);

        assert!(matches!(tx.write_bytes(BASE, &[]), Err(Error::EmptyWrite(_))));
        tx.write_bytes(BASE + 4, &[0x90, 0x90]).unwrap();
        assert!(matches!(
            tx.write_bytes(BASE + 5, &[0x90]),
            Err(Error::OverlappingWrite { .. })
        ));
        assert!(tx.write_bytes(BASE + 6, &[0x90]).is_ok());
    }

    #[test]
    fn test_failed_write_is_not_recorded() {
        let mem = code_memory();
        let mut tx = PatchTransaction::new(&mem);

        // Runs past the end of the region.
        assert!(tx.write_bytes(BASE + 0xFFE, &[0; 4]).is_err());
        assert!(tx.records().is_empty());
        assert_eq!(mem.protection_at(BASE), Some(PAGE_EXECUTE_READ));
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() {
        let mem = code_memory();
        {
            let mut tx = PatchTransaction::new(&mem);
            tx.write_u8(BASE, 0xC3).unwrap();
        }
        assert_eq!(mem.peek(BASE, 1).unwrap(), vec![0x55]);
        assert_eq!(mem.protection_at(BASE), Some(PAGE_EXECUTE_READ));
    }

    #[test]
    fn test_restore_all_is_best_effort() {
        let mem = SimulatedMemory::new(BASE)
            .commit_bytes(RegionKind::Image, PAGE_EXECUTE_READ, &CODE)
            .commit_bytes(RegionKind::Image, PAGE_EXECUTE_READ, &CODE);

        let mut tx = PatchTransaction::new(&mem);
        tx.write_u8(BASE, 0xC3).unwrap();
        tx.write_u8(BASE + 0x1000, 0xC3).unwrap();
        let mut records = tx.commit();

        // A record pointing nowhere cannot be restored; the others still are.
        records.push(WriteRecord {
            addr: 0x10,
            original: vec![0],
            protect: PAGE_EXECUTE_READ,
        });

        let err = restore_all(&mem, &records).unwrap_err();
        assert!(matches!(err, Error::RestoreIncomplete { failed: 1, total: 3 }));
        assert_eq!(mem.peek(BASE, 1).unwrap(), vec![0x55]);
        assert_eq!(mem.peek(BASE + 0x1000, 1).unwrap(), vec![0x55]);
    }
}
