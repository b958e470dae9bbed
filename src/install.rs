//! Installing and uninstalling patch definitions.
//!
//! A [`PatchDefinition`] is plain data: a feature name and the sites it changes. The
//! [`Installer`] resolves every site first, then applies all writes in one
//! [`PatchTransaction`]. Install is all-or-nothing: if any write fails the transaction is
//! rolled back and the process code is left as it was. Uninstall restores the retained
//! records best-effort and reports whatever could not be put back.

use std::collections::HashMap;
use std::fmt;

use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind};
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::memory::AddressSpace;
use crate::patch::{restore_all, Branch, PatchTransaction, WriteRecord, REL32_BRANCH_LEN};
use crate::signature::{CodeLocation, Resolver, VariantId};

/// One change made by a patch.
#[derive(Clone, Debug)]
pub enum PatchSite {
    /// Overwrite the bytes at the location.
    Bytes { location: CodeLocation, bytes: Vec<u8> },
    /// Overwrite a 32-bit value at the location.
    U32 { location: CodeLocation, value: u32 },
    /// Write `call destination` at the location.
    Call { location: CodeLocation, destination: usize },
    /// Write `jmp destination` at the location.
    Jump { location: CodeLocation, destination: usize },
    /// Write `call destination` at the location, remembering the target of a branch that
    /// is already there so the new handler can forward to it.
    ChainedCall { location: CodeLocation, destination: usize },
}

impl PatchSite {
    pub fn location(&self) -> &CodeLocation {
        match self {
            Self::Bytes { location, .. }
            | Self::U32 { location, .. }
            | Self::Call { location, .. }
            | Self::Jump { location, .. }
            | Self::ChainedCall { location, .. } => location,
        }
    }
}

/// A named set of sites installed and removed together.
#[derive(Clone, Debug)]
pub struct PatchDefinition {
    pub name: String,
    pub sites: Vec<PatchSite>,
}

impl PatchDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sites: Vec::new(),
        }
    }

    pub fn with_site(mut self, site: PatchSite) -> Self {
        self.sites.push(site);
        self
    }
}

/// State owned by an installed patch; hand it back to [`Installer::uninstall`].
#[derive(Debug)]
pub struct InstalledPatch {
    name: String,
    records: Vec<WriteRecord>,
    chained: HashMap<String, Option<usize>>,
}

impl InstalledPatch {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of writes that uninstall will restore.
    pub fn write_count(&self) -> usize {
        self.records.len()
    }

    /// Previous branch target found at a chained site, if there was one.
    pub fn next_handler(&self, location: &str) -> Option<usize> {
        self.chained.get(location).copied().flatten()
    }
}

/// Boolean result of an install or uninstall with a reason for operators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub reason: String,
}

impl Outcome {
    /// Summarize `result` of `action` ("install", "uninstall") on patch `name`.
    pub fn from_result<T>(action: &str, name: &str, result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self {
                success: true,
                reason: format!("{} {}: ok", action, name),
            },
            Err(e) => Self {
                success: false,
                reason: format!("{} {}: {}", action, name, e),
            },
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.success { "[OK]" } else { "[FAILURE]" };
        write!(f, "{} {}", tag, self.reason)
    }
}

/// Applies [`PatchDefinition`]s to an address space for one running build.
pub struct Installer<'m, M: AddressSpace + ?Sized> {
    memory: &'m M,
    resolver: Resolver<'m, M>,
}

impl<'m, M: AddressSpace + ?Sized> Installer<'m, M> {
    pub fn new(memory: &'m M, variant: impl Into<VariantId>) -> Self {
        Self {
            memory,
            resolver: Resolver::new(memory, variant),
        }
    }

    pub fn resolver(&self) -> &Resolver<'m, M> {
        &self.resolver
    }

    /// Resolve and apply every site of `patch` as one unit.
    pub fn install(&self, patch: &PatchDefinition) -> Result<InstalledPatch> {
        // Nothing is touched until every site has been located.
        let resolved = patch
            .sites
            .iter()
            .map(|site| self.resolver.try_resolve(site.location()).map(|addr| (site, addr)))
            .collect::<Result<Vec<_>>>()?;

        let mut tx = PatchTransaction::new(self.memory);
        let mut chained = HashMap::new();
        let mut failed = 0;

        for &(site, addr) in &resolved {
            if let Err(e) = self.apply_site(&mut tx, site, addr, &mut chained) {
                warn!("{}: site {} at 0x{:X} failed: {}", patch.name, site.location(), addr, e);
                failed += 1;
            }
        }

        if failed > 0 {
            if let Err(e) = tx.rollback() {
                error!("{}: rollback incomplete: {}", patch.name, e);
            }
            return Err(Error::InstallFailed {
                name: patch.name.clone(),
                failed,
                total: resolved.len(),
            });
        }

        let records = tx.commit();
        info!("{}: installed {} sites", patch.name, resolved.len());

        Ok(InstalledPatch {
            name: patch.name.clone(),
            records,
            chained,
        })
    }

    /// Restore everything `patch` changed.
    ///
    /// Restoration continues past failures; on error some bytes may still be patched.
    pub fn uninstall(&self, patch: InstalledPatch) -> Result<()> {
        match restore_all(self.memory, &patch.records) {
            Ok(()) => {
                info!("{}: uninstalled", patch.name);
                Ok(())
            }
            Err(e) => {
                error!("{}: uninstall left code patched: {}", patch.name, e);
                Err(e)
            }
        }
    }

    fn apply_site(
        &self,
        tx: &mut PatchTransaction<'m, M>,
        site: &PatchSite,
        addr: usize,
        chained: &mut HashMap<String, Option<usize>>,
    ) -> Result<()> {
        match site {
            PatchSite::Bytes { bytes, .. } => tx.write_bytes(addr, bytes),
            PatchSite::U32 { value, .. } => tx.write_u32(addr, *value),
            PatchSite::Call { destination, .. } => tx.write_branch(addr, *destination, Branch::Call),
            PatchSite::Jump { destination, .. } => tx.write_branch(addr, *destination, Branch::Jump),
            PatchSite::ChainedCall {
                location,
                destination,
            } => {
                let previous = existing_branch_target(self.memory, addr)
                    .filter(|&target| target != *destination);
                if let Some(target) = previous {
                    info!("{}: chaining to previous handler at 0x{:X}", location, target);
                }
                tx.write_branch(addr, *destination, Branch::Call)?;
                chained.insert(location.name().to_string(), previous);
                Ok(())
            }
        }
    }
}

/// Target of the near `call`/`jmp` at `addr`, if that is what the code there is.
pub fn existing_branch_target<M: AddressSpace + ?Sized>(memory: &M, addr: usize) -> Option<usize> {
    let mut code = [0u8; REL32_BRANCH_LEN];
    memory.read(addr, &mut code).ok()?;

    let mut decoder = Decoder::with_ip(usize::BITS, &code, addr as u64, DecoderOptions::NONE);
    let instr = decoder.decode();

    if !matches!(instr.mnemonic(), Mnemonic::Call | Mnemonic::Jmp) {
        return None;
    }

    match instr.op0_kind() {
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Some(instr.near_branch_target() as usize)
        }
        _ => None,
    }
}
