//! # vmpatch
//!
//! In-process address-space statistics and transactional code patching.
//!
//! ## Overview
//!
//! The crate has two halves that share one view of process memory, the [`AddressSpace`]
//! trait:
//!
//! 1. A walker that visits every region between the lowest and highest application
//!    addresses and builds a [`Snapshot`]: pages per state, per protection class and per
//!    region type, plus a power-of-two histogram of free spans. [`report::render`] turns
//!    it into the text report.
//! 2. A patcher that locates code by per-build address plus byte signature
//!    ([`Resolver`]), applies writes through a [`PatchTransaction`] that remembers every
//!    original byte and protection, and installs named [`PatchDefinition`]s all-or-nothing.
//!
//! [`SimulatedMemory`] implements the same trait over an in-memory region table so all
//! of the above can be tested without touching a live process.
//!
//! ## Usage as DLL
//!
//! When compiled as a DLL and injected into a host process, the library opens an
//! interactive console for inspecting the host's address space.

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod error;
pub mod protection;
pub mod memory;
pub mod simulated;
pub mod layout;
pub mod report;
pub mod signature;
pub mod patch;
pub mod install;
pub mod invoke;
pub mod console;

pub use error::{Error, Result};
pub use memory::{AddressBounds, AddressSpace, CurrentProcess, RegionInfo, RegionKind, RegionState};
pub use simulated::SimulatedMemory;
pub use layout::{walk, walk_range, ProtectionClass, Snapshot};
pub use report::render;
pub use signature::{CodeLocation, Pattern, Resolver, Token, VariantId};
pub use patch::{restore_all, Branch, PatchTransaction, TransactionState, WriteRecord};
pub use install::{InstalledPatch, Installer, Outcome, PatchDefinition, PatchSite};
pub use invoke::{CallConv, RawCode};
pub use console::{start_console, stop_console};

// DLL entry point for Windows
#[cfg(target_os = "windows")]
#[no_mangle]
pub extern "system" fn DllMain(
    _hinst_dll: *mut std::ffi::c_void,
    fdw_reason: u32,
    _lpv_reserved: *mut std::ffi::c_void,
) -> i32 {
    const DLL_PROCESS_ATTACH: u32 = 1;
    const DLL_PROCESS_DETACH: u32 = 0;

    match fdw_reason {
        DLL_PROCESS_ATTACH => {
            // Loader lock is held here
            std::thread::spawn(start_console);
        }
        DLL_PROCESS_DETACH => {
            stop_console();
        }
        _ => {}
    }

    1 // TRUE
}
