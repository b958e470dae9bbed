//! Page protection values and their display form.
//!
//! The values mirror the Win32 `PAGE_*` constants. They are kept as plain `u32` bits so
//! the classifier can bit-scan them and the simulated backend can use the same encoding
//! as the live one.

use std::fmt;

pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;

pub const PAGE_GUARD: u32 = 0x100;
pub const PAGE_NOCACHE: u32 = 0x200;
pub const PAGE_WRITECOMBINE: u32 = 0x400;
pub const PAGE_TARGETS_INVALID: u32 = 0x4000_0000;

/// Mask of the base access values.
pub const BASE_MASK: u32 = 0xFF;

/// All bits with an execute component.
pub const EXECUTE_MASK: u32 =
    PAGE_EXECUTE | PAGE_EXECUTE_READ | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;

/// All bits that allow writing (directly or via copy-on-write).
pub const WRITE_MASK: u32 =
    PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY;

/// All bits that allow reading.
pub const READ_MASK: u32 = PAGE_READONLY | WRITE_MASK | PAGE_EXECUTE_READ;

const BASE_NAMES: [(u32, &str); 8] = [
    (PAGE_NOACCESS, "NOACCESS"),
    (PAGE_READONLY, "READONLY"),
    (PAGE_READWRITE, "READWRITE"),
    (PAGE_WRITECOPY, "WRITECOPY"),
    (PAGE_EXECUTE, "EXECUTE"),
    (PAGE_EXECUTE_READ, "EXECUTE_READ"),
    (PAGE_EXECUTE_READWRITE, "EXECUTE_READWRITE"),
    (PAGE_EXECUTE_WRITECOPY, "EXECUTE_WRITECOPY"),
];

// Display order of the modifier flags.
const FLAG_NAMES: [(u32, &str); 4] = [
    (PAGE_TARGETS_INVALID, "TARGETS_INVALID"),
    (PAGE_GUARD, "GUARD"),
    (PAGE_NOCACHE, "NOCACHE"),
    (PAGE_WRITECOMBINE, "WRITECOMBINE"),
];

/// A page protection value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Protection(pub u32);

impl Protection {
    /// Whether any execute access is granted.
    pub fn is_executable(self) -> bool {
        self.0 & EXECUTE_MASK != 0
    }

    /// Whether the page can be written (including copy-on-write).
    pub fn is_writable(self) -> bool {
        self.0 & WRITE_MASK != 0 && self.0 & PAGE_GUARD == 0
    }

    /// Whether the page can be read.
    pub fn is_readable(self) -> bool {
        self.0 & READ_MASK != 0 && self.0 & PAGE_GUARD == 0
    }

    pub fn is_guard(self) -> bool {
        self.0 & PAGE_GUARD != 0
    }
}

impl From<u32> for Protection {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.0;
        let base = value & BASE_MASK;

        match BASE_NAMES.iter().find(|(bit, _)| *bit == base) {
            Some((_, name)) => write!(f, "PAGE_{}", name)?,
            None if base == 0 => f.write_str("PAGE_NONE")?,
            None => write!(f, "PAGE_0x{:X}", base)?,
        }

        let mut rest = value & !BASE_MASK;
        for (bit, name) in FLAG_NAMES {
            if rest & bit != 0 {
                write!(f, " | PAGE_{}", name)?;
                rest &= !bit;
            }
        }

        if rest != 0 {
            write!(f, " | 0x{:X}", rest)?;
        }
        Ok(())
    }
}

/// Render a protection value as `PAGE_<BASE>[ | PAGE_<FLAG>...][ | 0x<rest>]`.
pub fn describe(value: u32) -> String {
    Protection(value).to_string()
}

/// Parse a protection value typed by an operator (`0x40`, `64`).
pub fn parse(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
