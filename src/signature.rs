//! Byte signatures and code-location resolution.
//!
//! A [`CodeLocation`] names a place in the host binary by its expected address in every
//! known build plus a byte fingerprint of the code that should be there. The
//! [`Resolver`] picks the address for the running build and refuses to hand it out
//! unless the fingerprint still matches, so a binary mismatch is reported instead of
//! patching unrelated code.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::{Error, Result};
use crate::memory::AddressSpace;

/// One position in a byte pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    Exact(u8),
    Any,
}

impl Token {
    pub fn matches(self, byte: u8) -> bool {
        match self {
            Self::Exact(b) => b == byte,
            Self::Any => true,
        }
    }
}

/// A byte pattern with wildcard positions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pattern {
    tokens: Vec<Token>,
}

impl Pattern {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens }
    }

    /// A pattern that matches exactly `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            tokens: bytes.iter().map(|&b| Token::Exact(b)).collect(),
        }
    }

    /// Parse IDA-style text: hex bytes separated by whitespace, `?` or `??` for wildcards.
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = Vec::new();

        for part in text.split_whitespace() {
            if part == "?" || part == "??" {
                tokens.push(Token::Any);
            } else if part.len() == 2 {
                let byte = u8::from_str_radix(part, 16)
                    .map_err(|_| Error::InvalidPattern(format!("bad byte '{}' in '{}'", part, text)))?;
                tokens.push(Token::Exact(byte));
            } else {
                return Err(Error::InvalidPattern(format!("bad token '{}' in '{}'", part, text)));
            }
        }

        if tokens.is_empty() {
            return Err(Error::InvalidPattern("empty pattern".to_string()));
        }

        Ok(Self { tokens })
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Compare against `bytes`, which must be at least as long as the pattern.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        bytes.len() >= self.tokens.len()
            && self.tokens.iter().zip(bytes).all(|(t, &b)| t.matches(b))
    }
}

impl FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match token {
                Token::Exact(b) => write!(f, "{:02X}", b)?,
                Token::Any => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

/// Identifier of one known build of the host binary.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VariantId(String);

impl VariantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VariantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named code or data location with per-build addresses and a verification pattern.
#[derive(Clone, Debug)]
pub struct CodeLocation {
    name: String,
    addresses: HashMap<VariantId, usize>,
    pattern: Pattern,
    offset: isize,
}

impl CodeLocation {
    pub fn new(name: impl Into<String>, pattern: Pattern) -> Self {
        Self {
            name: name.into(),
            addresses: HashMap::new(),
            pattern,
            offset: 0,
        }
    }

    /// Record the expected address of the pattern in build `variant`.
    pub fn at(mut self, variant: impl Into<VariantId>, addr: usize) -> Self {
        self.addresses.insert(variant.into(), addr);
        self
    }

    /// Offset added to the match address to produce the resolved address.
    pub fn with_offset(mut self, offset: isize) -> Self {
        self.offset = offset;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    pub fn offset(&self) -> isize {
        self.offset
    }

    pub fn expected_address(&self, variant: &VariantId) -> Option<usize> {
        self.addresses.get(variant).copied()
    }
}

impl fmt::Display for CodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.offset < 0 { '-' } else { '+' };
        match self.offset {
            0 => write!(f, "{}", self.name),
            _ => write!(f, "{} {} {:#x}", self.name, sign, self.offset.unsigned_abs()),
        }
    }
}

/// Resolves [`CodeLocation`]s for the running build.
pub struct Resolver<'m, M: AddressSpace + ?Sized> {
    memory: &'m M,
    variant: VariantId,
}

impl<'m, M: AddressSpace + ?Sized> Resolver<'m, M> {
    pub fn new(memory: &'m M, variant: impl Into<VariantId>) -> Self {
        Self {
            memory,
            variant: variant.into(),
        }
    }

    pub fn variant(&self) -> &VariantId {
        &self.variant
    }

    /// Resolve `location`, logging the reason on failure.
    pub fn resolve(&self, location: &CodeLocation) -> Option<usize> {
        match self.try_resolve(location) {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Resolve `location` or explain why it cannot be trusted.
    pub fn try_resolve(&self, location: &CodeLocation) -> Result<usize> {
        let addr = location
            .expected_address(&self.variant)
            .ok_or_else(|| Error::UnknownVariant {
                name: location.name.clone(),
                variant: self.variant.to_string(),
            })?;

        let mut found = vec![0u8; location.pattern.len()];
        let mismatch = |found: String| Error::SignatureMismatch {
            name: location.name.clone(),
            addr,
            expected: location.pattern.to_string(),
            found,
        };

        if self.memory.read(addr, &mut found).is_err() {
            return Err(mismatch("unreadable".to_string()));
        }

        if !location.pattern.matches(&found) {
            return Err(mismatch(hex_bytes(&found)));
        }

        Ok(addr.wrapping_add_signed(location.offset))
    }
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::RegionKind;
    use crate::protection::PAGE_EXECUTE_READ;
    use crate::simulated::SimulatedMemory;

    const CODE: [u8; 8] = [0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x10, 0xE8, 0x00];

    fn memory() -> SimulatedMemory {
        SimulatedMemory::new(0x401000).commit_bytes(RegionKind::Image, PAGE_EXECUTE_READ, &CODE)
    }

    #[test]
    fn test_parse_pattern() {
        let pattern = Pattern::parse("55 8B ?? 83 ? 10").unwrap();
        assert_eq!(pattern.len(), 6);
        assert_eq!(pattern.tokens()[2], Token::Any);
        assert_eq!(pattern.tokens()[4], Token::Any);
        assert_eq!(pattern.to_string(), "55 8B ?? 83 ?? 10");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("55 GG").is_err());
        assert!(Pattern::parse("558B").is_err());
    }

    #[test]
    fn test_pattern_matching() {
        let pattern: Pattern = "55 ?? EC".parse().unwrap();
        assert!(pattern.matches(&[0x55, 0x00, 0xEC, 0xFF]));
        assert!(!pattern.matches(&[0x55, 0x00, 0xED]));
        assert!(!pattern.matches(&[0x55, 0x00]));
    }

    #[test]
    fn test_resolve_with_offset() {
        let mem = memory();
        let resolver = Resolver::new(&mem, "1.0");
        let location = CodeLocation::new("Setup", Pattern::parse("55 8B EC 83 EC ?? E8").unwrap())
            .at("1.0", 0x401000)
            .with_offset(6);

        assert_eq!(resolver.resolve(&location), Some(0x401006));
    }

    #[test]
    fn test_resolve_unknown_variant() {
        let mem = memory();
        let resolver = Resolver::new(&mem, "2.0");
        let location = CodeLocation::new("Setup", Pattern::from_bytes(&CODE[..3])).at("1.0", 0x401000);

        assert_eq!(resolver.resolve(&location), None);
        assert!(matches!(
            resolver.try_resolve(&location),
            Err(Error::UnknownVariant { .. })
        ));
    }

    #[test]
    fn test_resolve_mismatch_names_location() {
        let mem = memory();
        let resolver = Resolver::new(&mem, "1.0");
        let location = CodeLocation::new("Setup", Pattern::parse("55 8B ED").unwrap()).at("1.0", 0x401000);

        assert_eq!(resolver.resolve(&location), None);
        let err = resolver.try_resolve(&location).unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("Setup:"));
        assert!(text.contains("55 8B EC"));
    }

    #[test]
    fn test_resolve_unreadable_address() {
        let mem = memory();
        let resolver = Resolver::new(&mem, "1.0");
        let location = CodeLocation::new("Gone", Pattern::parse("55").unwrap()).at("1.0", 0x900000);

        assert_eq!(resolver.resolve(&location), None);
    }
}
