//! Calling code at a resolved address.
//!
//! Hooks often need to call back into the host binary, either a function the resolver
//! located or the previous handler found at a chained site. [`RawCode`] is the one place
//! where such an address is turned into a callable, with the calling convention named
//! explicitly instead of being implied by a cast.

use std::mem::transmute;

use crate::error::{Error, Result};

/// Most word-sized arguments [`RawCode::call`] passes.
pub const MAX_ARGS: usize = 4;

/// Calling convention of the target code.
///
/// Only 32-bit x86 distinguishes all four; elsewhere `Fastcall` and `Thiscall` use the
/// platform C convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallConv {
    C,
    System,
    Fastcall,
    Thiscall,
}

/// An address to call and how to call it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawCode {
    addr: usize,
    conv: CallConv,
}

macro_rules! call_with {
    ($abi:tt, $addr:expr, $args:expr) => {{
        let addr: usize = $addr;
        match *$args {
            [] => transmute::<usize, unsafe extern $abi fn() -> usize>(addr)(),
            [a] => transmute::<usize, unsafe extern $abi fn(usize) -> usize>(addr)(a),
            [a, b] => transmute::<usize, unsafe extern $abi fn(usize, usize) -> usize>(addr)(a, b),
            [a, b, c] => {
                transmute::<usize, unsafe extern $abi fn(usize, usize, usize) -> usize>(addr)(a, b, c)
            }
            [a, b, c, d] => transmute::<usize, unsafe extern $abi fn(usize, usize, usize, usize) -> usize>(
                addr,
            )(a, b, c, d),
            _ => return Err(Error::TooManyArguments($args.len())),
        }
    }};
}

impl RawCode {
    pub fn new(addr: usize, conv: CallConv) -> Self {
        Self { addr, conv }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn conv(&self) -> CallConv {
        self.conv
    }

    /// Call the code with word-sized `args` and return the accumulator.
    ///
    /// For code that returns nothing the value is meaningless.
    ///
    /// # Safety
    ///
    /// `addr` must be the entry of a function using `conv` that accepts `args.len()`
    /// word-sized arguments.
    pub unsafe fn call(&self, args: &[usize]) -> Result<usize> {
        if args.len() > MAX_ARGS {
            return Err(Error::TooManyArguments(args.len()));
        }

        let ret = match self.conv {
            #[cfg(target_arch = "x86")]
            CallConv::Fastcall => call_with!("fastcall", self.addr, args),
            #[cfg(target_arch = "x86")]
            CallConv::Thiscall => call_with!("thiscall", self.addr, args),
            CallConv::System => call_with!("system", self.addr, args),
            _ => call_with!("C", self.addr, args),
        };
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn sum3(a: usize, b: usize, c: usize) -> usize {
        a + b * 10 + c * 100
    }

    extern "system" fn answer() -> usize {
        42
    }

    #[test]
    fn test_call_c() {
        let f = RawCode::new(sum3 as extern "C" fn(usize, usize, usize) -> usize as usize, CallConv::C);
        assert_eq!(unsafe { f.call(&[1, 2, 3]) }.unwrap(), 321);
    }

    #[test]
    fn test_call_system() {
        let f = RawCode::new(answer as extern "system" fn() -> usize as usize, CallConv::System);
        assert_eq!(unsafe { f.call(&[]) }.unwrap(), 42);
    }

    #[test]
    fn test_too_many_arguments() {
        let f = RawCode::new(answer as extern "system" fn() -> usize as usize, CallConv::System);
        assert!(matches!(
            unsafe { f.call(&[0; 5]) },
            Err(Error::TooManyArguments(5))
        ));
    }
}
