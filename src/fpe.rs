//! Floating-point exception status.
//!
//! The latched flags are thread-global state of the processor, not of a loop. Two loops running
//! at the same time on threads that share flags (or a loop whose kernels hop threads) may see each
//! other's exceptions; attribution of an exception to a particular call is approximate.

use std::{
    cell::Cell,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use bitflags::bitflags;
use itertools::Itertools;

use crate::errstate::Category;

bitflags! {
    /// Bitmask of latched floating-point exceptions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FpStatus: u8 {
        const DIVIDE_BY_ZERO = 1;
        const OVERFLOW = 2;
        const UNDERFLOW = 4;
        const INVALID = 8;
    }
}

impl FpStatus {
    /// Categories tripped in this status, in checking order.
    pub fn categories(self) -> impl Iterator<Item = Category> {
        Category::ALL
            .into_iter()
            .filter(move |category| self.contains(category.status()))
    }
}

impl fmt::Display for FpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.is_empty() {
            true => write!(f, "none"),
            false => write!(f, "{}", self.categories().format(" | ")),
        }
    }
}

/// Reads the latched exception flags.
pub trait Probe: Send + Sync {
    /// Reads and clears the flags in one step, so an exception is never reported twice.
    fn probe(&self) -> FpStatus;

    /// Clears the flags, discarding whatever was latched.
    fn clear(&self) {
        let _ = self.probe();
    }
}

thread_local! {
    static SOFT_STATUS: Cell<u8> = const { Cell::new(0) };
}

/// Latches exceptions from kernel code that detects them itself, e.g. integer division by zero.
///
/// Picked up by [`HardwareProbe`] together with the processor flags.
pub fn raise(status: FpStatus) {
    SOFT_STATUS.with(|cell| cell.set(cell.get() | status.bits()));
}

/// Reads the processor's flags on the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareProbe;

impl Probe for HardwareProbe {
    fn probe(&self) -> FpStatus {
        let soft = SOFT_STATUS.with(|cell| cell.replace(0));
        platform::take() | FpStatus::from_bits_truncate(soft)
    }
}

#[cfg(target_arch = "x86_64")]
mod platform {
    use std::arch::asm;

    use super::FpStatus;

    const INVALID: u32 = 0x01;
    const DIVIDE_BY_ZERO: u32 = 0x04;
    const OVERFLOW: u32 = 0x08;
    const UNDERFLOW: u32 = 0x10;
    const FLAGS: u32 = 0x3f;

    #[inline]
    fn read() -> u32 {
        let mut csr = 0u32;
        unsafe {
            asm!("stmxcsr dword ptr [{0}]", in(reg) &mut csr as *mut u32, options(nostack, preserves_flags));
        }
        csr
    }

    #[inline]
    fn write(csr: u32) {
        unsafe {
            asm!("ldmxcsr dword ptr [{0}]", in(reg) &csr as *const u32, options(nostack, preserves_flags, readonly));
        }
    }

    pub fn take() -> FpStatus {
        let csr = read();
        write(csr & !FLAGS);

        let mut status = FpStatus::empty();
        if csr & DIVIDE_BY_ZERO != 0 {
            status |= FpStatus::DIVIDE_BY_ZERO;
        }
        if csr & OVERFLOW != 0 {
            status |= FpStatus::OVERFLOW;
        }
        if csr & UNDERFLOW != 0 {
            status |= FpStatus::UNDERFLOW;
        }
        if csr & INVALID != 0 {
            status |= FpStatus::INVALID;
        }
        status
    }
}

#[cfg(target_arch = "aarch64")]
mod platform {
    use std::arch::asm;

    use super::FpStatus;

    const INVALID: u64 = 0x01;
    const DIVIDE_BY_ZERO: u64 = 0x02;
    const OVERFLOW: u64 = 0x04;
    const UNDERFLOW: u64 = 0x08;
    const FLAGS: u64 = 0x9f;

    pub fn take() -> FpStatus {
        let fpsr: u64;
        unsafe {
            asm!("mrs {0}, fpsr", out(reg) fpsr, options(nostack, preserves_flags));
            asm!("msr fpsr, {0}", in(reg) fpsr & !FLAGS, options(nostack, preserves_flags));
        }

        let mut status = FpStatus::empty();
        if fpsr & DIVIDE_BY_ZERO != 0 {
            status |= FpStatus::DIVIDE_BY_ZERO;
        }
        if fpsr & OVERFLOW != 0 {
            status |= FpStatus::OVERFLOW;
        }
        if fpsr & UNDERFLOW != 0 {
            status |= FpStatus::UNDERFLOW;
        }
        if fpsr & INVALID != 0 {
            status |= FpStatus::INVALID;
        }
        status
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
mod platform {
    use super::FpStatus;

    /// No readable flags on this target; only [`super::raise`] reports exceptions.
    #[inline]
    pub fn take() -> FpStatus {
        FpStatus::empty()
    }
}

/// A probe whose flags are set by hand, for deterministic tests and hosts that track exceptions
/// in software. Clones share the same flags.
#[derive(Debug, Default, Clone)]
pub struct SimulatedProbe(Arc<AtomicU8>);

impl SimulatedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, status: FpStatus) {
        self.0.fetch_or(status.bits(), Ordering::SeqCst);
    }

    /// Reads the flags without clearing them.
    pub fn peek(&self) -> FpStatus {
        FpStatus::from_bits_truncate(self.0.load(Ordering::SeqCst))
    }
}

impl Probe for SimulatedProbe {
    fn probe(&self) -> FpStatus {
        FpStatus::from_bits_truncate(self.0.swap(0, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::{FpStatus, HardwareProbe, Probe, SimulatedProbe, raise};

    #[test]
    fn test_simulated_probe() {
        let probe = SimulatedProbe::new();
        let shared = probe.clone();
        shared.raise(FpStatus::OVERFLOW);
        shared.raise(FpStatus::INVALID);
        assert_eq!(probe.peek(), FpStatus::OVERFLOW | FpStatus::INVALID);
        assert_eq!(probe.probe(), FpStatus::OVERFLOW | FpStatus::INVALID);
        assert!(probe.probe().is_empty());
    }

    #[test]
    fn test_soft_raise() {
        let probe = HardwareProbe;
        probe.clear();
        raise(FpStatus::DIVIDE_BY_ZERO);
        assert!(probe.probe().contains(FpStatus::DIVIDE_BY_ZERO));
        assert!(probe.probe().is_empty());
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    #[test]
    fn test_hardware_flags() {
        let probe = HardwareProbe;
        probe.clear();
        let x = std::hint::black_box(1.0f64);
        let y = std::hint::black_box(0.0f64);
        let z = std::hint::black_box(x / y);
        assert!(z.is_infinite());
        assert!(probe.probe().contains(FpStatus::DIVIDE_BY_ZERO));

        let z = std::hint::black_box(y / y);
        assert!(z.is_nan());
        assert!(probe.probe().contains(FpStatus::INVALID));
    }

    #[test]
    fn test_display() {
        let status = FpStatus::DIVIDE_BY_ZERO | FpStatus::UNDERFLOW;
        assert_eq!(status.to_string(), "divide by zero | underflow");
        assert_eq!(FpStatus::empty().to_string(), "none");
        assert_eq!(FpStatus::from_bits_truncate(0xff), FpStatus::all());
        assert_eq!(FpStatus::all().categories().count(), 4);
    }
}
