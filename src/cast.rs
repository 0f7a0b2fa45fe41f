//! Casting rules and the element transfer used to fill and drain scratch buffers.

use std::fmt;

use crate::{
    array::Descr,
    num::{DataType, Kind, Value},
};

/// Decides whether elements of one type may be converted into another.
pub trait CastPolicy: Send + Sync {
    fn can_cast(&self, from: DataType, to: DataType) -> bool;
}

/// Allows only conversions that preserve every value.
///
/// Object and numeric elements never convert into each other, matching what [`Transfer`] can do.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SafeCasting;

impl CastPolicy for SafeCasting {
    fn can_cast(&self, from: DataType, to: DataType) -> bool {
        if from == to {
            return true;
        }
        let (x, y) = (from.size(), to.size());
        match (from.kind(), to.kind()) {
            (Kind::Object, _) | (_, Kind::Object) => false,
            (Kind::Bool, _) => true,
            (_, Kind::Bool) => false,
            (Kind::Signed, Kind::Signed)
            | (Kind::Unsigned, Kind::Unsigned)
            | (Kind::Float, Kind::Float) => y >= x,
            (Kind::Unsigned, Kind::Signed) => y > x,
            (Kind::Signed, Kind::Unsigned) => false,
            // 64-bit integers go to f64 even though the mantissa is narrower
            (Kind::Signed | Kind::Unsigned, Kind::Float) => y > x || (x == 8 && y == 8),
            (Kind::Float, _) => false,
        }
    }
}

/// Allows any conversion between numeric types. Object elements still only convert to objects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UnsafeCasting;

impl CastPolicy for UnsafeCasting {
    fn can_cast(&self, from: DataType, to: DataType) -> bool {
        from == to || from.is_object() == to.is_object()
    }
}

/// Copies strided elements from one descriptor to another, converting type and byte order.
#[derive(Clone, Copy)]
pub struct Transfer {
    src: Descr,
    dst: Descr,
    read: fn(&[u8]) -> Value,
    write: fn(Value, &mut [u8]),
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .finish()
    }
}

impl Transfer {
    /// Returns `None` if no conversion exists, i.e. between object and numeric elements.
    pub fn new(src: Descr, dst: Descr) -> Option<Self> {
        if src.r#type.is_object() != dst.r#type.is_object() {
            return None;
        }
        let read = src.r#type.reader();
        let write = dst.r#type.writer();
        Some(Self {
            src,
            dst,
            read,
            write,
        })
    }

    #[inline]
    pub fn src(&self) -> Descr {
        self.src
    }

    #[inline]
    pub fn dst(&self) -> Descr {
        self.dst
    }

    /// Converts `len` elements.
    ///
    /// # Safety
    /// `src` must be valid for reads of `len` elements spaced `src_step` bytes apart,
    /// and `dst` valid for writes of `len` elements spaced `dst_step` bytes apart.
    pub unsafe fn run(&self, src: *const u8, src_step: isize, dst: *mut u8, dst_step: isize, len: usize) {
        let (x, y) = (self.src.size(), self.dst.size());
        let same = self.src.r#type == self.dst.r#type;
        for index in 0..len as isize {
            let mut input = [0u8; 8];
            let mut output = [0u8; 8];
            unsafe {
                std::ptr::copy_nonoverlapping(src.offset(index * src_step), input.as_mut_ptr(), x);
            }
            if self.src.is_swapped() {
                input[..x].reverse();
            }
            match same {
                true => output[..y].copy_from_slice(&input[..x]),
                false => (self.write)((self.read)(&input[..x]), &mut output[..y]),
            }
            if self.dst.is_swapped() {
                output[..y].reverse();
            }
            unsafe {
                std::ptr::copy_nonoverlapping(output.as_ptr(), dst.offset(index * dst_step), y);
            }
        }
    }

    /// Writes a single value into `dst`.
    ///
    /// # Safety
    /// `dst` must be valid for writes of one element of the destination type.
    pub unsafe fn store(dst: Descr, value: Value, ptr: *mut u8) {
        let size = dst.size();
        let mut output = [0u8; 8];
        dst.r#type.writer()(value, &mut output[..size]);
        if dst.is_swapped() {
            output[..size].reverse();
        }
        unsafe { std::ptr::copy_nonoverlapping(output.as_ptr(), ptr, size) };
    }
}
