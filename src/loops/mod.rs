//! Per-call execution of a resolved kernel.
//!
//! A loop is built from the argument views and a kernel entry, checks every structural
//! requirement up front, and then runs the kernel chunk by chunk. Nothing is written to an output
//! before [`broadcast::BroadcastLoop::run`] or the corresponding reduction entry point is called.

use std::{fmt, io, sync::Arc};

use derive_more::{Deref, Display};
use thiserror::Error;

use crate::{
    array::{ArrayError, Descr},
    cast::{CastPolicy, SafeCasting, Transfer},
    errstate::{self, BoxError, Category, ErrorConfig, ErrorPolicy, FpError},
    fpe::{HardwareProbe, Probe},
    kernel::KernelError,
    layout::{LayoutError, Shape, Walker},
    num::{DataType, TypeList},
    signature::CoreError,
};

pub mod broadcast;
pub mod reduce;

/// Default number of elements per chunk.
pub const DEFAULT_BUFSIZE: usize = 8192;
/// Smallest accepted chunk size.
pub const MIN_BUFSIZE: usize = 16;

#[derive(Debug, Error)]
pub enum LoopError {
    #[error("{name}: no kernel matches argument types {types}")]
    TypeResolution { name: String, types: TypeList },
    #[error(transparent)]
    ShapeMismatch(LayoutError),
    #[error(transparent)]
    CoreDimension(#[from] CoreError),
    #[error("{0}: zero-size reduction without identity")]
    ZeroSizeReduction(String),
    #[error("floating point error: {category} encountered in {name}")]
    FloatingPoint { category: Category, name: String },
    #[error("error handler failed for {category} encountered in {name}")]
    Handler {
        category: Category,
        name: String,
        #[source]
        source: BoxError,
    },
    #[error("no error handler set for {category} encountered in {name}")]
    MissingHandler { category: Category, name: String },
    #[error("failed to emit diagnostic for {category} encountered in {name}")]
    Log {
        category: Category,
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("argument {arg} cannot be buffered from {from} to {to}")]
    BufferCast {
        arg: usize,
        from: DataType,
        to: DataType,
    },
    #[error("{name} takes {expected} arguments, got {found}")]
    Arity {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("axis {0} is out of bounds for rank {1}")]
    Axis(isize, usize),
    #[error("index {index} is out of bounds for axis of length {len}")]
    Index { index: usize, len: usize },
    #[error("kernel {name} failed")]
    Kernel {
        name: String,
        #[source]
        source: KernelError,
    },
    #[error("{name}: {reason}")]
    Unsupported { name: String, reason: &'static str },
    #[error(transparent)]
    Array(#[from] ArrayError),
}

impl From<LayoutError> for LoopError {
    fn from(value: LayoutError) -> Self {
        match value {
            LayoutError::Axis(axis, rank) => Self::Axis(axis, rank),
            value => Self::ShapeMismatch(value),
        }
    }
}

impl From<FpError> for LoopError {
    fn from(value: FpError) -> Self {
        match value {
            FpError::Raise(d) => Self::FloatingPoint {
                category: d.category,
                name: d.name,
            },
            FpError::MissingHandler(d) => Self::MissingHandler {
                category: d.category,
                name: d.name,
            },
            FpError::Handler { diagnostic, source } => Self::Handler {
                category: diagnostic.category,
                name: diagnostic.name,
                source,
            },
            FpError::Sink { diagnostic, source } => Self::Log {
                category: diagnostic.category,
                name: diagnostic.name,
                source,
            },
        }
    }
}

/// The host's coarse execution lock, released while pure numeric chunks run.
pub trait ExecutionLock: Send + Sync {
    fn release(&self);
    fn acquire(&self);
}

/// A host without a global lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLock;

impl ExecutionLock for NoLock {
    #[inline]
    fn release(&self) {}

    #[inline]
    fn acquire(&self) {}
}

/// Watches floating-point status and the host lock for one loop.
///
/// The lock is released between [`Monitor::start`] and [`Monitor::finish`] unless the loop needs
/// runtime services, and is re-acquired around every policy application. Dropping the monitor
/// early, e.g. on an error, re-acquires it as well.
pub(crate) struct Monitor {
    policy: ErrorPolicy,
    probe: Arc<dyn Probe>,
    lock: Arc<dyn ExecutionLock>,
    needs_api: bool,
    check: bool,
    released: bool,
}

impl Monitor {
    pub(crate) fn new(name: &str, settings: &Settings, needs_api: bool) -> Self {
        let check = !settings.errors.mask.is_ignore() || needs_api;
        Self {
            policy: ErrorPolicy::new(settings.errors.clone(), name),
            probe: settings.probe.clone(),
            lock: settings.lock.clone(),
            needs_api,
            check,
            released: false,
        }
    }

    /// Returns `true` if floating-point status is probed after each chunk.
    #[inline]
    pub(crate) fn is_checking(&self) -> bool {
        self.check
    }

    fn release(&mut self) {
        if !self.needs_api && !self.released {
            self.lock.release();
            self.released = true;
        }
    }

    fn acquire(&mut self) {
        if self.released {
            self.lock.acquire();
            self.released = false;
        }
    }

    /// Discards flags latched before the loop and enters the chunk region.
    pub(crate) fn start(&mut self) {
        if self.check {
            self.probe.clear();
        }
        self.release();
    }

    /// Probes the flags raised by the last chunk and applies the policy to them.
    pub(crate) fn chunk(&mut self) -> Result<(), LoopError> {
        if !self.check {
            return Ok(());
        }
        let status = self.probe.probe();
        if status.is_empty() {
            return Ok(());
        }
        self.acquire();
        self.policy.check(status)?;
        self.release();
        Ok(())
    }

    /// Leaves the chunk region.
    pub(crate) fn finish(&mut self) {
        self.acquire();
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.acquire();
    }
}

/// Core axes of one argument, copied whole into the scratch for every loop element.
///
/// Empty for element-wise arguments.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Block {
    shape: Vec<usize>,
    /// Byte strides of the core axes in the array.
    strides: Vec<isize>,
}

impl Block {
    pub(crate) fn new(shape: &[usize], strides: &[isize]) -> Self {
        Self {
            shape: shape.to_vec(),
            strides: strides.to_vec(),
        }
    }

    /// Number of elements in one block.
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Row-major byte strides of the block packed in the scratch.
    fn packed(&self, size: usize) -> Vec<isize> {
        let mut stride = size as isize;
        let mut packed = vec![0; self.shape.len()];
        for (packed, &dim) in packed.iter_mut().zip(self.shape.iter()).rev() {
            *packed = stride;
            stride *= dim as isize;
        }
        packed
    }
}

/// Scratch space standing in for one argument whose elements the kernel cannot address directly.
pub(crate) struct Buffer {
    transfer: Transfer,
    scratch: Vec<u64>,
    size: usize,
    block: Block,
    packed: Vec<isize>,
}

impl Buffer {
    fn with_transfer(transfer: Transfer, size: usize, block: Block, capacity: usize) -> Self {
        let scratch = vec![0u64; (size * block.len() * capacity).div_ceil(8)];
        let packed = block.packed(size);
        Self {
            transfer,
            scratch,
            size,
            block,
            packed,
        }
    }

    /// Returns `true` if the kernel can address the array's own memory: same type, native byte
    /// order, and every stride it is walked with a multiple of the kernel type's alignment.
    pub(crate) fn is_direct(descr: Descr, kernel: DataType, ptr: *const u8, strides: &[isize]) -> bool {
        let align = kernel.align();
        let aligned =
            (ptr as usize) % align == 0 && strides.iter().all(|&s| s % align as isize == 0);
        descr.r#type == kernel && !descr.is_swapped() && aligned
    }

    /// Decides how the kernel reaches argument `arg`: `None` if it can address the array's own
    /// memory, a scratch buffer of `capacity` blocks if the type, byte order or alignment is off.
    ///
    /// `strides` are the loop strides of the argument; `block` holds its core axes.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn plan(
        arg: usize,
        output: bool,
        descr: Descr,
        kernel: DataType,
        ptr: *const u8,
        strides: &[isize],
        block: Block,
        capacity: usize,
        casting: &dyn CastPolicy,
    ) -> Result<Option<Self>, LoopError> {
        let walked = [strides, &block.strides[..]].concat();
        if Self::is_direct(descr, kernel, ptr, &walked) {
            return Ok(None);
        }

        let (from, to) = match output {
            false => (descr, Descr::native(kernel)),
            true => (Descr::native(kernel), descr),
        };
        let error = || LoopError::BufferCast {
            arg,
            from: from.r#type,
            to: to.r#type,
        };
        if !casting.can_cast(from.r#type, to.r#type) {
            return Err(error());
        }
        let transfer = Transfer::new(from, to).ok_or_else(error)?;
        Ok(Some(Self::with_transfer(transfer, kernel.size(), block, capacity)))
    }

    #[inline]
    pub(crate) fn ptr(&mut self) -> *mut u8 {
        self.scratch.as_mut_ptr().cast()
    }

    /// Byte step between consecutive blocks in the scratch.
    #[inline]
    pub(crate) fn step(&self) -> isize {
        (self.size * self.block.len()) as isize
    }

    /// Byte strides of the core axes in the scratch.
    #[inline]
    pub(crate) fn core_steps(&self) -> &[isize] {
        &self.packed
    }

    /// Converts `len` strided elements (or blocks) into the scratch.
    ///
    /// # Safety
    /// `src` must be valid for reads of `len` blocks spaced `step` bytes apart.
    pub(crate) unsafe fn fill(&mut self, src: *const u8, step: isize, len: usize) {
        unsafe { self.copy(src.cast_mut(), step, len, true) }
    }

    /// Converts the first `len` scratch elements (or blocks) out to strided memory.
    ///
    /// # Safety
    /// `dst` must be valid for writes of `len` blocks spaced `step` bytes apart.
    pub(crate) unsafe fn drain(&mut self, dst: *mut u8, step: isize, len: usize) {
        unsafe { self.copy(dst, step, len, false) }
    }

    /// Walks every block axis but the last, converting one run along the last axis at a time.
    unsafe fn copy(&mut self, array: *mut u8, step: isize, len: usize, fill: bool) {
        let transfer = self.transfer;
        let scratch = self.ptr();
        let (shape, strides, run, (array_step, scratch_step)) = match self.block.shape.split_last() {
            None => (vec![], vec![vec![], vec![]], len, (step, self.size as isize)),
            Some((&run, shape)) => {
                let count = shape.len();
                let shape = [&[len][..], shape].concat();
                let strides = vec![
                    [&[step][..], &self.block.strides[..count]].concat(),
                    [&[self.step()][..], &self.packed[..count]].concat(),
                ];
                let steps = (self.block.strides[count], self.packed[count]);
                (shape, strides, run, steps)
            }
        };

        let mut walker = Walker::new(&shape, strides);
        while let Some(offsets) = walker.next_offsets() {
            let array = array.wrapping_offset(offsets[0]);
            let scratch = scratch.wrapping_offset(offsets[1]);
            unsafe {
                match fill {
                    true => transfer.run(array, array_step, scratch, scratch_step, run),
                    false => transfer.run(scratch, scratch_step, array, array_step, run),
                }
            }
        }
    }
}

/// Identifies one loop instance in logs.
#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct LoopId(uid::Id<LoopId>);

/// Per-call configuration of a loop.
#[derive(Clone)]
pub struct Settings {
    bufsize: usize,
    /// Snapshot of the error policy configuration.
    pub errors: ErrorConfig,
    pub probe: Arc<dyn Probe>,
    pub lock: Arc<dyn ExecutionLock>,
    /// Authority consulted whenever an argument must be converted.
    pub casting: Arc<dyn CastPolicy>,
}

impl Default for Settings {
    /// Reads the calling thread's error configuration.
    fn default() -> Self {
        Self {
            bufsize: DEFAULT_BUFSIZE,
            errors: errstate::get(),
            probe: Arc::new(HardwareProbe),
            lock: Arc::new(NoLock),
            casting: Arc::new(SafeCasting),
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("bufsize", &self.bufsize)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of elements handed to the kernel at once, and the capacity of each
    /// scratch buffer. Never below [`MIN_BUFSIZE`].
    #[inline]
    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Sets the chunk size. Values below [`MIN_BUFSIZE`] are raised to it.
    pub fn with_bufsize(mut self, bufsize: usize) -> Self {
        self.bufsize = bufsize.max(MIN_BUFSIZE);
        self
    }

    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    pub fn with_probe(mut self, probe: impl Probe + 'static) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    pub fn with_lock(mut self, lock: impl ExecutionLock + 'static) -> Self {
        self.lock = Arc::new(lock);
        self
    }

    pub fn with_casting(mut self, casting: impl CastPolicy + 'static) -> Self {
        self.casting = Arc::new(casting);
        self
    }
}

/// Loop shape and resolved core dimension sizes of one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Geometry {
    pub shape: Shape,
    pub core: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_BUFSIZE, LoopError, MIN_BUFSIZE, Settings};
    use crate::{
        errstate::{Category, Diagnostic, FpError},
        fpe::FpStatus,
        layout::{LayoutError, Shape},
    };

    #[test]
    fn test_bufsize_floor() {
        let settings = Settings::new().with_bufsize(3);
        assert_eq!(settings.bufsize(), MIN_BUFSIZE);
        assert_eq!(Settings::new().with_bufsize(0).bufsize(), MIN_BUFSIZE);
        assert_eq!(Settings::new().bufsize(), DEFAULT_BUFSIZE);
    }

    #[test]
    fn test_error_mapping() {
        let error: LoopError = LayoutError::Axis(-4, 3).into();
        assert!(matches!(error, LoopError::Axis(-4, 3)));

        let error: LoopError = LayoutError::Broadcast(Shape::from([2]), Shape::from([3])).into();
        assert!(matches!(error, LoopError::ShapeMismatch(_)));

        let diagnostic = Diagnostic {
            category: Category::Overflow,
            name: "multiply".into(),
            status: FpStatus::OVERFLOW,
        };
        let error: LoopError = FpError::Raise(diagnostic).into();
        assert_eq!(
            error.to_string(),
            "floating point error: overflow encountered in multiply"
        );
    }
}
