use itertools::Itertools;

use super::{Block, Buffer, LoopError, LoopId, Monitor, Settings, broadcast::BroadcastLoop};
use crate::{
    array::{Array, ArrayView, ArrayViewMut, Descr},
    cast::Transfer,
    kernel::{KernelArgs, KernelEntry},
    layout::{LayoutError, Shape, Walker},
    num::DataType,
    ufunc::{Identity, UFunc},
};

/// Reduction-family calls of a binary function: `reduce`, `accumulate`, `reduceat` and `outer`.
///
/// The kernel's first input and output are the accumulator, its second input walks the reduced
/// axis. Every mode checks its structural requirements before any output is written, and runs the
/// kernel in chunks of at most [`Settings::bufsize`] elements with the error policy applied after
/// each chunk. Each call gets its own policy state.
pub struct ReductionLoop<'a> {
    ufunc: &'a UFunc,
    settings: Settings,
    dtype: Option<DataType>,
}

/// What one call needs from the kernel table and the casting rules.
struct Plan<'e> {
    entry: &'e KernelEntry,
    /// Accumulator type, both the first input and the output type of the kernel.
    acc: DataType,
    /// Input element to accumulator.
    seed: Transfer,
    /// Accumulator to output element.
    store: Transfer,
    /// Scratch for the walked operand, if the kernel cannot read it in place.
    input: Option<Buffer>,
    needs_api: bool,
}

impl Plan<'_> {
    /// Returns where the kernel reads `len` elements of the walked operand starting at `src`.
    ///
    /// # Safety
    /// `src` must be valid for reads of `len` elements spaced `step` bytes apart.
    unsafe fn input(&mut self, src: *const u8, step: isize, len: usize) -> (*mut u8, isize) {
        match &mut self.input {
            None => (src.cast_mut(), step),
            Some(buffer) => {
                unsafe { buffer.fill(src, step, len) };
                (buffer.ptr(), buffer.step())
            }
        }
    }

    fn execute(&self, args: &KernelArgs) -> Result<(), LoopError> {
        let kernel = &self.entry.kernel;
        unsafe { kernel.execute(args) }.map_err(|source| LoopError::Kernel {
            name: kernel.name().into_owned(),
            source,
        })
    }
}

fn check_shape(found: &Shape, expected: Shape) -> Result<(), LoopError> {
    match *found == expected {
        true => Ok(()),
        false => Err(LayoutError::Broadcast(found.clone(), expected).into()),
    }
}

impl<'a> ReductionLoop<'a> {
    pub fn new(ufunc: &'a UFunc, settings: Settings) -> Self {
        Self {
            ufunc,
            settings,
            dtype: None,
        }
    }

    /// Accumulates in (at least) `dtype` instead of the input's type.
    pub fn with_dtype(mut self, dtype: DataType) -> Self {
        self.dtype = Some(dtype);
        self
    }

    fn unsupported(&self, reason: &'static str) -> LoopError {
        LoopError::Unsupported {
            name: self.ufunc.name().to_string(),
            reason,
        }
    }

    fn check_binary(&self) -> Result<(), LoopError> {
        if self.ufunc.nin() != 2 || self.ufunc.nout() != 1 {
            return Err(self.unsupported("reduction needs a binary function with one output"));
        }
        if self.ufunc.core_signature().is_some() {
            return Err(self.unsupported("reduction of a generalized function"));
        }
        Ok(())
    }

    /// First kernel in table order whose accumulator holds the requested type, that reads the
    /// input, and whose result fits the output type.
    ///
    /// The requested type is `dtype` if set, else the output's type if supplied, else the input's.
    fn resolve(&self, input: DataType, output: Option<DataType>) -> Result<&'a KernelEntry, LoopError> {
        let ufunc = self.ufunc;
        let desired = self.dtype.or(output).unwrap_or(input);
        let casting = self.settings.casting.as_ref();
        let found = ufunc.kernels().iter().find(|entry| {
            let types = &entry.types;
            types[0] == types[2]
                && casting.can_cast(desired, types[0])
                && casting.can_cast(input, types[0])
                && casting.can_cast(input, types[1])
                && output.is_none_or(|output| casting.can_cast(types[2], output))
        });
        found.ok_or_else(|| LoopError::TypeResolution {
            name: ufunc.name().to_string(),
            types: [input, desired].into_iter().chain(output).collect(),
        })
    }

    fn plan<'e>(
        &self,
        entry: &'e KernelEntry,
        input: &ArrayView,
        output: Descr,
    ) -> Result<Plan<'e>, LoopError> {
        let casting = self.settings.casting.as_ref();
        let acc = entry.types[0];
        let from = input.descr();

        let seed = casting
            .can_cast(from.r#type, acc)
            .then(|| Transfer::new(from, Descr::native(acc)))
            .flatten()
            .ok_or(LoopError::BufferCast {
                arg: 0,
                from: from.r#type,
                to: acc,
            })?;
        let store = casting
            .can_cast(acc, output.r#type)
            .then(|| Transfer::new(Descr::native(acc), output))
            .flatten()
            .ok_or(LoopError::BufferCast {
                arg: 2,
                from: acc,
                to: output.r#type,
            })?;
        let input_buffer = Buffer::plan(
            1,
            false,
            from,
            entry.types[1],
            input.as_ptr(),
            input.layout().strides(),
            Block::default(),
            self.settings.bufsize(),
            casting,
        )?;

        let needs_api = entry.needs_api() || from.r#type.is_object() || output.r#type.is_object();
        log::debug!(
            "{} over {}: kernel {}, accumulate in {acc}, input buffered: {}",
            self.ufunc.name(),
            input.shape(),
            entry,
            input_buffer.is_some(),
        );
        Ok(Plan {
            entry,
            acc,
            seed,
            store,
            input: input_buffer,
            needs_api,
        })
    }

    /// Folds the function along `axis`, dropping that axis.
    pub fn reduce(self, array: &Array, axis: isize) -> Result<Array, LoopError> {
        self.check_binary()?;
        let axis = array.shape().axis(axis)?;
        let entry = self.resolve(array.data_type(), None)?;
        let shape = array.layout().remove_axis(axis).shape().clone();
        let mut output = Array::zeros(entry.types[2], shape);
        self.reduce_view(entry, array.view(), axis, output.view_mut())?;
        Ok(output)
    }

    /// Folds the function along `axis` into `out`, whose shape is the input's without `axis`.
    pub fn reduce_into(self, array: &Array, axis: isize, out: &mut Array) -> Result<(), LoopError> {
        self.check_binary()?;
        let axis = array.shape().axis(axis)?;
        check_shape(out.shape(), array.layout().remove_axis(axis).shape().clone())?;
        let entry = self.resolve(array.data_type(), Some(out.data_type()))?;
        self.reduce_view(entry, array.view(), axis, out.view_mut())
    }

    fn reduce_view(
        &self,
        entry: &KernelEntry,
        input: ArrayView,
        axis: usize,
        mut output: ArrayViewMut,
    ) -> Result<(), LoopError> {
        let len = input.layout().shape_of(axis);
        let mut plan = self.plan(entry, &input, output.descr())?;
        self.fold(&mut plan, &input, axis, &[(0, len)], &mut output, false)
    }

    /// Folds each `[indices[i], indices[i + 1])` segment of `axis`; the output has one element per
    /// consecutive pair along that axis.
    ///
    /// A pair that is equal or descending is an empty segment and yields the identity.
    pub fn reduceat(self, array: &Array, axis: isize, indices: &[usize]) -> Result<Array, LoopError> {
        self.check_binary()?;
        let axis = array.shape().axis(axis)?;
        let entry = self.resolve(array.data_type(), None)?;
        let segments = Self::segments(array.shape()[axis], indices)?;
        let shape = array.layout().with_axis_size(axis, segments.len()).shape().clone();
        let mut output = Array::zeros(entry.types[2], shape);
        self.reduceat_view(entry, array.view(), axis, &segments, output.view_mut())?;
        Ok(output)
    }

    pub fn reduceat_into(
        self,
        array: &Array,
        axis: isize,
        indices: &[usize],
        out: &mut Array,
    ) -> Result<(), LoopError> {
        self.check_binary()?;
        let axis = array.shape().axis(axis)?;
        let segments = Self::segments(array.shape()[axis], indices)?;
        let shape = array.layout().with_axis_size(axis, segments.len()).shape().clone();
        check_shape(out.shape(), shape)?;
        let entry = self.resolve(array.data_type(), Some(out.data_type()))?;
        self.reduceat_view(entry, array.view(), axis, &segments, out.view_mut())
    }

    fn segments(len: usize, indices: &[usize]) -> Result<Vec<(usize, usize)>, LoopError> {
        if let Some(&index) = indices.iter().find(|&&index| index > len) {
            return Err(LoopError::Index { index, len });
        }
        let segments = indices.iter().copied().tuple_windows().collect_vec();
        Ok(segments)
    }

    fn reduceat_view(
        &self,
        entry: &KernelEntry,
        input: ArrayView,
        axis: usize,
        segments: &[(usize, usize)],
        mut output: ArrayViewMut,
    ) -> Result<(), LoopError> {
        let mut plan = self.plan(entry, &input, output.descr())?;
        self.fold(&mut plan, &input, axis, segments, &mut output, true)
    }

    /// Folds every segment of `axis` at every position of the other axes.
    ///
    /// With `keep`, segment `k` lands at index `k` of `axis` in the output; otherwise the output
    /// has no such axis and there is exactly one segment.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(name = %self.ufunc.name())))]
    fn fold(
        &self,
        plan: &mut Plan,
        input: &ArrayView,
        axis: usize,
        segments: &[(usize, usize)],
        output: &mut ArrayViewMut,
        keep: bool,
    ) -> Result<(), LoopError> {
        let name = self.ufunc.name();
        let identity = match self.ufunc.identity() {
            Identity::Value(value) => Some(value),
            Identity::None | Identity::Reorderable => None,
        };
        if identity.is_none() && segments.iter().any(|&(start, end)| start >= end) {
            return Err(LoopError::ZeroSizeReduction(name.to_string()));
        }

        let mut seed = [0u64; 1];
        if let Some(value) = identity {
            unsafe { Transfer::store(Descr::native(plan.acc), value, seed.as_mut_ptr().cast()) };
        }
        let seed = seed.as_ptr().cast::<u8>();

        let rest = input.layout().remove_axis(axis);
        let xs = input.layout().stride_of(axis);
        let (out_rest, os) = match keep {
            true => (output.layout().remove_axis(axis), output.layout().stride_of(axis)),
            false => (output.layout().clone(), 0),
        };
        let in_base = input.as_ptr();
        let out_base = output.as_mut_ptr();

        let bufsize = self.settings.bufsize();
        let mut acc = [0u64; 1];
        let acc = acc.as_mut_ptr().cast::<u8>();

        let id = LoopId::default();
        log::trace!("loop {id} folds {} segments of axis {axis} in {name}", segments.len());
        let mut monitor = Monitor::new(name, &self.settings, plan.needs_api);
        monitor.start();

        let strides = vec![rest.strides().to_vec(), out_rest.strides().to_vec()];
        let mut walker = Walker::new(rest.shape(), strides);
        while let Some(offsets) = walker.next_offsets() {
            let x = in_base.wrapping_offset(offsets[0]);
            let y = out_base.wrapping_offset(offsets[1]);
            for (k, &(start, end)) in segments.iter().enumerate() {
                let dst = y.wrapping_offset(os * k as isize);
                if start >= end {
                    unsafe { plan.store.run(seed, 0, dst, 0, 1) };
                    continue;
                }

                unsafe { plan.seed.run(x.wrapping_offset(xs * start as isize), 0, acc, 0, 1) };
                let mut index = start + 1;
                while index < end {
                    let len = bufsize.min(end - index);
                    let src = x.wrapping_offset(xs * index as isize);
                    let (ptr, step) = unsafe { plan.input(src, xs, len) };
                    let ptrs = [acc, ptr, acc];
                    let steps = [0, step, 0];
                    plan.execute(&KernelArgs::new(&ptrs, &steps, len))?;
                    monitor.chunk()?;
                    index += len;
                }
                unsafe { plan.store.run(acc, 0, dst, 0, 1) };
            }
        }

        monitor.finish();
        Ok(())
    }

    /// Running fold along `axis`; the output has the input's shape.
    pub fn accumulate(self, array: &Array, axis: isize) -> Result<Array, LoopError> {
        self.check_binary()?;
        let axis = array.shape().axis(axis)?;
        let entry = self.resolve(array.data_type(), None)?;
        let mut output = Array::zeros(entry.types[2], array.shape().clone());
        self.scan(entry, array.view(), axis, output.view_mut())?;
        Ok(output)
    }

    pub fn accumulate_into(self, array: &Array, axis: isize, out: &mut Array) -> Result<(), LoopError> {
        self.check_binary()?;
        let axis = array.shape().axis(axis)?;
        check_shape(out.shape(), array.shape().clone())?;
        let entry = self.resolve(array.data_type(), Some(out.data_type()))?;
        self.scan(entry, array.view(), axis, out.view_mut())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(name = %self.ufunc.name())))]
    fn scan(
        &self,
        entry: &KernelEntry,
        input: ArrayView,
        axis: usize,
        mut output: ArrayViewMut,
    ) -> Result<(), LoopError> {
        let name = self.ufunc.name();
        let mut plan = self.plan(entry, &input, output.descr())?;
        let bufsize = self.settings.bufsize();

        // the kernel writes the output in place when it holds native accumulators
        let direct = Buffer::plan(
            2,
            true,
            output.descr(),
            plan.acc,
            output.as_view().as_ptr(),
            output.layout().strides(),
            Block::default(),
            bufsize,
            self.settings.casting.as_ref(),
        )?
        .is_none();

        let len = input.layout().shape_of(axis);
        let rest = input.layout().remove_axis(axis);
        let xs = input.layout().stride_of(axis);
        let out_rest = output.layout().remove_axis(axis);
        let os = output.layout().stride_of(axis);
        let in_base = input.as_ptr();
        let out_base = output.as_mut_ptr();

        // slot 0 carries the last partial result from one chunk to the next
        let size = plan.acc.size() as isize;
        let mut scratch = vec![0u64; (plan.acc.size() * (bufsize + 1)).div_ceil(8)];
        let carry = scratch.as_mut_ptr().cast::<u8>();

        let id = LoopId::default();
        log::trace!("loop {id} accumulates axis {axis} of length {len} in {name}, direct: {direct}");
        let mut monitor = Monitor::new(name, &self.settings, plan.needs_api);
        monitor.start();

        let strides = vec![rest.strides().to_vec(), out_rest.strides().to_vec()];
        let mut walker = Walker::new(rest.shape(), strides);
        while let Some(offsets) = walker.next_offsets() {
            if len == 0 {
                break;
            }
            let x = in_base.wrapping_offset(offsets[0]);
            let y = out_base.wrapping_offset(offsets[1]);
            let at = |index: usize| y.wrapping_offset(os * index as isize);

            match direct {
                true => unsafe { plan.seed.run(x, 0, y, 0, 1) },
                false => unsafe {
                    plan.seed.run(x, 0, carry, 0, 1);
                    plan.store.run(carry, 0, y, 0, 1);
                },
            }

            let mut index = 1;
            while index < len {
                let count = bufsize.min(len - index);
                let src = x.wrapping_offset(xs * index as isize);
                let (ptr, step) = unsafe { plan.input(src, xs, count) };
                match direct {
                    true => {
                        let ptrs = [at(index - 1), ptr, at(index)];
                        let steps = [os, step, os];
                        plan.execute(&KernelArgs::new(&ptrs, &steps, count))?;
                    }
                    false => {
                        let next = carry.wrapping_offset(size);
                        let ptrs = [carry, ptr, next];
                        let steps = [size, step, size];
                        plan.execute(&KernelArgs::new(&ptrs, &steps, count))?;
                        unsafe {
                            plan.store.run(next, size, at(index), os, count);
                            let last = carry.wrapping_offset(size * count as isize);
                            std::ptr::copy_nonoverlapping(last, carry, size as usize);
                        }
                    }
                }
                monitor.chunk()?;
                index += count;
            }
        }

        monitor.finish();
        Ok(())
    }

    /// Applies the function to every pair `(a[i...], b[j...])`; the output shape is `a`'s shape
    /// followed by `b`'s.
    pub fn outer(self, a: &Array, b: &Array) -> Result<Array, LoopError> {
        self.check_binary()?;
        let types = [a.data_type(), b.data_type()];
        let entry = self.ufunc.resolve(&types, &[None], self.settings.casting.as_ref())?;
        let shape: Shape = a.shape().iter().chain(b.shape().iter()).copied().collect();
        let mut output = Array::zeros(entry.types[2], shape);
        self.outer_view(entry, a, b, output.view_mut())?;
        Ok(output)
    }

    pub fn outer_into(self, a: &Array, b: &Array, out: &mut Array) -> Result<(), LoopError> {
        self.check_binary()?;
        let shape: Shape = a.shape().iter().chain(b.shape().iter()).copied().collect();
        check_shape(out.shape(), shape)?;
        let types = [a.data_type(), b.data_type()];
        let outputs = [Some(out.data_type())];
        let entry = self.ufunc.resolve(&types, &outputs, self.settings.casting.as_ref())?;
        self.outer_view(entry, a, b, out.view_mut())
    }

    fn outer_view(&self, entry: &KernelEntry, a: &Array, b: &Array, output: ArrayViewMut) -> Result<(), LoopError> {
        let view = a.view();
        let offset = view.offset();
        let expanded = view.with_layout(a.layout().expand(b.ndim()), offset)?;
        let inputs = vec![expanded, b.view()];
        let ops = BroadcastLoop::new(self.ufunc, entry, inputs, vec![output], self.settings.clone())?;
        ops.run()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::ReductionLoop;
    use crate::{
        array::Array,
        builtins,
        errstate::{Action, Category, CollectSink, ErrorConfig, ErrorMask},
        fpe::{FpStatus, SimulatedProbe},
        kernel::KernelEntry,
        layout::Shape,
        loops::{LoopError, Settings},
        num::DataType,
        ufunc::UFunc,
    };

    #[test]
    fn test_reduce() -> Result<(), Box<dyn Error>> {
        let add = builtins::add()?;
        let x = Array::from_vec([2, 3], vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        assert_eq!(add.reduce(&x, 0)?.to_vec::<f64>()?, vec![5.0, 7.0, 9.0]);
        assert_eq!(add.reduce(&x, -1)?.to_vec::<f64>()?, vec![6.0, 15.0]);
        assert!(matches!(add.reduce(&x, 2), Err(LoopError::Axis(2, 2))));

        let sum = add.reduce(&add.reduce(&x, 0)?, 0)?;
        assert!(sum.shape().is_empty());
        assert_eq!(sum.to_vec::<f64>()?, vec![21.0]);

        // chunked along a long strided axis
        let data = (0..1000).map(|x| x as f64).collect::<Vec<_>>();
        let x = Array::from_vec([500, 2], data)?;
        let settings = Settings::default().with_bufsize(16);
        let z = ReductionLoop::new(&add, settings).reduce(&x, 0)?;
        assert_eq!(z.to_vec::<f64>()?, vec![249500.0, 250000.0]);
        Ok(())
    }

    #[test]
    fn test_reduce_empty() -> Result<(), Box<dyn Error>> {
        let x = Array::zeros(DataType::F64, [0]);
        let z = builtins::add()?.reduce(&x, 0)?;
        assert_eq!(z.to_vec::<f64>()?, vec![0.0]);

        let z = builtins::multiply()?.reduce(&Array::zeros(DataType::I32, [3, 0]), 1)?;
        assert_eq!(z.to_vec::<i32>()?, vec![1, 1, 1]);

        assert!(matches!(
            builtins::maximum()?.reduce(&x, 0),
            Err(LoopError::ZeroSizeReduction(_))
        ));
        assert!(matches!(
            builtins::subtract()?.reduce(&x, 0),
            Err(LoopError::ZeroSizeReduction(_))
        ));
        Ok(())
    }

    #[test]
    fn test_reduce_dtype() -> Result<(), Box<dyn Error>> {
        let add = builtins::add()?;
        let x = Array::from_vec([3], vec![100i8, 100, 100])?;
        let z = add.reduce(&x, 0)?;
        assert_eq!(z.to_vec::<i8>()?, vec![44]);

        let z = ReductionLoop::new(&add, Settings::default())
            .with_dtype(DataType::I64)
            .reduce(&x, 0)?;
        assert_eq!(z.to_vec::<i64>()?, vec![300]);

        let mut out = Array::zeros(DataType::F64, Shape::default());
        ReductionLoop::new(&add, Settings::default()).reduce_into(&x, 0, &mut out)?;
        assert_eq!(out.to_vec::<f64>()?, vec![300.0]);

        let mut out = Array::zeros(DataType::F64, [2]);
        assert!(matches!(
            ReductionLoop::new(&add, Settings::default()).reduce_into(&x, 0, &mut out),
            Err(LoopError::ShapeMismatch(_))
        ));
        Ok(())
    }

    #[test]
    fn test_accumulate() -> Result<(), Box<dyn Error>> {
        let add = builtins::add()?;
        for len in 0..40usize {
            let x = Array::from_vec([len], (1..=len as i64).collect::<Vec<_>>())?;
            let settings = Settings::default().with_bufsize(16);
            let z = ReductionLoop::new(&add, settings.clone()).accumulate(&x, 0)?;
            assert_eq!(z.shape().to_vec(), vec![len]);
            let expected = (1..=len as i64).map(|n| n * (n + 1) / 2).collect::<Vec<_>>();
            assert_eq!(z.to_vec::<i64>()?, expected);

            let mut out = Array::zeros(DataType::I64, [len]).byteswapped();
            ReductionLoop::new(&add, settings).accumulate_into(&x, 0, &mut out)?;
            assert_eq!(out.to_vec::<i64>()?, expected);
        }

        let x = Array::from_vec([2, 3], vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0])?;
        let z = builtins::multiply()?.accumulate(&x, 1)?;
        assert_eq!(z.to_vec::<f32>()?, vec![1.0, 2.0, 6.0, 4.0, 20.0, 120.0]);
        let z = builtins::maximum()?.accumulate(&x, 0)?;
        assert_eq!(z.to_vec::<f32>()?, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        Ok(())
    }

    #[test]
    fn test_reduceat() -> Result<(), Box<dyn Error>> {
        let add = builtins::add()?;
        let x = Array::from_vec([5], vec![1.0f64, 2.0, 3.0, 4.0, 5.0])?;
        let z = add.reduceat(&x, 0, &[0, 2, 2, 5])?;
        assert_eq!(z.to_vec::<f64>()?, vec![3.0, 0.0, 12.0]);

        let z = add.reduceat(&x, 0, &[3, 1, 4])?;
        assert_eq!(z.to_vec::<f64>()?, vec![0.0, 9.0]);

        let x = Array::from_vec([2, 4], (0..8).collect::<Vec<i32>>())?;
        let z = add.reduceat(&x, 1, &[0, 1, 4])?;
        assert_eq!(z.shape().to_vec(), vec![2, 2]);
        assert_eq!(z.to_vec::<i32>()?, vec![0, 6, 4, 18]);

        assert!(matches!(
            add.reduceat(&x, 1, &[0, 5]),
            Err(LoopError::Index { index: 5, len: 4 })
        ));
        assert!(matches!(
            builtins::maximum()?.reduceat(&x, 1, &[0, 2, 2]),
            Err(LoopError::ZeroSizeReduction(_))
        ));
        Ok(())
    }

    #[test]
    fn test_outer() -> Result<(), Box<dyn Error>> {
        let multiply = builtins::multiply()?;
        let a = Array::from_vec([3], vec![1.0f64, 2.0, 3.0])?;
        let b = Array::from_vec([4], vec![1.0f64, 10.0, 100.0, 1000.0])?;
        let z = multiply.outer(&a, &b)?;
        assert_eq!(z.shape().to_vec(), vec![3, 4]);
        let z = z.to_vec::<f64>()?;
        for i in 0..3 {
            for j in 0..4 {
                assert_eq!(z[i * 4 + j], a.to_vec::<f64>()?[i] * b.to_vec::<f64>()?[j]);
            }
        }

        let a = Array::from_vec([2, 1], vec![1i32, 2])?;
        let z = builtins::subtract()?.outer(&a, &b)?;
        assert_eq!(z.shape().to_vec(), vec![2, 1, 4]);
        assert_eq!(z.to_vec::<f64>()?, vec![0.0, -9.0, -99.0, -999.0, 1.0, -8.0, -98.0, -998.0]);
        Ok(())
    }

    #[test]
    fn test_unsupported() -> Result<(), Box<dyn Error>> {
        let x = Array::from_vec([3], vec![1.0f64, 2.0, 3.0])?;
        assert!(matches!(
            builtins::negative()?.reduce(&x, 0),
            Err(LoopError::Unsupported { .. })
        ));
        assert!(matches!(
            builtins::inner1d()?.accumulate(&x, 0),
            Err(LoopError::Unsupported { .. })
        ));
        assert!(matches!(
            builtins::inner1d()?.outer(&x, &x),
            Err(LoopError::Unsupported { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_reduce_raise() -> Result<(), Box<dyn Error>> {
        let divide = builtins::divide()?;
        let x = Array::from_vec([4], vec![8.0f64, 2.0, 0.0, 2.0])?;
        let errors = ErrorConfig::default().with_action(Category::DivideByZero, Action::Raise);
        let settings = Settings::default().with_errors(errors);
        let result = ReductionLoop::new(&divide, settings.clone()).reduce(&x, 0);
        assert!(matches!(
            result,
            Err(LoopError::FloatingPoint { category: Category::DivideByZero, .. })
        ));

        let x = Array::from_vec([3], vec![8.0f64, 2.0, 2.0])?;
        let z = ReductionLoop::new(&divide, settings).reduce(&x, 0)?;
        assert_eq!(z.to_vec::<f64>()?, vec![2.0]);
        Ok(())
    }

    #[test]
    fn test_reduce_warn_once() -> Result<(), Box<dyn Error>> {
        let probe = SimulatedProbe::new();
        let entry = {
            let probe = probe.clone();
            KernelEntry::binary("noisy_add", move |x: f64, y: f64| {
                probe.raise(FpStatus::OVERFLOW);
                x + y
            })
        };
        let ufunc = UFunc::new("noisy_add", 2, 1).with_kernel(entry)?;
        let sink = CollectSink::new();
        let errors = ErrorConfig::default()
            .with_mask(ErrorMask::all(Action::Warn))
            .with_warn_sink(sink.clone());
        let settings = Settings::default()
            .with_bufsize(16)
            .with_errors(errors)
            .with_probe(probe);

        // ten chunks, every one of them raising
        let x = Array::from_vec([161], vec![1.0f64; 161])?;
        let z = ReductionLoop::new(&ufunc, settings.clone()).reduce(&x, 0)?;
        assert_eq!(z.to_vec::<f64>()?, vec![161.0]);
        assert_eq!(sink.lines(), vec!["Warning: overflow encountered in noisy_add\n".to_string()]);

        let z = ReductionLoop::new(&ufunc, settings).accumulate(&x, 0)?;
        assert_eq!(z.to_vec::<f64>()?[160], 161.0);
        assert_eq!(sink.lines().len(), 2);
        Ok(())
    }
}
