use std::{borrow::Cow, fmt, marker::PhantomData, sync::Arc};

use dyn_clone::DynClone;
use itertools::Itertools;
use thiserror::Error;

use crate::{
    errstate::BoxError,
    num::{DataType, Element, Value},
};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("kernel expects {0} arguments, got {1}")]
    Arity(usize, usize),
    #[error("kernel expects {0} core dimensions, got {1}")]
    Core(usize, usize),
    #[error("callback kernel with {0} inputs has {1} types and no output")]
    Outputs(usize, usize),
    #[error("kernel callback failed: {0}")]
    Callback(BoxError),
}

/// Strided operands of one kernel invocation.
#[derive(Debug, Clone, Copy)]
pub struct KernelArgs<'a> {
    /// First element of each argument, inputs then outputs.
    pub ptrs: &'a [*mut u8],
    /// Byte step between consecutive elements of each argument.
    pub steps: &'a [isize],
    /// Number of elements to process.
    pub len: usize,
    /// Sizes of the named core dimensions, for generalized kernels.
    pub core_dims: &'a [usize],
    /// Byte strides of every argument's core axes, argument by argument.
    pub core_steps: &'a [isize],
}

impl<'a> KernelArgs<'a> {
    pub fn new(ptrs: &'a [*mut u8], steps: &'a [isize], len: usize) -> Self {
        Self {
            ptrs,
            steps,
            len,
            core_dims: &[],
            core_steps: &[],
        }
    }

    /// Pointer to element `index` of argument `arg`.
    #[inline]
    pub fn at(&self, arg: usize, index: usize) -> *mut u8 {
        self.ptrs[arg].wrapping_offset(self.steps[arg] * index as isize)
    }

    /// # Safety
    /// Argument `arg` must hold a valid `T` at `index`.
    #[inline]
    pub unsafe fn load<T: Element>(&self, arg: usize, index: usize) -> T {
        unsafe { self.at(arg, index).cast::<T>().read_unaligned() }
    }

    /// # Safety
    /// Argument `arg` must be writable for a `T` at `index`.
    #[inline]
    pub unsafe fn store<T: Element>(&self, arg: usize, index: usize, value: T) {
        unsafe { self.at(arg, index).cast::<T>().write_unaligned(value) }
    }

    /// Reads a type-erased element.
    ///
    /// # Safety
    /// Argument `arg` must hold a valid element of `r#type` at `index`.
    pub unsafe fn load_value(&self, r#type: DataType, arg: usize, index: usize) -> Value {
        let bytes = unsafe { std::slice::from_raw_parts(self.at(arg, index), r#type.size()) };
        r#type.reader()(bytes)
    }

    /// Writes a type-erased element.
    ///
    /// # Safety
    /// Argument `arg` must be writable for an element of `r#type` at `index`.
    pub unsafe fn store_value(&self, r#type: DataType, arg: usize, index: usize, value: Value) {
        let bytes = unsafe { std::slice::from_raw_parts_mut(self.at(arg, index), r#type.size()) };
        r#type.writer()(value, bytes)
    }
}

/// A type-specific inner loop.
///
/// Implementations process exactly `args.len` elements, advancing each argument by its step.
/// Arithmetic exceptions must be left latched (or reported through [`crate::fpe::raise`]) so the
/// loop sees them after the call returns.
pub trait Kernel: DynClone + Send + Sync {
    /// The name of the kernel, for diagnostics.
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        std::any::type_name::<Self>().into()
    }

    /// Returns `true` if the kernel calls back into the host runtime, which rules out
    /// releasing the host lock while it runs.
    #[inline]
    fn needs_api(&self) -> bool {
        false
    }

    /// # Safety
    /// Every pointer in `args` must be valid for `args.len` elements of the entry's types at the
    /// given steps, and output regions must not alias inputs other than element for element.
    unsafe fn execute(&self, args: &KernelArgs) -> Result<(), KernelError>;
}

dyn_clone::clone_trait_object!(Kernel);

impl fmt::Debug for dyn Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One row of a kernel table: the argument types and the kernel that handles them.
#[derive(Debug, Clone)]
pub struct KernelEntry {
    pub types: Arc<[DataType]>,
    pub kernel: Box<dyn Kernel>,
}

impl KernelEntry {
    pub fn new(types: impl Into<Arc<[DataType]>>, kernel: impl Kernel + 'static) -> Self {
        let types = types.into();
        let kernel = Box::new(kernel);
        Self { types, kernel }
    }

    /// A kernel applying `f` to every element.
    pub fn unary<A, B, F>(name: &'static str, f: F) -> Self
    where
        A: Element,
        B: Element,
        F: Fn(A) -> B + Clone + Send + Sync + 'static,
    {
        let kernel = UnaryKernel {
            name,
            f,
            phantom: PhantomData,
        };
        Self::new([A::DATA_TYPE, B::DATA_TYPE], kernel)
    }

    /// A kernel applying `f` to every pair of elements.
    pub fn binary<A, B, C, F>(name: &'static str, f: F) -> Self
    where
        A: Element,
        B: Element,
        C: Element,
        F: Fn(A, B) -> C + Clone + Send + Sync + 'static,
    {
        let kernel = BinaryKernel {
            name,
            f,
            phantom: PhantomData,
        };
        Self::new([A::DATA_TYPE, B::DATA_TYPE, C::DATA_TYPE], kernel)
    }

    /// A kernel calling back into the host for every element.
    ///
    /// The first `nin` types are inputs and the rest outputs, of which there must be at least one.
    /// `f` receives the input values and fills one value per output.
    pub fn callback<F>(
        name: &'static str,
        nin: usize,
        types: impl Into<Arc<[DataType]>>,
        f: F,
    ) -> Result<Self, KernelError>
    where
        F: Fn(&[Value], &mut [Value]) -> Result<(), BoxError> + Clone + Send + Sync + 'static,
    {
        let types = types.into();
        if nin >= types.len() {
            return Err(KernelError::Outputs(nin, types.len()));
        }
        let kernel = CallbackKernel {
            name,
            nin,
            types: types.clone(),
            f,
        };
        Ok(Self { types, kernel: Box::new(kernel) })
    }

    #[inline]
    pub fn nargs(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if the entry handles boxed elements or its kernel calls into the host.
    pub fn needs_api(&self) -> bool {
        self.kernel.needs_api() || self.types.iter().any(|t| t.is_object())
    }
}

impl fmt::Display for KernelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.types.iter().format(", "))
    }
}

#[derive(Clone)]
struct UnaryKernel<A, B, F> {
    name: &'static str,
    f: F,
    phantom: PhantomData<fn(A) -> B>,
}

impl<A, B, F> Kernel for UnaryKernel<A, B, F>
where
    A: Element,
    B: Element,
    F: Fn(A) -> B + Clone + Send + Sync + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from(format!("{}<{}, {}>", self.name, A::DATA_TYPE, B::DATA_TYPE))
    }

    fn needs_api(&self) -> bool {
        A::DATA_TYPE.is_object() || B::DATA_TYPE.is_object()
    }

    unsafe fn execute(&self, args: &KernelArgs) -> Result<(), KernelError> {
        if args.ptrs.len() != 2 {
            return Err(KernelError::Arity(2, args.ptrs.len()));
        }
        for index in 0..args.len {
            unsafe {
                let x: A = args.load(0, index);
                args.store(1, index, (self.f)(x));
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
struct BinaryKernel<A, B, C, F> {
    name: &'static str,
    f: F,
    phantom: PhantomData<fn(A, B) -> C>,
}

impl<A, B, C, F> Kernel for BinaryKernel<A, B, C, F>
where
    A: Element,
    B: Element,
    C: Element,
    F: Fn(A, B) -> C + Clone + Send + Sync + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        let types = [A::DATA_TYPE, B::DATA_TYPE, C::DATA_TYPE];
        Cow::from(format!("{}<{}>", self.name, types.iter().format(", ")))
    }

    fn needs_api(&self) -> bool {
        [A::DATA_TYPE, B::DATA_TYPE, C::DATA_TYPE]
            .iter()
            .any(|t| t.is_object())
    }

    unsafe fn execute(&self, args: &KernelArgs) -> Result<(), KernelError> {
        if args.ptrs.len() != 3 {
            return Err(KernelError::Arity(3, args.ptrs.len()));
        }
        for index in 0..args.len {
            unsafe {
                let x: A = args.load(0, index);
                let y: B = args.load(1, index);
                args.store(2, index, (self.f)(x, y));
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
struct CallbackKernel<F> {
    name: &'static str,
    nin: usize,
    types: Arc<[DataType]>,
    f: F,
}

impl<F> Kernel for CallbackKernel<F>
where
    F: Fn(&[Value], &mut [Value]) -> Result<(), BoxError> + Clone + Send + Sync + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        self.name.into()
    }

    fn needs_api(&self) -> bool {
        true
    }

    unsafe fn execute(&self, args: &KernelArgs) -> Result<(), KernelError> {
        let nargs = self.types.len();
        if args.ptrs.len() != nargs {
            return Err(KernelError::Arity(nargs, args.ptrs.len()));
        }
        let (inputs, outputs) = self.types.split_at(self.nin);
        let mut values = Vec::with_capacity(inputs.len());
        let mut results = vec![Value::Object(0); outputs.len()];
        for index in 0..args.len {
            values.clear();
            for (arg, &r#type) in inputs.iter().enumerate() {
                values.push(unsafe { args.load_value(r#type, arg, index) });
            }
            (self.f)(&values, &mut results).map_err(KernelError::Callback)?;
            for (arg, (&r#type, &value)) in outputs.iter().zip_eq(results.iter()).enumerate() {
                unsafe { args.store_value(r#type, self.nin + arg, index, value) };
            }
        }
        Ok(())
    }
}
