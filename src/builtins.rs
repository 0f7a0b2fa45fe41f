//! A few ready-made functions over the numeric types.
//!
//! Kernel tables list integer kernels before floating-point ones, narrow before wide, so
//! first-fit resolution picks the smallest type that holds every input. Integer arithmetic wraps.

use std::{
    borrow::Cow,
    marker::PhantomData,
    ops::{Add, Mul},
};

use half::f16;
use spindle_derive::kernel;

use crate::{
    fpe::{self, FpStatus},
    kernel::{Kernel, KernelArgs, KernelEntry, KernelError},
    num::{Element, Value},
    ufunc::{Identity, RegisterError, Registry, UFunc},
};

fn table(
    name: &str,
    nin: usize,
    nout: usize,
    doc: &str,
    entries: impl IntoIterator<Item = KernelEntry>,
) -> Result<UFunc, RegisterError> {
    let mut ufunc = UFunc::new(name, nin, nout).with_doc(doc);
    for entry in entries {
        ufunc.register_kernel(entry)?;
    }
    Ok(ufunc)
}

macro_rules! int_kernels {
    ($name:literal, $op:ident) => {
        [
            KernelEntry::binary($name, |x: i8, y: i8| x.$op(y)),
            KernelEntry::binary($name, |x: u8, y: u8| x.$op(y)),
            KernelEntry::binary($name, |x: i16, y: i16| x.$op(y)),
            KernelEntry::binary($name, |x: u16, y: u16| x.$op(y)),
            KernelEntry::binary($name, |x: i32, y: i32| x.$op(y)),
            KernelEntry::binary($name, |x: u32, y: u32| x.$op(y)),
            KernelEntry::binary($name, |x: i64, y: i64| x.$op(y)),
            KernelEntry::binary($name, |x: u64, y: u64| x.$op(y)),
        ]
    };
}

macro_rules! float_kernels {
    ($name:literal, |$x:ident, $y:ident| $body:expr) => {
        [
            KernelEntry::binary($name, |$x: f16, $y: f16| $body),
            KernelEntry::binary($name, |$x: f32, $y: f32| $body),
            KernelEntry::binary($name, |$x: f64, $y: f64| $body),
        ]
    };
}

pub fn add() -> Result<UFunc, RegisterError> {
    let entries = int_kernels!("add", wrapping_add)
        .into_iter()
        .chain(float_kernels!("add", |x, y| x + y));
    table("add", 2, 1, "Adds arguments element-wise.", entries)
        .map(|ufunc| ufunc.with_identity(Identity::Value(Value::Int(0))))
}

pub fn subtract() -> Result<UFunc, RegisterError> {
    let entries = int_kernels!("subtract", wrapping_sub)
        .into_iter()
        .chain(float_kernels!("subtract", |x, y| x - y));
    table("subtract", 2, 1, "Subtracts arguments element-wise.", entries)
}

pub fn multiply() -> Result<UFunc, RegisterError> {
    let entries = int_kernels!("multiply", wrapping_mul)
        .into_iter()
        .chain(float_kernels!("multiply", |x, y| x * y));
    table("multiply", 2, 1, "Multiplies arguments element-wise.", entries)
        .map(|ufunc| ufunc.with_identity(Identity::Value(Value::Int(1))))
}

/// True division. Integer inputs resolve to a floating-point kernel.
///
/// Division by zero is reported through [`fpe::raise`] as well, so it is seen on targets
/// whose hardware flags are not probed.
pub fn divide() -> Result<UFunc, RegisterError> {
    let entries = float_kernels!("divide", |x, y| {
        if y == Default::default() {
            fpe::raise(FpStatus::DIVIDE_BY_ZERO);
        }
        x / y
    });
    table("divide", 2, 1, "Divides arguments element-wise.", entries)
}

macro_rules! floor_div {
    (signed $t:ty) => {
        KernelEntry::binary("floor_divide", |x: $t, y: $t| -> $t {
            match y {
                0 => {
                    fpe::raise(FpStatus::DIVIDE_BY_ZERO);
                    0
                }
                _ => {
                    let q = x.wrapping_div(y);
                    match x.wrapping_rem(y) != 0 && (x < 0) != (y < 0) {
                        true => q - 1,
                        false => q,
                    }
                }
            }
        })
    };
    (unsigned $t:ty) => {
        KernelEntry::binary("floor_divide", |x: $t, y: $t| -> $t {
            match x.checked_div(y) {
                Some(q) => q,
                None => {
                    fpe::raise(FpStatus::DIVIDE_BY_ZERO);
                    0
                }
            }
        })
    };
    (float $t:ty) => {
        KernelEntry::binary("floor_divide", |x: $t, y: $t| -> $t {
            if y == 0.0 {
                fpe::raise(FpStatus::DIVIDE_BY_ZERO);
            }
            (x / y).floor()
        })
    };
}

/// Division rounding toward negative infinity.
///
/// An integer zero divisor yields `0` and raises the divide-by-zero flag.
pub fn floor_divide() -> Result<UFunc, RegisterError> {
    let entries = [
        floor_div!(signed i8),
        floor_div!(unsigned u8),
        floor_div!(signed i16),
        floor_div!(unsigned u16),
        floor_div!(signed i32),
        floor_div!(unsigned u32),
        floor_div!(signed i64),
        floor_div!(unsigned u64),
        floor_div!(float f32),
        floor_div!(float f64),
    ];
    table("floor_divide", 2, 1, "Divides arguments and rounds down.", entries)
}

/// Larger of two elements. A NaN in either argument propagates.
pub fn maximum() -> Result<UFunc, RegisterError> {
    let entries = int_kernels!("maximum", max).into_iter().chain(float_kernels!(
        "maximum",
        |x, y| match x >= y || x.is_nan() {
            true => x,
            false => y,
        }
    ));
    table("maximum", 2, 1, "Element-wise maximum.", entries)
        .map(|ufunc| ufunc.with_identity(Identity::Reorderable))
}

pub fn negative() -> Result<UFunc, RegisterError> {
    let entries = [
        KernelEntry::unary("negative", |x: i8| x.wrapping_neg()),
        KernelEntry::unary("negative", |x: i16| x.wrapping_neg()),
        KernelEntry::unary("negative", |x: i32| x.wrapping_neg()),
        KernelEntry::unary("negative", |x: i64| x.wrapping_neg()),
        KernelEntry::unary("negative", |x: f16| -x),
        KernelEntry::unary("negative", |x: f32| -x),
        KernelEntry::unary("negative", |x: f64| -x),
    ];
    table("negative", 1, 1, "Numerical negative, element-wise.", entries)
}

#[kernel(crate = "crate", name = "sqrt")]
fn sqrt_f16(x: f16) -> f16 {
    f16::from_f32(sqrt_f32(x.to_f32()))
}

#[kernel(crate = "crate", name = "sqrt")]
fn sqrt_f32(x: f32) -> f32 {
    if x < 0.0 {
        fpe::raise(FpStatus::INVALID);
    }
    x.sqrt()
}

#[kernel(crate = "crate", name = "sqrt")]
fn sqrt_f64(x: f64) -> f64 {
    if x < 0.0 {
        fpe::raise(FpStatus::INVALID);
    }
    x.sqrt()
}

/// Non-negative square root. Negative inputs give NaN and raise the invalid flag.
pub fn sqrt() -> Result<UFunc, RegisterError> {
    let entries = [SqrtF16::entry(), SqrtF32::entry(), SqrtF64::entry()];
    table("sqrt", 1, 1, "Non-negative square root, element-wise.", entries)
}

/// Sum of products over the last axis of both arguments.
#[derive(Debug, Clone, Copy)]
struct InnerProduct<T>(PhantomData<fn() -> T>);

impl<T> Kernel for InnerProduct<T>
where
    T: Element + Add<Output = T> + Mul<Output = T>,
{
    fn name(&self) -> Cow<'static, str> {
        Cow::from(format!("inner1d<{}>", T::DATA_TYPE))
    }

    unsafe fn execute(&self, args: &KernelArgs) -> Result<(), KernelError> {
        if args.ptrs.len() != 3 {
            return Err(KernelError::Arity(3, args.ptrs.len()));
        }
        let &[len] = args.core_dims else {
            return Err(KernelError::Core(1, args.core_dims.len()));
        };
        let &[a_step, b_step] = args.core_steps else {
            return Err(KernelError::Core(2, args.core_steps.len()));
        };
        for index in 0..args.len {
            let (a, b) = (args.at(0, index), args.at(1, index));
            let mut sum = T::zeroed();
            for i in 0..len as isize {
                let (x, y) = unsafe {
                    (
                        a.wrapping_offset(a_step * i).cast::<T>().read_unaligned(),
                        b.wrapping_offset(b_step * i).cast::<T>().read_unaligned(),
                    )
                };
                sum = sum + x * y;
            }
            unsafe { args.store(2, index, sum) };
        }
        Ok(())
    }
}

/// Generalized function `(i),(i)->()`: inner product over the last axis, broadcast over the rest.
pub fn inner1d() -> Result<UFunc, RegisterError> {
    let entries = [
        KernelEntry::new([f32::DATA_TYPE; 3], InnerProduct::<f32>(PhantomData)),
        KernelEntry::new([f64::DATA_TYPE; 3], InnerProduct::<f64>(PhantomData)),
    ];
    table("inner1d", 2, 1, "Inner product over the last axis.", entries)
        .and_then(|ufunc| ufunc.with_core_signature("(i),(i)->()"))
}

/// A registry holding every built-in function.
pub fn registry() -> Result<Registry, RegisterError> {
    let mut registry = Registry::new();
    for ufunc in [
        add()?,
        subtract()?,
        multiply()?,
        divide()?,
        floor_divide()?,
        maximum()?,
        negative()?,
        sqrt()?,
        inner1d()?,
    ] {
        registry.insert(ufunc);
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use half::f16;

    use super::{SqrtF64, registry};
    use crate::{
        array::Array,
        errstate::{Action, Category, ErrorConfig, ErrorMask},
        kernel::Kernel,
        loops::{LoopError, Settings},
        num::DataType,
    };

    #[test]
    fn test_registry() -> Result<(), Box<dyn Error>> {
        let registry = registry()?;
        let mut names = registry.names().collect::<Vec<_>>();
        names.sort();
        assert_eq!(
            names,
            vec![
                "add",
                "divide",
                "floor_divide",
                "inner1d",
                "maximum",
                "multiply",
                "negative",
                "sqrt",
                "subtract"
            ]
        );
        let inner1d = registry.get("inner1d").ok_or("inner1d missing")?;
        assert_eq!(
            inner1d.core_signature().map(|core| core.to_string()),
            Some("(i),(i)->()".to_string())
        );
        Ok(())
    }

    #[test]
    fn test_integer_tables() -> Result<(), Box<dyn Error>> {
        let registry = registry()?;
        let add = registry.get("add").ok_or("add missing")?;
        let x = Array::from_vec([3], vec![i8::MAX, 1, -3])?;
        let y = Array::from_vec([3], vec![1i8, 1, -3])?;
        let z = add.call(&[&x, &y])?.remove(0);
        assert_eq!(z.to_vec::<i8>()?, vec![i8::MIN, 2, -6]);

        let x = Array::from_vec([3], vec![1u8, 2, 3])?;
        let y = Array::from_vec([3], vec![-1i16, 0, 1])?;
        let z = registry.get("maximum").ok_or("maximum missing")?.call(&[&x, &y])?.remove(0);
        assert_eq!(z.data_type(), DataType::I16);
        assert_eq!(z.to_vec::<i16>()?, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_floor_divide() -> Result<(), Box<dyn Error>> {
        let floor_divide = registry()?.get("floor_divide").ok_or("floor_divide missing")?.clone();
        let x = Array::from_vec([4], vec![7i32, -7, 7, -7])?;
        let y = Array::from_vec([4], vec![2i32, 2, -2, -2])?;
        let z = floor_divide.call(&[&x, &y])?.remove(0);
        assert_eq!(z.to_vec::<i32>()?, vec![3, -4, -4, 3]);

        let y = Array::from_vec([4], vec![2i32, 0, 1, 1])?;
        let errors = ErrorConfig::default().with_action(Category::DivideByZero, Action::Raise);
        let result = floor_divide.call_with(&[&x, &y], Settings::default().with_errors(errors));
        assert!(matches!(
            result,
            Err(LoopError::FloatingPoint { category: Category::DivideByZero, .. })
        ));

        let errors = ErrorConfig::default().with_mask(ErrorMask::IGNORE);
        let z = floor_divide
            .call_with(&[&x, &y], Settings::default().with_errors(errors))?
            .remove(0);
        assert_eq!(z.to_vec::<i32>()?, vec![3, 0, 7, -7]);
        Ok(())
    }

    #[test]
    fn test_sqrt() -> Result<(), Box<dyn Error>> {
        assert_eq!(SqrtF64.name(), "sqrt");
        assert_eq!(SqrtF64::TYPES, [DataType::F64; 2]);

        let sqrt = super::sqrt()?;
        let x = Array::from_vec([3], vec![f16::from_f32(4.0), f16::from_f32(9.0), f16::ZERO])?;
        let z = sqrt.call(&[&x])?.remove(0);
        assert_eq!(z.data_type(), DataType::F16);
        assert_eq!(
            z.to_vec::<f16>()?,
            vec![f16::from_f32(2.0), f16::from_f32(3.0), f16::ZERO]
        );

        let errors = ErrorConfig::default().with_action(Category::Invalid, Action::Raise);
        let x = Array::from_vec([2], vec![4.0f64, -1.0])?;
        let result = sqrt.call_with(&[&x], Settings::default().with_errors(errors));
        assert!(matches!(
            result,
            Err(LoopError::FloatingPoint { category: Category::Invalid, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_negative() -> Result<(), Box<dyn Error>> {
        let negative = super::negative()?;
        let x = Array::from_vec([3], vec![1u8, 2, 3])?;
        let z = negative.call(&[&x])?.remove(0);
        assert_eq!(z.to_vec::<i16>()?, vec![-1, -2, -3]);
        Ok(())
    }
}
