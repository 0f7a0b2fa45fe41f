//! Element-wise vectorized functions over strided arrays.
//!
//! A [`UFunc`] owns an ordered table of type-specific [`Kernel`]s. Calling it resolves a kernel
//! for the argument types, broadcasts the arguments against each other and drives the kernel over
//! the result chunk by chunk, converting misaligned, byte-swapped or mistyped arguments through
//! scratch buffers. Binary functions additionally reduce, accumulate and take outer products.
//!
//! Floating-point exceptions raised by kernels are probed after every chunk and handled by the
//! calling thread's [`ErrorConfig`]: ignored, warned or printed once per call, logged, raised as an
//! error or passed to a handler.
//!
//! ```
//! use spindle::{Array, builtins};
//!
//! let add = builtins::add()?;
//! let x = Array::from_vec([2, 3], vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0])?;
//! let y = Array::from_vec([3], vec![10.0f64, 20.0, 30.0])?;
//! let z = add.call(&[&x, &y])?.remove(0);
//! assert_eq!(z.to_vec::<f64>()?, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
//! assert_eq!(add.reduce(&x, 0)?.to_vec::<f64>()?, vec![5.0, 7.0, 9.0]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod array;
pub mod builtins;
pub mod cast;
pub mod errstate;
pub mod fpe;
pub mod kernel;
pub mod layout;
pub mod loops;
pub mod num;
pub mod signature;
pub mod ufunc;

pub use array::{Array, ArrayView, ArrayViewMut, Descr};
pub use errstate::{Action, Category, ErrorConfig, ErrorMask};
pub use kernel::{Kernel, KernelArgs, KernelEntry};
pub use loops::{LoopError, Settings, reduce::ReductionLoop};
pub use num::{DataType, Value};
pub use spindle_derive::kernel;
pub use ufunc::{Identity, Registry, UFunc};
