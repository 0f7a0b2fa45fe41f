//! Vectorized functions and their kernel tables.

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    array::Array,
    cast::CastPolicy,
    kernel::KernelEntry,
    loops::{
        LoopError, Settings,
        broadcast::{self, BroadcastLoop},
        reduce::ReductionLoop,
    },
    num::{DataType, TypeList, Value},
    signature::{CoreSignature, SignatureError},
};

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("{name}: kernel {types} has {found} types, expected {expected}")]
    Types {
        name: String,
        types: TypeList,
        expected: usize,
        found: usize,
    },
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error("function {0} is not registered")]
    NotFound(String),
}

/// Seed of a reduction over an empty axis.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Identity {
    /// No identity: reducing an empty axis fails.
    #[default]
    None,
    /// A neutral element, e.g. `0` for addition.
    Value(Value),
    /// No identity, but the operation may be regrouped, so a reduction seeds with the first
    /// element.
    Reorderable,
}

/// A registered vectorized function: arity, an ordered kernel table, a reduction identity and an
/// optional core signature.
#[derive(Debug, Clone)]
pub struct UFunc {
    name: String,
    doc: String,
    nin: usize,
    nout: usize,
    kernels: Vec<KernelEntry>,
    identity: Identity,
    core: Option<CoreSignature>,
}

impl UFunc {
    /// Creates a function with an empty kernel table.
    pub fn new(name: impl Into<String>, nin: usize, nout: usize) -> Self {
        Self {
            name: name.into(),
            doc: String::new(),
            nin,
            nout,
            kernels: vec![],
            identity: Identity::None,
            core: None,
        }
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Parses and attaches a core signature such as `(i),(i)->()`.
    ///
    /// A signature without any core dimension leaves the function scalar.
    pub fn with_core_signature(mut self, signature: &str) -> Result<Self, RegisterError> {
        let signature: CoreSignature = signature.parse()?;
        signature.check_arity(self.nin, self.nout)?;
        self.core = (!signature.is_scalar()).then_some(signature);
        Ok(self)
    }

    pub fn with_kernel(mut self, entry: KernelEntry) -> Result<Self, RegisterError> {
        self.register_kernel(entry)?;
        Ok(self)
    }

    /// Appends a kernel to the table. Entries already present keep precedence in resolution.
    pub fn register_kernel(&mut self, entry: KernelEntry) -> Result<(), RegisterError> {
        if entry.nargs() != self.nargs() {
            return Err(RegisterError::Types {
                name: self.name.clone(),
                types: entry.types.iter().copied().collect(),
                expected: self.nargs(),
                found: entry.nargs(),
            });
        }
        log::trace!("{}: register kernel {}", self.name, entry);
        self.kernels.push(entry);
        Ok(())
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn doc(&self) -> &str {
        &self.doc
    }

    #[inline]
    pub fn nin(&self) -> usize {
        self.nin
    }

    #[inline]
    pub fn nout(&self) -> usize {
        self.nout
    }

    #[inline]
    pub fn nargs(&self) -> usize {
        self.nin + self.nout
    }

    #[inline]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    #[inline]
    pub fn core_signature(&self) -> Option<&CoreSignature> {
        self.core.as_ref()
    }

    #[inline]
    pub fn kernels(&self) -> &[KernelEntry] {
        &self.kernels
    }

    fn check_inputs(&self, found: usize) -> Result<(), LoopError> {
        match found == self.nin {
            true => Ok(()),
            false => Err(LoopError::Arity {
                name: self.name.clone(),
                expected: self.nin,
                found,
            }),
        }
    }

    /// Finds the first kernel in table order that every input can be cast to, and whose outputs
    /// can be cast to the requested output types. Unrequested outputs take the kernel's type.
    pub fn resolve(
        &self,
        inputs: &[DataType],
        outputs: &[Option<DataType>],
        casting: &dyn CastPolicy,
    ) -> Result<&KernelEntry, LoopError> {
        self.check_inputs(inputs.len())?;
        let found = self.kernels.iter().find(|entry| {
            let (declared_inputs, declared_outputs) = entry.types.split_at(self.nin);
            let inputs = inputs
                .iter()
                .zip_eq(declared_inputs)
                .all(|(&from, &to)| casting.can_cast(from, to));
            let outputs = outputs
                .iter()
                .zip(declared_outputs)
                .all(|(&output, &from)| output.is_none_or(|to| casting.can_cast(from, to)));
            inputs && outputs
        });
        found.ok_or_else(|| self.no_match(inputs))
    }

    /// Finds the first kernel whose types are exactly `types`, inputs then outputs.
    pub fn resolve_exact(&self, types: &[DataType]) -> Result<&KernelEntry, LoopError> {
        self.kernels
            .iter()
            .find(|entry| *entry.types == *types)
            .ok_or_else(|| self.no_match(types))
    }

    fn no_match(&self, types: &[DataType]) -> LoopError {
        LoopError::TypeResolution {
            name: self.name.clone(),
            types: types.iter().copied().collect(),
        }
    }

    /// Applies the function, allocating the outputs.
    pub fn call(&self, inputs: &[&Array]) -> Result<Vec<Array>, LoopError> {
        self.call_with(inputs, Settings::default())
    }

    pub fn call_with(&self, inputs: &[&Array], settings: Settings) -> Result<Vec<Array>, LoopError> {
        let types = inputs.iter().map(|x| x.data_type()).collect_vec();
        let outputs = vec![None; self.nout];
        let entry = self.resolve(&types, &outputs, settings.casting.as_ref())?;
        self.call_entry(entry, inputs, settings)
    }

    /// Applies the kernel registered for exactly `types`, casting inputs as needed.
    pub fn call_exact(
        &self,
        types: &[DataType],
        inputs: &[&Array],
        settings: Settings,
    ) -> Result<Vec<Array>, LoopError> {
        let entry = self.resolve_exact(types)?;
        self.call_entry(entry, inputs, settings)
    }

    fn call_entry(
        &self,
        entry: &KernelEntry,
        inputs: &[&Array],
        settings: Settings,
    ) -> Result<Vec<Array>, LoopError> {
        self.check_inputs(inputs.len())?;
        let core = self.core_signature();
        let shapes = inputs
            .iter()
            .map(|x| Some(x.shape()))
            .chain(std::iter::repeat_n(None, self.nout))
            .collect_vec();
        let geometry = broadcast::geometry(core, self.nin, &shapes)?;

        let mut outputs = (self.nin..self.nargs())
            .map(|arg| Array::zeros(entry.types[arg], geometry.shape_of(core, arg)))
            .collect_vec();
        let views = inputs.iter().map(|x| x.view()).collect();
        let views_mut = outputs.iter_mut().map(|x| x.view_mut()).collect();
        BroadcastLoop::new(self, entry, views, views_mut, settings)?.run()?;
        Ok(outputs)
    }

    /// Applies the function into existing outputs, which must have the broadcast shape.
    ///
    /// On a floating-point or handler error, chunks already processed stay written.
    pub fn call_into(
        &self,
        inputs: &[&Array],
        outputs: &mut [&mut Array],
        settings: Settings,
    ) -> Result<(), LoopError> {
        let types = inputs.iter().map(|x| x.data_type()).collect_vec();
        let output_types = outputs.iter().map(|x| Some(x.data_type())).collect_vec();
        let entry = self.resolve(&types, &output_types, settings.casting.as_ref())?;
        let views = inputs.iter().map(|x| x.view()).collect();
        let views_mut = outputs.iter_mut().map(|x| x.view_mut()).collect();
        BroadcastLoop::new(self, entry, views, views_mut, settings)?.run()
    }

    /// Folds the function along `axis`. See [`ReductionLoop::reduce`].
    pub fn reduce(&self, array: &Array, axis: isize) -> Result<Array, LoopError> {
        ReductionLoop::new(self, Settings::default()).reduce(array, axis)
    }

    /// Running fold along `axis`. See [`ReductionLoop::accumulate`].
    pub fn accumulate(&self, array: &Array, axis: isize) -> Result<Array, LoopError> {
        ReductionLoop::new(self, Settings::default()).accumulate(array, axis)
    }

    /// Folds each `[indices[i], indices[i + 1])` segment of `axis`. See [`ReductionLoop::reduceat`].
    pub fn reduceat(&self, array: &Array, axis: isize, indices: &[usize]) -> Result<Array, LoopError> {
        ReductionLoop::new(self, Settings::default()).reduceat(array, axis, indices)
    }

    /// Applies the function to every pair of elements. See [`ReductionLoop::outer`].
    pub fn outer(&self, a: &Array, b: &Array) -> Result<Array, LoopError> {
        ReductionLoop::new(self, Settings::default()).outer(a, b)
    }
}

/// Functions by name.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    ufuncs: HashMap<String, UFunc>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a function, replacing any function of the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        nin: usize,
        nout: usize,
        kernels: impl IntoIterator<Item = KernelEntry>,
        identity: Identity,
        core_signature: Option<&str>,
    ) -> Result<&UFunc, RegisterError> {
        let mut ufunc = UFunc::new(name, nin, nout).with_identity(identity);
        if let Some(signature) = core_signature {
            ufunc = ufunc.with_core_signature(signature)?;
        }
        for entry in kernels {
            ufunc.register_kernel(entry)?;
        }
        Ok(self.insert(ufunc))
    }

    /// Adds a function built elsewhere, replacing any function of the same name.
    pub fn insert(&mut self, ufunc: UFunc) -> &UFunc {
        let name = ufunc.name.clone();
        if self.ufuncs.contains_key(&name) {
            log::warn!("function {name} is registered again and replaces the previous one");
        }
        self.ufuncs.insert(name.clone(), ufunc);
        &self.ufuncs[&name]
    }

    /// Appends a kernel to a registered function's table.
    pub fn register_kernel(&mut self, name: &str, entry: KernelEntry) -> Result<(), RegisterError> {
        match self.ufuncs.get_mut(name) {
            Some(ufunc) => ufunc.register_kernel(entry),
            None => {
                log::error!("unable to register kernel {entry} for unknown function {name}");
                Err(RegisterError::NotFound(name.to_string()))
            }
        }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&UFunc> {
        self.ufuncs.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ufuncs.keys().map(|name| name.as_str()).sorted()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Identity, RegisterError, Registry, UFunc};
    use crate::{
        array::Array,
        cast::{SafeCasting, UnsafeCasting},
        kernel::KernelEntry,
        loops::{LoopError, Settings},
        num::{DataType, Value},
    };

    #[test]
    fn test_first_fit() -> Result<(), Box<dyn Error>> {
        let first = KernelEntry::binary("first", |x: f64, y: f64| x + y);
        let second = KernelEntry::binary("second", |x: f64, y: f64| x - y);
        let ufunc = UFunc::new("pick", 2, 1)
            .with_kernel(first)?
            .with_kernel(second)?;

        let entry = ufunc.resolve(&[DataType::F64; 2], &[None], &SafeCasting)?;
        assert!(entry.kernel.name().starts_with("first"));

        // a narrower input still resolves to the first match, not the closest
        let entry = ufunc.resolve(&[DataType::I8, DataType::F32], &[None], &SafeCasting)?;
        assert!(entry.kernel.name().starts_with("first"));

        let x = Array::from_vec([2], vec![5.0f64, 6.0])?;
        let z = ufunc.call(&[&x, &x])?.remove(0);
        assert_eq!(z.to_vec::<f64>()?, vec![10.0, 12.0]);
        Ok(())
    }

    #[test]
    fn test_resolution_order() -> Result<(), Box<dyn Error>> {
        let ufunc = UFunc::new("negate", 1, 1)
            .with_kernel(KernelEntry::unary("i32", |x: i32| x.wrapping_neg()))?
            .with_kernel(KernelEntry::unary("f64", |x: f64| -x))?;

        let entry = ufunc.resolve(&[DataType::I16], &[None], &SafeCasting)?;
        assert_eq!(&*entry.types, &[DataType::I32, DataType::I32]);

        let entry = ufunc.resolve(&[DataType::U32], &[None], &SafeCasting)?;
        assert_eq!(&*entry.types, &[DataType::F64, DataType::F64]);

        let entry = ufunc.resolve(&[DataType::I16], &[Some(DataType::I64)], &SafeCasting)?;
        assert_eq!(&*entry.types, &[DataType::I32, DataType::I32]);
        assert!(matches!(
            ufunc.resolve(&[DataType::I16], &[Some(DataType::I8)], &SafeCasting),
            Err(LoopError::TypeResolution { .. })
        ));
        assert!(ufunc.resolve(&[DataType::F64], &[Some(DataType::I8)], &UnsafeCasting).is_ok());

        assert!(matches!(
            ufunc.resolve(&[DataType::Object], &[None], &SafeCasting),
            Err(LoopError::TypeResolution { .. })
        ));
        assert!(matches!(
            ufunc.resolve(&[DataType::F64, DataType::F64], &[None], &SafeCasting),
            Err(LoopError::Arity { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_user_kernel_appended() -> Result<(), Box<dyn Error>> {
        let mut registry = Registry::new();
        registry.register(
            "scale",
            1,
            1,
            [KernelEntry::unary("double", |x: f64| x * 2.0)],
            Identity::None,
            None,
        )?;
        registry.register_kernel("scale", KernelEntry::unary("triple", |x: f64| x * 3.0))?;
        registry.register_kernel("scale", KernelEntry::unary("f32", |x: f32| x * 4.0))?;
        assert!(matches!(
            registry.register_kernel("missing", KernelEntry::unary("f32", |x: f32| x)),
            Err(RegisterError::NotFound(_))
        ));

        let scale = registry.get("scale").ok_or("scale is registered")?;
        assert_eq!(scale.kernels().len(), 3);

        let x = Array::from_vec([1], vec![1.0f64])?;
        let z = scale.call(&[&x])?.remove(0);
        assert_eq!(z.to_vec::<f64>()?, vec![2.0]);

        let x = Array::from_vec([1], vec![1.0f32])?;
        let z = scale.call(&[&x])?.remove(0);
        assert_eq!(z.to_vec::<f64>()?, vec![2.0]);

        let z = scale.call_exact(&[DataType::F32; 2], &[&x], Settings::default())?.remove(0);
        assert_eq!(z.to_vec::<f32>()?, vec![4.0]);
        Ok(())
    }

    #[test]
    fn test_registration_checks() -> Result<(), Box<dyn Error>> {
        let mut ufunc = UFunc::new("binary", 2, 1);
        assert!(matches!(
            ufunc.register_kernel(KernelEntry::unary("unary", |x: f64| x)),
            Err(RegisterError::Types { expected: 3, found: 2, .. })
        ));
        assert!(UFunc::new("bad", 2, 1).with_core_signature("(i)->()").is_err());

        let scalar = UFunc::new("scalar", 2, 1).with_core_signature("(),()->()")?;
        assert!(scalar.core_signature().is_none());

        let ufunc = UFunc::new("sum", 2, 1)
            .with_identity(Identity::Value(Value::Int(0)))
            .with_doc("Adds arguments element-wise.");
        assert_eq!(ufunc.doc(), "Adds arguments element-wise.");
        assert_eq!(ufunc.identity(), Identity::Value(Value::Int(0)));

        let x = Array::zeros(DataType::F64, [2]);
        assert!(matches!(ufunc.call(&[&x, &x]), Err(LoopError::TypeResolution { .. })));
        Ok(())
    }

    #[test]
    fn test_object_entry_skipped() -> Result<(), Box<dyn Error>> {
        let first = KernelEntry::callback(
            "object_double",
            1,
            [DataType::Object; 2],
            |values: &[Value], out: &mut [Value]| {
                out[0] = values[0];
                Ok(())
            },
        )?;
        let ufunc = UFunc::new("double", 1, 1)
            .with_kernel(first)?
            .with_kernel(KernelEntry::unary("f64", |x: f64| 2.0 * x))?;

        let entry = ufunc.resolve(&[DataType::F32], &[None], &SafeCasting)?;
        assert_eq!(&*entry.types, &[DataType::F64, DataType::F64]);

        let x = Array::from_vec([3], vec![1.0f32, 2.0, 3.0])?;
        let z = ufunc.call(&[&x])?.remove(0);
        assert_eq!(z.to_vec::<f64>()?, vec![2.0, 4.0, 6.0]);
        Ok(())
    }
}
