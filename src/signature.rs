use std::{fmt, str::FromStr};

use chumsky::prelude::*;
use itertools::Itertools;
use thiserror::Error;

use crate::layout::Shape;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("core signature {0:?}: {2} at position {1}")]
    Parse(String, usize, String),
    #[error("core signature {0} has {1} inputs and {2} outputs, expected {3} and {4}")]
    Arity(CoreSignature, usize, usize, usize, usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("argument {arg} has {found} dimensions, core signature needs at least {expected}")]
    Rank {
        arg: usize,
        expected: usize,
        found: usize,
    },
    #[error("core dimension {name} is {expected} in one argument and {found} in argument {arg}")]
    Mismatch {
        name: String,
        arg: usize,
        expected: usize,
        found: usize,
    },
    #[error("core dimension {0} of an output is not determined by any argument")]
    Unresolved(String),
}

/// Per-argument named core dimensions of a generalized function, e.g. `(m,n),(n,p)->(m,p)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CoreSignature {
    /// Distinct dimension names in order of first appearance.
    names: Vec<String>,
    /// Indices into `names`, per argument.
    args: Vec<Vec<usize>>,
    nin: usize,
}

impl CoreSignature {
    #[inline]
    pub fn nin(&self) -> usize {
        self.nin
    }

    #[inline]
    pub fn nout(&self) -> usize {
        self.args.len() - self.nin
    }

    #[inline]
    pub fn nargs(&self) -> usize {
        self.args.len()
    }

    #[inline]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Dimension indices of argument `arg`.
    #[inline]
    pub fn dims(&self, arg: usize) -> &[usize] {
        &self.args[arg]
    }

    /// Number of core axes of argument `arg`.
    #[inline]
    pub fn num_dims(&self, arg: usize) -> usize {
        self.args[arg].len()
    }

    /// Returns `true` if no argument has a core axis.
    pub fn is_scalar(&self) -> bool {
        self.args.iter().all(|dims| dims.is_empty())
    }

    /// Checks the arity against a function's declared `nin` and `nout`.
    pub fn check_arity(&self, nin: usize, nout: usize) -> Result<(), SignatureError> {
        match self.nin == nin && self.nout() == nout {
            true => Ok(()),
            false => Err(SignatureError::Arity(self.clone(), self.nin, self.nout(), nin, nout)),
        }
    }

    /// Binds every dimension name to a size.
    ///
    /// `shapes` holds one entry per argument; outputs that are not supplied are `None`.
    /// Core axes are the trailing axes of each shape. A name shared by several arguments must
    /// have the same size in all of them, and every output name must be bound by some argument.
    pub fn resolve(&self, shapes: &[Option<&Shape>]) -> Result<Vec<usize>, CoreError> {
        let mut sizes: Vec<Option<usize>> = vec![None; self.names.len()];
        for (arg, (dims, shape)) in self.args.iter().zip_eq(shapes).enumerate() {
            let Some(shape) = shape else {
                continue;
            };
            if shape.len() < dims.len() {
                return Err(CoreError::Rank {
                    arg,
                    expected: dims.len(),
                    found: shape.len(),
                });
            }
            let core = &shape[shape.len() - dims.len()..];
            for (&dim, &found) in dims.iter().zip_eq(core) {
                match sizes[dim] {
                    None => sizes[dim] = Some(found),
                    Some(expected) if expected == found => {}
                    Some(expected) => {
                        return Err(CoreError::Mismatch {
                            name: self.names[dim].clone(),
                            arg,
                            expected,
                            found,
                        });
                    }
                }
            }
        }
        sizes
            .into_iter()
            .zip_eq(&self.names)
            .map(|(size, name)| size.ok_or_else(|| CoreError::Unresolved(name.clone())))
            .collect()
    }

    /// Core shape of argument `arg` once the dimensions are resolved.
    pub fn core_shape(&self, arg: usize, sizes: &[usize]) -> Shape {
        self.args[arg].iter().map(|&dim| sizes[dim]).collect()
    }
}

impl fmt::Display for CoreSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arg = |dims: &Vec<usize>| format!("({})", dims.iter().map(|&d| &self.names[d]).join(","));
        let (inputs, outputs) = self.args.split_at(self.nin);
        write!(
            f,
            "{}->{}",
            inputs.iter().map(arg).join(","),
            outputs.iter().map(arg).join(",")
        )
    }
}

type Extra<'src> = extra::Err<Rich<'src, char>>;

/// `name`: an identifier, not starting with a digit.
fn name<'src>() -> impl Parser<'src, &'src str, &'src str, Extra<'src>> + Clone {
    text::ascii::ident().padded()
}

/// `(name,name,...)`, possibly empty.
fn tuple<'src>() -> impl Parser<'src, &'src str, Vec<&'src str>, Extra<'src>> + Clone {
    name()
        .separated_by(just(','))
        .collect::<Vec<_>>()
        .delimited_by(just('(').padded(), just(')').padded())
}

/// `tuple(,tuple)*`
fn list<'src>() -> impl Parser<'src, &'src str, Vec<Vec<&'src str>>, Extra<'src>> + Clone {
    tuple().separated_by(just(',').padded()).at_least(1).collect::<Vec<_>>()
}

/// `list->list`
#[allow(clippy::type_complexity)]
fn signature<'src>()
-> impl Parser<'src, &'src str, (Vec<Vec<&'src str>>, Vec<Vec<&'src str>>), Extra<'src>> {
    list()
        .then_ignore(just("->").padded())
        .then(list())
        .then_ignore(end())
}

impl FromStr for CoreSignature {
    type Err = SignatureError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let (inputs, outputs) = signature().parse(text).into_result().map_err(|errors| {
            let (pos, message) = match errors.first() {
                Some(error) => (error.span().start, error.to_string()),
                None => (0, "invalid core signature".to_string()),
            };
            SignatureError::Parse(text.to_string(), pos, message)
        })?;

        let nin = inputs.len();
        let mut names: Vec<String> = vec![];
        let args = inputs
            .into_iter()
            .chain(outputs)
            .map(|tuple| {
                tuple
                    .into_iter()
                    .map(|name| match names.iter().position(|x| x == name) {
                        Some(index) => index,
                        None => {
                            names.push(name.to_string());
                            names.len() - 1
                        }
                    })
                    .collect_vec()
            })
            .collect_vec();
        Ok(Self { names, args, nin })
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{CoreError, CoreSignature, SignatureError};
    use crate::layout::Shape;

    #[test]
    fn test_parse() -> Result<(), Box<dyn Error>> {
        let signature: CoreSignature = "(m, n),(n,p) -> (m,p)".parse()?;
        assert_eq!(signature.nin(), 2);
        assert_eq!(signature.nout(), 1);
        assert_eq!(signature.names(), &["m", "n", "p"]);
        assert_eq!(signature.dims(1), &[1, 2]);
        assert_eq!(signature.dims(2), &[0, 2]);
        assert_eq!(signature.to_string(), "(m,n),(n,p)->(m,p)");

        let signature: CoreSignature = "(i),(i)->()".parse()?;
        assert_eq!(signature.num_dims(2), 0);
        assert!(!signature.is_scalar());
        assert!(signature.check_arity(2, 1).is_ok());
        assert!(signature.check_arity(1, 1).is_err());

        let signature: CoreSignature = " ( ) , (k) -> ( ) ".parse()?;
        assert_eq!(signature.to_string(), "(),(k)->()");

        assert!("(i),(i)".parse::<CoreSignature>().is_err());
        assert!("(i,)->()".parse::<CoreSignature>().is_err());
        assert!("(1i)->()".parse::<CoreSignature>().is_err());
        assert!("(i)->() x".parse::<CoreSignature>().is_err());
        assert!(matches!(
            "(i)->() x".parse::<CoreSignature>(),
            Err(SignatureError::Parse(_, 8, _))
        ));
        assert!(matches!(
            "(m,n)->(m,".parse::<CoreSignature>(),
            Err(SignatureError::Parse(_, 10, _))
        ));
        Ok(())
    }

    #[test]
    fn test_resolve() -> Result<(), Box<dyn Error>> {
        let signature: CoreSignature = "(m,n),(n,p)->(m,p)".parse()?;
        let a = Shape::from([7, 2, 3]);
        let b = Shape::from([3, 4]);
        let sizes = signature.resolve(&[Some(&a), Some(&b), None])?;
        assert_eq!(sizes, vec![2, 3, 4]);
        assert_eq!(signature.core_shape(2, &sizes), Shape::from([2, 4]));

        let c = Shape::from([5, 4]);
        assert!(matches!(
            signature.resolve(&[Some(&a), Some(&c), None]),
            Err(CoreError::Mismatch { arg: 1, expected: 3, found: 5, .. })
        ));

        let d = Shape::from([3]);
        assert!(matches!(
            signature.resolve(&[Some(&a), Some(&d), None]),
            Err(CoreError::Rank { arg: 1, .. })
        ));

        let signature: CoreSignature = "(i)->(i,k)".parse()?;
        assert!(matches!(
            signature.resolve(&[Some(&d), None]),
            Err(CoreError::Unresolved(name)) if name == "k"
        ));
        Ok(())
    }
}
