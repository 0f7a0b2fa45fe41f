use bytemuck::{Pod, Zeroable};
use derive_more::{Deref, Display, From, Into};
use half::f16;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    #[display("bool")]
    Bool,
    #[display("i8")]
    I8,
    #[display("u8")]
    U8,
    #[display("i16")]
    I16,
    #[display("u16")]
    U16,
    #[display("i32")]
    I32,
    #[display("u32")]
    U32,
    #[display("i64")]
    I64,
    #[display("u64")]
    U64,
    #[display("f16")]
    F16,
    #[display("f32")]
    F32,
    #[display("f64")]
    F64,
    /// A boxed element: an opaque handle into a host object table.
    #[display("object")]
    Object,
}

/// Broad family of a [`DataType`], used by casting rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Kind {
    Bool,
    Signed,
    Unsigned,
    Float,
    Object,
}

impl DataType {
    pub const ALL: [DataType; 13] = [
        DataType::Bool,
        DataType::I8,
        DataType::U8,
        DataType::I16,
        DataType::U16,
        DataType::I32,
        DataType::U32,
        DataType::I64,
        DataType::U64,
        DataType::F16,
        DataType::F32,
        DataType::F64,
        DataType::Object,
    ];

    /// Returns the size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::Bool | DataType::I8 | DataType::U8 => 1,
            DataType::I16 | DataType::U16 | DataType::F16 => 2,
            DataType::I32 | DataType::U32 | DataType::F32 => 4,
            DataType::I64 | DataType::U64 | DataType::F64 | DataType::Object => 8,
        }
    }

    /// Returns the natural alignment of one element in bytes.
    #[inline]
    pub const fn align(self) -> usize {
        self.size()
    }

    pub const fn kind(self) -> Kind {
        match self {
            DataType::Bool => Kind::Bool,
            DataType::I8 | DataType::I16 | DataType::I32 | DataType::I64 => Kind::Signed,
            DataType::U8 | DataType::U16 | DataType::U32 | DataType::U64 => Kind::Unsigned,
            DataType::F16 | DataType::F32 | DataType::F64 => Kind::Float,
            DataType::Object => Kind::Object,
        }
    }

    /// Returns `true` if elements of this type are references that need host runtime services.
    #[inline]
    pub const fn is_object(self) -> bool {
        matches!(self, DataType::Object)
    }

    /// Returns a function that decodes one native-order element into a [`Value`].
    pub fn reader(self) -> fn(&[u8]) -> Value {
        match self {
            DataType::Bool => read::<Bool>,
            DataType::I8 => read::<i8>,
            DataType::U8 => read::<u8>,
            DataType::I16 => read::<i16>,
            DataType::U16 => read::<u16>,
            DataType::I32 => read::<i32>,
            DataType::U32 => read::<u32>,
            DataType::I64 => read::<i64>,
            DataType::U64 => read::<u64>,
            DataType::F16 => read::<f16>,
            DataType::F32 => read::<f32>,
            DataType::F64 => read::<f64>,
            DataType::Object => read::<Handle>,
        }
    }

    /// Returns a function that encodes a [`Value`] as one native-order element.
    pub fn writer(self) -> fn(Value, &mut [u8]) {
        match self {
            DataType::Bool => write::<Bool>,
            DataType::I8 => write::<i8>,
            DataType::U8 => write::<u8>,
            DataType::I16 => write::<i16>,
            DataType::U16 => write::<u16>,
            DataType::I32 => write::<i32>,
            DataType::U32 => write::<u32>,
            DataType::I64 => write::<i64>,
            DataType::U64 => write::<u64>,
            DataType::F16 => write::<f16>,
            DataType::F32 => write::<f32>,
            DataType::F64 => write::<f64>,
            DataType::Object => write::<Handle>,
        }
    }
}

/// Argument types of one call, printed as `(f32, f32, f64)`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, From, Into, Display)]
#[display("({})", _0.iter().format(", "))]
pub struct TypeList(pub Vec<DataType>);

impl FromIterator<DataType> for TypeList {
    fn from_iter<I: IntoIterator<Item = DataType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn read<T: Element>(bytes: &[u8]) -> Value {
    bytemuck::pod_read_unaligned::<T>(&bytes[..size_of::<T>()]).into_value()
}

fn write<T: Element>(value: Value, bytes: &mut [u8]) {
    let value = T::from_value(value);
    bytes[..size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
}

/// A type-erased element, the common ground every cast goes through.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    #[display("object({_0})")]
    Object(u64),
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Storage of a [`DataType::Bool`] element.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, From, Into)]
#[repr(transparent)]
pub struct Bool(pub u8);

/// Storage of a [`DataType::Object`] element: a handle the host runtime resolves.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, From, Into)]
#[repr(transparent)]
pub struct Handle(pub u64);

macro_rules! impl_bytemuck {
    ($ty:ty) => {
        unsafe impl ::bytemuck::Zeroable for $ty {}
        unsafe impl ::bytemuck::Pod for $ty {}
    };
}

impl_bytemuck!(Bool);
impl_bytemuck!(Handle);

impl From<bool> for Bool {
    fn from(value: bool) -> Self {
        Self(value as u8)
    }
}

impl From<Bool> for bool {
    fn from(value: Bool) -> Self {
        value.0 != 0
    }
}

pub trait Element: Sized + Zeroable + Pod + Send + Sync + sealed::Sealed {
    const DATA_TYPE: DataType;

    fn into_value(self) -> Value;
    fn from_value(value: Value) -> Self;
}

macro_rules! impl_element_int {
    ($ty:ty, $data_type:ident, $variant:ident, $repr:ty) => {
        impl Element for $ty {
            const DATA_TYPE: DataType = DataType::$data_type;

            #[inline]
            fn into_value(self) -> Value {
                Value::$variant(self as $repr)
            }

            #[inline]
            fn from_value(value: Value) -> Self {
                match value {
                    Value::Bool(x) => x as u8 as Self,
                    Value::Int(x) => x as Self,
                    Value::UInt(x) | Value::Object(x) => x as Self,
                    Value::Float(x) => x as Self,
                }
            }
        }
    };
}

impl_element_int!(i8, I8, Int, i64);
impl_element_int!(i16, I16, Int, i64);
impl_element_int!(i32, I32, Int, i64);
impl_element_int!(i64, I64, Int, i64);
impl_element_int!(u8, U8, UInt, u64);
impl_element_int!(u16, U16, UInt, u64);
impl_element_int!(u32, U32, UInt, u64);
impl_element_int!(u64, U64, UInt, u64);

macro_rules! impl_element_float {
    ($ty:ty, $data_type:ident) => {
        impl Element for $ty {
            const DATA_TYPE: DataType = DataType::$data_type;

            #[inline]
            fn into_value(self) -> Value {
                Value::Float(self as f64)
            }

            #[inline]
            fn from_value(value: Value) -> Self {
                match value {
                    Value::Bool(x) => x as u8 as Self,
                    Value::Int(x) => x as Self,
                    Value::UInt(x) | Value::Object(x) => x as Self,
                    Value::Float(x) => x as Self,
                }
            }
        }
    };
}

impl_element_float!(f32, F32);
impl_element_float!(f64, F64);

impl Element for f16 {
    const DATA_TYPE: DataType = DataType::F16;

    #[inline]
    fn into_value(self) -> Value {
        Value::Float(self.to_f64())
    }

    #[inline]
    fn from_value(value: Value) -> Self {
        f16::from_f64(f64::from_value(value))
    }
}

impl Element for Bool {
    const DATA_TYPE: DataType = DataType::Bool;

    #[inline]
    fn into_value(self) -> Value {
        Value::Bool(self.into())
    }

    #[inline]
    fn from_value(value: Value) -> Self {
        let value = match value {
            Value::Bool(x) => x,
            Value::Int(x) => x != 0,
            Value::UInt(x) | Value::Object(x) => x != 0,
            Value::Float(x) => x != 0.0,
        };
        value.into()
    }
}

impl Element for Handle {
    const DATA_TYPE: DataType = DataType::Object;

    #[inline]
    fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    #[inline]
    fn from_value(value: Value) -> Self {
        Self(u64::from_value(value))
    }
}

mod sealed {
    use half::f16;

    use super::{Bool, Handle};

    pub trait Sealed {}

    impl Sealed for Bool {}
    impl Sealed for i8 {}
    impl Sealed for u8 {}
    impl Sealed for i16 {}
    impl Sealed for u16 {}
    impl Sealed for i32 {}
    impl Sealed for u32 {}
    impl Sealed for i64 {}
    impl Sealed for u64 {}
    impl Sealed for f16 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for Handle {}
}

#[cfg(test)]
mod tests {
    use half::f16;

    use super::{Bool, DataType, Element, Value};

    #[test]
    fn test_value_bridge() {
        let bytes = 300i32.to_ne_bytes();
        let value = DataType::I32.reader()(&bytes);
        assert_eq!(value, Value::Int(300));

        let mut out = [0u8; 2];
        DataType::F16.writer()(value, &mut out);
        assert_eq!(f16::from_ne_bytes(out), f16::from_f32(300.0));

        assert_eq!(u8::from_value(Value::Float(3.7)), 3);
        assert_eq!(bool::from(Bool::from_value(Value::Float(0.5))), true);
        assert_eq!(i8::from_value(Value::Bool(true)), 1);
    }

    #[test]
    fn test_sizes() {
        for r#type in DataType::ALL {
            let mut bytes = vec![0u8; r#type.size()];
            r#type.writer()(Value::Int(1), &mut bytes);
            assert_ne!(r#type.reader()(&bytes), Value::Int(0));
        }
    }
}
