use std::fmt;

use derive_more::Display;
use thiserror::Error;

use crate::{
    layout::{Layout, LayoutError, Shape, Walker},
    num::{DataType, Element, Value},
};

#[derive(Debug, Error)]
pub enum ArrayError {
    #[error("array type error: data type {0} mismatches {1}")]
    Type(DataType, DataType),
    #[error("array creation error: shape {0}'s size not match data len {1}")]
    Create(Shape, usize),
    #[error("array bounds error: layout {0} at offset {1} exceeds {2} bytes of data")]
    Bounds(Layout, usize, usize),
    #[error(transparent)]
    Layout(#[from] LayoutError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ByteOrder {
    #[default]
    Native,
    Swapped,
}

/// Element descriptor: data type plus byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descr {
    pub r#type: DataType,
    pub order: ByteOrder,
}

impl Descr {
    #[inline]
    pub const fn native(r#type: DataType) -> Self {
        let order = ByteOrder::Native;
        Self { r#type, order }
    }

    #[inline]
    pub const fn swapped(r#type: DataType) -> Self {
        let order = ByteOrder::Swapped;
        Self { r#type, order }
    }

    #[inline]
    pub const fn is_swapped(&self) -> bool {
        matches!(self.order, ByteOrder::Swapped) && self.r#type.size() > 1
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.r#type.size()
    }
}

impl From<DataType> for Descr {
    fn from(value: DataType) -> Self {
        Self::native(value)
    }
}

impl fmt::Display for Descr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.is_swapped() {
            true => write!(f, "{}(swapped)", self.r#type),
            false => write!(f, "{}", self.r#type),
        }
    }
}

fn check_bounds(layout: &Layout, offset: usize, size: usize, len: usize) -> Result<(), ArrayError> {
    let Some((lo, hi)) = layout.extent() else {
        return Ok(());
    };
    let offset = offset as isize;
    match offset + lo >= 0 && offset + hi + size as isize <= len as isize {
        true => Ok(()),
        false => Err(ArrayError::Bounds(layout.clone(), offset as usize, len)),
    }
}

/// Reads every element of a strided region in row-major order.
fn collect<T>(
    data: &[u8],
    descr: Descr,
    layout: &Layout,
    offset: usize,
    mut f: impl FnMut(&[u8]) -> T,
) -> Vec<T> {
    let size = descr.size();
    let mut walker = Walker::new(layout.shape(), vec![layout.strides().to_vec()]);
    let mut output = Vec::with_capacity(layout.size());
    while let Some(offsets) = walker.next_offsets() {
        let start = (offset as isize + offsets[0]) as usize;
        let mut bytes = [0u8; 8];
        bytes[..size].copy_from_slice(&data[start..start + size]);
        if descr.is_swapped() {
            bytes[..size].reverse();
        }
        output.push(f(&bytes[..size]));
    }
    output
}

/// An owned, strided, n-dimensional array of bytes interpreted through a [`Descr`].
///
/// Storage is 8-byte aligned so every native element type may be addressed in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    descr: Descr,
    layout: Layout,
    offset: usize,
    data: Vec<u64>,
    len: usize,
}

impl Array {
    fn alloc(len: usize) -> Vec<u64> {
        vec![0u64; len.div_ceil(8)]
    }

    /// Create an array of zeros in native byte order.
    pub fn zeros(r#type: DataType, shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let len = shape.size() * r#type.size();
        let layout = Layout::contiguous(shape, r#type.size());
        let descr = Descr::native(r#type);
        let data = Self::alloc(len);
        Self {
            descr,
            layout,
            offset: 0,
            data,
            len,
        }
    }

    /// Create an array from elements in row-major order.
    pub fn from_vec<T: Element>(shape: impl Into<Shape>, contents: impl Into<Vec<T>>) -> Result<Self, ArrayError> {
        let shape = shape.into();
        let contents = contents.into();
        if shape.size() != contents.len() {
            return Err(ArrayError::Create(shape, contents.len()));
        }
        let mut array = Self::zeros(T::DATA_TYPE, shape);
        array.bytes_mut().copy_from_slice(bytemuck::cast_slice(&contents));
        Ok(array)
    }

    /// Create a zero-dimensional array holding one element.
    pub fn scalar<T: Element>(value: T) -> Self {
        let mut array = Self::zeros(T::DATA_TYPE, Shape::default());
        array.bytes_mut().copy_from_slice(bytemuck::bytes_of(&value));
        array
    }

    /// Create an array over raw bytes with an arbitrary layout.
    /// `offset` is the byte position of the first element.
    pub fn from_bytes(descr: Descr, layout: Layout, offset: usize, bytes: &[u8]) -> Result<Self, ArrayError> {
        check_bounds(&layout, offset, descr.size(), bytes.len())?;
        let len = bytes.len();
        let mut data = Self::alloc(len);
        bytemuck::cast_slice_mut::<u64, u8>(&mut data)[..len].copy_from_slice(bytes);
        Ok(Self {
            descr,
            layout,
            offset,
            data,
            len,
        })
    }

    #[inline]
    pub fn descr(&self) -> Descr {
        self.descr
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.descr.r#type
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.layout.len()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.data)[..self.len]
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.data)[..self.len]
    }

    #[inline]
    pub fn view(&self) -> ArrayView<'_> {
        ArrayView {
            descr: self.descr,
            layout: self.layout.clone(),
            offset: self.offset,
            data: self.bytes(),
        }
    }

    #[inline]
    pub fn view_mut(&mut self) -> ArrayViewMut<'_> {
        let descr = self.descr;
        let layout = self.layout.clone();
        let offset = self.offset;
        ArrayViewMut {
            descr,
            layout,
            offset,
            data: self.bytes_mut(),
        }
    }

    /// Reads the elements back in row-major order. Fails if `T` is not the array's type.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, ArrayError> {
        self.view().to_vec()
    }

    /// Reads the elements back as type-erased values.
    pub fn to_values(&self) -> Vec<Value> {
        self.view().to_values()
    }

    /// Returns a contiguous copy holding the same values in the opposite byte order.
    pub fn byteswapped(&self) -> Self {
        let size = self.descr.size();
        let order = match self.descr.order {
            ByteOrder::Native => ByteOrder::Swapped,
            ByteOrder::Swapped => ByteOrder::Native,
        };
        let descr = Descr {
            r#type: self.descr.r#type,
            order,
        };
        let mut output = Self::zeros(descr.r#type, self.shape().clone());
        output.descr = descr;

        let elements = collect(self.bytes(), self.descr, &self.layout, self.offset, |x| {
            let mut bytes = x.to_vec();
            if descr.is_swapped() {
                bytes.reverse();
            }
            bytes
        });
        for (chunk, bytes) in output.bytes_mut().chunks_exact_mut(size).zip(elements) {
            chunk.copy_from_slice(&bytes);
        }
        output
    }
}

/// A borrowed, read-only array.
#[derive(Debug, Clone)]
pub struct ArrayView<'a> {
    descr: Descr,
    layout: Layout,
    offset: usize,
    data: &'a [u8],
}

impl<'a> ArrayView<'a> {
    pub fn new(descr: Descr, layout: Layout, offset: usize, data: &'a [u8]) -> Result<Self, ArrayError> {
        check_bounds(&layout, offset, descr.size(), data.len())?;
        Ok(Self {
            descr,
            layout,
            offset,
            data,
        })
    }

    /// Re-views the same bytes with another layout, e.g. a transposed or reversed one.
    pub fn with_layout(self, layout: Layout, offset: usize) -> Result<Self, ArrayError> {
        Self::new(self.descr, layout, offset, self.data)
    }

    #[inline]
    pub fn descr(&self) -> Descr {
        self.descr
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Pointer to the first element.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr().wrapping_add(self.offset)
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, ArrayError> {
        if T::DATA_TYPE != self.descr.r#type {
            return Err(ArrayError::Type(T::DATA_TYPE, self.descr.r#type));
        }
        let output = collect(self.data, self.descr, &self.layout, self.offset, |x| {
            bytemuck::pod_read_unaligned(x)
        });
        Ok(output)
    }

    pub fn to_values(&self) -> Vec<Value> {
        let read = self.descr.r#type.reader();
        collect(self.data, self.descr, &self.layout, self.offset, read)
    }
}

/// A borrowed, writable array.
#[derive(Debug)]
pub struct ArrayViewMut<'a> {
    descr: Descr,
    layout: Layout,
    offset: usize,
    data: &'a mut [u8],
}

impl<'a> ArrayViewMut<'a> {
    pub fn new(descr: Descr, layout: Layout, offset: usize, data: &'a mut [u8]) -> Result<Self, ArrayError> {
        check_bounds(&layout, offset, descr.size(), data.len())?;
        Ok(Self {
            descr,
            layout,
            offset,
            data,
        })
    }

    pub fn with_layout(self, layout: Layout, offset: usize) -> Result<Self, ArrayError> {
        Self::new(self.descr, layout, offset, self.data)
    }

    #[inline]
    pub fn descr(&self) -> Descr {
        self.descr
    }

    #[inline]
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    /// Pointer to the first element.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data.as_mut_ptr().wrapping_add(self.offset)
    }

    #[inline]
    pub fn as_view(&self) -> ArrayView<'_> {
        ArrayView {
            descr: self.descr,
            layout: self.layout.clone(),
            offset: self.offset,
            data: &*self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Array, ArrayView, Descr};
    use crate::{layout::Layout, num::DataType};

    #[test]
    fn test_create() -> Result<(), Box<dyn Error>> {
        let array = Array::from_vec([2, 3], vec![0.0f32, 1.0, 2.0, 3.0, 4.0, 5.0])?;
        assert_eq!(array.data_type(), DataType::F32);
        assert_eq!(array.to_vec::<f32>()?, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(array.to_vec::<f64>().is_err());
        assert!(Array::from_vec([4], vec![1u8; 3]).is_err());
        Ok(())
    }

    #[test]
    fn test_strided_view() -> Result<(), Box<dyn Error>> {
        let array = Array::from_vec([2, 3], (0..6).collect::<Vec<i32>>())?;
        let transposed = Layout::new([3usize, 2], [4isize, 12])?;
        let view = array.view().with_layout(transposed, 0)?;
        assert_eq!(view.to_vec::<i32>()?, vec![0, 3, 1, 4, 2, 5]);

        let reversed = Layout::new([3usize], [-4isize])?;
        let view = array.view().with_layout(reversed, 8)?;
        assert_eq!(view.to_vec::<i32>()?, vec![2, 1, 0]);

        let overflow = Layout::new([7usize], [4isize])?;
        assert!(array.view().with_layout(overflow, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_byteswapped() -> Result<(), Box<dyn Error>> {
        let array = Array::from_vec([3], vec![1u32, 256, 65536])?;
        let swapped = array.byteswapped();
        assert_eq!(swapped.descr(), Descr::swapped(DataType::U32));
        assert_ne!(swapped.bytes(), array.bytes());
        assert_eq!(swapped.to_vec::<u32>()?, vec![1, 256, 65536]);
        assert_eq!(swapped.byteswapped().bytes(), array.bytes());

        let bytes = 7u16.to_be_bytes();
        let descr = match cfg!(target_endian = "little") {
            true => Descr::swapped(DataType::U16),
            false => Descr::native(DataType::U16),
        };
        let view = ArrayView::new(descr, Layout::contiguous([1], 2), 0, &bytes)?;
        assert_eq!(view.to_vec::<u16>()?, vec![7]);
        Ok(())
    }
}
