use derive_more::{Deref, DerefMut, Display, From, Into};
use itertools::Itertools;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("shapes {0} and {1} cannot be broadcast together")]
    Broadcast(Shape, Shape),
    #[error("layout rank error: shape {0} has {1} strides")]
    Rank(Shape, usize),
    #[error("axis {0} is out of bounds for rank {1}")]
    Axis(isize, usize),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Deref, DerefMut, From, Into, Display)]
#[display("({})", _0.iter().format(", "))]
pub struct Shape(Vec<usize>);

impl<const N: usize> From<[usize; N]> for Shape {
    #[inline]
    fn from(value: [usize; N]) -> Self {
        Self(value.to_vec())
    }
}

impl From<&[usize]> for Shape {
    #[inline]
    fn from(value: &[usize]) -> Self {
        Self(value.to_vec())
    }
}

impl FromIterator<usize> for Shape {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Shape {
    /// Number of elements covered by the shape.
    #[inline]
    pub fn size(&self) -> usize {
        self.iter().product()
    }

    /// Broadcasts shapes against each other.
    ///
    /// Shapes are aligned on their trailing axes and padded with leading `1`s.
    /// For each axis, sizes must either agree or be `1`.
    pub fn broadcast<'a>(shapes: impl IntoIterator<Item = &'a Shape>) -> Result<Shape, LayoutError> {
        let mut output = Shape::default();
        for shape in shapes {
            let len = output.len().max(shape.len());
            let lhs = output.pad_to(len);
            let rhs = shape.pad_to(len);
            let mut broadcast = Vec::with_capacity(len);
            for (&x, &y) in lhs.iter().zip_eq(rhs.iter()) {
                match (x, y) {
                    (x, y) if x == y => broadcast.push(x),
                    (1, y) => broadcast.push(y),
                    (x, 1) => broadcast.push(x),
                    _ => return Err(LayoutError::Broadcast(output, shape.clone())),
                }
            }
            output = Shape(broadcast);
        }
        Ok(output)
    }

    /// Prepends axes of size `1` until the shape has `len` axes.
    pub fn pad_to(&self, len: usize) -> Shape {
        let pad = len.saturating_sub(self.len());
        std::iter::repeat_n(1, pad).chain(self.iter().copied()).collect()
    }

    /// Resolves a possibly negative axis against the rank of this shape.
    pub fn axis(&self, axis: isize) -> Result<usize, LayoutError> {
        let len = self.len() as isize;
        match axis {
            axis if (0..len).contains(&axis) => Ok(axis as usize),
            axis if (-len..0).contains(&axis) => Ok((axis + len) as usize),
            axis => Err(LayoutError::Axis(axis, self.len())),
        }
    }
}

/// Shape paired with per-axis strides in **bytes**.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Display)]
#[display("{shape}:({})", strides.iter().format(", "))]
pub struct Layout {
    shape: Shape,
    strides: Vec<isize>,
}

impl Layout {
    pub fn new(shape: impl Into<Shape>, strides: impl Into<Vec<isize>>) -> Result<Self, LayoutError> {
        let shape = shape.into();
        let strides = strides.into();
        if shape.len() != strides.len() {
            return Err(LayoutError::Rank(shape, strides.len()));
        }
        Ok(Self { shape, strides })
    }

    /// Creates a row-major contiguous layout for elements of `size` bytes.
    pub fn contiguous(shape: impl Into<Shape>, size: usize) -> Self {
        let shape = shape.into();
        let mut strides = vec![0isize; shape.len()];
        let mut stride = size as isize;
        for (s, &n) in strides.iter_mut().zip(shape.iter()).rev() {
            *s = stride;
            stride *= n.max(1) as isize;
        }
        Self { shape, strides }
    }

    #[inline]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    #[inline]
    pub fn strides(&self) -> &[isize] {
        &self.strides
    }

    /// Number of axes.
    #[inline]
    pub fn len(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }

    /// Number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    #[inline]
    pub fn shape_of(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    #[inline]
    pub fn stride_of(&self, axis: usize) -> isize {
        self.strides[axis]
    }

    /// Returns `true` if elements of `size` bytes are laid out row-major without gaps.
    pub fn is_contiguous(&self, size: usize) -> bool {
        let expected = Self::contiguous(self.shape.clone(), size);
        self.shape
            .iter()
            .zip_eq(self.strides.iter().zip_eq(expected.strides.iter()))
            .all(|(&n, (x, y))| n <= 1 || x == y)
    }

    /// Returns the lowest and highest byte offsets reachable from the first element.
    /// `None` if the layout covers no element.
    pub fn extent(&self) -> Option<(isize, isize)> {
        if self.size() == 0 {
            return None;
        }
        let (mut lo, mut hi) = (0, 0);
        for (&n, &s) in self.shape.iter().zip_eq(self.strides.iter()) {
            let span = s * (n as isize - 1);
            match span < 0 {
                true => lo += span,
                false => hi += span,
            }
        }
        Some((lo, hi))
    }

    /// Removes an axis.
    pub fn remove_axis(&self, axis: usize) -> Self {
        let mut layout = self.clone();
        layout.shape.remove(axis);
        layout.strides.remove(axis);
        layout
    }

    /// Replaces the size of an axis, keeping its stride.
    pub fn with_axis_size(&self, axis: usize, size: usize) -> Self {
        let mut layout = self.clone();
        layout.shape[axis] = size;
        layout
    }

    /// Appends `count` axes of size `1`.
    pub fn expand(&self, count: usize) -> Self {
        let mut layout = self.clone();
        layout.shape.extend(std::iter::repeat_n(1, count));
        layout.strides.extend(std::iter::repeat_n(0, count));
        layout
    }

    /// Splits the layout into leading (loop) axes and the trailing `count` (core) axes.
    pub fn split_core(&self, count: usize) -> (Layout, Layout) {
        let at = self.len() - count;
        let outer = Layout {
            shape: Shape::from(&self.shape[..at]),
            strides: self.strides[..at].to_vec(),
        };
        let inner = Layout {
            shape: Shape::from(&self.shape[at..]),
            strides: self.strides[at..].to_vec(),
        };
        (outer, inner)
    }

    /// Strides this layout takes when viewed with the broadcast `shape`.
    /// Axes that are missing or of size `1` get stride `0`.
    pub fn broadcast_strides(&self, shape: &Shape) -> Result<Vec<isize>, LayoutError> {
        if self.len() > shape.len() {
            return Err(LayoutError::Broadcast(self.shape.clone(), shape.clone()));
        }
        let pad = shape.len() - self.len();
        let mut strides = vec![0; shape.len()];
        for (axis, (&n, &s)) in self.shape.iter().zip_eq(self.strides.iter()).enumerate() {
            match (n, shape[pad + axis]) {
                (n, m) if n == m && n != 1 => strides[pad + axis] = s,
                (1, _) => {}
                _ => return Err(LayoutError::Broadcast(self.shape.clone(), shape.clone())),
            }
        }
        Ok(strides)
    }
}

/// Merges adjacent axes that are contiguous for every operand and drops axes of size `1`.
///
/// `strides` holds one stride list per operand, each as long as `shape`.
pub fn coalesce(shape: &mut Vec<usize>, strides: &mut [Vec<isize>]) {
    if shape.contains(&0) {
        return;
    }

    let keep = shape.iter().map(|&n| n != 1).collect_vec();
    let mut iter = keep.iter();
    shape.retain(|_| *iter.next().unwrap_or(&true));
    for strides in strides.iter_mut() {
        let mut iter = keep.iter();
        strides.retain(|_| *iter.next().unwrap_or(&true));
    }

    let mut axis = shape.len();
    while axis > 1 {
        axis -= 1;
        let (outer, inner) = (axis - 1, axis);
        let mergeable = strides
            .iter()
            .all(|s| s[outer] == s[inner] * shape[inner] as isize);
        if mergeable {
            shape[outer] *= shape[inner];
            shape.remove(inner);
            for s in strides.iter_mut() {
                s[outer] = s[inner];
                s.remove(inner);
            }
        }
    }
}

/// Walks every index of a shape in row-major order, tracking the byte offset of each operand.
#[derive(Debug, Clone)]
pub struct Walker {
    shape: Vec<usize>,
    strides: Vec<Vec<isize>>,
    index: Vec<usize>,
    offsets: Vec<isize>,
    started: bool,
    done: bool,
}

impl Walker {
    pub fn new(shape: &[usize], strides: Vec<Vec<isize>>) -> Self {
        let done = shape.contains(&0);
        let offsets = vec![0; strides.len()];
        Self {
            shape: shape.to_vec(),
            strides,
            index: vec![0; shape.len()],
            offsets,
            started: false,
            done,
        }
    }

    /// Total number of positions visited.
    #[inline]
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advances to the next index and returns the per-operand byte offsets there.
    pub fn next_offsets(&mut self) -> Option<&[isize]> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(&self.offsets);
        }
        for axis in (0..self.shape.len()).rev() {
            self.index[axis] += 1;
            for (offset, strides) in self.offsets.iter_mut().zip(self.strides.iter()) {
                *offset += strides[axis];
            }
            if self.index[axis] < self.shape[axis] {
                return Some(&self.offsets);
            }
            let n = self.index[axis] as isize;
            for (offset, strides) in self.offsets.iter_mut().zip(self.strides.iter()) {
                *offset -= strides[axis] * n;
            }
            self.index[axis] = 0;
        }
        self.done = true;
        None
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{Layout, Shape, Walker, coalesce};

    #[test]
    fn test_broadcast() -> Result<(), Box<dyn Error>> {
        let a = Shape::from([4, 1, 3]);
        let b = Shape::from([5, 1]);
        assert_eq!(Shape::broadcast([&a, &b])?, Shape::from([4, 5, 3]));

        let a = Shape::from([4, 3]);
        let b = Shape::from([5, 3]);
        assert!(Shape::broadcast([&a, &b]).is_err());

        let scalar = Shape::default();
        assert_eq!(Shape::broadcast([&scalar, &a])?, a);
        Ok(())
    }

    #[test]
    fn test_broadcast_strides() -> Result<(), Box<dyn Error>> {
        let layout = Layout::contiguous([5, 1], 8);
        let strides = layout.broadcast_strides(&Shape::from([4, 5, 3]))?;
        assert_eq!(strides, vec![0, 8, 0]);
        Ok(())
    }

    #[test]
    fn test_coalesce() {
        let layout = Layout::contiguous([2, 3, 4], 4);
        let mut shape = layout.shape().to_vec();
        let mut strides = vec![layout.strides().to_vec(), vec![0, 0, 0]];
        coalesce(&mut shape, &mut strides);
        assert_eq!(shape, vec![24]);
        assert_eq!(strides, vec![vec![4], vec![0]]);

        let mut shape = vec![2, 1, 3];
        let mut strides = vec![vec![48, 0, 8]];
        coalesce(&mut shape, &mut strides);
        assert_eq!(shape, vec![2, 3]);
        assert_eq!(strides, vec![vec![48, 8]]);
    }

    #[test]
    fn test_walker() {
        let mut walker = Walker::new(&[2, 3], vec![vec![30, 10], vec![1, 0]]);
        let mut visited = vec![];
        while let Some(offsets) = walker.next_offsets() {
            visited.push(offsets.to_vec());
        }
        assert_eq!(
            visited,
            vec![
                vec![0, 0],
                vec![10, 0],
                vec![20, 0],
                vec![30, 1],
                vec![40, 1],
                vec![50, 1]
            ]
        );

        let mut walker = Walker::new(&[], vec![vec![]]);
        assert!(walker.next_offsets().is_some());
        assert!(walker.next_offsets().is_none());

        let mut walker = Walker::new(&[3, 0], vec![vec![8, 8]]);
        assert!(walker.next_offsets().is_none());
    }

    #[test]
    fn test_extent() {
        let layout = Layout::new([3usize, 2], [-16isize, 8]).expect("valid");
        assert_eq!(layout.extent(), Some((-32, 8)));
        assert_eq!(Layout::contiguous([0, 4], 8).extent(), None);
    }
}
