//! Blob shapes, outermost axis first.

use crate::layout::Layout;

/// Logical dimensions of a blob, e.g. `[n, c, h, w]` for activations or
/// `[oc, ic / g, kh, kw]` for filters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Panics if `dims` is empty, ensuring every blob has at least one axis.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(!dims.is_empty(), "shape must have at least one dimension");
        Shape { dims }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Extent of a legacy 4-D axis, 1 when the shape has fewer axes.
    fn legacy_axis(&self, axis: usize) -> usize {
        self.dims.get(axis).copied().unwrap_or(1)
    }

    pub fn num(&self) -> usize {
        self.legacy_axis(0)
    }

    pub fn channels(&self) -> usize {
        self.legacy_axis(1)
    }

    pub fn height(&self) -> usize {
        self.legacy_axis(2)
    }

    pub fn width(&self) -> usize {
        self.legacy_axis(3)
    }

    /// `[n, c, h, w]`, padding missing trailing axes with 1.
    pub fn dims4(&self) -> [usize; 4] {
        [self.num(), self.channels(), self.height(), self.width()]
    }

    /// Row-major layout of this shape in fastest-first notation.
    pub fn canonical_layout(&self) -> Layout {
        let sizes: Vec<usize> = self.dims.iter().rev().copied().collect();
        Layout::packed(&sizes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_layout_reverses_axes() {
        let shape = Shape::new([2, 3, 4, 5]);
        let layout = shape.canonical_layout();
        assert_eq!(layout.sizes(), &[5, 4, 3, 2]);
        assert_eq!(layout.memory_size(), shape.num_elements());
    }

    #[test]
    fn legacy_axes_default_to_one() {
        let bias = Shape::new([16]);
        assert_eq!(bias.dims4(), [16, 1, 1, 1]);
    }
}
