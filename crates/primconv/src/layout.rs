//! Memory layout descriptions.
//!
//! Sizes are listed fastest-varying first, so a canonical NCHW activation is
//! described as `{w, h, c, n}` with strides `{1, w, w*h, w*h*c}`. A layout is a
//! plain value: two layouts are interchangeable exactly when they compare equal,
//! which is all the convolution core ever asks of a library-chosen layout besides
//! its memory footprint.

use std::fmt;

use smallvec::SmallVec;

pub type Dims = SmallVec<[usize; 5]>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LayoutKind {
    /// Explicit element strides, one per dimension.
    Strided { strides: Dims },
    /// Dimension `axis` split into an innermost block of `block` elements; the
    /// remaining dimensions are packed around it in order. Partial blocks are padded.
    Blocked { axis: usize, block: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Layout {
    sizes: Dims,
    kind: LayoutKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutConversionError {
    SizeMismatch { from: Dims, to: Dims },
    SourceTooSmall { required: usize, actual: usize },
    DestinationTooSmall { required: usize, actual: usize },
}

impl fmt::Display for LayoutConversionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutConversionError::SizeMismatch { from, to } => {
                write!(f, "logical sizes differ: {from:?} vs {to:?}")
            }
            LayoutConversionError::SourceTooSmall { required, actual } => {
                write!(f, "source holds {actual} elements, layout needs {required}")
            }
            LayoutConversionError::DestinationTooSmall { required, actual } => {
                write!(f, "destination holds {actual} elements, layout needs {required}")
            }
        }
    }
}

impl std::error::Error for LayoutConversionError {}

/// Dense strides for `sizes`, fastest dimension first.
pub fn packed_strides(sizes: &[usize]) -> Dims {
    let mut strides = Dims::with_capacity(sizes.len());
    let mut acc = 1usize;
    for &size in sizes {
        strides.push(acc);
        acc *= size;
    }
    strides
}

impl Layout {
    pub fn strided(sizes: &[usize], strides: &[usize]) -> Self {
        assert_eq!(
            sizes.len(),
            strides.len(),
            "layout rank mismatch: {} sizes vs {} strides",
            sizes.len(),
            strides.len()
        );
        Layout {
            sizes: Dims::from_slice(sizes),
            kind: LayoutKind::Strided {
                strides: Dims::from_slice(strides),
            },
        }
    }

    /// Dense layout with fastest-first packed strides.
    pub fn packed(sizes: &[usize]) -> Self {
        let strides = packed_strides(sizes);
        Layout::strided(sizes, &strides)
    }

    pub fn blocked(sizes: &[usize], axis: usize, block: usize) -> Self {
        assert!(axis < sizes.len(), "block axis {axis} out of range");
        assert!(block > 0, "block size must be positive");
        if block == 1 {
            return Layout::packed(sizes);
        }
        Layout {
            sizes: Dims::from_slice(sizes),
            kind: LayoutKind::Blocked { axis, block },
        }
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn kind(&self) -> &LayoutKind {
        &self.kind
    }

    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    /// Number of logical elements.
    pub fn element_count(&self) -> usize {
        self.sizes.iter().product()
    }

    /// Number of `f32` slots a buffer in this layout occupies, padding included.
    pub fn memory_size(&self) -> usize {
        if self.sizes.iter().any(|&s| s == 0) {
            return 0;
        }
        match &self.kind {
            LayoutKind::Strided { strides } => {
                1 + self
                    .sizes
                    .iter()
                    .zip(strides.iter())
                    .map(|(&size, &stride)| (size - 1) * stride)
                    .sum::<usize>()
            }
            LayoutKind::Blocked { axis, block } => self
                .sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| if i == *axis { size.div_ceil(*block) } else { size })
                .product::<usize>()
                .saturating_mul(*block),
        }
    }

    /// Whether the layout covers its memory without holes.
    pub fn is_dense(&self) -> bool {
        self.memory_size() == self.element_count()
    }

    pub fn offset(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.sizes.len());
        match &self.kind {
            LayoutKind::Strided { strides } => coords
                .iter()
                .zip(strides.iter())
                .map(|(&c, &s)| c * s)
                .sum(),
            LayoutKind::Blocked { axis, block } => {
                let mut offset = 0usize;
                let mut scale = *block;
                for (i, (&c, &size)) in coords.iter().zip(self.sizes.iter()).enumerate() {
                    let (c, size) = if i == *axis {
                        (c / block, size.div_ceil(*block))
                    } else {
                        (c, size)
                    };
                    offset += c * scale;
                    scale *= size;
                }
                offset + coords[*axis] % block
            }
        }
    }

    /// Offsets of every logical element, visited fastest dimension first.
    pub fn offsets(&self) -> Offsets<'_> {
        Offsets {
            layout: self,
            coords: Dims::from_elem(0, self.sizes.len()),
            done: self.sizes.iter().any(|&s| s == 0),
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes = self
            .sizes
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("x");
        match &self.kind {
            LayoutKind::Strided { strides } => write!(f, "strided[{sizes}; {strides:?}]"),
            LayoutKind::Blocked { axis, block } => {
                write!(f, "blocked[{sizes}; axis {axis} by {block}]")
            }
        }
    }
}

pub struct Offsets<'a> {
    layout: &'a Layout,
    coords: Dims,
    done: bool,
}

impl Iterator for Offsets<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.done {
            return None;
        }
        let offset = self.layout.offset(&self.coords);
        let sizes = self.layout.sizes();
        let mut axis = 0;
        loop {
            if axis == sizes.len() {
                self.done = true;
                break;
            }
            self.coords[axis] += 1;
            if self.coords[axis] < sizes[axis] {
                break;
            }
            self.coords[axis] = 0;
            axis += 1;
        }
        Some(offset)
    }
}

/// Copies every logical element of `src` (laid out as `from`) into `dst` (laid out
/// as `to`). Padding slots of `to` are zeroed.
pub fn convert(
    from: &Layout,
    src: &[f32],
    to: &Layout,
    dst: &mut [f32],
) -> Result<(), LayoutConversionError> {
    if from.sizes() != to.sizes() {
        return Err(LayoutConversionError::SizeMismatch {
            from: from.sizes.clone(),
            to: to.sizes.clone(),
        });
    }
    let required_src = from.memory_size();
    if src.len() < required_src {
        return Err(LayoutConversionError::SourceTooSmall {
            required: required_src,
            actual: src.len(),
        });
    }
    let required_dst = to.memory_size();
    if dst.len() < required_dst {
        return Err(LayoutConversionError::DestinationTooSmall {
            required: required_dst,
            actual: dst.len(),
        });
    }
    if from == to {
        dst[..required_dst].copy_from_slice(&src[..required_dst]);
        return Ok(());
    }
    if !to.is_dense() {
        dst[..required_dst].fill(0.0);
    }
    for (s, d) in from.offsets().zip(to.offsets()) {
        dst[d] = src[s];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_layout_matches_nchw_offsets() {
        let (w, h, c, n) = (5, 4, 3, 2);
        let layout = Layout::packed(&[w, h, c, n]);
        assert_eq!(layout.memory_size(), w * h * c * n);
        assert_eq!(layout.offset(&[2, 1, 2, 1]), ((c + 2) * h + 1) * w + 2);
    }

    #[test]
    fn blocked_layout_pads_partial_blocks() {
        let layout = Layout::blocked(&[3, 3, 5, 2], 2, 8);
        assert_eq!(layout.element_count(), 90);
        assert_eq!(layout.memory_size(), 3 * 3 * 8 * 2);
        assert!(!layout.is_dense());
        // channel index 4 of image 1 at (x=1, y=2); one channel block per image
        assert_eq!(layout.offset(&[1, 2, 4, 1]), 4 + 8 * (1 + 3 * (2 + 3)));
    }

    #[test]
    fn offsets_visit_every_slot_once_for_dense_layouts() {
        let layout = Layout::blocked(&[2, 3, 16, 2], 2, 8);
        let mut seen = vec![false; layout.memory_size()];
        for offset in layout.offsets() {
            assert!(!seen[offset], "offset {offset} visited twice");
            seen[offset] = true;
        }
        assert!(seen.into_iter().all(|v| v));
    }

    #[test]
    fn convert_round_trip_is_bit_identical() {
        let sizes = [4, 3, 5, 2];
        let canonical = Layout::packed(&sizes);
        let private = Layout::blocked(&sizes, 2, 4);
        let src: Vec<f32> = (0..canonical.memory_size())
            .map(|i| (i as f32).sin() * 1.0e3 + 0.1)
            .collect();
        let mut prv = vec![f32::NAN; private.memory_size()];
        convert(&canonical, &src, &private, &mut prv).unwrap();
        assert!(prv.iter().all(|v| !v.is_nan()), "padding must be zero-filled");
        let mut back = vec![0.0; canonical.memory_size()];
        convert(&private, &prv, &canonical, &mut back).unwrap();
        assert!(src
            .iter()
            .zip(back.iter())
            .all(|(a, b)| a.to_bits() == b.to_bits()));
    }

    #[test]
    fn convert_rejects_mismatched_sizes() {
        let a = Layout::packed(&[2, 2]);
        let b = Layout::packed(&[2, 3]);
        let err = convert(&a, &[0.0; 4], &b, &mut [0.0; 6]).unwrap_err();
        assert!(matches!(err, LayoutConversionError::SizeMismatch { .. }));
    }
}
