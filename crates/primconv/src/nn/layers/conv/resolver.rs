//! Derives library-facing size and stride vectors from the layer configuration.
//!
//! All vectors are fastest-varying first: `{w, h, c, n}` for activations and
//! `{kw, kh, ic/g, oc/g', g'}` for filters, where `g'` is the group count when the
//! library accepts a grouped filter dimension and 1 otherwise.

use smallvec::smallvec;

use crate::error::ConvResult;
use crate::layout::{Dims, Layout};
use crate::library::{BiasGradDesc, BorderMode, Capabilities, ConvolutionDesc};
use crate::ops::ConvGeometry;

use super::base::ConvolutionBase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConvolution {
    pub geometry: ConvGeometry,
    pub bias: bool,
    /// Groups carried by the filter's fifth dimension (1 when folded into `oc`).
    pub filter_groups: usize,
    pub bottom_sizes: [usize; 4],
    pub bottom_strides: [usize; 4],
    pub filter_sizes: Dims,
    pub filter_strides: Dims,
    pub bias_sizes: [usize; 1],
    pub bias_strides: [usize; 1],
    pub top_sizes: [usize; 4],
    pub top_strides: [usize; 4],
    pub conv_strides: [usize; 2],
    pub input_offset: [isize; 2],
}

impl ResolvedConvolution {
    /// Resolves against the shape recorded by the last `ConvolutionBase::reshape`.
    pub fn resolve(base: &ConvolutionBase, capabilities: Capabilities) -> ConvResult<Self> {
        let g = base.geometry()?;
        let (iw, ih, ic, n) = (g.in_w, g.in_h, g.in_channels, g.batch);
        let (ow, oh, oc) = (g.out_w, g.out_h, g.out_channels);
        let (kw, kh) = (g.kernel_w, g.kernel_h);
        let icg = g.in_per_group();

        let filter_groups = if capabilities.grouped_filter_layout {
            g.groups
        } else {
            1
        };
        let filter_rank = 4 + usize::from(filter_groups != 1);
        let ocg = oc / filter_groups;
        let mut filter_sizes: Dims = smallvec![kw, kh, icg, ocg, filter_groups];
        let mut filter_strides: Dims =
            smallvec![1, kw, kw * kh, kw * kh * icg, kw * kh * icg * ocg];
        filter_sizes.truncate(filter_rank);
        filter_strides.truncate(filter_rank);

        Ok(ResolvedConvolution {
            geometry: g,
            bias: base.bias_term(),
            filter_groups,
            bottom_sizes: [iw, ih, ic, n],
            bottom_strides: [1, iw, iw * ih, iw * ih * ic],
            filter_sizes,
            filter_strides,
            bias_sizes: [oc],
            bias_strides: [1],
            top_sizes: [ow, oh, oc, n],
            top_strides: [1, ow, ow * oh, ow * oh * oc],
            conv_strides: [g.stride_w, g.stride_h],
            input_offset: [-(g.pad_w as isize), -(g.pad_h as isize)],
        })
    }

    /// `(w, h, c, n)` of the input; a change in any of them forces a rebuild.
    pub fn input_key(&self) -> [usize; 4] {
        self.bottom_sizes
    }

    pub fn filter_rank(&self) -> usize {
        self.filter_sizes.len()
    }

    pub fn conv_desc(&self) -> ConvolutionDesc {
        ConvolutionDesc {
            groups: self.geometry.groups,
            dimension: 4,
            src_sizes: self.bottom_sizes,
            dst_sizes: self.top_sizes,
            filter_sizes: self.filter_sizes.clone(),
            strides: self.conv_strides,
            input_offset: self.input_offset,
            border: BorderMode::Zeros,
        }
    }

    pub fn bias_desc(&self) -> BiasGradDesc {
        BiasGradDesc {
            groups: self.geometry.groups,
            dimension: 4,
            dst_sizes: self.top_sizes,
        }
    }

    pub fn bottom_layout(&self) -> Layout {
        Layout::strided(&self.bottom_sizes, &self.bottom_strides)
    }

    pub fn top_layout(&self) -> Layout {
        Layout::strided(&self.top_sizes, &self.top_strides)
    }

    pub fn filter_layout(&self) -> Layout {
        Layout::strided(&self.filter_sizes, &self.filter_strides)
    }

    pub fn bias_layout(&self) -> Layout {
        Layout::strided(&self.bias_sizes, &self.bias_strides)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::nn::layers::conv::ConvolutionParams;
    use crate::tensor::{Blob, Shape};

    fn resolve(
        params: ConvolutionParams,
        bottom: [usize; 4],
        caps: Capabilities,
    ) -> ResolvedConvolution {
        let shape = Shape::new(bottom);
        let mut base =
            ConvolutionBase::new(params, &shape, &mut StdRng::seed_from_u64(1)).unwrap();
        let mut top = Blob::zeros(Shape::new([1]));
        base.reshape(&shape, &mut top).unwrap();
        ResolvedConvolution::resolve(&base, caps).unwrap()
    }

    #[test]
    fn grouped_filter_gets_fifth_dimension() {
        let r = resolve(
            ConvolutionParams::new("c", 8, 3).with_group(2).with_pad(1, 1),
            [2, 4, 6, 5],
            Capabilities::default(),
        );
        assert_eq!(r.bottom_sizes, [5, 6, 4, 2]);
        assert_eq!(r.bottom_strides, [1, 5, 30, 120]);
        assert_eq!(r.filter_sizes.as_slice(), &[3, 3, 2, 4, 2]);
        assert_eq!(r.filter_strides.as_slice(), &[1, 3, 9, 18, 72]);
        assert_eq!(r.top_sizes, [5, 6, 8, 2]);
        assert_eq!(r.input_offset, [-1, -1]);
        assert_eq!(r.bias_sizes, [8]);
        assert!(r.filter_layout().is_dense());
    }

    #[test]
    fn legacy_build_folds_groups_into_output_channels() {
        let r = resolve(
            ConvolutionParams::new("c", 8, 3).with_group(2),
            [1, 4, 6, 6],
            Capabilities::legacy(),
        );
        assert_eq!(r.filter_rank(), 4);
        assert_eq!(r.filter_sizes.as_slice(), &[3, 3, 2, 8]);
        assert_eq!(r.filter_groups, 1);
        assert_eq!(r.conv_desc().groups, 2);
        r.conv_desc().geometry().unwrap();
    }

    #[test]
    fn ungrouped_filter_stays_rank_four() {
        let r = resolve(
            ConvolutionParams::new("c", 4, 1),
            [1, 3, 2, 2],
            Capabilities::default(),
        );
        assert_eq!(r.filter_rank(), 4);
        assert_eq!(r.filter_layout(), Layout::packed(&[1, 1, 3, 4]));
    }

    #[test]
    fn descriptor_geometry_round_trips() {
        let r = resolve(
            ConvolutionParams::new("c", 6, 3).with_group(3).with_stride(2, 2).with_pad(1, 0),
            [2, 6, 9, 7],
            Capabilities::default(),
        );
        assert_eq!(r.conv_desc().geometry().unwrap(), r.geometry);
    }
}
