use rand::Rng;

use crate::error::{ConvError, ConvResult, Dims4};
use crate::ops::{conv_out_dim, ConvGeometry};
use crate::tensor::{Blob, Shape};

use super::params::ConvolutionParams;

/// Engine-independent convolution bookkeeping: parameters, learnable blobs and
/// the shape last seen by `reshape`.
#[derive(Debug)]
pub struct ConvolutionBase {
    params: ConvolutionParams,
    channels: usize,
    weight: Blob,
    bias: Option<Blob>,
    param_propagate_down: [bool; 2],
    input: Option<[usize; 4]>,
}

impl ConvolutionBase {
    /// Allocates and fills the filter `[oc, c / g, kh, kw]` and bias `[oc]` blobs for
    /// inputs of `bottom`'s channel count.
    pub fn new(params: ConvolutionParams, bottom: &Shape, rng: &mut impl Rng) -> ConvResult<Self> {
        params.validate()?;
        if bottom.rank() != 4 {
            return Err(ConvError::invalid_config(format!(
                "{}: expected a 4-D input, got {:?}",
                params.name,
                bottom.dims()
            )));
        }
        let channels = bottom.channels();
        if channels % params.group != 0 {
            return Err(ConvError::invalid_config(format!(
                "{}: input channels ({channels}) must be divisible by group ({})",
                params.name, params.group
            )));
        }
        let [kh, kw] = params.kernel;
        let per_group = channels / params.group;
        let mut weight = Blob::zeros(Shape::new([params.num_output, per_group, kh, kw]));
        let fan_in = per_group * kh * kw;
        params
            .weight_filler
            .fill(weight.mutable_canonical_data()?, fan_in, rng);
        let bias = if params.bias_term {
            let mut bias = Blob::zeros(Shape::new([params.num_output]));
            params
                .bias_filler
                .fill(bias.mutable_canonical_data()?, fan_in, rng);
            Some(bias)
        } else {
            None
        };
        Ok(ConvolutionBase {
            params,
            channels,
            weight,
            bias,
            param_propagate_down: [true, true],
            input: None,
        })
    }

    pub fn params(&self) -> &ConvolutionParams {
        &self.params
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn num_output(&self) -> usize {
        self.params.num_output
    }

    pub fn groups(&self) -> usize {
        self.params.group
    }

    pub fn bias_term(&self) -> bool {
        self.params.bias_term
    }

    pub fn weight(&self) -> &Blob {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut Blob {
        &mut self.weight
    }

    pub fn bias(&self) -> Option<&Blob> {
        self.bias.as_ref()
    }

    pub fn bias_mut(&mut self) -> Option<&mut Blob> {
        self.bias.as_mut()
    }

    /// Both learnable blobs, borrowed together.
    pub fn blobs_mut(&mut self) -> (&mut Blob, Option<&mut Blob>) {
        (&mut self.weight, self.bias.as_mut())
    }

    /// Whether the gradient of parameter `index` (0 = weight, 1 = bias) is wanted.
    pub fn param_propagate_down(&self, index: usize) -> bool {
        self.param_propagate_down.get(index).copied().unwrap_or(false)
    }

    pub fn set_param_propagate_down(&mut self, index: usize, value: bool) {
        if let Some(slot) = self.param_propagate_down.get_mut(index) {
            *slot = value;
        }
    }

    /// `[n, oc, oh, ow]` produced by an input of shape `bottom`.
    pub fn compute_output_shape(&self, bottom: &Shape) -> ConvResult<Shape> {
        let [n, c, h, w] = bottom.dims4();
        if bottom.rank() != 4 || c != self.channels {
            return Err(ConvError::ShapeMismatch {
                tensor: "bottom",
                expected: Dims4([n, self.channels, h, w]),
                actual: Dims4(bottom.dims4()),
            });
        }
        let [kh, kw] = self.params.kernel;
        let [sh, sw] = self.params.stride;
        let [ph, pw] = self.params.pad;
        let oh = conv_out_dim(h, kh, sh, ph)?;
        let ow = conv_out_dim(w, kw, sw, pw)?;
        Ok(Shape::new([n, self.params.num_output, oh, ow]))
    }

    /// Records the input shape and resizes `top` to the matching output shape.
    pub fn reshape(&mut self, bottom: &Shape, top: &mut Blob) -> ConvResult<()> {
        let output = self.compute_output_shape(bottom)?;
        self.input = Some(bottom.dims4());
        if top.shape() != &output {
            top.reshape(output);
        }
        Ok(())
    }

    /// `[n, c, h, w]` of the last reshape.
    pub fn input_dims(&self) -> Option<[usize; 4]> {
        self.input
    }

    pub fn geometry(&self) -> ConvResult<ConvGeometry> {
        let [n, c, h, w] = self.input.ok_or(ConvError::NotInitialized)?;
        let [kh, kw] = self.params.kernel;
        let [sh, sw] = self.params.stride;
        let [ph, pw] = self.params.pad;
        Ok(ConvGeometry {
            batch: n,
            in_channels: c,
            in_h: h,
            in_w: w,
            out_channels: self.params.num_output,
            out_h: conv_out_dim(h, kh, sh, ph)?,
            out_w: conv_out_dim(w, kw, sw, pw)?,
            kernel_h: kh,
            kernel_w: kw,
            stride_h: sh,
            stride_w: sw,
            pad_h: ph,
            pad_w: pw,
            groups: self.params.group,
        })
    }

    /// Fails unless `bottom` and `top` have exactly the shapes of the last reshape.
    pub fn check_shapes(&self, bottom: &Shape, top: &Shape) -> ConvResult<()> {
        let g = self.geometry()?;
        let expected_bottom = [g.batch, g.in_channels, g.in_h, g.in_w];
        if bottom.rank() != 4 || bottom.dims4() != expected_bottom {
            return Err(ConvError::ShapeMismatch {
                tensor: "bottom",
                expected: Dims4(expected_bottom),
                actual: Dims4(bottom.dims4()),
            });
        }
        let expected_top = [g.batch, g.out_channels, g.out_h, g.out_w];
        if top.rank() != 4 || top.dims4() != expected_top {
            return Err(ConvError::ShapeMismatch {
                tensor: "top",
                expected: Dims4(expected_top),
                actual: Dims4(top.dims4()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn base(params: ConvolutionParams, bottom: [usize; 4]) -> ConvolutionBase {
        ConvolutionBase::new(params, &Shape::new(bottom), &mut StdRng::seed_from_u64(0)).unwrap()
    }

    #[test]
    fn weight_shape_is_grouped() {
        let b = base(ConvolutionParams::new("c", 8, 3).with_group(2), [1, 4, 5, 5]);
        assert_eq!(b.weight().shape().dims(), &[8, 2, 3, 3]);
        assert_eq!(b.bias().unwrap().shape().dims(), &[8]);
    }

    #[test]
    fn output_shape_uses_stride_and_padding() {
        let b = base(
            ConvolutionParams::new("c", 4, 3).with_stride(2, 1).with_pad(1, 0),
            [2, 3, 7, 6],
        );
        let out = b.compute_output_shape(&Shape::new([2, 3, 7, 6])).unwrap();
        assert_eq!(out.dims(), &[2, 4, 4, 4]);
    }

    #[test]
    fn channel_change_is_rejected() {
        let mut b = base(ConvolutionParams::new("c", 4, 1), [1, 3, 2, 2]);
        let mut top = Blob::zeros(Shape::new([1]));
        let err = b.reshape(&Shape::new([1, 5, 2, 2]), &mut top).unwrap_err();
        assert!(matches!(err, ConvError::ShapeMismatch { tensor: "bottom", .. }));
    }

    #[test]
    fn indivisible_channels_fail_setup() {
        let err = ConvolutionBase::new(
            ConvolutionParams::new("c", 4, 1).with_group(2),
            &Shape::new([1, 3, 2, 2]),
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap_err();
        assert!(matches!(err, ConvError::InvalidConfig(_)));
    }
}
