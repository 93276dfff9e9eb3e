//! Direct convolution kernels over canonical NCHW buffers.
//!
//! These loops are the numeric ground truth: the reference executor runs them on
//! blob data directly, and primitive libraries without a faster path run them on
//! canonical scratch copies. Filters are `[out_channels][in_channels / groups][kh][kw]`.

use crate::error::{ConvError, ConvResult};

/// Fully resolved 2-D convolution geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_channels: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub pad_h: usize,
    pub pad_w: usize,
    pub groups: usize,
}

impl ConvGeometry {
    pub fn in_per_group(&self) -> usize {
        self.in_channels / self.groups
    }

    pub fn out_per_group(&self) -> usize {
        self.out_channels / self.groups
    }

    pub fn src_len(&self) -> usize {
        self.batch * self.in_channels * self.in_h * self.in_w
    }

    pub fn dst_len(&self) -> usize {
        self.batch * self.out_channels * self.out_h * self.out_w
    }

    pub fn filter_len(&self) -> usize {
        self.out_channels * self.in_per_group() * self.kernel_h * self.kernel_w
    }

    /// Multiply-adds of one forward pass, counted as two flops each.
    pub fn forward_flops(&self) -> u64 {
        2 * (self.dst_len() * self.in_per_group() * self.kernel_h * self.kernel_w) as u64
    }

    /// Input row read by output row `out` at kernel row `k`, `None` inside padding.
    #[inline]
    pub fn input_row(&self, out: usize, k: usize) -> Option<usize> {
        input_coord(out, k, self.stride_h, self.pad_h, self.in_h)
    }

    #[inline]
    pub fn input_col(&self, out: usize, k: usize) -> Option<usize> {
        input_coord(out, k, self.stride_w, self.pad_w, self.in_w)
    }
}

#[inline]
fn input_coord(out: usize, k: usize, stride: usize, pad: usize, limit: usize) -> Option<usize> {
    let pos = out * stride + k;
    if pos < pad {
        return None;
    }
    let pos = pos - pad;
    (pos < limit).then_some(pos)
}

/// `(input + 2 * pad - kernel) / stride + 1`, rejecting windows that do not fit.
pub fn conv_out_dim(input: usize, kernel: usize, stride: usize, pad: usize) -> ConvResult<usize> {
    if kernel == 0 {
        return Err(ConvError::invalid_config("kernel size must be > 0"));
    }
    if stride == 0 {
        return Err(ConvError::invalid_config("stride must be > 0"));
    }
    let padded = pad
        .checked_mul(2)
        .and_then(|p| p.checked_add(input))
        .ok_or_else(|| ConvError::invalid_config("padded dimension overflow"))?;
    if padded < kernel {
        return Err(ConvError::invalid_config(format!(
            "kernel ({kernel}) exceeds padded input ({padded})"
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

pub fn forward(
    g: &ConvGeometry,
    src: &[f32],
    filter: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
) {
    debug_assert!(src.len() >= g.src_len());
    debug_assert!(filter.len() >= g.filter_len());
    debug_assert!(dst.len() >= g.dst_len());
    let icg = g.in_per_group();
    let ocg = g.out_per_group();
    for n in 0..g.batch {
        for o in 0..g.out_channels {
            let group = o / ocg;
            let init = bias.map_or(0.0, |b| b[o]);
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let mut acc = init;
                    for ci in 0..icg {
                        let c = group * icg + ci;
                        let w_base = (o * icg + ci) * g.kernel_h;
                        for ky in 0..g.kernel_h {
                            let Some(iy) = g.input_row(oy, ky) else {
                                continue;
                            };
                            let s_row = ((n * g.in_channels + c) * g.in_h + iy) * g.in_w;
                            let w_row = (w_base + ky) * g.kernel_w;
                            for kx in 0..g.kernel_w {
                                if let Some(ix) = g.input_col(ox, kx) {
                                    acc += src[s_row + ix] * filter[w_row + kx];
                                }
                            }
                        }
                    }
                    dst[((n * g.out_channels + o) * g.out_h + oy) * g.out_w + ox] = acc;
                }
            }
        }
    }
}

pub fn backward_data(g: &ConvGeometry, diff_dst: &[f32], filter: &[f32], diff_src: &mut [f32]) {
    let icg = g.in_per_group();
    let ocg = g.out_per_group();
    diff_src[..g.src_len()].fill(0.0);
    for n in 0..g.batch {
        for o in 0..g.out_channels {
            let group = o / ocg;
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let d = diff_dst[((n * g.out_channels + o) * g.out_h + oy) * g.out_w + ox];
                    for ci in 0..icg {
                        let c = group * icg + ci;
                        for ky in 0..g.kernel_h {
                            let Some(iy) = g.input_row(oy, ky) else {
                                continue;
                            };
                            let s_row = ((n * g.in_channels + c) * g.in_h + iy) * g.in_w;
                            let w_row = ((o * icg + ci) * g.kernel_h + ky) * g.kernel_w;
                            for kx in 0..g.kernel_w {
                                if let Some(ix) = g.input_col(ox, kx) {
                                    diff_src[s_row + ix] += d * filter[w_row + kx];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

pub fn backward_filter(g: &ConvGeometry, src: &[f32], diff_dst: &[f32], diff_filter: &mut [f32]) {
    let icg = g.in_per_group();
    let ocg = g.out_per_group();
    diff_filter[..g.filter_len()].fill(0.0);
    for n in 0..g.batch {
        for o in 0..g.out_channels {
            let group = o / ocg;
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let d = diff_dst[((n * g.out_channels + o) * g.out_h + oy) * g.out_w + ox];
                    for ci in 0..icg {
                        let c = group * icg + ci;
                        for ky in 0..g.kernel_h {
                            let Some(iy) = g.input_row(oy, ky) else {
                                continue;
                            };
                            let s_row = ((n * g.in_channels + c) * g.in_h + iy) * g.in_w;
                            let w_row = ((o * icg + ci) * g.kernel_h + ky) * g.kernel_w;
                            for kx in 0..g.kernel_w {
                                if let Some(ix) = g.input_col(ox, kx) {
                                    diff_filter[w_row + kx] += d * src[s_row + ix];
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

pub fn backward_bias(g: &ConvGeometry, diff_dst: &[f32], diff_bias: &mut [f32]) {
    let plane = g.out_h * g.out_w;
    for (o, slot) in diff_bias.iter_mut().take(g.out_channels).enumerate() {
        let mut acc = 0.0f32;
        for n in 0..g.batch {
            let base = (n * g.out_channels + o) * plane;
            acc += diff_dst[base..base + plane].iter().sum::<f32>();
        }
        *slot = acc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(kernel: usize, stride: usize, pad: usize, in_hw: usize) -> ConvGeometry {
        let out = conv_out_dim(in_hw, kernel, stride, pad).unwrap();
        ConvGeometry {
            batch: 1,
            in_channels: 1,
            in_h: in_hw,
            in_w: in_hw,
            out_channels: 1,
            out_h: out,
            out_w: out,
            kernel_h: kernel,
            kernel_w: kernel,
            stride_h: stride,
            stride_w: stride,
            pad_h: pad,
            pad_w: pad,
            groups: 1,
        }
    }

    #[test]
    fn out_dim_follows_standard_formula() {
        for input in 1..12 {
            for kernel in 1..=5 {
                for stride in 1..=3 {
                    for pad in 0..=2 {
                        let result = conv_out_dim(input, kernel, stride, pad);
                        if input + 2 * pad < kernel {
                            assert!(result.is_err());
                        } else {
                            assert_eq!(result.unwrap(), (input + 2 * pad - kernel) / stride + 1);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn out_dim_rejects_zero_stride() {
        assert!(matches!(
            conv_out_dim(4, 3, 0, 0),
            Err(ConvError::InvalidConfig(_))
        ));
    }

    #[test]
    fn forward_with_padding_sums_visible_window() {
        let g = geometry(3, 1, 1, 3);
        let src: Vec<f32> = (1..=9).map(|v| v as f32).collect();
        let filter = vec![1.0; 9];
        let mut dst = vec![0.0; g.dst_len()];
        forward(&g, &src, &filter, Some(&[0.5]), &mut dst);
        // corner sees 1,2,4,5; centre sees everything
        assert_eq!(dst[0], 12.5);
        assert_eq!(dst[4], 45.5);
    }

    #[test]
    fn backward_data_is_transpose_of_forward() {
        let g = geometry(2, 2, 0, 4);
        let filter = [1.0, 2.0, 3.0, 4.0];
        let diff_dst = vec![1.0; g.dst_len()];
        let mut diff_src = vec![f32::NAN; g.src_len()];
        backward_data(&g, &diff_dst, &filter, &mut diff_src);
        // non-overlapping 2x2 windows tile the input, so each pixel sees one tap
        assert_eq!(&diff_src[..4], &[1.0, 2.0, 1.0, 2.0]);
        assert_eq!(&diff_src[4..8], &[3.0, 4.0, 3.0, 4.0]);
    }

    #[test]
    fn backward_bias_sums_over_batch_and_space() {
        let mut g = geometry(1, 1, 0, 2);
        g.batch = 2;
        let diff_dst = vec![0.25; g.dst_len()];
        let mut diff_bias = [0.0];
        backward_bias(&g, &diff_dst, &mut diff_bias);
        assert_eq!(diff_bias[0], 2.0);
    }
}
