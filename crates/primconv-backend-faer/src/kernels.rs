//! im2col + GEMM convolution kernels over canonical NCHW buffers.
//!
//! Each (image, group) pair lowers to one matrix product. faer prefers column-major
//! outputs, so every product is computed transposed into a column-major view whose
//! buffer is the row-major result.

use std::cell::RefCell;

use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::{Accum, Par};
use primconv::ops::ConvGeometry;

thread_local! {
    static IM2COL_SCRATCH: RefCell<Vec<f32>> = const { RefCell::new(Vec::new()) };
}

fn faer_parallelism() -> Par {
    let par = faer::get_global_parallelism();
    if par.degree() == 1 {
        Par::Seq
    } else {
        par
    }
}

fn with_scratch<R>(len: usize, f: impl FnOnce(&mut [f32]) -> R) -> R {
    IM2COL_SCRATCH.with(|cell| {
        let mut scratch = cell.borrow_mut();
        if scratch.len() < len {
            scratch.resize(len, 0.0);
        }
        f(&mut scratch[..len])
    })
}

/// Rows of the column matrix: one per (input channel in group, ky, kx).
fn col_rows(g: &ConvGeometry) -> usize {
    g.in_per_group() * g.kernel_h * g.kernel_w
}

fn plane(g: &ConvGeometry) -> usize {
    g.out_h * g.out_w
}

/// Unfolds the `group` channels of image `n` into a `K x P` row-major matrix.
fn im2col(g: &ConvGeometry, src: &[f32], n: usize, group: usize, col: &mut [f32]) {
    let icg = g.in_per_group();
    let p_len = plane(g);
    for ci in 0..icg {
        let c = group * icg + ci;
        let channel = &src[(n * g.in_channels + c) * g.in_h * g.in_w..][..g.in_h * g.in_w];
        for ky in 0..g.kernel_h {
            for kx in 0..g.kernel_w {
                let row = (ci * g.kernel_h + ky) * g.kernel_w + kx;
                let out = &mut col[row * p_len..][..p_len];
                for oy in 0..g.out_h {
                    let iy = g.input_row(oy, ky);
                    for ox in 0..g.out_w {
                        out[oy * g.out_w + ox] = match (iy, g.input_col(ox, kx)) {
                            (Some(iy), Some(ix)) => channel[iy * g.in_w + ix],
                            _ => 0.0,
                        };
                    }
                }
            }
        }
    }
}

/// Folds a `K x P` column gradient back into image `n`, accumulating overlaps.
fn col2im(g: &ConvGeometry, col: &[f32], n: usize, group: usize, diff_src: &mut [f32]) {
    let icg = g.in_per_group();
    let p_len = plane(g);
    for ci in 0..icg {
        let c = group * icg + ci;
        let channel =
            &mut diff_src[(n * g.in_channels + c) * g.in_h * g.in_w..][..g.in_h * g.in_w];
        for ky in 0..g.kernel_h {
            for kx in 0..g.kernel_w {
                let row = (ci * g.kernel_h + ky) * g.kernel_w + kx;
                let values = &col[row * p_len..][..p_len];
                for oy in 0..g.out_h {
                    let Some(iy) = g.input_row(oy, ky) else {
                        continue;
                    };
                    for ox in 0..g.out_w {
                        if let Some(ix) = g.input_col(ox, kx) {
                            channel[iy * g.in_w + ix] += values[oy * g.out_w + ox];
                        }
                    }
                }
            }
        }
    }
}

pub fn forward(
    g: &ConvGeometry,
    src: &[f32],
    filter: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
) {
    let k = col_rows(g);
    let p_len = plane(g);
    let ocg = g.out_per_group();
    let par = faer_parallelism();
    with_scratch(k * p_len, |col| {
        for n in 0..g.batch {
            for group in 0..g.groups {
                im2col(g, src, n, group, col);
                let weights = &filter[group * ocg * k..][..ocg * k];
                let out_offset = (n * g.out_channels + group * ocg) * p_len;
                let out = &mut dst[out_offset..][..ocg * p_len];

                let col_t = MatRef::from_row_major_slice(col, k, p_len).transpose();
                let weights_t = MatRef::from_row_major_slice(weights, ocg, k).transpose();
                let mut out_view = MatMut::from_column_major_slice_mut(out, p_len, ocg);
                matmul(&mut out_view, Accum::Replace, col_t, weights_t, 1.0f32, par);
            }
        }
    });
    if let Some(bias) = bias {
        for (index, values) in dst[..g.dst_len()].chunks_mut(p_len).enumerate() {
            let b = bias[index % g.out_channels];
            for v in values {
                *v += b;
            }
        }
    }
}

pub fn backward_data(g: &ConvGeometry, diff_dst: &[f32], filter: &[f32], diff_src: &mut [f32]) {
    let k = col_rows(g);
    let p_len = plane(g);
    let ocg = g.out_per_group();
    let par = faer_parallelism();
    diff_src[..g.src_len()].fill(0.0);
    with_scratch(k * p_len, |col| {
        for n in 0..g.batch {
            for group in 0..g.groups {
                let weights = &filter[group * ocg * k..][..ocg * k];
                let dy_offset = (n * g.out_channels + group * ocg) * p_len;
                let dy = &diff_dst[dy_offset..][..ocg * p_len];

                let dy_t = MatRef::from_row_major_slice(dy, ocg, p_len).transpose();
                let weights_view = MatRef::from_row_major_slice(weights, ocg, k);
                let mut col_view = MatMut::from_column_major_slice_mut(&mut *col, p_len, k);
                matmul(&mut col_view, Accum::Replace, dy_t, weights_view, 1.0f32, par);
                col2im(g, col, n, group, diff_src);
            }
        }
    });
}

pub fn backward_filter(g: &ConvGeometry, src: &[f32], diff_dst: &[f32], diff_filter: &mut [f32]) {
    let k = col_rows(g);
    let p_len = plane(g);
    let ocg = g.out_per_group();
    let par = faer_parallelism();
    if g.batch == 0 {
        diff_filter[..g.filter_len()].fill(0.0);
        return;
    }
    with_scratch(k * p_len, |col| {
        for n in 0..g.batch {
            let accum = if n == 0 { Accum::Replace } else { Accum::Add };
            for group in 0..g.groups {
                im2col(g, src, n, group, col);
                let dy_offset = (n * g.out_channels + group * ocg) * p_len;
                let dy = &diff_dst[dy_offset..][..ocg * p_len];
                let dw = &mut diff_filter[group * ocg * k..][..ocg * k];

                let col_view = MatRef::from_row_major_slice(col, k, p_len);
                let dy_t = MatRef::from_row_major_slice(dy, ocg, p_len).transpose();
                let mut dw_view = MatMut::from_column_major_slice_mut(dw, k, ocg);
                matmul(&mut dw_view, accum, col_view, dy_t, 1.0f32, par);
            }
        }
    });
}

pub fn backward_bias(g: &ConvGeometry, diff_dst: &[f32], diff_bias: &mut [f32]) {
    let p_len = plane(g);
    diff_bias[..g.out_channels].fill(0.0);
    for (index, values) in diff_dst[..g.dst_len()].chunks(p_len).enumerate() {
        diff_bias[index % g.out_channels] += values.iter().sum::<f32>();
    }
}

#[cfg(test)]
mod tests {
    use primconv::ops::conv;

    use super::*;

    fn geometry(groups: usize, stride: usize, pad: usize) -> ConvGeometry {
        ConvGeometry {
            batch: 2,
            in_channels: 4,
            in_h: 5,
            in_w: 6,
            out_channels: 6,
            out_h: (5 + 2 * pad - 3) / stride + 1,
            out_w: (6 + 2 * pad - 3) / stride + 1,
            kernel_h: 3,
            kernel_w: 3,
            stride_h: stride,
            stride_w: stride,
            pad_h: pad,
            pad_w: pad,
            groups,
        }
    }

    fn ramp(len: usize, scale: f32) -> Vec<f32> {
        (0..len).map(|i| ((i * 7 % 13) as f32 - 6.0) * scale).collect()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() <= 1e-4 * y.abs().max(1.0), "index {i}: {x} vs {y}");
        }
    }

    #[test]
    fn kernels_match_direct_loops() {
        for (groups, stride, pad) in [(1, 1, 1), (2, 2, 0), (2, 1, 2)] {
            let g = geometry(groups, stride, pad);
            let src = ramp(g.src_len(), 0.1);
            let filter = ramp(g.filter_len(), 0.05);
            let bias = ramp(g.out_channels, 0.3);
            let dy = ramp(g.dst_len(), 0.2);

            let mut expected = vec![0.0; g.dst_len()];
            let mut actual = vec![0.0; g.dst_len()];
            conv::forward(&g, &src, &filter, Some(&bias), &mut expected);
            forward(&g, &src, &filter, Some(&bias), &mut actual);
            assert_close(&actual, &expected);

            let mut expected = vec![0.0; g.src_len()];
            let mut actual = vec![1.0; g.src_len()];
            conv::backward_data(&g, &dy, &filter, &mut expected);
            backward_data(&g, &dy, &filter, &mut actual);
            assert_close(&actual, &expected);

            let mut expected = vec![0.0; g.filter_len()];
            let mut actual = vec![1.0; g.filter_len()];
            conv::backward_filter(&g, &src, &dy, &mut expected);
            backward_filter(&g, &src, &dy, &mut actual);
            assert_close(&actual, &expected);

            let mut expected = vec![0.0; g.out_channels];
            let mut actual = vec![1.0; g.out_channels];
            conv::backward_bias(&g, &dy, &mut expected);
            backward_bias(&g, &dy, &mut actual);
            assert_close(&actual, &expected);
        }
    }
}
