//! Segmentation: divide each layer's work into hardware-legal tiles.
//!
//! The conv family rates all candidate segment sizes with a cost model
//! (`conv`); 1x1 convolutions additionally search block size and
//! outputs-per-lane with a disk-cached brute force (`max_efficiency`).
//! The remaining layer kinds use closed-form rules.

pub mod conv;
pub mod max_efficiency;

use crate::arch::{MAX_BETA, MAX_GAMMA, MAX_X_END, MAX_Y_END, MAX_Z_END};
use crate::error::{CompilerError, Result};
use crate::graph::config::SegDim;
use crate::graph::layer::LayerKind;
use crate::graph::{LayerId, Net};
use crate::utils::ceil_div;

/// Dispatch tag decoupled from the parameter payloads, so the kind can be
/// inspected before handing the net on mutably.
enum Strategy {
    Conv2d,
    ConvTranspose,
    AvgPool,
    Conv1d,
    ElwiseLike,
    DepthToSpace,
    GlobalPool,
    DconvDeform,
    DconvConv,
    UserSupplied,
    Default,
}

/// Choose `seg` (and the channel parallelism) for one layer. Called by the
/// memory planner once the output base address is known.
pub fn set_segment_dimensions(net: &mut Net, id: LayerId) -> Result<()> {
    let strategy = match &net.layer(id).kind {
        LayerKind::Conv2d(_) | LayerKind::MaxPool2d(_) => Strategy::Conv2d,
        LayerKind::Conv2dTranspose(_) => Strategy::ConvTranspose,
        LayerKind::AvgPool2d(_) => Strategy::AvgPool,
        LayerKind::Conv1d(_) => Strategy::Conv1d,
        LayerKind::Add(_) | LayerKind::Mul(_) | LayerKind::Concatenate(_) => Strategy::ElwiseLike,
        LayerKind::DepthToSpace(_) => Strategy::DepthToSpace,
        LayerKind::GlobalAvgPool2d(_) | LayerKind::GlobalMaxPool2d(_) => Strategy::GlobalPool,
        LayerKind::DConvDeform(_) => Strategy::DconvDeform,
        LayerKind::DConvConv(_) => Strategy::DconvConv,
        LayerKind::PointPillars(_) => Strategy::UserSupplied,
        _ => Strategy::Default,
    };

    match strategy {
        Strategy::Conv2d => conv::conv2d_segment_dimensions(net, id),
        Strategy::ConvTranspose => conv::conv_transpose_segment_dimensions(net, id),
        Strategy::AvgPool => conv::avgpool_segment_dimensions(net, id),
        Strategy::Conv1d => conv1d_segment_dimensions(net, id),
        Strategy::ElwiseLike => {
            elwise_like_segment_dimensions(net, id);
            Ok(())
        }
        Strategy::DepthToSpace => {
            depth_to_space_segment_dimensions(net, id);
            Ok(())
        }
        Strategy::GlobalPool => global_pool_segment_dimensions(net, id),
        Strategy::DconvDeform => {
            dconv_deform_segment_dimensions(net, id);
            Ok(())
        }
        Strategy::DconvConv => {
            dconv_conv_segment_dimensions(net, id);
            Ok(())
        }
        // segmentation supplied by the quantisation toolkit; dynamic input
        // sizes are resolved at runtime
        Strategy::UserSupplied => Ok(()),
        Strategy::Default => {
            default_segment_dimensions(net, id);
            Ok(())
        }
    }
}

/// One segment for the whole image, output size = input size.
fn default_segment_dimensions(net: &mut Net, id: LayerId) {
    let in_dims = net.src_dims(id);
    let layer = net.layer_mut(id);
    layer.seg = SegDim {
        num_x: 1,
        num_y: 1,
        in_w: in_dims.first().map_or(0, |d| d.x),
        in_h: in_dims.first().map_or(0, |d| d.y),
        out_w: layer.out_dim.x,
        out_h: layer.out_dim.y,
        ..SegDim::default()
    };
}

/// Square tiling for layers that copy the input geometry to the output
/// (elementwise, concat). Keeps the conservative legacy limits of the
/// two-operand runtime kernels (5 bit addressing).
fn elwise_like_segment_dimensions(net: &mut Net, id: LayerId) {
    let arch = net.arch;
    let in_dims = net.src_dims(id);
    let layer = net.layer_mut(id);

    let mut rf_free_entries = arch.rf_discard_addr() as i32;
    if let Some(fused) = layer.fused_ops() {
        if fused.activation == crate::graph::Activation::Relu6 {
            rf_free_entries -= 1; // one entry required for the shifted six
        }
    }

    let lm_free_entries = (arch.lm_size / 4) as i32;
    let mut lm_in_seg_max = (lm_free_entries as f64).sqrt().floor() as i32;

    let max_beta = 31;
    let max_xend_yend = 31;
    lm_in_seg_max = lm_in_seg_max.min(max_beta);

    let mut rf_out_seg_max = lm_in_seg_max.min((rf_free_entries as f64).sqrt().floor() as i32);
    rf_out_seg_max = rf_out_seg_max.min(max_xend_yend + 1);

    let seg = &mut layer.seg;
    seg.num_x = ceil_div(layer.out_dim.x, rf_out_seg_max).max(ceil_div(in_dims[0].x, lm_in_seg_max));
    seg.num_y = ceil_div(layer.out_dim.y, rf_out_seg_max).max(ceil_div(in_dims[0].y, lm_in_seg_max));

    seg.out_w = ceil_div(layer.out_dim.x, seg.num_x);
    seg.out_h = ceil_div(layer.out_dim.y, seg.num_y);
    seg.in_w = seg.out_w;
    seg.in_h = seg.out_h;
}

/// 1D segmentation: one run of consecutive elements per lane.
fn conv1d_segment_dimensions(net: &mut Net, id: LayerId) -> Result<()> {
    let arch = net.arch;
    let in_dims = net.src_dims(id);
    let layer = net.layer_mut(id);
    let name = layer.full_name();
    let (kernel_length, stride, use_bias, activation) = match &layer.kind {
        LayerKind::Conv1d(p) => (p.kernel_length, p.stride, p.use_bias, p.fused.activation),
        _ => unreachable!(),
    };

    let n_in_channels = in_dims[0].ch; // weights for all input channels are loaded at once
    let n_weights = n_in_channels * kernel_length + use_bias as i32;
    let lm_free_entries = (arch.lm_size / 2) as i32 - arch.lanes as i32 * n_weights;

    // leakyrelu / relu6 park one parameter in the RF
    let n_act_params = matches!(
        activation,
        crate::graph::Activation::LeakyRelu | crate::graph::Activation::Relu6
    ) as i32;
    let rf_free_entries = arch.rf_discard_addr() as i32 - n_weights - n_act_params;

    let seg_len = lm_free_entries.min(rf_free_entries).min(in_dims[0].x);
    if seg_len < 1 {
        return Err(CompilerError::CapacityOverflow {
            layer: name,
            reason: format!("weights occupy all local memory ({n_weights} entries per lane)"),
        });
    }

    layer.seg = SegDim {
        num_x: ceil_div(in_dims[0].x, seg_len),
        num_y: 1,
        in_w: seg_len,
        in_h: 1,
        in_x_stride: seg_len * stride,
        out_w: seg_len,
        out_h: 1,
        ..SegDim::default()
    };
    Ok(())
}

/// Fixed 2x2 input tiles; the block interleave happens in the address
/// arithmetic of the segment generator.
fn depth_to_space_segment_dimensions(net: &mut Net, id: LayerId) {
    let in_dims = net.src_dims(id);
    let layer = net.layer_mut(id);
    let seg = &mut layer.seg;
    seg.in_w = 2;
    seg.in_h = 2;
    seg.num_x = in_dims[0].x / seg.in_w;
    seg.num_y = in_dims[0].y / seg.in_h;
    seg.out_w = layer.out_dim.x / seg.num_x;
    seg.out_h = layer.out_dim.y / seg.num_y;
}

/// Deform operates on fixed 8x8 blocks; the output is widened by the kernel
/// columns it materialises.
fn dconv_deform_segment_dimensions(net: &mut Net, id: LayerId) {
    let in_dims = net.src_dims(id);
    let layer = net.layer_mut(id);
    let kernel_size = match &layer.kind {
        LayerKind::DConvDeform(p) => p.kernel_size,
        _ => unreachable!(),
    };
    let seg = &mut layer.seg;
    seg.out_w = 8;
    seg.out_h = 8;
    seg.in_w = seg.out_w;
    seg.in_h = seg.out_h;
    seg.num_x = ceil_div(in_dims[0].x, seg.in_w);
    seg.num_y = ceil_div(in_dims[0].y, seg.in_h);
    seg.out_w *= kernel_size;
}

/// Flat 1xN convolution over deformed columns; closed-form tiling with the
/// conservative legacy limits.
fn dconv_conv_segment_dimensions(net: &mut Net, id: LayerId) {
    let arch = net.arch;
    let in_dims = net.src_dims(id);
    let layer = net.layer_mut(id);
    let (kernel_length, use_bias, conv_out_w, conv_out_h) = match &layer.kind {
        LayerKind::DConvConv(p) => (p.kernel_length, p.use_bias, p.conv_out_w, p.conv_out_h),
        _ => unreachable!(),
    };

    let n_weights = kernel_length + use_bias as i32;
    let rf_free_entries = arch.rf_discard_addr() as i32 - n_weights;
    let lm_free_entries = (arch.lm_size / 2) as i32 - 2 * n_weights;
    let mut lm_in_seg_max = ((lm_free_entries / kernel_length) as f64).sqrt().floor() as i32;

    let max_beta = 31;
    let max_xend_yend = 31;
    lm_in_seg_max = lm_in_seg_max.min(max_beta);
    let rf_out_seg_max = lm_in_seg_max.min((rf_free_entries as f64).sqrt().floor() as i32);

    let seg = &mut layer.seg;
    seg.num_x = ceil_div(conv_out_w, rf_out_seg_max)
        .max(ceil_div(in_dims[0].x / kernel_length, lm_in_seg_max));
    seg.num_y = ceil_div(conv_out_h, rf_out_seg_max).max(ceil_div(in_dims[0].y, lm_in_seg_max));

    seg.out_w = ceil_div(conv_out_w, seg.num_x);
    seg.out_h = ceil_div(conv_out_h, seg.num_y);

    let max_seg_dim = max_xend_yend + 1;
    if seg.out_w > max_seg_dim {
        seg.num_x = ceil_div(conv_out_w, max_seg_dim);
        seg.out_w = ceil_div(conv_out_w, seg.num_x);
    }
    if seg.out_h > max_seg_dim {
        seg.num_y = ceil_div(conv_out_h, max_seg_dim);
        seg.out_h = ceil_div(conv_out_h, seg.num_y);
    }

    seg.in_w = seg.out_w * kernel_length;
    seg.in_h = seg.out_h;

    let (w, h) = (seg.out_w, seg.out_h);
    if let LayerKind::DConvConv(p) = &mut layer.kind {
        p.conv_seg_w = w;
        p.conv_seg_h = h;
    }
}

/// Global pooling: as wide as possible to be DMA friendly, constrained by
/// the 3D addressing factorisation.
fn global_pool_segment_dimensions(net: &mut Net, id: LayerId) -> Result<()> {
    let arch = net.arch;
    let in_dims = net.src_dims(id);
    let layer = net.layer_mut(id);
    let name = layer.full_name();
    let lm_free_entries = (arch.lm_size / 2) as i32;

    struct Best {
        seg: SegDim,
        sets: i32,
        dmas: i32,
        seg_size: i32,
        lanes_per_ch: i32,
        sets_per_ch: i32,
    }
    let mut best: Option<Best> = None;

    let usable_lanes = (arch.clusters * arch.units) as i32; // only L0 used
    let mut seg = SegDim::default();

    let mut in_w = lm_free_entries.min(in_dims[0].x + 20);
    while in_w > 0 {
        seg.in_w = in_w;
        seg.num_x = ceil_div(in_dims[0].x, seg.in_w);
        let mut in_h = (lm_free_entries / seg.in_w).min(in_dims[0].y + 20);
        while in_h > 0 {
            seg.in_h = in_h;
            let seg_size = seg.in_w * seg.in_h;
            // segment widths and heights beyond the vector-length limits are
            // fine as long as the total element count factorises
            if factorize(seg_size, arch.lm_size).is_some() {
                seg.num_y = ceil_div(in_dims[0].y, seg.in_h);
                let num_segs = seg.num_x * seg.num_y;

                // whole channel sequentially mapped to one lane, saving the
                // DMA round trip for partial sums
                let lanes_per_ch = 1;
                let sets_per_ch = num_segs;
                let sets = sets_per_ch * ceil_div(in_dims[0].ch, usable_lanes);

                let dmas = in_dims[0].ch * num_segs;
                let better = match &best {
                    None => true,
                    Some(b) => {
                        sets < b.sets
                            || (sets == b.sets
                                && (dmas < b.dmas || (dmas == b.dmas && seg_size < b.seg_size)))
                    }
                };
                if better {
                    best = Some(Best {
                        seg,
                        sets,
                        dmas,
                        seg_size,
                        lanes_per_ch,
                        sets_per_ch,
                    });
                }
            }
            in_h -= 1;
        }
        in_w -= 1;
    }

    let best = best.ok_or_else(|| CompilerError::CapacityOverflow {
        layer: name,
        reason: "no factorisable segment size".into(),
    })?;

    layer.seg = best.seg;
    // 16 bit end result written directly, no 48 bit intermediate in LM
    layer.seg.out_w = if best.lanes_per_ch == 1 { 1 } else { 3 };
    layer.seg.out_h = 1;
    layer.seg.out_x_stride = 0;
    layer.seg.out_y_stride = 0;

    match &mut layer.kind {
        LayerKind::GlobalAvgPool2d(p) | LayerKind::GlobalMaxPool2d(p) => {
            p.lanes_per_ch = best.lanes_per_ch;
            p.sets_per_ch = best.sets_per_ch;
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Is `i` expressible as `x*y*z` within the 3D vector addressing limits
/// (`x <= 63`, `y <= 64`, `z <= 1023`, and `x*y <= MAX_GAMMA` when z > 1)?
/// Returns the factorisation the accumulate kernel will use.
pub fn factorize(i: i32, lm_size: u32) -> Option<(i32, i32, i32)> {
    let max_i = (lm_size / 2) as i32;
    if i > max_i || i <= 0 {
        return None;
    }
    let mut found = None;
    for x in 1..=(MAX_X_END + 1).min(MAX_BETA) as i32 {
        for y in 1..=(MAX_Y_END + 1) as i32 {
            for z in 1..=MAX_Z_END as i32 {
                if z > 1 && x * y > MAX_GAMMA as i32 {
                    break;
                }
                let p = x * y * z;
                if p > max_i {
                    break; // increasing z only grows the product
                }
                if p == i {
                    found = Some((x, y, z));
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factorize_respects_field_limits() {
        let (x, y, z) = factorize(49, 8192).unwrap();
        assert_eq!(x * y * z, 49);
        assert!(x <= 63 && y <= 64 && z <= 1023);

        let (x, y, z) = factorize(3969, 8192).unwrap(); // 63 * 63
        assert_eq!(x * y * z, 3969);
    }

    #[test]
    fn factorize_rejects_oversized_blocks() {
        assert!(factorize(0, 8192).is_none());
        assert!(factorize(4097, 8192).is_none());
    }

    #[test]
    fn large_primes_are_not_factorisable() {
        // 4093 is prime and exceeds every single-axis limit
        assert!(factorize(4093, 8192).is_none());
    }
}
