//! Cost-model segmentation for the convolution family.
//!
//! A closed-form forward solution for the optimum segment size is too hard;
//! instead all hardware-legal output sizes are rated with a cost function.
//! The goal is to minimise the overall cycle count (DMA + VPRO), which
//! depends on too many factors for an exact model, so the cost is a product
//! of efficiency fractions with empirically tuned exponents.

use tracing::debug;

use crate::arch::{MAX_BETA, MAX_OFFSET, MAX_X_END, MAX_Y_END, MAX_Z_END};
use crate::error::{CompilerError, Result};
use crate::graph::config::{Pad, SchedulingOrder, SegDim, SegmentationStrategy};
use crate::graph::dim::Dim;
use crate::graph::layer::LayerKind;
use crate::graph::{Activation, LayerId, Net};
use crate::memory::derive_dma_padding;
use crate::segmentation::max_efficiency;
use crate::utils::ceil_div;

#[derive(Clone, Copy, Default)]
struct Candidate {
    seg: SegDim,
    conv_seg_w: i32,
    conv_seg_h: i32,
    effective_unit_usage: f64,
    effective_squariness: f64,
    effective_seg_area: f64,
    effective_pixel_calc_factor: f64,
    cost: f64,
}

/// Rate all segmentations supported by the hardware and keep the cheapest.
pub fn conv2d_segment_dimensions(net: &mut Net, id: LayerId) -> Result<()> {
    let arch = net.arch;
    let in_dim = net.src_dims(id)[0].clone();
    let layer = net.layer(id);
    let name = layer.full_name();
    let is_maxpool = matches!(layer.kind, LayerKind::MaxPool2d(_));
    let groups = layer.groups;
    let out_dim = layer.out_dim.clone();
    let padding_enabled = layer.padding.enabled;
    let algo_pad = layer.padding.algo;

    let p = match &layer.kind {
        LayerKind::Conv2d(p) | LayerKind::MaxPool2d(p) => p.clone(),
        _ => unreachable!(),
    };

    // 1x1 convolutions with unit stride have an equivalent, more flexible 1D
    // formulation; its block size and outputs-per-lane come from a separate
    // brute-force search (cached on disk)
    if layer.cfg.segmentation_strategy == SegmentationStrategy::DetailedHeuristic
        && !is_maxpool
        && p.kernel_length == 1
        && p.fused.pool_size[0] == 1
        && p.stride == 1
        && groups == 1
        && p.fused.upsampling_scale == 1
        && p.pre_zp.is_zero()
    {
        let choice = max_efficiency::block_segmentation(net, id, &p, &in_dim, &out_dim)?;
        let layer = net.layer_mut(id);
        if choice.n > 1 {
            layer.seg = SegDim {
                num_x: choice.block_count,
                num_y: 1,
                in_w: choice.block_size,
                in_h: 1,
                in_x_stride: choice.block_size,
                in_y_stride: 0,
                out_w: choice.block_size,
                out_h: 1,
                out_x_stride: choice.block_size,
                out_y_stride: 0,
            };
            layer.parallel_outchannels_per_lane = choice.n;
            layer.parallel_inchannels_per_lane = choice.m;
            layer.cfg.scheduling_order = SchedulingOrder::SortedX2;
            layer.padding.enabled = false; // padding only works for 2D input
            if let LayerKind::Conv2d(cp) = &mut layer.kind {
                cp.overcalc_elements_1d = choice.overcalc;
                cp.conv_seg_w = choice.block_size;
                cp.conv_seg_h = 1;
            }
            return Ok(());
        }
        // n == 1: fall through to the regular 2D search
    }

    let kernel_length_x = p.kernel_length;
    let kernel_length_y = p.kernel_length;
    let conv_stride_x = p.stride;
    let conv_stride_y = p.stride;
    let pool = p.fused.pool_size;
    let upsampling_scale = p.fused.upsampling_scale;

    // all sizes in elements, not bytes
    let n_weights = kernel_length_x * kernel_length_y + p.use_bias as i32;

    // output is stored in the RF
    let mut rf_free_entries = arch.rf_discard_addr() as i32 - n_weights;
    if p.fused.activation == Activation::Relu6 {
        rf_free_entries -= 1; // one entry required for the shifted six
    }

    // inputs stored in local memory, halved for double buffering; each lane
    // computes one output channel
    let lm_free_entries = (arch.lm_size / 4) as i32 - arch.lanes as i32 * n_weights;

    let kernel1x1 = kernel_length_x == 1; // separate runtime implementation

    // chosen pivotal parameter: segment output size, identical for all units
    let mut max_seg_out_w = rf_free_entries.min(p.conv_out_w);
    let mut max_seg_out_h = rf_free_entries.min(p.conv_out_h);
    if kernel1x1 {
        max_seg_out_w = max_seg_out_w.min(MAX_X_END as i32 + 1).min(MAX_BETA as i32);
        max_seg_out_h = max_seg_out_h.min(MAX_Y_END as i32 + 1);
    } else {
        max_seg_out_w = max_seg_out_w.min(MAX_Z_END as i32 + 1);
    }
    // pooling, activation and shift_store all read the conv result with
    // x_end = w-1, beta = w, y_end = h-1
    max_seg_out_w = max_seg_out_w.min(MAX_X_END as i32 + 1).min(MAX_BETA as i32);
    max_seg_out_h = max_seg_out_h.min(MAX_Y_END as i32 + 1);

    let mut best: Option<Candidate> = None;
    let mut search_count = 0u32;
    let mut seg = SegDim::default();

    for conv_seg_w in 1..=max_seg_out_w {
        // smallest sufficient number of input samples: the 1st output sample
        // needs kernel_length inputs, each further one needs stride more
        seg.in_w = p.dilated_kernel_w + (conv_seg_w - 1) * conv_stride_x;

        // addressing limitation: maximum distance between two rows
        if (kernel1x1 && conv_stride_x * seg.in_w > MAX_BETA as i32)
            || (!kernel1x1 && p.dilation[0] * seg.in_w > MAX_BETA as i32)
        {
            break;
        }
        if is_maxpool && conv_stride_x * seg.in_w > MAX_BETA as i32 {
            break;
        }

        if upsampling_scale != 1 {
            // upsampled store iterates over multiple lines in beta
            if conv_seg_w / pool[0] * 4 > MAX_BETA as i32 {
                break;
            }
        }

        if conv_seg_w % pool[0] != 0 {
            continue;
        }

        for conv_seg_h in 1..=max_seg_out_h {
            // does one output channel fit into the RF?
            if conv_seg_w * conv_seg_h > rf_free_entries {
                break; // larger heights only increase the requirement
            }

            if upsampling_scale != 1
                && (conv_seg_w / pool[0] * upsampling_scale)
                    * (conv_seg_h / pool[1] * upsampling_scale)
                    > arch.rf_size as i32
            {
                break;
            }

            seg.in_h = p.dilated_kernel_h + (conv_seg_h - 1) * conv_stride_y;
            // does one input channel fit into LM?
            if seg.in_w * seg.in_h > lm_free_entries {
                break;
            }

            // maximum LM offset for an input line start
            if (conv_seg_h - 1) * seg.in_w * conv_stride_y > MAX_OFFSET as i32 {
                break;
            }

            if conv_seg_h % pool[1] != 0 {
                continue;
            }

            seg.num_x = ceil_div(p.conv_out_w, conv_seg_w);
            seg.num_y = ceil_div(p.conv_out_h, conv_seg_h);
            seg.in_x_stride = conv_seg_w * conv_stride_x;
            seg.in_y_stride = conv_seg_h * conv_stride_y;
            seg.out_w = conv_seg_w / pool[0] * upsampling_scale;
            seg.out_h = conv_seg_h / pool[1] * upsampling_scale;
            seg.out_x_stride = seg.out_w;
            seg.out_y_stride = seg.out_h;

            // all fields of seg are set; check that the padding fits a
            // single segment (splitting padding is not implemented)
            let dma = derive_dma_padding(&algo_pad, padding_enabled, &seg, &in_dim);
            if !padding_fits_segments(&dma, &seg) {
                continue;
            }

            // segment size can be handled by the hardware; rate it
            search_count += 1;
            let c = rate_candidate(&seg, conv_seg_w, conv_seg_h, &out_dim, arch);
            let better = match &best {
                None => true,
                Some(b) => {
                    c.cost < b.cost
                        || (c.cost == b.cost
                            && (conv_seg_w, conv_seg_h) >= (b.conv_seg_w, b.conv_seg_h))
                }
            };
            if better {
                best = Some(c);
            }
        }
    }

    let best = best.ok_or_else(|| CompilerError::CapacityOverflow {
        layer: name.clone(),
        reason: format!(
            "no legal (w, h) tile for conv_out {}x{} kernel {}",
            p.conv_out_w, p.conv_out_h, p.kernel_length
        ),
    })?;

    debug!(
        "{name}: best segmentation after {search_count} candidates: num {}x{}, out {}x{}, \
         unit_usage {:.3}, squariness {:.3}, seg_area {:.3}, pixel_calc {:.3}",
        best.seg.num_x,
        best.seg.num_y,
        best.seg.out_w,
        best.seg.out_h,
        best.effective_unit_usage,
        best.effective_squariness,
        best.effective_seg_area,
        best.effective_pixel_calc_factor,
    );

    let layer = net.layer_mut(id);
    layer.seg = best.seg;
    if let LayerKind::Conv2d(cp) | LayerKind::MaxPool2d(cp) = &mut layer.kind {
        cp.conv_seg_w = best.conv_seg_w;
        cp.conv_seg_h = best.conv_seg_h;
    }
    Ok(())
}

/// Padding must be handled entirely by the outermost segments.
fn padding_fits_segments(dma: &Pad, seg: &SegDim) -> bool {
    let min_seg_in_w = if seg.num_x < 2 {
        dma.left + dma.right // one segment handles both paddings
    } else {
        dma.left.max(dma.right)
    };
    if seg.in_w < min_seg_in_w {
        return false;
    }

    let min_seg_in_h = if seg.num_y < 2 {
        dma.top + dma.bottom
    } else {
        dma.top.max(dma.bottom)
    };
    if seg.in_h < min_seg_in_h {
        return false;
    }

    // padding widths are configured per layer: all segments share the same
    // (t|r|b|l) widths or carry no padding, so the pad must never straddle
    // two segments
    !(dma.top > seg.in_y_stride
        || dma.right > seg.in_x_stride
        || dma.bottom > seg.in_y_stride
        || dma.left > seg.in_x_stride)
}

fn rate_candidate(
    seg: &SegDim,
    conv_seg_w: i32,
    conv_seg_h: i32,
    out_dim: &Dim,
    arch: crate::arch::VproConfig,
) -> Candidate {
    let lanes = arch.lanes as i32;
    let parallel_lanes = arch.parallel_lanes() as i32;

    // lanes operate on the same input data only; idle lanes if the channel
    // count does not divide
    let unit_usages = seg.num_x * seg.num_y * ceil_div(out_dim.ch, lanes) * lanes;
    let iterations = ceil_div(unit_usages, parallel_lanes);
    let executed_units = parallel_lanes * iterations;
    let effective_unit_usage = unit_usages as f64 / executed_units as f64;

    let effective_seg_area = (conv_seg_w * conv_seg_h) as f64 / arch.rf_size as f64;

    let calc_pixels = (seg.num_x * seg.out_w * seg.num_y * seg.out_h) as f64;
    let req_pixels = (out_dim.x * out_dim.y) as f64;
    let effective_pixel_calc_factor = req_pixels / calc_pixels;

    // non-square segments need more padding and more DMA per output area
    let area = (conv_seg_w * conv_seg_h) as f64;
    let perimeter = (conv_seg_w * 2 + conv_seg_h * 2) as f64;
    let longest = conv_seg_w.max(conv_seg_h) as f64;
    let max_squariness = longest * longest / (longest * 4.0);
    let effective_squariness = (area / perimeter) / max_squariness;

    let cost = 1.0
        - (effective_unit_usage.powi(2)
            * effective_squariness
            * effective_seg_area.powf(1.5)
            * effective_pixel_calc_factor.powi(2));

    Candidate {
        seg: *seg,
        conv_seg_w,
        conv_seg_h,
        effective_unit_usage,
        effective_squariness,
        effective_seg_area,
        effective_pixel_calc_factor,
        cost,
    }
}

/// Transposed convolution: output tiles must be integer multiples of the
/// stride so all lanes share the same input sub-pixel shift.
pub fn conv_transpose_segment_dimensions(net: &mut Net, id: LayerId) -> Result<()> {
    let arch = net.arch;
    let in_dim = net.src_dims(id)[0].clone();
    let layer = net.layer(id);
    let name = layer.full_name();
    let out_dim = layer.out_dim.clone();
    let padding_enabled = layer.padding.enabled;
    let algo_pad = layer.padding.algo;
    let p = match &layer.kind {
        LayerKind::Conv2dTranspose(tp) => tp.conv.clone(),
        _ => unreachable!(),
    };

    let stride_x = p.stride;
    let stride_y = p.stride;
    let n_weights = p.kernel_length * p.kernel_length + p.use_bias as i32;

    let mut rf_free_entries = arch.rf_discard_addr() as i32 - n_weights;
    if p.fused.activation == Activation::Relu6 {
        rf_free_entries -= 1;
    }
    let lm_free_entries = (arch.lm_size / 4) as i32 - arch.lanes as i32 * n_weights;

    let max_seg_out_w = (MAX_Z_END as i32).min(rf_free_entries).min(p.conv_out_w);

    let mut best: Option<(i64, SegDim)> = None;
    let mut seg = SegDim::default();

    for out_w in 1..=max_seg_out_w {
        seg.out_w = out_w;
        if out_w % stride_x != 0 {
            continue;
        }
        if out_w - 1 > MAX_X_END as i32 {
            break;
        }
        seg.in_w = ceil_div(p.kernel_length + (out_w - 1), stride_x);
        if out_w > MAX_BETA as i32 {
            break;
        }

        for out_h in 1..=p.conv_out_h {
            seg.out_h = out_h;
            if seg.out_w * seg.out_h > rf_free_entries {
                break;
            }
            if out_h - 1 > MAX_Y_END as i32 {
                break;
            }
            if out_h % stride_y != 0 {
                continue;
            }
            seg.in_h = ceil_div(p.kernel_length + (out_h - 1), stride_y);
            if seg.in_w * seg.in_h > lm_free_entries {
                break;
            }
            if seg.out_w * seg.out_h > lm_free_entries {
                break;
            }

            // how many input pixels feed one output row/column
            let input_pixels_h = ceil_div(out_h - 1, stride_y);
            if seg.out_w * stride_y * (input_pixels_h + 1) > MAX_OFFSET as i32 {
                break;
            }
            if seg.in_w * (input_pixels_h + 1) > MAX_OFFSET as i32 {
                break;
            }

            seg.num_x = ceil_div(p.conv_out_w, seg.out_w);
            seg.num_y = ceil_div(p.conv_out_h, seg.out_h);
            seg.in_x_stride = seg.out_w / stride_x;
            seg.in_y_stride = seg.out_h / stride_y;
            seg.out_x_stride = seg.out_w;
            seg.out_y_stride = seg.out_h;

            let dma = derive_dma_padding(&algo_pad, padding_enabled, &seg, &in_dim);
            if !padding_fits_segments(&dma, &seg) {
                continue;
            }

            let lanes = arch.lanes as i32;
            let unit_usages = seg.num_x * seg.num_y * ceil_div(out_dim.ch, lanes) * lanes;
            // prefer square inputs, not outputs
            let seg_area = (seg.out_w * stride_x + 1) * (seg.out_h * stride_y + 1);
            let cost = unit_usages as i64 * seg_area as i64;

            if best.as_ref().map_or(true, |(bc, _)| cost <= *bc) {
                best = Some((cost, seg));
            }
        }
    }

    let (_, best_seg) = best.ok_or_else(|| CompilerError::CapacityOverflow {
        layer: name,
        reason: "no possible transposed-conv segmentation".into(),
    })?;

    let layer = net.layer_mut(id);
    layer.seg = best_seg;
    if let LayerKind::Conv2dTranspose(tp) = &mut layer.kind {
        tp.conv.conv_seg_w = best_seg.out_w;
        tp.conv.conv_seg_h = best_seg.out_h;
        tp.input_pixels_w = ceil_div(best_seg.out_w - 1, stride_x) as u16;
        tp.input_pixels_h = ceil_div(best_seg.out_h - 1, stride_y) as u16;
    }
    Ok(())
}

/// Average pooling rates candidates like the conv search, with the
/// reciprocal divisor map sharing RF and LM with the data.
pub fn avgpool_segment_dimensions(net: &mut Net, id: LayerId) -> Result<()> {
    let arch = net.arch;
    let in_dim = net.src_dims(id)[0].clone();
    let layer = net.layer(id);
    let name = layer.full_name();
    let out_dim = layer.out_dim.clone();
    let padding_enabled = layer.padding.enabled;
    let algo_pad = layer.padding.algo;
    let p = match &layer.kind {
        LayerKind::AvgPool2d(p) => p.clone(),
        _ => unreachable!(),
    };

    let rf_free_entries = arch.rf_discard_addr() as i32;
    let lm_free_entries = (arch.lm_size / 4) as i32;

    let mut best: Option<(i64, SegDim)> = None;
    let mut seg = SegDim::default();

    let max_seg_out_w = (MAX_X_END as i32).min(rf_free_entries).min(out_dim.x);
    for out_w in 1..=max_seg_out_w {
        seg.out_w = out_w;
        seg.in_w = p.pool_size[0] + (out_w - 1) * p.pool_stride[0];
        if seg.in_w > MAX_BETA as i32 {
            break;
        }
        if seg.in_w % p.pool_size[0] != 0 {
            continue;
        }

        let max_seg_out_h = (MAX_Y_END as i32).min(out_dim.y);
        for out_h in 1..=max_seg_out_h {
            seg.out_h = out_h;
            // div map starts at RF[1] to avoid a RAW hazard on RF[0]
            let size_div_map = seg.out_w * seg.out_h + 1;
            if size_div_map > rf_free_entries {
                break;
            }
            seg.in_h = p.pool_size[1] + (out_h - 1) * p.pool_stride[1];
            if seg.in_w * seg.in_h + size_div_map > lm_free_entries {
                break;
            }
            if seg.in_h % p.pool_size[1] != 0 {
                continue;
            }

            seg.num_x = ceil_div(out_dim.x, seg.out_w);
            seg.num_y = ceil_div(out_dim.y, seg.out_h);
            seg.in_x_stride = seg.out_w * p.pool_stride[0];
            seg.in_y_stride = seg.out_h * p.pool_stride[1];
            seg.out_x_stride = seg.out_w;
            seg.out_y_stride = seg.out_h;

            let dma = derive_dma_padding(&algo_pad, padding_enabled, &seg, &in_dim);
            if !padding_fits_segments(&dma, &seg) {
                continue;
            }

            let lanes = arch.lanes as i32;
            let unit_usages = seg.num_x * seg.num_y * ceil_div(out_dim.ch, lanes) * lanes;
            let seg_area =
                (seg.out_w * p.pool_stride[0] + 1) * (seg.out_h * p.pool_stride[1] + 1);
            let cost = unit_usages as i64 * seg_area as i64;

            if best.as_ref().map_or(true, |(bc, _)| cost < *bc) {
                best = Some((cost, seg));
            }
        }
    }

    let (_, best_seg) = best.ok_or_else(|| CompilerError::CapacityOverflow {
        layer: name,
        reason: "no legal pooling segmentation".into(),
    })?;
    net.layer_mut(id).seg = best_seg;

    generate_avgpool_weights(net, id);
    Ok(())
}

/// The divisor map replaces the division by a fixed-point multiplication
/// with the reciprocal of the number of valid pixels under each window.
fn generate_avgpool_weights(net: &mut Net, id: LayerId) {
    use crate::graph::PaddingMode;
    use ndarray::Array2;

    let in_dim = net.src_dims(id)[0].clone();
    let layer = net.layer_mut(id);
    let (out_x, out_y) = (layer.out_dim.x, layer.out_dim.y);
    let algo = layer.padding.algo;
    let p = match &mut layer.kind {
        LayerKind::AvgPool2d(p) => p,
        _ => unreachable!(),
    };

    p.pool_avg_shiftr = 14; // 16 bit LM words hold 2.14 fixed point
    let scale = (1 << p.pool_avg_shiftr) as f32;

    let map: Array2<i16> = if p.pool_padding_mode == PaddingMode::Valid {
        // constant divisor
        let div_int = (scale / (p.pool_size[0] * p.pool_size[1]) as f32) as i16;
        Array2::from_elem((out_y as usize, out_x as usize), div_int)
    } else {
        // per-pixel count of window taps inside the image
        let kleft = (p.pool_size[0] - 1) / 2;
        let kright = p.pool_size[0] / 2;
        let ktop = (p.pool_size[1] - 1) / 2;
        let kbottom = p.pool_size[1] / 2;
        let x_start = kleft - algo.left;
        let y_start = ktop - algo.top;

        let mut m = Array2::zeros((out_y as usize, out_x as usize));
        let mut oy = 0usize;
        let mut y = y_start;
        while y < in_dim.y && oy < out_y as usize {
            let mut ox = 0usize;
            let mut x = x_start;
            while x < in_dim.x && ox < out_x as usize {
                let mut valid = p.pool_size[0] * p.pool_size[1];
                for kx in -kleft..=kright {
                    for ky in -ktop..=kbottom {
                        let u = x + kx;
                        let v = y + ky;
                        if u < 0 || u >= in_dim.x || v < 0 || v >= in_dim.y {
                            valid -= 1;
                        }
                    }
                }
                m[(oy, ox)] = (scale / valid as f32) as i16;
                ox += 1;
                x += p.pool_stride[0];
            }
            oy += 1;
            y += p.pool_stride[1];
        }
        m
    };

    layer.weights.packed = map.iter().copied().collect();
    layer.weights.loaded = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::VproConfig;
    use crate::geometry;
    use crate::graph::layer::{ConvParams, Layer};
    use crate::graph::{Net, PaddingMode};

    fn small_conv_net(in_x: i32, in_y: i32, in_ch: i32, out_ch: i32, kernel: i32) -> (Net, LayerId) {
        let mut net = Net::new("t", VproConfig::default());
        let mut input = Layer::new("in", 0, LayerKind::Input);
        input.out_dim = crate::graph::Dim::new(in_x, in_y, in_ch);
        let a = net.add_layer(input);
        let mut conv = Layer::new(
            "c",
            1,
            LayerKind::Conv2d(ConvParams {
                kernel_length: kernel,
                ..Default::default()
            }),
        );
        conv.out_dim.ch = out_ch;
        let c = net.add_layer(conv);
        net.add_src_layers(c, &[a]);
        geometry::process_params(&mut net, a).unwrap();
        geometry::process_params(&mut net, c).unwrap();
        crate::memory::design_mm_layout(&mut net).unwrap();
        (net, c)
    }

    #[test]
    fn small_image_fits_one_segment() {
        let (net, c) = small_conv_net(8, 8, 3, 4, 3);
        let seg = &net.layer(c).seg;
        assert_eq!((seg.num_x, seg.num_y), (1, 1));
        assert_eq!((seg.out_w, seg.out_h), (8, 8));
        // kernel 3, stride 1: two extra rows/cols of input per segment
        assert_eq!((seg.in_w, seg.in_h), (10, 10));
    }

    #[test]
    fn output_tile_respects_register_file() {
        let (net, c) = small_conv_net(80, 80, 1, 1, 3);
        let seg = &net.layer(c).seg;
        let arch = net.arch;
        assert!(seg.out_w * seg.out_h <= arch.rf_discard_addr() as i32 - 9);
        assert!(seg.in_w * seg.in_h <= (arch.lm_size / 4) as i32 - arch.lanes as i32 * 9);
        assert!(seg.num_x * seg.out_w >= 80);
        assert!(seg.num_y * seg.out_h >= 80);
    }

    #[test]
    fn depthwise_conv_keeps_per_channel_groups() {
        let mut net = Net::new("t", VproConfig::default());
        let mut input = Layer::new("in", 0, LayerKind::Input);
        input.out_dim = crate::graph::Dim::new(56, 56, 16);
        let a = net.add_layer(input);
        let mut conv = Layer::new(
            "c",
            1,
            LayerKind::Conv2d(ConvParams {
                kernel_length: 3,
                stride: 2,
                ..Default::default()
            }),
        );
        conv.out_dim.ch = 16;
        conv.groups = 16;
        let c = net.add_layer(conv);
        net.add_src_layers(c, &[a]);
        geometry::process_params(&mut net, a).unwrap();
        geometry::process_params(&mut net, c).unwrap();
        crate::memory::design_mm_layout(&mut net).unwrap();

        assert_eq!(net.layer(c).groups, 16);
        assert!(net.layer(c).seg.num_x >= 1);
    }

    #[test]
    fn avgpool_divisor_map_is_constant_for_valid_padding() {
        let mut net = Net::new("t", VproConfig::default());
        let mut input = Layer::new("in", 0, LayerKind::Input);
        input.out_dim = crate::graph::Dim::new(8, 8, 2);
        let a = net.add_layer(input);
        let pool = Layer::new(
            "p",
            1,
            LayerKind::AvgPool2d(crate::graph::AvgPoolParams::new(2, 2, PaddingMode::Valid)),
        );
        let p = net.add_layer(pool);
        net.add_src_layers(p, &[a]);
        geometry::process_params(&mut net, a).unwrap();
        geometry::process_params(&mut net, p).unwrap();
        crate::memory::design_mm_layout(&mut net).unwrap();

        let l = net.layer(p);
        assert_eq!(l.weights.packed.len(), (l.out_dim.x * l.out_dim.y) as usize);
        let expected = ((1 << 14) as f32 / 4.0) as i16;
        assert!(l.weights.packed.iter().all(|&w| w == expected));
    }
}
