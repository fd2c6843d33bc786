//! Algorithm-view geometry: output shapes and input padding.
//!
//! `process_params` normalises user parameters, derives `out_dim.(x|y|ch)`
//! and the algorithm padding. The implementation-view memory image is
//! designed later by the memory planner once the segmentation is known.

use crate::error::{CompilerError, Result};
use crate::graph::config::{Pad, PaddingMode, SchedulingOrder, GROUPS_UNSET, STRIDE_UNSET};
use crate::graph::layer::{LayerKind, Weights};
use crate::graph::{LayerId, Net};
use crate::utils::ceil_div;

fn shape_err(layer: &str, reason: impl Into<String>) -> CompilerError {
    CompilerError::ShapeMismatch {
        layer: layer.to_string(),
        reason: reason.into(),
    }
}

fn unsupported(layer: &str, reason: impl Into<String>) -> CompilerError {
    CompilerError::Unsupported {
        layer: layer.to_string(),
        reason: reason.into(),
    }
}

/// Call after all parameters have been set and before using the layer.
pub fn process_params(net: &mut Net, id: LayerId) -> Result<()> {
    normalize_and_compute_dims(net, id)?;

    let arch = net.arch;
    let in_chs: Vec<i32> = net.src_dims(id).iter().map(|d| d.ch).collect();
    let layer = net.layer_mut(id);
    let name = layer.full_name();

    if layer.groups == GROUPS_UNSET {
        // default: each output channel depends on all input channels
        layer.groups = 1;
    }
    if layer.out_dim.ch % layer.groups != 0 {
        return Err(shape_err(
            &name,
            format!(
                "out channels {} not divisible by groups {}",
                layer.out_dim.ch, layer.groups
            ),
        ));
    }
    for (i, ch) in in_chs.iter().enumerate() {
        if ch % layer.groups != 0 {
            return Err(shape_err(
                &name,
                format!(
                    "input {i} channels {ch} not divisible by groups {}",
                    layer.groups
                ),
            ));
        }
    }

    if layer.lm_lane_stride == STRIDE_UNSET {
        layer.lm_lane_stride = arch.rf_size as i32;
    }
    Ok(())
}

/// Kind-specific normalisation, `compute_output_dim` and
/// `compute_input_padding`, in the order the lifecycle demands.
fn normalize_and_compute_dims(net: &mut Net, id: LayerId) -> Result<()> {
    let name = net.layer(id).full_name();

    // elementwise: broadcasting in x and y is cheaper for input 0 (fewer
    // data loaded into the RF), so the smaller tensor becomes source 0
    if matches!(net.layer(id).kind, LayerKind::Add(_) | LayerKind::Mul(_)) {
        let dims = net.src_dims(id);
        if dims.len() == 2 && dims[0].x * dims[0].y > dims[1].x * dims[1].y {
            net.layer_mut(id).src_layers.swap(0, 1);
            if let LayerKind::Add(p) | LayerKind::Mul(p) = &mut net.layer_mut(id).kind {
                p.input_shift_left.swap(0, 1);
            }
        }
    }

    let in_dims = net.src_dims(id);
    let arch = net.arch;

    // max pooling rides on the conv machinery as a depthwise operation
    if matches!(net.layer(id).kind, LayerKind::MaxPool2d(_)) {
        let ch = in_dims[0].ch;
        let l = net.layer_mut(id);
        l.out_dim.ch = ch;
        l.groups = ch;
    }

    let layer = net.layer_mut(id);

    match &mut layer.kind {
        // output dimensions are user-supplied for inputs
        LayerKind::Input => Ok(()),
        LayerKind::DynamicAxis { axis } => {
            if *axis != 0 {
                return Err(unsupported(&name, "only a dynamic x-axis is supported"));
            }
            Ok(())
        }

        LayerKind::DConvConv(p) => {
            if p.stride != 1 {
                return Err(unsupported(&name, "stride not supported"));
            }
            if p.padding_mode != PaddingMode::Same {
                return Err(unsupported(&name, "padding mode does not apply, use same"));
            }
            if in_dims[0].x % p.kernel_length != 0 {
                return Err(shape_err(
                    &name,
                    "input width must be a multiple of the flat kernel length",
                ));
            }
            p.dilated_kernel_w = p.kernel_length;
            p.dilated_kernel_h = 1;
            layer.out_dim.x = in_dims[0].x / p.kernel_length;
            layer.out_dim.y = in_dims[0].y;
            p.conv_out_w = layer.out_dim.x;
            p.conv_out_h = layer.out_dim.y;
            // a flat kernel uses each input exactly once, never padded
            layer.padding.algo = Pad::default();
            layer.cfg.use_dma_store_splitter = false;
            layer.lm_lane_stride = (arch.rf_size * 2) as i32;
            Ok(())
        }

        LayerKind::Conv2d(p) | LayerKind::MaxPool2d(p) => {
            if p.kernel_length <= 0 || p.stride <= 0 {
                return Err(unsupported(&name, "kernel and stride must be positive"));
            }
            for d in p.dilation {
                if p.stride != 1 && d != 1 {
                    return Err(unsupported(&name, "either dilation_rate or stride must be 1"));
                }
            }
            p.dilated_kernel_w = (p.kernel_length - 1) * p.dilation[0] + 1;
            p.dilated_kernel_h = (p.kernel_length - 1) * p.dilation[1] + 1;
            p.conv_in_w = in_dims[0].x + p.pre_zp.left + p.pre_zp.right;
            p.conv_in_h = in_dims[0].y + p.pre_zp.top + p.pre_zp.bottom;

            // tensorflow output size convention
            let mut w = p.conv_in_w;
            let mut h = p.conv_in_h;
            if p.padding_mode == PaddingMode::Valid {
                w -= p.dilated_kernel_w - 1;
                h -= p.dilated_kernel_h - 1;
            }
            p.conv_out_w = ceil_div(w, p.stride);
            p.conv_out_h = ceil_div(h, p.stride);
            layer.out_dim.x = p.conv_out_w;
            layer.out_dim.y = p.conv_out_h;

            if p.padding_mode == PaddingMode::Same && p.kernel_length > 1 {
                let pad_x = (p.conv_out_w - 1) * p.stride + p.dilated_kernel_w - p.conv_in_w;
                let pad_y = (p.conv_out_h - 1) * p.stride + p.dilated_kernel_h - p.conv_in_h;
                layer.padding.algo.left = pad_x / 2;
                layer.padding.algo.right = pad_x - pad_x / 2;
                layer.padding.algo.top = pad_y / 2;
                layer.padding.algo.bottom = pad_y - pad_y / 2;
            }
            layer.padding.algo.left += p.pre_zp.left;
            layer.padding.algo.right += p.pre_zp.right;
            layer.padding.algo.top += p.pre_zp.top;
            layer.padding.algo.bottom += p.pre_zp.bottom;

            apply_fused_tail(&name, &mut layer.out_dim.x, &mut layer.out_dim.y, &p.fused)?;
            Ok(())
        }

        LayerKind::Conv2dTranspose(tp) => {
            let p = &mut tp.conv;
            if p.stride <= 1 {
                return Err(unsupported(
                    &name,
                    "transposed conv not designed for stride == 1; use Conv2D instead",
                ));
            }
            if p.kernel_length < p.stride {
                return Err(unsupported(&name, "kernel_length must be >= stride"));
            }
            if !p.pre_zp.is_zero() {
                return Err(unsupported(
                    &name,
                    "fused ZeroPadding2D not implemented for transposed conv",
                ));
            }
            p.dilated_kernel_w = p.kernel_length;
            p.dilated_kernel_h = p.kernel_length;

            match p.padding_mode {
                PaddingMode::Valid => {
                    p.conv_out_w = in_dims[0].x * p.stride + p.kernel_length - p.stride;
                    p.conv_out_h = in_dims[0].y * p.stride + p.kernel_length - p.stride;
                }
                PaddingMode::Same => {
                    p.conv_out_w = in_dims[0].x * p.stride;
                    p.conv_out_h = in_dims[0].y * p.stride;
                }
            }

            // total padding in sub-pixels of the upsampled feature map
            let (pad_x, pad_y) = if p.padding_mode == PaddingMode::Valid && p.kernel_length > 1 {
                ((p.kernel_length - 1) * 2, (p.kernel_length - 1) * 2)
            } else {
                (
                    p.kernel_length + p.stride - 2,
                    p.kernel_length + p.stride - 2,
                )
            };

            // whole input pixels of padding ...
            layer.padding.algo.right = (pad_x / 2) / p.stride;
            layer.padding.algo.left = (pad_x - pad_x / 2) / p.stride;
            layer.padding.algo.bottom = (pad_y / 2) / p.stride;
            layer.padding.algo.top = (pad_y - pad_y / 2) / p.stride;
            // ... and the sub-pixel remainder (< stride), applied after them
            tp.subpixel_padding.right = (pad_x / 2) % p.stride;
            tp.subpixel_padding.left = (pad_x - pad_x / 2) % p.stride;
            tp.subpixel_padding.bottom = (pad_y / 2) % p.stride;
            tp.subpixel_padding.top = (pad_y - pad_y / 2) % p.stride;

            layer.out_dim.x = p.conv_out_w;
            layer.out_dim.y = p.conv_out_h;
            apply_fused_tail(&name, &mut layer.out_dim.x, &mut layer.out_dim.y, &p.fused)?;
            Ok(())
        }

        LayerKind::Conv1d(p) => {
            if in_dims[0].y != 1 {
                return Err(unsupported(&name, "Conv1D demands input shape (x, y=1, ch)"));
            }
            if p.kernel_length != 1 || p.stride != 1 {
                return Err(unsupported(&name, "Conv1D requires kernel length 1 and stride 1"));
            }
            if !p.load_weights_at_once {
                return Err(unsupported(&name, "separate weight loads are not handled"));
            }
            layer.out_dim.x = in_dims[0].x;
            layer.out_dim.y = 1;
            Ok(())
        }

        LayerKind::AvgPool2d(p) => {
            layer.out_dim.ch = in_dims[0].ch;
            let sub = if p.pool_padding_mode == PaddingMode::Valid {
                p.pool_size
            } else {
                [1, 1]
            };
            layer.out_dim.x = (in_dims[0].x - sub[0]) / p.pool_stride[0] + 1;
            layer.out_dim.y = (in_dims[0].y - sub[1]) / p.pool_stride[1] + 1;

            if p.pool_padding_mode == PaddingMode::Same {
                let pad_x =
                    (layer.out_dim.x - 1) * p.pool_stride[0] + p.pool_size[0] - in_dims[0].x;
                let pad_y =
                    (layer.out_dim.y - 1) * p.pool_stride[1] + p.pool_size[1] - in_dims[0].y;
                layer.padding.algo.left = pad_x / 2;
                layer.padding.algo.right = pad_x - pad_x / 2;
                layer.padding.algo.top = pad_y / 2;
                layer.padding.algo.bottom = pad_y - pad_y / 2;
            }
            layer.groups = in_dims[0].ch;
            Ok(())
        }

        LayerKind::GlobalAvgPool2d(_) | LayerKind::GlobalMaxPool2d(_) => {
            layer.out_dim.x = 1;
            layer.out_dim.y = 1;
            layer.out_dim.ch = in_dims[0].ch;
            layer.groups = in_dims[0].ch;
            Ok(())
        }

        LayerKind::Add(p) | LayerKind::Mul(p) => {
            if in_dims.len() != 2 {
                return Err(shape_err(&name, "elementwise layers take exactly two inputs"));
            }
            for (a, b, what) in [
                (in_dims[0].x, in_dims[1].x, "x"),
                (in_dims[0].y, in_dims[1].y, "y"),
                (in_dims[0].ch, in_dims[1].ch, "ch"),
            ] {
                if a != b && a != 1 && b != 1 {
                    return Err(shape_err(
                        &name,
                        format!("{what}-dimensions must be either identical or 1 (broadcasting)"),
                    ));
                }
            }
            // broadcasting: out_dim = component-wise max of the inputs
            layer.out_dim.x = in_dims[0].x.max(in_dims[1].x);
            layer.out_dim.y = in_dims[0].y.max(in_dims[1].y);
            layer.out_dim.ch = in_dims[0].ch.max(in_dims[1].ch);
            layer.groups = layer.out_dim.ch; // each output channel uses one input channel

            apply_fused_tail(&name, &mut layer.out_dim.x, &mut layer.out_dim.y, &p.fused)?;
            Ok(())
        }

        LayerKind::Concatenate(p) => {
            match p.axis {
                2 => {
                    for d in &in_dims {
                        if d.x != in_dims[0].x || d.y != in_dims[0].y {
                            return Err(shape_err(
                                &name,
                                "concat(axis=2): spatial dims of input layers do not match",
                            ));
                        }
                    }
                    layer.out_dim.x = in_dims[0].x;
                    layer.out_dim.y = in_dims[0].y;
                    layer.out_dim.ch = in_dims.iter().map(|d| d.ch).sum();
                }
                0 | 1 => {
                    return Err(unsupported(&name, "concat along axis 0/1 not implemented"));
                }
                a => return Err(unsupported(&name, format!("invalid concat axis {a}"))),
            }
            p.oc_to_ic_map.clear();
            p.oc_to_src_map.clear();
            for (sli, d) in in_dims.iter().enumerate() {
                for ic in 0..d.ch {
                    p.oc_to_ic_map.push(ic);
                    p.oc_to_src_map.push(sli);
                }
            }
            if p.in_shifts_right.len() != in_dims.len() {
                return Err(shape_err(
                    &name,
                    "in_shifts_right must carry one entry per source",
                ));
            }
            Ok(())
        }

        LayerKind::DepthToSpace(p) => {
            if p.block_size != 2 {
                return Err(unsupported(&name, "only block_size 2 is implemented"));
            }
            let r2 = p.block_size * p.block_size;
            if in_dims[0].ch % r2 != 0 {
                return Err(shape_err(
                    &name,
                    format!("input channels {} not divisible by block_size^2", in_dims[0].ch),
                ));
            }
            layer.out_dim.x = in_dims[0].x * p.block_size;
            layer.out_dim.y = in_dims[0].y * p.block_size;
            layer.out_dim.ch = in_dims[0].ch / r2;
            Ok(())
        }

        LayerKind::Reshape => {
            if in_dims.len() != 1 {
                return Err(shape_err(&name, "reshape must have exactly one input"));
            }
            let in_elems = in_dims[0].x * in_dims[0].y * in_dims[0].ch;
            let out_elems = layer.out_dim.x * layer.out_dim.y * layer.out_dim.ch;
            if in_elems != out_elems {
                return Err(shape_err(&name, "number of elements must not change"));
            }
            Ok(())
        }

        LayerKind::SliceChannel { start, stop } => {
            layer.out_dim.x = in_dims[0].x;
            layer.out_dim.y = in_dims[0].y;
            if *stop == -1 {
                *stop = in_dims[0].ch;
            }
            if *start < 0 || *stop > in_dims[0].ch || *start >= *stop {
                return Err(shape_err(&name, "slice channel range out of bounds"));
            }
            layer.out_dim.ch = *stop - *start;
            layer.groups = layer.out_dim.ch;
            Ok(())
        }

        LayerKind::ScatterToGrid(p) => {
            if in_dims.len() != 2 {
                return Err(shape_err(
                    &name,
                    "expecting inputs of format [grid indices, features]",
                ));
            }
            if p.xmin == p.xmax || p.ymin == p.ymax {
                return Err(unsupported(&name, "grid extent must be non-empty"));
            }
            p.n_cells_x = ((p.xmax - p.xmin) / p.res).floor() as i32;
            p.n_cells_y = ((p.ymax - p.ymin) / p.res).floor() as i32;
            layer.out_dim.x = p.n_cells_x;
            layer.out_dim.y = p.n_cells_y;
            layer.out_dim.ch = in_dims[1].ch;

            // transfer size for copying the grid through the data cache
            let n_cells = (p.n_cells_x * p.n_cells_y) as u32;
            let mut size = ceil_div(n_cells * layer.out_dim.ch as u32, arch.clusters);
            while size > 2048 {
                size = ceil_div(size, 2);
            }
            p.memcopy_size = size as u16;
            Ok(())
        }

        LayerKind::PointPillars(p) => {
            if in_dims.len() != 2 {
                return Err(shape_err(
                    &name,
                    "expecting inputs of format [features, grid segmentation]",
                ));
            }
            if p.xmin == p.xmax || p.ymin == p.ymax {
                return Err(unsupported(&name, "grid extent must be non-empty"));
            }
            p.n_cells_x = ((p.xmax - p.xmin) / p.res).floor() as i32;
            p.n_cells_y = ((p.ymax - p.ymin) / p.res).floor() as i32;
            layer.out_dim.x = p.n_cells_x;
            layer.out_dim.y = p.n_cells_y;
            // loop extension and store splitting do not understand the
            // runtime-sized transfers of this layer
            layer.cfg.use_dma_loop_extension = false;
            layer.cfg.use_dma_store_splitter = false;
            layer.lm_lane_stride = layer.seg.out_h * layer.seg.out_w;
            Ok(())
        }

        LayerKind::DConvDeform(p) => {
            if p.kernel_size != 9 {
                return Err(unsupported(&name, "deform is implemented for kernel_size 9"));
            }
            if in_dims.len() != 2 {
                return Err(shape_err(&name, "deform takes [input, offsets]"));
            }
            if in_dims[1].ch != 3 * p.kernel_size {
                return Err(shape_err(
                    &name,
                    format!("offset input must have {} channels", 3 * p.kernel_size),
                ));
            }
            if in_dims[0].x != in_dims[1].x || in_dims[0].y != in_dims[1].y {
                return Err(shape_err(&name, "input and offset spatial dims must match"));
            }
            layer.cfg.scheduling_order = SchedulingOrder::SortedOutc;
            layer.out_dim.x = in_dims[0].x * p.kernel_size;
            layer.out_dim.y = in_dims[0].y;
            layer.out_dim.ch = in_dims[0].ch;
            layer.groups = layer.out_dim.ch;
            Ok(())
        }
    }
}

/// Fused 2x2 pooling shrinks the output, upsampling grows it.
fn apply_fused_tail(
    name: &str,
    out_x: &mut i32,
    out_y: &mut i32,
    fused: &crate::graph::layer::FusedOps,
) -> Result<()> {
    let pool = fused.pool_size;
    if pool[0] != pool[1] {
        return Err(unsupported(name, "only square pooling size supported"));
    }
    if pool[0] != 1 && pool[0] != 2 {
        return Err(unsupported(name, "unsupported pooling size"));
    }
    if pool[0] > 1 {
        if *out_x % pool[0] != 0 || *out_y % pool[1] != 0 {
            return Err(shape_err(name, "pooling requires an even input size"));
        }
        *out_x /= pool[0];
        *out_y /= pool[1];
    }
    *out_x *= fused.upsampling_scale;
    *out_y *= fused.upsampling_scale;
    Ok(())
}

/// Expected number of quantised weights for a layer, used for the
/// weight-count sanity warning.
pub fn expected_weight_count(net: &Net, id: LayerId) -> i32 {
    let layer = net.layer(id);
    let in_dims = net.src_dims(id);
    match &layer.kind {
        LayerKind::Conv2d(p) | LayerKind::MaxPool2d(p) => {
            if matches!(layer.kind, LayerKind::MaxPool2d(_)) {
                return 0;
            }
            let kernel = layer.out_dim.ch * in_dims[0].ch / layer.groups
                * p.kernel_length
                * p.kernel_length;
            kernel + if p.use_bias { layer.out_dim.ch } else { 0 }
        }
        LayerKind::Conv2dTranspose(tp) => {
            let p = &tp.conv;
            let kernel = layer.out_dim.ch * in_dims[0].ch / layer.groups
                * p.kernel_length
                * p.kernel_length;
            kernel + if p.use_bias { layer.out_dim.ch } else { 0 }
        }
        LayerKind::Conv1d(p) | LayerKind::PointPillars(crate::graph::PointPillarsParams {
            conv: p,
            ..
        }) => {
            let kernel = layer.out_dim.ch * in_dims[0].ch / layer.groups * p.kernel_length;
            kernel + if p.use_bias { layer.out_dim.ch } else { 0 }
        }
        LayerKind::DConvConv(p) => {
            let kernel = layer.out_dim.ch * in_dims[0].ch * p.kernel_length;
            kernel + if p.use_bias { layer.out_dim.ch } else { 0 }
        }
        LayerKind::AvgPool2d(_) => layer.out_dim.x * layer.out_dim.y,
        LayerKind::DConvDeform(p) => 8 * 8 * p.kernel_size,
        _ => 0,
    }
}

/// Got-vs-expected weight count check; prints a warning, does not abort.
pub fn sanity_check_weights_count(net: &Net, id: LayerId, weights: &Weights) -> bool {
    let expected = expected_weight_count(net, id);
    let got = weights.packed.len() as i32;
    if got != expected {
        tracing::warn!(
            "got {got} weights for layer {}, but expected {expected}",
            net.layer(id).full_name()
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::VproConfig;
    use crate::graph::layer::{ConvParams, ElwiseParams, Layer};
    use crate::graph::{Dim, LayerKind, Net};

    fn input(net: &mut Net, number: i32, x: i32, y: i32, ch: i32) -> LayerId {
        let mut l = Layer::new("in", number, LayerKind::Input);
        l.out_dim = Dim::new(x, y, ch);
        net.add_layer(l)
    }

    fn net() -> Net {
        Net::new("t", VproConfig::default())
    }

    #[test]
    fn conv_same_padding_3x3() {
        let mut net = net();
        let a = input(&mut net, 0, 8, 8, 3);
        let mut conv = Layer::new("c", 1, LayerKind::Conv2d(ConvParams {
            kernel_length: 3,
            stride: 1,
            ..Default::default()
        }));
        conv.out_dim.ch = 4;
        let c = net.add_layer(conv);
        net.add_src_layers(c, &[a]);
        process_params(&mut net, c).unwrap();

        let l = net.layer(c);
        assert_eq!((l.out_dim.x, l.out_dim.y, l.out_dim.ch), (8, 8, 4));
        assert_eq!(
            (
                l.padding.algo.top,
                l.padding.algo.right,
                l.padding.algo.bottom,
                l.padding.algo.left
            ),
            (1, 1, 1, 1)
        );
    }

    #[test]
    fn conv_valid_shrinks_output() {
        let mut net = net();
        let a = input(&mut net, 0, 8, 8, 1);
        let mut conv = Layer::new("c", 1, LayerKind::Conv2d(ConvParams {
            kernel_length: 3,
            stride: 2,
            padding_mode: PaddingMode::Valid,
            ..Default::default()
        }));
        conv.out_dim.ch = 1;
        let c = net.add_layer(conv);
        net.add_src_layers(c, &[a]);
        process_params(&mut net, c).unwrap();
        assert_eq!((net.layer(c).out_dim.x, net.layer(c).out_dim.y), (3, 3));
        assert!(net.layer(c).padding.algo.is_zero());
    }

    #[test]
    fn elementwise_swaps_smaller_tensor_to_source_0() {
        let mut net = net();
        let big = input(&mut net, 0, 28, 28, 64);
        let small = input(&mut net, 1, 1, 1, 64);
        let mut add = Layer::new("add", 2, LayerKind::Add(ElwiseParams {
            input_shift_left: [3, 7],
            ..Default::default()
        }));
        add.out_dim.ch = 64;
        let e = net.add_layer(add);
        net.add_src_layers(e, &[big, small]);
        process_params(&mut net, e).unwrap();

        let l = net.layer(e);
        assert_eq!(l.src_layers[0], small);
        assert_eq!(l.src_layers[1], big);
        match &l.kind {
            LayerKind::Add(p) => assert_eq!(p.input_shift_left, [7, 3]),
            _ => unreachable!(),
        }
        assert_eq!((l.out_dim.x, l.out_dim.y, l.out_dim.ch), (28, 28, 64));
    }

    #[test]
    fn elementwise_rejects_incompatible_shapes() {
        let mut net = net();
        let a = input(&mut net, 0, 28, 28, 64);
        let b = input(&mut net, 1, 14, 28, 64);
        let e = net.add_layer(Layer::new(
            "add",
            2,
            LayerKind::Add(ElwiseParams::default()),
        ));
        net.add_src_layers(e, &[a, b]);
        assert!(matches!(
            process_params(&mut net, e),
            Err(CompilerError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn concat_axis_0_is_rejected() {
        let mut net = net();
        let a = input(&mut net, 0, 16, 16, 8);
        let b = input(&mut net, 1, 16, 16, 8);
        let c = net.add_layer(Layer::new(
            "cat",
            2,
            LayerKind::Concatenate(crate::graph::ConcatParams {
                axis: 0,
                in_shifts_right: vec![0, 0],
                ..Default::default()
            }),
        ));
        net.add_src_layers(c, &[a, b]);
        assert!(matches!(
            process_params(&mut net, c),
            Err(CompilerError::Unsupported { .. })
        ));
    }

    #[test]
    fn depth_to_space_dims() {
        let mut net = net();
        let a = input(&mut net, 0, 4, 4, 8);
        let d = net.add_layer(Layer::new(
            "d2s",
            1,
            LayerKind::DepthToSpace(crate::graph::DepthToSpaceParams { block_size: 2 }),
        ));
        net.add_src_layers(d, &[a]);
        process_params(&mut net, d).unwrap();
        let l = net.layer(d);
        assert_eq!((l.out_dim.x, l.out_dim.y, l.out_dim.ch), (8, 8, 2));
    }

    #[test]
    fn global_pool_collapses_spatial_dims() {
        let mut net = net();
        let a = input(&mut net, 0, 7, 7, 128);
        let g = net.add_layer(Layer::new(
            "gap",
            1,
            LayerKind::GlobalAvgPool2d(Default::default()),
        ));
        net.add_src_layers(g, &[a]);
        process_params(&mut net, g).unwrap();
        let l = net.layer(g);
        assert_eq!((l.out_dim.x, l.out_dim.y, l.out_dim.ch), (1, 1, 128));
        assert_eq!(l.groups, 128);
    }

    #[test]
    fn conv_expected_weight_count_includes_bias() {
        let mut net = net();
        let a = input(&mut net, 0, 8, 8, 3);
        let mut conv = Layer::new("c", 1, LayerKind::Conv2d(ConvParams {
            kernel_length: 3,
            use_bias: true,
            ..Default::default()
        }));
        conv.out_dim.ch = 4;
        let c = net.add_layer(conv);
        net.add_src_layers(c, &[a]);
        process_params(&mut net, c).unwrap();
        assert_eq!(expected_weight_count(&net, c), 3 * 4 * 9 + 4);
    }
}
