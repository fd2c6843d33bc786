//! Program- and weight-blob serialisation.
//!
//! Program blob layout:
//!
//! ```text
//! NET header (magic word, blob size, layer counts, exec list offset)
//! NET.bif_layer_offs[layer_count]          byte offsets from NET base
//! LAYER[0]                                 record head + command segments
//! LAYER[1]
//! ...
//! layer_execlist[layer_execlist_count]     indices into bif_layer_offs
//! ```
//!
//! All structure boundaries are 32 byte aligned. The weight blob is a flat
//! byte string with every layer's packed weights at
//! `weights_mm_addr - first_weights_mm_addr`; alignment holes stay zeroed.

use tracing::info;

use crate::arch::{MmAddr, MmSize};
use crate::bif::{
    LayerRecord, NetHeader, TensorRef, BLOB_ALIGN, COMMAND_SEGMENT_BYTES, LAYER_RECORD_BYTES,
    NET_HEADER_BYTES, NET_MAGICWORD,
};
use crate::error::Result;
use crate::graph::layer::LayerKind;
use crate::graph::{LayerId, Net};
use crate::utils::align;
use crate::{commands, compressor, segments};

/// Generate segments, commands and the compressed stream of one layer.
pub fn generate_command_segments(net: &mut Net, li: usize) -> Result<()> {
    let id = LayerId(li);
    net.layers[li].segments = segments::generate_segments(net, id)?;
    let (cmds, cnt) = commands::generate_commands(net, id)?;

    let layer = &net.layers[li];
    let skip_compression = matches!(
        layer.kind,
        LayerKind::DynamicAxis { .. } | LayerKind::ScatterToGrid(_) | LayerKind::DepthToSpace(_)
    );
    let (cmds, cnt) = if skip_compression {
        (cmds, cnt)
    } else {
        compressor::compress(&layer.cfg, cmds)
    };

    let layer = &mut net.layers[li];
    layer.commands = cmds;
    layer.cmd_cnt = cnt;
    Ok(())
}

/// Fill the LAYER record head from the layer state.
pub fn build_layer_record(net: &Net, li: usize) -> LayerRecord {
    let layer = &net.layers[li];
    let id = LayerId(li);
    let in_dims = net.src_dims(id);

    let mut bl = LayerRecord {
        wire_type: layer.kind.wire_type(),
        number: layer.number,
        out_channels: layer.out_dim.ch as u32,
        dynamic_shape: layer.use_dynamic_shape,
        seg_out_w: layer.seg.out_w as u32,
        seg_out_h: layer.seg.out_h as u32,
        seg_in_w: layer.seg.in_w as u32,
        seg_in_h: layer.seg.in_h as u32,
        pad: layer.padding.dma,
        last_layer_using_input: layer.last_layer_using_input,
        first_layer_producing_output: layer.first_layer_producing_output,
        parallel_outchannels_per_lane: layer.parallel_outchannels_per_lane as u16,
        parallel_inchannels_per_lane: layer.parallel_inchannels_per_lane as u16,
        output: TensorRef {
            mm_base: layer.out_dim.channel_base(0),
            x: layer.out_dim.x as u32,
            y: layer.out_dim.y as u32,
            y_stride: layer.out_dim.mm.x as u32,
            channels: layer.out_dim.ch as u32,
        },
        ..Default::default()
    };

    if let Some(in_dim) = in_dims.first() {
        bl.in_channels = in_dim.ch as u32;
        bl.input = TensorRef {
            mm_base: in_dim.channel_base(0),
            x: in_dim.x as u32,
            y: in_dim.y as u32,
            y_stride: in_dim.mm.x as u32,
            channels: in_dim.ch as u32,
        };
    } else {
        bl.in_channels = layer.out_dim.ch as u32;
        bl.input.mm_base = layer.out_dim.mm.base;
    }

    if let Some(fused) = layer.fused_ops() {
        bl.store_shift_right = fused.store_shift_right;
        bl.relu_6_shift_left = fused.rf_frac_bits;
        bl.alpha = fused.alpha;
        bl.alpha_mulh_shift_right = fused.alpha_mulh_shift_right;
        bl.activation = fused.activation as u16;
        bl.pool_stride = fused.pool_size[0] as u16;
        bl.pool_size_w = fused.pool_size[0] as u16;
        bl.pool_size_h = fused.pool_size[1] as u16;
    }

    match &layer.kind {
        LayerKind::Conv2d(p) | LayerKind::MaxPool2d(p) | LayerKind::DConvConv(p) => {
            bl.seg_out_w = p.conv_seg_w as u32;
            bl.seg_out_h = p.conv_seg_h as u32;
            bl.stride = p.stride as u32;
            bl.kernel_length = p.kernel_length as u32;
            bl.conv_groups = layer.groups as u32;
            bl.dilation_rate_w = p.dilation[0] as u32;
            bl.dilation_rate_h = p.dilation[1] as u32;
            bl.conv_result_shift_right = p.result_shift_right;
            bl.bias_shift_right = p.bias_shift_right;
        }
        LayerKind::Conv2dTranspose(tp) => {
            let p = &tp.conv;
            bl.seg_out_w = p.conv_seg_w as u32;
            bl.seg_out_h = p.conv_seg_h as u32;
            bl.stride = p.stride as u32;
            bl.kernel_length = p.kernel_length as u32;
            bl.conv_groups = layer.groups as u32;
            bl.dilation_rate_w = p.dilation[0] as u32;
            bl.dilation_rate_h = p.dilation[1] as u32;
            bl.conv_result_shift_right = p.result_shift_right;
            bl.bias_shift_right = p.bias_shift_right;
            bl.subpixel_pad = [
                tp.subpixel_padding.top as u16,
                tp.subpixel_padding.right as u16,
                tp.subpixel_padding.bottom as u16,
                tp.subpixel_padding.left as u16,
            ];
            bl.input_pixels_w = tp.input_pixels_w;
            bl.input_pixels_h = tp.input_pixels_h;
        }
        LayerKind::Conv1d(p) => {
            bl.stride = p.stride as u32;
            bl.kernel_length = p.kernel_length as u32;
            bl.conv_groups = layer.groups as u32;
            bl.conv_result_shift_right = p.result_shift_right;
            bl.bias_shift_right = p.bias_shift_right;
        }
        LayerKind::PointPillars(p) => {
            bl.stride = p.conv.stride as u32;
            bl.kernel_length = p.conv.kernel_length as u32;
            bl.conv_groups = layer.groups as u32;
            bl.conv_result_shift_right = p.conv.result_shift_right;
            bl.bias_shift_right = p.conv.bias_shift_right;
            // the grid segmentation (source 1) drives the runtime transfers
            bl.input.mm_base = in_dims[1].channel_base(0);
        }
        LayerKind::Add(p) => {
            bl.elwise_0_left_shift = p.input_shift_left[0];
            bl.elwise_1_left_shift = p.input_shift_left[1];
        }
        LayerKind::Mul(p) => {
            bl.elwise_0_left_shift = p.input_shift_left[0];
            bl.elwise_1_left_shift = p.input_shift_left[1];
            bl.conv_result_shift_right = p.mulh_shift_right;
        }
        LayerKind::Concatenate(p) => {
            bl.axis = p.axis;
        }
        LayerKind::AvgPool2d(p) => {
            bl.pool_size_w = p.pool_size[0] as u16;
            bl.pool_size_h = p.pool_size[1] as u16;
            bl.pool_stride = p.pool_stride[0] as u16;
            bl.store_shift_right = p.store_shift_right;
            bl.pool_avg_shiftr = p.pool_avg_shiftr;
            bl.pad.value = 0;
        }
        LayerKind::GlobalAvgPool2d(p) | LayerKind::GlobalMaxPool2d(p) => {
            bl.pool_avg_shiftr = p.pool_avg_shiftr;
            bl.store_shift_right = p.store_shift_right;
        }
        LayerKind::DepthToSpace(p) => {
            bl.block_size = p.block_size as u16;
        }
        LayerKind::DynamicAxis { axis } => {
            bl.axis = *axis as i32;
            bl.output.mm_base = layer.out_dim.mm.base;
        }
        LayerKind::DConvDeform(p) => {
            bl.deform_max_offset_x = p.max_offset_x as u16;
            bl.deform_max_offset_y = p.max_offset_y as u16;
            bl.conv_result_shift_right = p.result_shift_right;
            // static offsets live behind the double-buffered LM regions
            let seg = &layer.seg;
            let input = ((seg.in_w + 2 * p.max_offset_x) * (seg.in_h + 2 * p.max_offset_y)) as u32;
            let offsets = (seg.in_w * seg.in_h * 3 * p.kernel_size) as u32;
            let outputs = (seg.out_w * seg.out_h) as u32;
            bl.deform_static_offsets = (2 * (input + offsets + outputs)) as u16;
        }
        _ => {}
    }

    bl.command_segments_count = layer.commands.len() as u32;
    bl
}

/// Assemble the relocatable program blob.
pub fn generate_program_blob(net: &mut Net) -> Result<()> {
    info!("=== program blob generation '{}' ===", net.name);

    let layer_exec_count = net.layer_execlist.len();
    assert!(layer_exec_count > 0, "layer_execlist is empty");

    // some frontend layers are not in the blob; map indices accordingly
    let mut log_idx_to_bin_idx = vec![0u32; net.layers.len()];

    let mut layer_blobs: Vec<Vec<u8>> = Vec::new();
    for li in 0..net.layers.len() {
        if !net.layers[li].produces_binary_data {
            continue;
        }
        generate_command_segments(net, li)?;

        let layer = &net.layers[li];
        info!(
            "layer {}: {} segments -> {} commands",
            layer.full_name(),
            layer.segments.len(),
            layer.commands.len()
        );

        let record = build_layer_record(net, li);
        let payload = LAYER_RECORD_BYTES + COMMAND_SEGMENT_BYTES * net.layers[li].commands.len();
        let mut blob = Vec::with_capacity(align(payload as u32, BLOB_ALIGN) as usize);
        blob.extend_from_slice(&record.encode());
        for cmd in &net.layers[li].commands {
            blob.extend_from_slice(&cmd.encode());
        }
        blob.resize(align(blob.len() as u32, BLOB_ALIGN) as usize, 0);

        log_idx_to_bin_idx[li] = layer_blobs.len() as u32;
        layer_blobs.push(blob);
    }

    let layer_count = layer_blobs.len();
    let sz_bif_net = align(
        (NET_HEADER_BYTES + 4 * layer_count) as u32,
        BLOB_ALIGN,
    );
    let sz_bif_layers: u32 = layer_blobs.iter().map(|b| b.len() as u32).sum();
    let sz_execlist = 4 * layer_exec_count as u32;
    let blob_size = sz_bif_net + sz_bif_layers + sz_execlist;

    let header = NetHeader {
        magicword: NET_MAGICWORD,
        blobsize: blob_size,
        reserved: 0,
        layer_count: layer_count as u32,
        layer_execlist_count: layer_exec_count as u32,
        layer_execlist_offs: sz_bif_net + sz_bif_layers,
    };

    let mut blob = Vec::with_capacity(blob_size as usize);
    blob.extend_from_slice(&header.encode());
    let mut bif_layer_offs = sz_bif_net;
    for lb in &layer_blobs {
        blob.extend_from_slice(&bif_layer_offs.to_ne_bytes());
        bif_layer_offs += lb.len() as u32;
    }
    blob.resize(sz_bif_net as usize, 0);
    for lb in &layer_blobs {
        blob.extend_from_slice(lb);
    }
    for &li in &net.layer_execlist {
        blob.extend_from_slice(&log_idx_to_bin_idx[li].to_ne_bytes());
    }
    assert_eq!(blob.len(), blob_size as usize, "memory layout mismatch");

    info!(
        "program blob: {} frontend layers, {} layers in blob, {} in execlist, {} byte",
        net.layers.len(),
        layer_count,
        layer_exec_count,
        blob_size
    );

    net.program_blob = blob;
    Ok(())
}

/// Pack every binary-producing layer's weights into one flat region.
pub fn generate_weights_blob(net: &mut Net) -> Result<()> {
    let min_addr: MmAddr = net.memlayout.mm_weights_base;
    let mut max_addr_p1: MmAddr = 0;
    for layer in &net.layers {
        if !layer.produces_binary_data {
            continue;
        }
        assert!(
            layer.weights.mm_addr >= min_addr,
            "layer {} places weights below the weight region",
            layer.full_name()
        );
        max_addr_p1 = max_addr_p1.max(
            layer.weights.mm_addr + (layer.weights.packed.len() * 2) as MmSize,
        );
    }

    net.weights_blob.clear();
    if min_addr < max_addr_p1 {
        net.weights_blob.resize((max_addr_p1 - min_addr) as usize, 0);
        for layer in &net.layers {
            if !layer.produces_binary_data {
                continue;
            }
            let offs = (layer.weights.mm_addr - min_addr) as usize;
            for (i, w) in layer.weights.packed.iter().enumerate() {
                let b = w.to_ne_bytes();
                net.weights_blob[offs + 2 * i] = b[0];
                net.weights_blob[offs + 2 * i + 1] = b[1];
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::VproConfig;
    use crate::geometry;
    use crate::graph::layer::{ConvParams, Layer};
    use crate::graph::{Dim, Net};

    fn identity_net() -> Net {
        let mut net = Net::new("t", VproConfig::default());
        let mut input = Layer::new("in", 0, LayerKind::Input);
        input.out_dim = Dim::new(4, 4, 1);
        let a = net.add_layer(input);
        let mut conv = Layer::new(
            "c",
            1,
            LayerKind::Conv2d(ConvParams {
                kernel_length: 1,
                ..Default::default()
            }),
        );
        conv.out_dim.ch = 1;
        conv.out_is_result = true;
        conv.weights.packed = vec![1];
        conv.weights.loaded = true;
        let c = net.add_layer(conv);
        net.add_src_layers(c, &[a]);
        geometry::process_params(&mut net, a).unwrap();
        geometry::process_params(&mut net, c).unwrap();
        crate::memory::design_mm_layout(&mut net).unwrap();
        net.generate_layer_execlist();
        net
    }

    #[test]
    fn program_blob_starts_with_the_magic_word() {
        let mut net = identity_net();
        generate_weights_blob(&mut net).unwrap();
        generate_program_blob(&mut net).unwrap();

        let blob = &net.program_blob;
        assert_eq!(
            u32::from_ne_bytes(blob[0..4].try_into().unwrap()),
            NET_MAGICWORD
        );
        assert_eq!(
            u32::from_ne_bytes(blob[4..8].try_into().unwrap()),
            blob.len() as u32
        );
        assert_eq!(blob.len() % BLOB_ALIGN as usize, 0);
    }

    #[test]
    fn layer_offsets_are_aligned() {
        let mut net = identity_net();
        generate_weights_blob(&mut net).unwrap();
        generate_program_blob(&mut net).unwrap();

        let blob = &net.program_blob;
        let layer_count = u32::from_ne_bytes(blob[12..16].try_into().unwrap()) as usize;
        assert_eq!(layer_count, 1);
        let offs = u32::from_ne_bytes(
            blob[NET_HEADER_BYTES..NET_HEADER_BYTES + 4].try_into().unwrap(),
        );
        assert_eq!(offs % BLOB_ALIGN, 0);
    }

    #[test]
    fn weight_blob_holds_the_packed_payload() {
        let mut net = identity_net();
        generate_weights_blob(&mut net).unwrap();
        assert_eq!(net.weights_blob.len(), 2);
        assert_eq!(
            i16::from_ne_bytes(net.weights_blob[0..2].try_into().unwrap()),
            1
        );
    }
}
