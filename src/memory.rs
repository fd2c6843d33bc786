//! Static main-memory planner.
//!
//! Dumb linear allocation: every layer gets a private output block in the
//! output region and a private weight block in the weight region, both
//! 16 byte aligned, in instantiation order. Lifetime-based reuse is an
//! explicit non-goal.

use tracing::info;

use crate::arch::{mm_addr_str, MmAddr, MmSize};
use crate::error::{CompilerError, Result};
use crate::graph::layer::LayerKind;
use crate::graph::{LayerId, Net};
use crate::segmentation;
use crate::utils::align;

/// Assign output and weight addresses to all layers. Assigning an output
/// address cascades into segmentation, DMA padding and the memory image of
/// the layer output.
pub fn design_mm_layout(net: &mut Net) -> Result<()> {
    let mut mm_output_addr = net.memlayout.mm_output_base;
    for i in 0..net.layers.len() {
        mm_output_addr = align(mm_output_addr, 16);
        set_output_mm_addr(net, LayerId(i), mm_output_addr)?;
        mm_output_addr += output_mm_size(net, LayerId(i));
    }

    let mm_weights_base = net.memlayout.mm_weights_base;
    if mm_output_addr > mm_weights_base {
        return Err(CompilerError::MemoryOverflow(format!(
            "mm_output {} overlaps mm_weights {}",
            mm_addr_str(mm_output_addr),
            mm_addr_str(mm_weights_base)
        )));
    }

    // absolute weight addresses are stored in command segments, so they must
    // be final before command generation
    let mut mm_weights_addr = mm_weights_base;
    for layer in net.layers.iter_mut() {
        mm_weights_addr = align(mm_weights_addr, 16);
        layer.weights.mm_addr = mm_weights_addr;
        mm_weights_addr += (layer.weights.packed.len() * 2) as MmSize;
    }

    if mm_output_addr > net.memlayout.mm_ceiling || mm_weights_addr > net.memlayout.mm_ceiling {
        return Err(CompilerError::MemoryOverflow(format!(
            "address ceiling {} exceeded (outputs end {}, weights end {})",
            mm_addr_str(net.memlayout.mm_ceiling),
            mm_addr_str(mm_output_addr),
            mm_addr_str(mm_weights_addr)
        )));
    }

    info!(
        "VPRO memory blocks: outputs {} .. {} ({} byte), weights {} .. {} ({} byte)",
        mm_addr_str(net.memlayout.mm_output_base),
        mm_addr_str(mm_output_addr.saturating_sub(1)),
        mm_output_addr - net.memlayout.mm_output_base,
        mm_addr_str(mm_weights_base),
        mm_addr_str(mm_weights_addr.saturating_sub(1)),
        mm_weights_addr - mm_weights_base,
    );
    Ok(())
}

/// Bytes of output space a layer requests; zero for layers whose output
/// aliases their input.
pub fn output_mm_size(net: &Net, id: LayerId) -> MmSize {
    let layer = net.layer(id);
    match layer.kind {
        LayerKind::Reshape | LayerKind::SliceChannel { .. } => 0,
        _ => {
            assert!(
                layer.out_dim.mm.layout_known,
                "output size of {} queried before memory layout",
                layer.full_name()
            );
            layer.out_dim.mm.size
        }
    }
}

/// Reserve the output block and derive everything that depends on it:
/// segment dimensions, DMA padding and the memory image.
pub fn set_output_mm_addr(net: &mut Net, id: LayerId, base_addr: MmAddr) -> Result<()> {
    if matches!(net.layer(id).kind, LayerKind::Reshape) {
        // output is an alias of the input; a dimensional change that would
        // require a real rearrangement is rejected at this stage
        let in_dim = net.src_dims(id).remove(0);
        let layer = net.layer_mut(id);
        if !layer.out_dim.algo_equal(&in_dim) {
            return Err(CompilerError::Unsupported {
                layer: layer.full_name(),
                reason: "reshape changing the memory arrangement is not implemented".into(),
            });
        }
        layer.out_dim.mm = in_dim.mm.clone();
        layer.out_dim.mm.layout_known = true;
        return Ok(());
    }

    let effective_base = match net.layer(id).kind {
        // output points into the input at the first sliced channel
        LayerKind::SliceChannel { start, .. } => net.src_dims(id)[0].channel_base(start as usize),
        _ => base_addr,
    };

    net.layer_mut(id).out_dim.mm.base = effective_base;

    // number of segments, their dimensions, and the chosen parallelism
    segmentation::set_segment_dimensions(net, id)?;
    net.layer_mut(id).seg.default_strides();

    compute_dma_padding(net, id);
    set_output_mem_dimensions(net, id);
    calc_output_mem_layout(net, id);

    net.layer_mut(id).out_dim.mm.layout_known = true;
    Ok(())
}

/// Derive the DMA padding from the algorithm padding and one segmentation
/// candidate. Garbage right of and below the segmented feature map extends
/// the pad; anything extending past the image start is clipped to zero.
pub fn derive_dma_padding(
    algo: &crate::graph::Pad,
    enabled: bool,
    seg: &crate::graph::SegDim,
    in_dim: &crate::graph::Dim,
) -> crate::graph::Pad {
    let mut dma = *algo;
    if enabled {
        // the segment grid may cover more pixels than the padded image; the
        // excess becomes extra right/bottom DMA padding (garbage). A stride
        // that discards padded pixels can also make it negative.
        let algo_in_x = in_dim.x + algo.left + algo.right;
        let impl_in_x = (seg.num_x - 1) * seg.in_x_stride + seg.in_w;
        dma.right = algo.right + (impl_in_x - algo_in_x);

        let algo_in_y = in_dim.y + algo.top + algo.bottom;
        let impl_in_y = (seg.num_y - 1) * seg.in_y_stride + seg.in_h;
        dma.bottom = algo.bottom + (impl_in_y - algo_in_y);
    }
    dma.top = dma.top.max(0);
    dma.right = dma.right.max(0);
    dma.bottom = dma.bottom.max(0);
    dma.left = dma.left.max(0);
    dma
}

/// Fix the layer's DMA padding once the segmentation is final.
pub fn compute_dma_padding(net: &mut Net, id: LayerId) {
    let in_dims = net.src_dims(id);
    let layer = net.layer_mut(id);

    match layer.kind {
        // transfers of these layers are runtime-sized, the static pad does
        // not apply
        LayerKind::Conv1d(_) | LayerKind::PointPillars(_) => return,
        _ => {}
    }

    assert!(layer.padding.enabled || layer.padding.algo.is_zero());

    layer.padding.dma = match in_dims.first() {
        Some(in_dim) => {
            derive_dma_padding(&layer.padding.algo, layer.padding.enabled, &layer.seg, in_dim)
        }
        None => layer.padding.algo,
    };

    // max pooling pads with the smallest representable value so the border
    // never wins the comparison
    if matches!(
        layer.kind,
        LayerKind::MaxPool2d(_) | LayerKind::GlobalMaxPool2d(_)
    ) {
        layer.padding.dma.value = i16::MIN;
    }
}

/// Set `out_dim.mm.(x|y)` from the segmentation.
fn set_output_mem_dimensions(net: &mut Net, id: LayerId) {
    let in_dims = net.src_dims(id);
    let layer = net.layer_mut(id);
    let seg = &layer.seg;

    match &layer.kind {
        LayerKind::GlobalAvgPool2d(_) | LayerKind::GlobalMaxPool2d(_) => {
            // segments produce intermediate data; the payload is one element
            // per channel
            layer.out_dim.mm.x = 1;
            layer.out_dim.mm.y = 1;
        }
        LayerKind::SliceChannel { .. } => {
            layer.out_dim.mm.x = in_dims[0].mm.x;
            layer.out_dim.mm.y = in_dims[0].mm.y;
        }
        LayerKind::Conv2d(p) if conv_1x1_fast_path(p, layer.groups, layer.parallel_outchannels_per_lane) => {
            // the 1D-equivalent segmentation propagates the garbage right of
            // the input image into the output
            assert!(
                layer.out_dim.x == in_dims[0].x,
                "garbage propagation from input to output failed"
            );
            layer.out_dim.mm.x = in_dims[0].mm.x;
            layer.out_dim.mm.y = layer.out_dim.y;
        }
        _ => {
            layer.out_dim.mm.x = seg.out_w + (seg.num_x - 1) * seg.out_x_stride;
            layer.out_dim.mm.y = seg.out_h + (seg.num_y - 1) * seg.out_y_stride;
        }
    }
}

/// Does this conv use the 1D fast path (1x1 kernel, unit stride, no
/// grouping, no fused pool/upsample) with multiple output channels per lane?
pub fn conv_1x1_fast_path(
    p: &crate::graph::layer::ConvParams,
    groups: i32,
    parallel_outchannels_per_lane: i32,
) -> bool {
    p.kernel_length == 1
        && p.fused.pool_size[0] == 1
        && p.stride == 1
        && groups == 1
        && parallel_outchannels_per_lane > 1
        && p.fused.upsampling_scale == 1
        && p.pre_zp.is_zero()
}

/// Derive `ch_size`, the per-channel base addresses and the total size from
/// `out_dim.mm.(x|y)`.
fn calc_output_mem_layout(net: &mut Net, id: LayerId) {
    let (clusters, units) = (net.arch.clusters, net.arch.units);
    let layer = net.layer_mut(id);
    let mm = &mut layer.out_dim.mm;

    mm.ch_size = (2 * mm.x * mm.y) as MmSize;
    mm.channel_base = (0..layer.out_dim.ch)
        .map(|oc| mm.base + oc as MmAddr * mm.ch_size)
        .collect();
    mm.size = layer.out_dim.ch as MmSize * mm.ch_size;

    if matches!(
        layer.kind,
        LayerKind::GlobalAvgPool2d(_) | LayerKind::GlobalMaxPool2d(_)
    ) {
        // reserve scratch for intermediate results: per channel, up to all
        // units used, one lane per unit, 48 bit partial sums
        let ch = layer.out_dim.ch as usize;
        let intermediate_ch_size = (3 * 2 * clusters * units) as MmSize;
        let mut next = mm.channel_base[ch - 1] + mm.ch_size;
        for _ in 0..ch {
            mm.channel_base.push(next);
            next += intermediate_ch_size;
        }
        mm.size += ch as MmSize * intermediate_ch_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::VproConfig;
    use crate::geometry;
    use crate::graph::layer::{ConvParams, Layer};
    use crate::graph::{Dim, Net};

    fn input(net: &mut Net, number: i32, x: i32, y: i32, ch: i32) -> LayerId {
        let mut l = Layer::new("in", number, LayerKind::Input);
        l.out_dim = Dim::new(x, y, ch);
        net.add_layer(l)
    }

    fn build_conv_net() -> (Net, LayerId, LayerId) {
        let mut net = Net::new("t", VproConfig::default());
        let a = input(&mut net, 0, 4, 4, 1);
        let mut conv = Layer::new(
            "c",
            1,
            LayerKind::Conv2d(ConvParams {
                kernel_length: 1,
                ..Default::default()
            }),
        );
        conv.out_dim.ch = 1;
        conv.weights.packed = vec![1];
        conv.weights.loaded = true;
        let c = net.add_layer(conv);
        net.add_src_layers(c, &[a]);
        geometry::process_params(&mut net, a).unwrap();
        geometry::process_params(&mut net, c).unwrap();
        (net, a, c)
    }

    #[test]
    fn planner_places_output_at_region_base() {
        let (mut net, a, c) = build_conv_net();
        design_mm_layout(&mut net).unwrap();
        assert_eq!(net.layer(a).out_dim.mm.base, 0x8100_0000);
        assert!(net.layer(a).out_dim.mm.layout_known);
        assert!(net.layer(c).out_dim.mm.base >= 0x8100_0000 + 32);
        assert_eq!(net.layer(c).weights.mm_addr, 0xA000_0000);
    }

    #[test]
    fn layout_reserves_at_least_the_payload() {
        let (mut net, _, c) = build_conv_net();
        design_mm_layout(&mut net).unwrap();
        let d = &net.layer(c).out_dim;
        assert!(d.mm.size >= (d.ch * 2 * d.x * d.y) as MmSize);
    }

    #[test]
    fn overflow_past_weight_region_is_fatal() {
        let (mut net, _, _) = build_conv_net();
        net.memlayout.mm_weights_base = 0x8100_0000;
        assert!(matches!(
            design_mm_layout(&mut net),
            Err(CompilerError::MemoryOverflow(_))
        ));
    }

    #[test]
    fn slice_channel_aliases_the_source() {
        let mut net = Net::new("t", VproConfig::default());
        let a = input(&mut net, 0, 4, 4, 8);
        let s = net.add_layer(Layer::new(
            "s",
            1,
            LayerKind::SliceChannel { start: 2, stop: 6 },
        ));
        net.add_src_layers(s, &[a]);
        geometry::process_params(&mut net, a).unwrap();
        geometry::process_params(&mut net, s).unwrap();
        design_mm_layout(&mut net).unwrap();

        let src = net.layer(a).out_dim.clone();
        let sliced = net.layer(s).out_dim.clone();
        assert_eq!(sliced.mm.base, src.channel_base(2));
        assert_eq!(sliced.channel_base(0), src.channel_base(2));
        assert_eq!(output_mm_size(&net, s), 0);
    }

    #[test]
    fn reshape_copies_the_source_descriptor() {
        let mut net = Net::new("t", VproConfig::default());
        let a = input(&mut net, 0, 4, 4, 2);
        let mut r = Layer::new("r", 1, LayerKind::Reshape);
        r.out_dim = Dim::new(4, 4, 2);
        let r = net.add_layer(r);
        net.add_src_layers(r, &[a]);
        geometry::process_params(&mut net, a).unwrap();
        geometry::process_params(&mut net, r).unwrap();
        design_mm_layout(&mut net).unwrap();
        assert_eq!(net.layer(r).out_dim.mm, net.layer(a).out_dim.mm);
    }

    #[test]
    fn global_pool_reserves_scratch() {
        let mut net = Net::new("t", VproConfig::default());
        let a = input(&mut net, 0, 7, 7, 128);
        let g = net.add_layer(Layer::new(
            "gap",
            1,
            LayerKind::GlobalAvgPool2d(Default::default()),
        ));
        net.add_src_layers(g, &[a]);
        geometry::process_params(&mut net, a).unwrap();
        geometry::process_params(&mut net, g).unwrap();
        design_mm_layout(&mut net).unwrap();

        let arch = net.arch;
        let l = net.layer(g);
        let payload = 128 * l.out_dim.mm.ch_size;
        let scratch = 128 * 3 * 2 * arch.clusters * arch.units;
        assert_eq!(l.out_dim.mm.size, payload + scratch);
        assert_eq!(l.out_dim.mm.channel_base.len(), 256);
    }
}
