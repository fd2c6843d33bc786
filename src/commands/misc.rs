//! Command emission for the post-processing layers without conv weights:
//! elementwise, pooling, global pooling, rearrangement and the point-cloud
//! front end.

use crate::arch::MmAddr;
use crate::bif::{CommandSegment, DmaCommand, DmaDirection, ScatterCommand, VproCommand, VproOp};
use crate::error::Result;
use crate::graph::config::Pad;
use crate::graph::layer::{FusedOps, LayerKind};
use crate::segmentation::factorize;
use crate::segments::{Segment, WorkSegment};

use super::{
    data_load_2d, data_store_2d, fused, next_hardware_element, run_double_buffered,
    set_lane_mask, start_broadcast_load, Buffer, CommandStream, DmaDescriptor,
    DoubleBufferEmitter, EmitView,
};

// ---------------------------------------------------------------------------
// elementwise (Add / Mul)

struct ElwiseEmitter<'a, 'v> {
    view: &'a EmitView<'v>,
    op: VproOp,
    fused: FusedOps,
}

pub fn emit_elementwise(view: &EmitView, stream: &mut CommandStream) -> Result<()> {
    let (op, fused) = match &view.layer.kind {
        LayerKind::Add(p) => (VproOp::Add, p.fused.clone()),
        LayerKind::Mul(p) => (VproOp::Mul, p.fused.clone()),
        _ => unreachable!(),
    };
    let mut em = ElwiseEmitter { view, op, fused };
    run_double_buffered(&mut em, stream, view.layer.segments.len())
}

impl<'a, 'v> ElwiseEmitter<'a, 'v> {
    fn bc_x(&self, src: usize) -> bool {
        self.view.in_dims[src].x < self.view.layer.out_dim.x
    }

    fn bc_y(&self, src: usize) -> bool {
        self.view.in_dims[src].y < self.view.layer.out_dim.y
    }

    fn bc_ch(&self, src: usize) -> bool {
        self.view.in_dims[src].ch < self.view.layer.out_dim.ch
    }

    /// Per-source tile load; broadcast dimensions shrink to one element.
    fn data_load(
        &self,
        seg: &WorkSegment,
        cluster: u32,
        unit: u32,
        buffer: Buffer,
        source: usize,
    ) -> DmaDescriptor {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        let mut dma = DmaDescriptor {
            dir: DmaDirection::E2L2D,
            cluster,
            unit,
            x_size: if self.bc_x(source) { 1 } else { seg_dim.in_w as u32 },
            y_size: if self.bc_y(source) { 1 } else { seg_dim.in_h as u32 },
            lm_addr: buffer.lm_offset(&view.arch)
                + source as u32 * (seg_dim.in_w * seg_dim.in_h) as u32,
            ..Default::default()
        };
        dma.apply_padded_segment(seg, source);
        dma
    }
}

impl<'a, 'v> DoubleBufferEmitter for ElwiseEmitter<'a, 'v> {
    fn stride(&self) -> usize {
        self.view.segs_per_set()
    }

    fn load(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let segments = &view.layer.segments;
        let mut dmas_2d = Vec::new();
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                dmas_2d.push(self.data_load(seg, cl, un, buffer, 0));
                dmas_2d.push(self.data_load(seg, cl, un, buffer, 1));
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        start_broadcast_load(stream, Vec::new(), dmas_2d);
        Ok(())
    }

    fn compute(
        &mut self,
        stream: &mut CommandStream,
        base: usize,
        buffer: Buffer,
        store_buffer: &mut Buffer,
    ) -> Result<()> {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        assert!(
            !view.layer.segments[base].is_dummy(),
            "elementwise sets start with real work"
        );

        let mut mem_layout = VproCommand {
            lane_mask: 1, // pooling, activation and the store run on L0 only
            xend: (seg_dim.out_w - 1) as u16,
            yend: (seg_dim.out_h - 1) as u16,
            rf_base: 0,
            lm_base: (buffer.index() * view.lm_half()) as u16,
            shift_right: self.fused.store_shift_right,
            rf_frac_bits: self.fused.rf_frac_bits,
            ..Default::default()
        };

        let mut cmd = mem_layout;
        cmd.command = self.op;
        cmd.broadcast_map = ((self.bc_ch(1) as u16) << 5)
            | ((self.bc_y(1) as u16) << 4)
            | ((self.bc_x(1) as u16) << 3)
            | ((self.bc_ch(0) as u16) << 2)
            | ((self.bc_y(0) as u16) << 1)
            | (self.bc_x(0) as u16);
        stream.push_vpro(cmd)?;

        fused::pool_activation(view, &self.fused, stream, &mut mem_layout)?;

        mem_layout.shift_right = self.fused.store_shift_right;
        let fused = self.fused.clone();
        let cmd = fused::shift_store(view, &fused, &mut mem_layout, store_buffer);
        stream.push_vpro(cmd)?;
        Ok(())
    }

    fn store(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let segments = &view.layer.segments;
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                if seg.last {
                    stream.push_dma(data_store_2d(view, seg, cl, un, ln, buffer));
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// average pooling

struct AvgPoolEmitter<'a, 'v> {
    view: &'a EmitView<'v>,
}

pub fn emit_avgpool(view: &EmitView, stream: &mut CommandStream) -> Result<()> {
    let mut em = AvgPoolEmitter { view };
    run_double_buffered(&mut em, stream, view.layer.segments.len())
}

impl<'a, 'v> AvgPoolEmitter<'a, 'v> {
    /// reciprocal divisor map, one tile per lane
    fn kernel_load(
        &self,
        seg: &WorkSegment,
        cluster: u32,
        unit: u32,
        lane: u32,
        buffer: Buffer,
    ) -> DmaDescriptor {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        let out_dim = &view.layer.out_dim;
        let map_x = seg.x_seg * seg_dim.out_w;
        let map_y = seg.y_seg * seg_dim.out_h;
        DmaDescriptor {
            dir: DmaDirection::E2L2D,
            cluster,
            unit,
            lm_addr: buffer.lm_offset(&view.arch) + view.lm_quarter()
                - (seg_dim.out_w * seg_dim.out_h) as u32 * (lane + 1),
            x_size: seg_dim.out_w as u32,
            y_size: seg_dim.out_h as u32,
            y_leap: out_dim.x - seg_dim.out_w + 1,
            mm_addr: (view.layer.weights.mm_addr
                + 2 * (map_y * out_dim.x + map_x) as MmAddr) as u64,
            ..Default::default()
        }
    }

    fn data_load(
        &self,
        seg: &WorkSegment,
        cluster: u32,
        unit: u32,
        lane: u32,
        buffer: Buffer,
    ) -> DmaDescriptor {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        let mut dma = DmaDescriptor {
            dir: DmaDirection::E2L2D,
            cluster,
            unit,
            lm_addr: buffer.lm_offset(&view.arch)
                + (seg_dim.in_w * seg_dim.in_h) as u32 * lane,
            x_size: seg_dim.in_w as u32,
            y_size: seg_dim.in_h as u32,
            ..Default::default()
        };
        dma.apply_padded_segment(seg, 0);
        dma
    }
}

impl<'a, 'v> DoubleBufferEmitter for AvgPoolEmitter<'a, 'v> {
    fn stride(&self) -> usize {
        self.view.segs_per_set()
    }

    fn load(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let segments = &view.layer.segments;
        let mut dmas_2d = Vec::with_capacity(2 * view.arch.parallel_lanes() as usize);
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                dmas_2d.push(self.kernel_load(seg, cl, un, ln, buffer));
                dmas_2d.push(self.data_load(seg, cl, un, ln, buffer));
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        start_broadcast_load(stream, Vec::new(), dmas_2d);
        Ok(())
    }

    fn compute(
        &mut self,
        stream: &mut CommandStream,
        base: usize,
        buffer: Buffer,
        store_buffer: &mut Buffer,
    ) -> Result<()> {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        if view.layer.segments[base].is_dummy() {
            return Ok(());
        }

        // single fused load-pool-store kernel, broadcast to all lanes
        *store_buffer = store_buffer.other();
        let cmd = VproCommand {
            command: VproOp::AvgPool2d,
            buffer: (buffer.index() * view.lm_half()) as u16,
            offset: (store_buffer.lm_offset(&view.arch) + view.lm_quarter()) as u16,
            xend: seg_dim.out_w as u16,
            yend: seg_dim.out_h as u16,
            lane_mask: 0,
            kernel_load_buffer_l0: (buffer.lm_offset(&view.arch) + view.lm_quarter()
                - (seg_dim.out_w * seg_dim.out_h) as u32) as u16,
            kernel_load_buffer_l1: (buffer.lm_offset(&view.arch) + view.lm_quarter()
                - 2 * (seg_dim.out_w * seg_dim.out_h) as u32) as u16,
            ..Default::default()
        };
        stream.push_vpro(cmd)?;
        Ok(())
    }

    fn store(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let segments = &view.layer.segments;
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                if seg.last {
                    stream.push_dma(data_store_2d(view, seg, cl, un, ln, buffer));
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// global pooling

struct GlobalPoolEmitter<'a, 'v> {
    view: &'a EmitView<'v>,
    is_avg: bool,
    lanes_per_ch: i32,
    pre_shift_right: i16,
    multiplier: i16,
    store_shift_right: i16,
}

pub fn emit_global_pool(view: &EmitView, stream: &mut CommandStream) -> Result<()> {
    let (is_avg, p) = match &view.layer.kind {
        LayerKind::GlobalAvgPool2d(p) => (true, p),
        LayerKind::GlobalMaxPool2d(p) => (false, p),
        _ => unreachable!(),
    };
    let mut em = GlobalPoolEmitter {
        view,
        is_avg,
        lanes_per_ch: p.lanes_per_ch,
        pre_shift_right: p.pre_shift_right,
        multiplier: p.multiplier,
        store_shift_right: p.store_shift_right,
    };
    run_double_buffered(&mut em, stream, view.layer.segments.len())
}

impl<'a, 'v> DoubleBufferEmitter for GlobalPoolEmitter<'a, 'v> {
    fn stride(&self) -> usize {
        self.view.arch.parallel_lanes() as usize
    }

    fn load(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let segments = &view.layer.segments;
        let mut dmas_2d = Vec::new();
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                debug_assert_eq!(ln, 0, "global pooling uses L0 only");
                dmas_2d.push(data_load_2d(view, seg, cl, un, buffer, 0));
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        start_broadcast_load(stream, Vec::new(), dmas_2d);
        Ok(())
    }

    fn compute(
        &mut self,
        stream: &mut CommandStream,
        base: usize,
        buffer: Buffer,
        store_buffer: &mut Buffer,
    ) -> Result<()> {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        let proto = view.layer.segments[base]
            .work()
            .expect("global pooling maps the first channel of each group to lane 0");

        // per-tile accumulation with factorised 3D addressing
        let (x, y, z) = factorize(seg_dim.in_w * seg_dim.in_h, view.arch.lm_size)
            .expect("segmentation guaranteed a factorisable tile");
        let cmd = VproCommand {
            command: match (self.is_avg, proto.first) {
                (true, true) => VproOp::GlobalAvgPool2dStart,
                (true, false) => VproOp::GlobalAvgPool2dAdd,
                (false, true) => VproOp::GlobalMaxPool2dStart,
                (false, false) => VproOp::GlobalMaxPool2dAdd,
            },
            lane_mask: 1, // L0 only
            lm_base: (buffer.index() * view.lm_half()) as u16,
            xend: (x - 1) as u16,
            yend: (y - 1) as u16,
            zend: (z - 1) as u16,
            ..Default::default()
        };
        stream.push_vpro(cmd)?;

        if proto.last && self.lanes_per_ch == 1 {
            // per-channel reduction: divide for average, plain store for max
            *store_buffer = store_buffer.other();
            let cmd = VproCommand {
                command: if self.is_avg {
                    VproOp::GlobalAvgPool2dDivide
                } else {
                    VproOp::GlobalMaxPool2dStore
                },
                lm_base: (store_buffer.lm_offset(&view.arch) + view.lm_quarter()) as u16,
                pre_shift_right: self.pre_shift_right,
                multiplier: self.multiplier,
                shift_right: self.store_shift_right,
                ..Default::default()
            };
            stream.push_vpro(cmd)?;
        }
        Ok(())
    }

    fn store(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let segments = &view.layer.segments;
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                if seg.last {
                    stream.push_dma(data_store_2d(view, seg, cl, un, ln, buffer));
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// concatenate

/// Channel concatenation copies tiles source-by-source; a shift harmonises
/// the fixed-point formats when they differ.
pub fn emit_concat(view: &EmitView, stream: &mut CommandStream) -> Result<()> {
    let layer = view.layer;
    let p = match &layer.kind {
        LayerKind::Concatenate(p) => p,
        _ => unreachable!(),
    };
    let clusters = view.arch.clusters as usize;
    let seg_dim = &layer.seg;

    let mut buffer_load = Buffer::A;
    let mut buffer_calc = Buffer::A;

    let mut base = 0usize;
    while base < layer.segments.len() {
        // load one tile per cluster
        let mut dmas_2d = Vec::new();
        for cl in 0..clusters {
            if let Segment::Work(seg) = &layer.segments[base + cl] {
                dmas_2d.push(data_load_2d(view, seg, cl as u32, 0, buffer_load, 0));
            }
        }
        start_broadcast_load(stream, Vec::new(), dmas_2d);
        stream.push_dma_wait();

        // shift only when the source's fixed point format differs
        let mut processed = false;
        if let Segment::Work(seg) = &layer.segments[base] {
            let shift = p.in_shifts_right[p.oc_to_src_map[seg.out_channel as usize]];
            if shift != 0 {
                let cmd = VproCommand {
                    command: VproOp::Concatenate,
                    buffer: (buffer_calc.index() * view.lm_half()) as u16,
                    offset: (buffer_calc.lm_offset(&view.arch) + view.lm_quarter()) as u16,
                    xend: (seg_dim.out_w - 1) as u16,
                    yend: (seg_dim.out_h - 1) as u16,
                    shift_right: shift,
                    ..Default::default()
                };
                stream.push_vpro(cmd)?;
                processed = true;
            }
        }
        stream.push_both_sync();

        for cl in 0..clusters {
            if let Segment::Work(seg) = &layer.segments[base + cl] {
                let mut cmd = data_store_2d(view, seg, cl as u32, 0, 0, buffer_calc);
                if !processed {
                    // unshifted tiles are stored straight from the load region
                    cmd.lm_addr -= view.lm_quarter();
                }
                stream.push_dma(cmd);
            }
        }

        buffer_load = buffer_load.other();
        buffer_calc = buffer_calc.other();
        base += clusters;
    }
    stream.push_dma_wait();
    Ok(())
}

// ---------------------------------------------------------------------------
// depth to space

/// Block-interleaved copy; each cluster moves one input tile, the VPRO
/// kernel rearranges the four block pixels in LM.
pub fn emit_depth_to_space(view: &EmitView, stream: &mut CommandStream) -> Result<()> {
    let layer = view.layer;
    let block_size = match &layer.kind {
        LayerKind::DepthToSpace(p) => p.block_size,
        _ => unreachable!(),
    };
    let clusters = view.arch.clusters as usize;
    let seg_dim = &layer.seg;
    let group = (block_size * block_size) as usize;
    let stride = clusters * group;

    let mut base = 0usize;
    while base < layer.segments.len() {
        for ic in 0..group {
            for cl in 0..clusters {
                if let Segment::Work(seg) = &layer.segments[base + ic * clusters + cl] {
                    stream.push_dma(DmaCommand {
                        direction: DmaDirection::E2L2D,
                        cluster_mask: 1 << cl,
                        unit_mask: 1,
                        mm_addr: seg.in_mm_base[0],
                        lm_addr: ((seg.in_channel as usize % group) as i32
                            * seg_dim.in_w
                            * seg_dim.in_h) as u32,
                        x_size: seg_dim.in_w as u16,
                        y_size: seg_dim.in_h as u16,
                        y_leap: seg.in_mm_y_stride[0] - seg_dim.in_w + 1,
                        ..Default::default()
                    });
                }
            }
        }
        stream.push_dma_wait();

        stream.push_vpro(VproCommand {
            command: VproOp::DepthToSpace,
            buffer: 0,
            xend: 1,
            yend: 1,
            ..Default::default()
        })?;
        stream.push_vpro_sync();

        for ic in 0..group {
            for cl in 0..clusters {
                if let Segment::Work(seg) = &layer.segments[base + ic * clusters + cl] {
                    let x_size = (seg_dim.in_w * seg_dim.in_h) as u16;
                    stream.push_dma(DmaCommand {
                        direction: DmaDirection::L2E2D,
                        cluster_mask: 1 << cl,
                        unit_mask: 1,
                        mm_addr: seg.out_mm_base,
                        lm_addr: ((seg.in_channel as usize % group) as i32
                            * seg_dim.in_w
                            * seg_dim.in_h) as u32,
                        x_size,
                        y_size: 1,
                        y_leap: seg.out_mm_y_stride - x_size as i32 + 1,
                        ..Default::default()
                    });
                }
            }
        }
        stream.push_dma_wait();
        base += stride;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// scatter to grid

/// One scatter record per output channel; the host core replays them, so
/// there is nothing to double-buffer or compress.
pub fn emit_scatter(view: &EmitView, stream: &mut CommandStream) -> Result<()> {
    let layer = view.layer;
    let p = match &layer.kind {
        LayerKind::ScatterToGrid(p) => p,
        _ => unreachable!(),
    };
    for oc in 0..layer.out_dim.ch as usize {
        stream.push_raw(CommandSegment::Scatter(ScatterCommand {
            index_shift: p.index_shift,
            xmin_fixed: p.xmin_fixed,
            ymin_fixed: p.ymin_fixed,
            memcopy_size: p.memcopy_size,
            use_vpro_dma: p.use_vpro_dma as u16,
            mm_addr_coords: view.in_dims[0].mm.base,
            mm_addr_features: view.in_dims[1].channel_base(oc),
            mm_addr_grid: layer.out_dim.channel_base(oc),
        }));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// point pillars

struct PointPillarsEmitter<'a, 'v> {
    view: &'a EmitView<'v>,
    kernel_length: i32,
    use_bias: bool,
    fused: FusedOps,
    n_in_channels: i32,
    max_points_per_seg: i32,
    use_segmentwise_multicast: bool,
    // index buffers change only when the output channel is done
    buffer_indices_load: Buffer,
    buffer_indices_calc: Buffer,
}

pub fn emit_pointpillars(view: &EmitView, stream: &mut CommandStream) -> Result<()> {
    let p = match &view.layer.kind {
        LayerKind::PointPillars(p) => p,
        _ => unreachable!(),
    };
    let mut em = PointPillarsEmitter {
        view,
        kernel_length: p.conv.kernel_length,
        use_bias: p.conv.use_bias,
        fused: p.conv.fused.clone(),
        n_in_channels: view.in_dims[0].ch,
        max_points_per_seg: p.max_points_per_seg,
        use_segmentwise_multicast: p.use_segmentwise_multicast,
        buffer_indices_load: Buffer::A,
        buffer_indices_calc: Buffer::A,
    };
    run_double_buffered(&mut em, stream, view.layer.segments.len())
}

impl<'a, 'v> PointPillarsEmitter<'a, 'v> {
    fn flat_segment_index(&self, seg: &WorkSegment) -> i32 {
        seg.y_seg * self.view.layer.seg.num_x + seg.x_seg
    }

    fn kernel_load(
        &self,
        seg: &WorkSegment,
        cluster: u32,
        unit: u32,
        lane: u32,
        buffer: Buffer,
    ) -> DmaDescriptor {
        let view = self.view;
        let layer = view.layer;
        let lm_partition_end = (buffer.index() + 1) * view.lm_half();
        DmaDescriptor {
            dir: DmaDirection::E2L2D,
            cluster,
            unit,
            lm_addr: lm_partition_end
                - (self.n_in_channels * (lane as i32 + 1) * self.kernel_length) as u32,
            x_size: self.kernel_length as u32,
            y_size: self.n_in_channels as u32,
            y_leap: layer.out_dim.ch * self.kernel_length,
            is_kernel_offset: true,
            mm_addr: (layer.weights.mm_addr
                + 2 * (self.kernel_length
                    * (seg.out_channel + layer.out_dim.ch * seg.in_channel))
                    as MmAddr) as u64,
            ..Default::default()
        }
    }

    fn bias_load(
        &self,
        seg: &WorkSegment,
        cluster: u32,
        unit: u32,
        lane: u32,
        buffer: Buffer,
    ) -> DmaDescriptor {
        let view = self.view;
        let layer = view.layer;
        let lm_partition_end = (buffer.index() + 1) * view.lm_half();
        DmaDescriptor {
            dir: DmaDirection::E2L1D,
            cluster,
            unit,
            lm_addr: lm_partition_end
                - (2 * self.n_in_channels * self.kernel_length) as u32
                - 1
                - lane,
            word_count: 1,
            is_bias_offset: true,
            mm_addr: (layer.weights.mm_addr
                + 2 * (layer.out_dim.ch * self.n_in_channels * self.kernel_length
                    + seg.out_channel) as MmAddr) as u64,
            ..Default::default()
        }
    }

    /// Runtime-sized transfer: the word count comes from the per-segment
    /// point count, the segment index travels in the row leap.
    fn dynamic_data_load(
        &self,
        seg: &WorkSegment,
        cluster: u32,
        unit: u32,
        buffer: Buffer,
        is_input_feature: bool,
    ) -> DmaDescriptor {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        let lm_offset = buffer.lm_offset(&view.arch);
        let (mm_addr, lm_addr) = if is_input_feature {
            // per-channel feature base; segment offset resolved at runtime
            (seg.in_mm_base[0] as u64, lm_offset + self.max_points_per_seg as u32)
        } else {
            // grid indices behind the per-segment point counts
            (
                seg.in_mm_base[1] as u64 + 2 * (seg_dim.num_x * seg_dim.num_y) as u64,
                lm_offset,
            )
        };
        DmaDescriptor {
            dir: DmaDirection::E2L2D,
            cluster,
            unit,
            x_size: 0,
            y_size: 1,
            y_leap: self.flat_segment_index(seg),
            mm_addr,
            lm_addr,
            ..Default::default()
        }
    }

    fn conv_vpro(
        &self,
        seg: &WorkSegment,
        buffer: Buffer,
        lane_mask: u16,
        mem_layout: &mut VproCommand,
    ) -> VproCommand {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        let lm_partition_end = (buffer.index() + 1) * view.lm_half();
        let n_ch = self.n_in_channels;
        let ch_off = seg.in_channel;

        let mut cmd = VproCommand {
            command: if seg.first {
                VproOp::Conv1dStart
            } else {
                VproOp::Conv1dAdd
            },
            // grid indices occupy the first max_points entries
            lm_base: (buffer.index() * view.lm_half() + self.max_points_per_seg as u32) as u16,
            // first RF entries hold the scattered 2D output segment
            rf_base: (seg_dim.out_w * seg_dim.out_h) as u16,
            in_ch_offset: ch_off as u16,
            zend: (self.max_points_per_seg - 1) as u16,
            lane_mask,
            ..Default::default()
        };
        cmd.kernel_load_buffer_l0 =
            (lm_partition_end - ((n_ch - ch_off) * self.kernel_length) as u32) as u16;
        cmd.kernel_load_buffer_l1 =
            (lm_partition_end - (2 * (n_ch - ch_off) * self.kernel_length) as u32) as u16;
        if seg.first {
            cmd.bias_load_buffer_l0 = cmd.kernel_load_buffer_l1 - 1;
            cmd.bias_load_buffer_l1 = cmd.kernel_load_buffer_l1 - 2;
        }

        mem_layout.lane_mask = lane_mask;
        mem_layout.xend = 0;
        mem_layout.yend = 0;
        mem_layout.zend = cmd.zend;
        mem_layout.rf_base = cmd.rf_base;
        mem_layout.rf_ch_stride = 1;
        mem_layout.lm_ch_stride = 1;
        mem_layout.lm_base = cmd.lm_base;
        mem_layout.shift_right = self.fused.store_shift_right;
        mem_layout.rf_frac_bits = self.fused.rf_frac_bits;
        cmd
    }

    /// Activation, max pooling into the grid and the scatter back to LM in
    /// one fused kernel.
    fn relu_pool_scatter(
        &mut self,
        stream: &mut CommandStream,
        mem_layout: &mut VproCommand,
    ) -> Result<()> {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        let mut cmd = *mem_layout;
        cmd.command = VproOp::ReluPoolScatter;
        // results land behind grid indices and features
        cmd.lm_base = mem_layout.lm_base + 2 * self.max_points_per_seg as u16;
        cmd.pp_index_buffer =
            (self.buffer_indices_calc.index() * view.lm_half()) as u16;
        stream.push_vpro(cmd)?;

        // memory layout of the scattered 2D output segment
        mem_layout.rf_base = 0;
        mem_layout.lm_base = cmd.lm_base;
        mem_layout.lm_lane_stride = (seg_dim.out_h * seg_dim.out_w) as u16;
        mem_layout.xend = 0;
        mem_layout.yend = 0;
        mem_layout.zend = (seg_dim.out_h * seg_dim.out_w - 1) as u16;
        Ok(())
    }

    fn reset_indices(&self, stream: &mut CommandStream) -> Result<()> {
        // lanes with fewer points compute garbage at the vector end; resetting
        // the indices scatters it to the RF discard address
        stream.push_vpro(VproCommand {
            command: VproOp::ResetIndices,
            lm_base: (self.buffer_indices_load.index() * self.view.lm_half()) as u16,
            zend: (self.max_points_per_seg - 1) as u16,
            ..Default::default()
        })?;
        stream.push_vpro_sync();
        Ok(())
    }
}

impl<'a, 'v> DoubleBufferEmitter for PointPillarsEmitter<'a, 'v> {
    fn stride(&self) -> usize {
        self.view.arch.parallel_lanes() as usize
    }

    fn load(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let segments = &view.layer.segments;

        if !self.use_segmentwise_multicast {
            if let Segment::Work(first) = &segments[base] {
                if first.first {
                    self.reset_indices(stream)?;
                }
            }
        }

        let mut dmas_1d = Vec::new();
        let mut dmas_2d = Vec::new();
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                if seg.first {
                    dmas_2d.push(self.kernel_load(seg, cl, un, ln, buffer));
                    if self.use_bias {
                        dmas_1d.push(self.bias_load(seg, cl, un, ln, buffer));
                    }
                    if ln == 0 {
                        dmas_2d.push(self.dynamic_data_load(
                            seg,
                            cl,
                            un,
                            self.buffer_indices_load,
                            false,
                        ));
                    }
                }
                if ln == 0 {
                    dmas_2d.push(self.dynamic_data_load(seg, cl, un, buffer, true));
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }

        if let Segment::Work(first) = &segments[base] {
            if first.last {
                self.buffer_indices_load = self.buffer_indices_load.other();
            }
        }

        start_broadcast_load(stream, dmas_1d, dmas_2d);
        Ok(())
    }

    fn compute(
        &mut self,
        stream: &mut CommandStream,
        base: usize,
        buffer: Buffer,
        store_buffer: &mut Buffer,
    ) -> Result<()> {
        let view = self.view;
        let segments = &view.layer.segments;
        let lanes = view.arch.lanes as usize;
        let units = view.arch.units as usize;
        let clusters = view.arch.clusters as usize;

        let lane_mask = set_lane_mask(view, segments, base);

        if self.use_segmentwise_multicast {
            // commands are multicast per grid segment so each unit can use
            // its own runtime vector length
            let total = view.arch.parallel_lanes() as usize;
            let mut si = base;
            let mut last_proto: Option<WorkSegment> = None;
            while si < base + total {
                let start = segments[base..base + total]
                    .iter()
                    .skip(si - base)
                    .find_map(|s| s.work());
                let anchor = match start {
                    Some(a) => a.clone(),
                    None => break,
                };

                let mut unit_mask = 0u16;
                let mut cluster_mask = 0u16;
                while si < base + total {
                    let slot = &segments[si];
                    let same_tile = match slot.work() {
                        Some(w) => w.x_seg == anchor.x_seg && w.y_seg == anchor.y_seg,
                        None => true,
                    };
                    if !same_tile {
                        break;
                    }
                    if let Some(w) = slot.work() {
                        debug_assert_eq!(w.x_seg, anchor.x_seg);
                        let lane_index = si - base;
                        let unit = (lane_index / lanes) % units;
                        let cluster = (lane_index / (lanes * units)) % clusters;
                        unit_mask |= 1 << unit;
                        cluster_mask |= 1 << cluster;
                    }
                    si += 1;
                }

                if unit_mask != 0 && cluster_mask != 0 {
                    stream.push_vpro(VproCommand {
                        command: VproOp::SetMasks,
                        cluster_mask,
                        unit_mask,
                        offset: self.flat_segment_index(&anchor) as u16,
                        ..Default::default()
                    })?;
                    let mut mem_layout = VproCommand::default();
                    stream.push_vpro(self.conv_vpro(&anchor, buffer, lane_mask, &mut mem_layout))?;
                    if anchor.last {
                        self.relu_pool_scatter(stream, &mut mem_layout)?;
                        let fused = self.fused.clone();
                        let cmd =
                            fused::shift_store(view, &fused, &mut mem_layout, store_buffer);
                        stream.push_vpro(cmd)?;
                    }
                }
                last_proto = Some(anchor);
            }

            // back to broadcasting for the following layers
            if let Some(anchor) = last_proto {
                stream.push_vpro(VproCommand {
                    command: VproOp::SetMasks,
                    cluster_mask: 0xffff,
                    unit_mask: 0xffff,
                    offset: self.flat_segment_index(&anchor) as u16,
                    ..Default::default()
                })?;
            }
        } else {
            let proto = segments[base]
                .work()
                .cloned()
                .expect("broadcast point-pillars sets start with real work");
            let mut mem_layout = VproCommand::default();
            stream.push_vpro(self.conv_vpro(&proto, buffer, lane_mask, &mut mem_layout))?;
            if proto.last {
                self.relu_pool_scatter(stream, &mut mem_layout)?;
                let fused = self.fused.clone();
                // the store buffer toggle must reach the driver: the DMA
                // store of this iteration reads the half shift_store wrote
                let cmd = fused::shift_store(view, &fused, &mut mem_layout, store_buffer);
                stream.push_vpro(cmd)?;
            }
        }

        if let Segment::Work(first) = &segments[base] {
            if first.last {
                self.buffer_indices_calc = self.buffer_indices_calc.other();
            }
        }
        Ok(())
    }

    fn store(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        let segments = &view.layer.segments;
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                if seg.last {
                    let mut cmd = data_store_2d(view, seg, cl, un, ln, buffer);
                    // output sits behind indices and features in LM
                    cmd.lm_addr = buffer.lm_offset(&view.arch)
                        + view.lm_quarter()
                        + 2 * self.max_points_per_seg as u32
                        + ln * (seg_dim.out_h * seg_dim.out_w) as u32;
                    stream.push_dma(cmd);
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// deformable convolution: deform stage

struct DConvDeformEmitter<'a, 'v> {
    view: &'a EmitView<'v>,
    kernel_size: i32,
    max_offset_x: i32,
    max_offset_y: i32,
}

pub fn emit_dconv_deform(view: &EmitView, stream: &mut CommandStream) -> Result<()> {
    let p = match &view.layer.kind {
        LayerKind::DConvDeform(p) => p.clone(),
        _ => unreachable!(),
    };
    let mut em = DConvDeformEmitter {
        view,
        kernel_size: p.kernel_size,
        max_offset_x: p.max_offset_x,
        max_offset_y: p.max_offset_y,
    };
    run_double_buffered(&mut em, stream, view.layer.segments.len())
}

impl<'a, 'v> DConvDeformEmitter<'a, 'v> {
    // local memory layout (per buffer half where double buffered):
    //   inputs (with offset margin) | offsets | outputs | static offsets
    fn lm_input_size(&self) -> u32 {
        let seg = &self.view.layer.seg;
        ((seg.in_w + 2 * self.max_offset_x) * (seg.in_h + 2 * self.max_offset_y)) as u32
    }

    fn lm_offset_size(&self) -> u32 {
        let seg = &self.view.layer.seg;
        (seg.in_w * seg.in_h * 3 * self.kernel_size) as u32
    }

    fn lm_output_size(&self) -> u32 {
        let seg = &self.view.layer.seg;
        (seg.out_w * seg.out_h) as u32
    }

    fn lm_static_offset_size(&self) -> u32 {
        let seg = &self.view.layer.seg;
        (seg.in_w * seg.in_h * self.kernel_size) as u32
    }

    fn lm_input_addr(&self, buffer: Buffer) -> u32 {
        buffer.index() * self.lm_input_size()
    }

    fn lm_offset_addr(&self, buffer: Buffer) -> u32 {
        2 * self.lm_input_size() + buffer.index() * self.lm_offset_size()
    }

    fn lm_output_addr(&self, buffer: Buffer) -> u32 {
        2 * (self.lm_input_size() + self.lm_offset_size()) + buffer.index() * self.lm_output_size()
    }

    fn lm_static_offset_addr(&self) -> u32 {
        2 * (self.lm_input_size() + self.lm_offset_size() + self.lm_output_size())
    }

    fn static_offset_load(&self, cluster: u32, unit: u32) -> DmaDescriptor {
        DmaDescriptor {
            dir: DmaDirection::E2L1D,
            cluster,
            unit,
            word_count: self.lm_static_offset_size(),
            lm_addr: self.lm_static_offset_addr(),
            mm_addr: self.view.layer.weights.mm_addr as u64,
            ..Default::default()
        }
    }

    fn input_load(
        &self,
        seg: &WorkSegment,
        pad: Pad,
        cluster: u32,
        unit: u32,
        buffer: Buffer,
    ) -> DmaDescriptor {
        let mut dma = data_load_2d(self.view, seg, cluster, unit, buffer, 0);
        let input_dim = &self.view.in_dims[0];

        // widen the tile by the offset margin, minus what the runtime pads
        dma.mm_addr -= 2 * (self.max_offset_x - pad.left) as u64;
        dma.mm_addr -= 2 * ((self.max_offset_y - pad.top) * input_dim.mm.x) as u64;
        dma.x_size += 2 * self.max_offset_x as u32;
        dma.y_size += 2 * self.max_offset_y as u32;
        dma.y_leap -= 2 * self.max_offset_x - pad.left - pad.right;

        dma.lm_addr = self.lm_input_addr(buffer);
        dma
    }

    /// Interleaves the offset rows at y = row for all offset channels.
    fn offset_load(
        &self,
        seg: &WorkSegment,
        row: i32,
        cluster: u32,
        unit: u32,
        buffer: Buffer,
    ) -> DmaDescriptor {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        let offset_dim = &view.in_dims[1];
        let x_size = seg_dim.in_w as u32;
        DmaDescriptor {
            dir: DmaDirection::E2L2D,
            cluster,
            unit,
            x_size,
            y_size: offset_dim.ch as u32,
            y_leap: seg.in_mm_y_stride[1] - x_size as i32 + 1,
            mm_addr: seg.in_mm_base[1] as u64 + 2 * (row * offset_dim.x) as u64,
            lm_addr: self.lm_offset_addr(buffer)
                + (row * seg_dim.in_w * offset_dim.ch) as u32,
            ..Default::default()
        }
    }
}

impl<'a, 'v> DoubleBufferEmitter for DConvDeformEmitter<'a, 'v> {
    fn stride(&self) -> usize {
        self.view.arch.parallel_lanes() as usize
    }

    fn load(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let seg_dim = &view.layer.seg;
        let segments = &view.layer.segments;
        let input_dim = &view.in_dims[0];

        // the whole set shares one (x, y) tile; derive the runtime pad from
        // its position
        let mut pad = Pad::default();
        if let Some(proto) = segments[base..base + self.stride()].iter().find_map(|s| s.work()) {
            let x = proto.x_seg * seg_dim.in_w;
            let y = proto.y_seg * seg_dim.in_h;
            pad.left = (self.max_offset_x - x).max(0);
            pad.right = (x + seg_dim.in_w + self.max_offset_x - input_dim.x).max(0);
            pad.top = (self.max_offset_y - y).max(0);
            pad.bottom = (y + seg_dim.in_h + self.max_offset_y - input_dim.y).max(0);
            stream.push_raw(CommandSegment::DmaSetPadding(pad));
        }

        let mut dmas_1d = Vec::new();
        let mut dmas_2d = Vec::new();
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            let slot = &segments[base + i];
            if ln == 0 {
                // deform occupies both lanes of a unit; work is seeded on L0
                if base == 0 {
                    dmas_1d.push(self.static_offset_load(cl, un));
                }
                if let Segment::Work(seg) = slot {
                    dmas_2d.push(self.input_load(seg, pad, cl, un, buffer));
                    for row in 0..seg_dim.out_h {
                        dmas_2d.push(self.offset_load(seg, row, cl, un, buffer));
                    }
                }
            } else {
                debug_assert!(slot.is_dummy());
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }

        start_broadcast_load(stream, dmas_1d, dmas_2d);
        Ok(())
    }

    fn compute(
        &mut self,
        stream: &mut CommandStream,
        _base: usize,
        buffer: Buffer,
        store_buffer: &mut Buffer,
    ) -> Result<()> {
        stream.push_vpro(VproCommand {
            command: VproOp::DconvDeform8x8,
            buffer: self.lm_input_addr(buffer) as u16,
            deform_offset_buffer: self.lm_offset_addr(buffer) as u16,
            deform_output_buffer: self.lm_output_addr(buffer) as u16,
            ..Default::default()
        })?;
        // results stay in the buffer that was computed from
        *store_buffer = buffer;
        Ok(())
    }

    fn store(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let segments = &view.layer.segments;
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if ln == 0 {
                if let Segment::Work(seg) = &segments[base + i] {
                    let mut cmd = data_store_2d(view, seg, cl, un, ln, buffer);
                    cmd.lm_addr = self.lm_output_addr(buffer);
                    stream.push_dma(cmd);
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        Ok(())
    }
}
