//! Segment generation: distribute a layer's tiles to the physical lanes.
//!
//! The generator produces a flat list laid out as
//! `seg 0 lane 0, seg 0 lane 1, ..., seg 0 lane n-1, seg 1 lane 0, ...`
//! where n is `parallel_lanes * parallel_outchannels_per_lane`. Dummy
//! entries keep all lanes in lockstep when a unit has no real work.

use std::collections::VecDeque;

use crate::arch::{MmAddr, VproConfig};
use crate::error::Result;
use crate::graph::config::SchedulingOrder;
use crate::graph::dim::Dim;
use crate::graph::layer::{Layer, LayerKind};
use crate::graph::Net;
use crate::graph::LayerId;
use crate::utils::ceil_div;

/// One tile of work on one lane.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkSegment {
    pub x_seg: i32,
    pub y_seg: i32,
    /// which input channel this accumulation step reads
    pub in_channel: i32,
    pub out_channel: i32,

    /// byte address of the top-left pixel of the padded input tile, per source
    pub in_mm_base: Vec<MmAddr>,
    /// MM distance of two vertically adjacent pixels, in elements, per source
    pub in_mm_y_stride: Vec<i32>,

    pub out_mm_base: MmAddr,
    pub out_mm_y_stride: i32,

    /// first accumulation step: bias is loaded, accumulator initialised
    pub first: bool,
    /// final step: result is activated/pooled/stored
    pub last: bool,

    /// does this tile touch a padded edge (runtime materialises the pixels)
    pub pad_top: bool,
    pub pad_right: bool,
    pub pad_bottom: bool,
    pub pad_left: bool,
}

/// A lane slot: either real work or a filler that keeps the lane
/// synchronised without writing back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    Dummy,
    Work(WorkSegment),
}

impl Segment {
    pub fn is_dummy(&self) -> bool {
        matches!(self, Segment::Dummy)
    }

    pub fn work(&self) -> Option<&WorkSegment> {
        match self {
            Segment::Dummy => None,
            Segment::Work(w) => Some(w),
        }
    }

    /// Single-line dump for `generated/segments.txt`.
    pub fn short_string(&self) -> String {
        match self {
            Segment::Dummy => "D".to_string(),
            Segment::Work(s) => {
                let mut line = format!(
                    " {}{} xy({:3}, {:3}), in ch {:2} @ 0x{:08x} s {:4}",
                    if s.first { "F" } else { " " },
                    if s.last { "L" } else { " " },
                    s.x_seg,
                    s.y_seg,
                    s.in_channel,
                    s.in_mm_base[0],
                    s.in_mm_y_stride[0],
                );
                for i in 1..s.in_mm_base.len() {
                    line += &format!(", 0x{:08x} s {:4}", s.in_mm_base[i], s.in_mm_y_stride[i]);
                }
                line += &format!(
                    ", out ch {:2} @ 0x{:08x} s {:4}, pad trbl {}{}{}{}",
                    s.out_channel,
                    s.out_mm_base,
                    s.out_mm_y_stride,
                    s.pad_top as u8,
                    s.pad_right as u8,
                    s.pad_bottom as u8,
                    s.pad_left as u8
                );
                line
            }
        }
    }
}

/// Read-only context for building one layer's segments.
pub struct SegCtx<'a> {
    pub layer: &'a Layer,
    pub in_dims: &'a [Dim],
    pub arch: &'a VproConfig,
}

impl<'a> SegCtx<'a> {
    pub fn new(layer: &'a Layer, in_dims: &'a [Dim], arch: &'a VproConfig) -> Self {
        SegCtx {
            layer,
            in_dims,
            arch,
        }
    }

    fn is_elwise(&self) -> bool {
        matches!(self.layer.kind, LayerKind::Add(_) | LayerKind::Mul(_))
    }

    /// Source x*y smaller than the output: that dimension is broadcast.
    pub fn bc_x(&self, src_idx: usize) -> bool {
        self.in_dims[src_idx].x < self.layer.out_dim.x
    }

    pub fn bc_y(&self, src_idx: usize) -> bool {
        self.in_dims[src_idx].y < self.layer.out_dim.y
    }

    pub fn bc_ch(&self, src_idx: usize) -> bool {
        self.in_dims[src_idx].ch < self.layer.out_dim.ch
    }

    /// Conv input is the padded feature map: shift from the top left of the
    /// unpadded image to the top left of the padded image.
    pub fn padded_in_mm_base(&self, src_idx: usize, ch: i32) -> MmAddr {
        let pad = &self.layer.padding.dma;
        let shift = 2 * (self.in_dims[0].mm.x * pad.top + pad.left);
        self.in_dims[src_idx].channel_base(ch as usize) - shift as MmAddr
    }

    /// Lowest input channel used by `out_ch` (group arithmetic).
    pub fn first_input_channel(&self, _x: i32, _y: i32, out_ch: i32) -> i32 {
        if self.is_elwise() {
            // sources may need different channels due to broadcasting,
            // resolved inside get_segment
            return -1;
        }
        let in_group_len = self.in_dims[0].ch / self.layer.groups;
        let out_group_len = self.layer.out_dim.ch / self.layer.groups;
        (out_ch / out_group_len) * in_group_len
    }

    /// Highest input channel used by `out_ch`.
    pub fn last_input_channel(&self, _x: i32, _y: i32, out_ch: i32) -> i32 {
        if self.is_elwise() {
            return -1;
        }
        let in_group_len = self.in_dims[0].ch / self.layer.groups;
        let out_group_len = self.layer.out_dim.ch / self.layer.groups;
        (out_ch / out_group_len) * in_group_len + (in_group_len - 1)
    }

    /// Iterate to the next used input channel; -1 when exhausted.
    pub fn next_input_channel(&self, x: i32, y: i32, mut in_ch: i32, out_ch: i32) -> i32 {
        if self.is_elwise() {
            return -1; // always exactly one input channel per output channel
        }
        loop {
            in_ch += 1;
            if in_ch == self.in_dims[0].ch {
                return -1;
            }
            if self.uses_input_channel(x, y, in_ch, out_ch) {
                return in_ch;
            }
        }
    }

    /// Total number of input channels used by one output channel.
    pub fn num_used_input_channels(&self, _x: i32, _y: i32, _out_ch: i32) -> i32 {
        if self.is_elwise() {
            return 1;
        }
        self.in_dims[0].ch / self.layer.groups
    }

    pub fn uses_input_channel(&self, _x: i32, _y: i32, in_ch: i32, out_ch: i32) -> bool {
        if self.is_elwise() {
            let bc = self.bc_ch(0);
            return if bc { in_ch == 0 } else { in_ch == out_ch };
        }
        let in_group_len = self.in_dims[0].ch / self.layer.groups;
        let out_group_len = self.layer.out_dim.ch / self.layer.groups;
        in_ch / in_group_len == out_ch / out_group_len
    }

    /// Build one segment; kind-specific address fixups applied on top of the
    /// generic tile arithmetic.
    pub fn get_segment(&self, x: i32, y: i32, in_ch: i32, out_ch: i32) -> WorkSegment {
        let layer = self.layer;
        let seg = &layer.seg;
        let out_dim = &layer.out_dim;

        let mut s = WorkSegment {
            x_seg: x,
            y_seg: y,
            in_channel: in_ch,
            out_channel: out_ch,
            in_mm_base: Vec::with_capacity(self.in_dims.len()),
            in_mm_y_stride: Vec::with_capacity(self.in_dims.len()),
            out_mm_base: 0,
            out_mm_y_stride: out_dim.mm.x,
            first: in_ch == self.first_input_channel(x, y, out_ch),
            last: in_ch == self.last_input_channel(x, y, out_ch),
            pad_top: false,
            pad_right: false,
            pad_bottom: false,
            pad_left: false,
        };

        // main memory address of the top left segment corner (padded)
        for src_idx in 0..self.in_dims.len() {
            let base = self.padded_in_mm_base(src_idx, in_ch.max(0))
                + 2 * (x * seg.in_x_stride + y * seg.in_y_stride * self.in_dims[src_idx].mm.x)
                    as MmAddr;
            s.in_mm_base.push(base);
            s.in_mm_y_stride.push(self.in_dims[src_idx].mm.x);
        }

        // main memory address of the segment result
        s.out_mm_base = out_dim.channel_base(out_ch as usize)
            + 2 * (x * seg.out_x_stride + y * seg.out_y_stride * out_dim.mm.x) as MmAddr;

        if layer.padding.enabled {
            let pad = &layer.padding.dma;
            let pw_top = (pad.top - y * seg.in_y_stride).max(0);
            let pw_right = (pad.right - (seg.num_x - 1 - x) * seg.in_x_stride).max(0);
            let pw_bottom = (pad.bottom - (seg.num_y - 1 - y) * seg.in_y_stride).max(0);
            let pw_left = (pad.left - x * seg.in_x_stride).max(0);

            // partial pads can not be addressed: padding widths are
            // configured per layer, a segment either carries the whole
            // configured pad on an edge or none of it
            assert!(pw_top == 0 || pw_top == pad.top);
            assert!(pw_right == 0 || pw_right == pad.right);
            assert!(pw_bottom == 0 || pw_bottom == pad.bottom);
            assert!(pw_left == 0 || pw_left == pad.left);

            s.pad_top = pw_top > 0;
            s.pad_right = pw_right > 0;
            s.pad_bottom = pw_bottom > 0;
            s.pad_left = pw_left > 0;
        }

        match &layer.kind {
            LayerKind::Add(_) | LayerKind::Mul(_) => {
                // broadcasting: each source reads its own channel and keeps
                // a zero stride along broadcast dimensions
                for src_idx in 0..self.in_dims.len() {
                    let ch = if self.bc_ch(src_idx) { 0 } else { out_ch };
                    let sx = if self.bc_x(src_idx) { 0 } else { seg.in_x_stride };
                    let sy = if self.bc_y(src_idx) { 0 } else { seg.in_y_stride };
                    s.in_mm_base[src_idx] = self.padded_in_mm_base(src_idx, ch)
                        + 2 * (x * sx + y * sy * self.in_dims[src_idx].mm.x) as MmAddr;
                }
            }
            LayerKind::DConvDeform(_) => {
                debug_assert_eq!(in_ch, out_ch);
                s.pad_top = true;
                s.pad_right = true;
                s.pad_bottom = true;
                s.pad_left = true;

                // offsets are indexed across channels, the channels are
                // contiguous in memory
                let offset_dim = &self.in_dims[1];
                let x_step = seg.in_w;
                let y_step = seg.in_h * offset_dim.mm.x;
                s.in_mm_base[1] = offset_dim.mm.base + 2 * (x * x_step + y * y_step) as MmAddr;
                s.in_mm_y_stride[1] = offset_dim.y * offset_dim.mm.x;
            }
            LayerKind::PointPillars(_) => {
                // feature base of the input channel; the per-segment offset
                // is resolved at runtime from the grid segmentation
                let ch = if layer.groups == 1 { in_ch } else { out_ch };
                s.in_mm_base[0] = self.in_dims[0].channel_base(ch as usize);
                s.in_mm_base[1] = self.in_dims[1].mm.base;
            }
            _ => {}
        }

        s
    }

    /// Can these segments be placed into the same unit?
    ///
    /// Fillers are stamped from their predecessor, so coordinate-based
    /// checks still see the tile the unit is working on.
    pub fn compatible_segments_block(
        &self,
        a: Option<&SeedSlot>,
        b: Option<&SeedSlot>,
        lane: u32,
        lane_out_ch: i32,
    ) -> bool {
        let lanes = self.arch.lanes;

        match &self.layer.kind {
            LayerKind::Add(_) | LayerKind::Mul(_) => match (a, b) {
                (Some(SeedSlot::Dummy(_)), _) | (_, Some(SeedSlot::Dummy(_))) => true,
                (None, _) | (_, None) => true,
                // one segment per unit, L0 only
                _ => lane % lanes == 0,
            },
            LayerKind::DConvDeform(_) => {
                if lane % lanes != 0 && lane_out_ch == 0 {
                    return false; // deform occupies the whole unit, seed L0 only
                }
                if lane % self.arch.parallel_lanes() == 0 {
                    return true;
                }
                match (a.map(SeedSlot::coords), b.map(SeedSlot::coords)) {
                    (Some(a), Some(b)) => a == b,
                    _ => true,
                }
            }
            LayerKind::PointPillars(_) => {
                if lane % lanes == 0 && lane_out_ch == 0 {
                    return true;
                }
                match (a, b) {
                    (Some(SeedSlot::Dummy(_)), _) | (_, Some(SeedSlot::Dummy(_))) => true,
                    (Some(a), Some(b)) => a.coords() == b.coords(),
                    _ => true,
                }
            }
            _ => {
                if lane % lanes == 0 && lane_out_ch == 0 {
                    return true; // first location has no dependencies
                }
                let (a, b) = match (a, b) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return true,
                };
                let (a, b) = match (a, b) {
                    (SeedSlot::Work(a), SeedSlot::Work(b)) => (a, b),
                    _ => return true, // dummies compatible to everything
                };
                // compatible iff the inputs are identical
                a.in_mm_base == b.in_mm_base
                    && a.in_mm_y_stride == b.in_mm_y_stride
                    && a.pad_top == b.pad_top
                    && a.pad_right == b.pad_right
                    && a.pad_bottom == b.pad_bottom
                    && a.pad_left == b.pad_left
            }
        }
    }
}

/// Slot of the in-flight set during packing: a seed that still iterates
/// over its input channels, or a filler stamped from its predecessor.
#[derive(Clone, Debug)]
pub enum SeedSlot {
    Dummy(WorkSegment),
    Work(WorkSegment),
}

impl SeedSlot {
    fn coords(&self) -> (i32, i32) {
        match self {
            SeedSlot::Dummy(w) | SeedSlot::Work(w) => (w.x_seg, w.y_seg),
        }
    }
}

/// Generate the segment list for one layer.
pub fn generate_segments(net: &Net, id: LayerId) -> Result<Vec<Segment>> {
    let layer = net.layer(id);
    let in_dims = net.src_dims(id);

    assert!(
        layer.out_dim.mm.layout_known,
        "output address of {} not set before segment generation",
        layer.full_name()
    );
    for d in &in_dims {
        assert!(
            d.mm.layout_known,
            "input address of {} not set before segment generation",
            layer.full_name()
        );
    }

    let ctx = SegCtx::new(layer, &in_dims, &net.arch);
    match &layer.kind {
        LayerKind::Input
        | LayerKind::DynamicAxis { .. }
        | LayerKind::Reshape
        | LayerKind::SliceChannel { .. }
        | LayerKind::ScatterToGrid(_) => Ok(Vec::new()),
        LayerKind::Concatenate(_) => Ok(generate_concat_segments(&ctx)),
        LayerKind::DepthToSpace(_) => Ok(generate_depth_to_space_segments(&ctx)),
        LayerKind::GlobalAvgPool2d(p) | LayerKind::GlobalMaxPool2d(p) => {
            Ok(generate_global_pool_segments(&ctx, p.sets_per_ch))
        }
        _ => Ok(generate_lane_packed_segments(&ctx)),
    }
}

/// Default generator: seeds in scheduling order, packed into sets of
/// `parallel_lanes * parallel_outchannels_per_lane`, then each set repeated
/// once per accumulation step until every seed ran out of input channels.
fn generate_lane_packed_segments(ctx: &SegCtx) -> Vec<Segment> {
    let layer = ctx.layer;
    let seg = &layer.seg;
    let arch = ctx.arch;
    let n = layer.parallel_outchannels_per_lane;
    let parallel_lanes = arch.parallel_lanes();
    let out_ch = layer.out_dim.ch;

    assert_eq!(layer.parallel_inchannels_per_lane, 1);

    let mut seeds: VecDeque<WorkSegment> = VecDeque::new();
    match layer.cfg.scheduling_order {
        SchedulingOrder::SortedX => {
            let block = n * parallel_lanes as i32;
            let mut c_start = 0;
            while c_start < out_ch {
                for x in 0..seg.num_x {
                    for y in 0..seg.num_y {
                        for oc in c_start..(c_start + block).min(out_ch) {
                            seeds.push_back(ctx.get_segment(
                                x,
                                y,
                                ctx.first_input_channel(x, y, oc),
                                oc,
                            ));
                        }
                    }
                }
                c_start += block;
            }
        }
        SchedulingOrder::SortedX2 => {
            let block = n * arch.lanes as i32;
            let mut c_start = 0;
            while c_start < out_ch {
                for x in 0..seg.num_x {
                    for y in 0..seg.num_y {
                        for oc in c_start..(c_start + block).min(out_ch) {
                            seeds.push_back(ctx.get_segment(
                                x,
                                y,
                                ctx.first_input_channel(x, y, oc),
                                oc,
                            ));
                        }
                    }
                }
                c_start += block;
            }
        }
        SchedulingOrder::SortedOutc => {
            for y in 0..seg.num_y {
                for x in 0..seg.num_x {
                    for oc in 0..out_ch {
                        seeds.push_back(ctx.get_segment(
                            x,
                            y,
                            ctx.first_input_channel(x, y, oc),
                            oc,
                        ));
                    }
                }
            }
        }
    }

    let mut segments = Vec::new();
    let mut appended_segs = 0usize;
    let mut appended_dummies = 0usize;

    while !seeds.is_empty() {
        // new set for all lanes
        let mut set: Vec<SeedSlot> = Vec::with_capacity((parallel_lanes as i32 * n) as usize);
        let mut fill_with_dummies = false; // only for parallel_outchannels_per_lane > 1
        for lane in 0..parallel_lanes {
            if lane % arch.lanes == 0 {
                // next unit, new local memory
                fill_with_dummies = false;
            }
            for lane_out_ch in 0..n {
                let front = seeds.front().map(|w| SeedSlot::Work(w.clone()));
                let compatible = ctx.compatible_segments_block(
                    front.as_ref(),
                    set.last(),
                    lane,
                    lane_out_ch,
                );
                if seeds.is_empty() || fill_with_dummies || !compatible {
                    let template = match set.last() {
                        Some(SeedSlot::Dummy(w)) | Some(SeedSlot::Work(w)) => w.clone(),
                        None => unreachable!("a set never starts with a filler"),
                    };
                    set.push(SeedSlot::Dummy(template));
                    fill_with_dummies = true;
                    continue;
                }
                set.push(SeedSlot::Work(seeds.pop_front().unwrap()));
            }
        }
        assert_eq!(set.len(), (parallel_lanes as i32 * n) as usize);
        expand_set_over_input_channels(
            ctx,
            set,
            &mut segments,
            &mut appended_segs,
            &mut appended_dummies,
        );
    }

    assert!(
        segments.len() % parallel_lanes as usize == 0
            && segments.len() == appended_segs + appended_dummies,
        "generated {} segments ({} dummies + {}) for layer {}",
        segments.len(),
        appended_dummies,
        appended_segs,
        layer.full_name()
    );
    segments
}

/// Repeat one set until every non-dummy seed iterated through all of its
/// input channels. Only the first repetition carries `first`; the record
/// whose next input channel is exhausted carries `last`.
fn expand_set_over_input_channels(
    ctx: &SegCtx,
    mut set: Vec<SeedSlot>,
    segments: &mut Vec<Segment>,
    appended_segs: &mut usize,
    appended_dummies: &mut usize,
) {
    let mut num_sets = 0;
    loop {
        let mut cont_requests = 0;
        let mut stop_requests = 0;
        for slot in set.iter_mut() {
            match slot {
                SeedSlot::Dummy(_) => {
                    *appended_dummies += 1;
                    segments.push(Segment::Dummy);
                }
                SeedSlot::Work(seed) => {
                    let s = ctx.get_segment(seed.x_seg, seed.y_seg, seed.in_channel, seed.out_channel);
                    seed.in_channel =
                        ctx.next_input_channel(seed.x_seg, seed.y_seg, seed.in_channel, seed.out_channel);
                    assert!(
                        num_sets > 0 || s.first,
                        "first accumulation step not marked first"
                    );
                    assert_eq!(
                        s.last,
                        seed.in_channel < 0,
                        "next_input_channel and last are inconsistent"
                    );
                    if s.last {
                        stop_requests += 1;
                    } else {
                        cont_requests += 1;
                    }
                    *appended_segs += 1;
                    segments.push(Segment::Work(s));
                }
            }
        }
        assert!(
            cont_requests == 0 || stop_requests == 0,
            "some non-dummy segments in this set are last, some are not"
        );
        num_sets += 1;
        if cont_requests == 0 {
            break;
        }
    }
}

/// Concatenate: one segment per cluster, all clusters advance together;
/// dummies fill the remainder when a source runs out at a cluster boundary.
fn generate_concat_segments(ctx: &SegCtx) -> Vec<Segment> {
    let layer = ctx.layer;
    let seg = &layer.seg;
    let clusters = ctx.arch.clusters as usize;
    let (oc_to_ic, oc_to_src) = match &layer.kind {
        LayerKind::Concatenate(p) => (&p.oc_to_ic_map, &p.oc_to_src_map),
        _ => unreachable!(),
    };

    let mut cluster_batches: Vec<Vec<Segment>> = vec![Vec::new(); clusters];
    let mut segments = Vec::new();
    let mut cluster = 0usize;

    let mut flush =
        |batches: &mut Vec<Vec<Segment>>, segments: &mut Vec<Segment>| {
            for s in 0..batches[0].len() {
                for b in batches.iter() {
                    segments.push(b[s].clone());
                }
            }
            for b in batches.iter_mut() {
                b.clear();
            }
        };

    for oc in 0..layer.out_dim.ch as usize {
        let src = oc_to_src[oc];
        let ic = oc_to_ic[oc];
        for y in 0..seg.num_y {
            for x in 0..seg.num_x {
                let src_dim = &ctx.in_dims[src];
                // a set must keep one source (one shift parameter), so the
                // last tile of each source triggers the dummy fill below
                let s = WorkSegment {
                    x_seg: x,
                    y_seg: y,
                    in_channel: ic,
                    out_channel: oc as i32,
                    in_mm_base: vec![
                        src_dim.channel_base(ic as usize)
                            + 2 * (x * seg.in_w + y * seg.in_h * src_dim.mm.x) as MmAddr,
                    ],
                    in_mm_y_stride: vec![src_dim.mm.x],
                    out_mm_base: layer.out_dim.channel_base(oc)
                        + 2 * (x * seg.out_x_stride
                            + y * seg.out_y_stride * layer.out_dim.mm.x)
                            as MmAddr,
                    out_mm_y_stride: layer.out_dim.mm.x,
                    first: x == 0 && y == 0 && ic == 0,
                    last: x == seg.num_x - 1
                        && y == seg.num_y - 1
                        && ic == src_dim.ch - 1,
                    pad_top: false,
                    pad_right: false,
                    pad_bottom: false,
                    pad_left: false,
                };
                let last = s.last;
                cluster_batches[cluster].push(Segment::Work(s));
                cluster += 1;

                if last {
                    // pad the remaining clusters of this row with dummies
                    while cluster % clusters != 0 {
                        let depth = cluster_batches[cluster - 1].len();
                        for _ in 0..depth {
                            cluster_batches[cluster % clusters].push(Segment::Dummy);
                        }
                        cluster += 1;
                    }
                }

                if cluster % clusters == 0 && cluster != 0 {
                    flush(&mut cluster_batches, &mut segments);
                    cluster = 0;
                }
            }
        }
    }
    segments
}

/// DepthToSpace: block-interleaved tiles, one per cluster.
fn generate_depth_to_space_segments(ctx: &SegCtx) -> Vec<Segment> {
    let layer = ctx.layer;
    let seg = &layer.seg;
    let in_dim = &ctx.in_dims[0];
    let out_dim = &layer.out_dim;
    let block_size = match &layer.kind {
        LayerKind::DepthToSpace(p) => p.block_size,
        _ => unreachable!(),
    };
    let clusters = ctx.arch.clusters as usize;

    let mut cluster_batches: Vec<Vec<Segment>> = vec![Vec::new(); clusters];
    let mut segments = Vec::new();
    let mut cluster = 0usize;

    for y in 0..seg.num_y {
        for x in 0..seg.num_x {
            for ic in 0..in_dim.ch {
                let oc = ic / (block_size * block_size);

                // source pixels of one output block are spread across the
                // input channels of the group; channels 1 and 2 swap to
                // account for the row-major block ordering
                let mut ic_offset = (ic % 4) * out_dim.ch * in_dim.x * in_dim.y;
                if ic % 4 == 1 {
                    ic_offset = 2 * out_dim.ch * in_dim.x * in_dim.y;
                }
                if ic % 4 == 2 {
                    ic_offset = out_dim.ch * in_dim.x * in_dim.y;
                }
                let oc_offset = oc * in_dim.x * in_dim.y;
                let x_offset = x * seg.in_w;
                let y_offset = y * in_dim.x * seg.in_h;

                let out_oc_offset = oc * out_dim.x * out_dim.y;
                let out_ic_offset = (ic % 4) * out_dim.x;
                let out_x_offset = x * block_size * block_size;
                let out_y_offset = y * seg.in_h * block_size * out_dim.x;

                let last = x == seg.num_x - 1 && y == seg.num_y - 1 && ic == in_dim.ch - 1;
                let s = WorkSegment {
                    x_seg: x,
                    y_seg: y,
                    in_channel: ic,
                    out_channel: oc,
                    in_mm_base: vec![
                        in_dim.channel_base(0)
                            + 2 * (ic_offset + oc_offset + x_offset + y_offset) as MmAddr,
                    ],
                    in_mm_y_stride: vec![in_dim.mm.x],
                    out_mm_base: out_dim.channel_base(0)
                        + 2 * (out_ic_offset + out_oc_offset + out_x_offset + out_y_offset)
                            as MmAddr,
                    out_mm_y_stride: out_dim.mm.x,
                    first: false,
                    last,
                    pad_top: false,
                    pad_right: false,
                    pad_bottom: false,
                    pad_left: false,
                };
                cluster_batches[cluster].push(Segment::Work(s));
                if ic == in_dim.ch - 1 {
                    cluster = (cluster + 1) % clusters;
                }

                if last {
                    while cluster != 0 {
                        let depth = cluster_batches[cluster - 1].len();
                        for _ in 0..depth {
                            cluster_batches[cluster].push(Segment::Dummy);
                        }
                        cluster = (cluster + 1) % clusters;
                    }
                    for s in 0..cluster_batches[0].len() {
                        for b in cluster_batches.iter() {
                            segments.push(b[s].clone());
                        }
                    }
                    for b in cluster_batches.iter_mut() {
                        b.clear();
                    }
                }
            }
        }
    }
    segments
}

/// Global pooling: each channel's tiles are mapped sequentially onto L0 of
/// one unit; partial sums accumulate in the RF across sets.
fn generate_global_pool_segments(ctx: &SegCtx, sets_per_ch: i32) -> Vec<Segment> {
    let layer = ctx.layer;
    let seg = &layer.seg;
    let arch = ctx.arch;
    let in_ch = ctx.in_dims[0].ch;
    let usable_lanes = (arch.clusters * arch.units) as i32; // L0 only
    let parallel_lanes = arch.parallel_lanes() as usize;

    let sets = sets_per_ch * ceil_div(in_ch, usable_lanes);
    let mut segments = vec![Segment::Dummy; sets as usize * parallel_lanes];

    for out_ch in 0..layer.out_dim.ch {
        let base_set = (out_ch / usable_lanes) * sets_per_ch;
        for y in 0..seg.num_y {
            for x in 0..seg.num_x {
                let mut s = ctx.get_segment(x, y, out_ch, out_ch);
                s.first = x == 0 && y == 0;
                s.last = x + 1 == seg.num_x && y + 1 == seg.num_y;
                let set = (base_set + y * seg.num_x + x) as usize;
                let lane = ((out_ch % usable_lanes) * arch.lanes as i32) as usize;
                segments[set * parallel_lanes + lane] = Segment::Work(s);
            }
        }
    }
    segments
}

/// `F`/`L`/`1`/`x`/`-` map of one layer's lane occupancy.
pub fn lane_usage_string(layer: &Layer, arch: &VproConfig) -> String {
    let segs_per_set = (arch.parallel_lanes() as i32 * layer.parallel_outchannels_per_lane) as usize;
    let mut out = String::new();
    for (i, s) in layer.segments.iter().enumerate() {
        if i % segs_per_set == 0 {
            out += &format!("set {:4} [", i / segs_per_set);
        }
        out.push(match s {
            Segment::Dummy => '-',
            Segment::Work(w) => match (w.first, w.last) {
                (true, true) => '1',
                (true, false) => 'F',
                (false, true) => 'L',
                (false, false) => 'x',
            },
        });
        if (i + 1) % segs_per_set == 0 {
            out += "]\n";
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_is_its_own_variant() {
        let s = Segment::Dummy;
        assert!(s.is_dummy());
        assert!(s.work().is_none());
        assert_eq!(s.short_string(), "D");
    }
}
