//! Command emission: walk the segment list under the double-buffer schedule
//! and produce the typed record stream the runtime replays.

pub mod conv;
pub mod fused;
pub mod misc;

use itertools::Itertools;

use crate::arch::VproConfig;
use crate::bif::{CommandSegment, DmaCommand, DmaDirection, VproCommand};
use crate::error::Result;
use crate::graph::config::CmdCount;
use crate::graph::dim::Dim;
use crate::graph::layer::{Layer, LayerKind};
use crate::graph::{LayerId, Net};
use crate::segments::Segment;

/// The two halves of local memory used for double buffering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Buffer {
    A,
    B,
}

impl Buffer {
    pub fn other(self) -> Buffer {
        match self {
            Buffer::A => Buffer::B,
            Buffer::B => Buffer::A,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            Buffer::A => 0,
            Buffer::B => 1,
        }
    }

    /// LM word offset of this half.
    pub fn lm_offset(self, arch: &VproConfig) -> u32 {
        self.index() * (arch.lm_size / 2)
    }
}

/// Accumulates one layer's command list together with its counters.
pub struct CommandStream {
    pub layer_name: String,
    pub cmds: Vec<CommandSegment>,
    pub cnt: CmdCount,
}

impl CommandStream {
    pub fn new(layer_name: impl Into<String>) -> Self {
        CommandStream {
            layer_name: layer_name.into(),
            cmds: Vec::new(),
            cnt: CmdCount::default(),
        }
    }

    pub fn push_vpro(&mut self, cmd: VproCommand) -> Result<()> {
        cmd.validate(&self.layer_name)?;
        self.cmds.push(CommandSegment::Vpro(cmd));
        self.cnt.vpro += 1;
        Ok(())
    }

    pub fn push_dma(&mut self, cmd: DmaCommand) {
        self.cmds.push(CommandSegment::Dma(cmd));
        self.cnt.dma += 1;
    }

    pub fn push_dma_wait(&mut self) {
        self.cmds.push(CommandSegment::DmaWait);
        self.cnt.sync += 1;
    }

    pub fn push_vpro_sync(&mut self) {
        self.cmds.push(CommandSegment::VproWait);
        self.cnt.sync += 1;
    }

    pub fn push_both_sync(&mut self) {
        self.cmds.push(CommandSegment::BothSync);
        self.cnt.sync += 1;
    }

    pub fn push_raw(&mut self, cmd: CommandSegment) {
        self.cmds.push(cmd);
    }
}

/// One DMA transfer before broadcast merging: still addressed to a single
/// (cluster, unit) pair.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DmaDescriptor {
    pub is_kernel_offset: bool,
    pub is_bias_offset: bool,
    pub dir: DmaDirection,
    pub cluster: u32,
    pub unit: u32,
    pub mm_addr: u64,
    pub lm_addr: u32,
    pub x_size: u32,
    pub y_size: u32,
    pub word_count: u32,
    pub y_leap: i32,
    pub pad: [bool; 4], // top, right, bottom, left
    pub skipped_elements_at_end: u8,
}

impl DmaDescriptor {
    /// Copy a segment's external address and pad flags into the descriptor
    /// and derive the row leap.
    pub fn apply_padded_segment(&mut self, seg: &crate::segments::WorkSegment, source: usize) {
        self.mm_addr = seg.in_mm_base[source] as u64;
        self.pad = [seg.pad_top, seg.pad_right, seg.pad_bottom, seg.pad_left];
        self.y_leap = seg.in_mm_y_stride[source] - self.x_size as i32 + 1;
    }

    /// Finalise into a wire record addressed to a set of units.
    pub fn load(&self, unit_mask: u32) -> DmaCommand {
        assert!(
            self.dir != DmaDirection::L2E1D && self.dir != DmaDirection::L2E2D,
            "broadcast loads must move data into local memory"
        );
        let mut cmd = DmaCommand {
            direction: self.dir,
            cluster_mask: 1 << self.cluster,
            unit_mask,
            is_bias_offset: self.is_bias_offset,
            is_kernel_offset: self.is_kernel_offset,
            skipped_elements_at_end: self.skipped_elements_at_end,
            mm_addr: self.mm_addr as u32,
            lm_addr: self.lm_addr,
            ..Default::default()
        };
        if self.dir == DmaDirection::E2L1D {
            cmd.x_size = self.word_count as u16;
            cmd.y_size = 1;
            cmd.y_leap = 0;
        } else {
            cmd.x_size = self.x_size as u16;
            cmd.y_size = self.y_size as u16;
            cmd.y_leap = self.y_leap;
            cmd.padding = crate::bif::pad_mask(self.pad[0], self.pad[1], self.pad[2], self.pad[3]);
        }
        cmd
    }

    /// Payload identity for unit-broadcast merging (everything except the
    /// target unit).
    fn same_as(&self, other: &DmaDescriptor, two_d: bool) -> bool {
        let base = self.mm_addr == other.mm_addr
            && self.lm_addr == other.lm_addr
            && self.cluster == other.cluster
            && self.pad == other.pad
            && self.is_bias_offset == other.is_bias_offset
            && self.is_kernel_offset == other.is_kernel_offset
            && self.skipped_elements_at_end == other.skipped_elements_at_end;
        if two_d {
            base && self.y_leap == other.y_leap
                && self.y_size == other.y_size
                && self.x_size == other.x_size
        } else {
            base && self.word_count == other.word_count
        }
    }
}

/// Sort descriptors by external address and fuse byte-identical neighbours
/// into one broadcast with an OR-ed unit mask.
pub fn start_broadcast_load(
    stream: &mut CommandStream,
    dmas_1d: Vec<DmaDescriptor>,
    dmas_2d: Vec<DmaDescriptor>,
) {
    for (dmas, two_d) in [(dmas_1d, false), (dmas_2d, true)] {
        if dmas.is_empty() {
            continue;
        }
        let sorted: Vec<DmaDescriptor> = dmas
            .into_iter()
            .sorted_by_key(|d| d.mm_addr) // stable: equal addresses keep order
            .collect();
        let mut starter = sorted[0];
        let mut unit_mask = 1u32 << starter.unit;
        for dma in &sorted {
            debug_assert!(dma.dir.is_load());
            if dma.same_as(&starter, two_d) {
                unit_mask |= 1 << dma.unit;
            } else {
                stream.push_dma(starter.load(unit_mask));
                starter = *dma;
                unit_mask = 1 << dma.unit;
            }
        }
        stream.push_dma(starter.load(unit_mask));
    }
}

/// Walk (cluster, unit, lane) in segment order.
pub fn next_hardware_element(arch: &VproConfig, cluster: &mut u32, unit: &mut u32, lane: &mut u32) {
    *lane += 1;
    if *lane == arch.lanes {
        *unit += 1;
        *lane = 0;
        if *unit == arch.units {
            *unit = 0;
            *cluster += 1;
        }
    }
}

/// Read-only view of one layer for command emission.
pub struct EmitView<'a> {
    pub layer: &'a Layer,
    pub in_dims: Vec<Dim>,
    pub arch: VproConfig,
}

impl<'a> EmitView<'a> {
    pub fn lm_half(&self) -> u32 {
        self.arch.lm_size / 2
    }

    pub fn lm_quarter(&self) -> u32 {
        self.arch.lm_size / 4
    }

    pub fn segs_per_set(&self) -> usize {
        (self.arch.parallel_lanes() as i32 * self.layer.parallel_outchannels_per_lane) as usize
    }
}

/// Layer-specific load / compute / store under the common ping-pong driver.
pub trait DoubleBufferEmitter {
    /// segments consumed per set
    fn stride(&self) -> usize;

    fn load(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()>;

    fn compute(
        &mut self,
        stream: &mut CommandStream,
        base: usize,
        buffer: Buffer,
        store_buffer: &mut Buffer,
    ) -> Result<()>;

    fn store(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()>;
}

/// The default double-buffered schedule. Loads prefetch into the buffer the
/// previous iteration computed from; every load/compute boundary drains the
/// DMA queue and every compute/store boundary drains the compute pipe.
pub fn run_double_buffered(
    em: &mut dyn DoubleBufferEmitter,
    stream: &mut CommandStream,
    total_segments: usize,
) -> Result<()> {
    if total_segments == 0 {
        return Ok(());
    }
    let stride = em.stride();
    let mut buffer_load = Buffer::A;
    let mut buffer_calc = Buffer::A;
    let mut buffer_store = Buffer::A;

    em.load(stream, 0, buffer_load)?;
    buffer_load = buffer_load.other();
    stream.push_dma_wait();
    stream.push_both_sync();

    let mut curr = 0usize;
    while curr + stride < total_segments {
        let next = curr + stride;
        em.load(stream, next, buffer_load)?;
        stream.push_dma_wait();
        em.compute(stream, curr, buffer_calc, &mut buffer_store)?;
        stream.push_vpro_sync();
        em.store(stream, curr, buffer_store)?;
        buffer_load = buffer_load.other();
        buffer_calc = buffer_calc.other();
        curr = next;
    }

    em.compute(stream, curr, buffer_calc, &mut buffer_store)?;
    stream.push_vpro_sync();
    em.store(stream, curr, buffer_store)?;
    stream.push_dma_wait();
    Ok(())
}

/// Emit the command stream for one layer.
pub fn generate_commands(net: &Net, id: LayerId) -> Result<(Vec<CommandSegment>, CmdCount)> {
    let layer = net.layer(id);
    let view = EmitView {
        layer,
        in_dims: net.src_dims(id),
        arch: net.arch,
    };
    let mut stream = CommandStream::new(layer.full_name());

    match &layer.kind {
        LayerKind::Input | LayerKind::DynamicAxis { .. } | LayerKind::Reshape
        | LayerKind::SliceChannel { .. } => {}
        LayerKind::Conv2d(_) | LayerKind::MaxPool2d(_) | LayerKind::DConvConv(_)
        | LayerKind::Conv2dTranspose(_) => {
            conv::emit_conv2d(&view, &mut stream)?;
        }
        LayerKind::Conv1d(_) => conv::emit_conv1d(&view, &mut stream)?,
        LayerKind::Add(_) | LayerKind::Mul(_) => misc::emit_elementwise(&view, &mut stream)?,
        LayerKind::AvgPool2d(_) => misc::emit_avgpool(&view, &mut stream)?,
        LayerKind::GlobalAvgPool2d(_) | LayerKind::GlobalMaxPool2d(_) => {
            misc::emit_global_pool(&view, &mut stream)?
        }
        LayerKind::Concatenate(_) => misc::emit_concat(&view, &mut stream)?,
        LayerKind::DepthToSpace(_) => misc::emit_depth_to_space(&view, &mut stream)?,
        LayerKind::ScatterToGrid(_) => misc::emit_scatter(&view, &mut stream)?,
        LayerKind::PointPillars(_) => misc::emit_pointpillars(&view, &mut stream)?,
        LayerKind::DConvDeform(_) => misc::emit_dconv_deform(&view, &mut stream)?,
    }

    Ok((stream.cmds, stream.cnt))
}

/// Generic 2D store of one finished segment from the LM store region.
pub fn data_store_2d(
    view: &EmitView,
    seg: &crate::segments::WorkSegment,
    cluster: u32,
    unit: u32,
    lane: u32,
    buffer: Buffer,
) -> DmaCommand {
    let layer = view.layer;
    let x_size = layer.seg.out_w as u16;
    DmaCommand {
        direction: DmaDirection::L2E2D,
        cluster_mask: 1 << cluster,
        unit_mask: 1 << unit,
        mm_addr: seg.out_mm_base,
        lm_addr: buffer.lm_offset(&view.arch)
            + view.lm_quarter()
            + lane * layer.lm_lane_stride as u32,
        x_size,
        y_size: layer.seg.out_h as u16,
        y_leap: seg.out_mm_y_stride - x_size as i32 + 1,
        ..Default::default()
    }
}

/// 1D store variant for row-shaped segments.
pub fn data_store_1d(
    view: &EmitView,
    seg: &crate::segments::WorkSegment,
    cluster: u32,
    unit: u32,
    lane: u32,
    buffer: Buffer,
) -> DmaCommand {
    let layer = view.layer;
    DmaCommand {
        direction: DmaDirection::L2E1D,
        cluster_mask: 1 << cluster,
        unit_mask: 1 << unit,
        mm_addr: seg.out_mm_base,
        lm_addr: buffer.lm_offset(&view.arch)
            + view.lm_quarter()
            + lane * layer.lm_lane_stride as u32,
        x_size: (layer.seg.out_w * layer.seg.out_h) as u16,
        y_size: 1,
        y_leap: 0,
        ..Default::default()
    }
}

/// Generic 2D input-tile load for one unit.
pub fn data_load_2d(
    view: &EmitView,
    seg: &crate::segments::WorkSegment,
    cluster: u32,
    unit: u32,
    buffer: Buffer,
    source: usize,
) -> DmaDescriptor {
    let layer = view.layer;
    let mut dma = DmaDescriptor {
        dir: DmaDirection::E2L2D,
        cluster,
        unit,
        x_size: layer.seg.in_w as u32,
        y_size: layer.seg.in_h as u32,
        lm_addr: buffer.lm_offset(&view.arch),
        ..Default::default()
    };
    dma.apply_padded_segment(seg, source);
    dma
}

/// 1D input load for row-shaped segments.
pub fn data_load_1d(
    view: &EmitView,
    seg: &crate::segments::WorkSegment,
    cluster: u32,
    unit: u32,
    buffer: Buffer,
    source: usize,
) -> DmaDescriptor {
    let layer = view.layer;
    DmaDescriptor {
        dir: DmaDirection::E2L1D,
        cluster,
        unit,
        word_count: (layer.seg.in_w * layer.seg.in_h) as u32,
        lm_addr: buffer.lm_offset(&view.arch),
        mm_addr: seg.in_mm_base[source] as u64,
        ..Default::default()
    }
}

/// First non-dummy segment of a set; sets start with real work unless the
/// whole set is filler.
pub fn set_prototype<'s>(segments: &'s [Segment], base: usize, len: usize) -> Option<&'s crate::segments::WorkSegment> {
    segments[base..base + len].iter().find_map(|s| s.work())
}

/// Which lanes have non-dummy segments in this set?
pub fn set_lane_mask(view: &EmitView, segments: &[Segment], base: usize) -> u16 {
    let arch = &view.arch;
    let n = view.layer.parallel_outchannels_per_lane as usize;
    let lanes = arch.lanes as usize;
    let total = view.segs_per_set();
    let mut mask = 0u16;
    for lane in 0..lanes {
        let mut si = base + lane * n;
        while si < base + total {
            if !segments[si].is_dummy() {
                mask |= 1 << lane;
                break;
            }
            si += lanes * n;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_ping_pong() {
        assert_eq!(Buffer::A.other(), Buffer::B);
        assert_eq!(Buffer::B.other(), Buffer::A);
        let arch = VproConfig::default();
        assert_eq!(Buffer::A.lm_offset(&arch), 0);
        assert_eq!(Buffer::B.lm_offset(&arch), 4096);
    }

    #[test]
    fn broadcast_merges_identical_descriptors() {
        let mut stream = CommandStream::new("t");
        let mk = |unit: u32, mm: u64| DmaDescriptor {
            dir: DmaDirection::E2L2D,
            unit,
            mm_addr: mm,
            x_size: 4,
            y_size: 4,
            y_leap: 1,
            ..Default::default()
        };
        start_broadcast_load(
            &mut stream,
            vec![],
            vec![mk(0, 0x100), mk(1, 0x100), mk(0, 0x200)],
        );
        assert_eq!(stream.cnt.dma, 2);
        match &stream.cmds[0] {
            CommandSegment::Dma(d) => {
                assert_eq!(d.unit_mask, 0b11);
                assert_eq!(d.mm_addr, 0x100);
            }
            _ => panic!("expected a DMA record"),
        }
    }

    #[test]
    fn broadcast_masks_are_monotone() {
        let mut stream = CommandStream::new("t");
        let mk = |unit: u32| DmaDescriptor {
            dir: DmaDirection::E2L1D,
            unit,
            mm_addr: 0xA000_0000,
            word_count: 9,
            is_kernel_offset: true,
            ..Default::default()
        };
        let originals = vec![mk(0), mk(1), mk(3)];
        let or_of_masks: u32 = originals.iter().map(|d| 1u32 << d.unit).fold(0, |a, b| a | b);
        start_broadcast_load(&mut stream, originals, vec![]);
        assert_eq!(stream.cnt.dma, 1);
        match &stream.cmds[0] {
            CommandSegment::Dma(d) => assert_eq!(d.unit_mask, or_of_masks),
            _ => panic!("expected a DMA record"),
        }
    }

    #[test]
    fn hardware_element_walk_order() {
        let arch = VproConfig::default();
        let (mut cl, mut un, mut ln) = (0, 0, 0);
        let mut seen = vec![(0, 0, 0)];
        for _ in 0..7 {
            next_hardware_element(&arch, &mut cl, &mut un, &mut ln);
            seen.push((cl, un, ln));
        }
        assert_eq!(seen[1], (0, 0, 1));
        assert_eq!(seen[2], (0, 1, 0));
        assert_eq!(seen[4], (1, 0, 0));
        assert_eq!(seen[7], (1, 1, 1));
    }
}
