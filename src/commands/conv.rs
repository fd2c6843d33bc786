//! Command emission for the convolution family.

use crate::arch::MmAddr;
use crate::bif::{DmaDirection, VproCommand, VproOp};
use crate::error::Result;
use crate::graph::layer::{ConvParams, FusedOps, LayerKind};
use crate::memory::conv_1x1_fast_path;
use crate::segments::{Segment, WorkSegment};

use super::{
    data_load_1d, data_load_2d, data_store_1d, data_store_2d, fused, next_hardware_element,
    run_double_buffered, set_lane_mask, set_prototype, start_broadcast_load, Buffer,
    CommandStream, DmaDescriptor, DoubleBufferEmitter, EmitView,
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConvVariant {
    Regular,
    Transpose,
    MaxPool,
    DconvConv,
}

/// Emitter shared by Conv2D, Conv2DTranspose, MaxPool2D and DConvConv.
struct Conv2dEmitter<'a, 'v> {
    view: &'a EmitView<'v>,
    variant: ConvVariant,
    p: ConvParams,
    kernel_x: i32,
    kernel_y: i32,
    /// 1x1 stride-1 convolutions run the flexible 1D formulation
    fast_1x1: bool,
    in_group_len: i32,
    out_group_len: i32,
}

pub fn emit_conv2d(view: &EmitView, stream: &mut CommandStream) -> Result<()> {
    let (variant, p) = match &view.layer.kind {
        LayerKind::Conv2d(p) => (ConvVariant::Regular, p.clone()),
        LayerKind::MaxPool2d(p) => (ConvVariant::MaxPool, p.clone()),
        LayerKind::DConvConv(p) => (ConvVariant::DconvConv, p.clone()),
        LayerKind::Conv2dTranspose(tp) => (ConvVariant::Transpose, tp.conv.clone()),
        _ => unreachable!(),
    };
    let fast_1x1 = variant == ConvVariant::Regular
        && conv_1x1_fast_path(&p, view.layer.groups, view.layer.parallel_outchannels_per_lane);
    let (kernel_x, kernel_y) = if variant == ConvVariant::DconvConv {
        (p.kernel_length, 1)
    } else {
        (p.kernel_length, p.kernel_length)
    };

    let mut em = Conv2dEmitter {
        view,
        variant,
        in_group_len: view.in_dims[0].ch / view.layer.groups,
        out_group_len: view.layer.out_dim.ch / view.layer.groups,
        p,
        kernel_x,
        kernel_y,
        fast_1x1,
    };
    run_double_buffered(&mut em, stream, view.layer.segments.len())
}

impl<'a, 'v> Conv2dEmitter<'a, 'v> {
    fn weights_mm_addr(&self) -> MmAddr {
        self.view.layer.weights.mm_addr
    }

    /// Kernels are packed `[ch_in_group][ch_out][ky][kx]` row-major; grouped
    /// convolution indexes only the channels of the output's group.
    fn kernel_mm_addr(&self, in_channel: i32, out_channel: i32) -> MmAddr {
        match self.variant {
            ConvVariant::DconvConv => {
                // flat kernel packed [ch_in][ch_out][x]
                self.weights_mm_addr()
                    + 2 * (self.kernel_x * (out_channel + self.view.layer.out_dim.ch * in_channel))
                        as MmAddr
            }
            _ => {
                let group = out_channel / self.out_group_len;
                debug_assert_eq!(in_channel / self.in_group_len, group);
                let in_offs = in_channel % self.in_group_len;
                self.weights_mm_addr()
                    + 2 * (self.kernel_x
                        * (self.kernel_y
                            * (out_channel + self.view.layer.out_dim.ch * in_offs)))
                        as MmAddr
            }
        }
    }

    fn bias_mm_addr(&self, out_channel: i32) -> MmAddr {
        let layer = self.view.layer;
        let kernel_words = match self.variant {
            ConvVariant::DconvConv => layer.out_dim.ch * self.view.in_dims[0].ch * self.kernel_x,
            _ => {
                layer.out_dim.ch * self.view.in_dims[0].ch / layer.groups
                    * self.kernel_x
                    * self.kernel_y
            }
        };
        self.weights_mm_addr() + 2 * (kernel_words + out_channel) as MmAddr
    }

    /// kernel coefficients stacked below the middle of the active LM half,
    /// one slot per lane
    fn kernel_load(
        &self,
        seg: &WorkSegment,
        cluster: u32,
        unit: u32,
        lane: u32,
        buffer: Buffer,
    ) -> DmaDescriptor {
        let view = self.view;
        let kk = (self.kernel_x * self.kernel_y) as u32;
        let mut lm_addr = buffer.lm_offset(&view.arch) + view.lm_quarter() - kk * (lane + 1);
        if self.variant == ConvVariant::DconvConv {
            lm_addr += view.lm_quarter(); // no double buffering for weights
        }
        DmaDescriptor {
            dir: DmaDirection::E2L1D,
            cluster,
            unit,
            lm_addr,
            word_count: kk,
            is_kernel_offset: true,
            mm_addr: self.kernel_mm_addr(seg.in_channel, seg.out_channel) as u64,
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
        let kk = (self.kernel_x * self.kernel_y) as u32;
        let mut lm_addr = buffer.lm_offset(&view.arch) + view.lm_quarter() - 2 * kk - 1 - lane;
        if self.variant == ConvVariant::DconvConv {
            lm_addr += view.lm_quarter();
        }
        DmaDescriptor {
            dir: DmaDirection::E2L1D,
            cluster,
            unit,
            lm_addr,
            word_count: 1,
            is_bias_offset: true,
            mm_addr: self.bias_mm_addr(seg.out_channel) as u64,
            ..Default::default()
        }
    }

    /// Broadcast vector instruction for one accumulation step.
    fn conv_vpro(
        &self,
        seg: &WorkSegment,
        buffer: Buffer,
        lane_mask: u16,
        mem_layout: &mut VproCommand,
    ) -> VproCommand {
        let view = self.view;
        let lm_dbsz = view.lm_half();
        let n = view.layer.parallel_outchannels_per_lane as u32;
        let kk = (self.kernel_x * self.kernel_y) as u32;

        let mut cmd = VproCommand {
            command: match (self.variant, seg.first) {
                (ConvVariant::Transpose, true) => VproOp::ConvTransposeStart,
                (ConvVariant::Transpose, false) => VproOp::ConvTransposeAdd,
                (ConvVariant::MaxPool, _) => VproOp::MaxPooling,
                (ConvVariant::DconvConv, true) => VproOp::DconvConvStart,
                (ConvVariant::DconvConv, false) => VproOp::DconvConvAdd,
                (ConvVariant::Regular, true) => VproOp::ConvStart,
                (ConvVariant::Regular, false) => VproOp::ConvAdd,
            },
            buffer: (buffer.index() * lm_dbsz) as u16,
            lane_mask,
            ..Default::default()
        };

        let base = buffer.index() * lm_dbsz + lm_dbsz / 2;
        if self.fast_1x1 {
            cmd.kernel_load_buffer_l0 = (base - n * 2) as u16;
            cmd.kernel_load_buffer_l1 = (base - n) as u16;
            if seg.first {
                cmd.bias_load_buffer_l0 = (base - n * 4) as u16;
                cmd.bias_load_buffer_l1 = (base - n * 3) as u16;
            }
        } else {
            let mut k0 = base - kk * n;
            let mut k1 = base - kk * n * 2;
            let mut b0 = base - kk * n * 2 - n;
            let mut b1 = base - kk * n * 2 - 2 * n;
            if self.variant == ConvVariant::DconvConv {
                // weights live in the upper, single-buffered LM quarter
                let q = self.view.lm_quarter();
                k0 += q;
                k1 += q;
                b0 += q;
                b1 += q;
            }
            cmd.kernel_load_buffer_l0 = k0 as u16;
            cmd.kernel_load_buffer_l1 = k1 as u16;
            if seg.first {
                cmd.bias_load_buffer_l0 = b0 as u16;
                cmd.bias_load_buffer_l1 = b1 as u16;
            }
        }

        // memory layout produced by the convolution; post-processing and
        // the store derive their addressing from it
        mem_layout.lane_mask = lane_mask;
        mem_layout.xend = (self.p.conv_seg_w - 1) as u16;
        mem_layout.yend = (self.p.conv_seg_h - 1) as u16;
        mem_layout.zend = (n - 1) as u16;
        mem_layout.rf_ch_stride = if n > 1 {
            (self.p.conv_seg_w * self.p.conv_seg_h) as u16
        } else {
            0
        };
        mem_layout.rf_base = 0;
        mem_layout.lm_ch_stride = mem_layout.rf_ch_stride;
        mem_layout.lm_base = cmd.buffer;
        mem_layout.shift_right = self.fused().store_shift_right;
        mem_layout.rf_frac_bits = self.fused().rf_frac_bits;

        cmd
    }

    fn fused(&self) -> &FusedOps {
        &self.p.fused
    }

    fn load_fast_1x1(
        &mut self,
        stream: &mut CommandStream,
        base: usize,
        buffer: Buffer,
    ) -> Result<()> {
        let view = self.view;
        let n = view.layer.parallel_outchannels_per_lane as usize;
        let segments = &view.layer.segments;
        let mut dmas_1d = Vec::with_capacity(2 * n * view.arch.parallel_lanes() as usize);
        let mut dmas_2d = Vec::new();

        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for lane in 0..view.arch.parallel_lanes() as usize {
            for n_iteration in 0..n {
                let si = base + lane * n + n_iteration;
                if let Segment::Work(seg) = &segments[si] {
                    // LM tail layout per buffer half:
                    //   end - 4n .. end - 2n: bias (n * L0)(n * L1)
                    //   end - 2n .. end     : kernels (n * L0)(n * L1)
                    let end = buffer.lm_offset(&view.arch) + view.lm_quarter();
                    let nn = n as u32;

                    let mut dma = self.kernel_load(seg, cl, un, ln, buffer);
                    dma.lm_addr = end - 2 * nn + n_iteration as u32 + nn * ln;
                    dmas_1d.push(dma);

                    if seg.first {
                        let mut dma = self.bias_load(seg, cl, un, ln, buffer);
                        dma.lm_addr = end - 4 * nn + n_iteration as u32 + nn * ln;
                        dmas_1d.push(dma);
                    }

                    if ln == 0 {
                        let mut dma = DmaDescriptor {
                            dir: DmaDirection::E2L2D,
                            cluster: cl,
                            unit: un,
                            x_size: view.layer.seg.in_w as u32,
                            y_size: view.layer.seg.in_h as u32,
                            mm_addr: seg.in_mm_base[0] as u64,
                            lm_addr: buffer.lm_offset(&view.arch),
                            ..Default::default()
                        };
                        // fake 2D without leap; the merger folds it to 1D
                        dma.y_leap = 1;
                        dmas_2d.push(dma);
                    }
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }

        start_broadcast_load(stream, dmas_1d, dmas_2d);
        Ok(())
    }

    fn store_fast_1x1(
        &mut self,
        stream: &mut CommandStream,
        base: usize,
        buffer: Buffer,
    ) -> Result<()> {
        let view = self.view;
        let n = view.layer.parallel_outchannels_per_lane as usize;
        let segments = &view.layer.segments;
        let seg_dim = &view.layer.seg;

        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for lane in 0..view.arch.parallel_lanes() as usize {
            for n_iterate in 0..n {
                let si = base + lane * n + n_iterate;
                if let Segment::Work(seg) = &segments[si] {
                    if seg.last {
                        let mut cmd = data_store_2d(view, seg, cl, un, ln, buffer);
                        cmd.lm_addr += (n_iterate as i32 * seg_dim.out_w * seg_dim.out_h) as u32;
                        // fake 2D; the merger folds it to a 1D transfer
                        cmd.y_leap = 1;
                        if seg.x_seg == seg_dim.num_x - 1 {
                            // drop the overcalc words once merged to 1D
                            cmd.skipped_elements_at_end = self.p.overcalc_elements_1d as u8;
                            if self.p.overcalc_elements_1d != 0 {
                                debug_assert!(view.layer.cfg.use_dma_merger);
                            }
                        }
                        stream.push_dma(cmd);
                    }
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        Ok(())
    }
}

impl<'a, 'v> DoubleBufferEmitter for Conv2dEmitter<'a, 'v> {
    fn stride(&self) -> usize {
        self.view.segs_per_set()
    }

    fn load(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        if self.fast_1x1 {
            return self.load_fast_1x1(stream, base, buffer);
        }

        let view = self.view;
        let segments = &view.layer.segments;
        let mut dmas_1d = Vec::with_capacity(2 * view.arch.parallel_lanes() as usize);
        let mut dmas_2d = Vec::new();

        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                if self.variant != ConvVariant::MaxPool {
                    dmas_1d.push(self.kernel_load(seg, cl, un, ln, buffer));
                    if seg.first {
                        dmas_1d.push(self.bias_load(seg, cl, un, ln, buffer));
                    }
                }
                if ln == 0 {
                    dmas_2d.push(data_load_2d(view, seg, cl, un, buffer, 0));
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
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
        let proto = set_prototype(segments, base, self.stride())
            .expect("only dummy segments in this set (nothing to do)");
        let lane_mask = set_lane_mask(view, segments, base);

        let mut mem_layout = VproCommand::default();
        stream.push_vpro(self.conv_vpro(proto, buffer, lane_mask, &mut mem_layout))?;

        if proto.last {
            fused::pool_activation(view, self.fused(), stream, &mut mem_layout)?;

            let mut cmd = fused::shift_store(view, self.fused(), &mut mem_layout, store_buffer);
            if self.variant == ConvVariant::DconvConv {
                // single-buffered layout: results in the lower quarter
                cmd.lm_base -= view.lm_quarter() as u16;
            }
            stream.push_vpro(cmd)?;
        }
        Ok(())
    }

    fn store(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        if self.fast_1x1 {
            return self.store_fast_1x1(stream, base, buffer);
        }

        let view = self.view;
        let segments = &view.layer.segments;
        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                if seg.last {
                    let mut cmd = data_store_2d(view, seg, cl, un, ln, buffer);
                    if self.variant == ConvVariant::DconvConv {
                        cmd.lm_addr -= view.lm_quarter();
                    }
                    stream.push_dma(cmd);
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        Ok(())
    }
}

/// Conv1D: row-shaped segments, all kernels of one output channel loaded at
/// once with a single 2D transfer.
struct Conv1dEmitter<'a, 'v> {
    view: &'a EmitView<'v>,
    kernel_length: i32,
    use_bias: bool,
    fused: FusedOps,
    n_in_channels: i32,
}

pub fn emit_conv1d(view: &EmitView, stream: &mut CommandStream) -> Result<()> {
    let p = match &view.layer.kind {
        LayerKind::Conv1d(p) => p.clone(),
        _ => unreachable!(),
    };
    let mut em = Conv1dEmitter {
        view,
        kernel_length: p.kernel_length,
        use_bias: p.use_bias,
        fused: p.fused.clone(),
        n_in_channels: view.in_dims[0].ch,
    };
    run_double_buffered(&mut em, stream, view.layer.segments.len())
}

impl<'a, 'v> Conv1dEmitter<'a, 'v> {
    fn kernel_mm_addr(&self, in_channel: i32, out_channel: i32) -> MmAddr {
        // kernel packed [in_ch][out_ch][x]
        let layer = self.view.layer;
        let in_group_len = self.view.in_dims[0].ch / layer.groups;
        let in_offs = in_channel % in_group_len;
        layer.weights.mm_addr
            + 2 * (self.kernel_length * (out_channel + layer.out_dim.ch * in_offs)) as MmAddr
    }

    fn bias_mm_addr(&self, out_channel: i32) -> MmAddr {
        let layer = self.view.layer;
        layer.weights.mm_addr
            + 2 * (layer.out_dim.ch * self.view.in_dims[0].ch / layer.groups * self.kernel_length
                + out_channel) as MmAddr
    }

    fn lm_partition_end(&self, buffer: Buffer) -> u32 {
        (buffer.index() + 1) * self.view.lm_half()
    }

    fn kernel_load(
        &self,
        seg: &WorkSegment,
        cluster: u32,
        unit: u32,
        lane: u32,
        buffer: Buffer,
    ) -> DmaDescriptor {
        // one 2D transfer fetches the weights of all input channels; the
        // row leap jumps between the per-channel kernel slices
        DmaDescriptor {
            dir: DmaDirection::E2L2D,
            cluster,
            unit,
            lm_addr: self.lm_partition_end(buffer)
                - (self.n_in_channels * (lane as i32 + 1) * self.kernel_length) as u32,
            x_size: self.kernel_length as u32,
            y_size: self.n_in_channels as u32,
            y_leap: self.view.layer.out_dim.ch * self.kernel_length,
            is_kernel_offset: true,
            mm_addr: self.kernel_mm_addr(seg.in_channel, seg.out_channel) as u64,
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
        DmaDescriptor {
            dir: DmaDirection::E2L1D,
            cluster,
            unit,
            lm_addr: self.lm_partition_end(buffer)
                - (2 * self.n_in_channels * self.kernel_length) as u32
                - 1
                - lane,
            word_count: 1,
            is_bias_offset: true,
            mm_addr: self.bias_mm_addr(seg.out_channel) as u64,
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
        let lm_partition_end = self.lm_partition_end(buffer);
        let n_ch = self.n_in_channels;
        let ch_off = seg.in_channel;

        let mut cmd = VproCommand {
            command: if seg.first {
                VproOp::Conv1dStart
            } else {
                VproOp::Conv1dAdd
            },
            rf_base: 0,
            lm_base: (buffer.index() * self.view.lm_half()) as u16,
            in_ch_offset: ch_off as u16,
            zend: (self.view.layer.seg.out_w - 1) as u16,
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
        mem_layout.rf_ch_stride = 1;
        mem_layout.rf_base = 0;
        mem_layout.lm_ch_stride = 1;
        mem_layout.lm_base = cmd.lm_base;
        mem_layout.shift_right = self.fused.store_shift_right;
        mem_layout.rf_frac_bits = self.fused.rf_frac_bits;

        cmd
    }
}

impl<'a, 'v> DoubleBufferEmitter for Conv1dEmitter<'a, 'v> {
    fn stride(&self) -> usize {
        self.view.segs_per_set()
    }

    fn load(&mut self, stream: &mut CommandStream, base: usize, buffer: Buffer) -> Result<()> {
        let view = self.view;
        let segments = &view.layer.segments;
        let mut dmas_1d = Vec::with_capacity(2 * view.arch.parallel_lanes() as usize);
        let mut dmas_2d = Vec::new();

        let (mut cl, mut un, mut ln) = (0u32, 0u32, 0u32);
        for i in 0..view.arch.parallel_lanes() as usize {
            if let Segment::Work(seg) = &segments[base + i] {
                if seg.first {
                    dmas_2d.push(self.kernel_load(seg, cl, un, ln, buffer));
                    if self.use_bias {
                        dmas_1d.push(self.bias_load(seg, cl, un, ln, buffer));
                    }
                }
                if ln == 0 {
                    dmas_1d.push(data_load_1d(view, seg, cl, un, buffer, 0));
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
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
        let proto = set_prototype(segments, base, self.stride())
            .expect("only dummy segments in this set (nothing to do)");
        let lane_mask = set_lane_mask(view, segments, base);

        let mut mem_layout = VproCommand::default();
        stream.push_vpro(self.conv_vpro(proto, buffer, lane_mask, &mut mem_layout))?;

        if proto.last {
            let fused = self.fused.clone();
            fused::pool_activation(view, &fused, stream, &mut mem_layout)?;
            let cmd = fused::shift_store(view, &fused, &mut mem_layout, store_buffer);
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
                    stream.push_dma(data_store_1d(view, seg, cl, un, ln, buffer));
                }
            }
            next_hardware_element(&view.arch, &mut cl, &mut un, &mut ln);
        }
        Ok(())
    }
}
