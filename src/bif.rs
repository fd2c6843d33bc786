//! Binary interchange format shared with the on-device runtime.
//!
//! Record sizes, field order and the magic word are the wire contract; the
//! runtime reads these structures in place. Encoding uses host-native
//! integer representation: host and target are assumed to share endianness
//! and struct packing (portability assumption, not a correctness property).

use crate::arch::{MAX_X_END, MAX_Y_END, MAX_Z_END};
use crate::error::{CompilerError, Result};
use crate::graph::config::Pad;

/// First word of the program blob.
pub const NET_MAGICWORD: u32 = 0x4549_5356; // "EISV"

/// Every command segment occupies one fixed-size slot.
pub const COMMAND_SEGMENT_BYTES: usize = 64;

/// Fixed-size head of one LAYER record; command segments follow directly.
pub const LAYER_RECORD_BYTES: usize = 180;

/// NET header before the per-layer offset table.
pub const NET_HEADER_BYTES: usize = 24;

/// All structure boundaries inside the program blob are 32 byte aligned.
pub const BLOB_ALIGN: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandType {
    VproCmd = 1,
    DmaCmd = 2,
    VproWait = 3,
    DmaWait = 4,
    BothSync = 5,
    DmaBlock = 6,
    DmaLoop = 7,
    DmaSetPadding = 8,
    ScatterCmd = 9,
}

/// Vector operations understood by the runtime kernel library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum VproOp {
    #[default]
    Nop = 0,
    ConvStart,
    ConvAdd,
    ConvTransposeStart,
    ConvTransposeAdd,
    Conv1dStart,
    Conv1dAdd,
    MaxPooling,
    AvgPool2d,
    GlobalAvgPool2dStart,
    GlobalAvgPool2dAdd,
    GlobalAvgPool2dDivide,
    GlobalMaxPool2dStart,
    GlobalMaxPool2dAdd,
    GlobalMaxPool2dStore,
    Add,
    Mul,
    Concatenate,
    DepthToSpace,
    MaxPool2x2Fused,
    ActivationFused,
    ShiftStore,
    ShiftStoreUpsample,
    SetMasks,
    ResetIndices,
    ReluPoolScatter,
    DconvDeform8x8,
    DconvConvStart,
    DconvConvAdd,
}

/// One broadcast vector instruction. The runtime derives the 4D operand
/// addressing from the end bounds and the memory-layout fields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VproCommand {
    pub command: VproOp,
    /// bit mask of participating lanes within each unit
    pub lane_mask: u16,
    /// LM word offset of the active double-buffer half (input data)
    pub buffer: u16,
    pub xend: u16,
    pub yend: u16,
    pub zend: u16,
    /// explicit pipeline bubbles before the first instruction
    pub nops: u16,
    pub shift_right: i16,
    pub rf_frac_bits: i16,
    pub rf_base: u16,
    pub rf_ch_stride: u16,
    pub lm_base: u16,
    pub lm_ch_stride: u16,
    pub lm_lane_stride: u16,
    pub kernel_load_buffer_l0: u16,
    pub kernel_load_buffer_l1: u16,
    pub bias_load_buffer_l0: u16,
    pub bias_load_buffer_l1: u16,
    /// elementwise: (bc_ch1, bc_y1, bc_x1, bc_ch0, bc_y0, bc_x0)
    pub broadcast_map: u16,
    /// secondary LM address (store region, segment index, ...)
    pub offset: u16,
    pub in_ch_offset: u16,
    pub pre_shift_right: i16,
    pub multiplier: i16,
    pub cluster_mask: u16,
    pub unit_mask: u16,
    pub pp_index_buffer: u16,
    pub deform_offset_buffer: u16,
    pub deform_output_buffer: u16,
}

impl VproCommand {
    /// End bounds must fit the ISA field widths; everything else is
    /// range-checked by construction.
    pub fn validate(&self, layer: &str) -> Result<()> {
        if self.xend as u32 > MAX_X_END {
            return Err(overflow(layer, "x_end", self.xend as i64, 6));
        }
        if self.yend as u32 > MAX_Y_END {
            return Err(overflow(layer, "y_end", self.yend as i64, 6));
        }
        if self.zend as u32 > MAX_Z_END {
            return Err(overflow(layer, "z_end", self.zend as i64, 10));
        }
        Ok(())
    }
}

fn overflow(layer: &str, field: &'static str, value: i64, bits: u32) -> CompilerError {
    CompilerError::BitWidthOverflow {
        layer: layer.to_string(),
        field,
        value,
        bits,
    }
}

/// Transfer direction of one DMA descriptor. Bit 1 distinguishes loads
/// (ext-to-local) from stores (local-to-ext).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DmaDirection {
    #[default]
    E2L1D = 0b00,
    E2L2D = 0b01,
    L2E1D = 0b10,
    L2E2D = 0b11,
}

impl DmaDirection {
    pub fn is_load(self) -> bool {
        matches!(self, DmaDirection::E2L1D | DmaDirection::E2L2D)
    }

    pub fn is_1d(self) -> bool {
        matches!(self, DmaDirection::E2L1D | DmaDirection::L2E1D)
    }

    pub fn to_1d(self) -> DmaDirection {
        if self.is_load() {
            DmaDirection::E2L1D
        } else {
            DmaDirection::L2E1D
        }
    }
}

pub const PAD_TOP: u8 = 1 << 0;
pub const PAD_RIGHT: u8 = 1 << 1;
pub const PAD_BOTTOM: u8 = 1 << 2;
pub const PAD_LEFT: u8 = 1 << 3;

pub fn pad_mask(top: bool, right: bool, bottom: bool, left: bool) -> u8 {
    (top as u8) * PAD_TOP
        | (right as u8) * PAD_RIGHT
        | (bottom as u8) * PAD_BOTTOM
        | (left as u8) * PAD_LEFT
}

/// One block transfer between main memory and local memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DmaCommand {
    pub direction: DmaDirection,
    /// pad-edge mask; padded pixels are materialised by the DMA engine
    pub padding: u8,
    pub is_bias_offset: bool,
    pub is_kernel_offset: bool,
    /// overcalc words to drop from the end of a 1D store (store splitter)
    pub skipped_elements_at_end: u8,
    pub cluster_mask: u32,
    pub unit_mask: u32,
    pub mm_addr: u32,
    pub lm_addr: u32,
    pub x_size: u16,
    pub y_size: u16,
    /// words to skip in MM at each row end (2D transfers)
    pub y_leap: i32,
}

impl DmaCommand {
    pub fn words(&self) -> u32 {
        self.x_size as u32 * self.y_size as u32
    }

    /// Equality over everything except the unit mask, used by the
    /// unit-broadcast merger.
    pub fn same_payload_ignoring_units(&self, other: &DmaCommand) -> bool {
        let mut a = *self;
        let mut b = *other;
        a.unit_mask = 0;
        b.unit_mask = 0;
        a == b
    }

    /// Equality over everything except the cluster mask, used by the
    /// cluster-broadcast merger.
    pub fn same_payload_ignoring_clusters(&self, other: &DmaCommand) -> bool {
        let mut a = *self;
        let mut b = *other;
        a.cluster_mask = 0;
        b.cluster_mask = 0;
        a == b
    }
}

/// Scatter of point features into a 2D grid, executed by the runtime on the
/// host core (optionally through the VPRO DMA path).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScatterCommand {
    pub index_shift: i16,
    pub xmin_fixed: i16,
    pub ymin_fixed: i16,
    pub memcopy_size: u16,
    pub use_vpro_dma: u16,
    pub mm_addr_coords: u32,
    pub mm_addr_features: u32,
    pub mm_addr_grid: u32,
}

/// Tagged union over everything the runtime replays.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandSegment {
    Vpro(VproCommand),
    Dma(DmaCommand),
    /// drain the compute pipe
    VproWait,
    /// drain the DMA queue
    DmaWait,
    /// drain both
    BothSync,
    /// the next `count` DMA descriptors form one burst
    DmaBlock { count: u32 },
    /// replay the next descriptor `count` times, adding `mm_stride` bytes to
    /// its external address per iteration
    DmaLoop { count: u16, mm_stride: i32 },
    /// switch the DMA pad widths for subsequent transfers
    DmaSetPadding(Pad),
    Scatter(ScatterCommand),
}

impl CommandSegment {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandSegment::Vpro(_) => CommandType::VproCmd,
            CommandSegment::Dma(_) => CommandType::DmaCmd,
            CommandSegment::VproWait => CommandType::VproWait,
            CommandSegment::DmaWait => CommandType::DmaWait,
            CommandSegment::BothSync => CommandType::BothSync,
            CommandSegment::DmaBlock { .. } => CommandType::DmaBlock,
            CommandSegment::DmaLoop { .. } => CommandType::DmaLoop,
            CommandSegment::DmaSetPadding(_) => CommandType::DmaSetPadding,
            CommandSegment::Scatter(_) => CommandType::ScatterCmd,
        }
    }

    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            CommandSegment::VproWait | CommandSegment::DmaWait | CommandSegment::BothSync
        )
    }

    pub fn encode(&self) -> [u8; COMMAND_SEGMENT_BYTES] {
        let mut w = ByteWriter::new(COMMAND_SEGMENT_BYTES);
        w.u32(self.command_type() as u32);
        match self {
            CommandSegment::Vpro(v) => {
                w.u16(v.command as u16);
                w.u16(v.lane_mask);
                w.u16(v.buffer);
                w.u16(v.xend);
                w.u16(v.yend);
                w.u16(v.zend);
                w.u16(v.nops);
                w.i16(v.shift_right);
                w.i16(v.rf_frac_bits);
                w.u16(v.rf_base);
                w.u16(v.rf_ch_stride);
                w.u16(v.lm_base);
                w.u16(v.lm_ch_stride);
                w.u16(v.lm_lane_stride);
                w.u16(v.kernel_load_buffer_l0);
                w.u16(v.kernel_load_buffer_l1);
                w.u16(v.bias_load_buffer_l0);
                w.u16(v.bias_load_buffer_l1);
                w.u16(v.broadcast_map);
                w.u16(v.offset);
                w.u16(v.in_ch_offset);
                w.i16(v.pre_shift_right);
                w.i16(v.multiplier);
                w.u16(v.cluster_mask);
                w.u16(v.unit_mask);
                w.u16(v.pp_index_buffer);
                w.u16(v.deform_offset_buffer);
                w.u16(v.deform_output_buffer);
            }
            CommandSegment::Dma(d) => {
                w.u8(d.direction as u8);
                w.u8(d.padding);
                w.u8((d.is_bias_offset as u8) | ((d.is_kernel_offset as u8) << 1));
                w.u8(d.skipped_elements_at_end);
                w.u32(d.cluster_mask);
                w.u32(d.unit_mask);
                w.u32(d.mm_addr);
                w.u32(d.lm_addr);
                w.u16(d.x_size);
                w.u16(d.y_size);
                w.i32(d.y_leap);
            }
            CommandSegment::VproWait | CommandSegment::DmaWait | CommandSegment::BothSync => {}
            CommandSegment::DmaBlock { count } => w.u32(*count),
            CommandSegment::DmaLoop { count, mm_stride } => {
                w.u16(*count);
                w.u16(0);
                w.i32(*mm_stride);
            }
            CommandSegment::DmaSetPadding(p) => {
                w.i32(p.top);
                w.i32(p.right);
                w.i32(p.bottom);
                w.i32(p.left);
                w.i16(p.value);
            }
            CommandSegment::Scatter(s) => {
                w.i16(s.index_shift);
                w.i16(s.xmin_fixed);
                w.i16(s.ymin_fixed);
                w.u16(s.memcopy_size);
                w.u16(s.use_vpro_dma);
                w.u16(0);
                w.u32(s.mm_addr_coords);
                w.u32(s.mm_addr_features);
                w.u32(s.mm_addr_grid);
            }
        }
        w.into_fixed()
    }

    /// Single-line dump for `generated/commands.txt`.
    pub fn to_line(&self) -> String {
        match self {
            CommandSegment::Vpro(v) => format!(
                "VPRO {:?} lanes 0x{:x} buf {} xyz_end {}/{}/{} nops {} shr {} lm 0x{:04x}",
                v.command,
                v.lane_mask,
                v.buffer,
                v.xend,
                v.yend,
                v.zend,
                v.nops,
                v.shift_right,
                v.lm_base
            ),
            CommandSegment::Dma(d) => format!(
                "DMA {:?} cl 0x{:02x} un 0x{:02x} mm 0x{:08x} lm 0x{:04x} x {} y {} leap {} pad {:04b}{}{}{}",
                d.direction,
                d.cluster_mask,
                d.unit_mask,
                d.mm_addr,
                d.lm_addr,
                d.x_size,
                d.y_size,
                d.y_leap,
                d.padding,
                if d.is_kernel_offset { " kernel" } else { "" },
                if d.is_bias_offset { " bias" } else { "" },
                if d.skipped_elements_at_end != 0 {
                    format!(" skip {}", d.skipped_elements_at_end)
                } else {
                    String::new()
                },
            ),
            CommandSegment::VproWait => "VPRO_WAIT".to_string(),
            CommandSegment::DmaWait => "DMA_WAIT".to_string(),
            CommandSegment::BothSync => "SYNC".to_string(),
            CommandSegment::DmaBlock { count } => format!("DMA_BLOCK n {count}"),
            CommandSegment::DmaLoop { count, mm_stride } => {
                format!("DMA_LOOP n {count} stride {mm_stride}")
            }
            CommandSegment::DmaSetPadding(p) => format!(
                "DMA_SET_PADDING trbl {} {} {} {} value {}",
                p.top, p.right, p.bottom, p.left, p.value
            ),
            CommandSegment::Scatter(s) => format!(
                "SCATTER coords 0x{:08x} features 0x{:08x} grid 0x{:08x}",
                s.mm_addr_coords, s.mm_addr_features, s.mm_addr_grid
            ),
        }
    }
}

/// Geometry of one tensor as the runtime sees it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TensorRef {
    pub mm_base: u32,
    pub x: u32,
    pub y: u32,
    pub y_stride: u32,
    pub channels: u32,
}

/// Fixed head of one LAYER record inside the program blob.
#[derive(Clone, Debug, Default)]
pub struct LayerRecord {
    pub wire_type: u32,
    pub number: i32,
    pub in_channels: u32,
    pub out_channels: u32,
    pub dynamic_shape: bool,

    pub seg_out_w: u32,
    pub seg_out_h: u32,
    pub seg_in_w: u32,
    pub seg_in_h: u32,

    pub stride: u32,
    pub kernel_length: u32,
    pub conv_groups: u32,
    pub dilation_rate_w: u32,
    pub dilation_rate_h: u32,

    pub conv_result_shift_right: i16,
    pub bias_shift_right: i16,
    pub store_shift_right: i16,
    pub relu_6_shift_left: i16,
    pub alpha_mulh_shift_right: i16,
    pub pool_avg_shiftr: i16,
    pub elwise_0_left_shift: i16,
    pub elwise_1_left_shift: i16,

    pub alpha: u16,
    pub activation: u16,
    pub pool_stride: u16,
    pub pool_size_w: u16,
    pub pool_size_h: u16,

    pub axis: i32,
    pub block_size: u16,

    pub pad: Pad,
    pub subpixel_pad: [u16; 4],
    pub input_pixels_w: u16,
    pub input_pixels_h: u16,

    pub deform_max_offset_x: u16,
    pub deform_max_offset_y: u16,
    /// LM address of the static deform offset table
    pub deform_static_offsets: u16,

    pub input: TensorRef,
    pub output: TensorRef,

    pub last_layer_using_input: bool,
    pub first_layer_producing_output: bool,
    pub parallel_outchannels_per_lane: u16,
    pub parallel_inchannels_per_lane: u16,

    pub command_segments_count: u32,
}

impl LayerRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new(LAYER_RECORD_BYTES);
        w.u32(self.wire_type);
        w.i32(self.number);
        w.u32(self.in_channels);
        w.u32(self.out_channels);
        w.u32(self.dynamic_shape as u32);
        w.u32(self.seg_out_w);
        w.u32(self.seg_out_h);
        w.u32(self.seg_in_w);
        w.u32(self.seg_in_h);
        w.u32(self.stride);
        w.u32(self.kernel_length);
        w.u32(self.conv_groups);
        w.u32(self.dilation_rate_w);
        w.u32(self.dilation_rate_h);
        w.i16(self.conv_result_shift_right);
        w.i16(self.bias_shift_right);
        w.i16(self.store_shift_right);
        w.i16(self.relu_6_shift_left);
        w.i16(self.alpha_mulh_shift_right);
        w.i16(self.pool_avg_shiftr);
        w.i16(self.elwise_0_left_shift);
        w.i16(self.elwise_1_left_shift);
        w.u16(self.alpha);
        w.u16(self.activation);
        w.u16(self.pool_stride);
        w.u16(self.pool_size_w);
        w.u16(self.pool_size_h);
        w.i32(self.axis);
        w.u16(self.block_size);
        w.i32(self.pad.top);
        w.i32(self.pad.right);
        w.i32(self.pad.bottom);
        w.i32(self.pad.left);
        w.i16(self.pad.value);
        w.i16(0); // alignment
        for s in self.subpixel_pad {
            w.u16(s);
        }
        w.u16(self.input_pixels_w);
        w.u16(self.input_pixels_h);
        w.u16(self.deform_max_offset_x);
        w.u16(self.deform_max_offset_y);
        w.u16(self.deform_static_offsets);
        w.u16(0); // alignment
        for t in [&self.input, &self.output] {
            w.u32(t.mm_base);
            w.u32(t.x);
            w.u32(t.y);
            w.u32(t.y_stride);
            w.u32(t.channels);
        }
        w.u8(self.last_layer_using_input as u8);
        w.u8(self.first_layer_producing_output as u8);
        w.u16(self.parallel_outchannels_per_lane);
        w.u16(self.parallel_inchannels_per_lane);
        w.u16(0); // alignment
        w.u32(self.command_segments_count);
        let out = w.finish();
        debug_assert_eq!(out.len(), LAYER_RECORD_BYTES);
        out
    }
}

/// NET header; the per-layer byte-offset table follows directly.
#[derive(Clone, Copy, Debug, Default)]
pub struct NetHeader {
    pub magicword: u32,
    pub blobsize: u32,
    pub reserved: u32,
    pub layer_count: u32,
    pub layer_execlist_count: u32,
    pub layer_execlist_offs: u32,
}

impl NetHeader {
    pub fn encode(&self) -> [u8; NET_HEADER_BYTES] {
        let mut w = ByteWriter::new(NET_HEADER_BYTES);
        w.u32(self.magicword);
        w.u32(self.blobsize);
        w.u32(self.reserved);
        w.u32(self.layer_count);
        w.u32(self.layer_execlist_count);
        w.u32(self.layer_execlist_offs);
        w.into_fixed()
    }
}

/// Appends host-native integers into a zero-padded fixed frame.
struct ByteWriter {
    buf: Vec<u8>,
    cap: usize,
}

impl ByteWriter {
    fn new(cap: usize) -> Self {
        ByteWriter {
            buf: Vec::with_capacity(cap),
            cap,
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn finish(mut self) -> Vec<u8> {
        assert!(self.buf.len() <= self.cap, "record overflows its frame");
        self.buf.resize(self.cap, 0);
        self.buf
    }

    fn into_fixed<const N: usize>(self) -> [u8; N] {
        let v = self.finish();
        v.try_into().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frames_are_fixed_size() {
        let v = CommandSegment::Vpro(VproCommand::default());
        let d = CommandSegment::Dma(DmaCommand::default());
        assert_eq!(v.encode().len(), COMMAND_SEGMENT_BYTES);
        assert_eq!(d.encode().len(), COMMAND_SEGMENT_BYTES);
        assert_eq!(CommandSegment::DmaWait.encode().len(), COMMAND_SEGMENT_BYTES);
    }

    #[test]
    fn layer_record_size_is_stable() {
        assert_eq!(LayerRecord::default().encode().len(), LAYER_RECORD_BYTES);
    }

    #[test]
    fn vpro_end_bounds_are_checked() {
        let mut v = VproCommand::default();
        v.xend = 63;
        v.zend = 1023;
        assert!(v.validate("l").is_ok());
        v.xend = 64;
        assert!(matches!(
            v.validate("l"),
            Err(CompilerError::BitWidthOverflow { field: "x_end", .. })
        ));
    }

    #[test]
    fn pad_mask_bit_order() {
        assert_eq!(pad_mask(true, false, false, false), PAD_TOP);
        assert_eq!(pad_mask(true, true, true, true), 0b1111);
    }

    #[test]
    fn dma_payload_comparison_ignores_masks() {
        let a = DmaCommand {
            unit_mask: 0b01,
            mm_addr: 0x8100_0000,
            ..Default::default()
        };
        let b = DmaCommand {
            unit_mask: 0b10,
            ..a
        };
        assert!(a.same_payload_ignoring_units(&b));
        assert!(!a.same_payload_ignoring_clusters(&DmaCommand {
            mm_addr: 0x8100_0010,
            ..b
        }));
    }
}
