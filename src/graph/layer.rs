use crate::arch::MmAddr;
use crate::bif::CommandSegment;
use crate::graph::config::{
    Activation, CmdCount, LayerCfg, LayerPadding, Pad, PaddingMode, SegDim, GROUPS_UNSET,
    STRIDE_UNSET,
};
use crate::graph::dim::Dim;
use crate::segments::Segment;

/// Stable handle of a layer inside the [`Net`](crate::graph::Net) arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayerId(pub usize);

/// Fused activation / pooling / upsampling tail shared by the conv family
/// and the elementwise layers.
#[derive(Clone, Debug)]
pub struct FusedOps {
    pub activation: Activation,
    /// leakyrelu slope, fixed point
    pub alpha: u16,
    /// 2x2 max pooling merged into the layer; `[1, 1]` = off
    pub pool_size: [i32; 2],
    /// apply activation before pooling instead of after
    pub pool_after_activation: bool,
    pub upsampling_scale: i32,
    pub store_shift_right: i16,
    pub rf_frac_bits: i16,
    pub alpha_mulh_shift_right: i16,
}

impl Default for FusedOps {
    fn default() -> Self {
        FusedOps {
            activation: Activation::None,
            alpha: 0,
            pool_size: [1, 1],
            pool_after_activation: false,
            upsampling_scale: 1,
            store_shift_right: 0,
            rf_frac_bits: 0,
            alpha_mulh_shift_right: 0,
        }
    }
}

/// Parameters of the 2D convolution family (Conv2D, MaxPool2D, DConvConv
/// reuse this machinery).
#[derive(Clone, Debug)]
pub struct ConvParams {
    pub kernel_length: i32,
    pub stride: i32,
    pub dilation: [i32; 2],
    pub use_bias: bool,
    /// ZeroPadding2D layer fused into this layer; independent of
    /// `padding_mode`, both may be active at the same time
    pub pre_zp: Pad,
    pub padding_mode: PaddingMode,
    pub result_shift_right: i16,
    pub bias_shift_right: i16,
    /// manual 1x1 fast-path overrides; < 0 = pick automatically
    pub outchannel_block_size: i32,
    pub outchannel_parallelism: i32,
    pub fused: FusedOps,

    // derived by process_params / segmentation
    pub dilated_kernel_w: i32,
    pub dilated_kernel_h: i32,
    pub conv_in_w: i32,
    pub conv_in_h: i32,
    /// conv output geometry before fused pooling/upsampling
    pub conv_out_w: i32,
    pub conv_out_h: i32,
    /// chosen segment output size, pre-pooling
    pub conv_seg_w: i32,
    pub conv_seg_h: i32,
    /// garbage elements computed past the image end on the 1D fast path
    pub overcalc_elements_1d: i32,
}

impl Default for ConvParams {
    fn default() -> Self {
        ConvParams {
            kernel_length: 1,
            stride: 1,
            dilation: [1, 1],
            use_bias: false,
            pre_zp: Pad::default(),
            padding_mode: PaddingMode::Same,
            result_shift_right: 0,
            bias_shift_right: 0,
            outchannel_block_size: -1,
            outchannel_parallelism: -1,
            fused: FusedOps::default(),
            dilated_kernel_w: 1,
            dilated_kernel_h: 1,
            conv_in_w: 0,
            conv_in_h: 0,
            conv_out_w: 0,
            conv_out_h: 0,
            conv_seg_w: 0,
            conv_seg_h: 0,
            overcalc_elements_1d: 0,
        }
    }
}

/// Conv2DTranspose adds the sub-pixel padding split to the conv parameters.
#[derive(Clone, Debug, Default)]
pub struct ConvTransposeParams {
    pub conv: ConvParams,
    /// offset sub-pixel padding (< stride), applied after whole-pixel padding
    pub subpixel_padding: Pad,
    /// actual input pixels per segment
    pub input_pixels_w: u16,
    pub input_pixels_h: u16,
}

#[derive(Clone, Debug)]
pub struct Conv1dParams {
    pub kernel_length: i32,
    pub stride: i32,
    pub use_bias: bool,
    /// load all weights required for one output channel at once
    pub load_weights_at_once: bool,
    pub result_shift_right: i16,
    pub bias_shift_right: i16,
    pub fused: FusedOps,
}

impl Default for Conv1dParams {
    fn default() -> Self {
        Conv1dParams {
            kernel_length: 1,
            stride: 1,
            use_bias: false,
            load_weights_at_once: true,
            result_shift_right: 0,
            bias_shift_right: 0,
            fused: FusedOps::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ElwiseParams {
    pub input_shift_left: [i16; 2],
    /// Mul only: shift after the high multiplication
    pub mulh_shift_right: i16,
    pub fused: FusedOps,
}

impl Default for ElwiseParams {
    fn default() -> Self {
        ElwiseParams {
            input_shift_left: [0, 0],
            mulh_shift_right: 0,
            fused: FusedOps::default(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConcatParams {
    /// 0 = x, 1 = y, 2 = channel; only channel concatenation generates code
    pub axis: i32,
    pub in_shifts_right: Vec<i16>,
    // derived channel bookkeeping
    pub oc_to_ic_map: Vec<i32>,
    pub oc_to_src_map: Vec<usize>,
    pub seg_to_src_map: Vec<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct AvgPoolParams {
    pub pool_size: [i32; 2],
    pub pool_stride: [i32; 2],
    pub pool_padding_mode: PaddingMode,
    pub store_shift_right: i16,
    /// fixed-point shift of the reciprocal divisor map (2.14)
    pub pool_avg_shiftr: i16,
}

impl AvgPoolParams {
    pub fn new(pool_size: i32, pool_stride: i32, mode: PaddingMode) -> Self {
        AvgPoolParams {
            pool_size: [pool_size, pool_size],
            pool_stride: [pool_stride, pool_stride],
            pool_padding_mode: mode,
            store_shift_right: 0,
            pool_avg_shiftr: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct GlobalPoolParams {
    pub pre_shift_right: i16,
    pub multiplier: i16,
    pub store_shift_right: i16,
    pub pool_avg_shiftr: i16,
    // derived by segmentation
    pub lanes_per_ch: i32,
    pub sets_per_ch: i32,
}

#[derive(Clone, Debug, Default)]
pub struct DepthToSpaceParams {
    pub block_size: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScatterPoolMode {
    #[default]
    None,
    Max,
}

#[derive(Clone, Debug, Default)]
pub struct ScatterParams {
    pub xmin: f32,
    pub xmax: f32,
    pub ymin: f32,
    pub ymax: f32,
    pub res: f32,
    pub pool_mode: ScatterPoolMode,
    pub use_vpro_dma: bool,
    pub index_shift: i16,
    pub xmin_fixed: i16,
    pub ymin_fixed: i16,
    // derived
    pub n_cells_x: i32,
    pub n_cells_y: i32,
    pub memcopy_size: u16,
}

#[derive(Clone, Debug, Default)]
pub struct PointPillarsParams {
    pub conv: Conv1dParams,
    pub xmin: f32,
    pub xmax: f32,
    pub ymin: f32,
    pub ymax: f32,
    pub res: f32,
    pub max_points_per_seg: i32,
    /// multicast VPRO commands per grid segment instead of broadcasting
    pub use_segmentwise_multicast: bool,
    // derived
    pub n_cells_x: i32,
    pub n_cells_y: i32,
}

#[derive(Clone, Debug)]
pub struct DConvDeformParams {
    pub kernel_size: i32,
    /// offsets sampled beyond this are clamped to zero
    pub max_offset_x: i32,
    pub max_offset_y: i32,
    pub result_shift_right: i16,
}

impl Default for DConvDeformParams {
    fn default() -> Self {
        DConvDeformParams {
            kernel_size: 9,
            max_offset_x: 4,
            max_offset_y: 4,
            result_shift_right: 8,
        }
    }
}

/// The layer variants understood by the compiler.
#[derive(Clone, Debug)]
pub enum LayerKind {
    Input,
    DynamicAxis { axis: i16 },
    Conv2d(ConvParams),
    Conv1d(Conv1dParams),
    Conv2dTranspose(ConvTransposeParams),
    MaxPool2d(ConvParams),
    AvgPool2d(AvgPoolParams),
    GlobalAvgPool2d(GlobalPoolParams),
    GlobalMaxPool2d(GlobalPoolParams),
    Add(ElwiseParams),
    Mul(ElwiseParams),
    Concatenate(ConcatParams),
    DepthToSpace(DepthToSpaceParams),
    Reshape,
    SliceChannel { start: i32, stop: i32 },
    ScatterToGrid(ScatterParams),
    PointPillars(PointPillarsParams),
    DConvDeform(DConvDeformParams),
    DConvConv(ConvParams),
}

impl LayerKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerKind::Input => "Input",
            LayerKind::DynamicAxis { .. } => "DynamicAxis",
            LayerKind::Conv2d(_) => "Conv2D",
            LayerKind::Conv1d(_) => "Conv1D",
            LayerKind::Conv2dTranspose(_) => "Conv2DTranspose",
            LayerKind::MaxPool2d(_) => "MaxPool2D",
            LayerKind::AvgPool2d(_) => "AveragePooling2D",
            LayerKind::GlobalAvgPool2d(_) => "GlobalAvgPool2D",
            LayerKind::GlobalMaxPool2d(_) => "GlobalMaxPool2D",
            LayerKind::Add(_) => "Add",
            LayerKind::Mul(_) => "Mul",
            LayerKind::Concatenate(_) => "Concatenate",
            LayerKind::DepthToSpace(_) => "DepthToSpace",
            LayerKind::Reshape => "Reshape",
            LayerKind::SliceChannel { .. } => "SliceChannel",
            LayerKind::ScatterToGrid(_) => "ScatterToGrid",
            LayerKind::PointPillars(_) => "PointPillars",
            LayerKind::DConvDeform(_) => "DConvDeform",
            LayerKind::DConvConv(_) => "DConvConv",
        }
    }

    /// Numeric layer type in the binary interchange format.
    pub fn wire_type(&self) -> u32 {
        match self {
            LayerKind::Input => 0,
            LayerKind::Conv1d(_) => 1,
            LayerKind::Conv2d(_) => 2,
            LayerKind::Conv2dTranspose(_) => 3,
            LayerKind::MaxPool2d(_) => 4,
            LayerKind::AvgPool2d(_) => 5,
            LayerKind::GlobalAvgPool2d(_) => 6,
            LayerKind::GlobalMaxPool2d(_) => 7,
            LayerKind::Add(_) => 8,
            LayerKind::Mul(_) => 9,
            LayerKind::Concatenate(_) => 10,
            LayerKind::DepthToSpace(_) => 11,
            LayerKind::Reshape => 12,
            LayerKind::SliceChannel { .. } => 13,
            LayerKind::DynamicAxis { .. } => 14,
            LayerKind::ScatterToGrid(_) => 15,
            LayerKind::PointPillars(_) => 16,
            LayerKind::DConvDeform(_) => 17,
            LayerKind::DConvConv(_) => 18,
        }
    }
}

/// Quantised weight payload of a layer.
#[derive(Clone, Debug, Default)]
pub struct Weights {
    /// format depends on the layer kind; conv kernels are
    /// `[ch_in_group][ch_out][ky][kx]` row-major, bias appended
    pub packed: Vec<i16>,
    pub loaded: bool,
    pub fname: Option<String>,
    pub mm_addr: MmAddr,
}

/// One node of the CNN graph. Common state lives here, kind-specific
/// parameters in [`LayerKind`].
#[derive(Clone, Debug)]
pub struct Layer {
    /// arbitrary human-readable name; does not need to be unique
    pub name: String,
    /// unique user-supplied handle, printed in parentheses: (17)
    pub number: i32,
    pub kind: LayerKind,
    /// exactly one output dimension per layer
    pub out_dim: Dim,
    /// groups == 1: each output channel depends on all input channels;
    /// groups == out.ch == in.ch: depthwise
    pub groups: i32,
    /// layer output is a CNN result
    pub out_is_result: bool,
    pub cfg: LayerCfg,

    pub produces_binary_data: bool,
    pub is_input_layer: bool,
    pub use_dynamic_shape: bool,

    /// host handshake: input no longer required after this layer ran
    pub last_layer_using_input: bool,
    /// host handshake: output valid once this layer ran
    pub first_layer_producing_output: bool,

    pub parallel_outchannels_per_lane: i32,
    pub parallel_inchannels_per_lane: i32,
    /// result stride between lanes in LM
    pub lm_lane_stride: i32,

    pub padding: LayerPadding,
    pub seg: SegDim,

    pub src_layers: Vec<LayerId>,
    pub dest_layers: Vec<LayerId>,

    pub weights: Weights,

    /// flattened `[set][cluster][unit][lane][parallel_out_ch]`
    pub segments: Vec<Segment>,
    pub commands: Vec<CommandSegment>,
    pub cmd_cnt: CmdCount,
}

impl Layer {
    pub fn new(name: impl Into<String>, number: i32, kind: LayerKind) -> Self {
        let is_input = matches!(kind, LayerKind::Input | LayerKind::DynamicAxis { .. });
        let produces_binary_data = !matches!(
            kind,
            LayerKind::Input | LayerKind::Reshape | LayerKind::SliceChannel { .. }
        );
        let padding = match kind {
            LayerKind::Input | LayerKind::Add(_) | LayerKind::Mul(_) => LayerPadding::default(),
            _ => LayerPadding::enabled_default(),
        };
        Layer {
            name: name.into(),
            number,
            kind,
            out_dim: Dim::default(),
            groups: GROUPS_UNSET,
            out_is_result: false,
            cfg: LayerCfg::default(),
            produces_binary_data,
            is_input_layer: is_input,
            use_dynamic_shape: false,
            last_layer_using_input: false,
            first_layer_producing_output: false,
            parallel_outchannels_per_lane: 1,
            parallel_inchannels_per_lane: 1,
            lm_lane_stride: STRIDE_UNSET,
            padding,
            seg: SegDim::default(),
            src_layers: Vec::new(),
            dest_layers: Vec::new(),
            weights: Weights::default(),
            segments: Vec::new(),
            commands: Vec::new(),
            cmd_cnt: CmdCount::default(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("'{}' ({})", self.name, self.number)
    }

    /// Characters 'I' and/or 'O' if this layer is a CNN input and/or output.
    pub fn io_str(&self, pre_space: bool, post_space: bool) -> String {
        let mut io = String::new();
        if self.is_input_layer {
            io.push('I');
        }
        if self.out_is_result {
            io.push('O');
        }
        if !io.is_empty() {
            if pre_space {
                io.insert(0, ' ');
            }
            if post_space {
                io.push(' ');
            }
        }
        io
    }

    pub fn default_weights_filename(&self) -> String {
        format!("weights/l{:03}_weights.bin", self.number)
    }

    pub fn fused_ops(&self) -> Option<&FusedOps> {
        match &self.kind {
            LayerKind::Conv2d(p) | LayerKind::MaxPool2d(p) | LayerKind::DConvConv(p) => {
                Some(&p.fused)
            }
            LayerKind::Conv2dTranspose(p) => Some(&p.conv.fused),
            LayerKind::Conv1d(p) => Some(&p.fused),
            LayerKind::Add(p) | LayerKind::Mul(p) => Some(&p.fused),
            LayerKind::PointPillars(p) => Some(&p.conv.fused),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_only_layers_produce_no_binary_data() {
        assert!(!Layer::new("r", 0, LayerKind::Reshape).produces_binary_data);
        assert!(
            !Layer::new("s", 1, LayerKind::SliceChannel { start: 0, stop: 4 })
                .produces_binary_data
        );
        assert!(!Layer::new("i", 2, LayerKind::Input).produces_binary_data);
        assert!(Layer::new("c", 3, LayerKind::Conv2d(ConvParams::default())).produces_binary_data);
    }

    #[test]
    fn io_markers() {
        let mut l = Layer::new("in", 0, LayerKind::Input);
        l.out_is_result = true;
        assert_eq!(l.io_str(true, false), " IO");
        assert_eq!(l.full_name(), "'in' (0)");
    }

    #[test]
    fn default_weight_path_is_zero_padded() {
        let l = Layer::new("c", 7, LayerKind::Conv2d(ConvParams::default()));
        assert_eq!(l.default_weights_filename(), "weights/l007_weights.bin");
    }
}
