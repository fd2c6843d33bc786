use derive_more::Display;
use serde::Deserialize;

pub const STRIDE_UNSET: i32 = i32::MIN;
pub const GROUPS_UNSET: i32 = i32::MIN;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Default, Deserialize)]
pub enum PaddingMode {
    #[display("same")]
    #[serde(rename = "same")]
    Same,
    #[display("valid")]
    #[serde(rename = "valid")]
    #[default]
    Valid,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    #[display("none")]
    None,
    #[display("relu")]
    Relu,
    #[display("relu6")]
    Relu6,
    #[display("leakyrelu")]
    LeakyRelu,
    #[display("sigmoid")]
    Sigmoid,
    #[display("swish")]
    Swish,
}

/// Order in which segment seeds are handed to the lane packer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SchedulingOrder {
    /// channels innermost (default)
    #[default]
    SortedOutc,
    /// new (x, y) location after every `parallel_lanes` output channels
    SortedX,
    /// new (x, y) location after every `lanes * parallel_outchannels_per_lane`
    /// output channels
    SortedX2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SegmentationStrategy {
    /// fast to compute, the resulting VPRO execution may be slow
    FastHeuristic,
    /// takes time to design the segmentation, faster VPRO execution
    #[default]
    DetailedHeuristic,
}

/// Per-layer command generation options.
#[derive(Clone, Copy, Debug)]
pub struct LayerCfg {
    pub use_dma_merger: bool,
    /// deprecated, use dma_extension instead
    pub use_dma_interleaver: bool,
    pub use_dma_extension: bool,
    pub use_dma_store_splitter: bool,
    pub use_dma_loop_extension: bool,
    pub use_dma_l2e_mix_extension: bool,
    pub scheduling_order: SchedulingOrder,
    pub segmentation_strategy: SegmentationStrategy,
    pub force_segment_dump: bool,
}

impl Default for LayerCfg {
    fn default() -> Self {
        LayerCfg {
            use_dma_merger: true,
            use_dma_interleaver: false,
            use_dma_extension: true,
            use_dma_store_splitter: true,
            use_dma_loop_extension: true,
            use_dma_l2e_mix_extension: false,
            scheduling_order: SchedulingOrder::SortedOutc,
            segmentation_strategy: SegmentationStrategy::DetailedHeuristic,
            force_segment_dump: false,
        }
    }
}

/// Padding widths around a feature map, in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pad {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
    /// element value materialised in the padded pixels
    pub value: i16,
}

impl Pad {
    pub fn trbl(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Pad {
            top,
            right,
            bottom,
            left,
            value: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.top == 0 && self.right == 0 && self.bottom == 0 && self.left == 0
    }
}

/// Input padding state of a layer. `algo` is the algorithm-view padding
/// around `in_dim`; `dma` additionally covers segmentation garbage and is
/// what the emitted DMA descriptors materialise.
#[derive(Clone, Copy, Debug, Default)]
pub struct LayerPadding {
    pub algo: Pad,
    pub dma: Pad,
    pub enabled: bool,
}

impl LayerPadding {
    pub fn enabled_default() -> Self {
        LayerPadding {
            enabled: true,
            ..Default::default()
        }
    }
}

/// Segmentation result: how one layer's work tiles into segments.
/// Strides default to the segment width/height when left unset.
#[derive(Clone, Copy, Debug)]
pub struct SegDim {
    /// number of segments per channel, horizontally
    pub num_x: i32,
    /// number of segments per channel, vertically
    pub num_y: i32,
    /// input segment geometry (elements)
    pub in_w: i32,
    pub in_h: i32,
    /// distance between left edges of horizontally consecutive input segments
    pub in_x_stride: i32,
    /// distance between top edges of vertically consecutive input segments
    pub in_y_stride: i32,
    /// output segment geometry (elements)
    pub out_w: i32,
    pub out_h: i32,
    pub out_x_stride: i32,
    pub out_y_stride: i32,
}

impl Default for SegDim {
    fn default() -> Self {
        SegDim {
            num_x: 0,
            num_y: 0,
            in_w: 0,
            in_h: 0,
            in_x_stride: STRIDE_UNSET,
            in_y_stride: STRIDE_UNSET,
            out_w: 0,
            out_h: 0,
            out_x_stride: STRIDE_UNSET,
            out_y_stride: STRIDE_UNSET,
        }
    }
}

impl SegDim {
    /// Fill unset strides with the segment extent.
    pub fn default_strides(&mut self) {
        if self.in_x_stride == STRIDE_UNSET {
            self.in_x_stride = self.in_w;
        }
        if self.in_y_stride == STRIDE_UNSET {
            self.in_y_stride = self.in_h;
        }
        if self.out_x_stride == STRIDE_UNSET {
            self.out_x_stride = self.out_w;
        }
        if self.out_y_stride == STRIDE_UNSET {
            self.out_y_stride = self.out_h;
        }
    }
}

/// Per-layer command counters, recomputed by the compressor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CmdCount {
    pub sync: u32,
    pub vpro: u32,
    pub dma: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cfg_matches_documented_defaults() {
        let cfg = LayerCfg::default();
        assert!(cfg.use_dma_merger);
        assert!(cfg.use_dma_extension);
        assert!(cfg.use_dma_store_splitter);
        assert!(cfg.use_dma_loop_extension);
        assert!(!cfg.use_dma_l2e_mix_extension);
        assert!(!cfg.use_dma_interleaver);
        assert_eq!(cfg.scheduling_order, SchedulingOrder::SortedOutc);
        assert_eq!(
            cfg.segmentation_strategy,
            SegmentationStrategy::DetailedHeuristic
        );
    }

    #[test]
    fn strides_default_to_extent() {
        let mut seg = SegDim {
            in_w: 8,
            in_h: 4,
            out_w: 6,
            out_h: 3,
            ..Default::default()
        };
        seg.default_strides();
        assert_eq!((seg.in_x_stride, seg.in_y_stride), (8, 4));
        assert_eq!((seg.out_x_stride, seg.out_y_stride), (6, 3));
    }
}
