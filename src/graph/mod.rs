//! CNN graph arena and the top-level compile driver.
//!
//! Coarse program flow:
//!
//! `Net::generate()`
//!   - builder has instantiated layers and connected them (`add_src_layers`)
//!   - `memory::design_mm_layout()` assigns output and weight addresses;
//!     assigning an output address cascades into segmentation and the
//!     memory image of the layer output
//!   - `generate_layer_execlist()`
//!   - `blob::generate_weights_blob()` / `blob::generate_program_blob()`
//!     (the latter runs segment generation, command emission and command
//!     compression per layer)
//!   - `io::export_*()` writes blobs, text dumps and simulator descriptors

pub mod config;
pub mod dim;
pub mod layer;

use std::path::PathBuf;

use tracing::{info, warn};

use crate::arch::{MemLayout, VproConfig};
use crate::error::Result;
use crate::{blob, io, memory};

pub use config::{
    Activation, CmdCount, LayerCfg, LayerPadding, Pad, PaddingMode, SchedulingOrder, SegDim,
    SegmentationStrategy, GROUPS_UNSET, STRIDE_UNSET,
};
pub use dim::{Dim, MmLayout};
pub use layer::{
    AvgPoolParams, ConcatParams, Conv1dParams, ConvParams, ConvTransposeParams, DConvDeformParams,
    DepthToSpaceParams, ElwiseParams, FusedOps, GlobalPoolParams, Layer, LayerId, LayerKind,
    PointPillarsParams, ScatterParams, ScatterPoolMode, Weights,
};

pub struct Net {
    pub name: String,
    pub arch: VproConfig,
    pub memlayout: MemLayout,
    pub layers: Vec<Layer>,
    /// indices into `layers`, in execution order
    pub layer_execlist: Vec<usize>,
    /// reverse the exec list for independent per-layer testing
    pub run_layers_decoupled: bool,
    /// exported files contain the same garbage right of and below the image
    /// as main memory
    pub file_format_with_garbage: bool,
    /// all outputs are written relative to this directory
    pub base_dir: PathBuf,

    pub program_blob: Vec<u8>,
    pub weights_blob: Vec<u8>,
}

impl Net {
    pub fn new(name: impl Into<String>, arch: VproConfig) -> Self {
        Net {
            name: name.into(),
            arch,
            memlayout: MemLayout::default(),
            layers: Vec::new(),
            layer_execlist: Vec::new(),
            run_layers_decoupled: false,
            file_format_with_garbage: true,
            base_dir: PathBuf::from("."),
            program_blob: Vec::new(),
            weights_blob: Vec::new(),
        }
    }

    pub fn add_layer(&mut self, layer: Layer) -> LayerId {
        self.layers.push(layer);
        LayerId(self.layers.len() - 1)
    }

    pub fn layer(&self, id: LayerId) -> &Layer {
        &self.layers[id.0]
    }

    pub fn layer_mut(&mut self, id: LayerId) -> &mut Layer {
        &mut self.layers[id.0]
    }

    /// Specify layer inputs; populates the consumer back-pointers.
    pub fn add_src_layers(&mut self, id: LayerId, sources: &[LayerId]) {
        for &s in sources {
            self.layers[id.0].src_layers.push(s);
            self.layers[s.0].dest_layers.push(id);
        }
    }

    /// Input dimensions are determined by the output of the source.
    pub fn in_dim(&self, id: LayerId, src_idx: usize) -> &Dim {
        let src = self.layers[id.0].src_layers[src_idx];
        &self.layers[src.0].out_dim
    }

    /// Cloned source dims, for operations that mutate the layer while
    /// reading its inputs.
    pub fn src_dims(&self, id: LayerId) -> Vec<Dim> {
        self.layers[id.0]
            .src_layers
            .iter()
            .map(|s| self.layers[s.0].out_dim.clone())
            .collect()
    }

    /// Takes transparent layers into account: a layer that does not produce
    /// binary data passes its input role through.
    pub fn is_transient_input_layer(&self, id: LayerId) -> bool {
        let l = &self.layers[id.0];
        if l.is_input_layer {
            return true;
        }
        if l.produces_binary_data {
            return false;
        }
        l.src_layers
            .iter()
            .any(|&s| self.is_transient_input_layer(s))
    }

    /// Default: execute binary-producing layers in instantiation order.
    pub fn generate_layer_execlist(&mut self) {
        self.layer_execlist = (0..self.layers.len())
            .filter(|&i| self.layers[i].produces_binary_data)
            .collect();
        if self.run_layers_decoupled {
            self.layer_execlist.reverse();
        }
    }

    /// Mark the host-handshake layers: the last executed layer reading a CNN
    /// input and the first executed layer writing a CNN result.
    fn mark_handshake_layers(&mut self) {
        if self.run_layers_decoupled {
            let first = self.layer_execlist[0];
            let last = *self.layer_execlist.last().unwrap();
            self.layers[first].first_layer_producing_output = true;
            self.layers[last].last_layer_using_input = true;
        } else {
            'outer: for &li in self.layer_execlist.clone().iter().rev() {
                for &src in self.layers[li].src_layers.clone().iter() {
                    if self.is_transient_input_layer(src) {
                        self.layers[li].last_layer_using_input = true;
                        break 'outer;
                    }
                }
            }
            for &li in &self.layer_execlist {
                if self.layers[li].out_is_result {
                    self.layers[li].first_layer_producing_output = true;
                    break;
                }
            }
        }

        let nlast = self
            .layer_execlist
            .iter()
            .filter(|&&li| self.layers[li].last_layer_using_input)
            .count();
        let nfirst = self
            .layer_execlist
            .iter()
            .filter(|&&li| self.layers[li].first_layer_producing_output)
            .count();
        if nlast != 1 {
            warn!(
                "expecting exactly one last_layer_using_input, execlist contains {nlast}; \
                 handshake with the host processor will fail"
            );
        }
        if nfirst != 1 {
            warn!(
                "expecting exactly one first_layer_producing_output, execlist contains {nfirst}; \
                 handshake with the host processor will fail"
            );
        }
    }

    /// Run the full compile pipeline. Output files are written relative to
    /// `base_dir`.
    pub fn generate(&mut self) -> Result<()> {
        memory::design_mm_layout(self)?;
        self.generate_layer_execlist();
        assert!(!self.layer_execlist.is_empty(), "layer_execlist is empty");
        self.mark_handshake_layers();

        for l in &self.layers {
            info!(
                "layer {}{}: {} {}",
                l.full_name(),
                l.io_str(true, false),
                l.kind.type_name(),
                l.out_dim.algo_mm_str()
            );
        }

        // command segments contain absolute weight addresses, so the memory
        // layout is final before blob generation
        blob::generate_weights_blob(self)?;
        blob::generate_program_blob(self)?;

        io::export_all(self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::layer::ConvParams;

    fn conv(name: &str, number: i32) -> Layer {
        Layer::new(name, number, LayerKind::Conv2d(ConvParams::default()))
    }

    #[test]
    fn src_edges_populate_back_pointers() {
        let mut net = Net::new("t", VproConfig::default());
        let a = net.add_layer(Layer::new("in", 0, LayerKind::Input));
        let b = net.add_layer(conv("c", 1));
        net.add_src_layers(b, &[a]);
        assert_eq!(net.layer(a).dest_layers, vec![b]);
        assert_eq!(net.layer(b).src_layers, vec![a]);
    }

    #[test]
    fn execlist_skips_transparent_layers() {
        let mut net = Net::new("t", VproConfig::default());
        let a = net.add_layer(Layer::new("in", 0, LayerKind::Input));
        let b = net.add_layer(conv("c", 1));
        let c = net.add_layer(Layer::new("r", 2, LayerKind::Reshape));
        net.add_src_layers(b, &[a]);
        net.add_src_layers(c, &[b]);
        net.generate_layer_execlist();
        assert_eq!(net.layer_execlist, vec![1]);
    }

    #[test]
    fn decoupled_mode_reverses_execlist() {
        let mut net = Net::new("t", VproConfig::default());
        let a = net.add_layer(Layer::new("in", 0, LayerKind::Input));
        let b = net.add_layer(conv("c1", 1));
        let c = net.add_layer(conv("c2", 2));
        net.add_src_layers(b, &[a]);
        net.add_src_layers(c, &[b]);
        net.run_layers_decoupled = true;
        net.generate_layer_execlist();
        assert_eq!(net.layer_execlist, vec![2, 1]);
    }

    #[test]
    fn transient_input_passes_through_shape_only_layers() {
        let mut net = Net::new("t", VproConfig::default());
        let a = net.add_layer(Layer::new("in", 0, LayerKind::Input));
        let r = net.add_layer(Layer::new("r", 1, LayerKind::Reshape));
        let b = net.add_layer(conv("c", 2));
        net.add_src_layers(r, &[a]);
        net.add_src_layers(b, &[r]);
        assert!(net.is_transient_input_layer(r));
        assert!(!net.is_transient_input_layer(b));
    }
}
