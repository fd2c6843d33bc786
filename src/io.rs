//! File outputs and weight/quantisation inputs.
//!
//! Everything is written relative to the net's base directory:
//! `generated/` holds the two blobs and the human-readable dumps,
//! `init/input.cfg` and `exit/output.cfg` the simulator descriptors.

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::arch::mm_addr_str;
use crate::error::{CompilerError, Result};
use crate::graph::layer::LayerKind;
use crate::graph::{Layer, LayerId, Net};
use crate::segments;

fn export_err(path: &Path, source: std::io::Error) -> CompilerError {
    CompilerError::Export {
        path: path.display().to_string(),
        source,
    }
}

fn write_file(net: &Net, rel: &str, bytes: &[u8]) -> Result<()> {
    let path = net.base_dir.join(rel);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| export_err(&path, e))?;
    }
    fs::write(&path, bytes).map_err(|e| export_err(&path, e))
}

/// Write all output files of one compiled net.
pub fn export_all(net: &Net) -> Result<()> {
    write_file(net, "generated/eisvblob.bin", &net.program_blob)?;
    write_file(net, "generated/vproblob.bin", &net.weights_blob)?;
    write_file(net, "generated/layers.txt", layers_text(net).as_bytes())?;
    write_file(net, "generated/segments.txt", segments_text(net).as_bytes())?;
    write_file(net, "generated/lane_usage.txt", lane_usage_text(net).as_bytes())?;
    write_file(net, "generated/commands.txt", commands_text(net).as_bytes())?;
    write_file(net, "init/input.cfg", sim_input_config(net).as_bytes())?;
    write_file(net, "exit/output.cfg", sim_output_config(net).as_bytes())?;
    Ok(())
}

// std bug: zero-filled formatting of negative numbers puts the sign after
// the fill, so build the string by hand
fn to_signed_string(i: i32, width: usize) -> String {
    if i >= 0 {
        format!("{:0width$}", i)
    } else {
        format!("-{:0w$}", -i, w = width - 1)
    }
}

fn sim_input_filename(layer: &Layer) -> String {
    format!("../input/l{}.bin", to_signed_string(layer.number, 3))
}

fn sim_output_filename(layer: &Layer) -> String {
    format!("../sim_results/l{}.bin", to_signed_string(layer.number, 3))
}

fn sim_channel_filename(prefix: &str, layer: &Layer, ch: usize) -> String {
    format!(
        "{prefix}/l{}_ch{}.bin",
        to_signed_string(layer.number, 3),
        to_signed_string(ch as i32, 4)
    )
}

/// One layer's descriptor block shared by input.cfg and output.cfg.
///
/// Line formats: `# comment` (with `# !` meaning "not enabled"), key-value
/// pairs, or `<filename> <address> <payload bytes> [<a> <b>]*` where each
/// trailing pair means "after a bytes of payload skip b bytes of garbage".
fn layer_io_config(net: &Net, layer: &Layer, input: bool) -> String {
    let mut s = String::new();
    let d = &layer.out_dim;

    s += &format!(
        "# Layer {}: {}{}\n",
        layer.full_name(),
        layer.io_str(false, true),
        d.detail_str()
    );

    // file input provider: preload this layer's output before execution?
    let load_active = net.run_layers_decoupled || layer.is_input_layer;
    s += "# ";
    if !load_active {
        s += "!";
    }
    s += &format!(
        "file load {}: '{}' format {} ",
        layer.full_name(),
        sim_input_filename(layer),
        if net.file_format_with_garbage {
            d.mm_str()
        } else {
            d.algo_str()
        }
    );
    if !layer.use_dynamic_shape {
        s += "!";
    }
    s += "dynamic_shape\n";

    // file output handler: dumping outputs and intermediates is the default
    let save_active = true;
    s += "# ";
    s += &format!(
        "file save {}: '{}' format {}\n",
        layer.full_name(),
        sim_output_filename(layer),
        if net.file_format_with_garbage {
            d.mm_str()
        } else {
            d.algo_str()
        }
    );

    // the actual load/store line for the simulator
    let active = net.run_layers_decoupled || (input && load_active) || (!input && save_active);
    if !active {
        s += "# ";
    }
    s += &format!(
        "{} {} ",
        if input {
            sim_input_filename(layer)
        } else {
            sim_output_filename(layer)
        },
        mm_addr_str(d.channel_base(0))
    );
    if net.file_format_with_garbage {
        s += &format!("{}", d.ch as u32 * d.mm.ch_size);
    } else {
        s += &format!("{}", 2 * d.x * d.y * d.ch);
        // a b: skip b bytes of garbage in MM every a bytes of payload
        if d.x != d.mm.x {
            s += &format!(" {} {}", 2 * d.x, 2 * (d.mm.x - d.x));
        }
        if d.y != d.mm.y {
            s += &format!(" {} {}", 2 * d.y * d.x, 2 * (d.mm.y - d.y) * d.mm.x);
        }
    }
    s += "\n";

    // individual channels, not used by any automated processing
    for ch in 0..d.mm.channel_base.len().min(d.ch as usize) {
        s += "# ";
        s += &format!(
            "{} {} ",
            sim_channel_filename(if input { "../input" } else { "../sim_results" }, layer, ch),
            mm_addr_str(d.channel_base(ch))
        );
        if net.file_format_with_garbage {
            s += &format!("{}", d.mm.ch_size);
        } else {
            s += &format!("{}", 2 * d.x * d.y);
            if d.x != d.mm.x {
                s += &format!(" {} {}", 2 * d.x, 2 * (d.mm.x - d.x));
            }
        }
        s += "\n";
    }
    s
}

fn config_header(net: &Net, what: &str) -> String {
    format!(
        "# ISS {what} memory map for {}\n\
         # Auto-generated by netgen\n\
         # Do not edit this file, adjust the net builder instead\n\
         # Notes:\n\
         # - shapes are specified in whc order; actual memory layout is chw\n\
         # - '!' denotes 'not' in file load/save and dynamic_shape context\n\
         #\n",
        net.name
    )
}

pub fn sim_input_config(net: &Net) -> String {
    let mut s = config_header(net, "input");

    let addr = net.memlayout.mm_program_load_addr;
    assert!(addr % 32 == 0, "program load address must be 32 byte aligned");
    s += "# == CNN descriptor: net, layers, commands (cached memory)\n";
    s += &format!("../generated/eisvblob.bin {}\n#\n", mm_addr_str(addr));

    s += "# == weights (uncached memory)\n";
    s += &format!(
        "../generated/vproblob.bin {}\n#\n",
        mm_addr_str(net.memlayout.mm_weights_base)
    );

    s += "# == Input image(s) (uncached memory)\n";
    for layer in &net.layers {
        s += &layer_io_config(net, layer, true);
    }
    s
}

pub fn sim_output_config(net: &Net) -> String {
    let mut s = config_header(net, "output");
    s += "# == Output image(s)\n";
    for layer in &net.layers {
        s += &layer_io_config(net, layer, false);
    }
    s
}

fn layers_text(net: &Net) -> String {
    let mut s = String::new();
    for li in 0..net.layers.len() {
        let layer = &net.layers[li];
        if !layer.produces_binary_data {
            continue;
        }
        s += &format!("LAYER {}, {}\n", layer.full_name(), layer.kind.type_name());
        let bl = crate::blob::build_layer_record(net, li);
        s += &format!("{bl:#?}\n");
    }
    s
}

fn segments_text(net: &Net) -> String {
    let mut s = String::from(
        "# Format: <linear segment number> (<mapped processing element location>): \
         Dummy/First/Last xy(<image location>) <input address(es) and row stride(s)>, \
         <output address and row stride>, <padding>\n\n",
    );
    for layer in &net.layers {
        if !layer.produces_binary_data {
            continue;
        }
        s += &format!(
            "LAYER {}, {}: {} segments\n",
            layer.full_name(),
            layer.kind.type_name(),
            layer.segments.len()
        );
        if layer.segments.len() > 10_000 && !layer.cfg.force_segment_dump {
            s += "<details disabled for > 10000 segments; can be forced via force_segment_dump>\n";
            continue;
        }
        let arch = &net.arch;
        let n = layer.parallel_outchannels_per_lane as usize;
        for (si, seg) in layer.segments.iter().enumerate() {
            let set = si / (arch.parallel_lanes() as usize * n);
            let cluster = (si / (arch.units as usize * arch.lanes as usize * n))
                % arch.clusters as usize;
            let unit = (si / (arch.lanes as usize * n)) % arch.units as usize;
            let lane = (si / n) % arch.lanes as usize;
            let ch = si % n;
            s += &format!(
                "SEGMENT {si:5} (s{set:2}c{cluster}u{unit}l{lane}.{ch:2}): {}\n",
                seg.short_string()
            );
        }
    }
    s
}

fn lane_usage_text(net: &Net) -> String {
    let mut s = String::from(
        "Mapping of segments to lanes\nLegend:\nF: first\nL: last\n1: first && last\n\
         x: neither\n-: dummy\n\n",
    );
    for layer in &net.layers {
        if !layer.produces_binary_data {
            continue;
        }
        let arch = &net.arch;
        let segs_per_set =
            arch.parallel_lanes() as usize * layer.parallel_outchannels_per_lane as usize;
        s += &format!(
            "LAYER {}, {}: {} segments in {} sets ({} parallel_outchannels_per_lane, {}c{}u{}l)\n",
            layer.full_name(),
            layer.kind.type_name(),
            layer.segments.len(),
            layer.segments.len() / segs_per_set.max(1),
            layer.parallel_outchannels_per_lane,
            arch.clusters,
            arch.units,
            arch.lanes
        );
        s += &segments::lane_usage_string(layer, arch);
    }
    s
}

fn commands_text(net: &Net) -> String {
    let mut s = String::new();
    for layer in &net.layers {
        if !layer.produces_binary_data {
            continue;
        }
        s += &format!(
            "LAYER {}, {}: {} commands\n",
            layer.full_name(),
            layer.kind.type_name(),
            layer.commands.len()
        );
        for (i, cmd) in layer.commands.iter().enumerate() {
            s += &format!("[{i:5}] {}\n", cmd.to_line());
        }
        s += &format!(
            "Command counts: total {}, sync {}, vpro {}, dma {}\n",
            layer.commands.len(),
            layer.cmd_cnt.sync,
            layer.cmd_cnt.vpro,
            layer.cmd_cnt.dma
        );
    }
    s
}

/// Load the quantised weights of one layer from its weight file
/// (`weights/l###_weights.bin` unless overridden), 16 bit elements.
pub fn load_weights(net: &mut Net, id: LayerId, path: Option<&str>) -> Result<()> {
    let layer = net.layer(id);
    let name = layer.full_name();
    let fname = path
        .map(str::to_string)
        .or_else(|| layer.weights.fname.clone())
        .unwrap_or_else(|| layer.default_weights_filename());
    let full = net.base_dir.join(&fname);

    let mut bytes = Vec::new();
    fs::File::open(&full)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| CompilerError::WeightIo {
            layer: name.clone(),
            path: fname.clone(),
            reason: e.to_string(),
        })?;

    let weights: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|c| i16::from_ne_bytes([c[0], c[1]]))
        .collect();

    let layer = net.layer_mut(id);
    layer.weights.packed = weights;
    layer.weights.loaded = true;
    layer.weights.fname = Some(fname);

    let weights = net.layer(id).weights.clone();
    crate::geometry::sanity_check_weights_count(net, id, &weights);
    Ok(())
}

/// Optional per-layer quantisation parameters.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QuantParams {
    pub store_shift_right: Option<i16>,
    pub result_shift_right: Option<i16>,
    pub bias_shift_right: Option<i16>,
    pub rf_frac_bits: Option<i16>,
    pub alpha: Option<u16>,
    pub alpha_mulh_shift_right: Option<i16>,
    pub fixedpoint_scaling: Option<f64>,
}

/// Apply `weights/l###_qparams.json` when present; silence means defaults.
pub fn load_quant_params(net: &mut Net, id: LayerId) -> Result<()> {
    let layer = net.layer(id);
    let name = layer.full_name();
    let fname = format!("weights/l{}_qparams.json", to_signed_string(layer.number, 3));
    let full = net.base_dir.join(&fname);
    let text = match fs::read_to_string(&full) {
        Ok(t) => t,
        Err(_) => return Ok(()), // no quantisation side channel for this layer
    };
    let q: QuantParams = serde_json::from_str(&text).map_err(|e| CompilerError::WeightIo {
        layer: name,
        path: fname,
        reason: format!("invalid qparams: {e}"),
    })?;

    let layer = net.layer_mut(id);
    if let Some(s) = q.fixedpoint_scaling {
        layer.out_dim.fixedpoint_scaling = s;
    }
    match &mut layer.kind {
        LayerKind::Conv2d(p) | LayerKind::MaxPool2d(p) | LayerKind::DConvConv(p) => {
            apply_conv_qparams(p, &q);
        }
        LayerKind::Conv2dTranspose(tp) => apply_conv_qparams(&mut tp.conv, &q),
        LayerKind::Conv1d(p) => {
            if let Some(s) = q.store_shift_right {
                p.fused.store_shift_right = s;
            }
            if let Some(s) = q.result_shift_right {
                p.result_shift_right = s;
            }
            if let Some(s) = q.bias_shift_right {
                p.bias_shift_right = s;
            }
            if let Some(s) = q.rf_frac_bits {
                p.fused.rf_frac_bits = s;
            }
        }
        LayerKind::Add(p) | LayerKind::Mul(p) => {
            if let Some(s) = q.store_shift_right {
                p.fused.store_shift_right = s;
            }
            if let Some(s) = q.rf_frac_bits {
                p.fused.rf_frac_bits = s;
            }
        }
        _ => {
            warn!("qparams file found for layer without quantisation parameters");
        }
    }
    Ok(())
}

fn apply_conv_qparams(p: &mut crate::graph::ConvParams, q: &QuantParams) {
    if let Some(s) = q.store_shift_right {
        p.fused.store_shift_right = s;
    }
    if let Some(s) = q.result_shift_right {
        p.result_shift_right = s;
    }
    if let Some(s) = q.bias_shift_right {
        p.bias_shift_right = s;
    }
    if let Some(s) = q.rf_frac_bits {
        p.fused.rf_frac_bits = s;
    }
    if let Some(a) = q.alpha {
        p.fused.alpha = a;
    }
    if let Some(s) = q.alpha_mulh_shift_right {
        p.fused.alpha_mulh_shift_right = s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::VproConfig;
    use crate::graph::layer::{ConvParams, Layer};
    use crate::graph::Dim;

    #[test]
    fn signed_filename_numbers() {
        assert_eq!(to_signed_string(7, 3), "007");
        assert_eq!(to_signed_string(-3, 3), "-03");
    }

    #[test]
    fn missing_weight_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut net = Net::new("t", VproConfig::default());
        net.base_dir = dir.path().to_path_buf();
        let c = net.add_layer(Layer::new(
            "c",
            0,
            LayerKind::Conv2d(ConvParams::default()),
        ));
        assert!(matches!(
            load_weights(&mut net, c, None),
            Err(CompilerError::WeightIo { .. })
        ));
    }

    #[test]
    fn weights_load_as_16_bit_words() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("weights")).unwrap();
        let mut bytes = Vec::new();
        for w in [1i16, -2, 300] {
            bytes.extend_from_slice(&w.to_ne_bytes());
        }
        std::fs::write(dir.path().join("weights/l000_weights.bin"), &bytes).unwrap();

        let mut net = Net::new("t", VproConfig::default());
        net.base_dir = dir.path().to_path_buf();
        let mut input = Layer::new("in", 1, LayerKind::Input);
        input.out_dim = Dim::new(4, 4, 1);
        let a = net.add_layer(input);
        let mut conv = Layer::new("c", 0, LayerKind::Conv2d(ConvParams::default()));
        conv.out_dim.ch = 1;
        conv.groups = 1;
        let c = net.add_layer(conv);
        net.add_src_layers(c, &[a]);

        load_weights(&mut net, c, None).unwrap();
        assert_eq!(net.layer(c).weights.packed, vec![1, -2, 300]);
    }

    #[test]
    fn qparams_apply_to_conv_layers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("weights")).unwrap();
        std::fs::write(
            dir.path().join("weights/l005_qparams.json"),
            r#"{"store_shift_right": 6, "rf_frac_bits": 10}"#,
        )
        .unwrap();

        let mut net = Net::new("t", VproConfig::default());
        net.base_dir = dir.path().to_path_buf();
        let c = net.add_layer(Layer::new(
            "c",
            5,
            LayerKind::Conv2d(ConvParams::default()),
        ));
        load_quant_params(&mut net, c).unwrap();
        match &net.layer(c).kind {
            LayerKind::Conv2d(p) => {
                assert_eq!(p.fused.store_shift_right, 6);
                assert_eq!(p.fused.rf_frac_bits, 10);
            }
            _ => unreachable!(),
        }
    }
}
