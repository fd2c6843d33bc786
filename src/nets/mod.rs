//! Built-in net descriptions and the name registry used by the CLI.
//!
//! A net builder instantiates layers, connects them and finalises their
//! parameters; weights come from `weights/l###_weights.bin` next to the
//! working directory unless the builder supplies them directly.

use fxhash::FxHashMap;

use crate::arch::VproConfig;
use crate::error::{CompilerError, Result};
use crate::geometry;
use crate::graph::layer::{ConvParams, Layer};
use crate::graph::{Activation, Dim, LayerId, LayerKind, Net};
use crate::io;

pub type NetBuilder = fn(&mut Net) -> Result<()>;

/// All nets the `netgen` binary can generate.
pub fn registry() -> FxHashMap<&'static str, NetBuilder> {
    let mut m: FxHashMap<&'static str, NetBuilder> = FxHashMap::default();
    m.insert("minimal", build_minimal);
    m.insert("tutorial", build_tutorial);
    m
}

/// Resolve a net name, build and finalise it.
pub fn instantiate(name: &str, arch: VproConfig) -> Result<Net> {
    let builders = registry();
    let builder = builders
        .get(name)
        .ok_or_else(|| CompilerError::UnknownNet(name.to_string()))?;
    let mut net = Net::new(name, arch);
    builder(&mut net)?;
    Ok(net)
}

fn add_input(net: &mut Net, number: i32, x: i32, y: i32, ch: i32) -> Result<LayerId> {
    let mut l = Layer::new("input", number, LayerKind::Input);
    l.out_dim = Dim::new(x, y, ch);
    let id = net.add_layer(l);
    geometry::process_params(net, id)?;
    Ok(id)
}

/// Smallest complete net: a 1x1 identity convolution over a 4x4 image.
/// Useful to check the whole tool chain end to end.
fn build_minimal(net: &mut Net) -> Result<()> {
    let input = add_input(net, 0, 4, 4, 1)?;

    let mut conv = Layer::new("identity", 1, LayerKind::Conv2d(ConvParams {
        kernel_length: 1,
        stride: 1,
        ..Default::default()
    }));
    conv.out_dim.ch = 1;
    conv.out_is_result = true;
    conv.weights.packed = vec![1];
    conv.weights.loaded = true;
    let conv = net.add_layer(conv);
    net.add_src_layers(conv, &[input]);
    geometry::process_params(net, conv)?;
    Ok(())
}

/// Small two-stage conv net; weights and quantisation parameters are read
/// from `weights/`.
fn build_tutorial(net: &mut Net) -> Result<()> {
    let input = add_input(net, 0, 16, 16, 3)?;

    let mut c1 = Layer::new("conv1", 1, LayerKind::Conv2d(ConvParams {
        kernel_length: 3,
        stride: 1,
        use_bias: true,
        ..Default::default()
    }));
    c1.out_dim.ch = 8;
    if let LayerKind::Conv2d(p) = &mut c1.kind {
        p.fused.activation = Activation::Relu;
        p.fused.pool_size = [2, 2];
    }
    let c1 = net.add_layer(c1);
    net.add_src_layers(c1, &[input]);
    geometry::process_params(net, c1)?;
    io::load_quant_params(net, c1)?;
    io::load_weights(net, c1, None)?;

    let mut c2 = Layer::new("conv2", 2, LayerKind::Conv2d(ConvParams {
        kernel_length: 1,
        stride: 1,
        use_bias: true,
        ..Default::default()
    }));
    c2.out_dim.ch = 4;
    c2.out_is_result = true;
    let c2 = net.add_layer(c2);
    net.add_src_layers(c2, &[c1]);
    geometry::process_params(net, c2)?;
    io::load_quant_params(net, c2)?;
    io::load_weights(net, c2, None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_known_nets() {
        assert!(registry().contains_key("minimal"));
        assert!(matches!(
            instantiate("no-such-net", VproConfig::default()),
            Err(CompilerError::UnknownNet(_))
        ));
    }

    #[test]
    fn minimal_net_builds() {
        let net = instantiate("minimal", VproConfig::default()).unwrap();
        assert_eq!(net.layers.len(), 2);
        assert!(net.layers[1].weights.loaded);
    }
}
