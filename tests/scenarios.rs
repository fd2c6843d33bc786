//! End-to-end boundary scenarios: each builds a small net, runs the full
//! pipeline into a temporary directory and checks the program blob, the
//! per-layer counter triple and at least one structural invariant.

use vpro_netgen::bif::{CommandSegment, DmaDirection, VproOp, NET_MAGICWORD};
use vpro_netgen::compressor::recount;
use vpro_netgen::geometry;
use vpro_netgen::graph::layer::{ConvParams, ElwiseParams, Layer};
use vpro_netgen::graph::{
    ConcatParams, Conv1dParams, Dim, LayerId, LayerKind, Net, PointPillarsParams,
};
use vpro_netgen::VproConfig;

fn test_net(name: &str) -> (Net, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut net = Net::new(name, VproConfig::default());
    net.base_dir = dir.path().to_path_buf();
    (net, dir)
}

fn add_input(net: &mut Net, number: i32, x: i32, y: i32, ch: i32) -> LayerId {
    let mut l = Layer::new("input", number, LayerKind::Input);
    l.out_dim = Dim::new(x, y, ch);
    let id = net.add_layer(l);
    geometry::process_params(net, id).unwrap();
    id
}

fn finish(net: &mut Net, id: LayerId) {
    geometry::process_params(net, id).unwrap();
}

fn check_blob_header(net: &Net) {
    let blob = &net.program_blob;
    assert!(!blob.is_empty());
    assert_eq!(
        u32::from_ne_bytes(blob[0..4].try_into().unwrap()),
        NET_MAGICWORD,
        "program blob must start with the magic word"
    );
    assert_eq!(
        u32::from_ne_bytes(blob[4..8].try_into().unwrap()),
        blob.len() as u32,
        "NET.blobsize must match the written length"
    );
}

fn counters_match_stream(net: &Net) {
    for layer in &net.layers {
        if layer.produces_binary_data {
            assert_eq!(layer.cmd_cnt, recount(&layer.commands));
        }
    }
}

fn no_truncation(net: &Net) {
    for layer in &net.layers {
        if layer.out_dim.mm.layout_known && layer.produces_binary_data {
            let d = &layer.out_dim;
            assert!(
                d.mm.size >= (d.ch * 2 * d.x * d.y) as u32,
                "layer {} truncates its payload",
                layer.full_name()
            );
        }
    }
}

#[test]
fn identity_convolution() {
    let (mut net, dir) = test_net("identity");
    let input = add_input(&mut net, 0, 4, 4, 1);

    let mut conv = Layer::new(
        "identity",
        1,
        LayerKind::Conv2d(ConvParams {
            kernel_length: 1,
            stride: 1,
            ..Default::default()
        }),
    );
    conv.out_dim.ch = 1;
    conv.out_is_result = true;
    conv.weights.packed = vec![1];
    conv.weights.loaded = true;
    let conv = net.add_layer(conv);
    net.add_src_layers(conv, &[input]);
    finish(&mut net, conv);

    net.generate().unwrap();

    // CNN input sits at the output-region base
    assert_eq!(net.layer(input).out_dim.mm.base, 0x8100_0000);
    check_blob_header(&net);
    counters_match_stream(&net);
    no_truncation(&net);

    // weight blob: exactly one 16 bit weight
    assert_eq!(net.weights_blob.len(), 2);

    // one LAYER record in the blob
    let blob = &net.program_blob;
    assert_eq!(u32::from_ne_bytes(blob[12..16].try_into().unwrap()), 1);

    let layer = net.layer(conv);
    // one segment set: 4x4 image fits one tile on one lane
    assert_eq!(
        layer.segments.len(),
        net.arch.parallel_lanes() as usize,
        "one set expected"
    );
    assert_eq!(
        layer.segments.iter().filter(|s| !s.is_dummy()).count(),
        1,
        "one work segment expected"
    );

    let count_op = |op: VproOp| {
        layer
            .commands
            .iter()
            .filter(|c| matches!(c, CommandSegment::Vpro(v) if v.command == op))
            .count()
    };
    assert_eq!(count_op(VproOp::ConvStart), 1);
    assert_eq!(count_op(VproOp::ShiftStore), 1);
    assert_eq!(count_op(VproOp::MaxPool2x2Fused), 0);
    assert_eq!(count_op(VproOp::ActivationFused), 0);

    // counter triple of the single layer
    assert_eq!(
        (layer.cmd_cnt.sync, layer.cmd_cnt.vpro, layer.cmd_cnt.dma),
        (4, 2, 4)
    );

    // all declared outputs exist
    for f in [
        "generated/eisvblob.bin",
        "generated/vproblob.bin",
        "generated/layers.txt",
        "generated/segments.txt",
        "generated/lane_usage.txt",
        "generated/commands.txt",
        "init/input.cfg",
        "exit/output.cfg",
    ] {
        assert!(dir.path().join(f).exists(), "missing output {f}");
    }
    let input_cfg = std::fs::read_to_string(dir.path().join("init/input.cfg")).unwrap();
    assert!(input_cfg.contains("../generated/eisvblob.bin 0x06000000"));
    assert!(input_cfg.contains("../generated/vproblob.bin 0xa0000000"));
}

#[test]
fn same_padding_3x3_conv() {
    let (mut net, _dir) = test_net("same3x3");
    let input = add_input(&mut net, 0, 8, 8, 3);

    let mut conv = Layer::new(
        "conv",
        1,
        LayerKind::Conv2d(ConvParams {
            kernel_length: 3,
            stride: 1,
            ..Default::default()
        }),
    );
    conv.out_dim.ch = 4;
    conv.out_is_result = true;
    conv.weights.packed = vec![1; 3 * 4 * 9];
    conv.weights.loaded = true;
    let conv = net.add_layer(conv);
    net.add_src_layers(conv, &[input]);
    finish(&mut net, conv);

    net.generate().unwrap();
    check_blob_header(&net);
    counters_match_stream(&net);
    no_truncation(&net);

    let layer = net.layer(conv);
    let pad = &layer.padding.dma;
    assert_eq!((pad.top, pad.right, pad.bottom, pad.left), (1, 1, 1, 1));
    assert_eq!((layer.seg.num_x, layer.seg.num_y), (1, 1), "fits the RF");

    // input-tile descriptors carry all four pad flags and are merged into a
    // broadcast across every unit of the cluster
    let input_loads: Vec<_> = layer
        .commands
        .iter()
        .filter_map(|c| match c {
            CommandSegment::Dma(d)
                if d.direction == DmaDirection::E2L2D && d.x_size == 10 =>
            {
                Some(d)
            }
            _ => None,
        })
        .collect();
    assert!(!input_loads.is_empty());
    let all_units = (1u32 << net.arch.units) - 1;
    for d in &input_loads {
        assert_eq!(d.padding, 0b1111, "all four edges padded");
        assert_eq!(d.unit_mask, all_units, "broadcast to all units");
    }

    // one set: 4 kernel + 4 bias + 1 merged input load, 4 channel stores
    assert_eq!(
        (layer.cmd_cnt.sync, layer.cmd_cnt.vpro, layer.cmd_cnt.dma),
        (4, 2, 13)
    );
}

#[test]
fn strided_depthwise_conv() {
    let (mut net, _dir) = test_net("depthwise");
    let input = add_input(&mut net, 0, 56, 56, 16);

    let mut conv = Layer::new(
        "dw",
        1,
        LayerKind::Conv2d(ConvParams {
            kernel_length: 3,
            stride: 2,
            ..Default::default()
        }),
    );
    conv.out_dim.ch = 16;
    conv.groups = 16;
    conv.out_is_result = true;
    conv.weights.packed = vec![1; 16 * 9];
    conv.weights.loaded = true;
    let conv = net.add_layer(conv);
    net.add_src_layers(conv, &[input]);
    finish(&mut net, conv);

    net.generate().unwrap();
    check_blob_header(&net);
    counters_match_stream(&net);
    no_truncation(&net);

    let layer = net.layer(conv);
    // depthwise: every output channel consumes exactly its own input channel
    for seg in layer.segments.iter().filter_map(|s| s.work()) {
        assert_eq!(seg.in_channel, seg.out_channel);
        assert!(seg.first && seg.last, "single accumulation step per tile");
    }

    // per-channel kernels: no kernel transfer is broadcast across units
    for c in &layer.commands {
        if let CommandSegment::Dma(d) = c {
            if d.is_kernel_offset {
                assert_eq!(d.unit_mask.count_ones(), 1, "no weight broadcast");
            }
        }
    }
}

#[test]
fn elementwise_add_with_broadcast() {
    let (mut net, _dir) = test_net("add");
    let big = add_input(&mut net, 0, 28, 28, 64);
    let small = add_input(&mut net, 1, 1, 1, 64);

    let mut add = Layer::new("add", 2, LayerKind::Add(ElwiseParams::default()));
    add.out_dim.ch = 64;
    add.out_is_result = true;
    let add = net.add_layer(add);
    net.add_src_layers(add, &[big, small]);
    finish(&mut net, add);

    net.generate().unwrap();
    check_blob_header(&net);
    counters_match_stream(&net);
    no_truncation(&net);

    // the smaller tensor was swapped to source 0
    let layer = net.layer(add);
    assert_eq!(layer.src_layers[0], small);
    assert_eq!(layer.src_layers[1], big);

    // broadcast map: source 0 broadcasts x and y through local memory
    let maps: Vec<u16> = layer
        .commands
        .iter()
        .filter_map(|c| match c {
            CommandSegment::Vpro(v) if v.command == VproOp::Add => Some(v.broadcast_map),
            _ => None,
        })
        .collect();
    assert!(!maps.is_empty());
    for m in maps {
        assert_eq!(m, 0b000011, "bc_y0 | bc_x0");
    }

    // the broadcast source loads a single element per segment
    let tiny_loads = layer
        .commands
        .iter()
        .filter(|c| {
            matches!(c, CommandSegment::Dma(d)
                if d.direction.is_load() && d.x_size as u32 * d.y_size as u32 == 1)
        })
        .count();
    assert!(tiny_loads > 0);
}

#[test]
fn concat_along_channels() {
    let (mut net, _dir) = test_net("concat");
    let a = add_input(&mut net, 0, 16, 16, 8);
    let b = add_input(&mut net, 1, 16, 16, 8);

    let mut cat = Layer::new(
        "cat",
        2,
        LayerKind::Concatenate(ConcatParams {
            axis: 2,
            in_shifts_right: vec![0, 2],
            ..Default::default()
        }),
    );
    cat.out_is_result = true;
    let cat = net.add_layer(cat);
    net.add_src_layers(cat, &[a, b]);
    finish(&mut net, cat);

    net.generate().unwrap();
    check_blob_header(&net);
    counters_match_stream(&net);
    no_truncation(&net);

    let layer = net.layer(cat);
    assert_eq!(layer.out_dim.ch, 16);

    // output channel 8 reads from the second source's first channel, not
    // from an independently derived address
    let b_base = net.layer(b).out_dim.channel_base(0);
    let seg8 = layer
        .segments
        .iter()
        .filter_map(|s| s.work())
        .find(|s| s.out_channel == 8 && s.x_seg == 0 && s.y_seg == 0)
        .expect("segment for output channel 8");
    assert_eq!(seg8.in_mm_base[0], b_base);
    assert_eq!(seg8.in_channel, 0);

    // aliasing of the first source is untouched
    for (k, cb) in net.layer(a).out_dim.mm.channel_base.iter().enumerate() {
        let consumer_view = net.in_dim(cat, 0);
        assert_eq!(consumer_view.mm.channel_base[k], *cb);
    }
}

#[test]
fn global_average_pooling() {
    let (mut net, _dir) = test_net("gap");
    let input = add_input(&mut net, 0, 7, 7, 128);

    let mut gap = Layer::new("gap", 1, LayerKind::GlobalAvgPool2d(Default::default()));
    gap.out_is_result = true;
    let gap = net.add_layer(gap);
    net.add_src_layers(gap, &[input]);
    finish(&mut net, gap);

    net.generate().unwrap();
    check_blob_header(&net);
    counters_match_stream(&net);
    no_truncation(&net);

    let arch = net.arch;
    let layer = net.layer(gap);

    // single-tile factorisation of 49 within the 3D addressing limits
    assert_eq!((layer.seg.num_x, layer.seg.num_y), (1, 1));
    assert_eq!(layer.seg.in_w * layer.seg.in_h, 49);
    let (x, y, z) = vpro_netgen::segmentation::factorize(49, arch.lm_size).unwrap();
    assert!(x <= 63 && y <= 64 && z <= 1023);
    assert_eq!(x * y * z, 49);

    // scratch region for the 48 bit partial sums is reserved in the layout
    let payload = 128 * layer.out_dim.mm.ch_size;
    let scratch = 3 * 2 * arch.clusters * arch.units * 128;
    assert_eq!(layer.out_dim.mm.size, payload + scratch);

    // one broadcast divide per execution set; every channel runs on the L0
    // lane of its own unit
    let usable_lanes = (arch.clusters * arch.units) as i32;
    let expected_sets = (128 + usable_lanes - 1) / usable_lanes;
    let divides = layer
        .commands
        .iter()
        .filter(|c| {
            matches!(c, CommandSegment::Vpro(v)
                if v.command == VproOp::GlobalAvgPool2dDivide)
        })
        .count();
    assert_eq!(divides as i32, expected_sets);

    let accumulates = layer
        .commands
        .iter()
        .filter(|c| {
            matches!(c, CommandSegment::Vpro(v)
                if v.command == VproOp::GlobalAvgPool2dStart)
        })
        .count();
    assert_eq!(accumulates as i32, expected_sets);

    // 32 sets: 4 channel loads + 4 single-word stores each; the driver
    // inserts one drain per boundary plus the leading sync pair
    assert_eq!(
        (layer.cmd_cnt.sync, layer.cmd_cnt.vpro, layer.cmd_cnt.dma),
        (66, 64, 256)
    );
}

#[test]
fn pointpillars_store_buffer_alternates() {
    let (mut net, _dir) = test_net("pillars");
    let features = add_input(&mut net, 0, 64, 1, 4);
    let grid = add_input(&mut net, 1, 272, 1, 1);

    let mut pp = Layer::new(
        "pillars",
        2,
        LayerKind::PointPillars(PointPillarsParams {
            conv: Conv1dParams::default(),
            xmin: 0.0,
            xmax: 4.0,
            ymin: 0.0,
            ymax: 4.0,
            res: 1.0,
            max_points_per_seg: 16,
            ..Default::default()
        }),
    );
    pp.out_dim.ch = 2;
    pp.out_is_result = true;
    // grid segmentation is supplied by the quantisation toolkit
    pp.seg.num_x = 4;
    pp.seg.num_y = 4;
    pp.seg.out_w = 1;
    pp.seg.out_h = 1;
    pp.weights.packed = vec![1; 2 * 4];
    pp.weights.loaded = true;
    let pp = net.add_layer(pp);
    net.add_src_layers(pp, &[features, grid]);
    finish(&mut net, pp);

    net.generate().unwrap();
    check_blob_header(&net);
    counters_match_stream(&net);
    no_truncation(&net);

    let arch = net.arch;
    let layer = net.layer(pp);

    // 4 tiles x 2 channels per packed set, expanded over 4 input channels:
    // 16 sets, one shift-store per finished tile row
    let shift_stores = layer
        .commands
        .iter()
        .filter(|c| matches!(c, CommandSegment::Vpro(v) if v.command == VproOp::ShiftStore))
        .count();
    assert_eq!(shift_stores, 4);

    // consecutive store phases must target alternating LM halves: the DMA
    // store of each iteration reads the half shift_store just wrote
    let lm_half = arch.lm_size / 2;
    let mut halves: Vec<bool> = layer
        .commands
        .iter()
        .filter_map(|c| match c {
            CommandSegment::Dma(d) if d.direction == DmaDirection::L2E2D => {
                Some(d.lm_addr >= lm_half)
            }
            _ => None,
        })
        .collect();
    halves.dedup();
    assert_eq!(
        halves,
        vec![true, false, true, false],
        "stored LM half must ping-pong across store phases"
    );

    // runtime-sized loads keep the segment index in the row leap; the
    // merger must not fold them to 1D
    let dynamic_loads: Vec<i32> = layer
        .commands
        .iter()
        .filter_map(|c| match c {
            CommandSegment::Dma(d)
                if d.direction == DmaDirection::E2L2D && d.x_size == 0 =>
            {
                Some(d.y_leap)
            }
            _ => None,
        })
        .collect();
    assert!(!dynamic_loads.is_empty());
    assert!(
        dynamic_loads.iter().any(|&leap| leap == 1),
        "tile with flat segment index 1 keeps its leap"
    );
}

#[test]
fn sync_points_pair_with_compute_and_store() {
    let (mut net, _dir) = test_net("syncpairs");
    let input = add_input(&mut net, 0, 16, 16, 4);
    let mut conv = Layer::new(
        "conv",
        1,
        LayerKind::Conv2d(ConvParams {
            kernel_length: 3,
            stride: 1,
            ..Default::default()
        }),
    );
    conv.out_dim.ch = 8;
    conv.out_is_result = true;
    conv.weights.packed = vec![1; 4 * 8 * 9];
    conv.weights.loaded = true;
    let conv = net.add_layer(conv);
    net.add_src_layers(conv, &[input]);
    finish(&mut net, conv);

    net.generate().unwrap();

    let layer = net.layer(conv);
    let dma_waits = layer
        .commands
        .iter()
        .filter(|c| matches!(c, CommandSegment::DmaWait))
        .count();
    let vpro_syncs = layer
        .commands
        .iter()
        .filter(|c| matches!(c, CommandSegment::VproWait))
        .count();
    // every compute is preceded by a DMA drain, every store by a compute
    // drain, plus the terminating DMA drain
    assert_eq!(dma_waits, vpro_syncs + 1);
    assert!(matches!(
        layer.commands.last(),
        Some(CommandSegment::DmaWait)
    ));
}

#[test]
fn recompilation_is_deterministic() {
    let build = || {
        let (mut net, dir) = test_net("det");
        let input = add_input(&mut net, 0, 8, 8, 3);
        let mut conv = Layer::new(
            "conv",
            1,
            LayerKind::Conv2d(ConvParams {
                kernel_length: 3,
                ..Default::default()
            }),
        );
        conv.out_dim.ch = 4;
        conv.out_is_result = true;
        conv.weights.packed = vec![2; 3 * 4 * 9];
        conv.weights.loaded = true;
        let conv = net.add_layer(conv);
        net.add_src_layers(conv, &[input]);
        finish(&mut net, conv);
        net.generate().unwrap();
        (net.program_blob.clone(), net.weights_blob.clone(), dir)
    };

    let (p1, w1, _d1) = build();
    let (p2, w2, _d2) = build();
    assert_eq!(p1, p2, "program blobs must be byte-identical across runs");
    assert_eq!(w1, w2, "weight blobs must be byte-identical across runs");
}
