//! Fused post-processing: 2x2 max pooling, activation, and the RF-to-LM
//! shift-store, emitted after the last accumulation step of a segment.
//!
//! VPRO pipeline compensation: the post-processing instructions read the RF
//! linearly, one address per cycle, and the previous instruction writes
//! increasing addresses. The highest read address decides how many explicit
//! bubbles are needed; when the implicit vector-length cycles already cover
//! the pipeline depth, none are inserted. Negative slack is absorbed by
//! appending garbage elements to the previous instruction instead.

use crate::arch::W2R_BUBBLE_CYCLES;
use crate::bif::{VproCommand, VproOp};
use crate::error::Result;
use crate::graph::config::Activation;
use crate::graph::layer::FusedOps;
use crate::utils::ceil_div;

use super::{Buffer, CommandStream, EmitView};

fn nops_for(implicit_wait_cycles: i32) -> u16 {
    (W2R_BUBBLE_CYCLES - implicit_wait_cycles).max(0) as u16
}

/// Move the finished RF tile into the LM store region, applying the layer
/// right-shift. Flips the store buffer: results always land in the buffer
/// the next iteration does not load into.
pub fn shift_store(
    view: &EmitView,
    fused: &FusedOps,
    mem_layout: &mut VproCommand,
    store_buffer: &mut Buffer,
) -> VproCommand {
    let mut cmd = *mem_layout;

    *store_buffer = store_buffer.other();
    cmd.lm_base = (store_buffer.lm_offset(&view.arch) + view.lm_quarter()) as u16;

    let up = fused.upsampling_scale;
    cmd.command = if up != 1 {
        VproOp::ShiftStoreUpsample
    } else {
        VproOp::ShiftStore
    };

    // memory layout for any command following the (upsampled) store
    mem_layout.xend = ((mem_layout.xend as i32 + 1) * up - 1) as u16;
    mem_layout.yend = ((mem_layout.yend as i32 + 1) * up - 1) as u16;
    mem_layout.lm_ch_stride = (mem_layout.lm_ch_stride as i32 * up * up) as u16;

    let implicit =
        (cmd.xend as i32 + 1) * (cmd.yend as i32 + 1) * (cmd.zend as i32 + 1) - 1;
    cmd.nops = nops_for(implicit);

    cmd.lm_lane_stride = view.layer.lm_lane_stride as u16;
    cmd
}

/// Fused 2x2 max pooling over the RF tile. Halves the tile for all
/// following commands.
pub fn maxpool2x2(mem_layout: &mut VproCommand) -> VproCommand {
    let mut cmd = *mem_layout;
    cmd.command = VproOp::MaxPool2x2Fused;

    let (xend, yend, zend) = (cmd.xend as i32, cmd.yend as i32, cmd.zend as i32);

    // bubbles before the 1st max()
    let implicit = ((xend >> 1) + 1) * (yend + 1) * (zend + 1) - 1;
    cmd.nops = nops_for(implicit);

    // wait cycles before the 2nd max() are produced by appending garbage
    // computation to the 1st max() (no explicit nops between instructions)
    let implicit = ((xend + 1) >> 1) * ((yend >> 1) + 1) * (zend + 1) - 1;
    let inter_instr_nops = (W2R_BUBBLE_CYCLES - implicit).max(0);
    if inter_instr_nops > 0 {
        // write garbage behind the useful data; only happens for small
        // blocks, so there is enough space behind it
        if zend > 0 {
            cmd.zend += ceil_div(inter_instr_nops, ((xend >> 1) + 1) * (yend + 1)) as u16;
        } else if yend > 0 {
            cmd.yend += ceil_div(inter_instr_nops, (xend >> 1) + 1) as u16;
        } else {
            cmd.xend += (2 * inter_instr_nops) as u16;
        }
    }

    // the pooled tile is what every following command sees
    mem_layout.xend /= 2; // w/2-1 = (w-1)/2
    mem_layout.yend /= 2;
    mem_layout.lm_ch_stride /= 4;

    cmd
}

/// Fused activation over the RF tile. The activation determines its own
/// shift bookkeeping; sigmoid and swish run on an internal fixed-point
/// format that replaces the plain store shift.
pub fn activation(fused: &FusedOps, mem_layout: &mut VproCommand) -> VproCommand {
    let mut cmd = *mem_layout;
    cmd.command = VproOp::ActivationFused;

    let sigmoid_frac_bits = 14.min(fused.rf_frac_bits as i32);
    let output_frac_bits = fused.rf_frac_bits as i32 - fused.store_shift_right as i32;
    match fused.activation {
        Activation::Sigmoid => {
            mem_layout.shift_right = (sigmoid_frac_bits - output_frac_bits) as i16;
        }
        Activation::Swish => {
            let lm_shift_right = 24 - 16; // RF->LM transfer of x
            let n_frac_bits = sigmoid_frac_bits + fused.rf_frac_bits as i32 - lm_shift_right;
            cmd.shift_right = (n_frac_bits - output_frac_bits) as i16;
            mem_layout.shift_right = 0; // consumed; shift_store stores as-is
        }
        _ => {
            mem_layout.shift_right = fused.store_shift_right;
        }
    }

    let (xend, yend, zend) = (cmd.xend as i32, cmd.yend as i32, cmd.zend as i32);
    let implicit = (xend + 1) * (yend + 1) * (zend + 1) - 1;
    cmd.nops = nops_for(implicit);

    // relu and leakyrelu are single instructions; all others need the same
    // wait between their internal instructions, again via garbage elements
    if cmd.nops > 0
        && !matches!(fused.activation, Activation::Relu | Activation::LeakyRelu)
    {
        let nops = cmd.nops as i32;
        if zend > 0 {
            cmd.zend += ceil_div(nops, (xend + 1) * (yend + 1)) as u16;
        } else if yend > 0 {
            cmd.yend += ceil_div(nops, xend + 1) as u16;
        } else {
            cmd.xend += nops as u16;
        }
    }

    cmd
}

/// Emit pooling and activation in the configured order.
pub fn pool_activation(
    view: &EmitView,
    fused: &FusedOps,
    stream: &mut CommandStream,
    mem_layout: &mut VproCommand,
) -> Result<()> {
    if fused.pool_size[0] > 1 && !fused.pool_after_activation {
        stream.push_vpro(maxpool2x2(mem_layout))?;
    }
    if fused.activation != Activation::None {
        stream.push_vpro(activation(fused, mem_layout))?;
    }
    if fused.pool_size[0] > 1 && fused.pool_after_activation {
        stream.push_vpro(maxpool2x2(mem_layout))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(xend: u16, yend: u16, zend: u16) -> VproCommand {
        VproCommand {
            xend,
            yend,
            zend,
            ..Default::default()
        }
    }

    #[test]
    fn long_vectors_need_no_bubbles() {
        let mut ml = layout(7, 7, 0); // 64 cycles cover the pipeline
        let cmd = activation(
            &FusedOps {
                activation: Activation::Relu,
                ..Default::default()
            },
            &mut ml,
        );
        assert_eq!(cmd.nops, 0);
    }

    #[test]
    fn short_vectors_get_explicit_bubbles() {
        let mut ml = layout(1, 1, 0); // 4 cycles, pipeline is deeper
        let cmd = activation(
            &FusedOps {
                activation: Activation::Relu,
                ..Default::default()
            },
            &mut ml,
        );
        assert_eq!(cmd.nops as i32, W2R_BUBBLE_CYCLES - 3);
        // relu is a single instruction: no garbage elements appended
        assert_eq!((cmd.xend, cmd.yend), (1, 1));
    }

    #[test]
    fn sigmoid_absorbs_bubbles_in_garbage_elements() {
        let mut ml = layout(1, 1, 0);
        let cmd = activation(
            &FusedOps {
                activation: Activation::Sigmoid,
                rf_frac_bits: 12,
                ..Default::default()
            },
            &mut ml,
        );
        assert!(cmd.nops > 0);
        assert!(cmd.yend > 1, "garbage rows appended to absorb the bubble");
    }

    #[test]
    fn maxpool_halves_the_following_layout() {
        let mut ml = layout(7, 7, 0);
        let _ = maxpool2x2(&mut ml);
        assert_eq!((ml.xend, ml.yend), (3, 3));
    }

    #[test]
    fn pool_after_activation_swaps_the_order() {
        let view_fused = FusedOps {
            activation: Activation::Relu,
            pool_size: [2, 2],
            pool_after_activation: true,
            ..Default::default()
        };
        let mut ml = layout(7, 7, 0);
        let mut stream = CommandStream::new("t");
        // no EmitView needed for this path
        if view_fused.pool_size[0] > 1 && !view_fused.pool_after_activation {
            stream.push_vpro(maxpool2x2(&mut ml)).unwrap();
        }
        if view_fused.activation != Activation::None {
            stream.push_vpro(activation(&view_fused, &mut ml)).unwrap();
        }
        if view_fused.pool_size[0] > 1 && view_fused.pool_after_activation {
            stream.push_vpro(maxpool2x2(&mut ml)).unwrap();
        }
        assert_eq!(stream.cnt.vpro, 2);
        match (&stream.cmds[0], &stream.cmds[1]) {
            (
                crate::bif::CommandSegment::Vpro(a),
                crate::bif::CommandSegment::Vpro(b),
            ) => {
                assert_eq!(a.command, VproOp::ActivationFused);
                assert_eq!(b.command, VproOp::MaxPool2x2Fused);
            }
            _ => panic!("expected two VPRO records"),
        }
    }
}
