//! Command-stream compression.
//!
//! Four optional passes, controlled per layer and semantically transparent:
//! replaying the output must produce a byte-identical result to replaying
//! the input.
//!
//! 1. broadcast merger: collapse identical descriptors into unit and
//!    cluster broadcasts (and fold fake-2D transfers to 1D first)
//! 2. loop extension: rewrite runs of descriptors that differ only by a
//!    linearly increasing external address into a loop meta-command
//! 3. store splitter: drop overcalc words from annotated 1D stores
//! 4. block extension: prefix DMA bursts with a block header so only the
//!    header counts against the synchronisation FIFO depth
//!
//! The merger must run before the block extension (headers count the merged
//! descriptors); loop extension and store splitter commute with each other.

use itertools::Itertools;

use crate::bif::{CommandSegment, DmaCommand};
use crate::graph::config::{CmdCount, LayerCfg};

/// Number of descriptors that fit one hardware DMA burst.
const DMA_BLOCK_SIZE: usize = 65535;

/// Minimum run length rewritten into a loop meta-command.
const LOOP_MIN_RUN: usize = 2;

pub fn compress(cfg: &LayerCfg, mut cmds: Vec<CommandSegment>) -> (Vec<CommandSegment>, CmdCount) {
    if cfg.use_dma_merger {
        cmds = merge_broadcasts(cmds);
    }
    if cfg.use_dma_loop_extension {
        cmds = extend_loops(cmds);
    }
    if cfg.use_dma_store_splitter {
        cmds = split_stores(cmds);
    }
    if cfg.use_dma_extension {
        cmds = extend_blocks(cmds);
    }
    let cnt = recount(&cmds);
    (cmds, cnt)
}

/// Recompute the per-layer counters from the stream.
pub fn recount(cmds: &[CommandSegment]) -> CmdCount {
    let mut cnt = CmdCount::default();
    for c in cmds {
        match c {
            CommandSegment::Vpro(_) => cnt.vpro += 1,
            CommandSegment::Dma(_) => cnt.dma += 1,
            c if c.is_sync() => cnt.sync += 1,
            _ => {}
        }
    }
    cnt
}

/// Is this a boundary no DMA reordering may cross?
fn is_barrier(c: &CommandSegment) -> bool {
    !matches!(
        c,
        CommandSegment::Dma(_) | CommandSegment::Vpro(_) | CommandSegment::DmaBlock { .. }
    )
}

/// Pass 1: within each contiguous block of DMA records of one direction,
/// merge identical payloads into broadcasts. Unit merge runs first, then the
/// cluster merge over the stable order (mm, lm, unit_mask, cluster).
fn merge_broadcasts(cmds: Vec<CommandSegment>) -> Vec<CommandSegment> {
    let mut out = Vec::with_capacity(cmds.len());
    let mut block: Vec<DmaCommand> = Vec::new();

    let flush = |block: &mut Vec<DmaCommand>, out: &mut Vec<CommandSegment>| {
        if block.is_empty() {
            return;
        }
        // fake 2D transfers (no row leap) become plain 1D moves; this also
        // exposes the overcalc annotation to the store splitter. Runtime-
        // sized transfers (x_size 0) keep their segment index in the leap
        // and must not be folded.
        for d in block.iter_mut() {
            if !d.direction.is_1d() && d.y_leap == 1 && d.x_size != 0 {
                d.direction = d.direction.to_1d();
                d.x_size = (d.x_size as u32 * d.y_size as u32) as u16;
                d.y_size = 1;
                d.y_leap = 0;
            }
        }

        // unit broadcast
        let mut unit_merged: Vec<DmaCommand> = Vec::with_capacity(block.len());
        for d in block.drain(..) {
            match unit_merged.last_mut() {
                Some(prev) if prev.same_payload_ignoring_units(&d) => {
                    prev.unit_mask |= d.unit_mask;
                }
                _ => unit_merged.push(d),
            }
        }

        // cluster broadcast over the sorted order
        let sorted: Vec<DmaCommand> = unit_merged
            .into_iter()
            .sorted_by_key(|d| (d.mm_addr, d.lm_addr, d.unit_mask, d.cluster_mask))
            .collect();
        let mut cluster_merged: Vec<DmaCommand> = Vec::with_capacity(sorted.len());
        for d in sorted {
            match cluster_merged.last_mut() {
                Some(prev) if prev.same_payload_ignoring_clusters(&d) => {
                    prev.cluster_mask |= d.cluster_mask;
                }
                _ => cluster_merged.push(d),
            }
        }

        out.extend(cluster_merged.into_iter().map(CommandSegment::Dma));
    };

    for c in cmds {
        match c {
            CommandSegment::Dma(d) => {
                // enter/leave runs are never merged across a direction switch
                if let Some(last) = block.last() {
                    if last.direction.is_load() != d.direction.is_load() {
                        flush(&mut block, &mut out);
                    }
                }
                block.push(d);
            }
            other => {
                flush(&mut block, &mut out);
                out.push(other);
            }
        }
    }
    flush(&mut block, &mut out);
    out
}

/// Pass 2: runs of identical records that differ only by a constant
/// external-address stride become one loop meta-command plus the first
/// record.
fn extend_loops(cmds: Vec<CommandSegment>) -> Vec<CommandSegment> {
    let mut out = Vec::with_capacity(cmds.len());
    let mut i = 0;
    while i < cmds.len() {
        let first = match &cmds[i] {
            CommandSegment::Dma(d) => *d,
            other => {
                out.push(other.clone());
                i += 1;
                continue;
            }
        };

        // measure the run with a constant mm stride
        let mut run = 1usize;
        let mut stride = 0i64;
        while let Some(CommandSegment::Dma(next)) = cmds.get(i + run) {
            let mut expect = first;
            let s = next.mm_addr as i64 - first.mm_addr as i64;
            if run == 1 {
                stride = s;
            } else if s != stride * run as i64 {
                break;
            }
            expect.mm_addr = next.mm_addr;
            if expect != *next || stride == 0 {
                break;
            }
            run += 1;
        }

        if run >= LOOP_MIN_RUN && stride != 0 {
            out.push(CommandSegment::DmaLoop {
                count: run as u16,
                mm_stride: stride as i32,
            });
            out.push(CommandSegment::Dma(first));
            i += run;
        } else {
            out.push(CommandSegment::Dma(first));
            i += 1;
        }
    }
    out
}

/// Pass 3: subtract the overcalc annotation from 1D stores so garbage never
/// reaches main memory.
fn split_stores(cmds: Vec<CommandSegment>) -> Vec<CommandSegment> {
    cmds.into_iter()
        .map(|c| match c {
            CommandSegment::Dma(mut d)
                if d.direction == crate::bif::DmaDirection::L2E1D
                    && d.skipped_elements_at_end != 0 =>
            {
                d.x_size -= d.skipped_elements_at_end as u16;
                d.skipped_elements_at_end = 0;
                CommandSegment::Dma(d)
            }
            other => other,
        })
        .collect()
}

/// Pass 4: strip any existing block headers, then prefix every run of
/// consolidated DMA descriptors with a header carrying the run length.
/// Within a region bounded by sync points, the DMAs fire first (largest
/// transfers leading), then the VPRO commands, then any remainder.
fn extend_blocks(cmds: Vec<CommandSegment>) -> Vec<CommandSegment> {
    let mut out = Vec::with_capacity(cmds.len() + 8);
    let mut dma_runs: Vec<Vec<CommandSegment>> = Vec::new();
    let mut vpro_block: Vec<CommandSegment> = Vec::new();

    let flush = |dma_runs: &mut Vec<Vec<CommandSegment>>,
                 vpro_block: &mut Vec<CommandSegment>,
                 out: &mut Vec<CommandSegment>| {
        let mut emitted_vpro = false;
        for (ri, mut run) in dma_runs.drain(..).enumerate() {
            // the largest transfers come first inside a burst; a run holding
            // loop headers keeps its order (the header binds to its record)
            if run.iter().all(|c| matches!(c, CommandSegment::Dma(_))) {
                run.sort_by_key(|c| match c {
                    CommandSegment::Dma(d) => std::cmp::Reverse(d.words()),
                    _ => unreachable!(),
                });
            }
            if ri == 0 && !vpro_block.is_empty() {
                // first burst overlaps with the compute commands
                let head: Vec<CommandSegment> =
                    run.drain(..run.len().min(DMA_BLOCK_SIZE)).collect();
                out.push(CommandSegment::DmaBlock {
                    count: head.len() as u32,
                });
                out.extend(head);
                out.append(vpro_block);
                emitted_vpro = true;
                if run.is_empty() {
                    continue;
                }
            }
            out.push(CommandSegment::DmaBlock {
                count: run.len() as u32,
            });
            out.extend(run);
        }
        if !emitted_vpro {
            out.append(vpro_block);
        }
    };

    for c in cmds {
        match c {
            CommandSegment::DmaBlock { .. } => {} // regenerated below
            CommandSegment::Dma(d) => {
                let same_dir = dma_runs.last().and_then(|r| {
                    r.iter().rev().find_map(|prev| match prev {
                        CommandSegment::Dma(p) => {
                            Some(p.direction.is_load() == d.direction.is_load())
                        }
                        _ => None,
                    })
                });
                let cmd = CommandSegment::Dma(d);
                match same_dir {
                    Some(true) => dma_runs.last_mut().unwrap().push(cmd),
                    Some(false) => dma_runs.push(vec![cmd]),
                    None => {
                        if dma_runs.is_empty() {
                            dma_runs.push(vec![cmd]);
                        } else {
                            dma_runs.last_mut().unwrap().push(cmd);
                        }
                    }
                }
            }
            c @ CommandSegment::DmaLoop { .. } => match dma_runs.last_mut() {
                Some(run) => run.push(c),
                None => dma_runs.push(vec![c]),
            },
            c @ CommandSegment::Vpro(_) => vpro_block.push(c),
            c => {
                flush(&mut dma_runs, &mut vpro_block, &mut out);
                out.push(c);
            }
        }
    }
    flush(&mut dma_runs, &mut vpro_block, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bif::{DmaDirection, VproCommand};

    fn dma(mm: u32, cluster: u32, unit: u32) -> DmaCommand {
        DmaCommand {
            direction: DmaDirection::E2L2D,
            cluster_mask: 1 << cluster,
            unit_mask: 1 << unit,
            mm_addr: mm,
            x_size: 4,
            y_size: 4,
            y_leap: 5,
            ..Default::default()
        }
    }

    #[test]
    fn cluster_broadcast_ors_masks() {
        let cmds = vec![
            CommandSegment::Dma(dma(0x100, 0, 0)),
            CommandSegment::Dma(dma(0x100, 1, 0)),
            CommandSegment::DmaWait,
        ];
        let merged = merge_broadcasts(cmds);
        assert_eq!(recount(&merged).dma, 1);
        match &merged[0] {
            CommandSegment::Dma(d) => assert_eq!(d.cluster_mask, 0b11),
            _ => panic!("expected a DMA record"),
        }
    }

    #[test]
    fn direction_switch_blocks_merging() {
        let mut store = dma(0x100, 1, 0);
        store.direction = DmaDirection::L2E2D;
        let cmds = vec![
            CommandSegment::Dma(dma(0x100, 0, 0)),
            CommandSegment::Dma(store),
            CommandSegment::DmaWait,
        ];
        let merged = merge_broadcasts(cmds);
        assert_eq!(recount(&merged).dma, 2);
    }

    #[test]
    fn fake_2d_folds_to_1d() {
        let mut d = dma(0x100, 0, 0);
        d.y_leap = 1;
        let merged = merge_broadcasts(vec![CommandSegment::Dma(d), CommandSegment::DmaWait]);
        match &merged[0] {
            CommandSegment::Dma(d) => {
                assert_eq!(d.direction, DmaDirection::E2L1D);
                assert_eq!((d.x_size, d.y_size), (16, 1));
            }
            _ => panic!("expected a DMA record"),
        }
    }

    #[test]
    fn loop_extension_rewrites_linear_runs() {
        let cmds: Vec<CommandSegment> = (0..4)
            .map(|i| CommandSegment::Dma(dma(0x100 + i * 0x40, 0, 0)))
            .chain([CommandSegment::DmaWait])
            .collect();
        let looped = extend_loops(cmds);
        assert!(matches!(
            looped[0],
            CommandSegment::DmaLoop {
                count: 4,
                mm_stride: 0x40
            }
        ));
        assert_eq!(recount(&looped).dma, 1);
        // idempotence: a second pass does not grow the stream
        let again = extend_loops(looped.clone());
        assert_eq!(again, looped);
    }

    #[test]
    fn store_splitter_trims_overcalc() {
        let mut d = dma(0x100, 0, 0);
        d.direction = DmaDirection::L2E1D;
        d.x_size = 32;
        d.y_size = 1;
        d.skipped_elements_at_end = 7;
        let split = split_stores(vec![CommandSegment::Dma(d)]);
        match &split[0] {
            CommandSegment::Dma(d) => {
                assert_eq!(d.x_size, 25);
                assert_eq!(d.skipped_elements_at_end, 0);
            }
            _ => panic!("expected a DMA record"),
        }
    }

    #[test]
    fn block_extension_counts_consolidated_dmas() {
        let cmds = vec![
            CommandSegment::Dma(dma(0x100, 0, 0)),
            CommandSegment::Dma(dma(0x200, 0, 1)),
            CommandSegment::DmaWait,
        ];
        let blocked = extend_blocks(cmds);
        assert!(matches!(blocked[0], CommandSegment::DmaBlock { count: 2 }));
        assert!(matches!(blocked[3], CommandSegment::DmaWait));
        // headers in one block share the direction
        let dirs: Vec<bool> = blocked
            .iter()
            .filter_map(|c| match c {
                CommandSegment::Dma(d) => Some(d.direction.is_load()),
                _ => None,
            })
            .collect();
        assert!(dirs.iter().all(|&l| l));
    }

    #[test]
    fn compression_is_a_fixed_point() {
        let cfg = LayerCfg::default();
        let mut vpro = VproCommand::default();
        vpro.xend = 3;
        let cmds = vec![
            CommandSegment::Dma(dma(0x100, 0, 0)),
            CommandSegment::Dma(dma(0x100, 0, 1)),
            CommandSegment::DmaWait,
            CommandSegment::Vpro(vpro),
            CommandSegment::VproWait,
            CommandSegment::Dma(dma(0x300, 1, 0)),
            CommandSegment::DmaWait,
        ];
        let (once, cnt_once) = compress(&cfg, cmds);
        let (twice, cnt_twice) = compress(&cfg, once.clone());
        assert_eq!(once, twice);
        assert_eq!(cnt_once, cnt_twice);
        assert!(twice.len() <= once.len());
    }

    #[test]
    fn sync_counts_and_last_records_survive() {
        let cfg = LayerCfg::default();
        let cmds = vec![
            CommandSegment::Dma(dma(0x100, 0, 0)),
            CommandSegment::DmaWait,
            CommandSegment::BothSync,
            CommandSegment::Dma(dma(0x200, 0, 0)),
            CommandSegment::DmaWait,
        ];
        let before = recount(&cmds);
        let (out, after) = compress(&cfg, cmds);
        assert_eq!(before.sync, after.sync);
        assert!(matches!(out.last(), Some(CommandSegment::DmaWait)));
    }
}
