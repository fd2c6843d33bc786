use crate::arch::{mm_addr_str, MmAddr, MmSize};

/// Tensor geometry of one layer output.
///
/// The algorithm view (`x`, `y`, `ch`) is what the network graph computes.
/// The implementation view (`mm`) is the main-memory image: it may carry
/// garbage columns right of and garbage rows below the payload so that the
/// image tiles into segments without remainder. DMA transfers cannot skip
/// data inside a unit's local memory, so border segments keep the same LM
/// layout as inner segments to allow instruction broadcasting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Dim {
    /// width in elements
    pub x: i32,
    /// height in elements
    pub y: i32,
    /// number of channels
    pub ch: i32,

    pub mm: MmLayout,

    /// divide integer data by this to obtain the floating-point values it
    /// represents
    pub fixedpoint_scaling: f64,
}

/// Implementation-view main memory layout of one layer output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MmLayout {
    /// width in elements (including garbage right of image) = y-stride
    pub x: i32,
    /// height in elements (including garbage below image)
    pub y: i32,
    /// byte address of the reserved block; payload starts at
    /// `channel_base[0]`
    pub base: MmAddr,
    /// bytes reserved from memory management; not necessarily payload size
    pub size: MmSize,
    /// byte address per channel
    pub channel_base: Vec<MmAddr>,
    /// bytes per channel including right/bottom garbage
    pub ch_size: MmSize,
    /// flipped once by the memory planner; `mm` fields are frozen afterwards
    pub layout_known: bool,
}

impl Dim {
    pub fn new(x: i32, y: i32, ch: i32) -> Self {
        Dim {
            x,
            y,
            ch,
            ..Default::default()
        }
    }

    pub fn algo_equal(&self, other: &Dim) -> bool {
        self.x == other.x && self.y == other.y && self.ch == other.ch
    }

    pub fn algo_str(&self) -> String {
        format!("whc {}x{}x{}", self.x, self.y, self.ch)
    }

    pub fn mm_str(&self) -> String {
        format!("whc {}x{}x{}", self.mm.x, self.mm.y, self.ch)
    }

    pub fn algo_mm_str(&self) -> String {
        // "whc 17x9x3, mem 19x19x3 @ 0x81000000"
        let mut irregular = "";
        for i in 1..self.ch as usize {
            if self.mm.channel_base[i] - self.mm.channel_base[i - 1] != self.mm.ch_size {
                irregular = " !! IRREGULAR MEM LAYOUT, file I/O will fail !!";
                break;
            }
        }
        format!(
            "{}, mem {}x{}x{} @ {}{}",
            self.algo_str(),
            self.mm.x,
            self.mm.y,
            self.ch,
            mm_addr_str(self.channel_base(0)),
            irregular
        )
    }

    pub fn detail_str(&self) -> String {
        format!(
            "{}, allocated {} byte @ {} .. {}, fp-scaling {:.16}",
            self.algo_mm_str(),
            self.mm.size,
            mm_addr_str(self.mm.base),
            mm_addr_str(self.mm.base + self.mm.size.max(1) - 1),
            self.fixedpoint_scaling
        )
    }

    pub fn channel_base(&self, ch: usize) -> MmAddr {
        self.mm.channel_base[ch]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algo_equality_ignores_mm() {
        let mut a = Dim::new(8, 8, 3);
        let b = Dim::new(8, 8, 3);
        a.mm.x = 10;
        a.mm.base = 0x8100_0000;
        assert!(a.algo_equal(&b));
    }

    #[test]
    fn irregular_layout_flagged() {
        let mut d = Dim::new(4, 4, 2);
        d.mm.x = 4;
        d.mm.y = 4;
        d.mm.ch_size = 32;
        d.mm.channel_base = vec![0x8100_0000, 0x8100_0040]; // gap != ch_size
        assert!(d.algo_mm_str().contains("IRREGULAR"));
    }
}
