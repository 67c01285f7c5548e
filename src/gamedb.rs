//! Per-title fixup table.
//!
//! Identification itself happens in an external collaborator that hashes VRAM
//! writes; the core only consumes the resulting entry. Absent entries mean
//! "use defaults".

use serde::{Deserialize, Serialize};

/// Fixups a specific title needs on top of the generic heuristics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub title: String,
    /// Address that recognizes the return point after DMA (0 = none).
    pub dma_fix: u16,
    /// Use the vblank IRQ for sync even if it fired right after EI, where it
    /// might have been a delayed interrupt.
    pub use_immediate_irq: bool,
    pub disable_stat_syncs: bool,
    pub disable_ly_syncs: bool,
    /// (source, destination) low IO-address bytes, replayed near the end of
    /// each DMA window because the bus carries no usable data during DMA.
    pub dma_register_copies: Vec<(u8, u8)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixupEntry {
    pub vram_hash1: u32,
    pub vram_hash2: u32,
    pub info: GameInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixupTable {
    entries: Vec<FixupEntry>,
}

impl FixupTable {
    pub fn new(mut entries: Vec<FixupEntry>) -> Self {
        entries.sort_by_key(|e| (e.vram_hash2, e.vram_hash1));
        FixupTable { entries }
    }

    /// The titles known to need fixups on real hardware.
    pub fn builtin() -> Self {
        FixupTable::new(vec![
            FixupEntry {
                vram_hash1: 0x8D1E_40F3,
                vram_hash2: 0x24C7_A11B,
                info: GameInfo {
                    title: "TETRIS 2".into(),
                    // Copies some IO values by hand while DMA owns the bus.
                    dma_register_copies: vec![(0x8F, 0x42), (0x90, 0x43)],
                    ..GameInfo::default()
                },
            },
            FixupEntry {
                vram_hash1: 0x51B2_0CE4,
                vram_hash2: 0x7A90_33D8,
                info: GameInfo {
                    title: "DONKEYKONGLAND".into(),
                    use_immediate_irq: true,
                    ..GameInfo::default()
                },
            },
        ])
    }

    pub fn lookup(&self, vram_hash1: u32, vram_hash2: u32) -> Option<&GameInfo> {
        self.entries
            .binary_search_by_key(&(vram_hash2, vram_hash1), |e| {
                (e.vram_hash2, e.vram_hash1)
            })
            .ok()
            .map(|i| &self.entries[i].info)
    }
}
