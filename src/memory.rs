//! Shadow copy of the console address space and the special-register hooks.
//!
//! Only 0x8000-0xFFFF is authoritative: the cartridge ranges (ROM and external
//! RAM) always come fresh from the live bus, but keeping the full 64K lets
//! every write go through without a range check, exactly like the interceptor
//! hardware does.

use crate::bus::{BusSource, PacerTimer};
use crate::session::Session;

pub const OAM_BASE: u16 = 0xFE00;
pub const OAM_END: u16 = 0xFEA0;

/// IO register contents right after the DMG boot ROM.
pub const IO_DEFAULTS: &[(u16, u8)] = &[
    (0xFF04, 0xAB),
    (0xFF05, 0x00),
    (0xFF06, 0x00),
    (0xFF07, 0x00),
    (0xFF10, 0x80),
    (0xFF11, 0xBF),
    (0xFF12, 0xF3),
    (0xFF14, 0xBF),
    (0xFF16, 0x3F),
    (0xFF17, 0x00),
    (0xFF19, 0xBF),
    (0xFF1A, 0x7F),
    (0xFF1B, 0xFF),
    (0xFF1C, 0x9F),
    (0xFF1E, 0xBF),
    (0xFF20, 0xFF),
    (0xFF21, 0x00),
    (0xFF22, 0x00),
    (0xFF23, 0xBF),
    (0xFF24, 0x77),
    (0xFF25, 0xF3),
    (0xFF26, 0xF1),
    (0xFF40, 0x91),
    (0xFF42, 0x00),
    (0xFF43, 0x00),
    (0xFF45, 0x00),
    (0xFF47, 0xFC),
    (0xFF48, 0xFF),
    (0xFF49, 0xFF),
    (0xFF4A, 0x00),
    (0xFF4B, 0x00),
    (0xFFFF, 0x00),
];

pub struct ShadowMemory {
    bytes: Box<[u8; 0x1_0000]>,
}

impl ShadowMemory {
    pub fn new() -> Self {
        ShadowMemory {
            bytes: Box::new([0u8; 0x1_0000]),
        }
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    #[inline]
    pub fn get(&self, address: u16) -> u8 {
        self.bytes[address as usize]
    }

    #[inline]
    pub fn set(&mut self, address: u16, data: u8) {
        self.bytes[address as usize] = data;
    }

    /// True if the address is console-internal RAM, i.e. the shadow copy is
    /// the authority because the bus cannot reveal its contents.
    #[inline]
    pub fn is_internal(address: u16) -> bool {
        address & 0x8000 != 0 && address & 0xE000 != 0xA000
    }

    /// Read-only view for the pixel compositor and diagnostics.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..]
    }
}

impl Default for ShadowMemory {
    fn default() -> Self {
        ShadowMemory::new()
    }
}

impl<B: BusSource, T: PacerTimer> Session<B, T> {
    /// Every shadow-memory write goes through here so writes to the special
    /// registers can be intercepted.
    pub(crate) fn store(&mut self, address: u16, data: u8) {
        self.mem.set(address, data);
        if address >= 0xFF00 {
            match address {
                // DIV reset: writing any value restarts the divider.
                0xFF04 => self.history.reset_div(),
                0xFF40 => self.ppu.set_lcdc(data),
                0xFF46 => self.trigger_oam_dma(data),
                0xFF47 => self.ppu.set_bg_palette(data),
                0xFF48 => self.ppu.set_obj_palette0(data),
                0xFF49 => self.ppu.set_obj_palette1(data),
                _ => {}
            }
        }
    }

    /// Data byte of the current transaction, with the special read-side
    /// intercepts. RAM substitution already happened during capture; this is
    /// only about registers whose value the shadow knows better than the bus,
    /// and about the two registers whose reads arm the sync detector.
    pub(crate) fn load(&mut self) -> u8 {
        let tx = self.history.current();
        match tx.address() {
            0xFF04 => self.history.div(),
            0xFF41 => {
                // STAT. Games rarely care about the exact value, but a read is
                // the first hint of a vblank polling loop.
                if !self.game.disable_stat_syncs {
                    self.sync.arm_stat(self.history.cycle);
                }
                if self.ppu.y() >= crate::ppu_link::SCREEN_H {
                    1
                } else {
                    match self.ppu.render_state() {
                        crate::ppu_link::RenderState::Rendering => 3,
                        crate::ppu_link::RenderState::Done => 0,
                        _ => 2,
                    }
                }
            }
            0xFF44 => {
                // LY. Answer with the video model's line and watch for a
                // compare-and-loop pattern.
                if !self.game.disable_ly_syncs {
                    self.sync.arm_ly(self.history.cycle);
                }
                self.ppu.y() as u8
            }
            _ => tx.data(),
        }
    }
}
