//! OAM DMA pass-through.
//!
//! During a DMA transfer the CPU keeps running from HRAM, but the bus shows
//! the DMA unit's traffic, so nothing on it can be decoded as instructions.
//! The window has a fixed length; the real work is regaining decode lock
//! afterwards, because the HRAM routine's cycles were invisible.

use crate::bus::{BusSource, PacerTimer};
use crate::memory::{OAM_BASE, OAM_END};
use crate::session::{FatalError, Session};

/// One transferred byte per cycle, 0xA0 bytes plus setup.
pub const DMA_WINDOW_CYCLES: u32 = 160;

/// Probe bound for finding the return point after the window. Empirical, like
/// the sync deadlines; the HRAM wait loop is short in every title seen so far.
pub const DMA_RESYNC_ATTEMPTS: u32 = 20;

/// Source/destination cursors for a transfer whose source is on the cartridge
/// bus. The shadow has no copy of cartridge contents, so the bytes are picked
/// up from the wire as the DMA unit reads them.
#[derive(Debug)]
struct CartridgeDma {
    src: u16,
    dst: u16,
}

#[derive(Debug)]
pub struct DmaWindow {
    pub ignore_cycles: u32,
    cartridge: Option<CartridgeDma>,
    pub resync_attempts: u32,
}

impl DmaWindow {
    pub fn new() -> Self {
        DmaWindow {
            ignore_cycles: 0,
            cartridge: None,
            resync_attempts: DMA_RESYNC_ATTEMPTS,
        }
    }

    pub fn reset(&mut self) {
        self.ignore_cycles = 0;
        self.cartridge = None;
    }
}

impl Default for DmaWindow {
    fn default() -> Self {
        DmaWindow::new()
    }
}

impl<B: BusSource, T: PacerTimer> Session<B, T> {
    /// Write to the DMA trigger register. Internal sources can be copied from
    /// the shadow immediately; cartridge sources only exist on the wire and
    /// get cursors for the window to follow.
    pub(crate) fn trigger_oam_dma(&mut self, page: u8) {
        if self.dma.ignore_cycles > 0 {
            self.stop(FatalError::DmaCollision);
            return;
        }
        let base = (page as u16) << 8;
        if page >= 0x80 {
            for i in 0..(OAM_END - OAM_BASE) {
                let byte = self.mem.get(base + i);
                self.mem.set(OAM_BASE + i, byte);
            }
        } else {
            self.dma.cartridge = Some(CartridgeDma {
                src: base,
                dst: OAM_BASE,
            });
        }
        self.dma.ignore_cycles = DMA_WINDOW_CYCLES;
    }

    /// Burn through an active DMA window. No-op while no window is open.
    pub(crate) fn run_dma_window(&mut self) {
        while self.dma.ignore_cycles > 0 {
            if !self.state.is_running() {
                return;
            }
            self.advance_bus();

            let cur = self.history.current();
            if let Some(c) = self.dma.cartridge.as_mut() {
                if cur.address() == c.src {
                    let dst = c.dst;
                    c.src = c.src.wrapping_add(1);
                    c.dst += 1;
                    let finished = c.dst >= OAM_END;
                    self.mem.set(dst, cur.data());
                    if finished {
                        self.dma.cartridge = None;
                    }
                }
            }

            self.dma.ignore_cycles -= 1;
            if self.dma.ignore_cycles == 10 {
                // Some titles copy IO values by hand while DMA owns the bus;
                // nothing of that is visible, so replay the copies from the
                // per-title list.
                let copies = self.game.dma_register_copies.clone();
                for (src, dst) in copies {
                    let value = self.mem.get(0xFF00 | src as u16);
                    self.store(0xFF00 | dst as u16, value);
                }
            } else if self.dma.ignore_cycles == 0 {
                self.resync_after_dma();
            }
        }
    }

    /// The window just closed and the decode cursor points at whatever the
    /// HRAM routine is doing. Probe for the RET leaving it (an access at the
    /// current stack pointer) or for a per-title known return point.
    fn resync_after_dma(&mut self) {
        let mut attempts = 0;
        loop {
            if !self.state.is_running() {
                return;
            }
            if self.history.current().address() == self.regs.sp {
                // RET in progress: two pops and the target fetch.
                self.advance_bus();
                self.advance_bus();
                self.advance_bus();
                self.regs.sp = self.regs.sp.wrapping_add(2);
                return;
            }
            if self.game.dma_fix != 0 && self.history.current().address() == self.game.dma_fix {
                return;
            }
            self.advance_bus();
            attempts += 1;
            if attempts > self.dma.resync_attempts {
                self.stop(FatalError::DmaResyncFailed);
                return;
            }
        }
    }
}
