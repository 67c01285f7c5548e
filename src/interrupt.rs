//! Interrupt recognition.
//!
//! An interrupt never shows up as an opcode; the only bus evidence is the
//! entry sequence itself: two dead cycles, two stack pushes, then execution
//! resuming at one of the five fixed vectors. The read-ahead margin exists so
//! this shape can be recognized before the dead cycles get decoded as if they
//! were fetched opcodes.

use crate::bus::{BusSource, PacerTimer};
use crate::ppu_link::{CYCLES_PER_FRAME, CYCLES_PER_LINE, SCREEN_H};
use crate::session::Session;

/// A vblank interrupt hitting within this many cycles of EI was probably
/// pending the whole time and says nothing about where vblank actually is.
const IRQ_ENABLE_GRACE: u32 = 16;

/// Cycles already burned on the entry sequence by the time the vector fetch
/// becomes the current transaction.
const IRQ_ENTRY_LATENCY: i32 = 6;

#[derive(Debug)]
pub struct InterruptTracker {
    pub enabled: bool,
    /// Cycle of the most recent EI/RETI, for the delayed-interrupt check.
    pub enable_cycle: u32,
}

impl InterruptTracker {
    pub fn new() -> Self {
        InterruptTracker {
            enabled: false,
            enable_cycle: 0,
        }
    }

    pub fn reset(&mut self) {
        self.enabled = false;
        self.enable_cycle = 0;
    }

    pub(crate) fn enable_at(&mut self, cycle: u32) {
        self.enabled = true;
        self.enable_cycle = cycle;
    }
}

impl Default for InterruptTracker {
    fn default() -> Self {
        InterruptTracker::new()
    }
}

impl<B: BusSource, T: PacerTimer> Session<B, T> {
    /// Check once per opcode boundary whether an interrupt entry sequence is
    /// sitting in the read-ahead window, and if so replay its side effects.
    ///
    /// The two reads at the start of the sequence look like ordinary fetches,
    /// so the test is on what follows them: execution resuming at a vector
    /// address (mask 0xFFC7 covers 0x40/48/50/58/60), preceded by two writes
    /// walking the stack pointer down. A CALL or one-byte-opcode-plus-PUSH
    /// would match the stack walk, so additionally require that the vector
    /// fetch is not just the next sequential fetch.
    pub(crate) fn recognize_interrupt(&mut self) {
        let ra = self.history.read_ahead_index();
        let vector = self.history.at(ra).address();
        if vector & 0xFFC7 != 0x0040 {
            return;
        }
        let sp = self.regs.sp;
        if self.history.at(ra.wrapping_sub(2)).address() != sp.wrapping_sub(1)
            || self.history.at(ra.wrapping_sub(1)).address() != sp.wrapping_sub(2)
            || vector == self.history.current().address().wrapping_add(2)
        {
            return;
        }

        // Replay the pushes. The interrupted PC is the previous transaction's
        // address; the current one is already the first dead cycle.
        let return_address = self
            .history
            .at(self.history.cursor().wrapping_sub(1))
            .address();
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        self.store(self.regs.sp, (return_address >> 8) as u8);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        self.store(self.regs.sp, return_address as u8);
        for _ in 0..5 {
            self.advance_bus();
        }

        if self.irq.enabled
            && (self.history.cycle.wrapping_sub(self.irq.enable_cycle) > IRQ_ENABLE_GRACE
                || self.game.use_immediate_irq)
        {
            if self.history.current().address() == 0x0040 {
                // The hardware raises vblank at the top of line 144; we are
                // a known entry latency past that moment.
                let mut offset = (SCREEN_H - self.ppu.y()) * CYCLES_PER_LINE
                    - self.ppu.line_cycle() as i32
                    - IRQ_ENTRY_LATENCY;
                if offset > CYCLES_PER_FRAME / 2 {
                    offset -= CYCLES_PER_FRAME;
                }
                log::debug!("vblank interrupt sync, offset {offset}");
                self.ppu.publish_vblank_offset(offset);
            }
        }
        // Entry clears IME on the real CPU.
        self.irq.enabled = false;
    }
}
