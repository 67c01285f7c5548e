//! Video polling-loop detection.
//!
//! The video hardware is invisible on the bus; the only timing ground truth is
//! the way the game reacts to the two status registers. Two idioms are
//! recognized:
//!
//! * STAT polling: read STAT, mask down to the mode bits, compare against the
//!   vblank mode, loop on a conditional relative jump. Only vblank waits are
//!   useful since the other modes recur many times per frame.
//! * LY polling: read LY, compare against a line number, loop the same way.
//!
//! Confirmation requires the whole pattern to finish within a few cycles of
//! the register read, and the branch to resolve the way a terminating wait
//! loop would (not taken for JR NZ, taken for JR Z). Any unrelated
//! instruction in between cancels the attempt; a miss is never an error, it
//! just forgoes the correction.

use crate::bus::{BusSource, PacerTimer};
use crate::ppu_link::{CYCLES_PER_FRAME, CYCLES_PER_LINE, SCREEN_H};
use crate::session::Session;

/// Cycle deadlines from the qualifying register read to the branch. Validated
/// against real titles, not derived from documented timing; tune with care.
pub const STAT_SYNC_DEADLINE: u32 = 9;
pub const LY_SYNC_DEADLINE: u32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    /// STAT was read; expecting AND 0x03 next.
    StatArmed,
    /// Mode bits isolated; expecting CP 0x01 next.
    StatMasked,
    /// Compared against vblank; expecting the branch, offset pending.
    StatCompared,
    /// LY was read; expecting CP next.
    LyArmed,
    /// Compared against a line; expecting the branch, offset pending.
    LyCompared,
}

#[derive(Debug)]
pub struct SyncDetector {
    stage: Stage,
    /// Cycle of the arming register read; deadlines count from here.
    reference_cycle: u32,
    /// Offset captured at the compare, published only on confirmation.
    pending_offset: i32,
    /// Set by every hook the current instruction fires. An armed detector
    /// whose instruction fired no hook saw an unrelated instruction.
    touched: bool,
    pub stat_deadline: u32,
    pub ly_deadline: u32,
}

impl SyncDetector {
    pub fn new() -> Self {
        SyncDetector {
            stage: Stage::Idle,
            reference_cycle: 0,
            pending_offset: 0,
            touched: false,
            stat_deadline: STAT_SYNC_DEADLINE,
            ly_deadline: LY_SYNC_DEADLINE,
        }
    }

    pub fn reset(&mut self) {
        self.stage = Stage::Idle;
        self.touched = false;
    }

    pub fn is_armed(&self) -> bool {
        self.stage != Stage::Idle
    }

    pub(crate) fn arm_stat(&mut self, cycle: u32) {
        self.stage = Stage::StatArmed;
        self.reference_cycle = cycle;
        self.touched = true;
    }

    pub(crate) fn arm_ly(&mut self, cycle: u32) {
        self.stage = Stage::LyArmed;
        self.reference_cycle = cycle;
        self.touched = true;
    }

    /// Called at the top of every executed instruction.
    pub(crate) fn begin_op(&mut self) {
        self.touched = false;
    }

    /// Called after every executed instruction: an armed detector that the
    /// instruction did not advance saw something that is not part of a tight
    /// polling loop.
    pub(crate) fn settle(&mut self) {
        if !self.touched {
            self.stage = Stage::Idle;
        }
    }
}

impl Default for SyncDetector {
    fn default() -> Self {
        SyncDetector::new()
    }
}

impl<B: BusSource, T: PacerTimer> Session<B, T> {
    /// Forward cycle distance from the video model's current scan position to
    /// the start of `line`, wrapped into (-frame/2, +frame/2].
    fn offset_to_line(&self, line: i32) -> i32 {
        let mut offset = (line - self.ppu.y()) * CYCLES_PER_LINE - self.ppu.line_cycle() as i32;
        if offset > CYCLES_PER_FRAME / 2 {
            offset -= CYCLES_PER_FRAME;
        } else if offset < -CYCLES_PER_FRAME / 2 {
            offset += CYCLES_PER_FRAME;
        }
        offset
    }

    /// AND against the accumulator. A STAT poll isolates the mode bits here.
    pub(crate) fn sync_on_mask(&mut self, operand: u8) {
        if self.sync.stage == Stage::Idle {
            return;
        }
        self.sync.touched = true;
        self.sync.stage = if self.sync.stage == Stage::StatArmed && operand == 0x03 {
            Stage::StatMasked
        } else {
            Stage::Idle
        };
    }

    /// CP against the accumulator. The STAT poll compares against the vblank
    /// mode; the LY poll compares against the awaited line number.
    pub(crate) fn sync_on_compare(&mut self, operand: u8) {
        match self.sync.stage {
            Stage::Idle => {}
            Stage::StatMasked if operand == 0x01 => {
                self.sync.pending_offset = self.offset_to_line(SCREEN_H);
                self.sync.stage = Stage::StatCompared;
                self.sync.touched = true;
            }
            Stage::LyArmed => {
                self.sync.pending_offset = self.offset_to_line(operand as i32);
                self.sync.stage = Stage::LyCompared;
                self.sync.touched = true;
            }
            _ => self.sync.stage = Stage::Idle,
        }
    }

    /// A JR NZ fell through. For both polling idioms that means the awaited
    /// condition finally held, so publish if the whole pattern was tight.
    pub(crate) fn sync_confirm_not_taken(&mut self) {
        let elapsed = self.history.cycle.wrapping_sub(self.sync.reference_cycle);
        match self.sync.stage {
            Stage::StatCompared if elapsed < self.sync.stat_deadline => self.publish_sync(),
            Stage::LyCompared if elapsed < self.sync.ly_deadline => self.publish_sync(),
            _ => {}
        }
        self.sync.stage = Stage::Idle;
    }

    /// A JR Z was taken, the shape of a loop that jumps into its critical
    /// section the moment the compare hits.
    pub(crate) fn sync_confirm_taken(&mut self) {
        let elapsed = self.history.cycle.wrapping_sub(self.sync.reference_cycle);
        if matches!(self.sync.stage, Stage::StatCompared | Stage::LyCompared)
            && elapsed < self.sync.ly_deadline
        {
            self.publish_sync();
        }
        self.sync.stage = Stage::Idle;
    }

    fn publish_sync(&mut self) {
        log::debug!("poll sync confirmed, offset {}", self.sync.pending_offset);
        self.ppu.publish_vblank_offset(self.sync.pending_offset);
    }
}
