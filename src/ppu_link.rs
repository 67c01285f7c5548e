//! Shared port between the shadow core and the external video-timing stepper.
//!
//! The opcode loop is the sole writer of everything except the scan position,
//! which the stepper publishes back. Both sides tolerate reads that are stale
//! by a few cycles; a race on the offset only costs momentary jitter.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

pub const CYCLES_PER_FRAME: i32 = 17_556;
pub const CYCLES_PER_LINE: i32 = 114;
pub const LINES: i32 = 154;
pub const SCREEN_H: i32 = 144;

/// Limit on how much of a pending correction a single stepper step may apply,
/// so a large offset is discharged over several steps instead of one visible
/// jump.
pub const MAX_CORRECTION_PER_STEP: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Done = 0,
    Start = 1,
    OamSearchDone = 2,
    Rendering = 3,
}

impl RenderState {
    pub fn from_u8(v: u8) -> RenderState {
        match v {
            1 => RenderState::Start,
            2 => RenderState::OamSearchDone,
            3 => RenderState::Rendering,
            _ => RenderState::Done,
        }
    }
}

#[derive(Debug, Default)]
pub struct PpuLink {
    y: AtomicI32,
    line_cycle: AtomicU32,
    render_state: AtomicU8,
    vblank_offset: AtomicI32,
    cycle: AtomicU32,
    lcdc: AtomicU8,
    bg_palette: AtomicU8,
    obj_palette0: AtomicU8,
    obj_palette1: AtomicU8,
}

impl PpuLink {
    pub fn new() -> Self {
        PpuLink::default()
    }

    // Stepper side.

    pub fn set_scan_position(&self, y: i32, line_cycle: u32, state: RenderState) {
        self.y.store(y, Ordering::Relaxed);
        self.line_cycle.store(line_cycle, Ordering::Relaxed);
        self.render_state.store(state as u8, Ordering::Relaxed);
    }

    /// Called once per stepper step with the number of console cycles that
    /// elapsed since the previous step. Returns how far the video model should
    /// actually advance: pending positive offsets add at most
    /// `MAX_CORRECTION_PER_STEP`, negative offsets absorb elapsed cycles
    /// until paid off.
    pub fn apply_correction(&self, steps: u32) -> u32 {
        let adjust = self.vblank_offset.load(Ordering::Relaxed);
        if adjust >= 0 {
            let adjust = adjust.min(MAX_CORRECTION_PER_STEP);
            // A concurrent publish in this window used the old scan position,
            // so decrementing the stale value still converges.
            self.vblank_offset.fetch_sub(adjust, Ordering::Relaxed);
            steps + adjust as u32
        } else {
            self.vblank_offset.fetch_add(steps as i32, Ordering::Relaxed);
            0
        }
    }

    // Core side.

    pub fn y(&self) -> i32 {
        self.y.load(Ordering::Relaxed)
    }

    pub fn line_cycle(&self) -> u32 {
        self.line_cycle.load(Ordering::Relaxed)
    }

    pub fn render_state(&self) -> RenderState {
        RenderState::from_u8(self.render_state.load(Ordering::Relaxed))
    }

    pub fn publish_vblank_offset(&self, offset: i32) {
        self.vblank_offset.store(offset, Ordering::Relaxed);
    }

    pub fn vblank_offset(&self) -> i32 {
        self.vblank_offset.load(Ordering::Relaxed)
    }

    pub fn publish_cycle(&self, cycle: u32) {
        self.cycle.store(cycle, Ordering::Relaxed);
    }

    pub fn cycle(&self) -> u32 {
        self.cycle.load(Ordering::Relaxed)
    }

    pub fn set_lcdc(&self, v: u8) {
        self.lcdc.store(v, Ordering::Relaxed);
    }

    pub fn lcdc(&self) -> u8 {
        self.lcdc.load(Ordering::Relaxed)
    }

    pub fn lcd_enabled(&self) -> bool {
        self.lcdc() & 0x80 != 0
    }

    pub fn obj_size(&self) -> u32 {
        if self.lcdc() & 0x04 != 0 {
            16
        } else {
            8
        }
    }

    pub fn set_bg_palette(&self, v: u8) {
        self.bg_palette.store(v, Ordering::Relaxed);
    }

    pub fn set_obj_palette0(&self, v: u8) {
        self.obj_palette0.store(v, Ordering::Relaxed);
    }

    pub fn set_obj_palette1(&self, v: u8) {
        self.obj_palette1.store(v, Ordering::Relaxed);
    }

    pub fn palettes(&self) -> (u8, u8, u8) {
        (
            self.bg_palette.load(Ordering::Relaxed),
            self.obj_palette0.load(Ordering::Relaxed),
            self.obj_palette1.load(Ordering::Relaxed),
        )
    }
}
