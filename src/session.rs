//! Session lifecycle: startup calibration, the decode loop, fatal-error
//! latching and the post-mortem drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::bus::{BusSource, PacerTimer};
use crate::diag::CrashReport;
use crate::dma::DmaWindow;
use crate::gamedb::GameInfo;
use crate::history::{History, READ_AHEAD};
use crate::interrupt::InterruptTracker;
use crate::memory::{ShadowMemory, IO_DEFAULTS};
use crate::ppu_link::PpuLink;
use crate::regs::Registers;
use crate::sync::SyncDetector;

/// Slots past the fault captured for the crash report, so the dump shows what
/// the console did immediately after the shadow lost it.
const DRAIN_CYCLES: u32 = 10 - READ_AHEAD as u32;

/// The ways a session ends for good. Recovery is a full reset; once the shadow
/// state has diverged there is nothing to resynchronize against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FatalError {
    /// Fetched an opcode with no handler, or one of the holes in the opcode
    /// map that a real program never executes.
    UnknownOpcode(u8),
    /// A stack access landed where the shadow stack pointer says it cannot be.
    SpDesync,
    /// Lost the program counter during a DMA window and could not find the
    /// return point afterwards.
    DmaResyncFailed,
    /// A DMA transfer was triggered while one was already in flight.
    DmaCollision,
    /// The console clock stayed stopped for more than a full frame.
    HaltTimeout,
    /// The capture FIFO overran; at least one bus cycle is gone.
    CaptureStall,
}

impl std::error::Error for FatalError {}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FatalError::UnknownOpcode(op) => write!(f, "unknown opcode 0x{op:02X}"),
            FatalError::SpDesync => write!(f, "stack pointer out of sync"),
            FatalError::DmaResyncFailed => write!(f, "could not recover program counter after DMA"),
            FatalError::DmaCollision => write!(f, "DMA triggered while a transfer was active"),
            FatalError::HaltTimeout => write!(f, "clock stopped for more than one frame"),
            FatalError::CaptureStall => write!(f, "capture FIFO overrun"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Powered up, waiting for the console to start feeding the bus.
    WaitingForGame,
    Running,
    Stopped,
}

/// Run state plus the first fatal error, which is latched: later errors during
/// the drain never overwrite the one that actually killed the session.
#[derive(Debug)]
pub struct Lifecycle {
    pub run_state: RunState,
    pub error: Option<FatalError>,
    /// The error came from the capture path rather than the decode path, so
    /// the report's history window may end in stale words.
    pub error_is_stall: bool,
}

impl Lifecycle {
    fn new() -> Self {
        Lifecycle {
            run_state: RunState::WaitingForGame,
            error: None,
            error_is_stall: false,
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        matches!(self.run_state, RunState::Running)
    }
}

/// One attachment to a console: the capture source, the pacer, and every piece
/// of shadow state. The decode loop owns it exclusively; the video stepper and
/// the report consumer only see the shared `PpuLink` and crash-report slot.
pub struct Session<B: BusSource, T: PacerTimer> {
    pub(crate) bus: B,
    pub(crate) timer: T,
    pub(crate) history: History,
    pub(crate) mem: ShadowMemory,
    pub(crate) regs: Registers,
    pub(crate) state: Lifecycle,
    pub(crate) sync: SyncDetector,
    pub(crate) dma: DmaWindow,
    pub(crate) irq: InterruptTracker,
    pub(crate) game: GameInfo,
    pub(crate) ppu: Arc<PpuLink>,
    crash: Arc<Mutex<Option<CrashReport>>>,
    /// Raised by the supervisor when the console is switched off; ends the
    /// session cleanly at the next opcode boundary.
    off: Arc<AtomicBool>,
}

impl<B: BusSource, T: PacerTimer> Session<B, T> {
    pub fn new(bus: B, timer: T) -> Self {
        Session {
            bus,
            timer,
            history: History::new(),
            mem: ShadowMemory::new(),
            regs: Registers::post_boot(),
            state: Lifecycle::new(),
            sync: SyncDetector::new(),
            dma: DmaWindow::new(),
            irq: InterruptTracker::new(),
            game: GameInfo::default(),
            ppu: Arc::new(PpuLink::new()),
            crash: Arc::new(Mutex::new(None)),
            off: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install per-title fixups, normally after the title has been identified
    /// from its VRAM writes.
    pub fn set_game(&mut self, game: GameInfo) {
        if !game.title.is_empty() {
            log::info!("game fixups active: {}", game.title);
        }
        self.game = game;
    }

    /// Handle for the video-timing stepper running on the other core.
    pub fn ppu_link(&self) -> Arc<PpuLink> {
        Arc::clone(&self.ppu)
    }

    /// Handle the report consumer polls after `run` returns an error.
    pub fn crash_slot(&self) -> Arc<Mutex<Option<CrashReport>>> {
        Arc::clone(&self.crash)
    }

    /// Flag the supervisor raises when the console powers off.
    pub fn off_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.off)
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn memory(&self) -> &ShadowMemory {
        &self.mem
    }

    pub fn run_state(&self) -> RunState {
        self.state.run_state
    }

    /// The fatal error came from the capture path rather than the decode
    /// path, so the report's history window may end in stale words.
    pub fn error_is_stall(&self) -> bool {
        self.state.error_is_stall
    }

    pub(crate) fn off_requested(&self) -> bool {
        self.off.load(Ordering::Relaxed)
    }

    pub fn error(&self) -> Option<FatalError> {
        self.state.error
    }

    /// Back to the state right after the boot ROM hands over. The IO defaults
    /// go through `store` so the register hooks publish them.
    pub fn reset_state(&mut self) {
        self.history.reset();
        self.mem.clear();
        self.regs = Registers::post_boot();
        self.sync.reset();
        self.dma.reset();
        self.irq.reset();
        self.state = Lifecycle::new();
        self.off.store(false, Ordering::Relaxed);
        for &(address, data) in IO_DEFAULTS {
            self.store(address, data);
        }
        self.history.reset_div_boot();
    }

    /// Follow one power-on-to-death arc of the console. Blocks until a fatal
    /// error; a clean return means the off switch was raised, or a replay
    /// source ran dry while the session was still waiting for the game.
    pub fn run(&mut self) -> Result<(), FatalError> {
        self.reset_state();
        self.calibrate();
        if self.history.current().address() != 0x0100 {
            log::info!("capture ended before the game started");
            self.state.run_state = RunState::Stopped;
            return Ok(());
        }
        self.state.run_state = RunState::Running;
        // Overruns during power-on are expected; only ones from here on
        // matter.
        self.bus.clear_overrun();
        log::info!("entry point fetched, shadow core following");

        while self.state.is_running() {
            if self.off_requested() {
                log::info!("console switched off, session over");
                self.state.run_state = RunState::Stopped;
                break;
            }
            self.run_dma_window();
            if !self.state.is_running() {
                break;
            }
            self.recognize_interrupt();
            let op = self.history.current().data();
            self.execute(op);
            self.ppu.publish_cycle(self.history.cycle);
            if self.bus.rx_overrun() {
                self.state.error_is_stall = true;
                self.stop(FatalError::CaptureStall);
            }
        }

        match self.state.error {
            Some(err) => {
                self.drain_and_report(err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Latch the first fatal error and stop the decode loop.
    pub(crate) fn stop(&mut self, reason: FatalError) {
        if self.state.error.is_none() {
            log::error!("shadow core stopped: {reason}");
            self.state.error = Some(reason);
        }
        self.state.run_state = RunState::Stopped;
    }

    /// Capture a few more cycles past the fault, then publish the report.
    fn drain_and_report(&mut self, reason: FatalError) {
        for _ in 0..DRAIN_CYCLES {
            self.advance_bus();
        }
        let report = CrashReport::capture(self, reason);
        if let Ok(mut slot) = self.crash.lock() {
            *slot = Some(report);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusWord, ManualTimer, ScriptedBus};
    use testutil::harness;

    #[test]
    fn full_run_calibrates_executes_and_reports() {
        // Power-on chatter long enough for calibration, the entry-point
        // fetch, a short program, then the clock dies in a halt.
        let mut words: Vec<u32> = Vec::new();
        for _ in 0..1300 {
            words.push(BusWord::pack(0x0200, 0x00).0);
        }
        words.push(BusWord::pack(0x0100, 0x00).0); // NOP at the entry point
        words.push(BusWord::pack(0x0101, 0x3E).0); // LD A,0x42
        words.push(BusWord::pack(0x0102, 0x42).0);
        words.push(BusWord::pack(0x0103, 0x76).0); // HALT
        for i in 0..8u16 {
            words.push(BusWord::pack(0x0104 + i, 0x00).0);
        }
        let mut s = Session::new(ScriptedBus::new(words), ManualTimer::auto());
        let crash = s.crash_slot();
        assert_eq!(s.run(), Err(FatalError::HaltTimeout));
        assert_eq!(s.registers().a, 0x42);
        let report = crash.lock().unwrap().take().unwrap();
        assert_eq!(report.reason, FatalError::HaltTimeout);
    }

    #[test]
    fn truncated_capture_ends_cleanly_before_the_entry_point() {
        // The capture dies 50 words in, long before the entry-point fetch.
        // The session must come back instead of waiting forever for a
        // power-on that cannot come.
        let words: Vec<u32> = (0..50u16)
            .map(|i| BusWord::pack(0x0200 + i, 0x00).0)
            .collect();
        let mut s = Session::new(ScriptedBus::new(words), ManualTimer::auto());
        assert_eq!(s.run(), Ok(()));
        assert_eq!(s.run_state(), RunState::Stopped);
        assert!(s.error().is_none());
    }

    /// Scripted capture whose FIFO reports an overrun once a set number of
    /// words have been pulled.
    struct OverrunAfter {
        inner: ScriptedBus,
        pulls_left: u32,
        overrun: bool,
    }

    impl BusSource for OverrunAfter {
        fn try_pull(&mut self) -> Option<u32> {
            if self.pulls_left == 0 {
                self.overrun = true;
            } else {
                self.pulls_left -= 1;
            }
            self.inner.try_pull()
        }

        fn rx_overrun(&mut self) -> bool {
            self.overrun
        }

        fn clear_overrun(&mut self) {
            self.overrun = false;
        }

        fn exhausted(&self) -> bool {
            self.inner.exhausted()
        }
    }

    #[test]
    fn capture_stall_marks_the_report() {
        // Calibration consumes 1306 pulls; the overrun fires on the very next
        // one, during the first decoded opcode.
        let mut words: Vec<u32> = Vec::new();
        for _ in 0..1300 {
            words.push(BusWord::pack(0x0200, 0x00).0);
        }
        words.push(BusWord::pack(0x0100, 0x00).0);
        for i in 0..12u16 {
            words.push(BusWord::pack(0x0101 + i, 0x00).0);
        }
        let bus = OverrunAfter {
            inner: ScriptedBus::new(words),
            pulls_left: 1306,
            overrun: false,
        };
        let mut s = Session::new(bus, ManualTimer::auto());
        let crash = s.crash_slot();
        assert_eq!(s.run(), Err(FatalError::CaptureStall));
        assert!(s.error_is_stall());
        let report = crash.lock().unwrap().take().unwrap();
        assert_eq!(report.reason, FatalError::CaptureStall);
        assert!(report.capture_stalled);
        assert!(report.render().contains("trailing bus history may be stale"));
    }

    #[test]
    fn decode_faults_do_not_mark_the_report_as_a_stall() {
        let mut s = harness(&[(0x0150, 0xD3)]);
        let op = s.history.current().data();
        s.execute(op);
        assert_eq!(s.state.error, Some(FatalError::UnknownOpcode(0xD3)));
        assert!(!s.error_is_stall());
        let report = CrashReport::capture(&s, FatalError::UnknownOpcode(0xD3));
        assert!(!report.capture_stalled);
    }

    #[test]
    fn fatal_error_is_latched_once() {
        let mut s = harness(&[(0x0100, 0x00)]);
        s.stop(FatalError::SpDesync);
        s.stop(FatalError::HaltTimeout);
        assert_eq!(s.state.error, Some(FatalError::SpDesync));
        assert_eq!(s.state.run_state, RunState::Stopped);
    }

    #[test]
    fn reset_applies_boot_io_defaults() {
        let s = harness(&[(0x0100, 0x00)]);
        assert_eq!(s.mem.get(0xFF40), 0x91);
        assert_eq!(s.mem.get(0xFF47), 0xFC);
        assert_eq!(s.mem.get(0xFFFF), 0x00);
        assert!(s.ppu.lcd_enabled());
        assert_eq!(s.ppu.palettes(), (0xFC, 0xFF, 0xFF));
    }

    #[test]
    fn error_display_strings() {
        assert_eq!(
            FatalError::UnknownOpcode(0xD3).to_string(),
            "unknown opcode 0xD3"
        );
        assert_eq!(
            FatalError::CaptureStall.to_string(),
            "capture FIFO overrun"
        );
    }
}
