//! Capture ring, cycle clock, halt watchdog and startup calibration.
//!
//! Capture always runs `READ_AHEAD` slots ahead of the decode cursor so the
//! interrupt recognizer can look at transactions that have not been executed
//! yet. The ring index is simply the low byte of the cycle counter.

use crate::bus::{BusSource, BusWord, PacerTimer};
use crate::memory::ShadowMemory;
use crate::ppu_link::CYCLES_PER_FRAME;
use crate::session::{FatalError, Session};

pub const HISTORY_LEN: usize = 256;
pub const READ_AHEAD: u8 = 5;

/// Consecutive missed pacer ticks before the console clock is declared
/// stopped. The first poll after a wait always reports an elapsed interval and
/// the second may still race a real cycle; only the third means the clock is
/// truly gone.
const MISSED_TICKS_FOR_HALT: u32 = 3;

/// Cycles to skip after power-on before calibrating, in case switching the
/// console on produced a few spurious captures.
pub const CYCLE_RATIO_SKIP: u32 = 250;
/// Cycles measured to derive the host-ticks-per-console-cycle ratio.
pub const CYCLE_RATIO_WINDOW: u32 = 1_000;

pub struct History {
    ring: [u32; HISTORY_LEN],
    /// Monotonic transaction count. Low byte doubles as the decode cursor
    /// into the ring; the cursor plus `READ_AHEAD` is the capture slot.
    pub cycle: u32,
    read_ahead: u8,
    raw: BusWord,
    div_epoch: u32,
    pub cycle_ratio: u32,
    missed_ticks: u32,
}

impl History {
    pub fn new() -> Self {
        History {
            ring: [0; HISTORY_LEN],
            cycle: 0,
            read_ahead: READ_AHEAD,
            raw: BusWord(0),
            div_epoch: 0,
            cycle_ratio: 0,
            missed_ticks: 0,
        }
    }

    pub fn reset(&mut self) {
        self.ring = [0; HISTORY_LEN];
        self.cycle = 0;
        self.read_ahead = READ_AHEAD;
        self.raw = BusWord(0);
        // DIV reads 0xAB right after boot.
        self.div_epoch = 0u32.wrapping_sub(0xAB00);
        self.missed_ticks = 0;
    }

    /// The transaction the decode logic is currently looking at.
    #[inline]
    pub fn current(&self) -> BusWord {
        self.raw
    }

    #[inline]
    pub fn cursor(&self) -> u8 {
        self.cycle as u8
    }

    #[inline]
    pub fn read_ahead_index(&self) -> u8 {
        self.read_ahead
    }

    #[inline]
    pub fn at(&self, index: u8) -> BusWord {
        BusWord(self.ring[index as usize])
    }

    pub fn raw_ring(&self) -> &[u32; HISTORY_LEN] {
        &self.ring
    }

    /// DIV is the high byte of the cycle count since the divider epoch.
    pub fn div(&self) -> u8 {
        (self.cycle.wrapping_sub(self.div_epoch) >> 8) as u8
    }

    pub fn reset_div(&mut self) {
        self.div_epoch = self.cycle;
    }

    /// Re-arm the divider to the post-bootrom value (0xAB).
    pub fn reset_div_boot(&mut self) {
        self.div_epoch = self.cycle.wrapping_sub(0xAB00);
    }

    fn commit(&mut self, word: u32) {
        self.cycle = self.cycle.wrapping_add(1);
        self.read_ahead = self.read_ahead.wrapping_add(1);
        self.ring[self.read_ahead as usize] = word;
        self.raw = BusWord(self.ring[self.cursor() as usize]);
    }

    /// Repeat the previous transaction into the capture slot, fixing up the
    /// one bogus sample the hardware produces when the clock is cut right
    /// after a HALT fetch.
    fn commit_synthesized(&mut self) {
        let head = self.read_ahead;
        let prev = head.wrapping_sub(1);
        if self.at(head).data() != 0x76 && self.at(prev).data() == 0x76 {
            self.ring[head as usize] = self.ring[prev as usize];
        }
        let repeat = self.ring[self.read_ahead as usize];
        self.commit(repeat);
    }

    /// Patch the data byte of the current transaction in place, both in the
    /// ring and in the exposed copy.
    fn substitute_data(&mut self, data: u8) {
        self.raw = self.raw.with_data(data);
        self.ring[self.cursor() as usize] = self.raw.0;
    }
}

impl Default for History {
    fn default() -> Self {
        History::new()
    }
}

impl<B: BusSource, T: PacerTimer> Session<B, T> {
    /// Consume the next bus transaction, busy-waiting on the capture FIFO.
    ///
    /// If the FIFO stays empty while the session is running, the watchdog
    /// declares the console clock stopped (a CPU halt with the clock cut) and
    /// synthesizes one transaction per pacer pulse by repeating the last one.
    /// Synthesis lasting longer than a full frame is fatal: no game sits in
    /// halt for a frame without a vblank interrupt waking it.
    pub(crate) fn advance_bus(&mut self) {
        loop {
            if let Some(word) = self.bus.try_pull() {
                self.history.missed_ticks = 0;
                self.history.commit(word);
                self.substitute_from_memory();
                return;
            }
            if !self.timer.poll_expired() {
                continue;
            }
            if !self.state.is_running() {
                // Still waiting for the game to be switched on, or draining
                // after a fatal stop. No substitute clock in either case.
                return;
            }
            self.history.missed_ticks += 1;
            if self.history.missed_ticks <= MISSED_TICKS_FOR_HALT {
                continue;
            }
            self.history.commit_synthesized();
            self.substitute_from_memory();
            if self.history.missed_ticks > CYCLES_PER_FRAME as u32 {
                self.stop(FatalError::HaltTimeout);
            }
            return;
        }
    }

    /// The bus cannot show data for addresses whose contents only exist
    /// inside the console (its own RAM); replace the captured byte with the
    /// shadow copy before anything decodes it.
    fn substitute_from_memory(&mut self) {
        let address = self.history.current().address();
        if ShadowMemory::is_internal(address) {
            let data = self.mem.get(address);
            self.history.substitute_data(data);
        }
    }

    /// Lead the session in until the game jumps to the post-bootrom entry
    /// point, measuring the host-tick-to-console-cycle ratio on the way. The
    /// ratio drives the watchdog pacer for the rest of the session.
    ///
    /// A live console is waited on indefinitely; an exhausted replay source
    /// or a raised off switch ends the wait with the entry point unfetched,
    /// which the caller reports as a clean end.
    pub(crate) fn calibrate(&mut self) {
        let mut lead_in = CYCLE_RATIO_SKIP;
        let mut window = CYCLE_RATIO_WINDOW;
        loop {
            self.advance_bus();
            if lead_in > 0 {
                lead_in -= 1;
                if lead_in == 0 {
                    self.timer.begin_calibration();
                }
            } else if window > 0 {
                window -= 1;
                if window == 0 {
                    self.history.cycle_ratio = self.timer.elapsed_ticks() / CYCLE_RATIO_WINDOW;
                    self.timer.set_interval(self.history.cycle_ratio);
                    log::debug!("cycle ratio calibrated: {}", self.history.cycle_ratio);
                }
            }
            if self.history.current().address() == 0x0100 {
                return;
            }
            if self.bus.exhausted() || self.off_requested() {
                log::warn!("capture ended before the entry point was fetched");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusWord;
    use crate::session::testutil::session_from_words;

    #[test]
    fn ring_wraps_without_cross_contamination() {
        // 300 words; after capture, each of the most recent 256 words must sit
        // in the slot given by the low byte of its capture cycle, untouched by
        // earlier wraps.
        let words: Vec<u32> = (0..300u32)
            .map(|i| BusWord::pack(0x4000 + i as u16, i as u8).0)
            .collect();
        let mut s = session_from_words(words.clone());
        for _ in 0..300 {
            s.advance_bus();
        }
        // Word k (0-based) lands in slot (READ_AHEAD + 1 + k) mod 256.
        for k in 44..300usize {
            let slot = (READ_AHEAD as usize + 1 + k) % 256;
            assert_eq!(
                s.history.at(slot as u8).0,
                words[k],
                "slot {slot} should hold word {k}"
            );
        }
        // Capture stays exactly the read-ahead margin ahead of decode.
        assert_eq!(
            s.history.read_ahead_index(),
            s.history.cursor().wrapping_add(READ_AHEAD)
        );
    }

    #[test]
    fn decode_lags_capture_by_read_ahead() {
        let mut s = session_from_words(
            (0..20u32).map(|i| BusWord::pack(0x0200 + i as u16, i as u8).0),
        );
        for _ in 0..6 {
            s.advance_bus();
        }
        // After six captures the decode cursor reaches the first word.
        assert_eq!(s.history.current().address(), 0x0200);
        s.advance_bus();
        assert_eq!(s.history.current().address(), 0x0201);
    }

    #[test]
    fn ram_reads_are_substituted_from_shadow_memory() {
        let mut s = session_from_words(
            [(0xC050u16, 0xFFu8), (0, 0), (0, 0), (0, 0), (0, 0), (0, 0)]
                .iter()
                .map(|&(a, d)| BusWord::pack(a, d).0),
        );
        s.mem.set(0xC050, 0x42);
        for _ in 0..6 {
            s.advance_bus();
        }
        // Captured data byte for a WRAM address is meaningless; the shadow
        // value must replace it in the exposed transaction and the ring.
        assert_eq!(s.history.current().address(), 0xC050);
        assert_eq!(s.history.current().data(), 0x42);
        assert_eq!(s.history.at(s.history.cursor()).data(), 0x42);
    }

    #[test]
    fn cartridge_reads_are_not_substituted() {
        for (addr, data) in [(0x0150u16, 0x3Eu8), (0xA010, 0x77)] {
            let mut s = session_from_words(
                std::iter::once(BusWord::pack(addr, data).0)
                    .chain(std::iter::repeat(BusWord::pack(0, 0).0).take(5)),
            );
            s.mem.set(addr, 0x99);
            for _ in 0..6 {
                s.advance_bus();
            }
            assert_eq!(s.history.current().data(), data);
        }
    }

    #[test]
    fn halt_synthesis_repeats_last_transaction_with_fixup() {
        // Four fillers, a HALT fetch, then the one bogus sample the hardware
        // emits as the clock dies, then silence.
        let mut s = session_from_words(
            [
                (0x0100u16, 0x00u8),
                (0x0101, 0x00),
                (0x0102, 0x00),
                (0x0103, 0x00),
                (0x0500, 0x76),
                (0x0501, 0x12),
            ]
            .iter()
            .map(|&(a, d)| BusWord::pack(a, d).0),
        );
        for _ in 0..6 {
            s.advance_bus();
        }
        // Script exhausted; the next advance runs the watchdog path. The
        // bogus sample after the HALT fetch must be replaced by the HALT
        // fetch before being repeated.
        s.advance_bus();
        let head = s.history.read_ahead_index();
        assert_eq!(s.history.at(head).data(), 0x76);
        assert_eq!(s.history.at(head).address(), 0x0500);
        assert_eq!(s.history.at(head.wrapping_sub(1)).data(), 0x76);
        // Synthesis keeps repeating it.
        s.advance_bus();
        let head = s.history.read_ahead_index();
        assert_eq!(s.history.at(head).data(), 0x76);
        assert!(s.state.is_running());
    }

    #[test]
    fn halt_synthesis_times_out_after_one_frame() {
        let mut s = session_from_words(
            std::iter::repeat(BusWord::pack(0x0500, 0x76).0).take(6),
        );
        for _ in 0..6 {
            s.advance_bus();
        }
        for _ in 0..=CYCLES_PER_FRAME {
            s.advance_bus();
            if !s.state.is_running() {
                break;
            }
        }
        assert_eq!(s.state.error, Some(FatalError::HaltTimeout));
        assert!(!s.state.is_running());
    }

    #[test]
    fn div_counts_from_epoch() {
        let mut s = session_from_words(std::iter::empty());
        s.reset_state();
        assert_eq!(s.history.div(), 0xAB);
        s.history.cycle = s.history.cycle.wrapping_add(0x300);
        assert_eq!(s.history.div(), 0xAE);
        s.history.reset_div();
        assert_eq!(s.history.div(), 0x00);
    }

    #[test]
    fn calibration_measures_tick_ratio() {
        // Enough words to cover lead-in + window, then the entry-point fetch.
        let mut words: Vec<u32> = (0..(CYCLE_RATIO_SKIP + CYCLE_RATIO_WINDOW))
            .map(|i| BusWord::pack(0x0000, i as u8).0)
            .collect();
        for _ in 0..8 {
            words.push(BusWord::pack(0x0100, 0x00).0);
        }
        let mut s = session_from_words(words);
        s.timer.calibration_ticks = 4_000 * CYCLE_RATIO_WINDOW;
        s.calibrate();
        assert_eq!(s.history.cycle_ratio, 4_000);
        assert_eq!(s.timer.interval, 4_000);
        assert_eq!(s.history.current().address(), 0x0100);
    }
}
