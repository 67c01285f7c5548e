use std::collections::VecDeque;

/// One captured snapshot of the console's address/data/control lines for a
/// single clock cycle, packed into 32 bits by the capture hardware:
/// bits 0-15 address, bits 16-23 data, bits 24-31 control (active low).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusWord(pub u32);

impl BusWord {
    pub fn pack(address: u16, data: u8) -> BusWord {
        BusWord(((data as u32) << 16) | address as u32)
    }

    #[inline]
    pub fn address(self) -> u16 {
        self.0 as u16
    }

    /// The data byte. During an opcode fetch this is the opcode itself.
    #[inline]
    pub fn data(self) -> u8 {
        (self.0 >> 16) as u8
    }

    #[inline]
    pub fn control(self) -> u8 {
        (self.0 >> 24) as u8
    }

    #[inline]
    pub fn wr_inactive(self) -> bool {
        self.0 & 0x2000_0000 != 0
    }

    #[inline]
    pub fn rd_inactive(self) -> bool {
        self.0 & 0x4000_0000 != 0
    }

    #[inline]
    pub fn cs_inactive(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    /// Register-pair selector for the 16-bit ALU/load group, taken straight
    /// from bits 20-21 of the captured word (the two pair bits of the opcode
    /// byte) so handlers do not have to re-decode the opcode.
    #[inline]
    pub fn pair_select(self) -> u8 {
        ((self.0 >> 20) & 0x3) as u8
    }

    #[inline]
    pub fn with_data(self, data: u8) -> BusWord {
        BusWord((self.0 & !0x00FF_0000) | ((data as u32) << 16))
    }
}

/// The capture collaborator: a hardware FIFO producing one word per console
/// clock cycle. `try_pull` never blocks; the caller busy-waits.
pub trait BusSource {
    fn try_pull(&mut self) -> Option<u32>;

    /// True if the FIFO overran, i.e. we missed at least one cycle.
    fn rx_overrun(&mut self) -> bool;

    fn clear_overrun(&mut self);

    /// True once the source can never produce another word. A hardware FIFO
    /// never reports this; scripted replay sources do when the script runs
    /// dry, so a truncated capture ends the session instead of waiting for a
    /// power-on that cannot come.
    fn exhausted(&self) -> bool {
        false
    }
}

/// Host-side timer pulsing at (approximately) the console clock rate. Used for
/// the halt watchdog and for the startup cycle-ratio calibration.
pub trait PacerTimer {
    /// Start counting host ticks for calibration.
    fn begin_calibration(&mut self);

    /// Host ticks elapsed since `begin_calibration`.
    fn elapsed_ticks(&mut self) -> u32;

    /// Reprogram the timer to pulse every `ticks` host ticks.
    fn set_interval(&mut self, ticks: u32);

    /// True once per elapsed interval (self-clearing count flag).
    fn poll_expired(&mut self) -> bool;
}

/// Vec-backed bus source for tests and offline replay.
pub struct ScriptedBus {
    words: VecDeque<u32>,
    overrun: bool,
}

impl ScriptedBus {
    pub fn new(words: impl IntoIterator<Item = u32>) -> Self {
        ScriptedBus {
            words: words.into_iter().collect(),
            overrun: false,
        }
    }

    pub fn push(&mut self, word: u32) {
        self.words.push_back(word);
    }

    pub fn push_tx(&mut self, address: u16, data: u8) {
        self.words.push_back(BusWord::pack(address, data).0);
    }

    pub fn set_overrun(&mut self) {
        self.overrun = true;
    }

    pub fn remaining(&self) -> usize {
        self.words.len()
    }
}

impl BusSource for ScriptedBus {
    fn try_pull(&mut self) -> Option<u32> {
        self.words.pop_front()
    }

    fn rx_overrun(&mut self) -> bool {
        self.overrun
    }

    fn clear_overrun(&mut self) {
        self.overrun = false;
    }

    fn exhausted(&self) -> bool {
        self.words.is_empty()
    }
}

/// Software pacer for tests and offline replay. Every poll reports an elapsed
/// interval, so an empty scripted bus immediately drives the watchdog path
/// instead of spinning.
pub struct ManualTimer {
    pub calibration_ticks: u32,
    pub interval: u32,
}

impl ManualTimer {
    pub fn auto() -> Self {
        ManualTimer {
            calibration_ticks: 0,
            interval: 0,
        }
    }
}

impl PacerTimer for ManualTimer {
    fn begin_calibration(&mut self) {}

    fn elapsed_ticks(&mut self) -> u32 {
        self.calibration_ticks
    }

    fn set_interval(&mut self, ticks: u32) {
        self.interval = ticks;
    }

    fn poll_expired(&mut self) -> bool {
        true
    }
}
