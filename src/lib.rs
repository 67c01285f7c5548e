//! Passive shadow of a Game Boy CPU, reconstructed from captured bus traffic.
//!
//! The console is never driven; a capture front end delivers one packed word
//! per CPU clock cycle (address, data, control lines) and this crate follows
//! along: it decodes the fetch stream with a shadow SM83 core, mirrors every
//! write into a shadow memory, and recovers the video timing the bus cannot
//! show by watching how the game polls the video status registers and how
//! interrupts land.
//!
//! A [`Session`] owns one attachment to a console from power-on to the first
//! fatal divergence. The video side only sees the lock-free [`PpuLink`];
//! everything else stays inside the decode loop.

pub mod bus;
pub mod diag;
mod dma;
pub mod gamedb;
mod history;
mod interrupt;
pub mod memory;
mod opcodes;
pub mod ppu_link;
pub mod regs;
mod session;
mod sync;

pub use bus::{BusSource, BusWord, ManualTimer, PacerTimer, ScriptedBus};
pub use diag::{cb_name, CrashReport, RegisterSnapshot, OPCODE_NAMES};
pub use gamedb::{FixupTable, GameInfo};
pub use memory::ShadowMemory;
pub use ppu_link::{PpuLink, RenderState};
pub use regs::{Flags, Registers};
pub use session::{FatalError, RunState, Session};
