//! Post-mortem crash reports.
//!
//! When the shadow core dies it freezes everything a human needs to work out
//! why: the full capture ring, the register file and the shadow copy of
//! console-internal memory. The report is plain data so it can be shipped off
//! the device and rendered later.

use std::fmt::Write;

use serde::{Deserialize, Serialize};

use crate::bus::{BusSource, BusWord, PacerTimer};
use crate::history::HISTORY_LEN;
use crate::session::{FatalError, Session};

/// Register file at the moment of death. Flags are kept as the raw byte so the
/// report stays readable without this crate's types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub sp: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashReport {
    pub reason: FatalError,
    pub cycle: u32,
    /// Ring slot of the transaction being decoded when the session died.
    pub cursor: u8,
    /// The fault came from the capture path (FIFO overrun), not the decode
    /// path; the tail of the history window may be stale.
    pub capture_stalled: bool,
    /// The capture ring verbatim, including the drained slots past the fault.
    pub history: Vec<u32>,
    pub regs: RegisterSnapshot,
    /// Shadow memory from 0x8000 up; everything below is cartridge ROM the
    /// shadow never writes.
    pub upper_memory: Vec<u8>,
}

impl CrashReport {
    pub(crate) fn capture<B: BusSource, T: PacerTimer>(
        session: &Session<B, T>,
        reason: FatalError,
    ) -> Self {
        let regs = &session.regs;
        CrashReport {
            reason,
            cycle: session.history.cycle,
            cursor: session.history.cursor(),
            capture_stalled: session.state.error_is_stall,
            history: session.history.raw_ring().to_vec(),
            regs: RegisterSnapshot {
                a: regs.a,
                f: regs.f.bits(),
                b: regs.b,
                c: regs.c,
                d: regs.d,
                e: regs.e,
                h: regs.h,
                l: regs.l,
                sp: regs.sp,
            },
            upper_memory: session.mem.as_slice()[0x8000..].to_vec(),
        }
    }

    fn word(&self, index: u8) -> BusWord {
        BusWord(*self.history.get(index as usize).unwrap_or(&0))
    }

    /// Human-readable account: a window of bus traffic around the fault, the
    /// register file and the failure reason.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "shadow core crash: {}", self.reason);
        let _ = writeln!(out, "cycle {}, decode cursor [{:02X}]", self.cycle, self.cursor);
        if self.capture_stalled {
            let _ = writeln!(out, "capture stalled; the trailing bus history may be stale");
        }
        let _ = writeln!(out);

        // Two dozen transactions leading up to the fault plus the drained
        // tail. The marker sits on the one being decoded when it died.
        let start = self.cursor.wrapping_sub(24);
        for i in 0..32u8 {
            let idx = start.wrapping_add(i);
            let w = self.word(idx);
            let marker = if idx == self.cursor { '>' } else { ' ' };
            let _ = writeln!(
                out,
                "{marker} [{idx:02X}] {:04X} {:02X} {}{}{}",
                w.address(),
                w.data(),
                if w.rd_inactive() { '-' } else { 'R' },
                if w.wr_inactive() { '-' } else { 'W' },
                if w.cs_inactive() { '-' } else { 'C' },
            );
        }

        let r = &self.regs;
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "AF={:02X}{:02X} BC={:02X}{:02X} DE={:02X}{:02X} HL={:02X}{:02X} SP={:04X}",
            r.a, r.f, r.b, r.c, r.d, r.e, r.h, r.l, r.sp
        );

        let op = self.word(self.cursor).data();
        let _ = writeln!(out, "decoding 0x{:02X} {}", op, OPCODE_NAMES[op as usize]);
        if op == 0xCB {
            let operand = self.word(self.cursor.wrapping_add(1)).data();
            let _ = writeln!(out, "prefixed operation 0x{operand:02X} {}", cb_name(operand));
        }
        if let FatalError::UnknownOpcode(bad) = self.reason {
            let _ = writeln!(out, "no handler for 0x{:02X} {}", bad, OPCODE_NAMES[bad as usize]);
        }
        out
    }

    /// Hex dump of a shadow memory range, both ends inclusive and at or above
    /// 0x8000. Runs of all-zero rows collapse into a single `*` line.
    pub fn hexdump(&self, start: u16, end: u16) -> String {
        let mut out = String::new();
        let mut addr = start & !0x0F;
        let mut skipping = false;
        while addr <= end {
            let row: Vec<Option<u8>> = (0..16u16)
                .map(|i| {
                    (addr + i)
                        .checked_sub(0x8000)
                        .map(|offset| self.upper_memory[offset as usize])
                })
                .collect();
            if row.iter().all(|b| *b == Some(0)) {
                if !skipping {
                    let _ = writeln!(out, "*");
                    skipping = true;
                }
            } else {
                skipping = false;
                let _ = write!(out, "{addr:04X}:");
                for b in row {
                    match b {
                        Some(b) => {
                            let _ = write!(out, " {b:02X}");
                        }
                        None => {
                            let _ = write!(out, " ..");
                        }
                    }
                }
                let _ = writeln!(out);
            }
            if addr > 0xFFF0 - 16 {
                break;
            }
            addr += 16;
        }
        out
    }
}

/// Mnemonic for a 0xCB-prefixed operation byte.
pub fn cb_name(op: u8) -> String {
    const REGS: [&str; 8] = ["B", "C", "D", "E", "H", "L", "(HL)", "A"];
    const SHIFTS: [&str; 8] = ["RLC", "RRC", "RL", "RR", "SLA", "SRA", "SWAP", "SRL"];
    let r = REGS[(op & 0x07) as usize];
    let n = (op >> 3) & 0x07;
    match op >> 6 {
        0 => format!("{} {r}", SHIFTS[n as usize]),
        1 => format!("BIT {n},{r}"),
        2 => format!("RES {n},{r}"),
        _ => format!("SET {n},{r}"),
    }
}

#[rustfmt::skip]
pub static OPCODE_NAMES: [&str; 256] = [
    // 0x00
    "NOP", "LD BC,d16", "LD (BC),A", "INC BC", "INC B", "DEC B", "LD B,d8", "RLCA",
    "LD (a16),SP", "ADD HL,BC", "LD A,(BC)", "DEC BC", "INC C", "DEC C", "LD C,d8", "RRCA",
    // 0x10
    "STOP", "LD DE,d16", "LD (DE),A", "INC DE", "INC D", "DEC D", "LD D,d8", "RLA",
    "JR r8", "ADD HL,DE", "LD A,(DE)", "DEC DE", "INC E", "DEC E", "LD E,d8", "RRA",
    // 0x20
    "JR NZ,r8", "LD HL,d16", "LD (HL+),A", "INC HL", "INC H", "DEC H", "LD H,d8", "DAA",
    "JR Z,r8", "ADD HL,HL", "LD A,(HL+)", "DEC HL", "INC L", "DEC L", "LD L,d8", "CPL",
    // 0x30
    "JR NC,r8", "LD SP,d16", "LD (HL-),A", "INC SP", "INC (HL)", "DEC (HL)", "LD (HL),d8", "SCF",
    "JR C,r8", "ADD HL,SP", "LD A,(HL-)", "DEC SP", "INC A", "DEC A", "LD A,d8", "CCF",
    // 0x40
    "LD B,B", "LD B,C", "LD B,D", "LD B,E", "LD B,H", "LD B,L", "LD B,(HL)", "LD B,A",
    "LD C,B", "LD C,C", "LD C,D", "LD C,E", "LD C,H", "LD C,L", "LD C,(HL)", "LD C,A",
    // 0x50
    "LD D,B", "LD D,C", "LD D,D", "LD D,E", "LD D,H", "LD D,L", "LD D,(HL)", "LD D,A",
    "LD E,B", "LD E,C", "LD E,D", "LD E,E", "LD E,H", "LD E,L", "LD E,(HL)", "LD E,A",
    // 0x60
    "LD H,B", "LD H,C", "LD H,D", "LD H,E", "LD H,H", "LD H,L", "LD H,(HL)", "LD H,A",
    "LD L,B", "LD L,C", "LD L,D", "LD L,E", "LD L,H", "LD L,L", "LD L,(HL)", "LD L,A",
    // 0x70
    "LD (HL),B", "LD (HL),C", "LD (HL),D", "LD (HL),E", "LD (HL),H", "LD (HL),L", "HALT", "LD (HL),A",
    "LD A,B", "LD A,C", "LD A,D", "LD A,E", "LD A,H", "LD A,L", "LD A,(HL)", "LD A,A",
    // 0x80
    "ADD A,B", "ADD A,C", "ADD A,D", "ADD A,E", "ADD A,H", "ADD A,L", "ADD A,(HL)", "ADD A,A",
    "ADC A,B", "ADC A,C", "ADC A,D", "ADC A,E", "ADC A,H", "ADC A,L", "ADC A,(HL)", "ADC A,A",
    // 0x90
    "SUB B", "SUB C", "SUB D", "SUB E", "SUB H", "SUB L", "SUB (HL)", "SUB A",
    "SBC A,B", "SBC A,C", "SBC A,D", "SBC A,E", "SBC A,H", "SBC A,L", "SBC A,(HL)", "SBC A,A",
    // 0xA0
    "AND B", "AND C", "AND D", "AND E", "AND H", "AND L", "AND (HL)", "AND A",
    "XOR B", "XOR C", "XOR D", "XOR E", "XOR H", "XOR L", "XOR (HL)", "XOR A",
    // 0xB0
    "OR B", "OR C", "OR D", "OR E", "OR H", "OR L", "OR (HL)", "OR A",
    "CP B", "CP C", "CP D", "CP E", "CP H", "CP L", "CP (HL)", "CP A",
    // 0xC0
    "RET NZ", "POP BC", "JP NZ,a16", "JP a16", "CALL NZ,a16", "PUSH BC", "ADD A,d8", "RST 00",
    "RET Z", "RET", "JP Z,a16", "PREFIX CB", "CALL Z,a16", "CALL a16", "ADC A,d8", "RST 08",
    // 0xD0
    "RET NC", "POP DE", "JP NC,a16", "??", "CALL NC,a16", "PUSH DE", "SUB d8", "RST 10",
    "RET C", "RETI", "JP C,a16", "??", "CALL C,a16", "??", "SBC A,d8", "RST 18",
    // 0xE0
    "LDH (a8),A", "POP HL", "LD (C),A", "??", "??", "PUSH HL", "AND d8", "RST 20",
    "ADD SP,r8", "JP (HL)", "LD (a16),A", "??", "??", "??", "XOR d8", "RST 28",
    // 0xF0
    "LDH A,(a8)", "POP AF", "LD A,(C)", "DI", "??", "PUSH AF", "OR d8", "RST 30",
    "LD HL,SP+r8", "LD SP,HL", "LD A,(a16)", "EI", "??", "??", "CP d8", "RST 38",
];
