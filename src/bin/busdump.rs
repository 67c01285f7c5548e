//! Offline replay of a raw bus capture.
//!
//! Reads a file of little-endian 32-bit capture words (one per console clock
//! cycle, starting at power-on so the startup calibration can run), follows it
//! with a shadow session and prints the crash report when the session dies.
//! With a second path argument the serialized report is written there too.

use std::env;
use std::error::Error;
use std::fs;
use std::process;

use gb_shadow::{FatalError, ManualTimer, ScriptedBus, Session};

fn words_from_file(path: &str) -> Result<Vec<u32>, Box<dyn Error>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 4 != 0 {
        return Err(format!("{path}: length {} is not a multiple of 4", bytes.len()).into());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn run() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    let capture_path = match args.get(1) {
        Some(p) => p,
        None => {
            eprintln!("usage: busdump <capture.bin> [report.bin]");
            process::exit(2);
        }
    };

    let words = words_from_file(capture_path)?;
    log::info!("replaying {} words from {capture_path}", words.len());

    let mut session = Session::new(ScriptedBus::new(words), ManualTimer::auto());
    let crash = session.crash_slot();

    match session.run() {
        Ok(()) => {
            println!("capture ended cleanly before the game started");
        }
        // An exhausted capture always ends in the halt watchdog; that is the
        // expected end of a replay, not a finding.
        Err(FatalError::HaltTimeout) => {
            println!("capture exhausted, shadow core still in sync");
        }
        Err(err) => {
            let report = crash
                .lock()
                .map_err(|_| "crash slot poisoned")?
                .take()
                .ok_or("session died without filing a report")?;
            if report.capture_stalled {
                println!("capture front end lost cycles; treat the history tail with suspicion");
            }
            println!("{}", report.render());
            println!("IO and HRAM at the time of death:");
            println!("{}", report.hexdump(0xFF00, 0xFFFF));
            if let Some(out) = args.get(2) {
                fs::write(out, bincode::serialize(&report)?)?;
                println!("report written to {out}");
            }
            return Err(Box::new(err));
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("busdump: {err}");
        process::exit(1);
    }
}
