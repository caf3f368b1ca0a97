use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use dotmatrix_core::{cartridge::Cartridge, diagnostics, gameboy::GameBoy};

// One emulated second of machine cycles (4 MiHz master clock / 4).
const DEFAULT_CYCLE_BUDGET: u64 = 1_048_576;

#[derive(Parser)]
#[command(name = "dotmatrix", about = "Headless DMG emulation driver")]
struct Args {
    /// Path to ROM file
    rom: PathBuf,

    /// Stop after this many machine cycles
    #[arg(long)]
    cycles: Option<u64>,

    /// Stop after this many CPU steps
    #[arg(long)]
    steps: Option<u64>,

    /// Log CPU state after every step
    #[arg(long)]
    trace: bool,
}

/// Forwards core diagnostics into the `log` facade.
struct LogBridge;

impl diagnostics::LogSink for LogBridge {
    fn log(&self, level: diagnostics::Level, target: &'static str, args: std::fmt::Arguments) {
        let level = match level {
            diagnostics::Level::Trace => log::Level::Trace,
            diagnostics::Level::Info => log::Level::Info,
            diagnostics::Level::Warn => log::Level::Warn,
        };
        log::log!(target: target, level, "{args}");
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let _ = diagnostics::install_sink(Box::new(LogBridge));

    let cart = Cartridge::from_file(&args.rom)
        .with_context(|| format!("failed to load {}", args.rom.display()))?;

    let mut gb = GameBoy::new();
    gb.load_cart(cart);

    let cycle_budget = match (args.cycles, args.steps) {
        (None, None) => DEFAULT_CYCLE_BUDGET,
        (cycles, _) => cycles.unwrap_or(u64::MAX),
    };

    let mut steps_run = 0u64;
    while gb.cpu.total_cycles < cycle_budget {
        if args.steps.is_some_and(|limit| steps_run >= limit) {
            break;
        }
        gb.step();
        steps_run += 1;
        if args.trace {
            log::trace!(target: "cpu", "{}", gb.cpu.debug_state());
        }
    }

    println!("{}", gb.cpu.debug_state());
    gb.mmu.save_cart_ram();
    Ok(())
}
