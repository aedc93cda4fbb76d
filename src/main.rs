// rvbintr - RISC-V binary translation pipeline driver
//
// Builds a decoded execute segment from a raw code blob, runs block
// discovery and code emission, and writes the generated C translation unit.
//
// Usage:
//   rvbintr code.bin --base 0x10000 -o translation.c
//   rvbintr code.bin --base 0x10000 --compressed --xlen 32 --verbose

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use rvbintr::{blocks, emit_translation_unit, MachineOptions, Segment, Xlen};

#[derive(Parser, Debug)]
#[command(name = "rvbintr")]
#[command(about = "RISC-V decoder cache and binary translation pipeline")]
#[command(version)]
struct Args {
    /// Raw guest machine code (flat binary)
    input: PathBuf,

    /// Virtual address of the code blob
    #[arg(long, value_parser = parse_address, default_value = "0x10000")]
    base: u64,

    /// Output C translation unit
    #[arg(short, long, default_value = "translation.c")]
    output: PathBuf,

    /// Guest register width (32 or 64)
    #[arg(long, default_value = "64")]
    xlen: u32,

    /// Enable the compressed (C) instruction extension
    #[arg(long)]
    compressed: bool,

    /// Emit per-instruction trace hooks
    #[arg(long)]
    trace: bool,

    /// Never account guest instructions in generated code
    #[arg(long)]
    ignore_instruction_limit: bool,

    /// Maximum number of translation blocks
    #[arg(long, default_value = "5000")]
    max_blocks: usize,

    /// Maximum number of translated instructions
    #[arg(long, default_value = "150000")]
    max_instructions: usize,

    /// Guest memory arena size for the direct-access fast path
    #[arg(long, value_parser = parse_address, default_value = "0")]
    arena_size: u64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn parse_address(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let code = std::fs::read(&args.input).context("Failed to read input binary")?;
    if args.verbose {
        eprintln!("rvbintr - RISC-V binary translation pipeline");
        eprintln!("  Input: {} ({} bytes)", args.input.display(), code.len());
        eprintln!("  Base:  0x{:x}", args.base);
    }

    let mut options = MachineOptions::default();
    options.xlen = match args.xlen {
        32 => Xlen::Rv32,
        64 => Xlen::Rv64,
        other => anyhow::bail!("unsupported XLEN {}", other),
    };
    options.compressed = args.compressed;
    options.translate_trace = args.trace;
    options.translate_ignore_instruction_limit = args.ignore_instruction_limit;
    options.translate_blocks_max = args.max_blocks;
    options.translate_instr_max = args.max_instructions;
    options.memory_arena_size = args.arena_size;
    options.start_address = args.base;

    // Build the decoded execute segment (pass 1 + fastsim)
    let segment =
        Segment::create(&options, &code, args.base).context("Failed to create execute segment")?;

    if args.verbose {
        eprintln!(
            "  Segment: 0x{:x}-0x{:x} (pages at 0x{:x})",
            segment.exec_begin(),
            segment.exec_end(),
            segment.pagedata_base()
        );
        eprintln!("  Segment hash: {:08X}", segment.crc32c_hash());
    }

    // Block discovery statistics
    let scan = blocks::scan_blocks(&segment, &options);
    if args.verbose {
        eprintln!("  Blocks: {}", scan.blocks.len());
        eprintln!("  Instructions: {}", scan.instruction_count);
        eprintln!("  Call targets: {}", scan.global_jump_locations.len());
        if scan.gp != 0 {
            eprintln!("  GP: 0x{:x}", scan.gp);
        }
    }

    // Emit the C translation unit
    let (code, mappings) = emit_translation_unit(&options, &segment)
        .context("Failed to emit translation unit")?;
    if args.verbose {
        eprintln!("  Mappings: {}", mappings.len());
        eprintln!("  Output size: {} bytes", code.len());
    }

    std::fs::write(&args.output, &code).context("Failed to write output")?;
    if args.verbose {
        eprintln!("Wrote: {}", args.output.display());
    }

    Ok(())
}
