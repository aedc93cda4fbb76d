// blocks.rs - Pre-translation block discovery
//
// Splits the execute segment into large translation blocks and collects the
// jump targets the emitter needs: per-block branch targets for local labels
// and the global JAL target set for cross-block call detection.

use std::collections::HashSet;

use crate::isa::{self, c_code, read_instruction, CompressedWord, InstrWord};
use crate::options::MachineOptions;
use crate::segment::Segment;

/// Blocks are split only after this many instructions, and then only at an
/// architecturally safe stopping instruction. Amortizes the function
/// prologue cost of the generated code.
pub const ITS_TIME_TO_SPLIT: usize = 1250;

/// One translation block handed to the code emitter
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub instructions: Vec<InstrWord>,
    pub block: u64,
    pub block_end: u64,
    pub segment_begin: u64,
    pub segment_end: u64,
    pub gp: u64,
    pub trace_instructions: bool,
    pub ignore_instruction_limit: bool,
    pub shared_segments: bool,
    /// Branch/jump targets inside `[block, block_end)`
    pub jump_locations: HashSet<u64>,
    /// Direct arena base for the in-process JIT fast path; 0 when unused
    pub arena_ptr: u64,
}

/// Scanner output: blocks in segment order plus the shared JAL target set
#[derive(Debug)]
pub struct ScanResult {
    pub blocks: Vec<BlockInfo>,
    pub global_jump_locations: HashSet<u64>,
    pub instruction_count: u64,
    pub gp: u64,
}

/// JALR, the stop instruction, WFI, and the compressed jumps-to-register
/// forms are the only encodings a block may end on.
fn is_stopping_instruction(instr: InstrWord) -> bool {
    if instr.opcode() == isa::RV32I_JALR
        || instr.0 == isa::RV32_INSTR_STOP
        || (instr.opcode() == isa::RV32I_SYSTEM
            && instr.funct3() == 0
            && instr.i_imm_raw() == isa::SYSTEM_IMM_WFI)
    {
        return true;
    }
    if instr.is_compressed() {
        let ci = CompressedWord(instr.half0());
        if ci.opcode() == c_code(0b100, 0b10) && ci.cr_rd() != 0 && ci.cr_rs2() == 0 {
            return true; // C.JR and C.JALR (aka RET)
        }
    }
    false
}

/// Heuristic GP discovery: the first `AUIPC rd=gp`, optionally followed by
/// `ADDI gp, gp, imm`, names the global pointer. First match wins.
pub fn scan_for_gp(segment: &Segment, options: &MachineOptions) -> u64 {
    let exec = segment.exec_data();
    let base = segment.pagedata_base();
    let end = segment.exec_end();
    let mut pc = segment.exec_begin();

    while pc < end {
        let instruction = read_instruction(exec, pc, base, end);
        if instruction.opcode() == isa::RV32I_AUIPC && instruction.rd() == isa::REG_GP {
            if pc + 4 < end {
                let addi = read_instruction(exec, pc + 4, base, end);
                if addi.opcode() == isa::RV32I_OP_IMM
                    && addi.funct3() == 0
                    && addi.rd() == isa::REG_GP
                    && addi.rs1() == isa::REG_GP
                {
                    return (pc as i64 + instruction.u_imm() + addi.i_imm()) as u64;
                }
            }
            return (pc as i64 + instruction.u_imm()) as u64;
        }
        pc += if options.compressed { instruction.length() } else { 4 };
    }
    0
}

/// Walk the segment into translation blocks, recording local jump targets
/// and the shared global JAL target set.
pub fn scan_blocks(segment: &Segment, options: &MachineOptions) -> ScanResult {
    let exec = segment.exec_data();
    let base = segment.pagedata_base();
    let basepc = segment.exec_begin();
    let endbasepc = segment.exec_end();

    let gp = scan_for_gp(segment, options);
    log::debug!("scan: GP=0x{:x} for segment 0x{:x}-0x{:x}", gp, basepc, endbasepc);

    let mut icounter: u64 = 0;
    let mut global_jump_locations: HashSet<u64> = HashSet::new();
    let mut blocks: Vec<BlockInfo> = Vec::new();

    // The ELF entry point is a call target by definition
    if options.start_address >= basepc && options.start_address < endbasepc {
        global_jump_locations.insert(options.start_address);
    }

    let mut pc = basepc;
    while pc < endbasepc && icounter < options.translate_instr_max as u64 {
        let block = pc;
        let mut block_insns = 0usize;

        while pc < endbasepc {
            let instruction = read_instruction(exec, pc, base, endbasepc);
            pc += if options.compressed { instruction.length() } else { 4 };
            block_insns += 1;

            // JALR and STOP are show-stoppers / code-block enders
            if block_insns >= ITS_TIME_TO_SPLIT && is_stopping_instruction(instruction) {
                break;
            }
        }
        let block_end = pc;

        let mut jump_locations: HashSet<u64> = HashSet::new();
        let mut block_instructions: Vec<InstrWord> = Vec::with_capacity(block_insns);

        // Find jump locations inside the block
        pc = block;
        while pc < block_end {
            let instruction = read_instruction(exec, pc, base, endbasepc);
            let opcode = instruction.opcode();
            let mut is_jal = false;
            let mut is_branch = false;
            let mut location: u64 = 0;

            if opcode == isa::RV32I_JAL {
                is_jal = true;
                location = (pc as i64 + instruction.j_imm()) as u64;
            } else if opcode == isa::RV32I_BRANCH {
                is_branch = true;
                location = (pc as i64 + instruction.b_imm()) as u64;
            } else if options.compressed && instruction.is_compressed() {
                let ci = CompressedWord(instruction.half0());
                if options.xlen.bits() == 32 && ci.opcode() == c_code(0b001, 0b01) {
                    is_jal = true; // C.JAL
                    location = (pc as i64 + ci.cj_imm() as i64) as u64;
                } else if ci.opcode() == c_code(0b101, 0b01) {
                    is_jal = true; // C.JMP
                    location = (pc as i64 + ci.cj_imm() as i64) as u64;
                } else if ci.opcode() == c_code(0b110, 0b01) {
                    is_branch = true; // C.BEQZ
                    location = (pc as i64 + ci.cb_imm() as i64) as u64;
                } else if ci.opcode() == c_code(0b111, 0b01) {
                    is_branch = true; // C.BNEZ
                    location = (pc as i64 + ci.cb_imm() as i64) as u64;
                }
            }

            if is_jal {
                // Every JAL target is recorded so function calls between
                // blocks can be detected later.
                global_jump_locations.insert(location);
                if location >= block && location < block_end {
                    jump_locations.insert(location);
                }
            } else if is_branch {
                // Only accept branches relative to the current block
                if location >= block && location < block_end {
                    jump_locations.insert(location);
                }
            }

            block_instructions.push(instruction);
            pc += if options.compressed { instruction.length() } else { 4 };
        }

        let length = block_instructions.len() as u64;
        if length > 0 && icounter + length < options.translate_instr_max as u64 {
            blocks.push(BlockInfo {
                instructions: block_instructions,
                block,
                block_end,
                segment_begin: basepc,
                segment_end: endbasepc,
                gp,
                trace_instructions: options.translate_trace,
                ignore_instruction_limit: options.translate_ignore_instruction_limit,
                shared_segments: options.use_shared_execute_segments,
                jump_locations,
                arena_ptr: 0,
            });
            icounter += length;
            // Beyond this estimate the compiler never finishes codegen
            if blocks.len() >= options.translate_blocks_max {
                break;
            }
        }

        pc = block_end;
    }

    ScanResult { blocks, global_jump_locations, instruction_count: icounter, gp }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn segment_at(code: &[u32], vaddr: u64) -> Segment {
        Segment::create(&MachineOptions::default(), &words_to_bytes(code), vaddr).unwrap()
    }

    #[test]
    fn gp_is_derived_from_auipc_addi_pair() {
        // auipc gp, 0; addi gp, gp, 8; ret
        let seg = segment_at(&[0x0000_0197, 0x0081_8193, 0x0000_8067], 0x1000);
        let opts = MachineOptions::default();
        assert_eq!(scan_for_gp(&seg, &opts), 0x1008);
    }

    #[test]
    fn gp_falls_back_to_auipc_only() {
        // auipc gp, 0x1000; add x1, x1, x1 (no ADDI to gp follows)
        let seg = segment_at(&[0x0000_1197, 0x0010_80B3, 0x0000_8067], 0x1000);
        let opts = MachineOptions::default();
        assert_eq!(scan_for_gp(&seg, &opts), 0x2000);
    }

    #[test]
    fn single_block_ends_at_ret() {
        let seg = segment_at(&[0x0000_0197, 0x0081_8193, 0x0000_8067], 0x1000);
        let result = scan_blocks(&seg, &MachineOptions::default());

        assert_eq!(result.gp, 0x1008);
        assert_eq!(result.blocks.len(), 1);
        let block = &result.blocks[0];
        assert_eq!(block.block, 0x1000);
        assert_eq!(block.block_end, 0x100C);
        assert_eq!(block.instructions.len(), 3);
        assert_eq!(result.instruction_count, 3);
    }

    #[test]
    fn tight_loop_records_its_own_head_as_jump_target() {
        // addi a0, a0, -1; bnez a0, .-4
        let seg = segment_at(&[0xFFF5_0513, 0xFE05_1EE3], 0x2000);
        let result = scan_blocks(&seg, &MachineOptions::default());

        assert_eq!(result.blocks.len(), 1);
        let block = &result.blocks[0];
        assert!(block.jump_locations.contains(&0x2000));
        assert_eq!(block.jump_locations.len(), 1);
    }

    #[test]
    fn jal_targets_are_recorded_globally() {
        // jal ra, +8; ret; ret  (the JAL lands on the second ret)
        let seg = segment_at(&[0x0080_00EF, 0x0000_8067, 0x0000_8067], 0x1000);
        let mut opts = MachineOptions::default();
        opts.start_address = 0x1000;
        let result = scan_blocks(&seg, &opts);

        assert!(result.global_jump_locations.contains(&0x1000)); // entry
        assert!(result.global_jump_locations.contains(&0x1008)); // JAL target
    }

    #[test]
    fn blocks_cover_the_scanned_range_in_order() {
        let seg = segment_at(&[0x0010_0093, 0x0080_006F, 0x0000_8067, 0x0000_0073], 0x1000);
        let result = scan_blocks(&seg, &MachineOptions::default());

        let mut prev_end = 0x1000;
        for block in &result.blocks {
            assert!(!block.instructions.is_empty());
            assert_eq!(block.block, prev_end);
            assert!(block.block_end <= seg.exec_end());
            prev_end = block.block_end;
        }
        assert_eq!(prev_end, seg.exec_end());
    }

    #[test]
    fn short_function_runs_are_not_split() {
        // A ret every other instruction never splits below the threshold
        let mut code = Vec::new();
        for _ in 0..16 {
            code.push(0x0010_0093);
            code.push(0x0000_8067);
        }
        let seg = segment_at(&code, 0x1000);
        let result = scan_blocks(&seg, &MachineOptions::default());
        assert_eq!(result.blocks.len(), 1);
        assert_eq!(result.blocks[0].instructions.len(), 32);
    }

    #[test]
    fn block_budget_caps_the_scan() {
        let mut opts = MachineOptions::default();
        opts.translate_instr_max = 3;
        let seg = segment_at(&[0x0010_0093, 0x0010_0093, 0x0010_0093, 0x0000_8067], 0x1000);
        let result = scan_blocks(&seg, &opts);
        // The whole-segment block would exceed the budget; nothing is kept
        assert!(result.blocks.is_empty());
    }
}
