// cache.rs - Decoder cache construction and the fastsim realizer
//
// Pass 1 decodes every potential instruction start into a flat entry array
// indexed by pc / stride. Pass 2 ("fastsim") fills the per-entry block
// metadata that lets the interpreter dispatch a whole basic block in a
// counted loop without re-evaluating block-boundary predicates.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::decode::{self, Decoded};
use crate::error::{MachineError, Result};
use crate::isa::{self, c_code, read_instruction, CompressedWord};
use crate::options::MachineOptions;

/// Guest page granularity used for segment padding and cache sizing
pub const PAGE_SIZE: u64 = 4096;

/// Placed in `instr` to force fastsim to treat an entry as a terminator
pub const FASTSIM_BLOCK_END: u32 = 0xFFFF;

/// One decoder-cache slot. `bytecode` and `instr` are atomics because
/// translation activation and live-patching replace them on a published
/// segment; everything else is written only by the cache builder.
#[derive(Debug)]
pub struct DecoderEntry {
    handler: u8,
    bytecode: AtomicU8,
    pub idxend: u16,
    pub icount: u8,
    pub opcode_length: u8,
    instr: AtomicU32,
}

impl DecoderEntry {
    fn unset() -> Self {
        Self {
            handler: 0,
            bytecode: AtomicU8::new(0),
            idxend: 0,
            icount: 0,
            opcode_length: 0,
            instr: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.handler != 0
    }

    #[inline]
    pub fn handler_index(&self) -> u8 {
        self.handler
    }

    #[inline]
    pub fn bytecode(&self) -> u8 {
        self.bytecode.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_bytecode(&self, bc: u8) {
        self.bytecode.store(bc, Ordering::Release);
    }

    #[inline]
    pub fn instr(&self) -> u32 {
        self.instr.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_instr(&self, instr: u32) {
        self.instr.store(instr, Ordering::Release);
    }

    /// Intern the decoded handler into the process-wide table
    pub fn set_handler(&mut self, decoded: &Decoded) -> Result<()> {
        self.handler = decode::handler_index_for(decoded.handler)?;
        Ok(())
    }

    /// Byte length of the block span this entry describes
    #[inline]
    pub fn block_bytes(&self, stride: u64) -> u64 {
        self.idxend as u64 * stride
    }

    /// Instruction count from this entry to the end of its block
    #[inline]
    pub fn instruction_count(&self, compressed: bool) -> u32 {
        if compressed {
            self.idxend as u32 + 1 - self.icount as u32
        } else {
            self.idxend as u32 + 1
        }
    }
}

impl Clone for DecoderEntry {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler,
            bytecode: AtomicU8::new(self.bytecode()),
            idxend: self.idxend,
            icount: self.icount,
            opcode_length: self.opcode_length,
            instr: AtomicU32::new(self.instr()),
        }
    }
}

/// Flat per-segment decoder table, indexed by `(pc - base) / stride`
#[derive(Debug, Clone)]
pub struct DecoderCache {
    entries: Box<[DecoderEntry]>,
    base: u64,
    stride: u64,
}

impl DecoderCache {
    pub fn new(pagedata_base: u64, n_pages: u64, stride: u64) -> Self {
        let n_entries = (n_pages * PAGE_SIZE / stride) as usize;
        let entries = (0..n_entries).map(|_| DecoderEntry::unset()).collect();
        Self { entries, base: pagedata_base, stride }
    }

    #[inline]
    pub fn stride(&self) -> u64 {
        self.stride
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn entry(&self, pc: u64) -> &DecoderEntry {
        &self.entries[((pc - self.base) / self.stride) as usize]
    }

    #[inline]
    pub fn entry_mut(&mut self, pc: u64) -> &mut DecoderEntry {
        &mut self.entries[((pc - self.base) / self.stride) as usize]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compressed instructions that never modify PC. On RV64 the C.ADDIW slot
/// replaces RV32's C.JAL, which is the one width-dependent case.
fn is_regular_compressed(half: u16, xlen: u32) -> bool {
    let ci = CompressedWord(half);
    match ci.opcode() {
        op if op == c_code(0b001, 0b01) => xlen >= 64, // C.ADDIW / C.JAL
        op if op == c_code(0b101, 0b01) => false,      // C.JMP
        op if op == c_code(0b110, 0b01) => false,      // C.BEQZ
        op if op == c_code(0b111, 0b01) => false,      // C.BNEZ
        op if op == c_code(0b100, 0b10) => {
            // C.JR / C.JALR when rs2 is zero and rd names a register
            !(ci.cr_rd() != 0 && ci.cr_rs2() == 0)
        }
        _ => true,
    }
}

/// Full-width opcodes that terminate a fastsim block
fn is_block_ending_opcode(opcode: u32) -> bool {
    matches!(
        opcode,
        isa::RV32I_BRANCH
            | isa::RV32I_SYSTEM
            | isa::RV32I_JAL
            | isa::RV32I_JALR
            | isa::RV32I_AUIPC
    )
}

// There is never really going to be a block with more than 255 raw
// instructions, but progress towards the instruction limit must still be
// counted, so the packed count saturates.
#[inline]
fn overflow_checked_instr_count(count: u64) -> u8 {
    count.min(255) as u8
}

/// Build the decoder cache for an execute range. `previous` carries the
/// existing cache when a translated segment is being rebuilt; its bound
/// entries become block-end sentinels instead of being re-decoded.
pub fn generate_decoder_cache(
    options: &MachineOptions,
    exec_data: &[u8],
    pagedata_base: u64,
    exec_begin: u64,
    exec_end: u64,
    previous: Option<&DecoderCache>,
) -> Result<DecoderCache> {
    let prelen = exec_begin - pagedata_base;
    let midlen = (exec_end - exec_begin) + prelen;
    let plen = (midlen + (PAGE_SIZE - 1)) & !(PAGE_SIZE - 1);
    let n_pages = plen / PAGE_SIZE;
    if n_pages == 0 {
        return Err(MachineError::InvalidProgram(
            "Program produced empty decoder cache",
        ));
    }

    let stride = options.stride();
    let mut cache = DecoderCache::new(pagedata_base, n_pages, stride);
    let xlen = options.xlen.bits();

    // When compressed instructions are enabled, many decoder entries are
    // illegal because they sit between instructions.
    let mut was_full_instruction = true;

    let mut dst = exec_begin;
    while dst < exec_end {
        if let Some(prev) = previous {
            let old = prev.entry(dst);
            if old.is_set() {
                // The entry is bound to a translation: pretend it ends a
                // block so the fastsim loop breaks there, and keep going.
                let entry = cache.entry_mut(dst);
                entry.handler = old.handler;
                *entry.bytecode.get_mut() = old.bytecode();
                *entry.instr.get_mut() = FASTSIM_BLOCK_END;
                dst += 4;
                continue;
            }
        }

        let instruction = read_instruction(exec_data, dst, pagedata_base, exec_end);

        if options.compressed && !was_full_instruction {
            // Second half of a 32-bit instruction: never a legal entry
            was_full_instruction = true;
            dst += 2;
            continue;
        }

        let (rewritten, decoded) = if options.decoder_rewriter {
            decode::decode_rewrite(instruction, xlen)
        } else {
            (instruction, decode::decode(instruction, xlen))
        };

        let entry = cache.entry_mut(dst);
        entry.set_handler(&decoded)?;
        *entry.bytecode.get_mut() = decoded.bytecode;
        *entry.instr.get_mut() = rewritten.0;

        if options.compressed {
            was_full_instruction = instruction.length() == 2;
            dst += 2;
        } else {
            dst += 4;
        }
    }

    realize_fastsim(options, exec_data, pagedata_base, exec_begin, dst, &mut cache);
    Ok(cache)
}

/// Pass 2: fill `idxend` (and with C-ext `icount` / `opcode_length`) so
/// every entry knows its distance to the end of its basic block.
fn realize_fastsim(
    options: &MachineOptions,
    exec_data: &[u8],
    pagedata_base: u64,
    base_pc: u64,
    last_pc: u64,
    cache: &mut DecoderCache,
) {
    if last_pc < base_pc + 4 {
        return;
    }
    if options.compressed {
        let xlen = options.xlen.bits();
        // Walk the segment forwards measuring lengths, recording entries
        // until a jumping instruction, then fill in block data backwards
        // over the recorded run.
        let mut scratch: Vec<u64> = Vec::new();
        let mut pc = base_pc;
        while pc < last_pc {
            let mut datalength: u64 = 0;
            let block_pc = pc;
            while pc < last_pc {
                scratch.push(pc);
                let sentinel = cache.entry(pc).instr() == FASTSIM_BLOCK_END;

                let instruction = read_instruction(exec_data, pc, pagedata_base, last_pc);
                let length = instruction.length();
                pc += length;
                datalength += length / 2;

                if length == 2 {
                    if !is_regular_compressed(instruction.half0(), xlen) {
                        break;
                    }
                } else if is_block_ending_opcode(instruction.opcode()) || sentinel {
                    break;
                }
            }

            let mut remaining = datalength;
            let n = scratch.len() as u64;
            let mut entry_pc = block_pc;
            for i in 0..scratch.len() {
                let instruction = read_instruction(exec_data, entry_pc, pagedata_base, last_pc);
                let length = instruction.length();
                entry_pc += length;
                let entry = cache.entry_mut(scratch[i]);
                // Ends at the last instruction of the run
                entry.idxend = remaining as u16;
                entry.opcode_length = length as u8;
                // The instruction count is packed against the block length
                // so large code blocks cannot overflow the 8-bit field.
                entry.icount = overflow_checked_instr_count(remaining - (n - i as u64));
                remaining -= length / 2;
            }
            scratch.clear();
        }
    } else {
        // Count the distance to the next branching instruction backwards,
        // filling in idxend for every entry along the way.
        let mut idxend: u64 = 0;
        let mut pc = last_pc - 4;
        loop {
            let instruction = read_instruction(exec_data, pc, pagedata_base, last_pc);
            let sentinel = cache.entry(pc).instr() == FASTSIM_BLOCK_END;
            let entry = cache.entry_mut(pc);

            if is_block_ending_opcode(instruction.opcode()) || sentinel {
                idxend = 0;
            }
            // Ends one instruction before the block ends
            entry.idxend = idxend.min(u16::MAX as u64) as u16;
            idxend += 1;

            if pc < base_pc + 4 {
                break;
            }
            pc -= 4;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::bytecode::*;
    use crate::options::Xlen;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn padded_segment(code: &[u8], vaddr: u64) -> (Vec<u8>, u64, u64, u64) {
        let pbase = vaddr & !(PAGE_SIZE - 1);
        let prelen = (vaddr - pbase) as usize;
        let midlen = code.len() + prelen;
        let plen = (midlen + (PAGE_SIZE as usize - 1)) & !(PAGE_SIZE as usize - 1);
        let mut data = vec![0u8; plen];
        data[prelen..prelen + code.len()].copy_from_slice(code);
        (data, pbase, vaddr, vaddr + code.len() as u64)
    }

    #[test]
    fn ecall_entry_is_decoded_with_system_bytecode() {
        let opts = MachineOptions::default();
        let (data, pbase, begin, end) = padded_segment(&words_to_bytes(&[0x0000_0073]), 0x1000);
        let cache = generate_decoder_cache(&opts, &data, pbase, begin, end, None).unwrap();

        let entry = cache.entry(0x1000);
        assert!(entry.is_set());
        assert_eq!(entry.bytecode(), BC_SYSCALL);
        assert_eq!(entry.instr(), 0x0000_0073);
        // SYSTEM terminates its own block
        assert_eq!(entry.idxend, 0);
    }

    #[test]
    fn empty_range_is_an_invalid_program() {
        let opts = MachineOptions::default();
        let err = generate_decoder_cache(&opts, &[], 0x1000, 0x1000, 0x1000, None).unwrap_err();
        assert_eq!(
            err,
            MachineError::InvalidProgram("Program produced empty decoder cache")
        );
    }

    #[test]
    fn fastsim_counts_down_to_each_terminator() {
        // addi, addi, addi, jal, addi, ret
        let code = [
            0x0010_0093u32,
            0x0020_0113,
            0x0030_0193,
            0x0080_006F,
            0x0040_0213,
            0x0000_8067,
        ];
        let opts = MachineOptions::default();
        let (data, pbase, begin, end) = padded_segment(&words_to_bytes(&code), 0x1000);
        let cache = generate_decoder_cache(&opts, &data, pbase, begin, end, None).unwrap();

        // Walking towards the JAL the distance decreases to zero
        assert_eq!(cache.entry(0x1000).idxend, 3);
        assert_eq!(cache.entry(0x1004).idxend, 2);
        assert_eq!(cache.entry(0x1008).idxend, 1);
        assert_eq!(cache.entry(0x100C).idxend, 0);
        // Next block: addi then the terminating JALR
        assert_eq!(cache.entry(0x1010).idxend, 1);
        assert_eq!(cache.entry(0x1014).idxend, 0);

        // Monotonicity: idxend[p] == idxend[p+4] + 1 within a block
        for pc in [0x1000u64, 0x1004, 0x1008, 0x1010] {
            let here = cache.entry(pc).idxend;
            let next = cache.entry(pc + 4).idxend;
            assert!(here == next + 1 || next == 0);
        }
    }

    #[test]
    fn compressed_cache_skips_mid_instruction_entries() {
        let mut opts = MachineOptions::default();
        opts.compressed = true;
        opts.xlen = Xlen::Rv64;
        // 32-bit addi followed by c.addi and c.ret
        let mut code = words_to_bytes(&[0x0010_0093]);
        code.extend_from_slice(&0x0505u16.to_le_bytes()); // c.addi a0, 1
        code.extend_from_slice(&0x8082u16.to_le_bytes()); // c.ret
        let (data, pbase, begin, end) = padded_segment(&code, 0x1000);
        let cache = generate_decoder_cache(&opts, &data, pbase, begin, end, None).unwrap();

        assert!(cache.entry(0x1000).is_set());
        // 0x1002 is the middle of the 32-bit addi
        assert!(!cache.entry(0x1002).is_set());
        assert!(cache.entry(0x1004).is_set());
        assert!(cache.entry(0x1006).is_set());

        // Half-word distances to the end of the block (c.ret terminates)
        assert_eq!(cache.entry(0x1000).idxend, 4);
        assert_eq!(cache.entry(0x1004).idxend, 2);
        assert_eq!(cache.entry(0x1006).idxend, 1);
        assert_eq!(cache.entry(0x1000).opcode_length, 4);
        assert_eq!(cache.entry(0x1004).opcode_length, 2);

        // Packed counts reproduce the true remaining-instruction counts
        assert!(cache.entry(0x1000).idxend >= cache.entry(0x1004).idxend);
        assert_eq!(cache.entry(0x1000).icount, 1);
        assert_eq!(cache.entry(0x1004).icount, 0);
    }

    #[test]
    fn rebuild_over_translated_entries_places_sentinels() {
        let code = [0x0010_0093u32, 0x0000_8067];
        let opts = MachineOptions::default();
        let (data, pbase, begin, end) = padded_segment(&words_to_bytes(&code), 0x1000);
        let first = generate_decoder_cache(&opts, &data, pbase, begin, end, None).unwrap();

        let rebuilt =
            generate_decoder_cache(&opts, &data, pbase, begin, end, Some(&first)).unwrap();
        assert_eq!(rebuilt.entry(0x1000).instr(), FASTSIM_BLOCK_END);
        assert_eq!(rebuilt.entry(0x1000).idxend, 0);
    }

    #[test]
    fn block_bytes_and_instruction_count_accessors() {
        let code = [0x0010_0093u32, 0x0020_0113, 0x0000_8067];
        let opts = MachineOptions::default();
        let (data, pbase, begin, end) = padded_segment(&words_to_bytes(&code), 0x1000);
        let cache = generate_decoder_cache(&opts, &data, pbase, begin, end, None).unwrap();

        let head = cache.entry(0x1000);
        assert_eq!(head.block_bytes(4), 8);
        assert_eq!(head.instruction_count(false), 3);
    }
}
