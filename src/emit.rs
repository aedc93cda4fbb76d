// emit.rs - Per-block C code generation
//
// Each translation block becomes one C function with the signature
// `ReturnValues fN(CPU*, uint64_t counter, uint64_t max_counter, addr_t pc)`.
// Intra-block jumps become labels and gotos, forward JALs to other blocks
// become direct calls, and everything the emitter cannot express statically
// escapes through the callback table.

use std::collections::{BTreeSet, HashSet};

use crate::blocks::BlockInfo;
use crate::decode;
use crate::isa::{self, expand_compressed, InstrWord};
use crate::options::MachineOptions;

/// C runtime prelude the generated translation unit compiles against. The
/// `RISCV_*` defines are supplied by the driver (command line for shared
/// objects, `#define` prologue for embeddable output).
pub const BINTR_RUNTIME: &str = r#"#include <stdint.h>
#if RISCV_TRANSLATION_DYLIB == 4
typedef uint32_t addr_t;
typedef int32_t saddr_t;
#define XLEN 32
#else
typedef uint64_t addr_t;
typedef int64_t saddr_t;
#define XLEN 64
#endif
#define LIKELY(x) __builtin_expect(!!(x), 1)
#define UNLIKELY(x) __builtin_expect(!!(x), 0)
#define VISIBLE __attribute__((used, visibility("default")))
#define ILLEGAL_OPCODE 0
#define ILLEGAL_OPERATION 1
#define INVALID_PROGRAM 2
#define MISALIGNED_INSTRUCTION 3

typedef union {
	int32_t i32[2];
	float f32[2];
	int64_t i64;
	double f64;
	struct { uint32_t bits : 31; uint32_t sign : 1; uint32_t upper; } lsign;
	struct { uint64_t bits : 63; uint64_t sign : 1; } usign;
} fp64reg;

#ifdef RISCV_EXT_VECTOR
typedef union {
	float f32[RISCV_EXT_VECTOR];
	uint32_t u32[RISCV_EXT_VECTOR];
} VectorLane;
#endif

typedef struct CPU {
	addr_t r[32];
	addr_t pc;
	fp64reg fr[32];
	uint32_t fcsr;
#ifdef RISCV_EXT_VECTOR
	struct { VectorLane lane[32]; } rvv;
#endif
} CPU;

typedef struct {
	uint64_t counter;
	uint64_t max_counter;
} ReturnValues;

struct CallbackTable {
	addr_t (*mem_ld)(CPU*, addr_t, unsigned);
	void (*mem_st)(CPU*, addr_t, addr_t, unsigned);
	void (*vec_load)(CPU*, int, addr_t);
	void (*vec_store)(CPU*, addr_t, int);
	void (*const* syscalls)(CPU*);
	int (*syscall)(CPU*, int);
	void (*unknown_syscall)(CPU*, addr_t);
	void (*system)(CPU*, uint32_t);
	unsigned (*execute)(CPU*, uint32_t);
	unsigned (*execute_handler)(CPU*, unsigned, uint32_t);
	void (*const* handlers)(CPU*, uint32_t);
	void (*exception)(CPU*, addr_t, int);
	void (*trace)(CPU*, const char*, addr_t, uint32_t);
	float (*sqrtf32)(float);
	double (*sqrtf64)(double);
	int (*clz)(uint32_t);
	int (*clzl)(uint64_t);
	int (*ctz)(uint32_t);
	int (*ctzl)(uint64_t);
	int (*cpop)(uint32_t);
	int (*cpopl)(uint64_t);
};
static struct CallbackTable api;
static char* arena_base;

VISIBLE void init(const struct CallbackTable* table, void* arena) {
	api = *table;
	arena_base = (char*)arena;
}

#define INS_COUNTER(cpu) (*(uint64_t*)((char*)(cpu) + RISCV_INS_COUNTER_OFF))
#define MAX_COUNTER(cpu) (*(uint64_t*)((char*)(cpu) + RISCV_MAX_COUNTER_OFF))
#define ARENA_AT(cpu, addr) (arena_base + (addr))
#define ARENA_READABLE(addr) ((addr_t)(addr) >= 0x1000 && (addr_t)(addr) + 8 <= RISCV_ARENA_END)
#define ARENA_WRITABLE(addr) ((addr_t)(addr) >= RISCV_ARENA_ROEND && (addr_t)(addr) + 8 <= RISCV_ARENA_END && RISCV_ARENA_ROEND != 0)
#define SPECSAFE(addr) ((addr_t)(addr) < (addr_t)RISCV_ARENA_END ? (addr_t)(addr) : (addr_t)0)
#ifdef RISCV_EXT_C
#define ALIGN_MASK 0x1
#else
#define ALIGN_MASK 0x3
#endif
#define JUMP_TO(cpu, dest) { \
	addr_t target__ = (dest); \
	if (UNLIKELY(target__ & ALIGN_MASK)) { \
		api.exception(cpu, target__, MISALIGNED_INSTRUCTION); \
	} else { \
		(cpu)->pc = target__; \
	} }

#define do_clz(x) api.clz(x)
#define do_clzl(x) api.clzl(x)
#define do_ctz(x) api.ctz(x)
#define do_ctzl(x) api.ctzl(x)
#define do_cpop(x) api.cpop(x)
#define do_cpopl(x) api.cpopl(x)

static inline uint32_t do_bswap32(uint32_t x) { return __builtin_bswap32(x); }
static inline uint64_t do_bswap64(uint64_t x) { return __builtin_bswap64(x); }
static inline void MUL128(addr_t* rd, addr_t a, addr_t b) {
#if XLEN == 64
	*rd = (addr_t)(((unsigned __int128)a * (unsigned __int128)b) >> 64);
#else
	*rd = (addr_t)(((uint64_t)a * (uint64_t)b) >> 32);
#endif
}
static inline float fminf(float a, float b) { return (a < b) ? a : b; }
static inline float fmaxf(float a, float b) { return (a > b) ? a : b; }
static inline double fmin(double a, double b) { return (a < b) ? a : b; }
static inline double fmax(double a, double b) { return (a > b) ? a : b; }
static inline void set_fl(fp64reg* r, float f) {
	r->f32[0] = f;
#ifdef RISCV_NANBOXING
	r->i32[1] = 0;
#endif
}
static inline void set_dbl(fp64reg* r, double d) { r->f64 = d; }
static inline void load_fl(fp64reg* r, uint32_t v) {
	r->i32[0] = v;
#ifdef RISCV_NANBOXING
	r->i32[1] = 0;
#endif
}
static inline void load_dbl(fp64reg* r, uint64_t v) { r->i64 = (int64_t)v; }

static inline int do_syscall(CPU* cpu, uint64_t counter, uint64_t max_counter, addr_t sysno) {
	INS_COUNTER(cpu) = counter;
	MAX_COUNTER(cpu) = max_counter;
	return api.syscall(cpu, (int)sysno);
}
"#;

/// (guest address, emitted symbol) pair produced per entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransMapping {
    pub addr: u64,
    pub symbol: String,
}

const LOOP_EXPRESSION: &str = "LIKELY(counter < max_counter)";
const SIGNEXTW: &str = "(saddr_t) (int32_t)";

fn funclabel(func: &str, addr: u64) -> String {
    format!("{}_{:x}", func, addr)
}

struct BranchInfo {
    sign: bool,
    jump_pc: u64,
}

struct Emitter<'a> {
    code: String,
    options: &'a MachineOptions,
    tinfo: &'a BlockInfo,
    blocks: &'a [BlockInfo],
    global_jump_locations: &'a HashSet<u64>,

    func: String,
    idx: usize,
    pc: u64,
    instr: InstrWord,
    instr_length: u64,
    instr_counter: u64,

    mappings: Vec<TransMapping>,
    mapping_labels: BTreeSet<usize>,
    forward_declared: Vec<String>,
}

impl<'a> Emitter<'a> {
    fn new(
        options: &'a MachineOptions,
        tinfo: &'a BlockInfo,
        blocks: &'a [BlockInfo],
        global_jump_locations: &'a HashSet<u64>,
    ) -> Self {
        let func = funclabel("f", tinfo.block);
        Self {
            code: String::new(),
            options,
            tinfo,
            blocks,
            global_jump_locations,
            func,
            idx: 0,
            pc: tinfo.block,
            instr: InstrWord(0),
            instr_length: 4,
            instr_counter: 0,
            mappings: Vec::new(),
            mapping_labels: BTreeSet::new(),
            forward_declared: Vec::new(),
        }
    }

    fn ac(&mut self, line: impl AsRef<str>) {
        self.code.push_str(line.as_ref());
        self.code.push('\n');
    }

    fn xlen(&self) -> u32 {
        self.options.xlen.bits()
    }

    fn align_mask(&self) -> u64 {
        self.options.align_mask()
    }

    fn pcrel(&self, offset: i64) -> u64 {
        (self.pc as i64 + offset) as u64
    }

    fn pcrel_str(&self, offset: i64) -> String {
        format!("{}UL", self.pcrel(offset))
    }

    fn straddr(addr: u64) -> String {
        format!("{}UL", addr)
    }

    fn label(&self, addr: u64) -> String {
        funclabel(&self.func, addr)
    }

    fn from_reg(&self, reg: u32) -> String {
        if reg == isa::REG_GP && self.tinfo.gp != 0 {
            self.tinfo.gp.to_string()
        } else if reg != 0 {
            format!("cpu->r[{}]", reg)
        } else {
            "(addr_t)0".to_string()
        }
    }

    fn to_reg(&self, reg: u32) -> String {
        if reg != 0 {
            format!("cpu->r[{}]", reg)
        } else {
            "(addr_t)0".to_string()
        }
    }

    fn from_fpreg(&self, reg: u32) -> String {
        format!("cpu->fr[{}]", reg)
    }

    fn from_rvvreg(&self, reg: u32) -> String {
        format!("cpu->rvv.lane[{}]", reg)
    }

    fn from_imm(&self, imm: i64) -> String {
        imm.to_string()
    }

    fn speculation_safe(address: impl std::fmt::Display) -> String {
        format!("SPECSAFE({})", address)
    }

    fn flat_arena(&self) -> bool {
        self.options.translation_use_arena && self.options.memory_arena_size != 0
    }

    fn encompassing_arena(&self) -> bool {
        self.options.encompassing_arena_bits != 0
    }

    fn encompassing_mask(&self) -> u64 {
        if self.options.encompassing_arena_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.options.encompassing_arena_bits) - 1
        }
    }

    fn arena_at(&self, address: &str) -> String {
        // Direct arena pointer access is an in-process JIT optimization;
        // with it, execute segments can no longer be shared across machines.
        let direct = self.options.translate_jit
            && !self.tinfo.shared_segments
            && self.tinfo.arena_ptr != 0;
        if direct {
            if self.encompassing_arena() {
                if self.options.encompassing_arena_bits == 32 {
                    format!("({}ull + (uint32_t)({}))", self.tinfo.arena_ptr, address)
                } else {
                    format!(
                        "({}ull + (({}) & {}))",
                        self.tinfo.arena_ptr,
                        address,
                        self.encompassing_mask()
                    )
                }
            } else {
                format!(
                    "({}ull + {})",
                    self.tinfo.arena_ptr,
                    Self::speculation_safe(address)
                )
            }
        } else if self.encompassing_arena() {
            if self.options.encompassing_arena_bits == 32 {
                format!("ARENA_AT(cpu, (uint32_t)({}))", address)
            } else {
                format!("ARENA_AT(cpu, ({}) & {})", address, self.encompassing_mask())
            }
        } else {
            format!("ARENA_AT(cpu, {})", Self::speculation_safe(address))
        }
    }

    fn arena_at_fixed(&self, address: u64) -> String {
        let direct = self.options.translate_jit
            && !self.tinfo.shared_segments
            && self.tinfo.arena_ptr != 0;
        if direct {
            if self.encompassing_arena() {
                format!(
                    "({}ull)",
                    self.tinfo.arena_ptr + (address & self.encompassing_mask())
                )
            } else {
                format!("({}ull)", self.tinfo.arena_ptr + address)
            }
        } else if self.encompassing_arena() {
            format!("ARENA_AT(cpu, {})", address & self.encompassing_mask())
        } else {
            format!("ARENA_AT(cpu, {})", Self::speculation_safe(address))
        }
    }

    fn memory_load(&mut self, dst: String, ctype: &str, signed: bool, size: u32, reg: u32, imm: i64) {
        let cast = if signed { "(saddr_t)" } else { "" };

        if reg == isa::REG_GP && self.tinfo.gp != 0 && self.flat_arena() {
            let absolute_vaddr = (self.tinfo.gp as i64 + imm) as u64;
            if absolute_vaddr >= 0x1000
                && absolute_vaddr + size as u64 <= self.options.memory_arena_size
            {
                let at = self.arena_at_fixed(absolute_vaddr);
                self.ac(format!("{} = {}*({}*){};", dst, cast, ctype, at));
                return;
            }
        }

        let address = format!("{} + {}", self.from_reg(reg), self.from_imm(imm));
        if self.encompassing_arena() {
            let at = self.arena_at(&address);
            self.ac(format!("{} = {}*({}*){};", dst, cast, ctype, at));
        } else if self.flat_arena() {
            let at = self.arena_at(&address);
            self.ac(format!("if (LIKELY(ARENA_READABLE({})))", address));
            self.ac(format!("{} = {}*({}*){};", dst, cast, ctype, at));
            self.ac("else {");
            self.ac(format!(
                "{} = {}({})api.mem_ld(cpu, {}, {});",
                dst, cast, ctype, address, size
            ));
            self.ac("}");
        } else {
            self.ac(format!(
                "{} = {}({})api.mem_ld(cpu, {}, {});",
                dst, cast, ctype, address, size
            ));
        }
    }

    fn memory_store(&mut self, ctype: &str, reg: u32, imm: i64, value: String) {
        if reg == isa::REG_GP && self.tinfo.gp != 0 && self.flat_arena() {
            let absolute_vaddr = (self.tinfo.gp as i64 + imm) as u64;
            // Stores into the initial read-only range fall through to the
            // runtime instead.
            if absolute_vaddr >= self.options.initial_rodata_end
                && absolute_vaddr < self.options.memory_arena_size
            {
                self.ac(format!(
                    "*({}*)ARENA_AT(cpu, {}) = {};",
                    ctype,
                    Self::speculation_safe(absolute_vaddr),
                    value
                ));
                return;
            }
        }

        let address = format!("{} + {}", self.from_reg(reg), self.from_imm(imm));
        if self.encompassing_arena() {
            let at = self.arena_at(&address);
            self.ac(format!("*({}*){} = {};", ctype, at, value));
        } else if self.flat_arena() {
            let at = self.arena_at(&address);
            self.ac(format!("if (LIKELY(ARENA_WRITABLE({})))", address));
            self.ac(format!("  *({}*){} = {};", ctype, at, value));
            self.ac("else {");
            self.ac(format!(
                "  api.mem_st(cpu, {}, {}, sizeof({}));",
                address, value, ctype
            ));
            self.ac("}");
        } else {
            self.ac(format!(
                "api.mem_st(cpu, {}, {}, sizeof({}));",
                address, value, ctype
            ));
        }
    }

    fn emit_op(&mut self, op: &str, sop: &str, rd: u32, rs1: u32, rs2: &str) {
        if rd == 0 {
            // must be a NOP
        } else if rd == rs1 {
            self.ac(format!("{}{}{};", self.to_reg(rd), sop, rs2));
        } else {
            self.ac(format!("{} = {}{}{};", self.to_reg(rd), self.from_reg(rs1), op, rs2));
        }
    }

    fn exit_function(&mut self, new_pc: &str, add_bracket: bool) {
        if new_pc != "cpu->pc" {
            self.ac(format!("cpu->pc = {};", new_pc));
        }
        if self.tinfo.ignore_instruction_limit {
            self.ac("return (ReturnValues){0, max_counter};");
        } else {
            self.ac("return (ReturnValues){counter, max_counter};");
        }
        if add_bracket {
            self.ac(" }");
        }
    }

    fn increment_counter_so_far(&mut self) {
        let icount = self.instr_counter;
        self.instr_counter = 0;
        if icount > 0 && !self.tinfo.ignore_instruction_limit {
            self.ac(format!("counter += {};", icount));
        }
    }

    fn add_reentry_next(&mut self) -> bool {
        // The end of the function can be empty; never re-enter there
        if self.pc + self.instr_length >= self.tinfo.block_end {
            return false;
        }
        self.mapping_labels.insert(self.idx + 1);
        true
    }

    fn within_segment(&self, addr: u64) -> bool {
        addr >= self.tinfo.segment_begin && addr < self.tinfo.segment_end
    }

    fn find_block_base(&self, pc: u64) -> u64 {
        for blk in self.blocks {
            if pc >= blk.block && pc < blk.block_end {
                return blk.block;
            }
        }
        0
    }

    fn unknown_instruction(&mut self) {
        let bits = self.instr.0;
        if self.options.translate_jit {
            // The JIT always runs on the current machine, so the handler
            // index can be resolved right now.
            let decoded = decode::decode(self.instr, self.xlen());
            let index = decode::handler_index_for(decoded.handler).unwrap_or(0);
            self.ac(format!(
                "if (api.execute_handler(cpu, {}, {}))\n  return (ReturnValues){{0, 0}};",
                index, bits
            ));
        } else if bits != 0 {
            // A translated program may run on another machine where handler
            // order differs, so the index is resolved lazily on first use.
            self.ac("{ static int handler_idx = 0;");
            self.ac(format!(
                "if (handler_idx) api.handlers[handler_idx](cpu, {});",
                bits
            ));
            self.ac(format!("else handler_idx = api.execute(cpu, {}); }}", bits));
        } else {
            let pc = self.pc;
            self.ac(format!(
                "api.exception(cpu, {}, ILLEGAL_OPCODE);",
                Self::straddr(pc)
            ));
        }
    }

    fn add_branch(&mut self, binfo: BranchInfo, op: &str) {
        let rs1 = self.from_reg(self.instr.rs1());
        let rs2 = self.from_reg(self.instr.rs2());
        if !binfo.sign {
            self.ac(format!("if ({}{}{}) {{", rs1, op, rs2));
        } else {
            self.ac(format!("if ((saddr_t){}{} (saddr_t){}) {{", rs1, op, rs2));
        }

        let offset = self.instr.b_imm();
        if self.pcrel(offset) & self.align_mask() != 0 {
            let here = self.pcrel_str(0);
            self.ac(format!(
                "api.exception(cpu, {}, MISALIGNED_INSTRUCTION); return (ReturnValues){{0, 0}};",
                here
            ));
            self.ac("}");
            return;
        }

        if binfo.jump_pc != 0 {
            if binfo.jump_pc > self.pc || self.tinfo.ignore_instruction_limit {
                // unconditional forward jump + bracket
                let label = self.label(binfo.jump_pc);
                self.ac(format!("goto {}; }}", label));
                return;
            }
            // backward jump
            let label = self.label(binfo.jump_pc);
            self.ac(format!("if ({}) goto {};", LOOP_EXPRESSION, label));
        }
        // else, exit the translation with the branch destination
        let dest = self.pcrel_str(offset);
        self.exit_function(&dest, true);
    }

    fn emit(&mut self) {
        self.mappings.push(TransMapping { addr: self.pc, symbol: self.func.clone() });
        let entry_label = self.label(self.pc);
        self.ac(format!("{}:;", entry_label));

        let mut next_pc = self.tinfo.block;
        let instructions = self.tinfo.instructions.clone();

        for (i, &raw_instr) in instructions.iter().enumerate() {
            self.idx = i;
            self.instr = raw_instr;
            self.pc = next_pc;
            self.instr_length = if self.options.compressed { self.instr.length() } else { 4 };
            next_pc = self.pc + self.instr_length;

            // Return addresses and global JAL targets re-enter through the
            // function's dispatch switch
            if i > 0
                && (self.mapping_labels.contains(&i)
                    || self.global_jump_locations.contains(&self.pc))
            {
                self.increment_counter_so_far();
                let label = self.label(self.pc);
                self.ac(format!("{}:;", label));
                self.mappings.push(TransMapping { addr: self.pc, symbol: self.func.clone() });
            } else if i > 0 && self.tinfo.jump_locations.contains(&self.pc) {
                self.increment_counter_so_far();
                let label = self.label(self.pc);
                self.ac(format!("{}:;", label));
            }

            // With garbage instructions someone may jump into the middle of
            // a 32-bit instruction. Keep a trapping label there so such a
            // jump cannot become an unaccounted loop.
            if self.options.compressed
                && self.instr_length == 4
                && self.tinfo.jump_locations.contains(&(self.pc + 2))
            {
                let mid = self.label(self.pc + 2);
                let midaddr = Self::straddr(self.pc + 2);
                self.ac(format!("goto {}_skip;", mid));
                self.ac(format!("{}:;", mid));
                self.ac(format!(
                    "api.exception(cpu, {}, MISALIGNED_INSTRUCTION); return (ReturnValues){{0, 0}};",
                    midaddr
                ));
                self.ac(format!("{}_skip:;", mid));
            }

            if self.tinfo.trace_instructions {
                let (func, here) = (self.func.clone(), Self::straddr(self.pc));
                self.ac(format!(
                    "api.trace(cpu, \"{}\", {}, {});",
                    func, here, self.instr.0
                ));
            }

            self.instr_counter += 1;

            if self.instr.is_compressed() {
                match expand_compressed(self.instr.half0(), self.xlen()) {
                    Some(expanded) => self.instr = expanded,
                    None => {
                        // Unexpanded compressed instruction: runtime escape.
                        // The illegal all-zeroes encoding reveals PC first.
                        let half = self.instr.half0();
                        if half == 0 {
                            let here = Self::straddr(self.pc);
                            self.ac(format!("cpu->pc = {};", here));
                        }
                        self.ac(format!("api.execute(cpu, {:#06x});", half));
                        continue;
                    }
                }
            }

            self.emit_instruction(next_pc);
        }

        // If the block ends without a terminator, gracefully finish by
        // setting the next PC and flushing the counter.
        self.increment_counter_so_far();
        let end = Self::straddr(self.tinfo.block_end);
        self.exit_function(&end, true);
    }

    fn emit_instruction(&mut self, next_pc: u64) {
        let instr = self.instr;
        match instr.opcode() {
            isa::RV32I_LOAD => {
                let rd = instr.rd();
                let rs1 = instr.rs1();
                let imm = instr.i_imm();
                if rd != 0 {
                    let dst = self.to_reg(rd);
                    match instr.funct3() {
                        0x0 => self.memory_load(dst, "int8_t", true, 1, rs1, imm),
                        0x1 => self.memory_load(dst, "int16_t", true, 2, rs1, imm),
                        0x2 => self.memory_load(dst, "int32_t", true, 4, rs1, imm),
                        0x3 => self.memory_load(dst, "int64_t", true, 8, rs1, imm),
                        0x4 => self.memory_load(dst, "uint8_t", false, 1, rs1, imm),
                        0x5 => self.memory_load(dst, "uint16_t", false, 2, rs1, imm),
                        0x6 => self.memory_load(dst, "uint32_t", false, 4, rs1, imm),
                        _ => self.unknown_instruction(),
                    }
                } else {
                    // rd=0: the load may still fault, so perform it into a
                    // discarded volatile temporary
                    let temp = format!("tmp_{:x}", self.pc);
                    self.ac(format!("uint8_t {};", temp));
                    self.memory_load(temp.clone(), "volatile uint8_t", false, 1, rs1, imm);
                    self.ac(format!("(void){};", temp));
                }
            }
            isa::RV32I_STORE => {
                let rs1 = instr.rs1();
                let rs2 = instr.rs2();
                let imm = instr.s_imm();
                let value = self.from_reg(rs2);
                match instr.funct3() {
                    0x0 => self.memory_store("int8_t", rs1, imm, value),
                    0x1 => self.memory_store("int16_t", rs1, imm, value),
                    0x2 => self.memory_store("int32_t", rs1, imm, value),
                    0x3 => self.memory_store("int64_t", rs1, imm, value),
                    _ => self.unknown_instruction(),
                }
            }
            isa::RV32I_BRANCH => {
                self.increment_counter_so_far();
                let offset = instr.b_imm();
                let dest_pc = self.pcrel(offset);
                let mut jump_pc = 0;
                // goto branch: restarts the function
                if dest_pc == self.tinfo.block {
                    jump_pc = dest_pc;
                } else if offset > 0 && dest_pc < self.tinfo.block_end {
                    // forward label: future address
                    jump_pc = dest_pc;
                } else if self.tinfo.jump_locations.contains(&dest_pc)
                    && dest_pc >= self.tinfo.block
                    && dest_pc < self.tinfo.block_end
                {
                    jump_pc = dest_pc;
                }
                match instr.funct3() {
                    0x0 => self.add_branch(BranchInfo { sign: false, jump_pc }, " == "),
                    0x1 => self.add_branch(BranchInfo { sign: false, jump_pc }, " != "),
                    0x4 => self.add_branch(BranchInfo { sign: true, jump_pc }, " < "),
                    0x5 => self.add_branch(BranchInfo { sign: true, jump_pc }, " >= "),
                    0x6 => self.add_branch(BranchInfo { sign: false, jump_pc }, " < "),
                    0x7 => self.add_branch(BranchInfo { sign: false, jump_pc }, " >= "),
                    _ => self.unknown_instruction(),
                }
            }
            isa::RV32I_JALR => {
                // jump to register + immediate
                self.increment_counter_so_far();
                let rd = instr.rd();
                let rs1 = instr.rs1();
                let imm = instr.i_imm();
                if rd != 0 {
                    // RS1 must be captured first: it can be clobbered by RD
                    let rs1v = self.from_reg(rs1);
                    let link = self.pcrel_str(self.instr_length as i64);
                    let dst = self.to_reg(rd);
                    self.ac(format!("{{addr_t rs1 = {};", rs1v));
                    self.ac(format!("{} = {};", dst, link));
                    self.ac(format!("JUMP_TO(cpu, rs1 + {}); }}", self.from_imm(imm)));
                } else {
                    let rs1v = self.from_reg(rs1);
                    self.ac(format!("JUMP_TO(cpu, {} + {});", rs1v, self.from_imm(imm)));
                }
                self.exit_function("cpu->pc", false);
                self.add_reentry_next();
            }
            isa::RV32I_JAL => {
                self.increment_counter_so_far();
                let rd = instr.rd();
                if rd != 0 {
                    let link = self.pcrel_str(self.instr_length as i64);
                    let dst = self.to_reg(rd);
                    self.ac(format!("{} = {};", dst, link));
                }
                // Unaligned jump targets are masked off
                let dest_pc = (self.pcrel(instr.j_imm())) & !self.align_mask();
                let mut add_reentry = rd != 0;
                let mut already_exited = false;

                if dest_pc >= self.tinfo.block && dest_pc < self.tinfo.block_end {
                    if dest_pc > self.pc {
                        let label = self.label(dest_pc);
                        self.ac(format!("goto {};", label));
                    } else if self.tinfo.ignore_instruction_limit {
                        let label = self.label(dest_pc);
                        self.ac(format!("goto {};", label));
                        // Random jumps around often have useful code right
                        // after; keep it reachable
                        if rd == 0 {
                            add_reentry = true;
                        }
                    } else {
                        let label = self.label(dest_pc);
                        self.ac(format!("if ({}) goto {};", LOOP_EXPRESSION, label));
                        if rd == 0 {
                            add_reentry = true;
                        }
                    }
                    // if the counter runs out we still exit below
                } else if self.global_jump_locations.contains(&dest_pc)
                    && self.within_segment(dest_pc)
                {
                    let target_funcaddr = self.find_block_base(dest_pc);
                    // Directly call the target block, as long as it is a
                    // forward jump
                    if target_funcaddr != 0 && dest_pc > self.pc {
                        let target_func = funclabel("f", target_funcaddr);
                        self.ac("{ReturnValues rv;");
                        self.forward_declared.push(target_func.clone());
                        let dest = Self::straddr(dest_pc);
                        if !self.tinfo.ignore_instruction_limit {
                            self.ac(format!(
                                "rv = {}(cpu, counter, max_counter, {});",
                                target_func, dest
                            ));
                            self.ac("counter = rv.counter;");
                        } else {
                            self.ac(format!(
                                "rv = {}(cpu, 0, max_counter, {});",
                                target_func, dest
                            ));
                        }
                        self.ac("max_counter = rv.max_counter;}");
                        // Exit unless PC landed on the next instruction and
                        // the counter permits continuing
                        if rd != 0 && self.add_reentry_next() {
                            let next_label = self.label(next_pc);
                            let next = Self::straddr(next_pc);
                            if self.tinfo.ignore_instruction_limit {
                                self.ac(format!("if (cpu->pc == {}) goto {};", next, next_label));
                            } else {
                                self.ac(format!(
                                    "if ({} && cpu->pc == {}) goto {};",
                                    LOOP_EXPRESSION, next, next_label
                                ));
                            }
                        }
                        self.exit_function("cpu->pc", false);
                        already_exited = true;
                    }
                }

                // Forward jumps prevent ending the function here
                if !already_exited {
                    let dest = Self::straddr(dest_pc);
                    self.exit_function(&dest, false);
                }
                if add_reentry {
                    self.add_reentry_next();
                }
            }
            isa::RV32I_OP_IMM => self.emit_op_imm(),
            isa::RV32I_OP => self.emit_op_reg(),
            isa::RV32I_LUI => {
                if instr.rd() != 0 {
                    let dst = self.to_reg(instr.rd());
                    self.ac(format!("{} = {};", dst, self.from_imm(instr.u_imm())));
                }
            }
            isa::RV32I_AUIPC => {
                if instr.rd() != 0 {
                    let dst = self.to_reg(instr.rd());
                    let value = self.pcrel_str(instr.u_imm());
                    self.ac(format!("{} = {};", dst, value));
                }
            }
            isa::RV32I_FENCE => {}
            isa::RV32I_SYSTEM => self.emit_system(),
            isa::RV64I_OP_IMM32 => self.emit_op_imm32(),
            isa::RV64I_OP32 => self.emit_op32(),
            isa::RV32F_LOAD => self.emit_fp_load(),
            isa::RV32F_STORE => self.emit_fp_store(),
            isa::RV32F_FMADD | isa::RV32F_FMSUB | isa::RV32F_FNMADD | isa::RV32F_FNMSUB => {
                self.emit_fp_fma()
            }
            isa::RV32F_FPFUNC => self.emit_fp_func(),
            isa::RV32A_ATOMIC => self.unknown_instruction(),
            isa::RV32V_OP => self.emit_vector(),
            _ => self.unknown_instruction(),
        }
    }

    fn emit_op_imm(&mut self) {
        let instr = self.instr;
        // NOP: instruction without side-effect
        if instr.rd() == 0 {
            return;
        }
        let xlen = self.xlen();
        let dst = self.to_reg(instr.rd());
        let src = self.from_reg(instr.rs1());
        match instr.funct3() {
            0x0 => {
                // ADDI
                if instr.i_imm() == 0 {
                    self.ac(format!("{} = {};", dst, src));
                } else {
                    let imm = self.from_imm(instr.i_imm());
                    self.emit_op(" + ", " += ", instr.rd(), instr.rs1(), &imm);
                }
            }
            0x1 => {
                // SLLI and the Zbb/Zbs encodings sharing its funct3
                match instr.i_imm_raw() {
                    0b011000000100 => self.ac(format!("{} = (saddr_t)(int8_t){};", dst, src)), // SEXT.B
                    0b011000000101 => self.ac(format!("{} = (saddr_t)(int16_t){};", dst, src)), // SEXT.H
                    0b011000000000 => {
                        // CLZ
                        let fun = if xlen == 32 { "do_clz" } else { "do_clzl" };
                        self.ac(format!("{} = {} ? {}({}) : XLEN;", dst, src, fun, src));
                    }
                    0b011000000001 => {
                        // CTZ
                        let fun = if xlen == 32 { "do_ctz" } else { "do_ctzl" };
                        self.ac(format!("{} = {} ? {}({}) : XLEN;", dst, src, fun, src));
                    }
                    0b011000000010 => {
                        // CPOP
                        let fun = if xlen == 32 { "do_cpop" } else { "do_cpopl" };
                        self.ac(format!("{} = {}({});", dst, fun, src));
                    }
                    _ => {
                        if instr.i_high_bits() == 0 {
                            let shamt = (instr.shift64_imm() & (xlen - 1)).to_string();
                            self.emit_op(" << ", " <<= ", instr.rd(), instr.rs1(), &shamt);
                        } else if instr.i_high_bits() == 0x280 {
                            // BSETI
                            let bit = instr.i_imm_raw() & (xlen - 1);
                            self.ac(format!("{} = {} | ((addr_t)1 << ({}));", dst, src, bit));
                        } else if instr.i_high_bits() == 0x480 {
                            // BCLRI
                            let bit = instr.i_imm_raw() & (xlen - 1);
                            self.ac(format!("{} = {} & ~((addr_t)1 << ({}));", dst, src, bit));
                        } else if instr.i_high_bits() == 0x680 {
                            // BINVI
                            let bit = instr.i_imm_raw() & (xlen - 1);
                            self.ac(format!("{} = {} ^ ((addr_t)1 << ({}));", dst, src, bit));
                        } else {
                            self.unknown_instruction();
                        }
                    }
                }
            }
            0x2 => {
                // SLTI: signed less than immediate
                let imm = self.from_imm(instr.i_imm());
                self.ac(format!("{} = ((saddr_t){} < {}) ? 1 : 0;", dst, src, imm));
            }
            0x3 => {
                // SLTIU
                let imm = self.from_imm(instr.i_imm());
                self.ac(format!("{} = ({} < (unsigned) {}) ? 1 : 0;", dst, src, imm));
            }
            0x4 => {
                let imm = self.from_imm(instr.i_imm());
                self.emit_op(" ^ ", " ^= ", instr.rd(), instr.rs1(), &imm);
            }
            0x5 => {
                // SRLI / SRAI / RORI / ORC.B / REV8 / BEXTI
                if instr.is_rori() {
                    let shift = instr.i_imm_raw() & (xlen - 1);
                    self.ac(format!("{{const unsigned shift = {};", shift));
                    self.ac(format!(
                        "{} = ({} >> shift) | ({} << (XLEN - shift)); }}",
                        dst, src, src
                    ));
                } else if instr.i_imm_raw() == 0x287 {
                    // ORC.B: bitwise OR-combine
                    self.ac("for (unsigned i = 0; i < sizeof(addr_t); i++)".to_string());
                    self.ac(format!(
                        "\t((char *)&{})[i] = ((char *)&{})[i] ? 0xFF : 0x0;",
                        dst, src
                    ));
                } else if instr.is_rev8(xlen) {
                    let fun = if xlen == 32 { "do_bswap32" } else { "do_bswap64" };
                    self.ac(format!("{} = {}({});", dst, fun, src));
                } else if instr.i_high_bits() == 0x0 {
                    // SRLI
                    let shamt = (instr.shift64_imm() & (xlen - 1)).to_string();
                    self.emit_op(" >> ", " >>= ", instr.rd(), instr.rs1(), &shamt);
                } else if instr.i_high_bits() == 0x400 {
                    // SRAI preserves the sign bit
                    let shamt = instr.shift64_imm() & (xlen - 1);
                    self.ac(format!("{} = (saddr_t){} >> {};", dst, src, shamt));
                } else if instr.i_high_bits() == 0x480 {
                    // BEXTI
                    let bit = instr.i_imm_raw() & (xlen - 1);
                    self.ac(format!("{} = ({} >> ({})) & 1;", dst, src, bit));
                } else {
                    self.unknown_instruction();
                }
            }
            0x6 => {
                let imm = self.from_imm(instr.i_imm());
                self.ac(format!("{} = {} | {};", dst, src, imm));
            }
            0x7 => {
                let imm = self.from_imm(instr.i_imm());
                self.ac(format!("{} = {} & {};", dst, src, imm));
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_op_reg(&mut self) {
        let instr = self.instr;
        if instr.rd() == 0 {
            return;
        }
        let (rd, rs1, rs2) = (instr.rd(), instr.rs1(), instr.rs2());
        let dst = self.to_reg(rd);
        let src1 = self.from_reg(rs1);
        let src2 = self.from_reg(rs2);
        match instr.rtype_op() {
            0x0 => self.emit_op(" + ", " += ", rd, rs1, &src2),
            0x200 => self.emit_op(" - ", " -= ", rd, rs1, &src2),
            0x1 => self.ac(format!("{} = {} << ({} & (XLEN-1));", dst, src1, src2)),
            0x2 => self.ac(format!(
                "{} = ((saddr_t){} < (saddr_t){}) ? 1 : 0;",
                dst, src1, src2
            )),
            0x3 => self.ac(format!("{} = ({} < {}) ? 1 : 0;", dst, src1, src2)),
            0x4 => self.emit_op(" ^ ", " ^= ", rd, rs1, &src2),
            0x5 => self.ac(format!("{} = {} >> ({} & (XLEN-1));", dst, src1, src2)),
            0x205 => self.ac(format!("{} = (saddr_t){} >> ({} & (XLEN-1));", dst, src1, src2)),
            0x6 => self.emit_op(" | ", " |= ", rd, rs1, &src2),
            0x7 => self.emit_op(" & ", " &= ", rd, rs1, &src2),
            // extension RV32M / RV64M
            0x10 => self.ac(format!("{} = (saddr_t){} * (saddr_t){};", dst, src1, src2)),
            0x11 | 0x12 | 0x13 => {
                // MULH family: the 32-bit form widens through 64-bit
                if self.xlen() == 32 {
                    let (c1, c2) = match instr.rtype_op() {
                        0x11 => ("(int64_t)(saddr_t)", "(int64_t)(saddr_t)"),
                        0x12 => ("(int64_t)(saddr_t)", "(uint64_t)"),
                        _ => ("(uint64_t)", "(uint64_t)"),
                    };
                    self.ac(format!(
                        "{} = (uint64_t)({}{} * {}{}) >> 32u;",
                        dst, c1, src1, c2, src2
                    ));
                } else {
                    self.ac(format!("MUL128(&{}, {}, {});", dst, src1, src2));
                }
            }
            0x14 => {
                // DIV: division by zero is not an exception
                if self.xlen() == 64 {
                    self.ac(format!("if (LIKELY({} != 0)) {{", src2));
                    self.ac(format!(
                        "\tif (LIKELY(!({} == -9223372036854775808ull && {} == -1ull)))",
                        src1, src2
                    ));
                    self.ac(format!("\t\t{} = (int64_t){} / (int64_t){};", dst, src1, src2));
                    self.ac("}");
                } else {
                    self.ac(format!("if (LIKELY({} != 0)) {{", src2));
                    self.ac(format!(
                        "\tif (LIKELY(!({} == 2147483648 && {} == 4294967295)))",
                        src1, src2
                    ));
                    self.ac(format!("\t\t{} = (int32_t){} / (int32_t){};", dst, src1, src2));
                    self.ac("}");
                }
            }
            0x15 => {
                self.ac(format!("if (LIKELY({} != 0))", src2));
                self.ac(format!("{} = {} / {};", dst, src1, src2));
            }
            0x16 => {
                if self.xlen() == 64 {
                    self.ac(format!("if (LIKELY({} != 0)) {{", src2));
                    self.ac(format!(
                        "\tif (LIKELY(!({} == -9223372036854775808ull && {} == -1ull)))",
                        src1, src2
                    ));
                    self.ac(format!("\t\t{} = (int64_t){} % (int64_t){};", dst, src1, src2));
                    self.ac("}");
                } else {
                    self.ac(format!("if (LIKELY({} != 0)) {{", src2));
                    self.ac(format!(
                        "\tif (LIKELY(!({} == 2147483648 && {} == 4294967295)))",
                        src1, src2
                    ));
                    self.ac(format!("\t\t{} = (int32_t){} % (int32_t){};", dst, src1, src2));
                    self.ac("}");
                }
            }
            0x17 => {
                self.ac(format!("if (LIKELY({} != 0))", src2));
                self.ac(format!("{} = {} % {};", dst, src1, src2));
            }
            0x44 => self.ac(format!("{} = (uint16_t){};", dst, src1)), // ZEXT.H
            0x51 => {
                // CLMUL
                self.ac("{ addr_t result = 0;");
                self.ac("for (unsigned i = 0; i < XLEN; i++)");
                self.ac(format!("  if (({} >> i) & 1)", src2));
                self.ac(format!("    result ^= ({} << i);", src1));
                self.ac(format!("{} = result; }}", dst));
            }
            0x52 => {
                // CLMULR
                self.ac("{ addr_t result = 0;");
                self.ac("for (unsigned i = 0; i < XLEN-1; i++)");
                self.ac(format!("  if (({} >> i) & 1)", src2));
                self.ac(format!("    result ^= ({} >> (XLEN - i - 1));", src1));
                self.ac(format!("{} = result; }}", dst));
            }
            0x53 => {
                // CLMULH
                self.ac("{ addr_t result = 0;");
                self.ac("for (unsigned i = 1; i < XLEN; i++)");
                self.ac(format!("  if (({} >> i) & 1)", src2));
                self.ac(format!("    result ^= ({} >> (XLEN - i));", src1));
                self.ac(format!("{} = result; }}", dst));
            }
            0x102 => self.ac(format!("{} = {} + ({} << 1);", dst, src2, src1)), // SH1ADD
            0x104 => self.ac(format!("{} = {} + ({} << 2);", dst, src2, src1)), // SH2ADD
            0x106 => self.ac(format!("{} = {} + ({} << 3);", dst, src2, src1)), // SH3ADD
            0x141 => self.ac(format!(
                "{} = {} | ((addr_t)1 << ({} & (XLEN-1)));",
                dst, src1, src2
            )), // BSET
            0x142 => self.ac(format!(
                "{} = {} & ~((addr_t)1 << ({} & (XLEN-1)));",
                dst, src1, src2
            )), // BCLR
            0x143 => self.ac(format!(
                "{} = {} ^ ((addr_t)1 << ({} & (XLEN-1)));",
                dst, src1, src2
            )), // BINV
            0x204 => self.ac(format!("{} = ~({} ^ {});", dst, src1, src2)), // XNOR
            0x206 => self.ac(format!("{} = ({} | ~{});", dst, src1, src2)), // ORN
            0x207 => self.ac(format!("{} = ({} & ~{});", dst, src1, src2)), // ANDN
            0x245 => self.ac(format!(
                "{} = ({} >> ({} & (XLEN-1))) & 1;",
                dst, src1, src2
            )), // BEXT
            0x54 => self.ac(format!(
                "{} = ((saddr_t){} < (saddr_t){})  ? {} : {};",
                dst, src1, src2, src1, src2
            )), // MIN
            0x55 => self.ac(format!(
                "{} = ({} < {})  ? {} : {};",
                dst, src1, src2, src1, src2
            )), // MINU
            0x56 => self.ac(format!(
                "{} = ((saddr_t){} > (saddr_t){})  ? {} : {};",
                dst, src1, src2, src1, src2
            )), // MAX
            0x57 => self.ac(format!(
                "{} = ({} > {})  ? {} : {};",
                dst, src1, src2, src1, src2
            )), // MAXU
            0x301 => {
                // ROL
                self.ac(format!("{{const unsigned shift = {} & (XLEN-1);", src2));
                self.ac(format!(
                    "{} = ({} << shift) | ({} >> (XLEN - shift)); }}",
                    dst, src1, src1
                ));
            }
            0x305 => {
                // ROR
                self.ac(format!("{{const unsigned shift = {} & (XLEN-1);", src2));
                self.ac(format!(
                    "{} = ({} >> shift) | ({} << (XLEN - shift)); }}",
                    dst, src1, src1
                ));
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_system(&mut self) {
        let instr = self.instr;
        if instr.funct3() == 0x0 {
            self.increment_counter_so_far();
            let imm = instr.i_imm_raw();
            if imm < 2 {
                // System calls and EBREAK
                let syscall_reg = if imm == 0 {
                    self.from_reg(isa::REG_ECALL)
                } else {
                    isa::SYSCALL_EBREAK.to_string()
                };
                let here = self.pcrel_str(0);
                self.ac(format!("cpu->pc = {};", here));
                if !self.tinfo.ignore_instruction_limit {
                    self.ac(format!(
                        "if (UNLIKELY(do_syscall(cpu, counter, max_counter, {}))) {{",
                        syscall_reg
                    ));
                    // Correct for the +4 expectation outside the translation
                    self.ac("  cpu->pc += 4; return (ReturnValues){counter, MAX_COUNTER(cpu)};}");
                    self.ac("counter = INS_COUNTER(cpu);");
                } else {
                    self.ac(format!(
                        "if (UNLIKELY(do_syscall(cpu, 0, max_counter, {}))) {{",
                        syscall_reg
                    ));
                    self.ac("  cpu->pc += 4; return (ReturnValues){0, MAX_COUNTER(cpu)};}");
                }
                self.ac("max_counter = MAX_COUNTER(cpu);");
            } else if imm == isa::SYSTEM_IMM_WFI || imm == 0x7FF {
                // WFI / STOP: zero the counter budget and exit to PC+4
                self.ac("max_counter = 0;");
                let next = self.pcrel_str(4);
                self.exit_function(&next, false);
                self.add_reentry_next();
            } else {
                // Zero funct3, unknown imm: don't exit
                let here = self.pcrel_str(0);
                self.ac(format!("cpu->pc = {};", here));
                self.ac(format!("api.system(cpu, {});", instr.0));
            }
        } else {
            // Non-zero funct3: CSR and other system functions
            let here = self.pcrel_str(0);
            self.ac(format!("cpu->pc = {};", here));
            if !self.tinfo.ignore_instruction_limit {
                self.ac("INS_COUNTER(cpu) = counter;");
            }
            self.ac("MAX_COUNTER(cpu) = max_counter;");
            self.ac(format!("api.system(cpu, {});", instr.0));
        }
    }

    fn emit_op_imm32(&mut self) {
        let instr = self.instr;
        if self.xlen() < 64 {
            self.unknown_instruction();
            return;
        }
        if instr.rd() == 0 {
            return;
        }
        let dst = self.to_reg(instr.rd());
        let src = format!("(uint32_t){}", self.from_reg(instr.rs1()));
        match instr.funct3() {
            0x0 => {
                // ADDIW
                let imm = self.from_imm(instr.i_imm());
                self.ac(format!("{} = {} ({} + {});", dst, SIGNEXTW, src, imm));
            }
            0x1 => {
                if instr.i_high_bits() == 0x000 {
                    let shamt = instr.shift_imm();
                    self.ac(format!("{} = {} ({} << {});", dst, SIGNEXTW, src, shamt));
                } else if instr.i_high_bits() == 0x080 {
                    // SLLI.UW
                    let shamt = instr.shift_imm();
                    self.ac(format!("{} = ((addr_t){} << {});", dst, src, shamt));
                } else {
                    match instr.i_imm_raw() {
                        0b011000000000 => {
                            self.ac(format!("{} = {} ? do_clz({}) : 32;", dst, src, src))
                        }
                        0b011000000001 => {
                            self.ac(format!("{} = {} ? do_ctz({}) : 32;", dst, src, src))
                        }
                        0b011000000010 => self.ac(format!("{} = do_cpop({});", dst, src)),
                        _ => self.unknown_instruction(),
                    }
                }
            }
            0x5 => {
                if instr.i_high_bits() == 0x0 {
                    // SRLIW
                    let shamt = instr.shift_imm();
                    self.ac(format!("{} = {} ({} >> {});", dst, SIGNEXTW, src, shamt));
                } else if instr.i_high_bits() == 0x400 {
                    // SRAIW preserves the sign bit
                    let shamt = instr.shift_imm();
                    self.ac(format!("{} = (int32_t){} >> {};", dst, src, shamt));
                } else if instr.i_high_bits() == 0x600 {
                    // RORIW
                    let shift = instr.i_imm_raw() & 31;
                    self.ac(format!("{{const unsigned shift = {};", shift));
                    self.ac(format!(
                        "{} = (int32_t)({} >> shift) | ({} << (32 - shift)); }}",
                        dst, src, src
                    ));
                } else {
                    self.unknown_instruction();
                }
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_op32(&mut self) {
        let instr = self.instr;
        if self.xlen() < 64 {
            self.unknown_instruction();
            return;
        }
        if instr.rd() == 0 {
            return;
        }
        let dst = self.to_reg(instr.rd());
        let src1 = format!("(uint32_t){}", self.from_reg(instr.rs1()));
        let src2 = format!("(uint32_t){}", self.from_reg(instr.rs2()));
        let r1 = self.from_reg(instr.rs1());
        let r2 = self.from_reg(instr.rs2());
        match instr.rtype_op() {
            0x0 => self.ac(format!("{} = {} ({} + {});", dst, SIGNEXTW, src1, src2)),
            0x200 => self.ac(format!("{} = {} ({} - {});", dst, SIGNEXTW, src1, src2)),
            0x1 => self.ac(format!("{} = {} ({} << ({} & 0x1F));", dst, SIGNEXTW, src1, src2)),
            0x5 => self.ac(format!("{} = {} ({} >> ({} & 0x1F));", dst, SIGNEXTW, src1, src2)),
            0x205 => self.ac(format!("{} = (int32_t){} >> ({} & 31);", dst, src1, src2)),
            // M-extension
            0x10 => self.ac(format!("{} = {}({} * {});", dst, SIGNEXTW, src1, src2)),
            0x14 => {
                self.ac(format!("if (LIKELY({} != 0))", src2));
                self.ac(format!(
                    "if (LIKELY(!((int32_t){} == -2147483648 && (int32_t){} == -1)))",
                    src1, src2
                ));
                self.ac(format!(
                    "{} = {} ((int32_t){} / (int32_t){});",
                    dst, SIGNEXTW, src1, src2
                ));
            }
            0x15 => {
                self.ac(format!("if (LIKELY({} != 0))", src2));
                self.ac(format!("{} = {} ({} / {});", dst, SIGNEXTW, src1, src2));
            }
            0x16 => {
                self.ac(format!("if (LIKELY({} != 0))", src2));
                self.ac(format!(
                    "if (LIKELY(!((int32_t){} == -2147483648 && (int32_t){} == -1)))",
                    src1, src2
                ));
                self.ac(format!(
                    "{} = {} ((int32_t){} % (int32_t){});",
                    dst, SIGNEXTW, src1, src2
                ));
            }
            0x17 => {
                self.ac(format!("if (LIKELY({} != 0))", src2));
                self.ac(format!("{} = {} ({} % {});", dst, SIGNEXTW, src1, src2));
            }
            0x40 => self.ac(format!("{} = {} + {};", dst, r2, src1)), // ADD.UW
            0x44 => self.ac(format!("{} = (uint16_t)({});", dst, src1)), // ZEXT.H
            0x102 => self.ac(format!("{} = {} + ((addr_t){} << 1);", dst, r2, src1)), // SH1ADD.UW
            0x104 => self.ac(format!("{} = {} + ((addr_t){} << 2);", dst, r2, src1)), // SH2ADD.UW
            0x106 => self.ac(format!("{} = {} + ((addr_t){} << 3);", dst, r2, src1)), // SH3ADD.UW
            0x301 => {
                // ROLW
                self.ac(format!("{{const unsigned shift = {} & 31;", r2));
                self.ac(format!(
                    "{} = (int32_t)({} << shift) | ({} >> (32 - shift)); }}",
                    dst, r1, r1
                ));
            }
            0x305 => {
                // RORW
                self.ac(format!("{{const unsigned shift = {} & 31;", r2));
                self.ac(format!(
                    "{} = (int32_t)({} >> shift) | ({} << (32 - shift)); }}",
                    dst, r1, r1
                ));
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_fp_load(&mut self) {
        let instr = self.instr;
        let (rd, rs1, imm) = (instr.rd(), instr.rs1(), instr.i_imm());
        match instr.funct3() {
            0x2 => {
                // FLW
                let dst = format!("{}.i32[0]", self.from_fpreg(rd));
                self.memory_load(dst, "uint32_t", false, 4, rs1, imm);
                if self.options.nanboxing {
                    let reg = self.from_fpreg(rd);
                    self.ac(format!("{}.i32[1] = 0;", reg));
                }
            }
            0x3 => {
                // FLD
                let dst = format!("{}.i64", self.from_fpreg(rd));
                self.memory_load(dst, "uint64_t", false, 8, rs1, imm);
            }
            0x6 if self.options.vector_lanes > 0 => {
                // VLE32
                let dst = self.from_rvvreg(rd);
                let size = self.options.vector_lanes * 4;
                self.memory_load(dst, "VectorLane", false, size, rs1, 0);
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_fp_store(&mut self) {
        let instr = self.instr;
        let (rs1, rs2, imm) = (instr.rs1(), instr.rs2(), instr.s_imm());
        match instr.funct3() {
            0x2 => {
                let value = format!("{}.i32[0]", self.from_fpreg(rs2));
                self.memory_store("int32_t", rs1, imm, value);
            }
            0x3 => {
                let value = format!("{}.i64", self.from_fpreg(rs2));
                self.memory_store("int64_t", rs1, imm, value);
            }
            0x6 if self.options.vector_lanes > 0 => {
                let value = self.from_rvvreg(rs2);
                self.memory_store("VectorLane", rs1, 0, value);
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_fp_fma(&mut self) {
        let instr = self.instr;
        let dst = self.from_fpreg(instr.rd());
        let rs1 = self.from_fpreg(instr.rs1());
        let rs2 = self.from_fpreg(instr.rs2());
        let rs3 = self.from_fpreg(instr.rs3());
        let sign = if instr.opcode() == isa::RV32F_FNMADD || instr.opcode() == isa::RV32F_FNMSUB {
            "-"
        } else {
            ""
        };
        let add = if instr.opcode() == isa::RV32F_FMSUB || instr.opcode() == isa::RV32F_FNMSUB {
            " - "
        } else {
            " + "
        };
        match instr.fp_funct2() {
            0x0 => self.ac(format!(
                "set_fl(&{}, {}({}.f32[0] * {}.f32[0]{}{}.f32[0]));",
                dst, sign, rs1, rs2, add, rs3
            )),
            0x1 => self.ac(format!(
                "set_dbl(&{}, {}({}.f64 * {}.f64{}{}.f64));",
                dst, sign, rs1, rs2, add, rs3
            )),
            _ => self.unknown_instruction(),
        }
    }

    fn emit_fp_func(&mut self) {
        let instr = self.instr;
        let funct2 = instr.fp_funct2();
        if funct2 >= 0x2 {
            self.unknown_instruction();
            return;
        }
        let dst = self.from_fpreg(instr.rd());
        let rs1 = self.from_fpreg(instr.rs1());
        let rs2 = self.from_fpreg(instr.rs2());
        let is_dbl = funct2 == 0x1;
        match instr.fpfunc() {
            isa::RV32F_FEQ_LT_LE => {
                if instr.rd() == 0 {
                    self.unknown_instruction();
                    return;
                }
                let ird = self.to_reg(instr.rd());
                let field = if is_dbl { ".f64" } else { ".f32[0]" };
                match instr.funct3() {
                    0x0 => self.ac(format!("{} = ({}{} <= {}{}) ? 1 : 0;", ird, rs1, field, rs2, field)),
                    0x1 => self.ac(format!("{} = ({}{} < {}{}) ? 1 : 0;", ird, rs1, field, rs2, field)),
                    0x2 => self.ac(format!("{} = ({}{} == {}{}) ? 1 : 0;", ird, rs1, field, rs2, field)),
                    _ => self.unknown_instruction(),
                }
            }
            isa::RV32F_FMIN_MAX => match (instr.funct3(), is_dbl) {
                (0x0, false) => self.ac(format!(
                    "set_fl(&{}, fminf({}.f32[0], {}.f32[0]));",
                    dst, rs1, rs2
                )),
                (0x1, false) => self.ac(format!(
                    "set_fl(&{}, fmaxf({}.f32[0], {}.f32[0]));",
                    dst, rs1, rs2
                )),
                (0x0, true) => self.ac(format!("set_dbl(&{}, fmin({}.f64, {}.f64));", dst, rs1, rs2)),
                (0x1, true) => self.ac(format!("set_dbl(&{}, fmax({}.f64, {}.f64));", dst, rs1, rs2)),
                _ => self.unknown_instruction(),
            },
            isa::RV32F_FADD | isa::RV32F_FSUB | isa::RV32F_FMUL | isa::RV32F_FDIV => {
                let fop = match instr.fpfunc() {
                    isa::RV32F_FSUB => " - ",
                    isa::RV32F_FMUL => " * ",
                    isa::RV32F_FDIV => " / ",
                    _ => " + ",
                };
                if !is_dbl {
                    self.ac(format!(
                        "set_fl(&{}, {}.f32[0]{}{}.f32[0]);",
                        dst, rs1, fop, rs2
                    ));
                } else {
                    self.ac(format!("set_dbl(&{}, {}.f64{}{}.f64);", dst, rs1, fop, rs2));
                }
            }
            isa::RV32F_FSQRT => {
                if !is_dbl {
                    self.ac(format!("set_fl(&{}, api.sqrtf32({}.f32[0]));", dst, rs1));
                } else {
                    self.ac(format!("set_dbl(&{}, api.sqrtf64({}.f64));", dst, rs1));
                }
            }
            isa::RV32F_FSGNJ_NX => match instr.funct3() {
                0x0 => {
                    // FSGNJ doubles as FMV rd, rs1
                    if instr.rs1() == instr.rs2() {
                        self.ac(format!("{}.i64 = {}.i64;", dst, rs1));
                    } else if !is_dbl {
                        self.ac(format!(
                            "load_fl(&{}, ({}.lsign.sign << 31) | {}.lsign.bits);",
                            dst, rs2, rs1
                        ));
                    } else {
                        self.ac(format!(
                            "load_dbl(&{}, ((uint64_t){}.usign.sign << 63) | {}.usign.bits);",
                            dst, rs2, rs1
                        ));
                    }
                }
                0x1 => {
                    if !is_dbl {
                        self.ac(format!(
                            "load_fl(&{}, (~{}.lsign.sign << 31) | {}.lsign.bits);",
                            dst, rs2, rs1
                        ));
                    } else {
                        self.ac(format!(
                            "load_dbl(&{}, (~(uint64_t){}.usign.sign << 63) | {}.usign.bits);",
                            dst, rs2, rs1
                        ));
                    }
                }
                0x2 => {
                    if !is_dbl {
                        self.ac(format!(
                            "load_fl(&{}, (({}.lsign.sign ^ {}.lsign.sign) << 31) | {}.lsign.bits);",
                            dst, rs1, rs2, rs1
                        ));
                    } else {
                        self.ac(format!(
                            "load_dbl(&{}, ((uint64_t)({}.usign.sign ^ {}.usign.sign) << 63) | {}.usign.bits);",
                            dst, rs1, rs2, rs1
                        ));
                    }
                }
                _ => self.unknown_instruction(),
            },
            isa::RV32F_FCVT_SD_DS => {
                if funct2 == 0x0 {
                    self.ac(format!("set_fl(&{}, {}.f64);", dst, rs1));
                } else {
                    self.ac(format!("set_dbl(&{}, {}.f32[0]);", dst, rs1));
                }
            }
            isa::RV32F_FCVT_SD_W => {
                let sign = if instr.rs2() == 0 { "(saddr_t)" } else { "" };
                let src = self.from_reg(instr.rs1());
                if funct2 == 0x0 {
                    self.ac(format!("set_fl(&{}, {}{});", dst, sign, src));
                } else {
                    self.ac(format!("set_dbl(&{}, {}{});", dst, sign, src));
                }
            }
            isa::RV32F_FCVT_W_SD => {
                let sign = if instr.rs2() == 0 { "(int32_t)" } else { "(uint32_t)" };
                if instr.rd() != 0 {
                    let ird = self.to_reg(instr.rd());
                    if funct2 == 0x0 {
                        self.ac(format!("{} = {}{}.f32[0];", ird, sign, rs1));
                    } else {
                        self.ac(format!("{} = {}{}.f64;", ird, sign, rs1));
                    }
                } else {
                    self.unknown_instruction();
                }
            }
            isa::RV32F_FMV_W_X => {
                let src = self.from_reg(instr.rs1());
                if funct2 == 0x0 {
                    self.ac(format!("load_fl(&{}, {});", dst, src));
                } else if self.xlen() == 64 && funct2 == 0x1 {
                    self.ac(format!("load_dbl(&{}, {});", dst, src));
                } else {
                    self.unknown_instruction();
                }
            }
            isa::RV32F_FMV_X_W => {
                if instr.funct3() == 0x0 {
                    if instr.rd() != 0 && funct2 == 0x0 {
                        let ird = self.to_reg(instr.rd());
                        self.ac(format!("{} = {}.i32[0];", ird, rs1));
                    } else if self.xlen() == 64 && instr.rd() != 0 && funct2 == 0x1 {
                        let ird = self.to_reg(instr.rd());
                        self.ac(format!("{} = {}.i64;", ird, rs1));
                    } else {
                        self.unknown_instruction();
                    }
                } else {
                    // FCLASS etc.
                    self.unknown_instruction();
                }
            }
            _ => self.unknown_instruction(),
        }
    }

    fn emit_vector(&mut self) {
        let lanes = self.options.vector_lanes;
        if lanes == 0 {
            self.unknown_instruction();
            return;
        }
        let instr = self.instr;
        let vd = instr.rd();
        let vs1 = instr.rs1();
        let vs2 = instr.rs2();
        let funct6 = instr.funct7() >> 1;
        match instr.funct3() {
            0x1 => match funct6 {
                // OPF.VV
                0b000000 => {
                    for i in 0..lanes {
                        let f32 = format!(".f32[{}]", i);
                        self.ac(format!(
                            "{}{} = {}{} + {}{};",
                            self.from_rvvreg(vd), f32, self.from_rvvreg(vs1), f32, self.from_rvvreg(vs2), f32
                        ));
                    }
                }
                0b100100 => {
                    for i in 0..lanes {
                        let f32 = format!(".f32[{}]", i);
                        self.ac(format!(
                            "{}{} = {}{} * {}{};",
                            self.from_rvvreg(vd), f32, self.from_rvvreg(vs1), f32, self.from_rvvreg(vs2), f32
                        ));
                    }
                }
                _ => self.unknown_instruction(),
            },
            0x5 => {
                // OPF.VF
                let scalar = format!("scalar_{:x}", self.pc);
                match funct6 {
                    0b000000 => {
                        self.ac(format!(
                            "{{ const float {} = {}.f32[0];",
                            scalar, self.from_fpreg(vs1)
                        ));
                        for i in 0..lanes {
                            let f32 = format!(".f32[{}]", i);
                            self.ac(format!(
                                "{}{} = {}{} + {};",
                                self.from_rvvreg(vd), f32, self.from_rvvreg(vs2), f32, scalar
                            ));
                        }
                        self.ac("}");
                    }
                    0b100100 => {
                        self.ac(format!(
                            "{{ const float {} = {}.f32[0];",
                            scalar, self.from_fpreg(vs1)
                        ));
                        for i in 0..lanes {
                            let f32 = format!(".f32[{}]", i);
                            self.ac(format!(
                                "{}{} = {}{} * {};",
                                self.from_rvvreg(vd), f32, self.from_rvvreg(vs2), f32, scalar
                            ));
                        }
                        self.ac("}");
                    }
                    _ => self.unknown_instruction(),
                }
            }
            _ => self.unknown_instruction(),
        }
    }
}

/// Emit one block into `code`, returning its (address, symbol) mappings.
pub fn emit_block(
    code: &mut String,
    tinfo: &BlockInfo,
    blocks: &[BlockInfo],
    global_jump_locations: &HashSet<u64>,
    options: &MachineOptions,
) -> Vec<TransMapping> {
    let mut e = Emitter::new(options, tinfo, blocks, global_jump_locations);
    e.emit();

    // Forward declarations for directly-called sibling blocks
    for entry in &e.forward_declared {
        code.push_str(&format!(
            "static ReturnValues {}(CPU*, uint64_t, uint64_t, addr_t);\n",
            entry
        ));
    }

    // Function header
    code.push_str(&format!(
        "static ReturnValues {}(CPU* cpu, uint64_t counter, uint64_t max_counter, addr_t pc) {{\n",
        e.func
    ));

    // Extra function entries dispatch on the requested PC
    if e.mappings.len() > 1 {
        code.push_str("switch (pc) {\n");
        for mapping in &e.mappings {
            let label = funclabel(&e.func, mapping.addr);
            code.push_str(&format!("case {}: goto {};\n", mapping.addr, label));
        }
        code.push_str("default: api.exception(cpu, pc, MISALIGNED_INSTRUCTION); return (ReturnValues){0, 0};\n");
        code.push_str("}\n");
    }

    code.push_str(&e.code);
    e.mappings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::scan_blocks;
    use crate::segment::Segment;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn emit_segment(code_words: &[u32], vaddr: u64, options: &MachineOptions) -> String {
        let seg = Segment::create(options, &words_to_bytes(code_words), vaddr).unwrap();
        let scan = scan_blocks(&seg, options);
        let mut code = String::new();
        for block in &scan.blocks {
            emit_block(
                &mut code,
                block,
                &scan.blocks,
                &scan.global_jump_locations,
                options,
            );
        }
        code
    }

    #[test]
    fn ecall_block_calls_do_syscall_and_returns() {
        let opts = MachineOptions::default();
        let code = emit_segment(&[0x0000_0073], 0x1000, &opts);
        assert!(code.contains("static ReturnValues f_1000"));
        assert!(code.contains("do_syscall(cpu, counter, max_counter, cpu->r[17])"));
        assert!(code.contains("counter = INS_COUNTER(cpu);"));
        assert!(code.contains("max_counter = MAX_COUNTER(cpu);"));
    }

    #[test]
    fn tight_loop_gets_counter_guarded_backward_goto() {
        // addi a0, a0, -1; bnez a0, .-4
        let opts = MachineOptions::default();
        let code = emit_segment(&[0xFFF5_0513, 0xFE05_1EE3], 0x2000, &opts);
        assert!(code.contains("f_2000_2000:;"));
        assert!(code.contains("if (LIKELY(counter < max_counter)) goto f_2000_2000;"));
        // The loop body updates a0 in place
        assert!(code.contains("cpu->r[10] += -1;"));
    }

    #[test]
    fn forward_jal_becomes_a_direct_call() {
        let opts = MachineOptions::default();
        // Two hand-made blocks: the JAL block and its target block
        let block_a = BlockInfo {
            instructions: vec![InstrWord(0x0000_10EF), InstrWord(0x0000_8067)],
            block: 0x1000,
            block_end: 0x1008,
            segment_begin: 0x1000,
            segment_end: 0x3000,
            gp: 0,
            trace_instructions: false,
            ignore_instruction_limit: false,
            shared_segments: true,
            jump_locations: HashSet::new(),
            arena_ptr: 0,
        };
        let block_b = BlockInfo {
            instructions: vec![InstrWord(0x0000_8067)],
            block: 0x2000,
            block_end: 0x2004,
            segment_begin: 0x1000,
            segment_end: 0x3000,
            gp: 0,
            trace_instructions: false,
            ignore_instruction_limit: false,
            shared_segments: true,
            jump_locations: HashSet::new(),
            arena_ptr: 0,
        };
        let blocks = vec![block_a, block_b];
        let mut global = HashSet::new();
        global.insert(0x2000u64);

        let mut code = String::new();
        let mappings = emit_block(&mut code, &blocks[0], &blocks, &global, &opts);

        // jal ra, 0x2000 from 0x1000: direct forward call with counters
        assert!(code.contains("static ReturnValues f_2000(CPU*, uint64_t, uint64_t, addr_t);"));
        assert!(code.contains("rv = f_2000(cpu, counter, max_counter, 8192UL);"));
        assert!(code.contains("counter = rv.counter;"));
        assert!(code.contains("max_counter = rv.max_counter;"));
        // The call site re-enters at the following instruction
        assert!(code.contains("cpu->pc == 4100UL"));
        assert!(mappings.iter().any(|m| m.addr == 0x1004));
    }

    #[test]
    fn misaligned_branch_target_raises_immediately() {
        // beq x0, x0, +2 (misaligned without the C extension)
        let opts = MachineOptions::default();
        let code = emit_segment(&[0x0000_0163, 0x0000_8067], 0x1000, &opts);
        assert!(code.contains("MISALIGNED_INSTRUCTION"));
        assert!(!code.contains("goto f_1000_1002"));
    }

    #[test]
    fn loads_to_x0_keep_fault_semantics() {
        // lw x0, 0(a0)
        let mut opts = MachineOptions::default();
        opts.memory_arena_size = 0x10000;
        let code = emit_segment(&[0x0005_2003, 0x0000_8067], 0x1000, &opts);
        assert!(code.contains("volatile uint8_t"));
        assert!(code.contains("(void)tmp_1000;"));
    }

    #[test]
    fn known_gp_loads_use_fixed_arena_offsets() {
        // lw a0, 0(gp) with a known GP inside the arena
        let mut opts = MachineOptions::default();
        opts.memory_arena_size = 0x20000;
        let seg = Segment::create(&opts, &words_to_bytes(&[0x0001_A503, 0x0000_8067]), 0x1000)
            .unwrap();
        let scan = scan_blocks(&seg, &opts);
        let mut block = scan.blocks[0].clone();
        block.gp = 0x11000;

        let mut code = String::new();
        emit_block(&mut code, &block, &scan.blocks, &scan.global_jump_locations, &opts);
        assert!(code.contains("*(int32_t*)ARENA_AT(cpu, SPECSAFE(69632))"));
        assert!(!code.contains("api.mem_ld"));
    }

    #[test]
    fn stores_check_writability_with_runtime_fallback() {
        // sw a1, 8(a0)
        let mut opts = MachineOptions::default();
        opts.memory_arena_size = 0x10000;
        let code = emit_segment(&[0x00B5_2423, 0x0000_8067], 0x1000, &opts);
        assert!(code.contains("ARENA_WRITABLE(cpu->r[10] + 8)"));
        assert!(code.contains("api.mem_st(cpu, cpu->r[10] + 8, cpu->r[11], sizeof(int32_t));"));
    }

    #[test]
    fn wfi_zeroes_the_counter_budget() {
        let opts = MachineOptions::default();
        let code = emit_segment(&[0x1050_0073, 0x0000_8067], 0x1000, &opts);
        assert!(code.contains("max_counter = 0;"));
        assert!(code.contains("cpu->pc = 4100UL;"));
    }

    #[test]
    fn counter_accumulates_and_flushes_at_boundaries() {
        // Three ALU instructions then a branch: one flush of +4
        let opts = MachineOptions::default();
        let code = emit_segment(
            &[0x0010_0093, 0x0020_0113, 0x0030_0193, 0x0000_0463, 0x0000_8067],
            0x1000,
            &opts,
        );
        assert!(code.contains("counter += 4;"));

        // With the limit ignored, no counter updates are emitted at all
        let mut opts = MachineOptions::default();
        opts.translate_ignore_instruction_limit = true;
        let code = emit_segment(
            &[0x0010_0093, 0x0020_0113, 0x0030_0193, 0x0000_0463, 0x0000_8067],
            0x1000,
            &opts,
        );
        assert!(!code.contains("counter +="));
        assert!(code.contains("return (ReturnValues){0, max_counter};"));
    }

    #[test]
    fn compressed_instructions_are_expanded_before_emission() {
        let mut opts = MachineOptions::default();
        opts.compressed = true;
        let seg_code: Vec<u8> = [0x0505u16, 0x8082u16]
            .iter()
            .flat_map(|h| h.to_le_bytes())
            .collect();
        let seg = Segment::create(&opts, &seg_code, 0x1000).unwrap();
        let scan = scan_blocks(&seg, &opts);
        let mut code = String::new();
        for block in &scan.blocks {
            emit_block(&mut code, block, &scan.blocks, &scan.global_jump_locations, &opts);
        }
        // c.addi a0, 1 expands to a full addi; c.ret becomes JUMP_TO via ra
        assert!(code.contains("cpu->r[10] += 1;"));
        assert!(code.contains("JUMP_TO(cpu, cpu->r[1] + 0);"));
    }

    #[test]
    fn runtime_prelude_declares_the_full_abi() {
        assert!(BINTR_RUNTIME.contains("VISIBLE void init(const struct CallbackTable* table"));
        assert!(BINTR_RUNTIME.contains("ReturnValues"));
        assert!(BINTR_RUNTIME.contains("ARENA_READABLE"));
        assert!(BINTR_RUNTIME.contains("do_syscall"));
        assert!(BINTR_RUNTIME.contains("JUMP_TO"));
    }

    #[test]
    fn trace_mode_emits_per_instruction_hooks() {
        let mut opts = MachineOptions::default();
        opts.translate_trace = true;
        let code = emit_segment(&[0x0010_0093, 0x0000_8067], 0x1000, &opts);
        assert!(code.contains("api.trace(cpu, \"f_1000\", 4096UL,"));
    }
}
