// api.rs - The interface between translated native code and the host
//
// `CallbackTable` is the sole surface generated code may call back through.
// Runtime faults never unwind across a translated frame: every callback
// parks the failure on the CPU and requests a stop, and the dispatch loop
// rethrows once it regains control.
//
// The native C compiler and the platform dynamic loader are external
// collaborators; the driver consumes them through the traits at the bottom.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::path::Path;

use crate::cpu::{Cpu, ReturnValues};
use crate::decode;
use crate::error::exception;
use crate::isa::InstrWord;

/// Size of the host syscall table (`RISCV_MAX_SYSCALLS`)
pub const MAX_SYSCALLS: u32 = 600;

/// Entry point of one translated block:
/// `(cpu, counter, max_counter, pc) -> {counter, max_counter}`
pub type BlockFn = extern "C" fn(&mut Cpu, u64, u64, u64) -> ReturnValues;

/// One (guest address, block function index) pair exported by a translation
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub addr: u64,
    pub mapping_index: u32,
}

/// Syscall handler slot in the host syscall table
pub type SyscallFn = extern "C" fn(&mut Cpu);

/// Callback table handed to a translation's `init` function
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CallbackTable {
    pub mem_read: extern "C" fn(&mut Cpu, u64, u32) -> u64,
    pub mem_write: extern "C" fn(&mut Cpu, u64, u64, u32),
    pub vec_load: extern "C" fn(&mut Cpu, i32, u64),
    pub vec_store: extern "C" fn(&mut Cpu, u64, i32),
    pub syscalls: *const SyscallFn,
    pub syscall: extern "C" fn(&mut Cpu, i32) -> i32,
    pub unknown_syscall: extern "C" fn(&mut Cpu, u64),
    pub system: extern "C" fn(&mut Cpu, u32),
    pub execute: extern "C" fn(&mut Cpu, u32) -> u32,
    pub execute_handler: extern "C" fn(&mut Cpu, u32, u32) -> u32,
    pub handlers: *const decode::Handler,
    pub exception: extern "C" fn(&mut Cpu, u64, i32),
    pub trace: extern "C" fn(&mut Cpu, *const c_char, u64, u32),
    pub sqrtf32: extern "C" fn(f32) -> f32,
    pub sqrtf64: extern "C" fn(f64) -> f64,
    pub clz: extern "C" fn(u32) -> i32,
    pub clzl: extern "C" fn(u64) -> i32,
    pub ctz: extern "C" fn(u32) -> i32,
    pub ctzl: extern "C" fn(u64) -> i32,
    pub cpop: extern "C" fn(u32) -> i32,
    pub cpopl: extern "C" fn(u64) -> i32,
}

// The table contains only function pointers and pointers to process-static
// tables, all valid for the life of the process.
unsafe impl Send for CallbackTable {}
unsafe impl Sync for CallbackTable {}

extern "C" fn cb_mem_read(cpu: &mut Cpu, addr: u64, size: u32) -> u64 {
    match size {
        1 | 2 | 4 | 8 => cpu.arena_read(addr, size),
        _ => {
            cpu.set_pending_exception(cpu.pc, exception::ILLEGAL_OPERATION);
            0
        }
    }
}

extern "C" fn cb_mem_write(cpu: &mut Cpu, addr: u64, value: u64, size: u32) {
    match size {
        1 | 2 | 4 | 8 => cpu.arena_write(addr, value, size),
        _ => cpu.set_pending_exception(cpu.pc, exception::ILLEGAL_OPERATION),
    }
}

// The vector register file belongs to the interpreter; these exist so
// vector-enabled translations link against a complete table.
extern "C" fn cb_vec_load(cpu: &mut Cpu, _vd: i32, _addr: u64) {
    let _ = cpu;
}

extern "C" fn cb_vec_store(cpu: &mut Cpu, _addr: u64, _vd: i32) {
    let _ = cpu;
}

extern "C" fn cb_syscall(cpu: &mut Cpu, sysno: i32) -> i32 {
    // Routed to the external syscall layer; without one installed the call
    // is unknown by definition.
    cb_unknown_syscall(cpu, sysno as u64);
    i32::from(cpu.stopped())
}

extern "C" fn cb_unknown_syscall(cpu: &mut Cpu, sysno: u64) {
    log::warn!("unhandled system call {} at pc 0x{:x}", sysno, cpu.pc);
}

extern "C" fn cb_system(cpu: &mut Cpu, instr: u32) {
    // CSR and other SYSTEM functions stay with the interpreter
    let _ = (cpu, instr);
}

extern "C" fn cb_execute(cpu: &mut Cpu, instr: u32) -> u32 {
    let decoded = decode::decode(InstrWord(instr), 64);
    (decoded.handler)(cpu, instr);
    decode::handler_index_for(decoded.handler).unwrap_or_else(|_| {
        cpu.set_pending_exception(cpu.pc, exception::MAX_INSTRUCTIONS_REACHED);
        0
    }) as u32
}

extern "C" fn cb_execute_handler(cpu: &mut Cpu, index: u32, instr: u32) -> u32 {
    decode::handler_at(index as u8)(cpu, instr);
    u32::from(cpu.stopped())
}

extern "C" fn cb_exception(cpu: &mut Cpu, pc: u64, kind: i32) {
    cpu.set_pending_exception(pc, kind);
}

extern "C" fn cb_trace(_cpu: &mut Cpu, func: *const c_char, pc: u64, instr: u32) {
    let name = if func.is_null() {
        "?"
    } else {
        unsafe { CStr::from_ptr(func) }.to_str().unwrap_or("?")
    };
    log::trace!("f {} pc 0x{:x} instr {:08x}", name, pc, instr);
}

extern "C" fn cb_sqrtf32(f: f32) -> f32 {
    f.sqrt()
}
extern "C" fn cb_sqrtf64(d: f64) -> f64 {
    d.sqrt()
}
extern "C" fn cb_clz(x: u32) -> i32 {
    x.leading_zeros() as i32
}
extern "C" fn cb_clzl(x: u64) -> i32 {
    x.leading_zeros() as i32
}
extern "C" fn cb_ctz(x: u32) -> i32 {
    x.trailing_zeros() as i32
}
extern "C" fn cb_ctzl(x: u64) -> i32 {
    x.trailing_zeros() as i32
}
extern "C" fn cb_cpop(x: u32) -> i32 {
    x.count_ones() as i32
}
extern "C" fn cb_cpopl(x: u64) -> i32 {
    x.count_ones() as i32
}

/// Build the callback table for a segment about to be activated.
pub fn create_callback_table() -> CallbackTable {
    CallbackTable {
        mem_read: cb_mem_read,
        mem_write: cb_mem_write,
        vec_load: cb_vec_load,
        vec_store: cb_vec_store,
        syscalls: std::ptr::null(),
        syscall: cb_syscall,
        unknown_syscall: cb_unknown_syscall,
        system: cb_system,
        execute: cb_execute,
        execute_handler: cb_execute_handler,
        handlers: decode::handler_table_ptr(),
        exception: cb_exception,
        trace: cb_trace,
        sqrtf32: cb_sqrtf32,
        sqrtf64: cb_sqrtf64,
        clz: cb_clz,
        clzl: cb_clzl,
        ctz: cb_ctz,
        ctzl: cb_ctzl,
        cpop: cb_cpop,
        cpopl: cb_cpopl,
    }
}

/// A loaded translation: a shared object opened by the platform loader, a
/// JIT-compiled in-process module, or a statically embedded translation.
pub trait TranslationModule: Send + Sync {
    /// Call the translation's `init` with the callback table and arena.
    /// Returns false when the module exports no init function.
    fn init(&self, api: &CallbackTable, arena: *mut u8) -> bool;
    /// The exported `mappings` array (`no_mappings` entries)
    fn mappings(&self) -> &[Mapping];
    /// The exported `unique_mappings` array (`no_handlers` entries)
    fn handlers(&self) -> &[BlockFn];
}

/// Platform dynamic loader (dlopen) abstraction. Not reentrant on all
/// platforms; the driver serializes calls behind a process-wide mutex.
pub trait DylibLoader: Send + Sync {
    fn open(&self, path: &Path) -> Option<Box<dyn TranslationModule>>;
}

/// External C compiler driver. `compile` produces and loads a shared
/// object; `compile_jit` compiles in-process (libtcc-style, serialized by
/// the driver because the JIT keeps global state).
pub trait CompilerBackend: Send + Sync {
    fn compile(&self, source: &str, w: u32, cflags: &str, output: &Path)
        -> Option<Box<dyn TranslationModule>>;

    fn compile_jit(&self, source: &str, w: u32, cflags: &str) -> Option<Box<dyn TranslationModule>> {
        let _ = (source, w, cflags);
        None
    }

    /// Produce a cross-compiled artifact (e.g. a MinGW PE-dll)
    fn cross_compile(&self, source: &str, w: u32, cflags: &str, output: &Path) -> bool {
        let _ = (source, w, cflags, output);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_intrinsics_match_host_semantics() {
        assert_eq!(cb_clz(0), 32);
        assert_eq!(cb_clz(1), 31);
        assert_eq!(cb_clzl(1), 63);
        assert_eq!(cb_ctz(8), 3);
        assert_eq!(cb_cpopl(u64::MAX), 64);
        assert_eq!(cb_sqrtf64(9.0), 3.0);
    }

    #[test]
    fn memory_callbacks_park_faults_on_the_cpu() {
        let mut mem = vec![0u8; 32];
        let mut cpu = Cpu::with_arena(&mut mem);
        cb_mem_write(&mut cpu, 0, 0x1122_3344_5566_7788, 8);
        assert_eq!(cb_mem_read(&mut cpu, 0, 8), 0x1122_3344_5566_7788);

        // Invalid size parks an exception instead of unwinding
        cb_mem_read(&mut cpu, 0, 3);
        assert!(cpu.stopped());
        assert!(cpu.take_pending_exception().is_some());
    }

    #[test]
    fn exception_callback_sets_pc_and_stops() {
        let mut cpu = Cpu::new();
        cb_exception(&mut cpu, 0x1234, exception::MISALIGNED_INSTRUCTION);
        assert_eq!(cpu.pc, 0x1234);
        assert!(cpu.stopped());
        let pending = cpu.take_pending_exception().unwrap();
        assert_eq!(pending.kind, exception::MISALIGNED_INSTRUCTION);
    }
}
