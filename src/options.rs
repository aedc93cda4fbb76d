// options.rs - Machine and translation options
//
// A plain struct with defaults; the CLI maps clap arguments onto it. Every
// field that changes generated code is reflected in the translation defines
// and therefore in the translation hash.

use std::sync::Arc;

/// Guest register width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    /// Width in bytes (the `W` constant of the translation ABI)
    pub fn w(self) -> u32 {
        match self {
            Xlen::Rv32 => 4,
            Xlen::Rv64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        self.w() * 8
    }
}

/// Additional output artifacts the translation driver can be asked for
#[derive(Debug, Clone)]
pub enum CrossCompileOutput {
    /// A Windows PE-dll produced by a MinGW cross toolchain
    Mingw { prefix: String, suffix: String },
    /// Self-registering C source suitable for static embedding
    EmbeddableCode { prefix: String, suffix: String },
}

/// A packaged compilation step handed to the background callback
pub type CompileStep = Box<dyn FnOnce() + Send>;
/// User-supplied deferral hook; when present the CPU keeps interpreting
/// while compilation runs, and activation live-patches the running segment.
pub type BackgroundCallback = Arc<dyn Fn(CompileStep) + Send + Sync>;

#[derive(Clone)]
pub struct MachineOptions {
    pub xlen: Xlen,
    /// C extension: decoder-cache stride 2 instead of 4
    pub compressed: bool,
    pub atomics: bool,
    /// V extension lane count; 0 disables vector emission
    pub vector_lanes: u32,
    pub nanboxing: bool,
    /// Non-zero selects the masked N-bit encompassing arena addressing mode
    pub encompassing_arena_bits: u32,
    /// Enable the decode-time instruction rewriter
    pub decoder_rewriter: bool,

    /// ELF entry point, seeded into the global jump set when in range
    pub start_address: u64,
    /// Flat memory arena size (`RISCV_ARENA_END`); 0 disables the fast path
    pub memory_arena_size: u64,
    /// End of the initial read-only data range (`RISCV_ARENA_ROEND`)
    pub initial_rodata_end: u64,
    pub translation_use_arena: bool,
    pub use_shared_execute_segments: bool,

    pub translate_enabled: bool,
    pub translate_enable_embedded: bool,
    pub translate_invoke_compiler: bool,
    /// In-process JIT (libtcc-style) instead of a shared-object compiler
    pub translate_jit: bool,
    pub translate_blocks_max: usize,
    pub translate_instr_max: usize,
    pub translate_trace: bool,
    pub translate_ignore_instruction_limit: bool,
    /// Keep the compiled shared object on disk after loading
    pub translation_cache: bool,
    pub translation_prefix: String,
    pub translation_suffix: String,
    pub cross_compile: Vec<CrossCompileOutput>,
    pub translate_background_callback: Option<BackgroundCallback>,

    pub verbose_loader: bool,
}

impl MachineOptions {
    /// Bit-exact translation filename: prefix, eight upper-case hex digits,
    /// suffix, no separators.
    pub fn translation_filename(prefix: &str, hash: u32, suffix: &str) -> String {
        format!("{}{:08X}{}", prefix, hash, suffix)
    }

    /// Decoder-cache stride for this configuration
    pub fn stride(&self) -> u64 {
        if self.compressed {
            2
        } else {
            4
        }
    }

    /// Branch/jump target alignment mask
    pub fn align_mask(&self) -> u64 {
        if self.compressed {
            0x1
        } else {
            0x3
        }
    }
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            xlen: Xlen::Rv64,
            compressed: false,
            atomics: true,
            vector_lanes: 0,
            nanboxing: true,
            encompassing_arena_bits: 0,
            decoder_rewriter: true,
            start_address: 0,
            memory_arena_size: 0,
            initial_rodata_end: 0,
            translation_use_arena: true,
            use_shared_execute_segments: true,
            translate_enabled: true,
            translate_enable_embedded: true,
            translate_invoke_compiler: true,
            translate_jit: false,
            translate_blocks_max: 5000,
            translate_instr_max: 150_000,
            translate_trace: false,
            translate_ignore_instruction_limit: false,
            translation_cache: true,
            translation_prefix: "/tmp/rvbintr-".into(),
            translation_suffix: ".so".into(),
            cross_compile: Vec::new(),
            translate_background_callback: None,
            verbose_loader: false,
        }
    }
}

impl std::fmt::Debug for MachineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineOptions")
            .field("xlen", &self.xlen)
            .field("compressed", &self.compressed)
            .field("translate_enabled", &self.translate_enabled)
            .field("translate_blocks_max", &self.translate_blocks_max)
            .field("translate_instr_max", &self.translate_instr_max)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_filename_is_bit_exact() {
        assert_eq!(
            MachineOptions::translation_filename("/tmp/rvbintr-", 0xDEADBEEF, ".so"),
            "/tmp/rvbintr-DEADBEEF.so"
        );
        assert_eq!(
            MachineOptions::translation_filename("", 0x1, ""),
            "00000001"
        );
    }

    #[test]
    fn stride_follows_compressed_extension() {
        let mut opts = MachineOptions::default();
        assert_eq!(opts.stride(), 4);
        assert_eq!(opts.align_mask(), 3);
        opts.compressed = true;
        assert_eq!(opts.stride(), 2);
        assert_eq!(opts.align_mask(), 1);
    }
}
