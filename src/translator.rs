// translator.rs - Translation driver
//
// Names a translation by hashing the segment bytes and the stringified
// compiler defines, then resolves it in order: statically embedded
// translations, an on-disk shared object, the in-process JIT, and finally a
// fresh compile. Activation binds the resulting block functions into the
// decoder cache, either directly (segment creation time) or by atomically
// live-patching a running segment.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::api::{
    create_callback_table, BlockFn, CallbackTable, CompilerBackend, DylibLoader, Mapping,
    TranslationModule, MAX_SYSCALLS,
};
use crate::blocks::scan_blocks;
use crate::cpu::{Cpu, ReturnValues};
use crate::decode::bytecode;
use crate::emit::{emit_block, TransMapping, BINTR_RUNTIME};
use crate::error::{exception, MachineError, Result};
use crate::options::{CrossCompileOutput, MachineOptions, Xlen};
use crate::segment::Segment;
use crate::util::crc32c_partial;

/// Largest accepted `no_mappings` in a loaded translation
const MAX_MAPPINGS: usize = 500_000;

/// Upper bound on statically embedded translations
pub const MAX_EMBEDDED: usize = 12;

// The platform loader is not reentrant everywhere; serialize dlopen.
static DLOPEN_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));
// The in-process JIT keeps global state; serialize compilation.
static LIBTCC_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// A translation statically linked into the host binary, registered by a
/// constructor before any CPU runs.
#[derive(Clone, Copy)]
pub struct EmbeddedTranslation {
    pub hash: u32,
    pub mappings: &'static [Mapping],
    pub handlers: &'static [BlockFn],
    /// Installs the callback table into the embedded object's `api` slot
    pub init: fn(&CallbackTable, *mut u8),
}

#[derive(Default)]
pub struct EmbeddedRegistry {
    translations: Vec<EmbeddedTranslation>,
}

impl EmbeddedRegistry {
    pub fn register(&mut self, translation: EmbeddedTranslation) -> Result<()> {
        if self.translations.len() >= MAX_EMBEDDED {
            return Err(MachineError::InvalidProgram("Too many embedded translations"));
        }
        self.translations.push(translation);
        Ok(())
    }

    pub fn lookup(&self, hash: u32) -> Option<EmbeddedTranslation> {
        self.translations.iter().find(|t| t.hash == hash).copied()
    }

    pub fn len(&self) -> usize {
        self.translations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.translations.is_empty()
    }
}

static EMBEDDED: Lazy<Mutex<EmbeddedRegistry>> =
    Lazy::new(|| Mutex::new(EmbeddedRegistry::default()));

/// Register a translation in the process-wide embedded registry.
pub fn register_embedded_translation(translation: EmbeddedTranslation) -> Result<()> {
    EMBEDDED.lock().unwrap().register(translation)
}

/// Compiler defines shared with generated code, keyed for deterministic
/// hashing. Any field that changes generated code must appear here.
pub fn create_defines_for(options: &MachineOptions) -> BTreeMap<String, String> {
    let mut defines = BTreeMap::new();
    let platform = if cfg!(target_os = "linux") {
        "RISCV_PLATFORM_LINUX"
    } else if cfg!(target_os = "macos") {
        "RISCV_PLATFORM_DARWIN"
    } else if cfg!(target_os = "windows") {
        "RISCV_PLATFORM_WINDOWS"
    } else if cfg!(target_os = "freebsd") {
        "RISCV_PLATFORM_FREEBSD"
    } else {
        "RISCV_PLATFORM_OPENBSD"
    };
    defines.insert(platform.to_string(), "1".to_string());
    defines.insert(
        "RISCV_TRANSLATION_DYLIB".to_string(),
        options.xlen.w().to_string(),
    );
    defines.insert("RISCV_MAX_SYSCALLS".to_string(), MAX_SYSCALLS.to_string());

    // High-memory executables live outside the memory arena
    let (arena_end, rodata_end) = if options.translation_use_arena {
        (options.memory_arena_size, options.initial_rodata_end)
    } else {
        (0x1000, 0)
    };
    defines.insert("RISCV_ARENA_END".to_string(), arena_end.to_string());
    defines.insert("RISCV_ARENA_ROEND".to_string(), rodata_end.to_string());
    defines.insert(
        "RISCV_INS_COUNTER_OFF".to_string(),
        Cpu::ins_counter_offset().to_string(),
    );
    defines.insert(
        "RISCV_MAX_COUNTER_OFF".to_string(),
        Cpu::max_counter_offset().to_string(),
    );
    defines.insert("RISCV_ARENA_OFF".to_string(), Cpu::arena_offset().to_string());
    if options.atomics {
        defines.insert("RISCV_EXT_A".to_string(), "1".to_string());
    }
    if options.compressed {
        defines.insert("RISCV_EXT_C".to_string(), "1".to_string());
    }
    if options.vector_lanes > 0 {
        defines.insert(
            "RISCV_EXT_VECTOR".to_string(),
            options.vector_lanes.to_string(),
        );
    }
    if options.nanboxing {
        defines.insert("RISCV_NANBOXING".to_string(), "1".to_string());
    }
    if options.translate_trace {
        // Folding this into the hash forces a recompile whenever the trace
        // option is toggled.
        defines.insert("RISCV_TRACING".to_string(), "1".to_string());
    }
    if options.translate_ignore_instruction_limit {
        defines.insert(
            "RISCV_IGNORE_INSTRUCTION_LIMIT".to_string(),
            "1".to_string(),
        );
    }
    if options.encompassing_arena_bits != 0 {
        defines.insert(
            "RISCV_NBIT_UNBOUNDED".to_string(),
            options.encompassing_arena_bits.to_string(),
        );
    }
    defines
}

/// Key-ordered ` -DKEY=VALUE` compiler flag string
pub fn defines_to_string(defines: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in defines {
        out.push_str(&format!(" -D{}={}", key, value));
    }
    out
}

/// Outcome of the cache resolution pass
#[derive(Debug, PartialEq, Eq)]
pub enum LoadResult {
    /// Translation disabled by options; interpreted-only mode
    Disabled,
    /// A cached or embedded translation was activated
    Activated,
    /// No usable translation; the caller should compile into this filename
    MustCompile(String),
}

extern "C" fn invalid_mapping_trap(
    cpu: &mut Cpu,
    _counter: u64,
    _max_counter: u64,
    _pc: u64,
) -> ReturnValues {
    let pc = cpu.pc;
    cpu.set_pending_exception(pc, exception::INVALID_PROGRAM);
    ReturnValues { counter: 0, max_counter: 0 }
}

/// The translation driver, parameterized over the external compiler and
/// dynamic loader collaborators.
pub struct Translator {
    backend: Arc<dyn CompilerBackend>,
    loader: Arc<dyn DylibLoader>,
}

impl Translator {
    pub fn new(backend: Arc<dyn CompilerBackend>, loader: Arc<dyn DylibLoader>) -> Self {
        Self { backend, loader }
    }

    /// Full pipeline: resolve caches, then compile when required.
    pub fn translate(
        &self,
        options: &MachineOptions,
        segment: &Arc<Segment>,
        arena: *mut u8,
    ) -> Result<()> {
        match self.load_translation(options, segment, arena)? {
            LoadResult::MustCompile(filename) => {
                self.try_translate(options, &filename, segment, arena)
            }
            _ => Ok(()),
        }
    }

    /// Hash the segment and consult the embedded and on-disk caches.
    pub fn load_translation(
        &self,
        options: &MachineOptions,
        segment: &Arc<Segment>,
        arena: *mut u8,
    ) -> Result<LoadResult> {
        // Translation is disabled by clearing the enable flags or by a zero
        // block budget.
        if options.translate_blocks_max == 0
            || (!options.translate_enabled && !options.translate_enable_embedded)
        {
            log::info!("binary translation disabled");
            segment.set_binary_translated(None, false);
            return Ok(LoadResult::Disabled);
        }
        if segment.is_binary_translated() {
            return Err(MachineError::IllegalOperation(
                "Execute segment already binary translated",
            ));
        }

        // Checksum the execute segment and the compiler flags
        let cflags = defines_to_string(&create_defines_for(options));
        let mut checksum = segment.crc32c_hash();
        if checksum == 0 {
            return Err(MachineError::InvalidProgram(
                "Invalid execute segment hash for translation",
            ));
        }
        checksum = !crc32c_partial(!checksum, cflags.as_bytes());
        segment.set_translation_hash(checksum);

        if options.translate_enable_embedded {
            if let Some(translation) = EMBEDDED.lock().unwrap().lookup(checksum) {
                (translation.init)(&create_callback_table(), arena);
                log::info!(
                    "found embedded translation for hash {:08X}, {}/{} mappings",
                    checksum,
                    translation.handlers.len(),
                    translation.mappings.len()
                );
                segment.install_mappings(translation.handlers.to_vec());
                for mapping in translation.mappings {
                    let entry = segment.original_decoder().entry(mapping.addr);
                    entry.set_instr(mapping.mapping_index);
                    entry.set_bytecode(bytecode::BC_BLOCK_END);
                }
                return Ok(LoadResult::Activated);
            }
            log::info!("no embedded translation found for hash {:08X}", checksum);
        }

        if !options.translate_enabled {
            return Ok(LoadResult::Disabled);
        }

        let filename = MachineOptions::translation_filename(
            &options.translation_prefix,
            checksum,
            &options.translation_suffix,
        );

        // Always check whether a shared object already exists
        let mut dylib = None;
        if Path::new(&filename).exists() {
            let _guard = DLOPEN_MUTEX.lock().unwrap();
            dylib = self.loader.open(Path::new(&filename));
        }
        let mut must_compile = dylib.is_none();

        // JIT compilation is secondary to pre-compiled translations: with
        // no embedded translation and no shared object, compile in-process.
        if options.translate_jit && must_compile {
            return Ok(LoadResult::MustCompile(filename));
        }

        // If cross artifacts are requested, all of them must exist
        for cc in &options.cross_compile {
            match cc {
                CrossCompileOutput::Mingw { prefix, suffix } => {
                    let cross =
                        MachineOptions::translation_filename(prefix, checksum, suffix);
                    if !Path::new(&cross).exists() {
                        must_compile = true;
                        break;
                    }
                }
                CrossCompileOutput::EmbeddableCode { .. } => {
                    must_compile = true;
                    break;
                }
            }
        }

        let Some(module) = dylib else {
            return Ok(LoadResult::MustCompile(filename));
        };
        Translator::activate(options, segment, module, arena, false, false)?;

        // A missing cross artifact forces compilation even though the host
        // dylib already activated
        if must_compile {
            return Ok(LoadResult::MustCompile(filename));
        }
        Ok(LoadResult::Activated)
    }

    /// Scan, emit and compile a fresh translation into `filename`.
    pub fn try_translate(
        &self,
        options: &MachineOptions,
        filename: &str,
        segment: &Arc<Segment>,
        arena: *mut u8,
    ) -> Result<()> {
        if !options.translate_invoke_compiler {
            return Ok(());
        }

        let scan = scan_blocks(segment, options);

        let mut code = String::from(BINTR_RUNTIME);
        let mut dlmappings: Vec<TransMapping> = Vec::new();
        for block in &scan.blocks {
            let result = emit_block(
                &mut code,
                block,
                &scan.blocks,
                &scan.global_jump_locations,
                options,
            );
            dlmappings.extend(result);
        }

        log::info!(
            "emitted {} accelerated instructions and {} functions, GP=0x{:x}",
            scan.instruction_count,
            dlmappings.len(),
            scan.gp
        );
        // Nothing to compile without mappings
        if dlmappings.is_empty() {
            log::info!("binary translator has nothing to compile: no mappings");
            return Ok(());
        }

        let footer = build_footer(&dlmappings, scan.blocks.len())?;
        let defines = create_defines_for(options);
        let live_patch = options.translate_background_callback.is_some();

        // Embeddable source output is produced up front
        for cc in &options.cross_compile {
            if let CrossCompileOutput::EmbeddableCode { prefix, suffix } = cc {
                let hash = segment.translation_hash();
                let embed_filename = MachineOptions::translation_filename(prefix, hash, suffix);
                write_embeddable_source(
                    &embed_filename,
                    &defines,
                    &code,
                    &dlmappings,
                    hash,
                    options.xlen,
                );
            }
        }

        // The compilation step may be deferred to a background callback, in
        // which case the CPU keeps interpreting and the activation must
        // live-patch the running segment.
        let step_options = options.clone();
        let step_segment = Arc::clone(segment);
        let step_backend = Arc::clone(&self.backend);
        let step_filename = filename.to_string();
        let step_cflags = defines_to_string(&defines);
        let arena_addr = arena as usize;
        let compilation_step = move || {
            let source = format!("{}{}", code, footer);
            let w = step_options.xlen.w();
            let arena = arena_addr as *mut u8;

            let module = if step_options.translate_jit {
                let _guard = LIBTCC_MUTEX.lock().unwrap();
                step_backend.compile_jit(&source, w, &step_cflags)
            } else {
                let mut module = None;
                // A translation already loaded from disk skips compilation
                if !step_segment.is_binary_translated() {
                    module =
                        step_backend.compile(&source, w, &step_cflags, Path::new(&step_filename));
                }
                for cc in &step_options.cross_compile {
                    if let CrossCompileOutput::Mingw { prefix, suffix } = cc {
                        let cross = MachineOptions::translation_filename(
                            prefix,
                            step_segment.translation_hash(),
                            suffix,
                        );
                        step_backend.cross_compile(&source, w, &step_cflags, Path::new(&cross));
                    }
                }
                module
            };

            let Some(module) = module else {
                return;
            };
            if !step_segment.is_binary_translated() {
                if let Err(err) = Translator::activate(
                    &step_options,
                    &step_segment,
                    module,
                    arena,
                    step_options.translate_jit,
                    live_patch,
                ) {
                    log::warn!("translation activation failed: {}", err);
                }
            }
            if !step_options.translate_jit && !step_options.translation_cache {
                // The shared object is unwanted once loaded
                let _ = fs::remove_file(&step_filename);
            }
        };

        if let Some(callback) = &options.translate_background_callback {
            callback(Box::new(compilation_step));
        } else {
            compilation_step();
        }
        Ok(())
    }

    /// Bind a loaded translation into the segment's decoder cache.
    pub fn activate(
        options: &MachineOptions,
        segment: &Segment,
        module: Box<dyn TranslationModule>,
        arena: *mut u8,
        is_jit: bool,
        live_patch: bool,
    ) -> Result<()> {
        if !module.init(&create_callback_table(), arena) {
            log::warn!("could not find dylib init function");
            segment.set_binary_translated(None, false);
            return Ok(());
        }

        let mappings: Vec<Mapping> = module.mappings().to_vec();
        let handlers: Vec<BlockFn> = module.handlers().to_vec();
        if mappings.len() > MAX_MAPPINGS {
            segment.set_binary_translated(None, false);
            return Err(MachineError::InvalidProgram(
                "Invalid mappings in binary translation program",
            ));
        }

        // The dylib closes with the segment from here on
        segment.set_binary_translated(Some(module), is_jit);

        // Live patching rebuilds block metadata in a private copy first
        let mut patched = if live_patch {
            Some(segment.original_decoder().clone())
        } else {
            None
        };
        let mut livepatch_addrs: Vec<u64> = Vec::with_capacity(mappings.len());

        // N+1 mapping slots: the last one traps invalid mapping indices
        let mut table = handlers.clone();
        table.push(invalid_mapping_trap as BlockFn);
        segment.install_mappings(table);

        let stride = options.stride();
        for mapping in &mappings {
            let addr = mapping.addr;
            if !segment.is_within(addr) {
                log::warn!(
                    "translation mapping 0x{:x} outside execute area 0x{:x}-0x{:x}",
                    addr,
                    segment.exec_begin(),
                    segment.exec_end()
                );
                continue;
            }
            if (mapping.mapping_index as usize) >= handlers.len() {
                segment.original_decoder().entry(addr).set_bytecode(0); // invalid opcode
                continue;
            }

            if let Some(cache) = patched.as_mut() {
                // 1. The patched entry is the last instruction of its block.
                // 2. Later instructions work as normal.
                // 3. Look back through the monotonically increasing
                //    block_bytes() chain to find the beginning of the block.
                let begin = segment.exec_begin();
                let mut current = addr;
                let mut last_block_bytes = cache.entry(addr).block_bytes(stride);
                while current > begin
                    && cache.entry(current - stride).block_bytes(stride) > last_block_bytes
                {
                    current -= stride;
                    last_block_bytes = cache.entry(current).block_bytes(stride);
                }

                let block_begin_addr = current;
                if block_begin_addr < segment.exec_begin()
                    || block_begin_addr >= segment.exec_end()
                {
                    log::warn!(
                        "patched address 0x{:x} outside execute area 0x{:x}-0x{:x}",
                        block_begin_addr,
                        segment.exec_begin(),
                        segment.exec_end()
                    );
                    return Err(MachineError::InvalidProgram(
                        "Translation mapping outside execute area",
                    ));
                }

                // 4. Correct the block span of every entry up to the patch
                let mut patched_addr = block_begin_addr;
                while patched_addr < addr {
                    let entry = cache.entry_mut(patched_addr);
                    entry.idxend = ((addr - patched_addr) / stride) as u16;
                    entry.icount = 0;
                    patched_addr += stride;
                }

                // 5. The last instruction becomes the translated block entry
                let entry = cache.entry_mut(addr);
                entry.set_bytecode(bytecode::BC_TRANSLATOR);
                entry.set_instr(mapping.mapping_index);
                entry.idxend = 0;
                entry.icount = 0;
                livepatch_addrs.push(addr);
            } else {
                // Normal block-end hint, transformed into a translation
                // bytecode by the dispatcher once it passes its checks
                let entry = segment.original_decoder().entry(addr);
                entry.set_instr(mapping.mapping_index);
                entry.set_bytecode(bytecode::BC_BLOCK_END);
            }
        }

        if let Some(cache) = patched {
            segment.publish_patched_decoder(cache);
            // The patched decoder must be visible before any dispatcher can
            // observe a livepatch bytecode and swap over to it.
            fence(Ordering::SeqCst);
            for addr in livepatch_addrs {
                segment
                    .original_decoder()
                    .entry(addr)
                    .set_bytecode(bytecode::BC_LIVEPATCH);
            }
        }

        log::info!(
            "activated {} binary translation with {}/{} mappings{}",
            if is_jit { "jit" } else { "full" },
            handlers.len(),
            mappings.len(),
            if live_patch { ", live-patching enabled" } else { "" }
        );
        Ok(())
    }
}

/// Emit the complete C translation unit for a segment: runtime prelude,
/// one function per block, and the exported mapping footer.
pub fn emit_translation_unit(
    options: &MachineOptions,
    segment: &Segment,
) -> Result<(String, Vec<TransMapping>)> {
    let scan = scan_blocks(segment, options);
    let mut code = String::from(BINTR_RUNTIME);
    let mut dlmappings: Vec<TransMapping> = Vec::new();
    for block in &scan.blocks {
        let result = emit_block(
            &mut code,
            block,
            &scan.blocks,
            &scan.global_jump_locations,
            options,
        );
        dlmappings.extend(result);
    }
    if !dlmappings.is_empty() {
        code.push_str(&build_footer(&dlmappings, scan.blocks.len())?);
    }
    Ok((code, dlmappings))
}

/// Deduplicate symbols and render the exported mapping tables.
fn build_footer(dlmappings: &[TransMapping], n_blocks: usize) -> Result<String> {
    let (pairs, symbols) = unique_mappings(dlmappings);
    if symbols.len() != n_blocks {
        return Err(MachineError::InvalidProgram("Mismatch in unique mappings"));
    }

    let mut footer = format!("VISIBLE const uint32_t no_mappings = {};\n", pairs.len());
    footer.push_str("struct Mapping {\n\taddr_t   addr;\n\tunsigned mapping_index;\n};\n");
    footer.push_str("VISIBLE const struct Mapping mappings[] = {\n");
    for (addr, index) in &pairs {
        footer.push_str(&format!("{{0x{:X}, {}}},\n", addr, index));
    }
    footer.push_str("};\n");
    footer.push_str(&format!(
        "VISIBLE const uint32_t no_handlers = {};\n",
        symbols.len()
    ));
    footer.push_str("VISIBLE const void* unique_mappings[] = {\n");
    for symbol in &symbols {
        footer.push_str(&format!("    {},\n", symbol));
    }
    footer.push_str("};\n");
    Ok(footer)
}

/// (addr, unique index) pairs plus the unique symbol list, in first-seen order
fn unique_mappings(dlmappings: &[TransMapping]) -> (Vec<(u64, u32)>, Vec<String>) {
    let mut indices: HashMap<&str, u32> = HashMap::new();
    let mut symbols: Vec<String> = Vec::new();
    let mut pairs: Vec<(u64, u32)> = Vec::with_capacity(dlmappings.len());
    for mapping in dlmappings {
        let index = match indices.get(mapping.symbol.as_str()) {
            Some(&index) => index,
            None => {
                let index = symbols.len() as u32;
                indices.insert(mapping.symbol.as_str(), index);
                symbols.push(mapping.symbol.clone());
                index
            }
        };
        pairs.push((mapping.addr, index));
    }
    (pairs, symbols)
}

/// Write the self-registering embeddable source variant.
fn write_embeddable_source(
    filename: &str,
    defines: &BTreeMap<String, String>,
    code: &str,
    dlmappings: &[TransMapping],
    hash: u32,
    xlen: Xlen,
) {
    let (pairs, symbols) = unique_mappings(dlmappings);
    let mut out = String::from("#define EMBEDDABLE_CODE 1\n");
    for (key, value) in defines {
        out.push_str(&format!("#define {} {}\n", key, value));
    }
    out.push_str(code);
    out.push_str(
        "struct EmbMapping {\n\taddr_t   addr;\n\tunsigned mapping_index;\n};\n\
         typedef ReturnValues (*bintr_func)(CPU*, uint64_t, uint64_t, addr_t);\n",
    );
    let reg_func = format!("rvbintr_register_translation{}", xlen.w());
    out.push_str(&format!(
        "extern void {}(uint32_t, const struct EmbMapping*, uint32_t, const bintr_func*, uint32_t, struct CallbackTable*);\n",
        reg_func
    ));
    out.push_str("static __attribute__((constructor)) void register_translation(void) {\n");
    out.push_str("static const struct EmbMapping mappings[] = {\n");
    for (addr, index) in &pairs {
        out.push_str(&format!("{{0x{:X}, {}}},\n", addr, index));
    }
    out.push_str("};\nstatic const bintr_func unique_mappings[] = {\n");
    for symbol in &symbols {
        out.push_str(&format!("    {},\n", symbol));
    }
    out.push_str("};\n");
    out.push_str(&format!(
        "    {}({}u, mappings, {}, unique_mappings, {}, &api);\n}}\n",
        reg_func,
        hash,
        pairs.len(),
        symbols.len()
    ));

    if let Err(err) = fs::write(filename, out) {
        log::warn!("could not write embeddable source {}: {}", filename, err);
    } else {
        log::info!("wrote embeddable source {}", filename);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::bytecode::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    extern "C" fn nop_block(_cpu: &mut Cpu, counter: u64, max_counter: u64, _pc: u64) -> ReturnValues {
        ReturnValues { counter, max_counter }
    }

    struct MockModule {
        mappings: Vec<Mapping>,
        handlers: Vec<BlockFn>,
        has_init: bool,
    }

    impl TranslationModule for MockModule {
        fn init(&self, _api: &CallbackTable, _arena: *mut u8) -> bool {
            self.has_init
        }
        fn mappings(&self) -> &[Mapping] {
            &self.mappings
        }
        fn handlers(&self) -> &[BlockFn] {
            &self.handlers
        }
    }

    struct NeverLoads;
    impl DylibLoader for NeverLoads {
        fn open(&self, _path: &Path) -> Option<Box<dyn TranslationModule>> {
            None
        }
    }

    struct NoCompiler;
    impl CompilerBackend for NoCompiler {
        fn compile(
            &self,
            _source: &str,
            _w: u32,
            _cflags: &str,
            _output: &Path,
        ) -> Option<Box<dyn TranslationModule>> {
            None
        }
    }

    /// Backend that "compiles" to a single mapping at the segment base
    struct OneBlockCompiler {
        addr: u64,
    }
    impl CompilerBackend for OneBlockCompiler {
        fn compile(
            &self,
            source: &str,
            _w: u32,
            _cflags: &str,
            _output: &Path,
        ) -> Option<Box<dyn TranslationModule>> {
            assert!(source.contains("no_mappings"));
            Some(Box::new(MockModule {
                mappings: vec![Mapping { addr: self.addr, mapping_index: 0 }],
                handlers: vec![nop_block as BlockFn],
                has_init: true,
            }))
        }
    }

    fn translator() -> Translator {
        Translator::new(Arc::new(NoCompiler), Arc::new(NeverLoads))
    }

    fn test_options() -> MachineOptions {
        let mut options = MachineOptions::default();
        // Keep filenames away from any real translation cache
        options.translation_prefix = "/nonexistent/rvbintr-test-".into();
        options
    }

    fn make_segment(code: &[u32], vaddr: u64, options: &MachineOptions) -> Arc<Segment> {
        Arc::new(Segment::create(options, &words_to_bytes(code), vaddr).unwrap())
    }

    #[test]
    fn disabled_translation_is_not_an_error() {
        let mut options = test_options();
        options.translate_enabled = false;
        options.translate_enable_embedded = false;
        let segment = make_segment(&[0x0000_0073], 0x1000, &options);
        let result = translator()
            .load_translation(&options, &segment, std::ptr::null_mut())
            .unwrap();
        assert_eq!(result, LoadResult::Disabled);
        assert!(!segment.is_binary_translated());
    }

    #[test]
    fn feature_flags_fold_into_the_hash() {
        let options = test_options();
        let segment = make_segment(&[0x0000_0073], 0x1000, &options);
        let tr = translator();
        tr.load_translation(&options, &segment, std::ptr::null_mut()).unwrap();
        let base_hash = segment.translation_hash();
        assert_ne!(base_hash, 0);

        // Toggling trace changes the defines, and therefore the hash
        let mut traced = test_options();
        traced.translate_trace = true;
        let segment2 = make_segment(&[0x0000_0073], 0x1000, &traced);
        tr.load_translation(&traced, &segment2, std::ptr::null_mut()).unwrap();
        assert_ne!(segment2.translation_hash(), base_hash);

        // Identical options and bytes reproduce the hash
        let segment3 = make_segment(&[0x0000_0073], 0x1000, &options);
        tr.load_translation(&options, &segment3, std::ptr::null_mut()).unwrap();
        assert_eq!(segment3.translation_hash(), base_hash);
    }

    #[test]
    fn missing_cache_requests_compilation_with_exact_filename() {
        let options = test_options();
        let segment = make_segment(&[0x0000_0073], 0x1000, &options);
        let result = translator()
            .load_translation(&options, &segment, std::ptr::null_mut())
            .unwrap();
        let expected = format!(
            "/nonexistent/rvbintr-test-{:08X}.so",
            segment.translation_hash()
        );
        assert_eq!(result, LoadResult::MustCompile(expected));
    }

    #[test]
    fn embedded_registry_is_bounded_at_twelve() {
        static NO_MAPPINGS: [Mapping; 0] = [];
        static NO_HANDLERS: [BlockFn; 0] = [];
        fn no_init(_: &CallbackTable, _: *mut u8) {}

        let mut registry = EmbeddedRegistry::default();
        for hash in 0..MAX_EMBEDDED as u32 {
            registry
                .register(EmbeddedTranslation {
                    hash,
                    mappings: &NO_MAPPINGS,
                    handlers: &NO_HANDLERS,
                    init: no_init,
                })
                .unwrap();
        }
        let err = registry
            .register(EmbeddedTranslation {
                hash: 0xFFFF,
                mappings: &NO_MAPPINGS,
                handlers: &NO_HANDLERS,
                init: no_init,
            })
            .unwrap_err();
        assert_eq!(
            err,
            MachineError::InvalidProgram("Too many embedded translations")
        );
    }

    #[test]
    fn activation_marks_block_end_hints() {
        let options = test_options();
        let segment = make_segment(&[0x0010_0093, 0x0000_8067], 0x1000, &options);
        let module = Box::new(MockModule {
            mappings: vec![
                Mapping { addr: 0x1000, mapping_index: 0 },
                Mapping { addr: 0x9000, mapping_index: 0 }, // outside: skipped
            ],
            handlers: vec![nop_block as BlockFn],
            has_init: true,
        });
        Translator::activate(&options, &segment, module, std::ptr::null_mut(), false, false)
            .unwrap();

        assert!(segment.is_binary_translated());
        let entry = segment.original_decoder().entry(0x1000);
        assert_eq!(entry.bytecode(), BC_BLOCK_END);
        assert_eq!(entry.instr(), 0);
        // handlers + the invalid-mapping trap slot
        assert_eq!(segment.mapping_count(), 2);
    }

    #[test]
    fn activation_without_init_leaves_interpreted_mode() {
        let options = test_options();
        let segment = make_segment(&[0x0000_0073], 0x1000, &options);
        let module = Box::new(MockModule {
            mappings: vec![Mapping { addr: 0x1000, mapping_index: 0 }],
            handlers: vec![nop_block as BlockFn],
            has_init: false,
        });
        Translator::activate(&options, &segment, module, std::ptr::null_mut(), false, false)
            .unwrap();
        assert!(!segment.is_binary_translated());
        assert_eq!(segment.original_decoder().entry(0x1000).bytecode(), BC_SYSCALL);
    }

    #[test]
    fn double_translation_is_an_illegal_operation() {
        let options = test_options();
        let segment = make_segment(&[0x0000_0073], 0x1000, &options);
        let module = Box::new(MockModule {
            mappings: vec![Mapping { addr: 0x1000, mapping_index: 0 }],
            handlers: vec![nop_block as BlockFn],
            has_init: true,
        });
        let tr = translator();
        Translator::activate(&options, &segment, module, std::ptr::null_mut(), false, false)
            .unwrap();
        let err = tr
            .load_translation(&options, &segment, std::ptr::null_mut())
            .unwrap_err();
        assert_eq!(
            err,
            MachineError::IllegalOperation("Execute segment already binary translated")
        );
    }

    #[test]
    fn out_of_range_mapping_index_clears_the_bytecode() {
        let options = test_options();
        let segment = make_segment(&[0x0010_0093, 0x0000_8067], 0x1000, &options);
        let module = Box::new(MockModule {
            mappings: vec![Mapping { addr: 0x1004, mapping_index: 7 }],
            handlers: vec![nop_block as BlockFn],
            has_init: true,
        });
        Translator::activate(&options, &segment, module, std::ptr::null_mut(), false, false)
            .unwrap();
        assert_eq!(segment.original_decoder().entry(0x1004).bytecode(), 0);
    }

    #[test]
    fn live_patch_publishes_a_consistent_patched_cache() {
        let options = test_options();
        // addi; addi; ret: one fastsim block, patched in the middle
        let segment = make_segment(&[0x0010_0093, 0x0020_0113, 0x0000_8067], 0x1000, &options);
        let module = Box::new(MockModule {
            mappings: vec![Mapping { addr: 0x1008, mapping_index: 0 }],
            handlers: vec![nop_block as BlockFn],
            has_init: true,
        });
        Translator::activate(&options, &segment, module, std::ptr::null_mut(), false, true)
            .unwrap();

        // The patched cache carries the translator bytecode and a coherent
        // idxend chain leading to the patched terminator
        let patched = segment.decoder();
        assert_eq!(patched.entry(0x1008).bytecode(), BC_TRANSLATOR);
        assert_eq!(patched.entry(0x1008).idxend, 0);
        assert_eq!(patched.entry(0x1004).idxend, 1);
        assert_eq!(patched.entry(0x1000).idxend, 2);

        // The original cache only had its bytecode flipped to livepatch
        let original = segment.original_decoder();
        assert_eq!(original.entry(0x1008).bytecode(), BC_LIVEPATCH);
        assert_eq!(original.entry(0x1000).idxend, 2);
    }

    #[test]
    fn oversize_mapping_tables_are_rejected() {
        let options = test_options();
        let segment = make_segment(&[0x0000_0073], 0x1000, &options);
        let module = Box::new(MockModule {
            mappings: vec![Mapping { addr: 0x1000, mapping_index: 0 }; MAX_MAPPINGS + 1],
            handlers: vec![nop_block as BlockFn],
            has_init: true,
        });
        let err = Translator::activate(&options, &segment, module, std::ptr::null_mut(), false, false)
            .unwrap_err();
        assert_eq!(
            err,
            MachineError::InvalidProgram("Invalid mappings in binary translation program")
        );
        assert!(!segment.is_binary_translated());
    }

    #[test]
    fn compile_path_activates_the_fresh_module() {
        let mut options = test_options();
        options.translation_cache = false;
        let segment = make_segment(&[0x0010_0093, 0x0000_8067], 0x1000, &options);
        let tr = Translator::new(Arc::new(OneBlockCompiler { addr: 0x1000 }), Arc::new(NeverLoads));
        tr.translate(&options, &segment, std::ptr::null_mut()).unwrap();

        assert!(segment.is_binary_translated());
        assert_eq!(segment.original_decoder().entry(0x1000).bytecode(), BC_BLOCK_END);
    }

    #[test]
    fn background_callback_defers_compilation_and_live_patches() {
        use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

        static RAN: AtomicBool = AtomicBool::new(false);
        let mut options = test_options();
        options.translate_background_callback = Some(Arc::new(|step: Box<dyn FnOnce() + Send>| {
            RAN.store(true, AtomicOrdering::SeqCst);
            step();
        }));
        let segment = make_segment(&[0x0010_0093, 0x0000_8067], 0x1000, &options);
        let tr = Translator::new(Arc::new(OneBlockCompiler { addr: 0x1000 }), Arc::new(NeverLoads));
        tr.translate(&options, &segment, std::ptr::null_mut()).unwrap();

        assert!(RAN.load(AtomicOrdering::SeqCst));
        assert!(segment.is_binary_translated());
        // Deferred compilation activates through the live-patch path
        assert_eq!(segment.decoder().entry(0x1000).bytecode(), BC_TRANSLATOR);
        assert_eq!(segment.original_decoder().entry(0x1000).bytecode(), BC_LIVEPATCH);
    }

    #[test]
    fn footer_exports_deduplicated_mappings() {
        let mappings = vec![
            TransMapping { addr: 0x1000, symbol: "f_1000".into() },
            TransMapping { addr: 0x1004, symbol: "f_1000".into() },
            TransMapping { addr: 0x2000, symbol: "f_2000".into() },
        ];
        let footer = build_footer(&mappings, 2).unwrap();
        assert!(footer.contains("VISIBLE const uint32_t no_mappings = 3;"));
        assert!(footer.contains("VISIBLE const uint32_t no_handlers = 2;"));
        assert!(footer.contains("{0x1000, 0},"));
        assert!(footer.contains("{0x1004, 0},"));
        assert!(footer.contains("{0x2000, 1},"));

        let err = build_footer(&mappings, 3).unwrap_err();
        assert_eq!(err, MachineError::InvalidProgram("Mismatch in unique mappings"));
    }

    #[test]
    fn defines_render_in_key_order() {
        let options = test_options();
        let defines = create_defines_for(&options);
        let rendered = defines_to_string(&defines);
        assert!(rendered.contains(" -DRISCV_TRANSLATION_DYLIB=8"));
        assert!(rendered.contains(" -DRISCV_ARENA_OFF="));
        // Deterministic: two renders are identical
        assert_eq!(rendered, defines_to_string(&create_defines_for(&options)));
    }
}
