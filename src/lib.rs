// rvbintr - RISC-V decoder cache and binary translation core
//
// Turns raw guest machine code into an indexed, decoded form suitable for
// fast interpretation, and translates hot segments into native code.
//
// # Architecture
//
// The core works in several phases:
//
// 1. **Segment construction** (`segment.rs`): page-align and pad the raw
//    code bytes, hash them with CRC32-C
// 2. **Decoder cache** (`decode.rs`, `cache.rs`): decode every potential
//    instruction start into handler index, bytecode and rewritten bits,
//    then realize the per-block fastsim metadata
// 3. **Block discovery** (`blocks.rs`): split the segment into translation
//    blocks and collect local and global jump targets
// 4. **Code emission** (`emit.rs`): emit one portable C function per block
// 5. **Translation driver** (`translator.rs`): hash-name the translation,
//    resolve embedded/on-disk/JIT caches, compile, and bind the resulting
//    native entry points back into the decoder cache - optionally by
//    live-patching a running segment
//
// The instruction handlers, ELF loading, the syscall layer, guest memory
// paging, the C compiler process and the platform dynamic loader are
// external collaborators, consumed through the traits in `api.rs`.

pub mod api;
pub mod blocks;
pub mod cache;
pub mod cpu;
pub mod decode;
pub mod emit;
pub mod error;
pub mod isa;
pub mod options;
pub mod segment;
pub mod translator;
pub mod util;

pub use api::{BlockFn, CallbackTable, CompilerBackend, DylibLoader, Mapping, TranslationModule};
pub use cache::{DecoderCache, DecoderEntry, FASTSIM_BLOCK_END, PAGE_SIZE};
pub use cpu::{Cpu, ReturnValues};
pub use error::{MachineError, Result};
pub use options::{CrossCompileOutput, MachineOptions, Xlen};
pub use segment::{Segment, SegmentRegistry};
pub use translator::{
    emit_translation_unit, register_embedded_translation, EmbeddedTranslation, LoadResult,
    Translator,
};
