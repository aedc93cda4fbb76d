// segment.rs - Decoded execute segments
//
// A segment owns a page-padded copy of the guest code, its decoder cache
// and, once translated, the dylib handle and mapping table. After a segment
// is published behind an Arc only the decoder entries' atomic fields, the
// patched decoder slot and the mapping table may change; the byte buffer
// and hash are frozen.

use std::sync::{Arc, Mutex, OnceLock};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::api::{BlockFn, TranslationModule};
use crate::cache::{generate_decoder_cache, DecoderCache, PAGE_SIZE};
use crate::error::{MachineError, Result};
use crate::options::MachineOptions;
use crate::util::crc32c;

struct TranslationHandle {
    _module: Box<dyn TranslationModule>,
    is_jit: bool,
}

impl std::fmt::Debug for TranslationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationHandle")
            .field("is_jit", &self.is_jit)
            .finish()
    }
}

#[derive(Debug)]
pub struct Segment {
    pagedata_base: u64,
    vaddr: u64,
    exec_len: u64,
    data: Box<[u8]>,
    crc: u32,
    translation_hash: AtomicU32,
    decoder: DecoderCache,
    patched_decoder: OnceLock<DecoderCache>,
    translation: Mutex<Option<TranslationHandle>>,
    mappings: Mutex<Vec<BlockFn>>,
}

impl Segment {
    /// Create an execute segment from raw guest code at `vaddr`. The buffer
    /// is padded with zeroes out to page boundaries on both sides, hashed,
    /// and decoded.
    pub fn create(options: &MachineOptions, vdata: &[u8], vaddr: u64) -> Result<Segment> {
        const PMASK: u64 = PAGE_SIZE - 1;
        let exlen = vdata.len() as u64;
        let pbase = vaddr & !PMASK;
        let prelen = vaddr - pbase;
        let midlen = prelen
            .checked_add(exlen)
            .ok_or(MachineError::InvalidProgram("Segment virtual base was bogus"))?;
        let plen = midlen
            .checked_add(PMASK)
            .ok_or(MachineError::InvalidProgram("Segment virtual base was bogus"))?
            & !PMASK;
        if prelen > plen || midlen > plen || pbase.checked_add(plen).is_none() {
            return Err(MachineError::InvalidProgram("Segment virtual base was bogus"));
        }

        let mut data = vec![0u8; plen as usize];
        data[prelen as usize..(prelen + exlen) as usize].copy_from_slice(vdata);

        let decoder =
            generate_decoder_cache(options, &data, pbase, vaddr, vaddr + exlen, None)?;

        Ok(Segment {
            pagedata_base: pbase,
            vaddr,
            exec_len: exlen,
            data: data.into_boxed_slice(),
            crc: crc32c(vdata),
            translation_hash: AtomicU32::new(0),
            decoder,
            patched_decoder: OnceLock::new(),
            translation: Mutex::new(None),
            mappings: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn pagedata_base(&self) -> u64 {
        self.pagedata_base
    }

    #[inline]
    pub fn exec_begin(&self) -> u64 {
        self.vaddr
    }

    #[inline]
    pub fn exec_end(&self) -> u64 {
        self.vaddr + self.exec_len
    }

    /// The padded byte buffer, indexed from `pagedata_base`
    #[inline]
    pub fn exec_data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn is_within(&self, addr: u64) -> bool {
        addr >= self.exec_begin() && addr < self.exec_end()
    }

    /// CRC32-C over the original (unpadded) code bytes
    #[inline]
    pub fn crc32c_hash(&self) -> u32 {
        self.crc
    }

    pub fn translation_hash(&self) -> u32 {
        self.translation_hash.load(Ordering::Relaxed)
    }

    pub fn set_translation_hash(&self, hash: u32) {
        self.translation_hash.store(hash, Ordering::Relaxed);
    }

    /// The decoder the next dispatcher should use: the live-patched cache
    /// once one has been published, the original otherwise. The original is
    /// retained until the segment drops so CPUs still running on it stay
    /// valid.
    pub fn decoder(&self) -> &DecoderCache {
        self.patched_decoder.get().unwrap_or(&self.decoder)
    }

    pub fn original_decoder(&self) -> &DecoderCache {
        &self.decoder
    }

    pub(crate) fn publish_patched_decoder(&self, cache: DecoderCache) -> &DecoderCache {
        // Single writer: the translation driver
        let _ = self.patched_decoder.set(cache);
        self.patched_decoder.get().unwrap()
    }

    pub fn is_binary_translated(&self) -> bool {
        self.translation.lock().unwrap().is_some()
    }

    pub fn is_jit(&self) -> bool {
        self.translation
            .lock()
            .unwrap()
            .as_ref()
            .map(|t| t.is_jit)
            .unwrap_or(false)
    }

    pub fn set_binary_translated(&self, module: Option<Box<dyn TranslationModule>>, is_jit: bool) {
        *self.translation.lock().unwrap() =
            module.map(|module| TranslationHandle { _module: module, is_jit });
    }

    /// Replace the mapping table (native block entry points)
    pub fn install_mappings(&self, mappings: Vec<BlockFn>) {
        *self.mappings.lock().unwrap() = mappings;
    }

    pub fn mapping(&self, index: u32) -> Option<BlockFn> {
        self.mappings.lock().unwrap().get(index as usize).copied()
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().unwrap().len()
    }
}

/// Ordered collection of live execute segments
#[derive(Default)]
pub struct SegmentRegistry {
    segments: Vec<Arc<Segment>>,
}

impl SegmentRegistry {
    pub fn insert(&mut self, segment: Arc<Segment>) {
        self.segments.push(segment);
    }

    /// Find the segment containing `vaddr`
    pub fn segment_for(&self, vaddr: u64) -> Option<&Arc<Segment>> {
        self.segments.iter().find(|s| s.is_within(vaddr))
    }

    /// Drop segments beyond `remaining` entries, oldest kept first
    pub fn evict(&mut self, remaining: usize) {
        self.segments.truncate(remaining);
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn segment_is_padded_to_page_boundaries() {
        let opts = MachineOptions::default();
        let code = words_to_bytes(&[0x0000_0073]);
        let seg = Segment::create(&opts, &code, 0x1010).unwrap();

        assert_eq!(seg.pagedata_base(), 0x1000);
        assert_eq!(seg.exec_begin(), 0x1010);
        assert_eq!(seg.exec_end(), 0x1014);
        assert_eq!(seg.exec_data().len() as u64 % PAGE_SIZE, 0);
        // Leading padding is zeroed, code lands at the right offset
        assert!(seg.exec_data()[..0x10].iter().all(|&b| b == 0));
        assert_eq!(&seg.exec_data()[0x10..0x14], &code[..]);
        assert!(seg.is_within(0x1010));
        assert!(!seg.is_within(0x1014));
    }

    #[test]
    fn empty_code_is_rejected() {
        let opts = MachineOptions::default();
        let err = Segment::create(&opts, &[], 0x1000).unwrap_err();
        assert_eq!(
            err,
            MachineError::InvalidProgram("Program produced empty decoder cache")
        );
    }

    #[test]
    fn bogus_virtual_base_is_rejected() {
        let opts = MachineOptions::default();
        let code = words_to_bytes(&[0x0000_0073; 0x100]);
        let err = Segment::create(&opts, &code, u64::MAX - 0x100).unwrap_err();
        assert_eq!(
            err,
            MachineError::InvalidProgram("Segment virtual base was bogus")
        );
    }

    #[test]
    fn identical_bytes_hash_identically() {
        let opts = MachineOptions::default();
        let code = words_to_bytes(&[0x0010_0093, 0x0000_8067]);
        let a = Segment::create(&opts, &code, 0x1000).unwrap();
        let b = Segment::create(&opts, &code, 0x1000).unwrap();
        assert_eq!(a.crc32c_hash(), b.crc32c_hash());

        // A single mutated instruction byte must change the hash
        let mut mutated = code.clone();
        mutated[0] ^= 1;
        let c = Segment::create(&opts, &mutated, 0x1000).unwrap();
        assert_ne!(a.crc32c_hash(), c.crc32c_hash());
    }

    #[test]
    fn registry_finds_and_evicts_segments() {
        let opts = MachineOptions::default();
        let mut registry = SegmentRegistry::default();
        let a = Arc::new(Segment::create(&opts, &words_to_bytes(&[0x0000_0073]), 0x1000).unwrap());
        let b = Arc::new(Segment::create(&opts, &words_to_bytes(&[0x0000_0073]), 0x9000).unwrap());
        registry.insert(a);
        registry.insert(b);

        assert_eq!(registry.segment_for(0x1000).unwrap().exec_begin(), 0x1000);
        assert_eq!(registry.segment_for(0x9002).unwrap().exec_begin(), 0x9000);
        assert!(registry.segment_for(0x5000).is_none());

        registry.evict(1);
        assert_eq!(registry.len(), 1);
        assert!(registry.segment_for(0x9000).is_none());
    }
}
