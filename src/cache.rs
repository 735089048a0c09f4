// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Translation-unit cache.
//!
//! A hashed directory of finished units keyed by guest PC. Buckets are
//! doubly linked lists ordered by recency, implemented as indices into a
//! flat slot vector so eviction is O(1) and never chases raw back-pointers.
//! Promotion on hit is the only write performed during steady-state dispatch.

use crate::arena::Arena;
use crate::memory::GuestMemory;
use crate::translator::{InstalledUnit, FRAGMENT_HEADER_BYTES};

use std::ptr::NonNull;

const BUCKETS: usize = 1 << 16;
const NIL: u32 = u32::MAX;

/// Folds a 32-bit guest PC down to the 16-bit bucket index.
#[inline]
pub fn hash(pc: u32) -> usize {
    ((pc ^ pc >> 16) & 0xFFFF) as usize
}

/// FNV-1a fingerprint of a unit's source guest words.
pub fn fingerprint(words: &[u16]) -> u32 {
    let mut h: u32 = 0x811C_9DC5;
    for word in words {
        for byte in word.to_be_bytes() {
            h ^= byte as u32;
            h = h.wrapping_mul(0x0100_0193);
        }
    }
    h
}

/// One finished translation unit.
pub struct TranslationUnit {
    /// Starting guest PC.
    pub pc: u32,
    /// Fetched guest-word count.
    pub word_count: u32,
    /// Byte length of the emitted native code.
    pub code_len: u32,
    /// Entries into this unit since it was created.
    pub use_count: u64,
    /// Fingerprint of the source guest words.
    pub fingerprint: u32,
    fragment: NonNull<u8>,
    frag_len: usize,
    stamp: u64,
    next: u32,
    prev: u32,
}

// Units are only reachable through the cache, which is confined to the
// emulator context together with the arena owning the fragments.
unsafe impl Send for TranslationUnit {}

impl TranslationUnit {
    /// Pointer to the fragment entry, right behind the header.
    pub fn entry(&self) -> *const u8 {
        unsafe { self.fragment.as_ptr().add(FRAGMENT_HEADER_BYTES) }
    }

    /// Pointer to the fetched-guest-word count cell inside the fragment header.
    pub fn fetch_count_cell(&self) -> *const u32 {
        unsafe { self.fragment.as_ptr().cast::<u32>().add(1) }
    }
}

/// Unit directory with LRU promotion.
pub struct UnitCache {
    heads: Vec<u32>,
    slots: Vec<Option<TranslationUnit>>,
    free_slots: Vec<u32>,
    count: usize,
    clock: u64,
}

impl UnitCache {
    pub fn new() -> Self {
        Self {
            heads: vec![NIL; BUCKETS],
            slots: Vec::new(),
            free_slots: Vec::new(),
            count: 0,
            clock: 0,
        }
    }

    /// Number of live units.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, handle: u32) -> &TranslationUnit {
        self.slots[handle as usize].as_ref().expect("stale unit handle")
    }

    pub fn get_mut(&mut self, handle: u32) -> &mut TranslationUnit {
        self.slots[handle as usize].as_mut().expect("stale unit handle")
    }

    /// Walks the bucket for `hash(pc)`. On hit the unit moves to the bucket
    /// head and its recency stamp advances.
    pub fn find(&mut self, pc: u32) -> Option<u32> {
        let bucket = hash(pc);
        let mut index = self.heads[bucket];
        while index != NIL {
            let unit = self.slots[index as usize].as_ref().expect("broken bucket link");
            if unit.pc == pc {
                self.promote(bucket, index);
                return Some(index);
            }
            index = unit.next;
        }
        None
    }

    fn promote(&mut self, bucket: usize, index: u32) {
        self.clock += 1;
        if self.heads[bucket] != index {
            self.unlink(bucket, index);
            self.link_head(bucket, index);
        }
        self.get_mut(index).stamp = self.clock;
    }

    fn link_head(&mut self, bucket: usize, index: u32) {
        let old_head = self.heads[bucket];
        {
            let unit = self.get_mut(index);
            unit.prev = NIL;
            unit.next = old_head;
        }
        if old_head != NIL {
            self.get_mut(old_head).prev = index;
        }
        self.heads[bucket] = index;
    }

    fn unlink(&mut self, bucket: usize, index: u32) {
        let (prev, next) = {
            let unit = self.get(index);
            (unit.prev, unit.next)
        };
        if prev != NIL {
            self.get_mut(prev).next = next;
        } else {
            self.heads[bucket] = next;
        }
        if next != NIL {
            self.get_mut(next).prev = prev;
        }
    }

    /// Places a freshly installed unit at its bucket's head.
    ///
    /// Entries never duplicate; at most one unit exists per guest PC.
    pub fn insert(&mut self, installed: InstalledUnit) -> u32 {
        debug_assert!(
            self.peek(installed.pc).is_none(),
            "duplicate unit for {:#010X}",
            installed.pc
        );

        self.clock += 1;
        let unit = TranslationUnit {
            pc: installed.pc,
            word_count: installed.word_count,
            code_len: installed.code_len,
            use_count: 0,
            fingerprint: installed.fingerprint,
            fragment: installed.fragment,
            frag_len: installed.frag_len,
            stamp: self.clock,
            next: NIL,
            prev: NIL,
        };

        let index = match self.free_slots.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(unit);
                index
            }
            None => {
                self.slots.push(Some(unit));
                (self.slots.len() - 1) as u32
            }
        };
        self.link_head(hash(installed.pc), index);
        self.count += 1;
        index
    }

    /// Head of the bucket the given PC hashes into, most recently matched
    /// unit first.
    pub fn bucket_head(&self, pc: u32) -> Option<u32> {
        let head = self.heads[hash(pc)];
        (head != NIL).then_some(head)
    }

    /// Bucket lookup without promotion.
    pub fn peek(&self, pc: u32) -> Option<u32> {
        let mut index = self.heads[hash(pc)];
        while index != NIL {
            let unit = self.slots[index as usize].as_ref()?;
            if unit.pc == pc {
                return Some(index);
            }
            index = unit.next;
        }
        None
    }

    /// Unlinks the unit and returns its fragment to the arena.
    pub fn evict(&mut self, handle: u32, arena: &mut Arena) {
        let bucket = hash(self.get(handle).pc);
        self.unlink(bucket, handle);
        let unit = self.slots[handle as usize].take().expect("stale unit handle");
        arena.free(unit.fragment, unit.frag_len);
        self.free_slots.push(handle);
        self.count -= 1;
    }

    /// Recomputes the fingerprint of the unit's guest source words. On
    /// mismatch the unit is evicted and `None` is returned.
    pub fn verify(
        &mut self,
        handle: u32,
        memory: &GuestMemory,
        arena: &mut Arena,
    ) -> Option<u32> {
        let (pc, word_count, stored) = {
            let unit = self.get(handle);
            (unit.pc, unit.word_count, unit.fingerprint)
        };
        let words: Vec<u16> = (0..word_count)
            .map(|i| memory.code_word(pc.wrapping_add(i * 2)).unwrap_or(0))
            .collect();
        if fingerprint(&words) == stored {
            Some(handle)
        } else {
            log::debug!("unit at {pc:#010X} failed verification, evicting");
            self.evict(handle, arena);
            None
        }
    }

    /// Drops the least-recently-promoted units until at most `target` remain.
    pub fn soft_flush(&mut self, arena: &mut Arena, target: usize) {
        if self.count <= target {
            return;
        }
        let mut by_age: Vec<(u64, u32)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|u| (u.stamp, i as u32)))
            .collect();
        by_age.sort_unstable();
        let excess = self.count - target;
        for &(_, handle) in &by_age[..excess] {
            self.evict(handle, arena);
        }
    }

    /// Evicts every unit. Required on guest cache-disable or explicit
    /// invalidate.
    pub fn hard_flush(&mut self, arena: &mut Arena) {
        for handle in 0..self.slots.len() as u32 {
            if self.slots[handle as usize].is_some() {
                self.evict(handle, arena);
            }
        }
    }
}

impl Default for UnitCache {
    fn default() -> Self {
        Self::new()
    }
}
