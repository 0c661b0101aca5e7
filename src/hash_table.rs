//! A Swiss-table hash container with copy-on-write storage.
//!
//! The table is a contiguous sequence of 32-slot groups. Each slot has a
//! one-byte control cell mirroring it position for position: `-1` marks an
//! empty slot, and a non-negative byte marks an occupied slot while carrying
//! the top seven bits of the entry's hash as a fingerprint. A lookup loads a
//! group's 32 control bytes, compares them against the probe fingerprint in
//! one vector operation, and only touches entries whose fingerprint matched.
//! With a 64-bit hash the chance of a fingerprint collision within a group is
//! small enough that almost every lookup inspects at most one entry.
//!
//! ## Design
//!
//! Probing is strictly single-group. The low bits of a hash select the group
//! and the entry lives in that group or nowhere; an insert that finds all 32
//! slots of its group occupied doubles the table and redistributes instead of
//! spilling into a neighboring group. This keeps lookups to a single
//! load/compare/mask round and makes tombstones unnecessary, since removal
//! can return a slot directly to empty without breaking any probe chain. The
//! cost is that the growth trigger is stochastic: a group fills up at some
//! load factor that depends on the hash distribution rather than at a fixed
//! threshold. Under a uniform hash saturation below moderate load is
//! vanishingly rare, and the `eager-growth` feature adds a conventional 7/8
//! guard for callers who want a deterministic bound anyway.
//!
//! It is important that fingerprints come from the top bits of the hash while
//! group selection uses the low bits. The two filters must stay
//! uncorrelated: deriving both from the same bits makes every fingerprint
//! within a group collide and turns the vector filter into a no-op.
//!
//! All data lives in one type-erased allocation:
//! `[ Header | control bytes | pad | entries ]`
//!
//! The header carries the capacity and a reference count. Cloning a table
//! handle bumps the count and copies the cached region pointers, so a clone
//! is O(1) and clones share storage until one of them mutates. Every mutating
//! operation first checks that the handle owns the buffer uniquely and forks
//! a private copy when it does not. This gives handles value semantics (a
//! write through one handle is never observable through another) while
//! keeping reads and copies cheap. The count is a plain `Cell`: the table is
//! a single-threaded structure and handles are deliberately not `Send`.
//!
//! Capacities are always a power of two so that group selection is a mask
//! rather than a modulo, and always at least one full group.
//!
//! ## Safety Invariants
//!
//! The implementation relies on the following key invariants:
//!
//! 1. **Index bounds**: `group_base(hash) = (hash & group_mask) * 32` with
//!    `group_mask = capacity / 32 - 1`, so `group_base + 32 <= capacity` for
//!    every hash, and every slot index handed around internally is
//!    `group_base + n` with `n < 32`.
//!
//! 2. **Initialization**: a control byte of `EMPTY` marks an uninitialized
//!    entry cell; any non-negative control byte guarantees the corresponding
//!    cell holds an initialized `Bucket<K, V>`. Control bytes are written
//!    only after the cell they govern.
//!
//! 3. **Fingerprint consistency**: for every occupied slot, the control byte
//!    equals `fingerprint(bucket.hash)` and the slot's group equals
//!    `bucket.hash & group_mask`. Rehashing recomputes placements from the
//!    stored hash alone.
//!
//! 4. **Unique ownership before writes**: all paths that write through the
//!    cached region pointers run behind the copy-on-write gate, so a buffer
//!    with more than one handle is never mutated. Replacing the buffer
//!    refreshes the cached pointers before the old allocation is released.

use alloc::alloc::handle_alloc_error;
use core::alloc::Layout;
#[cfg(target_arch = "x86")]
use core::arch::x86::*;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;
use core::cell::Cell;
use core::fmt::Debug;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "eager-growth")] {
        const GROWTH_GUARD: bool = true;
    } else {
        const GROWTH_GUARD: bool = false;
    }
}

/// Number of slots scanned by one probe. Matches the width of a 256-bit
/// vector of bytes; the SSE2 and scalar probes emulate the same width so the
/// group geometry is identical on every path.
const GROUP_WIDTH: usize = 32;

/// Smallest capacity the table will allocate: one full group.
const MIN_CAPACITY: usize = GROUP_WIDTH;

/// Control byte marking an empty slot.
///
/// Chosen as -1 (byte 0xFF) so the sign bit distinguishes empty from
/// occupied and a `movemask` over raw control bytes yields the empty set
/// without a compare. Occupied bytes are fingerprints in `0..=127`.
const EMPTY: i8 = -1;

/// Extracts the 7-bit fingerprint from a hash.
///
/// The shift keeps the top seven bits and leaves the byte's sign bit clear,
/// so the result is always in `0..=127` and never collides with `EMPTY`. The
/// low bits are deliberately not used: they select the group, and reusing
/// them here would make fingerprints within a group degenerate.
#[inline(always)]
fn fingerprint(hash: u64) -> i8 {
    (hash >> 57) as i8
}

cfg_if! {
    if #[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), target_feature = "avx2"))] {
        /// Compare all 32 control bytes in a group against `fp`.
        ///
        /// Bit `i` of the result is set iff control byte `i` equals `fp`.
        ///
        /// # Safety
        ///
        /// `ctrl` must be valid for reads of 32 bytes.
        #[inline(always)]
        unsafe fn group_match(ctrl: *const i8, fp: i8) -> u32 {
            // SAFETY: The caller guarantees 32 readable bytes; the load is
            // unaligned so no alignment requirement applies.
            unsafe {
                let data = _mm256_loadu_si256(ctrl as *const __m256i);
                let cmp = _mm256_cmpeq_epi8(data, _mm256_set1_epi8(fp));
                _mm256_movemask_epi8(cmp) as u32
            }
        }

        /// Bitmask of empty slots in a group.
        ///
        /// Empty control bytes are the only negative ones, so the sign-bit
        /// movemask is the empty set with no compare at all.
        ///
        /// # Safety
        ///
        /// `ctrl` must be valid for reads of 32 bytes.
        #[inline(always)]
        unsafe fn group_empty(ctrl: *const i8) -> u32 {
            // SAFETY: The caller guarantees 32 readable bytes.
            unsafe {
                let data = _mm256_loadu_si256(ctrl as *const __m256i);
                _mm256_movemask_epi8(data) as u32
            }
        }
    } else if #[cfg(all(any(target_arch = "x86", target_arch = "x86_64"), target_feature = "sse2"))] {
        /// Compare all 32 control bytes in a group against `fp`.
        ///
        /// Two 16-byte scans composed into the same 32-bit mask the AVX2
        /// probe produces.
        ///
        /// # Safety
        ///
        /// `ctrl` must be valid for reads of 32 bytes.
        #[inline(always)]
        unsafe fn group_match(ctrl: *const i8, fp: i8) -> u32 {
            // SAFETY: The caller guarantees 32 readable bytes; both loads are
            // unaligned.
            unsafe {
                let needle = _mm_set1_epi8(fp);
                let lo = _mm_loadu_si128(ctrl as *const __m128i);
                let hi = _mm_loadu_si128(ctrl.add(16) as *const __m128i);
                let lo = _mm_movemask_epi8(_mm_cmpeq_epi8(lo, needle)) as u32;
                let hi = _mm_movemask_epi8(_mm_cmpeq_epi8(hi, needle)) as u32;
                (hi << 16) | lo
            }
        }

        /// Bitmask of empty slots in a group, via the sign-bit movemask.
        ///
        /// # Safety
        ///
        /// `ctrl` must be valid for reads of 32 bytes.
        #[inline(always)]
        unsafe fn group_empty(ctrl: *const i8) -> u32 {
            // SAFETY: The caller guarantees 32 readable bytes.
            unsafe {
                let lo = _mm_movemask_epi8(_mm_loadu_si128(ctrl as *const __m128i)) as u32;
                let hi = _mm_movemask_epi8(_mm_loadu_si128(ctrl.add(16) as *const __m128i)) as u32;
                (hi << 16) | lo
            }
        }
    } else {
        /// Compare all 32 control bytes in a group against `fp`.
        ///
        /// Portable fallback; same group width and mask layout as the vector
        /// probes.
        ///
        /// # Safety
        ///
        /// `ctrl` must be valid for reads of 32 bytes.
        #[inline(always)]
        unsafe fn group_match(ctrl: *const i8, fp: i8) -> u32 {
            let mut mask = 0u32;
            for i in 0..GROUP_WIDTH {
                // SAFETY: The caller guarantees 32 readable bytes.
                if unsafe { *ctrl.add(i) } == fp {
                    mask |= 1 << i;
                }
            }
            mask
        }

        /// Bitmask of empty slots in a group.
        ///
        /// # Safety
        ///
        /// `ctrl` must be valid for reads of 32 bytes.
        #[inline(always)]
        unsafe fn group_empty(ctrl: *const i8) -> u32 {
            let mut mask = 0u32;
            for i in 0..GROUP_WIDTH {
                // SAFETY: The caller guarantees 32 readable bytes.
                if unsafe { *ctrl.add(i) } < 0 {
                    mask |= 1 << i;
                }
            }
            mask
        }
    }
}

/// Bitmask of occupied slots in a group. Used by iteration, rehashing and
/// the copy-on-write fork.
///
/// # Safety
///
/// `ctrl` must be valid for reads of 32 bytes.
#[inline(always)]
unsafe fn group_occupied(ctrl: *const i8) -> u32 {
    // SAFETY: Same contract as `group_empty`.
    !unsafe { group_empty(ctrl) }
}

/// One slot's payload: the entry's hash plus the key-value pair. The hash is
/// stored so that rehashing and forking never need to re-derive it.
struct Bucket<K, V> {
    hash: u64,
    key: K,
    value: V,
}

/// Allocation header. Lives at offset zero of the storage buffer, in front
/// of the control bytes.
#[repr(C)]
struct Header {
    /// Number of table handles sharing this buffer. Non-atomic: the table is
    /// single-threaded and handles are not `Send`.
    refs: Cell<usize>,
    capacity: usize,
}

#[derive(Debug, Clone, Copy)]
struct DataLayout {
    layout: Layout,
    ctrl_offset: usize,
    buckets_offset: usize,
}

impl DataLayout {
    fn new<K, V>(capacity: usize) -> Self {
        let ctrl_layout = Layout::array::<i8>(capacity).expect("allocation size overflow");
        let buckets_layout =
            Layout::array::<MaybeUninit<Bucket<K, V>>>(capacity).expect("allocation size overflow");

        let (layout, ctrl_offset) = Layout::new::<Header>().extend(ctrl_layout).unwrap();
        let (layout, buckets_offset) = layout.extend(buckets_layout).unwrap();

        DataLayout {
            layout,
            ctrl_offset,
            buckets_offset,
        }
    }
}

/// A Swiss-table hash container with copy-on-write storage.
///
/// `HashTable<K, V>` stores key-value pairs and provides fast insertion,
/// lookup, and removal, but never hashes a key itself: every operation takes
/// a precomputed 64-bit hash alongside the key. Prefer the
/// [`HashMap<K, V, S>`] or [`HashSet<T, S>`] wrappers, which own a hasher,
/// unless you are building your own map or set structure on top.
///
/// Cloning a `HashTable` is O(1); the clone shares the storage buffer until
/// one of the handles mutates, at which point the mutating handle forks a
/// private copy. Mutating operations therefore carry `K: Clone, V: Clone`
/// bounds.
///
/// Hashes must be well distributed in their low bits (group selection) and
/// their top seven bits (fingerprints). Hashers with weak high-bit
/// dispersion need a finalization mix before being used with this table.
///
/// [`HashMap<K, V, S>`]: crate::hash_map::HashMap
/// [`HashSet<T, S>`]: crate::hash_set::HashSet
pub struct HashTable<K, V> {
    buf: NonNull<u8>,

    // Cached pointers into `buf`'s regions. Invalidated and refreshed
    // whenever the buffer is replaced by growth, a fork, or `clear`.
    ctrl: NonNull<i8>,
    buckets: NonNull<MaybeUninit<Bucket<K, V>>>,

    group_mask: usize,
    populated: usize,

    _phantom: PhantomData<Bucket<K, V>>,
}

impl<K, V> Debug for HashTable<K, V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use alloc::format;
        use alloc::string::ToString;
        use alloc::vec::Vec;

        let groups = (0..=self.group_mask)
            .map(|group| {
                let mut cells = Vec::new();
                for i in 0..GROUP_WIDTH {
                    // SAFETY: `group * GROUP_WIDTH + i` is below capacity for
                    // every `group <= group_mask`.
                    let ctrl = unsafe { *self.ctrl_at(group * GROUP_WIDTH + i) };
                    if ctrl == EMPTY {
                        cells.push("..".to_string());
                    } else {
                        cells.push(format!("{ctrl:02x}"));
                    }
                }
                cells.join(" ")
            })
            .collect::<Vec<_>>();

        f.debug_struct("HashTable")
            .field("ctrl", &groups)
            .field("populated", &self.populated)
            .field("capacity", &self.capacity())
            .field("shared", &(self.header().refs.get() > 1))
            .finish()
    }
}

impl<K, V> Clone for HashTable<K, V> {
    /// Copies the handle, not the contents. The clone shares the storage
    /// buffer; the first mutation through either handle forks it.
    fn clone(&self) -> Self {
        let refs = &self.header().refs;
        refs.set(refs.get() + 1);

        HashTable {
            buf: self.buf,
            ctrl: self.ctrl,
            buckets: self.buckets,
            group_mask: self.group_mask,
            populated: self.populated,
            _phantom: PhantomData,
        }
    }
}

impl<K, V> Drop for HashTable<K, V> {
    fn drop(&mut self) {
        let refs = &self.header().refs;
        refs.set(refs.get() - 1);
        if refs.get() != 0 {
            return;
        }

        // SAFETY: This handle held the last reference, so nothing else can
        // observe the buffer. Every slot whose control byte is not `EMPTY`
        // holds an initialized bucket (invariant 2), and the layout is a pure
        // function of the capacity recorded in the header at allocation time.
        unsafe {
            let capacity = self.header().capacity;
            if core::mem::needs_drop::<Bucket<K, V>>() && self.populated > 0 {
                for slot in 0..capacity {
                    if *self.ctrl_at(slot) != EMPTY {
                        (*self.bucket_at(slot)).assume_init_drop();
                    }
                }
            }

            let layout = DataLayout::new::<K, V>(capacity);
            alloc::alloc::dealloc(self.buf.as_ptr(), layout.layout);
        }
    }
}

impl<K, V> HashTable<K, V> {
    /// Creates a new table with at least the requested number of slots.
    ///
    /// The capacity is rounded up to the next power of two and is never less
    /// than one group (32 slots).
    pub fn with_capacity(min_capacity: usize) -> Self {
        Self::new_buffer(min_capacity.max(MIN_CAPACITY).next_power_of_two())
    }

    /// Allocates a fresh, empty, uniquely-owned buffer of exactly `capacity`
    /// slots and returns a handle to it.
    fn new_buffer(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity >= MIN_CAPACITY);

        let layout = DataLayout::new::<K, V>(capacity);
        // SAFETY: The layout has non-zero size (capacity is at least 32), and
        // allocation failure is handled. The header write and the control
        // memset stay inside the allocation by construction of the offsets.
        // Buckets are left uninitialized; the all-empty control region marks
        // every cell as such.
        let buf = unsafe {
            let raw = alloc::alloc::alloc(layout.layout);
            if raw.is_null() {
                handle_alloc_error(layout.layout);
            }

            raw.cast::<Header>().write(Header {
                refs: Cell::new(1),
                capacity,
            });
            core::ptr::write_bytes(raw.add(layout.ctrl_offset), EMPTY as u8, capacity);

            NonNull::new_unchecked(raw)
        };

        // SAFETY: Both offsets are derived from the layout this buffer was
        // allocated with.
        unsafe {
            HashTable {
                buf,
                ctrl: NonNull::new_unchecked(buf.as_ptr().add(layout.ctrl_offset).cast()),
                buckets: NonNull::new_unchecked(buf.as_ptr().add(layout.buckets_offset).cast()),
                group_mask: capacity / GROUP_WIDTH - 1,
                populated: 0,
                _phantom: PhantomData,
            }
        }
    }

    fn header(&self) -> &Header {
        // SAFETY: `buf` points to a live allocation that starts with a
        // `Header`, written during `new_buffer`.
        unsafe { self.buf.cast::<Header>().as_ref() }
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.populated
    }

    /// Returns `true` if the table contains no entries.
    pub fn is_empty(&self) -> bool {
        self.populated == 0
    }

    /// Returns the total number of slots.
    ///
    /// Always a power of two and a multiple of the 32-slot group width. The
    /// table can hold this many entries before it must grow, although growth
    /// usually triggers earlier, when some group fills up.
    pub fn capacity(&self) -> usize {
        (self.group_mask + 1) * GROUP_WIDTH
    }

    /// Base slot index of the group selected by `hash`.
    ///
    /// The low bits of the hash pick the group; the result is always at most
    /// `capacity - GROUP_WIDTH`.
    #[inline(always)]
    fn group_base(&self, hash: u64) -> usize {
        ((hash as usize) & self.group_mask) * GROUP_WIDTH
    }

    /// Pointer to the control byte of `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must be below the current capacity.
    #[inline(always)]
    unsafe fn ctrl_at(&self, slot: usize) -> *mut i8 {
        // SAFETY: Caller keeps `slot` in bounds of the control region.
        unsafe { self.ctrl.as_ptr().add(slot) }
    }

    /// Pointer to the bucket cell of `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must be below the current capacity.
    #[inline(always)]
    unsafe fn bucket_at(&self, slot: usize) -> *mut MaybeUninit<Bucket<K, V>> {
        // SAFETY: Caller keeps `slot` in bounds of the bucket region.
        unsafe { self.buckets.as_ptr().add(slot) }
    }

    /// Locates the slot holding `key`, probing only the group its hash maps
    /// to.
    #[inline]
    fn find_slot(&self, hash: u64, key: &K) -> Option<usize>
    where
        K: Eq,
    {
        let base = self.group_base(hash);
        let fp = fingerprint(hash);

        // SAFETY: `base + GROUP_WIDTH <= capacity` (invariant 1), so the
        // probe reads in bounds and every candidate slot is in bounds. A set
        // candidate bit marks an occupied slot (the fingerprint is
        // non-negative, so `EMPTY` never matches it), making the bucket read
        // safe.
        unsafe {
            let mut candidates = group_match(self.ctrl_at(base), fp);
            while candidates != 0 {
                let slot = base + candidates.trailing_zeros() as usize;
                candidates &= candidates - 1;

                let bucket = (*self.bucket_at(slot)).assume_init_ref();
                if bucket.hash == hash && bucket.key == *key {
                    return Some(slot);
                }
            }
        }

        None
    }

    /// Looks up a value by key.
    ///
    /// `hash` must be the hash of `key` under the same hasher used for every
    /// other operation on this table.
    #[inline]
    pub fn find(&self, hash: u64, key: &K) -> Option<&V>
    where
        K: Eq,
    {
        if self.populated == 0 {
            return None;
        }

        let slot = self.find_slot(hash, key)?;
        // SAFETY: `find_slot` only returns occupied, in-bounds slots.
        Some(unsafe { &(*self.bucket_at(slot)).assume_init_ref().value })
    }

    /// Looks up an entry by key, returning references to the stored key and
    /// value.
    #[inline]
    pub fn find_pair(&self, hash: u64, key: &K) -> Option<(&K, &V)>
    where
        K: Eq,
    {
        if self.populated == 0 {
            return None;
        }

        let slot = self.find_slot(hash, key)?;
        // SAFETY: `find_slot` only returns occupied, in-bounds slots.
        let bucket = unsafe { (*self.bucket_at(slot)).assume_init_ref() };
        Some((&bucket.key, &bucket.value))
    }

    /// Looks up a value by key, returning a mutable reference.
    ///
    /// This is a mutation point: if the storage is shared with other handles
    /// it is forked first, so that writes through the returned reference stay
    /// private to this handle. An absent key never forks.
    #[inline]
    pub fn find_mut(&mut self, hash: u64, key: &K) -> Option<&mut V>
    where
        K: Eq + Clone,
        V: Clone,
    {
        if self.populated == 0 {
            return None;
        }

        // Probe before forking so misses stay cheap on shared storage.
        self.find_slot(hash, key)?;
        self.ensure_unique();

        // The fork preserves membership but may have moved the entry within
        // its group, so locate it again.
        let slot = self.find_slot(hash, key)?;
        // SAFETY: `find_slot` only returns occupied, in-bounds slots, and the
        // buffer is uniquely owned after `ensure_unique`.
        Some(unsafe { &mut (*self.bucket_at(slot)).assume_init_mut().value })
    }

    /// Inserts a key-value pair, returning the previous value if the key was
    /// already present.
    ///
    /// On an update the whole entry record is overwritten, key included. On a
    /// fresh insert the entry takes the first empty slot of its hash's group;
    /// if the group is full the table grows and the insert retries.
    pub fn insert(&mut self, hash: u64, key: K, value: V) -> Option<V>
    where
        K: Eq + Clone,
        V: Clone,
    {
        self.ensure_unique();
        self.maybe_grow_eagerly();

        let fp = fingerprint(hash);
        loop {
            let base = self.group_base(hash);

            // SAFETY: `base + GROUP_WIDTH <= capacity`, matched candidate
            // slots are occupied and initialized, and the chosen empty slot
            // is written before its control byte is set (invariant 2). The
            // buffer is uniquely owned after `ensure_unique`.
            unsafe {
                let mut candidates = group_match(self.ctrl_at(base), fp);
                while candidates != 0 {
                    let slot = base + candidates.trailing_zeros() as usize;
                    candidates &= candidates - 1;

                    let bucket = (*self.bucket_at(slot)).assume_init_mut();
                    if bucket.hash == hash && bucket.key == key {
                        let old = core::mem::replace(bucket, Bucket { hash, key, value });
                        return Some(old.value);
                    }
                }

                let empties = group_empty(self.ctrl_at(base));
                if empties != 0 {
                    let slot = base + empties.trailing_zeros() as usize;
                    (*self.bucket_at(slot)).write(Bucket { hash, key, value });
                    *self.ctrl_at(slot) = fp;
                    self.populated += 1;
                    return None;
                }
            }

            // Group saturated: double and retry. The group for `hash` is
            // recomputed on the next pass since the mask changed.
            self.grow_rehash();
        }
    }

    /// Removes a key from the table, returning the stored key and value if it
    /// was present.
    ///
    /// The slot returns directly to empty; single-group probing needs no
    /// tombstones. Removing an absent key is a no-op and never forks shared
    /// storage.
    pub fn remove(&mut self, hash: u64, key: &K) -> Option<(K, V)>
    where
        K: Eq + Clone,
        V: Clone,
    {
        if self.populated == 0 {
            return None;
        }

        self.find_slot(hash, key)?;
        self.ensure_unique();
        let slot = self.find_slot(hash, key)?;

        self.populated -= 1;
        // SAFETY: `find_slot` only returns occupied, in-bounds slots; the
        // buffer is uniquely owned. Clearing the control byte before the read
        // transfers ownership of the bucket's contents to the caller, so the
        // cell will not be dropped again.
        unsafe {
            *self.ctrl_at(slot) = EMPTY;
            let bucket = (*self.bucket_at(slot)).assume_init_read();
            Some((bucket.key, bucket.value))
        }
    }

    /// Gets an entry for the given hash and key for in-place manipulation.
    ///
    /// Like all mutation points this runs the copy-on-write gate up front,
    /// and it reserves the insertion slot eagerly, growing the table if the
    /// key is absent and its group is full.
    pub fn entry(&mut self, hash: u64, key: K) -> Entry<'_, K, V>
    where
        K: Eq + Clone,
        V: Clone,
    {
        self.ensure_unique();
        self.maybe_grow_eagerly();

        if let Some(slot) = self.find_slot(hash, &key) {
            return Entry::Occupied(OccupiedEntry { table: self, slot });
        }

        loop {
            let base = self.group_base(hash);
            // SAFETY: `base + GROUP_WIDTH <= capacity`.
            let empties = unsafe { group_empty(self.ctrl_at(base)) };
            if empties != 0 {
                let slot = base + empties.trailing_zeros() as usize;
                return Entry::Vacant(VacantEntry {
                    table: self,
                    hash,
                    key,
                    slot,
                });
            }

            self.grow_rehash();
        }
    }

    /// Removes all entries, keeping the current capacity.
    ///
    /// On a shared buffer this simply swaps in a fresh buffer and releases
    /// this handle's reference; the other handles keep the old contents.
    pub fn clear(&mut self) {
        if self.populated == 0 {
            return;
        }

        if self.header().refs.get() > 1 {
            *self = Self::new_buffer(self.capacity());
            return;
        }

        // SAFETY: Unique owner; every occupied control byte marks an
        // initialized bucket. The control region is reset after the drops,
        // marking every cell uninitialized again.
        unsafe {
            if core::mem::needs_drop::<Bucket<K, V>>() {
                for slot in 0..self.capacity() {
                    if *self.ctrl_at(slot) != EMPTY {
                        (*self.bucket_at(slot)).assume_init_drop();
                    }
                }
            }
            core::ptr::write_bytes(self.ctrl.as_ptr(), EMPTY as u8, self.capacity());
        }

        self.populated = 0;
    }

    /// Reserves capacity for at least `additional` more entries.
    ///
    /// Growth is a mutation, so shared storage is forked first. Does nothing
    /// if the capacity is already sufficient.
    pub fn reserve(&mut self, additional: usize)
    where
        K: Clone,
        V: Clone,
    {
        let required = self.populated.saturating_add(additional);
        if required > self.capacity() {
            self.ensure_unique();
            self.grow_to(required.next_power_of_two());
        }
    }

    /// Returns an iterator over the entries in the table.
    ///
    /// Entries are yielded in physical slot order, which is arbitrary and not
    /// stable across mutations. The iterator reads through the storage
    /// captured at creation; mutations through *other* handles fork their own
    /// storage first and are never observed.
    pub fn iter(&self) -> Iter<'_, K, V> {
        // SAFETY: Capacity is at least one group, so group 0 is readable.
        let mask = unsafe { group_occupied(self.ctrl.as_ptr()) };
        Iter {
            table: self,
            base: 0,
            mask,
        }
    }

    /// The copy-on-write gate: every mutating path calls this first.
    #[inline(always)]
    fn ensure_unique(&mut self)
    where
        K: Clone,
        V: Clone,
    {
        if self.header().refs.get() > 1 {
            self.fork();
        }
    }

    /// Forks shared storage into a private same-capacity buffer, cloning
    /// every occupied entry.
    ///
    /// Placement re-derives each entry's group from its stored hash and takes
    /// the first empty slot, exactly like a rehash; with an unchanged group
    /// count the destination group always has room.
    #[cold]
    #[inline(never)]
    fn fork(&mut self)
    where
        K: Clone,
        V: Clone,
    {
        let mut new_table = Self::new_buffer(self.capacity());

        // SAFETY: Occupied control bytes mark initialized buckets in the
        // source. The destination has identical group geometry and holds at
        // most as many entries per group, so `group_empty` cannot come back
        // zero. Writes into the destination set the control byte only after
        // the bucket cell, so a panicking clone leaves `new_table` in a
        // consistent state for its drop.
        unsafe {
            for group in 0..=self.group_mask {
                let base = group * GROUP_WIDTH;
                let mut live = group_occupied(self.ctrl_at(base));
                while live != 0 {
                    let slot = base + live.trailing_zeros() as usize;
                    live &= live - 1;

                    let bucket = (*self.bucket_at(slot)).assume_init_ref();
                    let dst_base = new_table.group_base(bucket.hash);
                    let empties = group_empty(new_table.ctrl_at(dst_base));
                    debug_assert!(empties != 0);
                    let dst_slot = dst_base + empties.trailing_zeros() as usize;

                    (*new_table.bucket_at(dst_slot)).write(Bucket {
                        hash: bucket.hash,
                        key: bucket.key.clone(),
                        value: bucket.value.clone(),
                    });
                    *new_table.ctrl_at(dst_slot) = fingerprint(bucket.hash);
                    new_table.populated += 1;
                }
            }
        }

        debug_assert_eq!(new_table.populated, self.populated);
        // Dropping the old handle releases one reference to the shared
        // buffer; the remaining handles keep it alive.
        *self = new_table;
    }

    #[inline(always)]
    fn maybe_grow_eagerly(&mut self) {
        if GROWTH_GUARD && self.populated >= self.capacity() / 8 * 7 {
            self.grow_rehash();
        }
    }

    #[cold]
    #[inline(never)]
    fn grow_rehash(&mut self) {
        self.grow_to(self.capacity() * 2);
    }

    /// Rehashes into a buffer of `new_capacity` slots, doubling again if some
    /// destination group fills up during migration.
    ///
    /// The old buffer must be uniquely owned: entries are moved, not cloned.
    /// The handle's buffer reference and cached pointers are replaced only
    /// once the new buffer is fully populated; on allocation failure the
    /// table is still in its pre-rehash state.
    fn grow_to(&mut self, mut new_capacity: usize) {
        debug_assert_eq!(self.header().refs.get(), 1);
        debug_assert!(new_capacity >= self.capacity());

        loop {
            let mut new_table = Self::new_buffer(new_capacity);

            // SAFETY: `new_table` is empty with power-of-two geometry and at
            // least the current capacity, and this handle owns the source
            // uniquely.
            if unsafe { self.migrate_move_into(&mut new_table) } {
                new_table.populated = self.populated;

                // SAFETY: The moved-out buckets are owned by `new_table` now.
                // Clearing the control region stops the old buffer's release
                // from dropping them a second time.
                unsafe {
                    core::ptr::write_bytes(self.ctrl.as_ptr(), EMPTY as u8, self.capacity());
                }
                *self = new_table;
                return;
            }

            // A destination group filled up. The partial contents of
            // `new_table` are plain byte copies of buckets the old buffer
            // still owns; clear its control region so dropping it releases
            // only the allocation, then retry with twice the capacity.
            //
            // SAFETY: `new_table` owns its fully allocated control region.
            unsafe {
                core::ptr::write_bytes(new_table.ctrl.as_ptr(), EMPTY as u8, new_capacity);
            }
            new_capacity *= 2;
        }
    }

    /// Copies every occupied bucket into `target`, placing each in the first
    /// empty slot of the group its stored hash selects under the target's
    /// mask. Returns `false` if some destination group has no empty slot.
    ///
    /// Buckets are moved bitwise; on success the caller must make sure the
    /// source buffer no longer drops them.
    ///
    /// # Safety
    ///
    /// `target` must be an empty table with capacity at least `self`'s, and
    /// occupied control bytes in `self` must mark initialized buckets.
    unsafe fn migrate_move_into(&self, target: &mut Self) -> bool {
        for group in 0..=self.group_mask {
            let base = group * GROUP_WIDTH;
            // SAFETY: `base + GROUP_WIDTH <= capacity` on both sides; source
            // bits mark initialized buckets; destination cells are written
            // before their control bytes.
            unsafe {
                let mut live = group_occupied(self.ctrl_at(base));
                while live != 0 {
                    let slot = base + live.trailing_zeros() as usize;
                    live &= live - 1;

                    let src = self.bucket_at(slot);
                    let hash = (*src).assume_init_ref().hash;
                    let dst_base = target.group_base(hash);

                    let empties = group_empty(target.ctrl_at(dst_base));
                    if empties == 0 {
                        return false;
                    }
                    let dst_slot = dst_base + empties.trailing_zeros() as usize;

                    core::ptr::copy_nonoverlapping(src, target.bucket_at(dst_slot), 1);
                    *target.ctrl_at(dst_slot) = fingerprint(hash);
                }
            }
        }

        true
    }
}

/// A view into a single entry in the table, which may be vacant or occupied.
///
/// This enum is constructed from the [`entry`] method on [`HashTable`].
///
/// [`entry`]: HashTable::entry
pub enum Entry<'a, K, V> {
    /// The key is not present in the table.
    Vacant(VacantEntry<'a, K, V>),
    /// The key is present in the table.
    Occupied(OccupiedEntry<'a, K, V>),
}

impl<'a, K, V> Entry<'a, K, V> {
    /// Inserts the given value if the entry is vacant and returns a mutable
    /// reference to the value either way.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Inserts a value computed from a closure if the entry is vacant and
    /// returns a mutable reference to the value either way.
    pub fn or_insert_with(self, default: impl FnOnce() -> V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Provides in-place mutable access to an occupied entry before any
    /// potential insert.
    pub fn and_modify(self, f: impl FnOnce(&mut V)) -> Self {
        match self {
            Entry::Occupied(mut entry) => {
                f(entry.get_mut());
                Entry::Occupied(entry)
            }
            Entry::Vacant(entry) => Entry::Vacant(entry),
        }
    }

    /// Returns a reference to this entry's key.
    pub fn key(&self) -> &K {
        match self {
            Entry::Occupied(entry) => entry.key(),
            Entry::Vacant(entry) => entry.key(),
        }
    }
}

impl<'a, K, V> Entry<'a, K, V>
where
    V: Default,
{
    /// Inserts the default value if the entry is vacant and returns a mutable
    /// reference to the value either way.
    pub fn or_default(self) -> &'a mut V {
        self.or_insert_with(Default::default)
    }
}

/// A view into a vacant entry in the table.
///
/// Holds the slot reserved by [`HashTable::entry`]: the first empty slot of
/// the key's group, valid as long as the table is not otherwise touched,
/// which the exclusive borrow guarantees.
pub struct VacantEntry<'a, K, V> {
    table: &'a mut HashTable<K, V>,
    hash: u64,
    key: K,
    slot: usize,
}

impl<'a, K, V> VacantEntry<'a, K, V> {
    /// Gets a reference to the key that would be used when inserting.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Takes ownership of the key without inserting.
    pub fn into_key(self) -> K {
        self.key
    }

    /// Inserts the value and returns a mutable reference to it.
    pub fn insert(self, value: V) -> &'a mut V {
        let VacantEntry {
            table,
            hash,
            key,
            slot,
        } = self;

        // SAFETY: `entry` selected `slot` as an empty slot in `hash`'s group
        // of a uniquely-owned buffer, and the exclusive borrow kept the table
        // untouched since. The control byte is set after the cell is written.
        unsafe {
            (*table.bucket_at(slot)).write(Bucket { hash, key, value });
            *table.ctrl_at(slot) = fingerprint(hash);
            table.populated += 1;
            &mut (*table.bucket_at(slot)).assume_init_mut().value
        }
    }
}

/// A view into an occupied entry in the table.
// Safety invariant: `slot` was returned by `find_slot` on a uniquely-owned
// buffer and the exclusive borrow keeps it valid, so the slot is in bounds
// and its bucket initialized for the lifetime of this view.
pub struct OccupiedEntry<'a, K, V> {
    table: &'a mut HashTable<K, V>,
    slot: usize,
}

impl<'a, K, V> OccupiedEntry<'a, K, V> {
    /// Gets a reference to the key in the entry.
    pub fn key(&self) -> &K {
        // SAFETY: See the invariant on the struct.
        unsafe { &(*self.table.bucket_at(self.slot)).assume_init_ref().key }
    }

    /// Gets a reference to the value in the entry.
    pub fn get(&self) -> &V {
        // SAFETY: See the invariant on the struct.
        unsafe { &(*self.table.bucket_at(self.slot)).assume_init_ref().value }
    }

    /// Gets a mutable reference to the value in the entry.
    pub fn get_mut(&mut self) -> &mut V {
        // SAFETY: See the invariant on the struct.
        unsafe { &mut (*self.table.bucket_at(self.slot)).assume_init_mut().value }
    }

    /// Converts the entry into a mutable reference to the value with the
    /// lifetime of the underlying borrow.
    pub fn into_mut(self) -> &'a mut V {
        // SAFETY: See the invariant on the struct.
        unsafe { &mut (*self.table.bucket_at(self.slot)).assume_init_mut().value }
    }

    /// Replaces the value and returns the old one.
    pub fn insert(&mut self, value: V) -> V {
        core::mem::replace(self.get_mut(), value)
    }

    /// Removes the entry from the table and returns the key and value.
    pub fn remove(self) -> (K, V) {
        self.table.populated -= 1;

        // SAFETY: See the invariant on the struct. Clearing the control byte
        // before the read hands ownership of the contents to the caller.
        unsafe {
            *self.table.ctrl_at(self.slot) = EMPTY;
            let bucket = (*self.table.bucket_at(self.slot)).assume_init_read();
            (bucket.key, bucket.value)
        }
    }
}

/// An iterator over the entries of a [`HashTable`].
///
/// Created by [`HashTable::iter`]. Yields `(&K, &V)` pairs in physical slot
/// order, walking the control region one group at a time.
pub struct Iter<'a, K, V> {
    table: &'a HashTable<K, V>,
    base: usize,
    mask: u32,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: `base` is always a group base below capacity, `mask` bits
        // mark occupied slots of that group, and occupied slots hold
        // initialized buckets. The shared borrow on the table keeps the
        // buffer alive and unmodified.
        unsafe {
            while self.mask == 0 {
                if self.base >= self.table.capacity() - GROUP_WIDTH {
                    return None;
                }
                self.base += GROUP_WIDTH;
                self.mask = group_occupied(self.table.ctrl_at(self.base));
            }

            let slot = self.base + self.mask.trailing_zeros() as usize;
            self.mask &= self.mask - 1;

            let bucket = (*self.table.bucket_at(slot)).assume_init_ref();
            Some((&bucket.key, &bucket.value))
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use core::hash::Hasher;
    use std::cell::Cell as StdCell;
    use std::collections::HashMap as StdHashMap;
    use std::rc::Rc;

    use rand::TryRngCore;
    use rand::rngs::OsRng;
    use siphasher::sip::SipHasher;

    use super::*;

    struct HashState {
        k0: u64,
        k1: u64,
    }

    impl HashState {
        fn default() -> Self {
            let mut rng = OsRng;
            Self {
                k0: rng.try_next_u64().unwrap(),
                k1: rng.try_next_u64().unwrap(),
            }
        }

        fn hash_u64(&self, key: u64) -> u64 {
            let mut h = SipHasher::new_with_keys(self.k0, self.k1);
            h.write_u64(key);
            h.finish()
        }

        fn hash_str(&self, key: &str) -> u64 {
            let mut h = SipHasher::new_with_keys(self.k0, self.k1);
            h.write(key.as_bytes());
            h.finish()
        }
    }

    fn check_invariants<K: Eq, V>(table: &HashTable<K, V>) {
        assert!(table.capacity().is_power_of_two());
        assert!(table.capacity() >= MIN_CAPACITY);

        let mut occupied = 0;
        for slot in 0..table.capacity() {
            let ctrl = unsafe { *table.ctrl_at(slot) };
            if ctrl == EMPTY {
                continue;
            }
            occupied += 1;
            assert!(ctrl >= 0, "control byte out of encoding range");

            let bucket = unsafe { (*table.bucket_at(slot)).assume_init_ref() };
            assert_eq!(ctrl, fingerprint(bucket.hash));
            assert_eq!(slot / GROUP_WIDTH, bucket.hash as usize & table.group_mask);
        }
        assert_eq!(occupied, table.len());
    }

    #[test]
    fn empty_construction() {
        let table: HashTable<u64, u64> = HashTable::with_capacity(0);
        assert_eq!(table.capacity(), 32);
        assert_eq!(table.len(), 0);
        assert!(table.is_empty());

        let state = HashState::default();
        for k in 0..100u64 {
            assert_eq!(table.find(state.hash_u64(k), &k), None);
        }
        check_invariants(&table);
    }

    #[test]
    fn capacity_rounding() {
        for (requested, expected) in [
            (0, 32),
            (1, 32),
            (32, 32),
            (33, 64),
            (64, 64),
            (65, 128),
            (100, 128),
            (1024, 1024),
            (1025, 2048),
        ] {
            let table: HashTable<u64, u64> = HashTable::with_capacity(requested);
            assert_eq!(table.capacity(), expected, "requested {requested}");
        }
    }

    #[test]
    fn insert_and_find() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);

        for k in 0..1000u64 {
            assert_eq!(table.insert(state.hash_u64(k), k, k), None);
            assert_eq!(table.find(state.hash_u64(k), &k), Some(&k), "{table:#?}");
        }

        assert_eq!(table.len(), 1000);
        for k in 0..1000u64 {
            assert_eq!(table.find(state.hash_u64(k), &k), Some(&k));
        }
        assert_eq!(table.find(state.hash_u64(5000), &5000), None);
        check_invariants(&table);
    }

    #[test]
    fn insert_overwrites_record() {
        let state = HashState::default();
        let mut table: HashTable<u64, String> = HashTable::with_capacity(0);
        let hash = state.hash_u64(7);

        assert_eq!(table.insert(hash, 7, "first".to_string()), None);
        assert_eq!(
            table.insert(hash, 7, "second".to_string()),
            Some("first".to_string())
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(hash, &7), Some(&"second".to_string()));
        check_invariants(&table);
    }

    #[test]
    fn remove_roundtrip() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);

        let hash = state.hash_u64(1);
        table.insert(hash, 1, 2);
        assert_eq!(table.find(hash, &1), Some(&2));
        assert_eq!(table.len(), 1);

        assert_eq!(table.remove(hash, &1), Some((1, 2)));
        assert_eq!(table.find(hash, &1), None);
        assert_eq!(table.len(), 0);

        // Removing an absent key is a no-op.
        assert_eq!(table.remove(hash, &1), None);
        assert_eq!(table.len(), 0);
        check_invariants(&table);
    }

    #[test]
    fn remove_then_reinsert_restores_count() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);

        for k in 0..50u64 {
            table.insert(state.hash_u64(k), k, k);
        }
        let before = table.len();

        let hash = state.hash_u64(25);
        assert!(table.remove(hash, &25).is_some());
        assert_eq!(table.len(), before - 1);
        assert_eq!(table.insert(hash, 25, 99), None);
        assert_eq!(table.len(), before);
        assert_eq!(table.find(hash, &25), Some(&99));
        check_invariants(&table);
    }

    #[test]
    fn lookup_is_pure() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);
        let hash = state.hash_u64(3);
        table.insert(hash, 3, 30);

        assert_eq!(table.find(hash, &3), table.find(hash, &3));
        let miss = state.hash_u64(4);
        assert_eq!(table.find(miss, &4), table.find(miss, &4));
    }

    #[test]
    fn group_saturation_triggers_growth() {
        // Hashes share their low bits, so every key lands in the same group
        // until growth splits them apart by progressively higher bits. The
        // fingerprints collide too (all zero), exercising the key-equality
        // resolution of false positives.
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);

        for i in 0..200u64 {
            let hash = (i << 5) | 3;
            assert_eq!(table.insert(hash, i, i), None);
        }

        assert_eq!(table.len(), 200);
        assert!(table.capacity() > 32);
        for i in 0..200u64 {
            let hash = (i << 5) | 3;
            assert_eq!(table.find(hash, &i), Some(&i), "{table:#?}");
        }
        check_invariants(&table);
    }

    #[test]
    fn saturation_growth_without_fingerprint_collisions() {
        // Same group, distinct fingerprints.
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);

        for i in 0..100u64 {
            let hash = (i << 57) | (i << 5);
            assert_eq!(table.insert(hash, i, i * 10), None);
        }

        assert_eq!(table.len(), 100);
        for i in 0..100u64 {
            let hash = (i << 57) | (i << 5);
            assert_eq!(table.find(hash, &i), Some(&(i * 10)));
        }
        check_invariants(&table);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn growth_is_monotonic_and_preserves_entries() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);

        let mut last_capacity = table.capacity();
        for k in 0..(1u64 << 16) {
            table.insert(state.hash_u64(k), k, !k);
            assert!(table.capacity() >= last_capacity);
            last_capacity = table.capacity();
        }

        assert_eq!(table.len(), 1 << 16);
        for k in 0..(1u64 << 16) {
            assert_eq!(table.find(state.hash_u64(k), &k), Some(&!k));
        }
        check_invariants(&table);
    }

    #[test]
    fn randomized_against_reference_map() {
        let state = HashState::default();
        let mut rng = OsRng;
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);
        let mut reference: StdHashMap<u64, u64> = StdHashMap::new();

        for _ in 0..1000 {
            let k = rng.try_next_u64().unwrap() % 64;
            let v = rng.try_next_u64().unwrap();
            let hash = state.hash_u64(k);

            let current = table.find(hash, &k).copied().unwrap_or(0);
            let updated = current ^ v;
            table.insert(hash, k, updated);
            *reference.entry(k).or_insert(0) ^= v;

            assert_eq!(reference.get(&k), Some(&updated));
        }

        assert_eq!(table.len(), reference.len());
        let mut collected: Vec<(u64, u64)> = table.iter().map(|(k, v)| (*k, *v)).collect();
        collected.sort_unstable();
        let mut expected: Vec<(u64, u64)> = reference.iter().map(|(k, v)| (*k, *v)).collect();
        expected.sort_unstable();
        assert_eq!(collected, expected);
        check_invariants(&table);
    }

    #[test]
    fn shared_buffer_forks_on_insert() {
        let state = HashState::default();
        let mut a: HashTable<u64, u64> = HashTable::with_capacity(0);
        for k in 0..100u64 {
            a.insert(state.hash_u64(k), k, k);
        }

        let mut b = a.clone();
        assert_eq!(b.len(), a.len());

        let hash = state.hash_u64(500);
        b.insert(hash, 500, 500);

        assert_eq!(a.find(hash, &500), None);
        assert_eq!(b.find(hash, &500), Some(&500));
        assert_eq!(a.len(), 100);
        assert_eq!(b.len(), 101);

        for k in 0..100u64 {
            assert_eq!(a.find(state.hash_u64(k), &k), Some(&k));
            assert_eq!(b.find(state.hash_u64(k), &k), Some(&k));
        }
        check_invariants(&a);
        check_invariants(&b);
    }

    #[test]
    fn shared_buffer_forks_on_overwrite_and_remove() {
        let state = HashState::default();
        let mut a: HashTable<u64, u64> = HashTable::with_capacity(0);
        for k in 0..20u64 {
            a.insert(state.hash_u64(k), k, k);
        }

        let mut b = a.clone();
        let hash = state.hash_u64(3);
        b.insert(hash, 3, 999);
        assert_eq!(a.find(hash, &3), Some(&3));
        assert_eq!(b.find(hash, &3), Some(&999));

        let mut c = a.clone();
        c.remove(hash, &3);
        assert_eq!(a.find(hash, &3), Some(&3));
        assert_eq!(c.find(hash, &3), None);
        assert_eq!(a.len(), 20);
        assert_eq!(c.len(), 19);
    }

    #[test]
    fn shared_buffer_forks_on_find_mut() {
        let state = HashState::default();
        let mut a: HashTable<u64, u64> = HashTable::with_capacity(0);
        let hash = state.hash_u64(1);
        a.insert(hash, 1, 10);

        let mut b = a.clone();
        if let Some(v) = b.find_mut(hash, &1) {
            *v = 20;
        }

        assert_eq!(a.find(hash, &1), Some(&10));
        assert_eq!(b.find(hash, &1), Some(&20));

        // A miss through a shared handle must not fork.
        let mut c = a.clone();
        assert!(c.find_mut(state.hash_u64(2), &2).is_none());
        assert!(c.header().refs.get() > 1);
    }

    #[test]
    fn clear_on_shared_buffer_leaves_other_handles_intact() {
        let state = HashState::default();
        let mut a: HashTable<u64, u64> = HashTable::with_capacity(0);
        for k in 0..10u64 {
            a.insert(state.hash_u64(k), k, k);
        }

        let mut b = a.clone();
        b.clear();
        assert!(b.is_empty());
        assert_eq!(a.len(), 10);
        for k in 0..10u64 {
            assert_eq!(a.find(state.hash_u64(k), &k), Some(&k));
        }
    }

    #[test]
    fn clear_unique_keeps_capacity_and_allows_reuse() {
        let state = HashState::default();
        let mut table: HashTable<u64, String> = HashTable::with_capacity(100);
        for k in 0..50u64 {
            table.insert(state.hash_u64(k), k, k.to_string());
        }

        let capacity = table.capacity();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.capacity(), capacity);

        table.insert(state.hash_u64(1), 1, "again".to_string());
        assert_eq!(
            table.find(state.hash_u64(1), &1),
            Some(&"again".to_string())
        );
        check_invariants(&table);
    }

    #[test]
    fn reserve_grows_once() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);
        table.insert(state.hash_u64(1), 1, 1);

        table.reserve(1000);
        assert!(table.capacity() >= 1001);
        let capacity = table.capacity();

        table.reserve(500);
        assert_eq!(table.capacity(), capacity);
        assert_eq!(table.find(state.hash_u64(1), &1), Some(&1));
        check_invariants(&table);
    }

    #[test]
    fn iteration_visits_each_entry_once() {
        let state = HashState::default();
        let mut table: HashTable<u64, u64> = HashTable::with_capacity(0);
        for k in 0..57u64 {
            table.insert(state.hash_u64(k), k, k * 2);
        }

        let mut seen: Vec<u64> = table.iter().map(|(k, _)| *k).collect();
        assert_eq!(seen.len(), 57);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 57);

        for (k, v) in table.iter() {
            assert_eq!(*v, *k * 2);
        }
    }

    #[test]
    fn iteration_over_empty_table() {
        let table: HashTable<u64, u64> = HashTable::with_capacity(0);
        assert_eq!(table.iter().count(), 0);

        let big: HashTable<u64, u64> = HashTable::with_capacity(1024);
        assert_eq!(big.iter().count(), 0);
    }

    #[test]
    fn entry_api() {
        let state = HashState::default();
        let mut table: HashTable<u64, String> = HashTable::with_capacity(0);
        let hash = state.hash_u64(1);

        match table.entry(hash, 1) {
            Entry::Vacant(entry) => {
                assert_eq!(entry.key(), &1);
                entry.insert("one".to_string());
            }
            Entry::Occupied(_) => panic!("expected vacant entry"),
        }
        assert_eq!(table.len(), 1);

        match table.entry(hash, 1) {
            Entry::Occupied(mut entry) => {
                assert_eq!(entry.key(), &1);
                assert_eq!(entry.get(), &"one".to_string());
                let old = entry.insert("uno".to_string());
                assert_eq!(old, "one".to_string());
            }
            Entry::Vacant(_) => panic!("expected occupied entry: {table:#?}"),
        }
        assert_eq!(table.find(hash, &1), Some(&"uno".to_string()));

        let value = table.entry(hash, 1).or_insert("ignored".to_string());
        assert_eq!(value, &"uno".to_string());

        table
            .entry(state.hash_u64(2), 2)
            .and_modify(|_| panic!("vacant entries are not modified"))
            .or_insert("two".to_string());
        assert_eq!(table.find(state.hash_u64(2), &2), Some(&"two".to_string()));

        match table.entry(hash, 1) {
            Entry::Occupied(entry) => {
                let (key, value) = entry.remove();
                assert_eq!(key, 1);
                assert_eq!(value, "uno".to_string());
            }
            Entry::Vacant(_) => panic!("expected occupied entry"),
        }
        assert_eq!(table.find(hash, &1), None);
        assert_eq!(table.len(), 1);
        check_invariants(&table);
    }

    #[test]
    fn entry_vacant_into_key() {
        let state = HashState::default();
        let mut table: HashTable<String, u64> = HashTable::with_capacity(0);
        let hash = state.hash_str("key");

        match table.entry(hash, "key".to_string()) {
            Entry::Vacant(entry) => {
                assert_eq!(entry.into_key(), "key".to_string());
            }
            Entry::Occupied(_) => panic!("expected vacant entry"),
        }
        assert!(table.is_empty());
    }

    /// Value whose clones and drops are tallied, for checking that forks
    /// clone exactly the live entries and nothing leaks or double-drops.
    struct Tracked {
        live: Rc<StdCell<isize>>,
    }

    impl Tracked {
        fn new(live: &Rc<StdCell<isize>>) -> Self {
            live.set(live.get() + 1);
            Tracked { live: live.clone() }
        }
    }

    impl Clone for Tracked {
        fn clone(&self) -> Self {
            self.live.set(self.live.get() + 1);
            Tracked {
                live: self.live.clone(),
            }
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.live.set(self.live.get() - 1);
        }
    }

    #[test]
    fn no_leaks_or_double_drops_across_fork_and_drop() {
        let state = HashState::default();
        let live = Rc::new(StdCell::new(0isize));

        {
            let mut a: HashTable<u64, Tracked> = HashTable::with_capacity(0);
            for k in 0..100u64 {
                a.insert(state.hash_u64(k), k, Tracked::new(&live));
            }
            assert_eq!(live.get(), 100);

            let mut b = a.clone();
            assert_eq!(live.get(), 100);

            // Forces a fork, cloning all 100 values.
            b.insert(state.hash_u64(500), 500, Tracked::new(&live));
            assert_eq!(live.get(), 201);

            // Overwrite drops the replaced value.
            a.insert(state.hash_u64(0), 0, Tracked::new(&live));
            assert_eq!(live.get(), 201);

            // Remove hands the value to the caller; dropping it is on us.
            let removed = b.remove(state.hash_u64(1), &1);
            assert!(removed.is_some());
            drop(removed);
            assert_eq!(live.get(), 200);

            a.clear();
            assert_eq!(live.get(), 100);
        }

        assert_eq!(live.get(), 0);
    }

    #[test]
    fn drop_runs_for_growth_survivors() {
        let state = HashState::default();
        let live = Rc::new(StdCell::new(0isize));

        {
            let mut table: HashTable<u64, Tracked> = HashTable::with_capacity(0);
            // Enough entries to force several rehashes.
            for k in 0..500u64 {
                table.insert(state.hash_u64(k), k, Tracked::new(&live));
            }
            assert_eq!(live.get(), 500);
        }

        assert_eq!(live.get(), 0);
    }

    #[test]
    fn string_keys() {
        let state = HashState::default();
        let mut table: HashTable<String, i32> = HashTable::with_capacity(0);
        let keys = ["hello", "world", "foo", "bar", "baz"];

        for (i, k) in keys.iter().enumerate() {
            let hash = state.hash_str(k);
            assert_eq!(table.insert(hash, k.to_string(), i as i32), None);
        }

        assert_eq!(table.len(), keys.len());
        for (i, k) in keys.iter().enumerate() {
            let hash = state.hash_str(k);
            assert_eq!(table.find(hash, &k.to_string()), Some(&(i as i32)));
        }

        let miss = state.hash_str("missing");
        assert_eq!(table.find(miss, &"missing".to_string()), None);
        check_invariants(&table);
    }
}
