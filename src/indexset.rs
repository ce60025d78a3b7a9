/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Index sets: sets of integers that represent indices into a space.
//!
//! Rather than a dense bitvector, this is a chunked adaptive-sparse data
//! structure: small sets live in a fixed inline array of 64-bit chunks, and
//! sets that outgrow it spill into a hash map keyed by chunk number.

use fxhash::FxHashMap;

const BITS_PER_CHUNK: usize = 64;
const SMALL_ELEMS: usize = 12;

const INVALID: u32 = 0xffff_ffff;

/// A hybrid large/small-mode sparse mapping from chunk indices to 64-bit
/// chunks of set bits.
#[derive(Clone, Debug)]
enum AdaptiveMap {
    Small {
        len: u32,
        keys: [u32; SMALL_ELEMS],
        values: [u64; SMALL_ELEMS],
    },
    Large(FxHashMap<u32, u64>),
}

impl AdaptiveMap {
    fn new() -> Self {
        Self::Small {
            len: 0,
            keys: [INVALID; SMALL_ELEMS],
            values: [0; SMALL_ELEMS],
        }
    }

    #[inline(never)]
    fn expand(&mut self) {
        if let Self::Small { len, keys, values } = self {
            let mut map = FxHashMap::default();
            for i in 0..*len as usize {
                map.insert(keys[i], values[i]);
            }
            *self = Self::Large(map);
        }
    }

    #[inline(always)]
    fn get_or_insert(&mut self, key: u32) -> &mut u64 {
        let needs_expand = match self {
            Self::Small { len, keys, .. } => {
                *len as usize == SMALL_ELEMS && !keys.contains(&key)
            }
            Self::Large(..) => false,
        };
        if needs_expand {
            self.expand();
        }

        match self {
            Self::Small { len, keys, values } => {
                if let Some(i) = keys[..*len as usize].iter().position(|&k| k == key) {
                    &mut values[i]
                } else {
                    let i = *len as usize;
                    debug_assert!(i < SMALL_ELEMS);
                    *len += 1;
                    keys[i] = key;
                    values[i] = 0;
                    &mut values[i]
                }
            }
            Self::Large(map) => map.entry(key).or_insert(0),
        }
    }

    #[inline(always)]
    fn get(&self, key: u32) -> Option<u64> {
        match self {
            Self::Small { len, keys, values } => keys[..*len as usize]
                .iter()
                .position(|&k| k == key)
                .map(|i| values[i]),
            Self::Large(map) => map.get(&key).copied(),
        }
    }

    fn iter(&self) -> AdaptiveMapIter<'_> {
        match self {
            Self::Small { len, keys, values } => {
                let len = *len as usize;
                AdaptiveMapIter::Small(&keys[..len], &values[..len])
            }
            Self::Large(map) => AdaptiveMapIter::Large(map.iter()),
        }
    }
}

enum AdaptiveMapIter<'a> {
    Small(&'a [u32], &'a [u64]),
    Large(std::collections::hash_map::Iter<'a, u32, u64>),
}

impl<'a> Iterator for AdaptiveMapIter<'a> {
    type Item = (u32, u64);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Small(keys, values) => {
                if keys.is_empty() {
                    None
                } else {
                    let (k, v) = ((*keys)[0], (*values)[0]);
                    *keys = &(*keys)[1..];
                    *values = &(*values)[1..];
                    Some((k, v))
                }
            }
            Self::Large(iter) => iter.next().map(|(&k, &v)| (k, v)),
        }
    }
}

/// A conceptually infinite-length set of indices.
#[derive(Clone, Debug)]
pub struct IndexSet {
    elems: AdaptiveMap,
}

impl IndexSet {
    pub fn new() -> Self {
        Self {
            elems: AdaptiveMap::new(),
        }
    }

    #[inline(always)]
    fn elem(&mut self, bit_index: usize) -> &mut u64 {
        let chunk = (bit_index / BITS_PER_CHUNK) as u32;
        self.elems.get_or_insert(chunk)
    }

    pub fn add(&mut self, idx: usize) {
        let bit = idx % BITS_PER_CHUNK;
        *self.elem(idx) |= 1u64 << bit;
    }

    pub fn contains(&self, idx: usize) -> bool {
        let chunk = (idx / BITS_PER_CHUNK) as u32;
        let bit = idx % BITS_PER_CHUNK;
        match self.elems.get(chunk) {
            Some(chunk) => chunk & (1u64 << bit) != 0,
            None => false,
        }
    }

    pub fn union_with(&mut self, other: &Self) {
        for (chunk, bits) in other.elems.iter() {
            *self.elems.get_or_insert(chunk) |= bits;
        }
    }

    /// Iterate over set bit indices. Order is arbitrary once the set has
    /// outgrown its inline storage.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.elems.iter().flat_map(|(chunk, bits)| {
            let base = chunk as usize * BITS_PER_CHUNK;
            SetBitsIter(bits).map(move |i| base + i)
        })
    }
}

impl Default for IndexSet {
    fn default() -> Self {
        Self::new()
    }
}

struct SetBitsIter(u64);

impl Iterator for SetBitsIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            let bit_idx = self.0.trailing_zeros() as usize;
            self.0 &= self.0 - 1;
            Some(bit_idx)
        }
    }
}

#[cfg(test)]
mod test {
    use super::IndexSet;

    #[test]
    fn test_add_contains() {
        let mut s = IndexSet::new();
        assert!(!s.contains(0));
        s.add(3);
        s.add(64);
        s.add(197);
        assert!(s.contains(3));
        assert!(s.contains(64));
        assert!(s.contains(197));
        assert!(!s.contains(4));
        assert!(!s.contains(196));
        let mut elems: Vec<usize> = s.iter().collect();
        elems.sort_unstable();
        assert_eq!(elems, vec![3, 64, 197]);
    }

    #[test]
    fn test_union() {
        let mut a = IndexSet::new();
        let mut b = IndexSet::new();
        a.add(1);
        b.add(1);
        b.add(70);
        a.union_with(&b);
        assert!(a.contains(1));
        assert!(a.contains(70));
        assert!(!a.contains(2));
    }

    #[test]
    fn test_expand_past_inline_storage() {
        let mut s = IndexSet::new();
        // Touch enough distinct chunks to force large mode.
        for i in 0..32 {
            s.add(i * 64);
        }
        for i in 0..32 {
            assert!(s.contains(i * 64));
            assert!(!s.contains(i * 64 + 1));
        }
        assert_eq!(s.iter().count(), 32);
    }
}
