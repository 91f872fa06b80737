//! Hash-chain LZ77 match finder shared by both compressors.
//!
//! A 3-byte rolling hash indexes chain heads; each position links to the
//! previous position with the same hash. Greedy search walks the chain a
//! bounded number of steps and keeps the longest match. Chunks are at most
//! 32,768 bytes, so positions fit in `u16`-sized tables comfortably; `i32`
//! is used with −1 as the empty sentinel.

const HASH_BITS: u32 = 13;
const HASH_SIZE: usize = 1 << HASH_BITS;
const NO_POS: i32 = -1;

/// How many chain links to inspect per position. Bounds worst-case
/// compression time on degenerate input.
const MAX_CHAIN: usize = 64;

pub const MIN_MATCH: usize = 3;

#[inline]
fn hash3(data: &[u8], pos: usize) -> usize {
    let v = u32::from(data[pos])
        | u32::from(data[pos + 1]) << 8
        | u32::from(data[pos + 2]) << 16;
    (v.wrapping_mul(0x9E37_79B1) >> (32 - HASH_BITS)) as usize
}

pub struct MatchFinder {
    head: Vec<i32>,
    prev: Vec<i32>,
}

impl MatchFinder {
    pub fn new(len: usize) -> Self {
        Self {
            head: vec![NO_POS; HASH_SIZE],
            prev: vec![NO_POS; len],
        }
    }

    /// Record `pos` so later positions can match against it.
    #[inline]
    pub fn insert(&mut self, data: &[u8], pos: usize) {
        if pos + MIN_MATCH > data.len() {
            return;
        }
        let h = hash3(data, pos);
        self.prev[pos] = self.head[h];
        self.head[h] = pos as i32;
    }

    /// Longest match at `pos` against earlier positions, bounded by
    /// `max_len` and `max_dist`. Returns `(length, distance)`.
    pub fn longest_match(
        &self,
        data: &[u8],
        pos: usize,
        max_len: usize,
        max_dist: usize,
    ) -> Option<(usize, usize)> {
        if pos + MIN_MATCH > data.len() {
            return None;
        }
        let max_len = max_len.min(data.len() - pos);
        let mut best_len = MIN_MATCH - 1;
        let mut best_dist = 0usize;

        let mut cand = self.head[hash3(data, pos)];
        let mut chain = MAX_CHAIN;
        while cand != NO_POS && chain > 0 {
            let cpos = cand as usize;
            debug_assert!(cpos < pos);
            let dist = pos - cpos;
            if dist > max_dist {
                break; // chains are position-ordered; older links only get farther
            }
            // Cheap tail check before the full compare.
            if data[cpos + best_len.min(max_len - 1)] == data[pos + best_len.min(max_len - 1)] {
                let len = common_prefix(data, cpos, pos, max_len);
                if len > best_len {
                    best_len = len;
                    best_dist = dist;
                    if len == max_len {
                        break;
                    }
                }
            }
            cand = self.prev[cpos];
            chain -= 1;
        }

        if best_len >= MIN_MATCH {
            Some((best_len, best_dist))
        } else {
            None
        }
    }
}

/// Length of the common prefix of `data[a..]` and `data[b..]`, capped.
#[inline]
pub fn common_prefix(data: &[u8], a: usize, b: usize, cap: usize) -> usize {
    let cap = cap.min(data.len() - b);
    let mut n = 0;
    while n < cap && data[a + n] == data[b + n] {
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_repeats() {
        let data = b"abcdefabcdefabcdef";
        let mut mf = MatchFinder::new(data.len());
        for p in 0..6 {
            mf.insert(data, p);
        }
        let (len, dist) = mf.longest_match(data, 6, 257, 32768).unwrap();
        assert_eq!(dist, 6);
        assert_eq!(len, 12);
    }

    #[test]
    fn respects_distance_cap() {
        let data = b"xyz....................xyz";
        let mut mf = MatchFinder::new(data.len());
        for p in 0..23 {
            mf.insert(data, p);
        }
        assert!(mf.longest_match(data, 23, 257, 8).is_none());
        assert!(mf.longest_match(data, 23, 257, 23).is_some());
    }

    #[test]
    fn no_match_in_unique_data() {
        let data: Vec<u8> = (0u16..256).map(|i| i as u8).collect();
        let mut mf = MatchFinder::new(data.len());
        for p in 0..100 {
            mf.insert(&data, p);
        }
        assert!(mf.longest_match(&data, 100, 257, 32768).is_none());
    }
}
