//! A small fixed-size bitmap used for `mp_bitmap`, `ionode_bitmap` and the
//! per-midplane compute-node bitmaps (spec.md §3). Backed by `u64` words
//! rather than `Vec<bool>` so that persistence (spec.md §4.9) can emit it
//! compactly and overlap/intersection checks are cheap.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bitmap {
    bits: Vec<u64>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u64; len.div_ceil(64).max(1)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        (self.bits[i / 64] >> (i % 64)) & 1 != 0
    }

    pub fn set(&mut self, i: usize, v: bool) {
        debug_assert!(i < self.len);
        let word = &mut self.bits[i / 64];
        if v {
            *word |= 1 << (i % 64);
        } else {
            *word &= !(1 << (i % 64));
        }
    }

    pub fn set_range(&mut self, start: usize, count: usize, v: bool) {
        for i in start..start + count {
            self.set(i, v);
        }
    }

    pub fn popcount(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_all_clear(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    pub fn intersects(&self, other: &Bitmap) -> bool {
        self.bits
            .iter()
            .zip(&other.bits)
            .any(|(a, b)| a & b != 0)
    }

    pub fn is_subset_of(&self, other: &Bitmap) -> bool {
        self.bits
            .iter()
            .zip(&other.bits)
            .all(|(a, b)| a & !b == 0)
    }

    pub fn union_with(&mut self, other: &Bitmap) {
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a |= b;
        }
    }

    pub fn subtract(&mut self, other: &Bitmap) {
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a &= !b;
        }
    }

    pub fn intersect_with(&mut self, other: &Bitmap) {
        for (a, b) in self.bits.iter_mut().zip(&other.bits) {
            *a &= b;
        }
    }

    /// Count of set bits in `self` that are also set in `other`.
    pub fn popcount_intersection(&self, other: &Bitmap) -> u32 {
        self.bits
            .iter()
            .zip(&other.bits)
            .map(|(a, b)| (a & b).count_ones())
            .sum()
    }

    /// Canonical compact run-length text form used by the snapshot format
    /// (spec.md §4.9): alternating run lengths of clear/set bits starting
    /// with a clear run, separated by `,`. E.g. an 8-bit bitmap `00111100`
    /// is written as `2,4,2`.
    pub fn to_run_length(&self) -> String {
        let mut runs = Vec::new();
        let mut current = false;
        let mut run_len = 0usize;
        for i in 0..self.len {
            let bit = self.get(i);
            if bit == current {
                run_len += 1;
            } else {
                runs.push(run_len);
                current = bit;
                run_len = 1;
            }
        }
        runs.push(run_len);
        runs.iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn from_run_length(len: usize, text: &str) -> Result<Self, String> {
        let mut bm = Bitmap::new(len);
        let mut idx = 0usize;
        let mut set = false;
        if text.is_empty() {
            return Ok(bm);
        }
        for part in text.split(',') {
            let run: usize = part
                .parse()
                .map_err(|_| format!("bad run-length token {part:?}"))?;
            if set {
                bm.set_range(idx, run, true);
            }
            idx += run;
            set = !set;
        }
        if idx != len {
            return Err(format!(
                "run-length total {idx} does not match declared length {len}"
            ));
        }
        Ok(bm)
    }
}

impl fmt::Display for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.len {
            f.write_str(if self.get(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_length_round_trips() {
        let mut bm = Bitmap::new(8);
        bm.set_range(2, 4, true);
        let rl = bm.to_run_length();
        assert_eq!(rl, "2,4,2");
        let back = Bitmap::from_run_length(8, &rl).unwrap();
        assert_eq!(bm, back);
    }

    #[test]
    fn all_clear_run_length() {
        let bm = Bitmap::new(5);
        assert_eq!(bm.to_run_length(), "5");
        assert_eq!(Bitmap::from_run_length(5, "5").unwrap(), bm);
    }

    #[test]
    fn intersects_and_subset() {
        let mut a = Bitmap::new(8);
        a.set_range(0, 4, true);
        let mut b = Bitmap::new(8);
        b.set_range(2, 2, true);
        assert!(a.intersects(&b));
        assert!(b.is_subset_of(&a));
        let mut c = Bitmap::new(8);
        c.set_range(4, 4, true);
        assert!(!a.intersects(&c));
    }
}
