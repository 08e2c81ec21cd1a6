//! 64-bit register values with inclusive bit-range accessors.

/// A 64-bit hardware register value.
///
/// `lo`/`hi` are always inclusive and `lo <= hi <= 63`; callers own that
/// invariant, the same way the CMN register maps are hand-transcribed from
/// the TRM rather than derived at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Register(pub u64);

impl Register {
    pub fn new(v: u64) -> Self {
        Register(v)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    pub fn bits(&self, lo: u32, hi: u32) -> u64 {
        debug_assert!(lo <= hi && hi <= 63);
        let width = hi - lo + 1;
        let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
        (self.0 >> lo) & mask
    }

    pub fn set_bits(&mut self, lo: u32, hi: u32, v: u64) {
        debug_assert!(lo <= hi && hi <= 63);
        let width = hi - lo + 1;
        let mask = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
        debug_assert!(v <= mask, "value {v} does not fit bits {lo}..{hi}");
        self.0 = (self.0 & !(mask << lo)) | ((v & mask) << lo);
    }

    pub fn with_bits(mut self, lo: u32, hi: u32, v: u64) -> Self {
        self.set_bits(lo, hi, v);
        self
    }

    pub fn bit(&self, n: u32) -> bool {
        self.bits(n, n) != 0
    }

    pub fn set_bit(&mut self, n: u32, v: bool) {
        self.set_bits(n, n, v as u64);
    }
}

impl From<u64> for Register {
    fn from(v: u64) -> Self {
        Register(v)
    }
}

impl From<Register> for u64 {
    fn from(r: Register) -> Self {
        r.0
    }
}

/// Computes `ceil(log2(n))` for `n >= 1`, used to derive the XP coordinate
/// shift from the mesh's X/Y dimensions.
pub fn ceil_log2(n: u32) -> u32 {
    debug_assert!(n >= 1);
    if n <= 1 {
        0
    } else {
        32 - (n - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_range_round_trip() {
        for &(lo, hi) in &[(0u32, 0u32), (0, 63), (16, 31), (5, 5), (62, 63)] {
            let width = hi - lo + 1;
            let max = if width == 64 { u64::MAX } else { (1u64 << width) - 1 };
            let samples: Vec<u64> = if width >= 8 {
                vec![0, 1, max / 2, max]
            } else {
                (0..=max).collect()
            };
            for v in samples {
                let mut r = Register::new(0xAAAA_AAAA_AAAA_AAAA);
                let before = r.get();
                r.set_bits(lo, hi, v);
                assert_eq!(r.bits(lo, hi), v, "lo={lo} hi={hi} v={v}");
                let mask = max << lo;
                assert_eq!(before & !mask, r.get() & !mask, "untouched bits changed");
            }
        }
    }

    #[test]
    fn ceil_log2_matches_expected() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(16), 4);
    }
}
