//! Randomized soundness checks for the range lattice: whatever two
//! int32 values do, the result of the abstract transfer function must
//! contain the concrete result.

use vesper_jit::Range;

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) as u32
    }

    fn int32(&mut self) -> i32 {
        // Mix small values with full-width ones so overflow paths get hit.
        match self.next() % 4 {
            0 => (self.next() % 100) as i32 - 50,
            1 => i32::MIN + (self.next() % 3) as i32,
            2 => i32::MAX - (self.next() % 3) as i32,
            _ => self.next() as i32,
        }
    }

    /// A random range plus a value it contains.
    fn range_and_value(&mut self) -> (Range, i32) {
        let a = self.int32();
        let b = self.int32();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        // The span can be the full 2^32-wide int32 domain, so it only fits
        // in 64 bits.
        let span = (hi as i64 - lo as i64 + 1) as u64;
        let offset = (((self.next() as u64) << 31) | self.next() as u64) % span;
        let value = lo.wrapping_add(offset as i32);
        (Range::new(lo as i64, hi as i64), value)
    }
}

fn contains(r: &Range, v: i64) -> bool {
    (r.lower_infinite() || v >= r.lower() as i64)
        && (r.upper_infinite() || v <= r.upper() as i64)
}

#[test]
fn sampling_covers_the_full_int32_domain() {
    let mut rng = Lcg(7);
    let mut saw_full = false;
    for _ in 0..10_000 {
        let (r, v) = rng.range_and_value();
        assert!(contains(&r, v as i64));
        saw_full |= r.lower() == i32::MIN && r.upper() == i32::MAX;
    }
    // The generator must actually reach the widest range, where the span
    // does not fit in 32 bits.
    assert!(saw_full);
}

#[test]
fn arithmetic_transfer_functions_are_sound() {
    let mut rng = Lcg(0x5eed);
    for _ in 0..2000 {
        let (lr, lv) = rng.range_and_value();
        let (rr, rv) = rng.range_and_value();
        let lv = lv as i64;
        let rv = rv as i64;

        let sum = Range::add(&lr, &rr);
        assert!(contains(&sum, lv + rv), "{lr} + {rr} lost {lv} + {rv}");

        let diff = Range::sub(&lr, &rr);
        assert!(contains(&diff, lv - rv), "{lr} - {rr} lost {lv} - {rv}");

        let prod = Range::mul(&lr, &rr);
        assert!(contains(&prod, lv * rv), "{lr} * {rr} lost {lv} * {rv}");

        let band = Range::and(&lr, &rr);
        assert!(
            contains(&band, (lv as i32 & rv as i32) as i64),
            "{lr} & {rr} lost {lv} & {rv}"
        );
    }
}

#[test]
fn intersection_keeps_common_values() {
    let mut rng = Lcg(0xfeed);
    for _ in 0..2000 {
        let (lr, lv) = rng.range_and_value();
        let (rr, _) = rng.range_and_value();
        if !contains(&rr, lv as i64) {
            continue;
        }
        let (met, emptied) = lr.intersect(&rr);
        assert!(!emptied, "{lr} and {rr} share {lv} but claimed disjoint");
        assert!(contains(&met, lv as i64), "{lr} meet {rr} lost {lv}");
    }
}

#[test]
fn union_covers_both_sides() {
    let mut rng = Lcg(0xabcd);
    for _ in 0..2000 {
        let (lr, lv) = rng.range_and_value();
        let (rr, rv) = rng.range_and_value();
        let mut joined = lr;
        joined.union_with(&rr);
        assert!(contains(&joined, lv as i64));
        assert!(contains(&joined, rv as i64));
    }
}

#[test]
fn shifts_stay_inside_the_computed_range() {
    let mut rng = Lcg(0x1234);
    for _ in 0..2000 {
        let (r, v) = rng.range_and_value();
        let shift = (rng.next() % 32) as i32;
        assert!(contains(&Range::shl(&r, shift), (v << (shift & 31)) as i64));
        assert!(contains(&Range::shr(&r, shift), (v >> (shift & 31)) as i64));
    }
}
