//! Integer range analysis.
//!
//! This module owns the numeric range lattice, the flow-sensitive analysis
//! that annotates every definition with a [`Range`], and the truncation
//! pass that turns overflow-free arithmetic into raw int32 operations.

pub mod analysis;
pub mod truncate;

pub use analysis::{analyze_ranges, LoopIterationBound, SymbolicBound};
pub use truncate::truncate_graph;

use std::fmt;

use crate::ir::ValueId;

pub const MAX_INT32_EXPONENT: u16 = 31;
pub const MAX_DOUBLE_EXPONENT: u16 = 1023;

/// Conservative interval for a numeric value. Bounds are int32; anything
/// outside is tracked as an infinite side plus the magnitude exponent.
/// `decimal` records whether the value may have a fractional part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    lower: i32,
    lower_infinite: bool,
    upper: i32,
    upper_infinite: bool,
    decimal: bool,
    max_exponent: u16,
}

fn exponent_of(x: i64) -> u16 {
    let a = x.unsigned_abs();
    if a == 0 {
        0
    } else {
        (63 - a.leading_zeros()) as u16
    }
}

impl Range {
    pub fn new(lower: i64, upper: i64) -> Range {
        let mut r = Range {
            lower: 0,
            lower_infinite: false,
            upper: 0,
            upper_infinite: false,
            decimal: false,
            max_exponent: 0,
        };
        r.set_lower(lower);
        r.set_upper(upper);
        r.max_exponent = if r.lower_infinite || r.upper_infinite {
            MAX_DOUBLE_EXPONENT
        } else {
            exponent_of(lower.max(i32::MIN as i64)).max(exponent_of(upper.min(i32::MAX as i64)))
        };
        r
    }

    pub fn new_int32() -> Range {
        Range::new(i32::MIN as i64, i32::MAX as i64)
    }

    pub fn singleton(n: i32) -> Range {
        Range::new(n as i64, n as i64)
    }

    /// The range carrying no information at all.
    pub fn infinite() -> Range {
        Range {
            lower: i32::MIN,
            lower_infinite: true,
            upper: i32::MAX,
            upper_infinite: true,
            decimal: true,
            max_exponent: MAX_DOUBLE_EXPONENT,
        }
    }

    pub fn with_decimal(mut self, decimal: bool) -> Range {
        self.decimal = decimal;
        self
    }

    pub fn lower(&self) -> i32 {
        self.lower
    }

    pub fn upper(&self) -> i32 {
        self.upper
    }

    pub fn lower_infinite(&self) -> bool {
        self.lower_infinite
    }

    pub fn upper_infinite(&self) -> bool {
        self.upper_infinite
    }

    pub fn is_decimal(&self) -> bool {
        self.decimal
    }

    pub fn max_exponent(&self) -> u16 {
        self.max_exponent
    }

    pub fn set_lower(&mut self, x: i64) {
        if x > i32::MAX as i64 {
            self.lower = i32::MAX;
            self.lower_infinite = false;
        } else if x < i32::MIN as i64 {
            self.lower = i32::MIN;
            self.lower_infinite = true;
        } else {
            self.lower = x as i32;
            self.lower_infinite = false;
        }
    }

    pub fn set_upper(&mut self, x: i64) {
        if x > i32::MAX as i64 {
            self.upper = i32::MAX;
            self.upper_infinite = true;
        } else if x < i32::MIN as i64 {
            self.upper = i32::MIN;
            self.upper_infinite = false;
        } else {
            self.upper = x as i32;
            self.upper_infinite = false;
        }
    }

    /// Both bounds proven inside int32.
    pub fn is_int32(&self) -> bool {
        !self.lower_infinite && !self.upper_infinite
    }

    pub fn is_singleton(&self) -> bool {
        self.is_int32() && self.lower == self.upper
    }

    pub fn can_be_zero(&self) -> bool {
        (self.lower_infinite || self.lower <= 0) && (self.upper_infinite || self.upper >= 0)
    }

    pub fn can_be_negative(&self) -> bool {
        self.lower_infinite || self.lower < 0
    }

    pub fn can_be_positive(&self) -> bool {
        self.upper_infinite || self.upper > 0
    }

    /// Intersection of two facts about the same value. Disjoint inputs
    /// mean the branch cannot actually be taken at runtime with a numeric
    /// value; rather than model unreachability the result widens to the
    /// unknown range, and `emptied` tells the caller.
    pub fn intersect(&self, other: &Range) -> (Range, bool) {
        let lower_infinite = self.lower_infinite && other.lower_infinite;
        let upper_infinite = self.upper_infinite && other.upper_infinite;
        let lower = if self.lower_infinite {
            other.lower
        } else if other.lower_infinite {
            self.lower
        } else {
            self.lower.max(other.lower)
        };
        let upper = if self.upper_infinite {
            other.upper
        } else if other.upper_infinite {
            self.upper
        } else {
            self.upper.min(other.upper)
        };
        if !lower_infinite && !upper_infinite && upper < lower {
            return (Range::infinite(), true);
        }
        let r = Range {
            lower,
            lower_infinite,
            upper,
            upper_infinite,
            decimal: self.decimal && other.decimal,
            max_exponent: self.max_exponent.min(other.max_exponent),
        };
        (r, false)
    }

    pub fn union_with(&mut self, other: &Range) {
        self.lower_infinite |= other.lower_infinite;
        self.upper_infinite |= other.upper_infinite;
        self.lower = self.lower.min(other.lower);
        self.upper = self.upper.max(other.upper);
        self.decimal |= other.decimal;
        self.max_exponent = self.max_exponent.max(other.max_exponent);
    }

    fn finite_bounds(&self) -> (i64, i64) {
        let lower = if self.lower_infinite { i64::MIN } else { self.lower as i64 };
        let upper = if self.upper_infinite { i64::MAX } else { self.upper as i64 };
        (lower, upper)
    }

    pub fn add(lhs: &Range, rhs: &Range) -> Range {
        if !lhs.is_int32() || !rhs.is_int32() {
            let mut r = Range::infinite();
            r.decimal = lhs.decimal || rhs.decimal;
            return r;
        }
        let mut r = Range::new(
            lhs.lower as i64 + rhs.lower as i64,
            lhs.upper as i64 + rhs.upper as i64,
        );
        r.decimal = lhs.decimal || rhs.decimal;
        r.max_exponent = (lhs.max_exponent.max(rhs.max_exponent) + 1).min(MAX_DOUBLE_EXPONENT);
        r
    }

    pub fn sub(lhs: &Range, rhs: &Range) -> Range {
        if !lhs.is_int32() || !rhs.is_int32() {
            let mut r = Range::infinite();
            r.decimal = lhs.decimal || rhs.decimal;
            return r;
        }
        let mut r = Range::new(
            lhs.lower as i64 - rhs.upper as i64,
            lhs.upper as i64 - rhs.lower as i64,
        );
        r.decimal = lhs.decimal || rhs.decimal;
        r.max_exponent = (lhs.max_exponent.max(rhs.max_exponent) + 1).min(MAX_DOUBLE_EXPONENT);
        r
    }

    pub fn mul(lhs: &Range, rhs: &Range) -> Range {
        if !lhs.is_int32() || !rhs.is_int32() {
            let mut r = Range::infinite();
            r.decimal = lhs.decimal || rhs.decimal;
            return r;
        }
        let a = lhs.lower as i64 * rhs.lower as i64;
        let b = lhs.lower as i64 * rhs.upper as i64;
        let c = lhs.upper as i64 * rhs.lower as i64;
        let d = lhs.upper as i64 * rhs.upper as i64;
        let mut r = Range::new(a.min(b).min(c).min(d), a.max(b).max(c).max(d));
        r.decimal = lhs.decimal || rhs.decimal;
        r.max_exponent =
            (lhs.max_exponent.saturating_add(rhs.max_exponent) + 1).min(MAX_DOUBLE_EXPONENT);
        r
    }

    pub fn and(lhs: &Range, rhs: &Range) -> Range {
        let (llo, lhi) = lhs.finite_bounds();
        let (rlo, rhi) = rhs.finite_bounds();
        // Both operands can be negative: nothing useful to say beyond int32.
        if llo < 0 && rlo < 0 {
            return Range::new(i32::MIN as i64, lhi.max(rhi).min(i32::MAX as i64));
        }
        // At least one operand is non-negative, so the result is too. A
        // negative operand contributes no upper bound (x & -1 == x).
        let upper = if llo < 0 {
            rhi
        } else if rlo < 0 {
            lhi
        } else {
            lhi.min(rhi)
        };
        Range::new(0, upper.min(i32::MAX as i64))
    }

    pub fn shl(lhs: &Range, c: i32) -> Range {
        let shift = (c as u32) & 31;
        if !lhs.is_int32() {
            return Range::new_int32();
        }
        // Only keep the shifted bounds when the shift cannot change sign
        // or drop significant bits.
        let lower = (lhs.lower as i64) << shift;
        let upper = (lhs.upper as i64) << shift;
        if lower >= i32::MIN as i64 && upper <= i32::MAX as i64 {
            Range::new(lower, upper)
        } else {
            Range::new_int32()
        }
    }

    pub fn shr(lhs: &Range, c: i32) -> Range {
        let shift = (c as u32) & 31;
        let (lo, hi) = lhs.finite_bounds();
        let lo = lo.max(i32::MIN as i64) >> shift;
        let hi = hi.min(i32::MAX as i64) >> shift;
        Range::new(lo, hi)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        if self.lower_infinite {
            write!(f, "-inf")?;
        } else {
            write!(f, "{}", self.lower)?;
        }
        write!(f, ", ")?;
        if self.upper_infinite {
            write!(f, "inf")?;
        } else {
            write!(f, "{}", self.upper)?;
        }
        write!(f, "]")?;
        if self.decimal {
            write!(f, " (decimal)")?;
        }
        Ok(())
    }
}

/// `term + constant`, the shape produced by peeling constant additions off
/// a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleLinearSum {
    pub term: Option<ValueId>,
    pub constant: i32,
}

impl SimpleLinearSum {
    pub fn new(term: Option<ValueId>, constant: i32) -> SimpleLinearSum {
        SimpleLinearSum { term, constant }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearTerm {
    pub term: ValueId,
    pub scale: i32,
}

/// `sum(scale_i * term_i) + constant` over distinct SSA values. All
/// mutations are checked; on overflow they leave the sum unchanged and
/// return false.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinearSum {
    terms: Vec<LinearTerm>,
    constant: i32,
}

impl LinearSum {
    pub fn new() -> LinearSum {
        LinearSum::default()
    }

    pub fn terms(&self) -> &[LinearTerm] {
        &self.terms
    }

    pub fn constant(&self) -> i32 {
        self.constant
    }

    #[must_use]
    pub fn add_constant(&mut self, c: i32) -> bool {
        match self.constant.checked_add(c) {
            Some(n) => {
                self.constant = n;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn add_term(&mut self, term: ValueId, scale: i32) -> bool {
        if scale == 0 {
            return true;
        }
        if let Some(pos) = self.terms.iter().position(|t| t.term == term) {
            match self.terms[pos].scale.checked_add(scale) {
                Some(0) => {
                    self.terms.remove(pos);
                }
                Some(n) => self.terms[pos].scale = n,
                None => return false,
            }
            return true;
        }
        self.terms.push(LinearTerm { term, scale });
        true
    }

    /// Add `scale * other` to this sum.
    #[must_use]
    pub fn add_scaled(&mut self, other: &LinearSum, scale: i32) -> bool {
        for t in &other.terms {
            let scaled = match t.scale.checked_mul(scale) {
                Some(s) => s,
                None => return false,
            };
            if !self.add_term(t.term, scaled) {
                return false;
            }
        }
        match other.constant.checked_mul(scale) {
            Some(c) => self.add_constant(c),
            None => false,
        }
    }
}

impl fmt::Display for LinearSum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, t) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, " + ")?;
            }
            if t.scale == 1 {
                write!(f, "{}", t.term)?;
            } else {
                write!(f, "{}*{}", t.scale, t.term)?;
            }
        }
        if self.terms.is_empty() || self.constant != 0 {
            if !self.terms.is_empty() {
                write!(f, " + ")?;
            }
            write!(f, "{}", self.constant)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_clamp_outside_int32() {
        let r = Range::new(i32::MIN as i64 - 1, i32::MAX as i64 + 1);
        assert!(r.lower_infinite());
        assert!(r.upper_infinite());
        assert!(!r.is_int32());

        let r = Range::new(-5, 10);
        assert!(r.is_int32());
        assert_eq!(r.lower(), -5);
        assert_eq!(r.upper(), 10);
        assert!(r.can_be_zero());
        assert!(r.can_be_negative());
    }

    #[test]
    fn exponent_tracks_bound_magnitude() {
        assert_eq!(Range::singleton(0).max_exponent(), 0);
        assert_eq!(Range::new(5, 10).max_exponent(), 3);
        assert_eq!(Range::new(-16, 1).max_exponent(), 4);
        assert_eq!(Range::new_int32().max_exponent(), 31);
        assert_eq!(Range::infinite().max_exponent(), MAX_DOUBLE_EXPONENT);
        // Arithmetic widens the exponent by one carry bit.
        assert_eq!(Range::add(&Range::new(5, 10), &Range::singleton(1)).max_exponent(), 4);
    }

    #[test]
    fn intersect_narrows() {
        let a = Range::new(0, 100);
        let b = Range::new(50, 200);
        let (r, emptied) = a.intersect(&b);
        assert!(!emptied);
        assert_eq!((r.lower(), r.upper()), (50, 100));
    }

    #[test]
    fn intersect_conflict_widens_to_infinite() {
        let a = Range::new(0, 10);
        let b = Range::new(20, 30);
        let (r, emptied) = a.intersect(&b);
        assert!(emptied);
        assert!(r.lower_infinite() && r.upper_infinite());
    }

    #[test]
    fn union_is_conservative() {
        let mut a = Range::new(0, 10);
        a.union_with(&Range::new(-5, 3).with_decimal(true));
        assert_eq!((a.lower(), a.upper()), (-5, 10));
        assert!(a.is_decimal());
    }

    #[test]
    fn add_overflows_to_infinite_bound() {
        let a = Range::new(i32::MAX as i64 - 1, i32::MAX as i64);
        let b = Range::singleton(2);
        let r = Range::add(&a, &b);
        assert!(r.upper_infinite());
        assert!(!r.lower_infinite());
        assert_eq!(r.lower(), i32::MAX);
    }

    #[test]
    fn mul_takes_extreme_corner() {
        let a = Range::new(-3, 4);
        let b = Range::new(-5, 2);
        let r = Range::mul(&a, &b);
        assert_eq!((r.lower(), r.upper()), (-20, 15));
    }

    #[test]
    fn and_with_nonnegative_operand() {
        let a = Range::new(0, 15);
        let b = Range::new(-8, 1000);
        let r = Range::and(&a, &b);
        // The negative side contributes no upper bound beyond the
        // non-negative operand's.
        assert_eq!((r.lower(), r.upper()), (0, 15));

        let both_neg = Range::and(&Range::new(-4, -1), &Range::new(-10, -2));
        assert_eq!(both_neg.lower(), i32::MIN);
    }

    #[test]
    fn shifts() {
        let r = Range::shl(&Range::new(1, 8), 2);
        assert_eq!((r.lower(), r.upper()), (4, 32));
        let wide = Range::shl(&Range::new(0, i32::MAX as i64), 1);
        assert_eq!((wide.lower(), wide.upper()), (i32::MIN, i32::MAX));
        let r = Range::shr(&Range::new(-17, 100), 2);
        assert_eq!((r.lower(), r.upper()), (-5, 25));
    }

    #[test]
    fn linear_sum_merges_terms() {
        let x = ValueId(1);
        let y = ValueId(2);
        let mut sum = LinearSum::new();
        assert!(sum.add_term(x, 2));
        assert!(sum.add_term(y, 1));
        assert!(sum.add_term(x, -2));
        assert!(sum.add_constant(7));
        assert_eq!(sum.terms(), &[LinearTerm { term: y, scale: 1 }]);
        assert_eq!(sum.constant(), 7);
    }

    #[test]
    fn linear_sum_overflow_is_rejected() {
        let mut sum = LinearSum::new();
        assert!(sum.add_constant(i32::MAX));
        assert!(!sum.add_constant(1));
        assert_eq!(sum.constant(), i32::MAX);
    }
}
