//! Bounded lattices for meet-over-paths calculations.
//!
//! Bottom is the maximal constraint (empty set, uninitialised), Top the
//! absence of constraint (all possible values, universal set).

use std::collections::BTreeSet;
use std::fmt;

pub const TOP_SYMBOL: &str = "\u{22a4}";
pub const BOTTOM_SYMBOL: &str = "\u{22a5}";

/// An element of a bounded lattice: meet, join, and the two extremes.
pub trait Lattice: Clone + PartialEq {
    fn top() -> Self;
    fn bottom() -> Self;

    /// The infimum of the given elements.
    fn meet(a: &Self, b: &Self) -> Self;

    /// The supremum of the given elements.
    fn join(a: &Self, b: &Self) -> Self;

    fn is_top(&self) -> bool;
    fn is_bottom(&self) -> bool;

    /// Set this element to Top without changing anything else.
    fn widen_to_top(&mut self) {
        *self = Self::top();
    }

    /// The meet of a sequence of elements. An empty sequence produces Top.
    fn meet_all<'a, I>(elements: I) -> Self
    where
        Self: 'a,
        I: IntoIterator<Item = &'a Self>,
    {
        elements
            .into_iter()
            .fold(Self::top(), |acc, e| Self::meet(&acc, e))
    }

    /// The join of a sequence of elements. An empty sequence produces Bottom.
    fn join_all<'a, I>(elements: I) -> Self
    where
        Self: 'a,
        I: IntoIterator<Item = &'a Self>,
    {
        elements
            .into_iter()
            .fold(Self::bottom(), |acc, e| Self::join(&acc, e))
    }
}

/// The lattice obtained by augmenting an unordered set of integers with Top
/// and Bottom. Integers are pairwise incomparable; Top and Bottom compare
/// superior and inferior with everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntLattice<T> {
    Top,
    Bottom,
    Elem(T),
}

impl<T: Copy + Eq> IntLattice<T> {
    /// True iff this element is neither Top nor Bottom.
    pub fn is_int(&self) -> bool {
        matches!(self, IntLattice::Elem(_))
    }

    pub fn elem(&self) -> Option<T> {
        match self {
            IntLattice::Elem(v) => Some(*v),
            _ => None,
        }
    }
}

impl<T: Copy + Eq> Lattice for IntLattice<T> {
    fn top() -> Self {
        IntLattice::Top
    }

    fn bottom() -> Self {
        IntLattice::Bottom
    }

    fn meet(a: &Self, b: &Self) -> Self {
        match (a, b) {
            (IntLattice::Bottom, _) | (_, IntLattice::Bottom) => IntLattice::Bottom,
            (IntLattice::Top, other) | (other, IntLattice::Top) => *other,
            (IntLattice::Elem(x), IntLattice::Elem(y)) if x == y => IntLattice::Elem(*x),
            _ => IntLattice::Bottom,
        }
    }

    fn join(a: &Self, b: &Self) -> Self {
        match (a, b) {
            (IntLattice::Top, _) | (_, IntLattice::Top) => IntLattice::Top,
            (IntLattice::Bottom, other) | (other, IntLattice::Bottom) => *other,
            (IntLattice::Elem(x), IntLattice::Elem(y)) if x == y => IntLattice::Elem(*x),
            _ => IntLattice::Top,
        }
    }

    fn is_top(&self) -> bool {
        matches!(self, IntLattice::Top)
    }

    fn is_bottom(&self) -> bool {
        matches!(self, IntLattice::Bottom)
    }
}

impl<T: Copy + Eq + std::ops::Add<Output = T>> std::ops::Add for IntLattice<T> {
    type Output = Self;

    /// Addition lifted over the lattice; anything not an integer sums to Bottom.
    fn add(self, other: Self) -> Self {
        match (self, other) {
            (IntLattice::Elem(x), IntLattice::Elem(y)) => IntLattice::Elem(x + y),
            _ => IntLattice::Bottom,
        }
    }
}

impl<T: fmt::Display> fmt::Display for IntLattice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntLattice::Top => write!(f, "{TOP_SYMBOL}"),
            IntLattice::Bottom => write!(f, "{BOTTOM_SYMBOL}"),
            IntLattice::Elem(v) => write!(f, "{v}"),
        }
    }
}

/// A subset lattice element: Top is the complete set of all values, Bottom
/// the empty set, and everything else a finite subset in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsetLattice<T: Ord> {
    Top,
    Set(BTreeSet<T>),
}

impl<T: Ord + Clone> SubsetLattice<T> {
    pub fn new<I: IntoIterator<Item = T>>(values: I) -> Self {
        SubsetLattice::Set(values.into_iter().collect())
    }

    pub fn singleton(value: T) -> Self {
        SubsetLattice::Set(BTreeSet::from([value]))
    }

    /// The number of values held. Top has unbounded size and reports zero.
    pub fn len(&self) -> usize {
        match self {
            SubsetLattice::Top => 0,
            SubsetLattice::Set(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.is_bottom()
    }

    /// Iterate the contained values in order. Top iterates as empty; callers
    /// that care must check `is_top` first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        match self {
            SubsetLattice::Top => None,
            SubsetLattice::Set(s) => Some(s.iter()),
        }
        .into_iter()
        .flatten()
    }

    /// True iff this element holds exactly one possible value.
    pub fn is_const(&self) -> bool {
        self.is_finite() && self.len() == 1
    }

    /// True iff this element holds a finite, nonzero number of values.
    pub fn is_finite(&self) -> bool {
        !(self.is_top() || self.is_bottom())
    }

    /// The result of applying `f` to each of this element's values.
    pub fn map<F: Fn(&T) -> T>(&self, f: F) -> Self {
        match self {
            SubsetLattice::Top => SubsetLattice::Top,
            SubsetLattice::Set(s) => SubsetLattice::Set(s.iter().map(f).collect()),
        }
    }

    /// Apply `f` to every tuple in the cartesian product of the inputs and
    /// collect the results. If any input is Top the result is Top, since the
    /// product is then unbounded.
    pub fn cartesian_map<F>(f: F, elements: &[&Self]) -> Self
    where
        F: Fn(&[&T]) -> T,
    {
        if elements.iter().any(|e| e.is_top()) {
            return SubsetLattice::Top;
        }

        let sets: Vec<Vec<&T>> = elements.iter().map(|e| e.iter().collect()).collect();
        let mut result = BTreeSet::new();
        if sets.iter().any(|s| s.is_empty()) {
            return SubsetLattice::Set(result);
        }

        let mut indices = vec![0usize; sets.len()];
        loop {
            let tuple: Vec<&T> = indices.iter().zip(&sets).map(|(&i, s)| s[i]).collect();
            result.insert(f(&tuple));

            // Advance the odometer.
            let mut pos = sets.len();
            loop {
                if pos == 0 {
                    return SubsetLattice::Set(result);
                }
                pos -= 1;
                indices[pos] += 1;
                if indices[pos] < sets[pos].len() {
                    break;
                }
                indices[pos] = 0;
            }
        }
    }
}

impl<T: Ord + Clone> Lattice for SubsetLattice<T> {
    fn top() -> Self {
        SubsetLattice::Top
    }

    fn bottom() -> Self {
        SubsetLattice::Set(BTreeSet::new())
    }

    /// Meet is set intersection.
    fn meet(a: &Self, b: &Self) -> Self {
        match (a, b) {
            (SubsetLattice::Top, other) | (other, SubsetLattice::Top) => other.clone(),
            (SubsetLattice::Set(x), SubsetLattice::Set(y)) => {
                SubsetLattice::Set(x.intersection(y).cloned().collect())
            }
        }
    }

    /// Join is set union; Top absorbs.
    fn join(a: &Self, b: &Self) -> Self {
        match (a, b) {
            (SubsetLattice::Top, _) | (_, SubsetLattice::Top) => SubsetLattice::Top,
            (SubsetLattice::Set(x), SubsetLattice::Set(y)) => {
                SubsetLattice::Set(x.union(y).cloned().collect())
            }
        }
    }

    fn is_top(&self) -> bool {
        matches!(self, SubsetLattice::Top)
    }

    fn is_bottom(&self) -> bool {
        matches!(self, SubsetLattice::Set(s) if s.is_empty())
    }
}

impl<T: Ord + Clone + fmt::Display> fmt::Display for SubsetLattice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_top() {
            write!(f, "{TOP_SYMBOL}")
        } else if self.is_bottom() {
            write!(f, "{BOTTOM_SYMBOL}")
        } else {
            let vals: Vec<String> = self.iter().map(|v| v.to_string()).collect();
            write!(f, "{{{}}}", vals.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Ints = SubsetLattice<u64>;

    #[test]
    fn int_lattice_meet_join() {
        let a = IntLattice::Elem(3u64);
        let b = IntLattice::Elem(4u64);

        assert_eq!(IntLattice::meet(&a, &a), a);
        assert_eq!(IntLattice::meet(&a, &b), IntLattice::Bottom);
        assert_eq!(IntLattice::join(&a, &b), IntLattice::Top);
        assert_eq!(IntLattice::meet(&IntLattice::Top, &a), a);
        assert_eq!(IntLattice::join(&IntLattice::Bottom, &b), b);
        assert!(a.is_int());
        assert!(!IntLattice::<u64>::Top.is_int());
    }

    #[test]
    fn int_lattice_add_propagates_bottom() {
        let a = IntLattice::Elem(3i64);
        assert_eq!(a + IntLattice::Elem(4), IntLattice::Elem(7));
        assert_eq!(a + IntLattice::Top, IntLattice::Bottom);
        assert_eq!(a + IntLattice::Bottom, IntLattice::Bottom);
    }

    #[test]
    fn subset_meet_is_intersection() {
        let a = Ints::new([1, 2, 3]);
        let b = Ints::new([2, 3, 4]);
        assert_eq!(Ints::meet(&a, &b), Ints::new([2, 3]));
        assert_eq!(Ints::meet(&Ints::Top, &a), a);
    }

    #[test]
    fn subset_join_is_union() {
        let a = Ints::new([1, 2]);
        let b = Ints::new([3]);
        assert_eq!(Ints::join(&a, &b), Ints::new([1, 2, 3]));
        assert!(Ints::join(&Ints::Top, &b).is_top());
    }

    #[test]
    fn subset_lattice_laws() {
        let elems = [Ints::new([1]), Ints::new([1, 2]), Ints::Top, Ints::bottom()];
        for a in &elems {
            for b in &elems {
                assert_eq!(Ints::meet(a, b), Ints::meet(b, a));
                assert_eq!(Ints::join(a, b), Ints::join(b, a));
                assert_eq!(Ints::meet(a, a), *a);
                assert_eq!(Ints::join(a, a), *a);
                for c in &elems {
                    assert_eq!(
                        Ints::meet(&Ints::meet(a, b), c),
                        Ints::meet(a, &Ints::meet(b, c))
                    );
                    assert_eq!(
                        Ints::join(&Ints::join(a, b), c),
                        Ints::join(a, &Ints::join(b, c))
                    );
                }
            }
        }
    }

    #[test]
    fn fold_identities() {
        assert!(Ints::meet_all([]).is_top());
        assert!(Ints::join_all([]).is_bottom());
        let xs = [Ints::new([1, 2]), Ints::new([2, 5])];
        assert_eq!(Ints::meet_all(xs.iter()), Ints::new([2]));
        assert_eq!(Ints::join_all(xs.iter()), Ints::new([1, 2, 5]));
    }

    #[test]
    fn cartesian_map_products() {
        let a = Ints::new([1, 2]);
        let b = Ints::new([10, 20]);
        let sums = Ints::cartesian_map(|xs| xs[0] + xs[1], &[&a, &b]);
        assert_eq!(sums, Ints::new([11, 21, 12, 22]));

        assert!(Ints::cartesian_map(|xs| xs[0] + xs[1], &[&a, &Ints::Top]).is_top());
        assert!(Ints::cartesian_map(|xs| *xs[0], &[&Ints::bottom()]).is_bottom());
    }

    #[test]
    fn widen_to_top() {
        let mut a = Ints::new([1, 2]);
        a.widen_to_top();
        assert!(a.is_top());
    }
}
