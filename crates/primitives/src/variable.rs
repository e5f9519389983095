//! Symbolic 256-bit variables: subset-lattice value sets tagged with a name
//! and the program locations that may have produced them.

use std::fmt;

use alloy::primitives::U256;

use crate::ariths;
use crate::lattice::{Lattice, SubsetLattice};

/// The fallback name when creating a fresh variable.
pub const VAR_DEFAULT_NAME: &str = "Var";
/// The name applied to variables resulting from an arithmetic operation.
pub const VAR_RESULT_NAME: &str = "Res";

/// Stable handle of a basic block within its owning graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub usize);

impl BlockId {
    /// Placeholder for ops and def sites not yet linked into a graph.
    pub const UNLINKED: BlockId = BlockId(usize::MAX);
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A reference to the instruction that produced a variable: the containing
/// block plus the program counter of the producing operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DefSite {
    pub block: BlockId,
    pub pc: usize,
}

impl DefSite {
    pub fn new(block: BlockId, pc: usize) -> Self {
        DefSite { block, pc }
    }
}

impl fmt::Display for DefSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:#x}", self.block, self.pc)
    }
}

pub type ValueSet = SubsetLattice<U256>;
pub type DefSiteSet = SubsetLattice<DefSite>;

/// A symbolic variable holding the set of 256-bit words it may contain.
///
/// A variable whose `payload` is set is a stack placeholder `S{n}`, standing
/// for whatever occupied the n'th slot from the top of the stack at block
/// entry. Placeholders always carry an unconstrained value set.
///
/// Equality between variables is value-set equality only; names, def sites
/// and payloads do not participate. Use [`Variable::is_same`] where two
/// occurrences must be recognised as the same variable.
#[derive(Debug, Clone)]
pub struct Variable {
    values: ValueSet,
    pub name: String,
    pub def_sites: DefSiteSet,
    payload: Option<usize>,
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Variable {
    pub fn new<I: IntoIterator<Item = U256>>(values: I, name: impl Into<String>) -> Self {
        Variable {
            values: ValueSet::new(values),
            name: name.into(),
            def_sites: DefSiteSet::bottom(),
            payload: None,
        }
    }

    /// A variable holding exactly one value.
    pub fn constant(value: U256, name: impl Into<String>) -> Self {
        Variable::new([value], name)
    }

    /// An unconstrained variable.
    pub fn top(name: impl Into<String>, def_sites: DefSiteSet) -> Self {
        Variable {
            values: ValueSet::top(),
            name: name.into(),
            def_sites,
            payload: None,
        }
    }

    /// A variable holding no values at all; an empty stack slot.
    pub fn bottom(name: impl Into<String>, def_sites: DefSiteSet) -> Self {
        Variable {
            values: ValueSet::bottom(),
            name: name.into(),
            def_sites,
            payload: None,
        }
    }

    /// The `S{n}` placeholder for the n'th stack slot from the top.
    pub fn slot(n: usize, def_sites: DefSiteSet) -> Self {
        Variable {
            values: ValueSet::top(),
            name: format!("S{n}"),
            def_sites,
            payload: Some(n),
        }
    }

    pub fn values(&self) -> &ValueSet {
        &self.values
    }

    pub fn set_values(&mut self, values: ValueSet) {
        self.values = values;
    }

    /// The stack depth this placeholder refers to, if it is one.
    pub fn payload(&self) -> Option<usize> {
        self.payload
    }

    pub fn is_meta(&self) -> bool {
        self.payload.is_some()
    }

    /// True iff this variable could take on all possible values.
    pub fn is_unconstrained(&self) -> bool {
        self.values.is_top()
    }

    pub fn is_bottom(&self) -> bool {
        self.values.is_bottom()
    }

    /// True iff this variable has exactly one possible value.
    pub fn is_const(&self) -> bool {
        self.values.is_const()
    }

    pub fn is_finite(&self) -> bool {
        self.values.is_finite()
    }

    /// True iff every value this variable may hold is nonzero.
    /// Not the inverse of `is_false`; variables are not bivalent.
    pub fn is_true(&self) -> bool {
        self.is_finite() && self.values.iter().all(|v| !v.is_zero())
    }

    /// True iff every value this variable may hold is zero.
    pub fn is_false(&self) -> bool {
        self.is_finite() && self.values.iter().all(|v| v.is_zero())
    }

    /// If this variable is constant, its value.
    pub fn const_value(&self) -> Option<U256> {
        if self.is_const() {
            self.values.iter().next().copied()
        } else {
            None
        }
    }

    pub fn widen_to_top(&mut self) {
        self.values = ValueSet::top();
    }

    /// Full structural sameness, where `==` is only value-set equality.
    pub fn is_same(&self, other: &Variable) -> bool {
        self.values == other.values
            && self.name == other.name
            && self.def_sites == other.def_sites
            && self.payload == other.payload
    }

    /// The variable whose values and def sites are the intersections of the
    /// inputs'.
    pub fn meet(a: &Variable, b: &Variable) -> Variable {
        Variable {
            values: ValueSet::meet(&a.values, &b.values),
            name: VAR_DEFAULT_NAME.to_string(),
            def_sites: DefSiteSet::meet(&a.def_sites, &b.def_sites),
            payload: None,
        }
    }

    /// The variable whose values and def sites are the unions of the inputs'.
    pub fn join(a: &Variable, b: &Variable) -> Variable {
        Variable {
            values: ValueSet::join(&a.values, &b.values),
            name: VAR_DEFAULT_NAME.to_string(),
            def_sites: DefSiteSet::join(&a.def_sites, &b.def_sites),
            payload: None,
        }
    }

    pub fn join_all<'a, I: IntoIterator<Item = &'a Variable>>(vars: I) -> Variable {
        vars.into_iter().fold(
            Variable::bottom(VAR_DEFAULT_NAME, DefSiteSet::bottom()),
            |acc, v| Variable::join(&acc, v),
        )
    }

    /// Apply the named EVM operation to the given variables' value sets in
    /// all combinations. Returns None for names with no arithmetic meaning
    /// or an arity mismatch.
    ///
    /// The result's def sites are the join of the arguments' def sites.
    pub fn arith_op(opname: &str, args: &[Variable]) -> Option<Variable> {
        let vals: Vec<&ValueSet> = args.iter().map(Variable::values).collect();
        let values = match (opname, vals.as_slice()) {
            ("ADD", &[l, r]) => lift2(ariths::add, l, r),
            ("MUL", &[l, r]) => lift2(ariths::mul, l, r),
            ("SUB", &[l, r]) => lift2(ariths::sub, l, r),
            ("DIV", &[l, r]) => lift2(ariths::div, l, r),
            ("SDIV", &[l, r]) => lift2(ariths::sdiv, l, r),
            ("MOD", &[l, r]) => lift2(ariths::modulo, l, r),
            ("SMOD", &[l, r]) => lift2(ariths::smod, l, r),
            ("ADDMOD", &[l, r, m]) => lift3(ariths::addmod, l, r, m),
            ("MULMOD", &[l, r, m]) => lift3(ariths::mulmod, l, r, m),
            ("EXP", &[b, e]) => lift2(ariths::exp, b, e),
            ("SIGNEXTEND", &[b, v]) => lift2(ariths::signextend, b, v),
            ("LT", &[l, r]) => lift2(ariths::lt, l, r),
            ("GT", &[l, r]) => lift2(ariths::gt, l, r),
            ("SLT", &[l, r]) => lift2(ariths::slt, l, r),
            ("SGT", &[l, r]) => lift2(ariths::sgt, l, r),
            ("EQ", &[l, r]) => lift2(ariths::eq, l, r),
            ("ISZERO", &[v]) => lift1(ariths::iszero, v),
            ("AND", &[l, r]) => lift2(ariths::and, l, r),
            ("OR", &[l, r]) => lift2(ariths::or, l, r),
            ("XOR", &[l, r]) => lift2(ariths::xor, l, r),
            ("NOT", &[v]) => lift1(ariths::not, v),
            ("BYTE", &[b, v]) => lift2(ariths::byte, b, v),
            ("SHL", &[s, v]) => lift2(ariths::shl, s, v),
            ("SHR", &[s, v]) => lift2(ariths::shr, s, v),
            ("SAR", &[s, v]) => lift2(ariths::sar, s, v),
            _ => return None,
        };

        let def_sites = args.iter().fold(DefSiteSet::bottom(), |acc, a| {
            DefSiteSet::join(&acc, &a.def_sites)
        });

        Some(Variable {
            values,
            name: VAR_RESULT_NAME.to_string(),
            def_sites,
            payload: None,
        })
    }
}

fn lift1(f: fn(U256) -> U256, a: &ValueSet) -> ValueSet {
    ValueSet::cartesian_map(|xs| f(*xs[0]), &[a])
}

fn lift2(f: fn(U256, U256) -> U256, a: &ValueSet, b: &ValueSet) -> ValueSet {
    ValueSet::cartesian_map(|xs| f(*xs[0], *xs[1]), &[a, b])
}

fn lift3(f: fn(U256, U256, U256) -> U256, a: &ValueSet, b: &ValueSet, c: &ValueSet) -> ValueSet {
    ValueSet::cartesian_map(|xs| f(*xs[0], *xs[1], *xs[2]), &[a, b, c])
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unconstrained() {
            return write!(f, "{}", self.name);
        }
        if let Some(v) = self.const_value() {
            return write!(f, "{v:#x}");
        }
        let vals: Vec<String> = self.values.iter().map(|v| format!("{v:#x}")).collect();
        write!(f, "{{{}}}", vals.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(n: u64) -> U256 {
        U256::from(n)
    }

    fn site(block: usize, pc: usize) -> DefSite {
        DefSite::new(BlockId(block), pc)
    }

    #[test]
    fn truthiness() {
        assert!(Variable::new([u(1), u(2)], "a").is_true());
        assert!(!Variable::new([u(0), u(2)], "a").is_true());
        assert!(Variable::new([u(0)], "a").is_false());
        assert!(!Variable::top("a", DefSiteSet::bottom()).is_true());
        assert!(!Variable::top("a", DefSiteSet::bottom()).is_false());
    }

    #[test]
    fn join_unions_values_and_def_sites() {
        let a = Variable {
            values: ValueSet::new([u(1)]),
            name: "a".into(),
            def_sites: DefSiteSet::singleton(site(0, 2)),
            payload: None,
        };
        let b = Variable {
            values: ValueSet::new([u(2)]),
            name: "b".into(),
            def_sites: DefSiteSet::singleton(site(1, 7)),
            payload: None,
        };

        let joined = Variable::join(&a, &b);
        assert_eq!(joined.values(), &ValueSet::new([u(1), u(2)]));
        assert_eq!(joined.def_sites, DefSiteSet::new([site(0, 2), site(1, 7)]));

        let met = Variable::meet(&a, &b);
        assert!(met.is_bottom());
    }

    #[test]
    fn equality_ignores_names() {
        let a = Variable::new([u(5)], "a");
        let b = Variable::new([u(5)], "b");
        assert_eq!(a, b);
        assert!(!a.is_same(&b));
    }

    #[test]
    fn slot_placeholders_are_unconstrained() {
        let s = Variable::slot(3, DefSiteSet::bottom());
        assert_eq!(s.name, "S3");
        assert_eq!(s.payload(), Some(3));
        assert!(s.is_unconstrained());
        assert_eq!(s.to_string(), "S3");
    }

    #[test]
    fn arith_op_lifts_cartesian() {
        let l = Variable::new([u(1), u(2)], "l");
        let r = Variable::new([u(10)], "r");
        let res = Variable::arith_op("ADD", &[l, r]).unwrap();
        assert_eq!(res.values(), &ValueSet::new([u(11), u(12)]));
        assert_eq!(res.name, VAR_RESULT_NAME);
    }

    #[test]
    fn arith_op_top_absorbs() {
        let l = Variable::top("l", DefSiteSet::bottom());
        let r = Variable::new([u(1)], "r");
        let res = Variable::arith_op("ADD", &[l, r]).unwrap();
        assert!(res.is_unconstrained());
    }

    #[test]
    fn arith_op_unknown_name() {
        assert!(Variable::arith_op("JUMP", &[Variable::new([u(1)], "x")]).is_none());
        assert!(Variable::arith_op("ADD", &[Variable::new([u(1)], "x")]).is_none());
    }

    #[test]
    fn const_display_is_hex() {
        assert_eq!(Variable::constant(u(255), "C").to_string(), "0xff");
        assert_eq!(
            Variable::new([u(1), u(2)], "x").to_string(),
            "{0x1, 0x2}"
        );
    }
}
