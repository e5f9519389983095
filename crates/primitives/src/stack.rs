//! A lattice of bounded stacks of symbolic variables.

use std::fmt;

use crate::lattice::Lattice;
use crate::variable::{DefSiteSet, VAR_DEFAULT_NAME, Variable};

/// A stack that holds symbolic variables, which is itself a lattice element:
/// meet and join operate element-wise from the top of the stack down.
///
/// The stack is taken to be of infinite capacity, with empty slots extending
/// indefinitely downwards; an empty slot is read as a Bottom variable.
/// Popping past the bottom produces fresh `S{n}` placeholders, counted by
/// `empty_pops`. Pushing to a stack at `max_size` discards the pushed value.
#[derive(Debug, Clone)]
pub struct VariableStack {
    /// Stack contents; the bottom of the stack inhabits index zero.
    value: Vec<Variable>,
    /// The number of times the stack was popped while empty.
    pub empty_pops: usize,
    /// Floor on `max_size`; meets never shrink capacity below this.
    pub min_max_size: usize,
    /// The maximum size of this stack before it overflows.
    pub max_size: usize,
}

impl VariableStack {
    pub const DEFAULT_MAX: usize = 1024;
    pub const DEFAULT_MIN_MAX_SIZE: usize = 20;

    pub fn new() -> Self {
        VariableStack {
            value: Vec::new(),
            empty_pops: 0,
            min_max_size: Self::DEFAULT_MIN_MAX_SIZE,
            max_size: Self::DEFAULT_MAX,
        }
    }

    fn with_state(vars: Vec<Variable>, max_size: usize) -> Self {
        let mut stack = VariableStack::new();
        stack.value = vars;
        stack.set_max_size(max_size);
        stack
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// The stack slots, bottom first.
    pub fn slots(&self) -> &[Variable] {
        &self.value
    }

    pub fn slots_mut(&mut self) -> &mut [Variable] {
        &mut self.value
    }

    /// Iterate from the head of the stack downwards.
    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.value.iter().rev()
    }

    /// The n'th variable from the top without popping anything. Slots past
    /// the bottom read as fresh placeholders.
    pub fn peek(&self, n: usize) -> Variable {
        if n < self.value.len() {
            self.value[self.value.len() - 1 - n].clone()
        } else {
            Variable::slot(n - self.value.len() + self.empty_pops, DefSiteSet::bottom())
        }
    }

    /// Push a variable; a push beyond `max_size` is discarded.
    pub fn push(&mut self, var: Variable) {
        if self.value.len() < self.max_size {
            self.value.push(var);
        }
    }

    /// Pop a variable if one exists, otherwise generate a placeholder from
    /// past the bottom.
    pub fn pop(&mut self) -> Variable {
        match self.value.pop() {
            Some(var) => var,
            None => {
                self.empty_pops += 1;
                Variable::slot(self.empty_pops - 1, DefSiteSet::bottom())
            }
        }
    }

    /// Push a sequence of variables, low index first.
    pub fn push_many<I: IntoIterator<Item = Variable>>(&mut self, vars: I) {
        for var in vars {
            self.push(var);
        }
    }

    /// Pop and return n items; first-popped elements inhabit low indices.
    pub fn pop_many(&mut self, n: usize) -> Vec<Variable> {
        (0..n).map(|_| self.pop()).collect()
    }

    /// Place a copy of the slot at depth n-1 on the top of the stack.
    pub fn dup(&mut self, n: usize) {
        let items = self.pop_many(n);
        let mut duplicated = Vec::with_capacity(n + 1);
        duplicated.extend(items.last().cloned());
        duplicated.extend(items);
        for var in duplicated.into_iter().rev() {
            self.push(var);
        }
    }

    /// Swap the top of the stack with the slot at depth n.
    pub fn swap(&mut self, n: usize) {
        let mut items = self.pop_many(n + 1);
        items.swap(0, n);
        for var in items.into_iter().rev() {
            self.push(var);
        }
    }

    /// Set this stack's maximum capacity, truncating from the bottom if the
    /// current contents no longer fit.
    pub fn set_max_size(&mut self, n: usize) {
        let new_size = self.min_max_size.max(n);
        self.max_size = new_size;
        if self.value.len() > new_size {
            let excess = self.value.len() - new_size;
            self.value.drain(..excess);
        }
    }

    /// Turn every unconstrained variable into a placeholder labelled by its
    /// current stack position, preserving def sites.
    pub fn metafy(&mut self) {
        let len = self.value.len();
        for depth in 0..len {
            let idx = len - 1 - depth;
            if self.value[idx].is_unconstrained() {
                let def_sites = self.value[idx].def_sites.clone();
                self.value[idx] = Variable::slot(depth, def_sites);
            }
        }
    }

    fn bottom_fill() -> Variable {
        Variable::bottom(VAR_DEFAULT_NAME, DefSiteSet::bottom())
    }

    fn slot_at_depth(&self, depth: usize) -> Option<&Variable> {
        let len = self.value.len();
        if depth < len { Some(&self.value[len - 1 - depth]) } else { None }
    }

    /// The meet of the given stacks: element-wise meets of their variables
    /// from the top down, with any run of Bottom slots at the deep end
    /// dropped. Capacity becomes the smaller of the two.
    pub fn meet(a: &VariableStack, b: &VariableStack) -> VariableStack {
        let fill = Self::bottom_fill();
        let depth = a.len().max(b.len());
        let mut slots: Vec<Variable> = (0..depth)
            .rev()
            .map(|d| {
                Variable::meet(
                    a.slot_at_depth(d).unwrap_or(&fill),
                    b.slot_at_depth(d).unwrap_or(&fill),
                )
            })
            .collect();

        let kept = slots.iter().position(|v| !v.is_bottom()).unwrap_or(slots.len());
        slots.drain(..kept);

        VariableStack::with_state(slots, a.max_size.min(b.max_size))
    }

    /// The join of the given stacks: element-wise joins of their variables
    /// from the top down, shorter stacks padded with Bottom slots. Capacity
    /// becomes the larger of the two.
    pub fn join(a: &VariableStack, b: &VariableStack) -> VariableStack {
        let fill = Self::bottom_fill();
        let depth = a.len().max(b.len());
        let slots: Vec<Variable> = (0..depth)
            .rev()
            .map(|d| {
                Variable::join(
                    a.slot_at_depth(d).unwrap_or(&fill),
                    b.slot_at_depth(d).unwrap_or(&fill),
                )
            })
            .collect();

        VariableStack::with_state(slots, a.max_size.max(b.max_size))
    }

    /// The join of a sequence of stacks; an empty sequence yields an empty
    /// stack.
    pub fn join_all<'a, I: IntoIterator<Item = &'a VariableStack>>(stacks: I) -> VariableStack {
        stacks
            .into_iter()
            .fold(VariableStack::new(), |acc, s| VariableStack::join(&acc, s))
    }
}

impl Default for VariableStack {
    fn default() -> Self {
        VariableStack::new()
    }
}

impl PartialEq for VariableStack {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(v1, v2)| v1 == v2)
    }
}

impl fmt::Display for VariableStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vals: Vec<String> = self.value.iter().map(|v| v.to_string()).collect();
        write!(f, "[{}]", vals.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::ValueSet;
    use alloy::primitives::U256;

    fn constant(n: u64) -> Variable {
        Variable::constant(U256::from(n), "C")
    }

    #[test]
    fn push_pop_lifo_behavior() {
        let mut stack = VariableStack::new();
        stack.push(constant(1));
        stack.push(constant(2));
        stack.push(constant(3));

        assert_eq!(stack.len(), 3);
        assert_eq!(stack.pop().const_value(), Some(U256::from(3)));
        assert_eq!(stack.pop().const_value(), Some(U256::from(2)));
        assert_eq!(stack.pop().const_value(), Some(U256::from(1)));
        assert!(stack.is_empty());
    }

    #[test]
    fn popping_past_the_bottom_generates_placeholders() {
        let mut stack = VariableStack::new();
        let s0 = stack.pop();
        let s1 = stack.pop();
        assert_eq!(s0.name, "S0");
        assert_eq!(s1.name, "S1");
        assert_eq!(stack.empty_pops, 2);
    }

    #[test]
    fn peek_past_the_bottom() {
        let mut stack = VariableStack::new();
        stack.push(constant(1));
        assert_eq!(stack.peek(0).const_value(), Some(U256::from(1)));
        assert_eq!(stack.peek(1).name, "S1");
        assert_eq!(stack.peek(3).name, "S3");
        // Peeking consumes nothing.
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.empty_pops, 0);
    }

    #[test]
    fn dup_copies_the_chosen_slot() {
        let mut stack = VariableStack::new();
        stack.push(constant(1));
        stack.push(constant(2));
        stack.dup(2);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.peek(0).const_value(), Some(U256::from(1)));
        assert_eq!(stack.peek(1).const_value(), Some(U256::from(2)));
        assert_eq!(stack.peek(2).const_value(), Some(U256::from(1)));
    }

    #[test]
    fn swap_exchanges_top_with_chosen_slot() {
        let mut stack = VariableStack::new();
        stack.push(constant(1));
        stack.push(constant(2));
        stack.push(constant(3));
        stack.swap(2);
        assert_eq!(stack.peek(0).const_value(), Some(U256::from(1)));
        assert_eq!(stack.peek(1).const_value(), Some(U256::from(2)));
        assert_eq!(stack.peek(2).const_value(), Some(U256::from(3)));
    }

    #[test]
    fn push_at_capacity_is_discarded() {
        let mut stack = VariableStack::new();
        stack.set_max_size(0);
        assert_eq!(stack.max_size, VariableStack::DEFAULT_MIN_MAX_SIZE);
        for i in 0..stack.max_size + 5 {
            stack.push(constant(i as u64));
        }
        assert_eq!(stack.len(), VariableStack::DEFAULT_MIN_MAX_SIZE);
    }

    #[test]
    fn set_max_size_truncates_from_the_bottom() {
        let mut stack = VariableStack::new();
        for i in 0..30 {
            stack.push(constant(i));
        }
        stack.set_max_size(25);
        assert_eq!(stack.len(), 25);
        // The top of the stack survives.
        assert_eq!(stack.peek(0).const_value(), Some(U256::from(29)));
    }

    #[test]
    fn metafy_renames_unconstrained_slots() {
        let mut stack = VariableStack::new();
        stack.push(Variable::top("V7", DefSiteSet::bottom()));
        stack.push(constant(4));
        stack.metafy();
        assert_eq!(stack.peek(0).const_value(), Some(U256::from(4)));
        assert_eq!(stack.peek(1).name, "S1");
        assert_eq!(stack.peek(1).payload(), Some(1));
    }

    #[test]
    fn join_aligns_from_the_top() {
        let mut a = VariableStack::new();
        a.push(constant(9));
        a.push(constant(1));
        let mut b = VariableStack::new();
        b.push(constant(2));

        let joined = VariableStack::join(&a, &b);
        assert_eq!(joined.len(), 2);
        assert_eq!(
            joined.peek(0).values(),
            &ValueSet::new([U256::from(1), U256::from(2)])
        );
        // The unmatched deep slot joins with Bottom and survives unchanged.
        assert_eq!(joined.peek(1).const_value(), Some(U256::from(9)));
    }

    #[test]
    fn meet_drops_bottom_tail() {
        let mut a = VariableStack::new();
        a.push(constant(9));
        a.push(constant(1));
        let mut b = VariableStack::new();
        b.push(constant(1));

        let met = VariableStack::meet(&a, &b);
        // The deep slot meets with Bottom and is dropped.
        assert_eq!(met.len(), 1);
        assert_eq!(met.peek(0).const_value(), Some(U256::from(1)));
    }

    #[test]
    fn join_all_of_nothing_is_empty() {
        assert_eq!(VariableStack::join_all([]), VariableStack::new());
    }

    #[test]
    fn stacks_compare_by_slot_values() {
        let mut a = VariableStack::new();
        a.push(Variable::constant(U256::from(1), "x"));
        let mut b = VariableStack::new();
        b.push(Variable::constant(U256::from(1), "y"));
        assert_eq!(a, b);
        b.push(constant(2));
        assert_ne!(a, b);
    }
}
