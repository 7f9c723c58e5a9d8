//! The loop clusterer (§4.3).
//!
//! When the layout strategy asks to keep loop blocks together, blocks
//! belonging to the same loop are laid out contiguously to preserve
//! instruction-cache locality. The equivalence classes are computed with a
//! path-compressing union-find keyed by [`ConcreteAddress`] (Design Notes
//! §9), frozen into a `HashMap` once every function's CFG has been folded
//! in — the same "compute once, freeze to a map" shape
//! `cranelift-codegen`'s `ControlFlowGraph` uses for its own
//! predecessor/successor tables (`flowgraph.rs`).

use crate::address::ConcreteAddress;
use std::collections::HashMap;

/// A symbolic control-flow-graph hint for one function, supplied by the
/// client only when loop-keeping is requested. Deliberately shaped like
/// `cranelift-codegen`'s `ControlFlowGraph::succ_iter`: a narrow read-only
/// successor query, not a full graph API.
pub trait SymbolicCfg {
    /// The blocks `block` can transfer control to.
    fn successors(&self, block: ConcreteAddress) -> &[ConcreteAddress];
    /// Every block address covered by this CFG, in an arbitrary but stable
    /// order.
    fn blocks(&self) -> &[ConcreteAddress];
}

struct UnionFind {
    parent: HashMap<ConcreteAddress, ConcreteAddress>,
}

impl UnionFind {
    fn new() -> Self {
        UnionFind {
            parent: HashMap::new(),
        }
    }

    fn make_set(&mut self, addr: ConcreteAddress) {
        self.parent.entry(addr).or_insert(addr);
    }

    fn find(&mut self, addr: ConcreteAddress) -> ConcreteAddress {
        let p = *self.parent.get(&addr).expect("make_set called for every address");
        if p == addr {
            return addr;
        }
        let root = self.find(p);
        self.parent.insert(addr, root);
        root
    }

    fn union(&mut self, a: ConcreteAddress, b: ConcreteAddress) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }
}

/// A weak topological ordering of a CFG's nodes: nodes appear in an order
/// consistent with the edges that don't close a cycle, and each maximal
/// group of nodes that can only be separated by breaking a cycle is
/// returned together as one non-trivial component (a loop).
///
/// This is a minimal, self-contained source-order Tarjan-style
/// strongly-connected-components pass — the loop clusterer only needs the
/// components, not a full ordering, since it only ever unions within a
/// component.
fn strongly_connected_components(cfg: &dyn SymbolicCfg) -> Vec<Vec<ConcreteAddress>> {
    struct Tarjan<'a> {
        cfg: &'a dyn SymbolicCfg,
        index: HashMap<ConcreteAddress, usize>,
        lowlink: HashMap<ConcreteAddress, usize>,
        on_stack: HashMap<ConcreteAddress, bool>,
        stack: Vec<ConcreteAddress>,
        next_index: usize,
        components: Vec<Vec<ConcreteAddress>>,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, v: ConcreteAddress) {
            self.index.insert(v, self.next_index);
            self.lowlink.insert(v, self.next_index);
            self.next_index += 1;
            self.stack.push(v);
            self.on_stack.insert(v, true);

            for &w in self.cfg.successors(v) {
                if !self.index.contains_key(&w) {
                    self.visit(w);
                    let w_low = self.lowlink[&w];
                    let v_low = self.lowlink[&v];
                    self.lowlink.insert(v, v_low.min(w_low));
                } else if *self.on_stack.get(&w).unwrap_or(&false) {
                    let w_idx = self.index[&w];
                    let v_low = self.lowlink[&v];
                    self.lowlink.insert(v, v_low.min(w_idx));
                }
            }

            if self.lowlink[&v] == self.index[&v] {
                let mut component = Vec::new();
                loop {
                    let w = self.stack.pop().expect("component root was pushed");
                    self.on_stack.insert(w, false);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let mut tarjan = Tarjan {
        cfg,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        on_stack: HashMap::new(),
        stack: Vec::new(),
        next_index: 0,
        components: Vec::new(),
    };

    for &block in cfg.blocks() {
        if !tarjan.index.contains_key(&block) {
            tarjan.visit(block);
        }
    }

    tarjan.components
}

/// The frozen result of loop analysis: every block's loop-equivalence
/// representative.
pub struct LoopClasses {
    representative: HashMap<ConcreteAddress, ConcreteAddress>,
}

impl LoopClasses {
    /// The representative address for `addr`'s loop-equivalence class, or
    /// `addr` itself if it belongs to no loop (every block is in some
    /// class, possibly a singleton one).
    pub fn representative_of(&self, addr: ConcreteAddress) -> ConcreteAddress {
        self.representative.get(&addr).copied().unwrap_or(addr)
    }
}

/// Compute loop-equivalence classes across every function's CFG.
///
/// A "non-trivial component" is a strongly connected component with more
/// than one block, or a single block with a self-edge — both are loops.
/// Every block in such a component is unioned with the component's head
/// (its first element), so the whole loop collapses to one representative.
pub fn compute_loop_classes<'a>(cfgs: impl Iterator<Item = &'a dyn SymbolicCfg>) -> LoopClasses {
    let mut uf = UnionFind::new();

    for cfg in cfgs {
        for &addr in cfg.blocks() {
            uf.make_set(addr);
        }

        for component in strongly_connected_components(cfg) {
            let is_loop = component.len() > 1
                || component
                    .first()
                    .map(|&only| cfg.successors(only).contains(&only))
                    .unwrap_or(false);
            if !is_loop {
                continue;
            }
            let head = component[0];
            for &member in &component[1..] {
                uf.union(head, member);
            }
        }
    }

    let mut representative = HashMap::new();
    let addrs: Vec<ConcreteAddress> = uf.parent.keys().copied().collect();
    for addr in addrs {
        let root = uf.find(addr);
        representative.insert(addr, root);
    }

    LoopClasses { representative }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    struct TestCfg {
        succs: Map<ConcreteAddress, Vec<ConcreteAddress>>,
        order: Vec<ConcreteAddress>,
    }

    impl SymbolicCfg for TestCfg {
        fn successors(&self, block: ConcreteAddress) -> &[ConcreteAddress] {
            self.succs.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
        }
        fn blocks(&self) -> &[ConcreteAddress] {
            &self.order
        }
    }

    fn a(n: u64) -> ConcreteAddress {
        ConcreteAddress::new(n)
    }

    #[test]
    fn acyclic_blocks_stay_in_singleton_classes() {
        let cfg = TestCfg {
            succs: Map::from([(a(0), vec![a(1)]), (a(1), vec![a(2)])]),
            order: vec![a(0), a(1), a(2)],
        };
        let classes = compute_loop_classes(std::iter::once(&cfg as &dyn SymbolicCfg));
        assert_eq!(classes.representative_of(a(0)), a(0));
        assert_eq!(classes.representative_of(a(1)), a(1));
        assert_eq!(classes.representative_of(a(2)), a(2));
    }

    #[test]
    fn loop_body_shares_one_representative() {
        // 0 -> 1 -> 2 -> 1 (loop between 1 and 2), 2 -> 3 (exit)
        let cfg = TestCfg {
            succs: Map::from([
                (a(0), vec![a(1)]),
                (a(1), vec![a(2)]),
                (a(2), vec![a(1), a(3)]),
            ]),
            order: vec![a(0), a(1), a(2), a(3)],
        };
        let classes = compute_loop_classes(std::iter::once(&cfg as &dyn SymbolicCfg));
        assert_eq!(
            classes.representative_of(a(1)),
            classes.representative_of(a(2))
        );
        assert_ne!(classes.representative_of(a(0)), classes.representative_of(a(1)));
        assert_ne!(classes.representative_of(a(3)), classes.representative_of(a(1)));
    }

    #[test]
    fn self_loop_is_its_own_class_but_recognised() {
        let cfg = TestCfg {
            succs: Map::from([(a(0), vec![a(0)])]),
            order: vec![a(0)],
        };
        let classes = compute_loop_classes(std::iter::once(&cfg as &dyn SymbolicCfg));
        assert_eq!(classes.representative_of(a(0)), a(0));
    }
}
