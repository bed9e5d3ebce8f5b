//! DAG layout engine: assigns each branch a column and produces one [`Row`]
//! per branch describing which columns carry edges up, down, or straight
//! through. Knows nothing about git; it only needs parent/child edges and
//! a total order (`modtime`) for the branch-ordering producer.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;

/// Anything the layout engine can place in a graph: a node with parent and
/// child edges (restricted to other nodes in the same input set by the
/// caller of [`layout`]) and a modification time used to order the input.
pub trait BranchNode: Clone + Eq + Hash {
    /// Parent edges (upstream and merge-decorated).
    fn parents(&self) -> Vec<Self>;
    /// Child edges: every node whose `parents()` includes this one.
    fn children(&self) -> Vec<Self>;
    /// Used only to order the graph before layout; ties are broken
    /// arbitrarily but deterministically by the caller's sort.
    fn modtime(&self) -> i64;
}

/// One row of the rendered graph: which column holds this branch's own
/// cell, and which columns carry edges up to the row above, down to the row
/// below, or straight through without touching this branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Column index of this row's own branch.
    pub at: usize,
    /// Columns with an edge connecting to the row above.
    pub up: BTreeSet<usize>,
    /// Columns with an edge connecting to the row below.
    pub down: BTreeSet<usize>,
    /// Columns with an edge passing through, not touching `at`.
    pub through: BTreeSet<usize>,
}

impl Row {
    fn new(at: usize, up: BTreeSet<usize>, down: BTreeSet<usize>, through: BTreeSet<usize>) -> Self {
        debug_assert!(
            through.is_disjoint(&up) && through.is_disjoint(&down),
            "through must be disjoint from up ∪ down"
        );
        Row { at, up, down, through }
    }
}

/// Lays out `branches`, which must already be in *display order* (newest
/// first) with every parent of a branch appearing later in the slice than
/// the branch itself. Returns one [`Row`] per input branch, in the same
/// order. See [`branch_order`] for producing a valid ordering.
pub fn layout<B: BranchNode>(branches: &[B]) -> Vec<Row> {
    let branch_set: HashSet<B> = branches.iter().cloned().collect();
    let children: HashMap<B, HashSet<B>> = branches
        .iter()
        .map(|b| {
            let cs = b.children().into_iter().filter(|c| branch_set.contains(c)).collect();
            (b.clone(), cs)
        })
        .collect();
    let parents: HashMap<B, HashSet<B>> = branches
        .iter()
        .map(|b| {
            let ps = b.parents().into_iter().filter(|p| branch_set.contains(p)).collect();
            (b.clone(), ps)
        })
        .collect();

    let mut columns: HashMap<B, usize> = HashMap::new();
    let mut active: Vec<Option<B>> = Vec::new();
    let mut reached: HashSet<B> = HashSet::new();
    let mut grid: Vec<Row> = Vec::with_capacity(branches.len());

    for b in branches.iter().rev() {
        reached.insert(b.clone());
        let b_parents = &parents[b];

        let mut at = if b_parents.is_empty() {
            active.len()
        } else {
            b_parents.iter().map(|p| columns[p]).max().unwrap()
        };
        if !b_parents.is_empty() {
            let occupant_settled = match active.get(at).and_then(|slot| slot.as_ref()) {
                Some(occupant) => children[occupant].iter().all(|c| reached.contains(c)),
                None => true,
            };
            if !occupant_settled {
                at = active.len();
            }
        }
        columns.insert(b.clone(), at);

        let down: BTreeSet<usize> = b_parents.iter().map(|p| columns[p]).collect();

        for p in b_parents {
            if children[p].iter().all(|c| columns.contains_key(c)) {
                let col = columns[p];
                if col < active.len() {
                    active[col] = None;
                }
            }
        }

        let through: BTreeSet<usize> = active
            .iter()
            .enumerate()
            .filter(|(idx, occupant)| occupant.is_some() && *idx != at && !down.contains(idx))
            .map(|(idx, _)| idx)
            .collect();

        if !children[b].is_empty() {
            while active.len() <= at {
                active.push(None);
            }
            active[at] = Some(b.clone());
        }

        let up: BTreeSet<usize> = active
            .iter()
            .enumerate()
            .filter(|(idx, occupant)| occupant.is_some() && !through.contains(idx))
            .map(|(idx, _)| idx)
            .collect();

        while matches!(active.last(), Some(None)) {
            active.pop();
        }

        grid.push(Row::new(at, up, down, through));
    }
    grid.reverse();
    grid
}

fn all_descendants<B: BranchNode>(branch: &B) -> HashSet<B> {
    let mut all = HashSet::new();
    let mut todo = vec![branch.clone()];
    while let Some(b) = todo.pop() {
        for child in b.children() {
            if all.insert(child.clone()) {
                todo.push(child);
            }
        }
    }
    all
}

/// Tracks, for a shrinking set of branches, each branch's *blocker*: the
/// newest (by `modtime`) of its still-present transitive descendants, or
/// itself if it has no children (a leaf is its own blocker).
pub struct BranchBlockers<B: BranchNode> {
    branches: HashSet<B>,
    descendants_by_modtime: HashMap<B, Vec<B>>,
}

impl<B: BranchNode> BranchBlockers<B> {
    /// Builds a blocker map over `branches`.
    pub fn new(branches: impl IntoIterator<Item = B>) -> Self {
        BranchBlockers {
            branches: branches.into_iter().collect(),
            descendants_by_modtime: HashMap::new(),
        }
    }

    /// True if `branch` is still tracked.
    pub fn contains(&self, branch: &B) -> bool {
        self.branches.contains(branch)
    }

    /// Branches still tracked.
    pub fn keys(&self) -> impl Iterator<Item = &B> {
        self.branches.iter()
    }

    /// Resolves `branch`'s current blocker, lazily computing and caching
    /// its descendant list sorted by `modtime` ascending.
    pub fn blocker_of(&mut self, branch: &B) -> B {
        assert!(self.branches.contains(branch), "branch is not tracked");
        if branch.children().is_empty() {
            return branch.clone();
        }
        if !self.descendants_by_modtime.contains_key(branch) {
            let mut descendants: Vec<B> = all_descendants(branch).into_iter().collect();
            descendants.sort_by_key(|b| b.modtime());
            self.descendants_by_modtime.insert(branch.clone(), descendants);
        }
        loop {
            let candidate = self
                .descendants_by_modtime
                .get(branch)
                .and_then(|d| d.last())
                .cloned();
            match candidate {
                Some(candidate) if !self.branches.contains(&candidate) => {
                    self.descendants_by_modtime.get_mut(branch).unwrap().pop();
                }
                Some(candidate) => return self.blocker_of(&candidate),
                None => return branch.clone(),
            }
        }
    }

    /// Removes `branch` from the tracked set once it has been emitted.
    pub fn remove(&mut self, branch: &B) {
        self.branches.remove(branch);
        self.descendants_by_modtime.remove(branch);
    }
}

/// Emits branches such that every transitive descendant (within the input
/// set) of a branch is emitted before the branch itself, by repeatedly
/// taking the globally newest remaining blocker, then prioritizing its
/// parents on subsequent steps.
pub struct PriorityBranchIterator<B: BranchNode> {
    blockers: BranchBlockers<B>,
    queue: Vec<B>,
    priorities: Vec<B>,
}

impl<B: BranchNode> PriorityBranchIterator<B> {
    /// Creates an iterator over `blockers`, seeding the fallback queue with
    /// its keys sorted by `modtime` ascending (so `.pop()`/`.last()` favors
    /// the newest).
    pub fn new(blockers: BranchBlockers<B>) -> Self {
        let mut queue: Vec<B> = blockers.keys().cloned().collect();
        queue.sort_by_key(|b| b.modtime());
        PriorityBranchIterator {
            blockers,
            queue,
            priorities: Vec::new(),
        }
    }
}

impl<B: BranchNode> Iterator for PriorityBranchIterator<B> {
    type Item = B;

    fn next(&mut self) -> Option<B> {
        while let Some(last) = self.priorities.last() {
            if self.blockers.contains(last) {
                break;
            }
            self.priorities.pop();
        }
        while let Some(last) = self.queue.last() {
            if self.blockers.contains(last) {
                break;
            }
            self.queue.pop();
        }

        let seed = if let Some(candidate) = self.priorities.last().cloned() {
            candidate
        } else if let Some(candidate) = self.queue.last().cloned() {
            candidate
        } else {
            return None;
        };
        let blocker = self.blockers.blocker_of(&seed);
        debug_assert!(self.blockers.contains(&blocker));

        for parent in blocker.parents() {
            if self.blockers.contains(&parent) && !self.priorities.contains(&parent) {
                self.priorities.push(parent);
            }
        }
        self.blockers.remove(&blocker);
        Some(blocker)
    }
}

/// Orders `branches` into the display order `layout` expects: sort by
/// `modtime` ascending, then drain a [`PriorityBranchIterator`] over the
/// resulting blocker map.
pub fn branch_order<B: BranchNode>(branches: impl IntoIterator<Item = B>) -> Vec<B> {
    let mut sorted: Vec<B> = branches.into_iter().collect();
    sorted.sort_by_key(|b| b.modtime());
    PriorityBranchIterator::new(BranchBlockers::new(sorted)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone)]
    struct TestNode(Rc<RefCell<TestNodeData>>);

    struct TestNodeData {
        name: &'static str,
        modtime: i64,
        parents: Vec<TestNode>,
        children: Vec<TestNode>,
    }

    impl TestNode {
        fn new(name: &'static str, modtime: i64) -> Self {
            TestNode(Rc::new(RefCell::new(TestNodeData {
                name,
                modtime,
                parents: Vec::new(),
                children: Vec::new(),
            })))
        }

        fn add_parent(&self, parent: &TestNode) {
            self.0.borrow_mut().parents.push(parent.clone());
            parent.0.borrow_mut().children.push(self.clone());
        }

        fn name(&self) -> &'static str {
            self.0.borrow().name
        }
    }

    impl PartialEq for TestNode {
        fn eq(&self, other: &Self) -> bool {
            Rc::ptr_eq(&self.0, &other.0)
        }
    }
    impl Eq for TestNode {}
    impl Hash for TestNode {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            (Rc::as_ptr(&self.0) as usize).hash(state);
        }
    }

    impl BranchNode for TestNode {
        fn parents(&self) -> Vec<Self> {
            self.0.borrow().parents.clone()
        }
        fn children(&self) -> Vec<Self> {
            self.0.borrow().children.clone()
        }
        fn modtime(&self) -> i64 {
            self.0.borrow().modtime
        }
    }

    fn row(at: usize, up: &[usize], down: &[usize], through: &[usize]) -> Row {
        Row::new(
            at,
            up.iter().copied().collect(),
            down.iter().copied().collect(),
            through.iter().copied().collect(),
        )
    }

    #[test]
    fn linear_history() {
        let f1 = TestNode::new("f1", 1);
        let f2 = TestNode::new("f2", 2);
        let f3 = TestNode::new("f3", 3);
        let main = TestNode::new("main", 4);
        f2.add_parent(&f1);
        f3.add_parent(&f2);
        main.add_parent(&f3);

        // Display order: newest first.
        let branches = vec![main.clone(), f3.clone(), f2.clone(), f1.clone()];
        let rows = layout(&branches);

        assert_eq!(
            rows,
            vec![
                row(0, &[], &[0], &[]),
                row(0, &[0], &[0], &[]),
                row(0, &[0], &[0], &[]),
                row(0, &[0], &[], &[]),
            ]
        );
    }

    #[test]
    fn simple_merge_with_crossover() {
        let freebuilder = TestNode::new("freebuilder", 1);
        let workshop = TestNode::new("workshop", 2);
        let deadlock = TestNode::new("deadlock", 3);
        let autovalue = TestNode::new("autovalue", 4);
        let develop = TestNode::new("develop", 5);

        autovalue.add_parent(&develop);
        deadlock.add_parent(&develop);
        workshop.add_parent(&autovalue);
        workshop.add_parent(&deadlock);
        freebuilder.add_parent(&autovalue);

        let branches = vec![
            freebuilder.clone(),
            workshop.clone(),
            deadlock.clone(),
            autovalue.clone(),
            develop.clone(),
        ];
        let rows = layout(&branches);

        assert_eq!(
            rows,
            vec![
                row(1, &[], &[1], &[]),
                row(2, &[1], &[0, 1], &[]),
                row(0, &[0], &[0], &[1]),
                row(1, &[0, 1], &[0], &[]),
                row(0, &[0], &[], &[]),
            ]
        );
    }

    #[test]
    fn branch_order_emits_descendants_before_ancestors() {
        let root = TestNode::new("root", 1);
        let mid = TestNode::new("mid", 2);
        let tip = TestNode::new("tip", 3);
        mid.add_parent(&root);
        tip.add_parent(&mid);

        let order = branch_order(vec![root.clone(), mid.clone(), tip.clone()]);
        let names: Vec<_> = order.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["tip", "mid", "root"]);
    }
}
