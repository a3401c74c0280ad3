// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{LastRun, NodeIndex, NodeKind, StableId, TestStatus, TestTree};
use crate::errors::DuplicateIdError;
use std::collections::{BTreeSet, HashMap};

/// An index from ids to nodes, produced by [`FlatteningVisitor::flatten`].
#[derive(Clone, Debug, Default)]
pub struct FlatIndex {
    by_id: HashMap<StableId, NodeIndex>,
    by_native: HashMap<String, NodeIndex>,
    leaves: Vec<NodeIndex>,
}

impl FlatIndex {
    /// Looks up a node by its stable id.
    pub fn get(&self, id: &StableId) -> Option<NodeIndex> {
        self.by_id.get(id).copied()
    }

    /// Looks up a node by the id its framework uses.
    pub fn get_native(&self, native_id: &str) -> Option<NodeIndex> {
        self.by_native.get(native_id).copied()
    }

    /// Returns every leaf in the tree, in pre-order.
    pub fn leaves(&self) -> &[NodeIndex] {
        &self.leaves
    }

    /// Returns the number of indexed nodes.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns true if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Walks a tree and indexes every node by id.
#[derive(Debug)]
pub struct FlatteningVisitor<'a> {
    tree: &'a TestTree,
    index: FlatIndex,
}

impl<'a> FlatteningVisitor<'a> {
    /// Flattens `tree` into an index.
    ///
    /// Returns an error if two nodes share a stable id. Every node reachable from the root
    /// appears in the index exactly once.
    pub fn flatten(tree: &'a TestTree) -> Result<FlatIndex, DuplicateIdError> {
        let mut visitor = Self {
            tree,
            index: FlatIndex::default(),
        };
        for node in tree.preorder(NodeIndex::ROOT) {
            visitor.visit(node)?;
        }
        Ok(visitor.index)
    }

    fn visit(&mut self, index: NodeIndex) -> Result<(), DuplicateIdError> {
        let node = self.tree.node(index);
        if let Some(&existing) = self.index.by_id.get(node.id()) {
            return Err(DuplicateIdError::new(
                node.id().clone(),
                self.tree.node(existing).kind(),
                node.kind(),
            ));
        }
        self.index.by_id.insert(node.id().clone(), index);
        // Native ids are only used to correlate results, and a collision there is harmless for
        // non-leaves: keep the first.
        self.index
            .by_native
            .entry(node.native_id().to_owned())
            .or_insert(index);
        if node.kind() == NodeKind::Function {
            self.index.leaves.push(index);
        }
        Ok(())
    }
}

/// Clears results ahead of a run.
#[derive(Debug)]
pub struct ResultResetVisitor;

impl ResultResetVisitor {
    /// Resets every leaf in `subset` (or every leaf in the tree, if `None`) to
    /// [`TestStatus::NotRun`], clearing its last-run metadata, then recomputes aggregates.
    ///
    /// Ids in `subset` may name non-leaves, in which case all leaves under them are reset. Ids
    /// that aren't in the tree are ignored. Leaves outside the subset are untouched.
    ///
    /// Returns the ids of every node whose status may have changed.
    pub fn reset(
        tree: &mut TestTree,
        index: &FlatIndex,
        subset: Option<&[StableId]>,
    ) -> Vec<StableId> {
        let starts: Vec<NodeIndex> = match subset {
            None => vec![NodeIndex::ROOT],
            Some(ids) => ids.iter().filter_map(|id| index.get(id)).collect(),
        };

        let mut affected = BTreeSet::new();
        for &start in &starts {
            for leaf in tree.leaves_under(start) {
                let node = tree.node_mut(leaf);
                node.status = TestStatus::NotRun;
                node.last_run = LastRun::default();
                affected.insert(leaf);
            }
            tree.recompute_subtree(start);
            for node in tree.preorder(start) {
                affected.insert(node);
            }
        }
        for &start in &starts {
            tree.recompute_ancestors(start);
            affected.extend(tree.ancestors(start));
        }

        affected
            .into_iter()
            .map(|index| tree.node(index).id().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_helpers::{pytest_tree, status_of},
        tree::{DiscoveredTest, TestTreeBuilder},
    };
    use pretty_assertions::assert_eq;
    use test_strategy::proptest;

    #[test]
    fn flatten_indexes_every_node() {
        let tree = pytest_tree(&[
            "tests/test_a.py::TestX::test_one",
            "tests/test_a.py::test_two",
            "tests/test_b.py::test_three",
        ]);
        let flat = FlatteningVisitor::flatten(&tree).expect("no duplicates");
        assert_eq!(flat.len(), tree.len());
        assert_eq!(flat.leaves().len(), 3);
        for index in tree.preorder(NodeIndex::ROOT) {
            let node = tree.node(index);
            assert_eq!(flat.get(node.id()), Some(index), "{} indexed", node.id());
        }
    }

    #[test]
    fn flatten_rejects_duplicate_ids() {
        let mut builder = TestTreeBuilder::new("/project");
        for _ in 0..2 {
            builder.add_test(DiscoveredTest {
                file: "test_a.py".into(),
                qualified_name: vec!["test_dup".to_owned()],
                line: None,
                native_id: "test_a.py::test_dup".to_owned(),
                module: None,
            });
        }
        let tree = builder.build();
        let error = FlatteningVisitor::flatten(&tree).expect_err("duplicate detected");
        assert_eq!(error.id().as_str(), "test_a.py::test_dup");
    }

    #[test]
    fn reset_subset_leaves_others_alone() {
        let mut tree = pytest_tree(&["test_m.py::test_a", "test_m.py::test_b"]);
        let flat = FlatteningVisitor::flatten(&tree).unwrap();
        let a = flat.get(&StableId::new("test_m.py::test_a")).unwrap();
        let b = flat.get(&StableId::new("test_m.py::test_b")).unwrap();
        tree.set_leaf_status(a, TestStatus::Pass, LastRun::default());
        tree.set_leaf_status(
            b,
            TestStatus::Fail,
            LastRun {
                message: Some("assert 1 == 2".to_owned()),
                ..LastRun::default()
            },
        );

        let affected =
            ResultResetVisitor::reset(&mut tree, &flat, Some(&[StableId::new("test_m.py::test_a")]));

        assert_eq!(tree.node(a).status(), TestStatus::NotRun);
        assert_eq!(tree.node(b).status(), TestStatus::Fail);
        assert_eq!(
            tree.node(b).last_run().message.as_deref(),
            Some("assert 1 == 2")
        );
        assert_eq!(status_of(&tree, &flat, "test_m.py"), TestStatus::Fail);
        assert!(affected.contains(&StableId::new("test_m.py::test_a")));
        assert!(!affected.contains(&StableId::new("test_m.py::test_b")));
    }

    #[test]
    fn reset_non_leaf_resets_descendants() {
        let mut tree = pytest_tree(&[
            "test_m.py::TestX::test_a",
            "test_m.py::TestX::test_b",
            "test_m.py::test_c",
        ]);
        let flat = FlatteningVisitor::flatten(&tree).unwrap();
        for &leaf in flat.leaves() {
            tree.set_leaf_status(leaf, TestStatus::Pass, LastRun::default());
        }

        ResultResetVisitor::reset(&mut tree, &flat, Some(&[StableId::new("test_m.py::TestX")]));
        assert_eq!(status_of(&tree, &flat, "test_m.py::TestX::test_a"), TestStatus::NotRun);
        assert_eq!(status_of(&tree, &flat, "test_m.py::TestX::test_b"), TestStatus::NotRun);
        assert_eq!(status_of(&tree, &flat, "test_m.py::test_c"), TestStatus::Pass);
        assert_eq!(status_of(&tree, &flat, "test_m.py::TestX"), TestStatus::NotRun);
        assert_eq!(status_of(&tree, &flat, "test_m.py"), TestStatus::Pass);
    }

    #[test]
    fn reset_is_idempotent() {
        let mut tree = pytest_tree(&["test_m.py::test_a", "test_n.py::test_b"]);
        let flat = FlatteningVisitor::flatten(&tree).unwrap();
        for &leaf in flat.leaves() {
            tree.set_leaf_status(leaf, TestStatus::Error, LastRun::default());
        }
        ResultResetVisitor::reset(&mut tree, &flat, None);
        let first = tree.display().to_string();
        ResultResetVisitor::reset(&mut tree, &flat, None);
        assert_eq!(tree.display().to_string(), first);
        assert_eq!(tree.root().status(), TestStatus::NotRun);
    }

    const STATUSES: [TestStatus; 8] = [
        TestStatus::NotRun,
        TestStatus::Discovered,
        TestStatus::Running,
        TestStatus::Idle,
        TestStatus::Pass,
        TestStatus::Fail,
        TestStatus::Skip,
        TestStatus::Error,
    ];

    /// After arbitrary leaf updates, every non-leaf carries the worst status of its children.
    #[proptest(cases = 64)]
    fn aggregation_law(
        #[strategy(proptest::collection::vec((0usize..6, 0usize..8), 0..32))] updates: Vec<(
            usize,
            usize,
        )>,
    ) {
        let mut tree = pytest_tree(&[
            "pkg/test_a.py::TestX::test_1",
            "pkg/test_a.py::TestX::test_2",
            "pkg/test_a.py::test_3",
            "pkg/sub/test_b.py::test_4",
            "test_c.py::TestY::TestZ::test_5",
            "test_c.py::test_6",
        ]);
        let flat = FlatteningVisitor::flatten(&tree).unwrap();
        let leaves = flat.leaves().to_vec();
        for (leaf, status) in updates {
            tree.set_leaf_status(leaves[leaf], STATUSES[status], LastRun::default());
        }

        for index in tree.preorder(NodeIndex::ROOT) {
            let node = tree.node(index);
            if node.is_leaf() {
                continue;
            }
            let expected = node
                .children()
                .iter()
                .map(|&child| tree.node(child).status())
                .reduce(TestStatus::worst)
                .unwrap_or(TestStatus::Idle);
            proptest::prop_assert_eq!(node.status(), expected, "status of {}", node.id());
        }
    }
}
