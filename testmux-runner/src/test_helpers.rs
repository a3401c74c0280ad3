// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::tree::{
    DiscoveredTest, FlatIndex, StableId, TestStatus, TestTree, TestTreeBuilder, split_qualified,
};
use camino::Utf8PathBuf;

/// Builds a tree rooted at `/project` from pytest-style node ids.
pub(crate) fn pytest_tree(ids: &[&str]) -> TestTree {
    let mut builder = TestTreeBuilder::new("/project");
    for id in ids {
        let mut parts = split_qualified(id).into_iter();
        let file = Utf8PathBuf::from(parts.next().expect("id has a file part"));
        builder.add_test(DiscoveredTest {
            file,
            qualified_name: parts.map(str::to_owned).collect(),
            line: None,
            native_id: (*id).to_owned(),
            module: None,
        });
    }
    builder.build()
}

/// Returns the status of the node with the given id.
pub(crate) fn status_of(tree: &TestTree, index: &FlatIndex, id: &str) -> TestStatus {
    let index = index
        .get(&StableId::new(id))
        .unwrap_or_else(|| panic!("{id} is in the tree"));
    tree.node(index).status()
}
