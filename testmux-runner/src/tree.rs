// Copyright (c) The testmux Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The canonical, framework-agnostic test tree.
//!
//! A tree is rooted at a [`NodeKind::Folder`] for the provider's root directory. Folders contain
//! further folders and files, files contain suites (classes) and functions, and suites contain
//! nested suites and functions. Nodes are stored in an arena and referenced by [`NodeIndex`], so
//! ownership is strictly tree-shaped.
//!
//! Non-leaf statuses are never set directly: they are the worst-case aggregate of their children,
//! recomputed bottom-up whenever a leaf changes.

mod visitors;

pub use visitors::{FlatIndex, FlatteningVisitor, ResultResetVisitor};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, time::Duration};
use swrite::{SWrite, swrite};

/// A deterministic identifier for a node, derived from its file path and qualified name.
///
/// * Folders: the directory relative to the root directory, or `.` for the root itself.
/// * Files: the file path relative to the root directory, with `/` separators.
/// * Suites and functions: `<file>::<Class>[::<Nested>...]::<function>`.
///
/// For pytest, the id of a file, suite or function is the same as its pytest node id.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    /// The separator between the file and each component of the qualified name.
    pub const SEPARATOR: &'static str = "::";

    /// The id of the root folder.
    pub const ROOT: &'static str = ".";

    /// Creates a new `StableId` from an already-derived string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the id of a folder, given its path relative to the root directory.
    pub fn for_folder(relative_dir: &Utf8Path) -> Self {
        let normalized = normalize_relative(relative_dir);
        if normalized.is_empty() {
            Self(Self::ROOT.to_owned())
        } else {
            Self(normalized)
        }
    }

    /// Derives the id of a file, given its path relative to the root directory.
    pub fn for_file(relative_file: &Utf8Path) -> Self {
        Self(normalize_relative(relative_file))
    }

    /// Derives the id of a suite or function inside a file.
    pub fn for_member<S: AsRef<str>>(relative_file: &Utf8Path, qualified_name: &[S]) -> Self {
        let mut id = normalize_relative(relative_file);
        for part in qualified_name {
            id.push_str(Self::SEPARATOR);
            id.push_str(part.as_ref());
        }
        Self(id)
    }

    /// Returns the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits the id into its file part and the components of its qualified name.
    ///
    /// Separators inside parameter brackets (`test_x[a::b]`) are not treated as separators.
    pub fn split(&self) -> (&str, Vec<&str>) {
        let mut parts = split_qualified(&self.0).into_iter();
        let file = parts.next().unwrap_or_default();
        (file, parts.collect())
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StableId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn normalize_relative(path: &Utf8Path) -> String {
    let s = path.as_str().replace('\\', "/");
    let mut s = s.as_str();
    while let Some(rest) = s.strip_prefix("./") {
        s = rest;
    }
    if s == "." {
        s = "";
    }
    s.trim_end_matches('/').to_owned()
}

/// Splits a node id on `::`, ignoring separators inside `[...]`.
pub(crate) fn split_qualified(id: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let bytes = id.as_bytes();
    let mut depth = 0usize;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'[' => depth += 1,
            b']' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                parts.push(&id[start..i]);
                i += 2;
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&id[start..]);
    parts
}

/// The kind of a node in the tree.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// A folder: the root directory or a package below it.
    Folder,

    /// A test file (module).
    File,

    /// A test suite, typically a class.
    Suite,

    /// A test function. Always a leaf.
    Function,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Folder => write!(f, "folder"),
            Self::File => write!(f, "file"),
            Self::Suite => write!(f, "suite"),
            Self::Function => write!(f, "function"),
        }
    }
}

/// The status of a node.
///
/// For leaves this is the last known result. For non-leaves this is the worst-case aggregate of
/// the children, under the ordering returned by [`TestStatus::severity`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    /// The test was reset before a run and has not been reported since.
    NotRun,

    /// The test was discovered and has never been run.
    Discovered,

    /// The test is currently running.
    Running,

    /// A non-leaf with no children.
    Idle,

    /// The test passed.
    Pass,

    /// The test failed an assertion.
    Fail,

    /// The test was skipped.
    Skip,

    /// The test errored or did not complete.
    Error,
}

impl TestStatus {
    /// Returns the severity of this status: higher is worse.
    ///
    /// The ordering is `Error > Fail > Running > Skip > Pass > NotRun > Idle > Discovered`.
    pub fn severity(self) -> u8 {
        match self {
            Self::Discovered => 0,
            Self::Idle => 1,
            Self::NotRun => 2,
            Self::Pass => 3,
            Self::Skip => 4,
            Self::Running => 5,
            Self::Fail => 6,
            Self::Error => 7,
        }
    }

    /// Returns the worse of two statuses.
    pub fn worst(self, other: Self) -> Self {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Returns true if this is a terminal result for a leaf.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Pass | Self::Fail | Self::Skip | Self::Error)
    }

    /// Returns the string representation of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotRun => "not-run",
            Self::Discovered => "discovered",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Skip => "skip",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The index of a node within a [`TestTree`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeIndex(usize);

impl NodeIndex {
    /// The index of the root node.
    pub const ROOT: Self = Self(0);
}

/// Metadata from the last run of a leaf.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LastRun {
    /// How long the test took.
    pub duration: Option<Duration>,

    /// The failure, error or skip message.
    pub message: Option<String>,

    /// The traceback, if one was reported.
    pub traceback: Option<String>,
}

/// A node in the test tree.
#[derive(Clone, Debug)]
pub struct TestNode {
    id: StableId,
    native_id: String,
    name: String,
    kind: NodeKind,
    file: Option<Utf8PathBuf>,
    line: Option<u32>,
    status: TestStatus,
    last_run: LastRun,
    parent: Option<NodeIndex>,
    children: Vec<NodeIndex>,
}

impl TestNode {
    /// Returns the stable id of this node.
    pub fn id(&self) -> &StableId {
        &self.id
    }

    /// Returns the id the test framework itself uses for this node.
    ///
    /// For pytest this is the node id; for unittest it's the dotted name.
    pub fn native_id(&self) -> &str {
        &self.native_id
    }

    /// Returns the display name of this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the kind of node this is.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Returns the file this node is defined in, relative to the root directory.
    pub fn file(&self) -> Option<&Utf8Path> {
        self.file.as_deref()
    }

    /// Returns the line number this node is defined at, if known.
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// Returns the current status of this node.
    pub fn status(&self) -> TestStatus {
        self.status
    }

    /// Returns metadata from the last run of this node.
    pub fn last_run(&self) -> &LastRun {
        &self.last_run
    }

    /// Returns the parent of this node, or `None` for the root.
    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    /// Returns the children of this node.
    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }

    /// Returns true if this node is a test function.
    pub fn is_leaf(&self) -> bool {
        self.kind == NodeKind::Function
    }
}

/// A canonical test tree.
#[derive(Clone, Debug)]
pub struct TestTree {
    root_dir: Utf8PathBuf,
    nodes: Vec<TestNode>,
}

impl TestTree {
    /// Returns the absolute root directory this tree was discovered in.
    pub fn root_dir(&self) -> &Utf8Path {
        &self.root_dir
    }

    /// Returns the root folder.
    pub fn root(&self) -> &TestNode {
        &self.nodes[NodeIndex::ROOT.0]
    }

    /// Returns the node at the given index.
    ///
    /// # Panics
    ///
    /// Panics if the index doesn't belong to this tree.
    pub fn node(&self, index: NodeIndex) -> &TestNode {
        &self.nodes[index.0]
    }

    /// Returns the number of nodes in this tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the tree contains only its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Iterates over nodes under `start` (inclusive) in pre-order.
    pub fn preorder(&self, start: NodeIndex) -> Preorder<'_> {
        Preorder {
            tree: self,
            stack: vec![start],
        }
    }

    /// Returns all leaves under `start` (inclusive), in pre-order.
    pub fn leaves_under(&self, start: NodeIndex) -> Vec<NodeIndex> {
        self.preorder(start)
            .filter(|&index| self.node(index).is_leaf())
            .collect()
    }

    /// Returns the ancestors of `index`, nearest first, ending at the root.
    pub fn ancestors(&self, index: NodeIndex) -> Ancestors<'_> {
        Ancestors {
            tree: self,
            next: self.node(index).parent,
        }
    }

    /// Returns a displayer for this tree.
    pub fn display(&self) -> TreeDisplay<'_> {
        TreeDisplay { tree: self }
    }

    // ---
    // Mutation, restricted to the crate
    // ---

    /// Sets the status of a leaf and recomputes its ancestors. Returns the ids of every node
    /// whose status changed, leaf first.
    pub(crate) fn set_leaf_status(
        &mut self,
        index: NodeIndex,
        status: TestStatus,
        last_run: LastRun,
    ) -> Vec<StableId> {
        let node = &mut self.nodes[index.0];
        debug_assert!(node.is_leaf(), "set_leaf_status called on a non-leaf");
        let changed = node.status != status || node.last_run != last_run;
        node.status = status;
        node.last_run = last_run;

        let mut affected = Vec::new();
        if changed {
            affected.push(node.id.clone());
        }
        affected.extend(self.recompute_ancestors(index));
        affected
    }

    pub(crate) fn set_line(&mut self, index: NodeIndex, line: u32) {
        self.nodes[index.0].line = Some(line);
    }

    /// Recomputes aggregate statuses for every ancestor of `index`, stopping early once an
    /// ancestor's status is unchanged. Returns the ids of ancestors that changed.
    pub(crate) fn recompute_ancestors(&mut self, index: NodeIndex) -> Vec<StableId> {
        let mut changed = Vec::new();
        let mut next = self.nodes[index.0].parent;
        while let Some(current) = next {
            let aggregate = self.aggregate_of(current);
            let node = &mut self.nodes[current.0];
            if node.status == aggregate {
                break;
            }
            node.status = aggregate;
            changed.push(node.id.clone());
            next = node.parent;
        }
        changed
    }

    /// Recomputes aggregate statuses for every non-leaf under `start` (inclusive), bottom-up.
    pub(crate) fn recompute_subtree(&mut self, start: NodeIndex) {
        let order: Vec<_> = self.preorder(start).collect();
        for &index in order.iter().rev() {
            if !self.nodes[index.0].is_leaf() {
                self.nodes[index.0].status = self.aggregate_of(index);
            }
        }
    }

    /// Copies leaf results over from a previous tree for every leaf whose id survived, then
    /// recomputes all aggregates.
    pub(crate) fn carry_forward(&mut self, previous: &TestTree, previous_index: &FlatIndex) {
        for node in self.nodes.iter_mut().filter(|node| node.is_leaf()) {
            if let Some(old) = previous_index.get(&node.id) {
                let old = previous.node(old);
                if old.is_leaf() {
                    node.status = old.status;
                    node.last_run = old.last_run.clone();
                    if node.line.is_none() {
                        node.line = old.line;
                    }
                }
            }
        }
        self.recompute_subtree(NodeIndex::ROOT);
    }

    pub(crate) fn node_mut(&mut self, index: NodeIndex) -> &mut TestNode {
        &mut self.nodes[index.0]
    }

    fn aggregate_of(&self, index: NodeIndex) -> TestStatus {
        self.nodes[index.0]
            .children
            .iter()
            .map(|child| self.nodes[child.0].status)
            .reduce(TestStatus::worst)
            .unwrap_or(TestStatus::Idle)
    }
}

/// A pre-order iterator over a subtree.
///
/// Returned by [`TestTree::preorder`].
#[derive(Debug)]
pub struct Preorder<'a> {
    tree: &'a TestTree,
    stack: Vec<NodeIndex>,
}

impl Iterator for Preorder<'_> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.stack.pop()?;
        // Push in reverse so that the first child is visited first.
        self.stack
            .extend(self.tree.node(index).children.iter().rev().copied());
        Some(index)
    }
}

/// An iterator over the ancestors of a node.
///
/// Returned by [`TestTree::ancestors`].
#[derive(Debug)]
pub struct Ancestors<'a> {
    tree: &'a TestTree,
    next: Option<NodeIndex>,
}

impl Iterator for Ancestors<'_> {
    type Item = NodeIndex;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        self.next = self.tree.node(index).parent;
        Some(index)
    }
}

/// Displays a tree as an indented listing.
///
/// Returned by [`TestTree::display`].
#[derive(Debug)]
pub struct TreeDisplay<'a> {
    tree: &'a TestTree,
}

impl fmt::Display for TreeDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stack = vec![(NodeIndex::ROOT, 0usize)];
        while let Some((index, depth)) = stack.pop() {
            let node = self.tree.node(index);
            let mut line = String::new();
            swrite!(line, "{:indent$}{} [{}]", "", node.name, node.status, indent = depth * 2);
            if let Some(message) = &node.last_run.message {
                let first_line = message.lines().next().unwrap_or_default();
                swrite!(line, ": {first_line}");
            }
            writeln!(f, "{line}")?;
            stack.extend(node.children.iter().rev().map(|&child| (child, depth + 1)));
        }
        Ok(())
    }
}

/// A single test function reported by discovery.
///
/// Accepted by [`TestTreeBuilder::add_test`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveredTest {
    /// The file the test is defined in, relative to the root directory.
    pub file: Utf8PathBuf,

    /// Enclosing suites, outermost first, followed by the function name.
    pub qualified_name: Vec<String>,

    /// The line the function is defined at, if known.
    pub line: Option<u32>,

    /// The id the framework uses for this test.
    pub native_id: String,

    /// For frameworks that address tests by dotted module path, the module of the file.
    ///
    /// When set, native ids for enclosing folders, the file and suites are derived as dotted
    /// names. Otherwise, they're the same as the stable id.
    pub module: Option<String>,
}

/// Builds a [`TestTree`] from discovered tests.
///
/// Folders, files and suites are created on demand and shared between tests. Functions are
/// always added as new nodes, even if an identical id was seen before: that's caught later by the
/// [`FlatteningVisitor`].
#[derive(Debug)]
pub struct TestTreeBuilder {
    tree: TestTree,
    containers: HashMap<StableId, NodeIndex>,
}

impl TestTreeBuilder {
    /// Creates a new builder for a tree rooted at `root_dir`.
    pub fn new(root_dir: impl Into<Utf8PathBuf>) -> Self {
        let root_dir = root_dir.into();
        let name = root_dir
            .file_name()
            .map_or_else(|| root_dir.to_string(), str::to_owned);
        let root = TestNode {
            id: StableId::new(StableId::ROOT),
            native_id: StableId::ROOT.to_owned(),
            name,
            kind: NodeKind::Folder,
            file: None,
            line: None,
            status: TestStatus::Idle,
            last_run: LastRun::default(),
            parent: None,
            children: Vec::new(),
        };
        let mut containers = HashMap::new();
        containers.insert(root.id.clone(), NodeIndex::ROOT);
        Self {
            tree: TestTree {
                root_dir,
                nodes: vec![root],
            },
            containers,
        }
    }

    /// Adds a test function, creating its enclosing folders, file and suites as needed.
    pub fn add_test(&mut self, test: DiscoveredTest) -> NodeIndex {
        let DiscoveredTest {
            file,
            qualified_name,
            line,
            native_id,
            module,
        } = test;
        let dotted = module.as_deref().map(|module| module.split('.').collect::<Vec<_>>());

        // Folders.
        let mut parent = NodeIndex::ROOT;
        let mut folder = Utf8PathBuf::new();
        let dirs: Vec<_> = file
            .parent()
            .map(|dir| dir.components().map(|c| c.as_str().to_owned()).collect())
            .unwrap_or_default();
        for (depth, dir) in dirs.iter().enumerate() {
            if dir == "." {
                continue;
            }
            folder.push(dir);
            let id = StableId::for_folder(&folder);
            // Packages only have dotted names when the module path mirrors the folder layout.
            let native = match &dotted {
                Some(parts) if parts.len() == dirs.len() + 1 => parts[..=depth].join("."),
                _ => id.as_str().to_owned(),
            };
            parent = self.container(parent, id, native, dir.clone(), NodeKind::Folder, None);
        }

        // File.
        let file_id = StableId::for_file(&file);
        let file_native = module.clone().unwrap_or_else(|| file_id.as_str().to_owned());
        let file_name = file.file_name().unwrap_or(file.as_str()).to_owned();
        parent = self.container(
            parent,
            file_id,
            file_native,
            file_name,
            NodeKind::File,
            Some(file.clone()),
        );

        // Suites.
        let (function, suites) = match qualified_name.split_last() {
            Some((function, suites)) => (function.clone(), suites),
            None => (String::new(), &[][..]),
        };
        for depth in 0..suites.len() {
            let id = StableId::for_member(&file, &suites[..=depth]);
            let native = match &module {
                Some(module) => format!("{module}.{}", suites[..=depth].join(".")),
                None => id.as_str().to_owned(),
            };
            parent = self.container(
                parent,
                id,
                native,
                suites[depth].clone(),
                NodeKind::Suite,
                Some(file.clone()),
            );
        }

        // Function.
        let id = StableId::for_member(&file, &qualified_name);
        self.push(TestNode {
            id,
            native_id,
            name: function,
            kind: NodeKind::Function,
            file: Some(file),
            line,
            status: TestStatus::Discovered,
            last_run: LastRun::default(),
            parent: Some(parent),
            children: Vec::new(),
        })
    }

    /// Finishes building the tree, computing aggregate statuses.
    pub fn build(mut self) -> TestTree {
        self.tree.recompute_subtree(NodeIndex::ROOT);
        self.tree
    }

    fn container(
        &mut self,
        parent: NodeIndex,
        id: StableId,
        native_id: String,
        name: String,
        kind: NodeKind,
        file: Option<Utf8PathBuf>,
    ) -> NodeIndex {
        if let Some(&index) = self.containers.get(&id) {
            return index;
        }
        let index = self.push(TestNode {
            id: id.clone(),
            native_id,
            name,
            kind,
            file,
            line: None,
            status: TestStatus::Idle,
            last_run: LastRun::default(),
            parent: Some(parent),
            children: Vec::new(),
        });
        self.containers.insert(id, index);
        index
    }

    fn push(&mut self, node: TestNode) -> NodeIndex {
        let index = NodeIndex(self.tree.nodes.len());
        if let Some(parent) = node.parent {
            self.tree.nodes[parent.0].children.push(index);
        }
        self.tree.nodes.push(node);
        index
    }
}
