//! In-memory bookmark tree and URL index
//!
//! One `BookmarkTree` holds a source's bookmarks for one reconciliation pass.
//! Nodes live in an arena and refer to each other by `NodeId`, so a URL node
//! can be reachable from several folders and tags without being cloned.
//!
//! ## Invariants
//!
//! - Exactly one root, always `NodeId(0)`.
//! - URL nodes never have children.
//! - A URL value maps to exactly one node; every extra folder or tag that
//!   references it adds an edge and a tag name, not a new node.
//! - The URL index always matches the URL nodes reachable from the root.
//!
//! Trees are never edited in place while visible: a pass builds a new tree
//! (or a clone of the current one) and publishes it through
//! [`SharedTree::swap`].

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{trace, warn};

use crate::models::{Record, SourceEntry, Tags};

/// Name of the folder that groups tag nodes under the root
pub const TAGS_BRANCH: &str = "TAGS";

/// Index of a node in its tree's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);
}

/// Kind of a tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Root,
    Folder,
    Tag,
    Url,
}

/// One entry in the bookmark tree
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub name: String,
    /// Set only for URL nodes
    pub url: Option<String>,
    pub description: String,
    /// Meaningful for URL nodes: every tag/folder context seen for the URL
    pub tags: Tags,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            url: None,
            description: String::new(),
            tags: Tags::new(),
            parent: None,
            children: Vec::new(),
        }
    }

    /// The owning parent (first folder or tag the node was attached to)
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

/// Arena-backed bookmark tree with its URL index
#[derive(Debug, Clone)]
pub struct BookmarkTree {
    nodes: Vec<Node>,
    index: BTreeMap<String, NodeId>,
    tags_branch: Option<NodeId>,
    tag_nodes: BTreeMap<String, NodeId>,
}

impl Default for BookmarkTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BookmarkTree {
    /// Create an empty tree holding only the root
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(NodeKind::Root, "ROOT")],
            index: BTreeMap::new(),
            tags_branch: None,
            tag_nodes: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn url_count(&self) -> usize {
        self.index.len()
    }

    /// Look up the node for a URL
    pub fn lookup(&self, url: &str) -> Option<NodeId> {
        self.index.get(url).copied()
    }

    /// URLs in the index, in key order
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    /// Append `child` under `parent`
    ///
    /// The first parent a node is attached to becomes its owning parent.
    /// Adding the same child to the same parent twice is a no-op, and an edge
    /// that would close a cycle is refused. Returns whether an edge was added.
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) -> bool {
        if self.nodes[parent.0].kind == NodeKind::Url {
            warn!(parent = %self.nodes[parent.0].name, "url nodes cannot have children");
            return false;
        }
        if parent == child {
            warn!(node = %self.nodes[parent.0].name, "refusing to add node as its own child");
            return false;
        }
        if self.reaches(child, parent) {
            warn!(
                parent = %self.nodes[parent.0].name,
                child = %self.nodes[child.0].name,
                "refusing edge that would create a cycle"
            );
            return false;
        }
        if self.nodes[parent.0].children.contains(&child) {
            warn!(
                parent = %self.nodes[parent.0].name,
                child = %self.nodes[child.0].name,
                "child already present, skipping"
            );
            return false;
        }

        trace!(child = %self.nodes[child.0].name, "adding child");
        self.nodes[parent.0].children.push(child);
        if self.nodes[child.0].parent.is_none() {
            self.nodes[child.0].parent = Some(parent);
        }
        true
    }

    /// Whether `to` is reachable from `from` through child edges
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if std::mem::replace(&mut visited[id.0], true) {
                continue;
            }
            stack.extend(self.nodes[id.0].children.iter().copied());
        }
        false
    }

    /// Find or create the folder `name` directly under `parent`
    pub fn add_folder(&mut self, parent: NodeId, name: &str) -> NodeId {
        let existing = self.nodes[parent.0].children.iter().copied().find(|&c| {
            let node = &self.nodes[c.0];
            node.kind == NodeKind::Folder && node.name == name && Some(c) != self.tags_branch
        });
        if let Some(id) = existing {
            return id;
        }

        let id = self.push(Node::new(NodeKind::Folder, name));
        self.add_child(parent, id);
        id
    }

    /// Find or create the tag node `name` under the tags branch
    pub fn add_tag(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.tag_nodes.get(name) {
            return id;
        }

        let branch = match self.tags_branch {
            Some(b) => b,
            None => {
                let b = self.push(Node::new(NodeKind::Folder, TAGS_BRANCH));
                self.add_child(NodeId::ROOT, b);
                self.tags_branch = Some(b);
                b
            }
        };

        let id = self.push(Node::new(NodeKind::Tag, name));
        self.add_child(branch, id);
        self.tag_nodes.insert(name.to_string(), id);
        id
    }

    /// Add a URL under `parent`, deduplicating through the index
    ///
    /// An unseen URL gets a new node registered in both tree and index. A
    /// known URL reuses its node: title and description are refreshed and
    /// `parent` gains an edge to it. Either way the parent's name joins the
    /// node's tag set when the parent is a folder or tag.
    ///
    /// Returns whether a node was created, and the node.
    pub fn add_url(
        &mut self,
        parent: NodeId,
        url: &str,
        title: &str,
        description: &str,
    ) -> (bool, NodeId) {
        let (created, id) = match self.index.get(url) {
            Some(&id) => {
                let node = &mut self.nodes[id.0];
                node.name = title.to_string();
                if !description.is_empty() {
                    node.description = description.to_string();
                }
                (false, id)
            }
            None => {
                let mut node = Node::new(NodeKind::Url, title);
                node.url = Some(url.to_string());
                node.description = description.to_string();
                let id = self.push(node);
                self.index.insert(url.to_string(), id);
                (true, id)
            }
        };

        let context = &self.nodes[parent.0];
        if matches!(context.kind, NodeKind::Folder | NodeKind::Tag) && Some(parent) != self.tags_branch
        {
            let name = context.name.clone();
            self.nodes[id.0].tags.insert(name);
        }
        // re-adding an existing edge is expected when a source repeats itself
        if !self.nodes[parent.0].children.contains(&id) {
            self.add_child(parent, id);
        }

        (created, id)
    }

    /// Insert one reader entry: folder path, the URL, then its tag edges
    pub fn insert_entry(&mut self, entry: &SourceEntry) -> (bool, NodeId) {
        let mut parent = NodeId::ROOT;
        for folder in &entry.folders {
            parent = self.add_folder(parent, folder);
        }

        let (created, id) = self.add_url(parent, &entry.url, &entry.title, &entry.description);

        // ancestors further up the folder path count as context too
        self.nodes[id.0].tags.extend(entry.folders.iter());

        for tag in &entry.tags {
            let tag_node = self.add_tag(tag);
            self.add_url(tag_node, &entry.url, &entry.title, &entry.description);
        }

        (created, id)
    }

    /// Collect every tag node that has an edge to a node carrying `node`'s URL
    ///
    /// Walks from the root, so it also finds tag edges that were added after
    /// the node's own tag set was last updated.
    pub fn get_parent_tags(&self, node: NodeId) -> Tags {
        match &self.nodes[node.0].url {
            Some(url) => self.parent_tags_for_url(url),
            None => Tags::new(),
        }
    }

    /// Same as [`get_parent_tags`](Self::get_parent_tags), keyed by URL
    ///
    /// Usable against a tree other than the one the URL came from.
    pub fn parent_tags_for_url(&self, url: &str) -> Tags {
        match self.lookup(url) {
            Some(id) => self.parent_tag_map().by_node.remove(&id).unwrap_or_default(),
            None => Tags::new(),
        }
    }

    /// Tag names per URL node, collected from every tag node in one walk
    fn parent_tag_map(&self) -> ParentTags {
        let mut map = ParentTags::default();
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![NodeId::ROOT];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut visited[id.0], true) {
                continue;
            }
            map.visited += 1;

            let node = &self.nodes[id.0];
            if node.kind == NodeKind::Tag {
                for &child in &node.children {
                    if self.nodes[child.0].kind == NodeKind::Url {
                        map.by_node.entry(child).or_default().insert(&node.name);
                    }
                }
            }
            stack.extend(node.children.iter().copied());
        }
        map
    }

    /// Folder names on the owning-parent chain, nearest first
    pub fn folder_parents(&self, node: NodeId) -> Vec<&str> {
        let mut folders = Vec::new();
        let mut current = self.nodes[node.0].parent;
        while let Some(id) = current {
            let parent = &self.nodes[id.0];
            if parent.kind == NodeKind::Folder {
                folders.push(parent.name.as_str());
            }
            current = parent.parent;
        }
        folders
    }

    /// Build the record for a URL node
    pub fn record(&self, node: NodeId, module: &str) -> Option<Record> {
        self.build_record(node, module, &self.get_parent_tags(node))
    }

    fn build_record(&self, node: NodeId, module: &str, parent_tags: &Tags) -> Option<Record> {
        let n = &self.nodes[node.0];
        let url = n.url.as_ref()?;
        let tags = n.tags.union(parent_tags);
        Some(
            Record::new(url.clone())
                .with_title(n.name.clone())
                .with_description(n.description.clone())
                .with_tags(tags.iter())
                .with_module(module),
        )
    }

    /// Records for every URL in the index
    pub fn records(&self, module: &str) -> Vec<Record> {
        let parents = self.parent_tag_map();
        self.index
            .values()
            .filter_map(|&id| self.build_record(id, module, parents.tags_of(id)))
            .collect()
    }

    /// Records for the given URLs; URLs missing from the index are skipped
    pub fn records_for<'a>(
        &self,
        urls: impl IntoIterator<Item = &'a str>,
        module: &str,
    ) -> Vec<Record> {
        let parents = self.parent_tag_map();
        urls.into_iter()
            .filter_map(|url| match self.lookup(url) {
                Some(id) => self.build_record(id, module, parents.tags_of(id)),
                None => {
                    warn!(url, "url missing from index");
                    None
                }
            })
            .collect()
    }

    /// Rebuild the URL index by walking from the root
    pub fn rebuild_index(&mut self) {
        let mut index = BTreeMap::new();
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![NodeId::ROOT];
        while let Some(id) = stack.pop() {
            if std::mem::replace(&mut visited[id.0], true) {
                continue;
            }
            let node = &self.nodes[id.0];
            if let Some(url) = &node.url {
                index.insert(url.clone(), id);
            }
            stack.extend(node.children.iter().copied());
        }
        self.index = index;
    }

    /// Whether the index matches the URL nodes reachable from the root
    pub fn index_is_consistent(&self) -> bool {
        let mut rebuilt = self.clone();
        rebuilt.rebuild_index();
        rebuilt.index == self.index
    }

    /// Render the tree as indented text, for debugging
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(NodeId::ROOT, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let node = &self.nodes[id.0];
            let label = node.url.as_deref().unwrap_or(&node.name);
            let _ = writeln!(out, "{}{:?} <{}>", "  ".repeat(depth), node.kind, label);
            for &child in node.children.iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        out
    }
}

/// Result of one walk over the tag nodes
#[derive(Debug, Default)]
struct ParentTags {
    by_node: BTreeMap<NodeId, Tags>,
    /// Nodes visited by the walk
    visited: usize,
}

impl ParentTags {
    fn tags_of(&self, node: NodeId) -> &Tags {
        static EMPTY: Tags = Tags::EMPTY;
        self.by_node.get(&node).unwrap_or(&EMPTY)
    }
}

/// A tree that readers can query while the next one is being built
///
/// Readers get an `Arc` snapshot; the writer builds a complete tree off to the
/// side and publishes it in one swap. A partially built tree is never visible.
#[derive(Debug, Clone, Default)]
pub struct SharedTree(Arc<RwLock<Arc<BookmarkTree>>>);

impl SharedTree {
    pub fn new(tree: BookmarkTree) -> Self {
        Self(Arc::new(RwLock::new(Arc::new(tree))))
    }

    /// The currently published tree
    pub fn snapshot(&self) -> Arc<BookmarkTree> {
        let guard = self.0.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Publish a new tree, returning the one it replaced
    pub fn swap(&self, tree: BookmarkTree) -> Arc<BookmarkTree> {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(tree))
    }
}
