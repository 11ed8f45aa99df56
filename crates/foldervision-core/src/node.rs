//! Directory node type.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// One scanned directory.
///
/// A node owns its children outright. Only direct counts are stored;
/// subtree totals are computed when asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderNode {
    /// Absolute path of the directory.
    pub path: PathBuf,

    /// Display name (last path component, or the whole path for a volume root).
    pub name: CompactString,

    /// Last modification time, if it could be read.
    pub modified: Option<SystemTime>,

    /// Number of files directly inside this directory.
    pub file_count: u64,

    /// Child directories, sorted by name once the node is finished.
    pub children: Vec<FolderNode>,

    /// Scanning stopped here early (depth limit, error, timeout or cancellation).
    pub truncated: bool,
}

impl FolderNode {
    /// Create an empty node for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = display_name(&path);
        Self {
            path,
            name,
            modified: None,
            file_count: 0,
            children: Vec::new(),
            truncated: false,
        }
    }

    /// Set the modification time.
    pub fn with_modified(mut self, modified: Option<SystemTime>) -> Self {
        self.modified = modified;
        self
    }

    /// Number of direct subfolders.
    pub fn subfolder_count(&self) -> usize {
        self.children.len()
    }

    /// Append a finished child.
    pub fn add_child(&mut self, child: FolderNode) {
        self.children.push(child);
    }

    /// Sort this node's children by name.
    ///
    /// Children finish their own sort before being attached, so one level is enough.
    pub fn sort_children(&mut self) {
        self.children.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Mark this node as truncated.
    pub fn mark_truncated(&mut self) {
        self.truncated = true;
    }

    /// Every folder below this one (excluding itself).
    pub fn total_subfolder_count(&self) -> u64 {
        self.descendants().count() as u64
    }

    /// Every file in this folder and below.
    pub fn total_file_count(&self) -> u64 {
        self.file_count + self.descendants().map(|n| n.file_count).sum::<u64>()
    }

    /// Depth of the deepest descendant relative to this node.
    pub fn max_depth(&self) -> u32 {
        let mut deepest = 0;
        let mut stack = vec![(self, 0u32)];
        while let Some((node, depth)) = stack.pop() {
            deepest = deepest.max(depth);
            stack.extend(node.children.iter().map(|c| (c, depth + 1)));
        }
        deepest
    }

    /// Depth-first iterator over all descendants.
    pub fn descendants(&self) -> Descendants<'_> {
        Descendants {
            stack: self.children.iter().rev().collect(),
        }
    }

    /// Find this node or a descendant by path.
    pub fn find(&self, path: &Path) -> Option<&FolderNode> {
        if self.path == path {
            return Some(self);
        }
        self.descendants().find(|n| n.path == path)
    }
}

impl fmt::Display for FolderNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} folders, {} files)",
            self.name,
            self.subfolder_count(),
            self.file_count
        )
    }
}

/// Pre-order iterator returned by [`FolderNode::descendants`].
pub struct Descendants<'a> {
    stack: Vec<&'a FolderNode>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = &'a FolderNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}

fn display_name(path: &Path) -> CompactString {
    path.file_name()
        .map(|n| CompactString::new(n.to_string_lossy()))
        .unwrap_or_else(|| CompactString::new(path.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(path: &str, files: u64, children: Vec<FolderNode>) -> FolderNode {
        let mut n = FolderNode::new(path);
        n.file_count = files;
        n.children = children;
        n
    }

    #[test]
    fn test_display_name() {
        assert_eq!(FolderNode::new("/data/photos").name, "photos");
        assert_eq!(FolderNode::new("/").name, "/");
    }

    #[test]
    fn test_totals_are_derived() {
        let tree = node(
            "/r",
            1,
            vec![
                node("/r/a", 3, vec![node("/r/a/c", 2, vec![])]),
                node("/r/b", 0, vec![]),
            ],
        );

        assert_eq!(tree.subfolder_count(), 2);
        assert_eq!(tree.total_subfolder_count(), 3);
        assert_eq!(tree.total_file_count(), 6);
        assert_eq!(tree.max_depth(), 2);
    }

    #[test]
    fn test_descendants_preorder() {
        let tree = node(
            "/r",
            0,
            vec![node("/r/a", 0, vec![node("/r/a/c", 0, vec![])]), node("/r/b", 0, vec![])],
        );
        let names: Vec<_> = tree.descendants().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["a", "c", "b"]);
    }

    #[test]
    fn test_sort_children_by_name() {
        let mut tree = node("/r", 0, vec![node("/r/zeta", 0, vec![]), node("/r/alpha", 0, vec![])]);
        tree.sort_children();
        assert_eq!(tree.children[0].name, "alpha");
        assert_eq!(tree.children[1].name, "zeta");
    }

    #[test]
    fn test_find() {
        let tree = node("/r", 0, vec![node("/r/a", 0, vec![node("/r/a/c", 4, vec![])])]);
        assert_eq!(tree.find(Path::new("/r/a/c")).map(|n| n.file_count), Some(4));
        assert!(tree.find(Path::new("/nope")).is_none());
    }
}
