//! Directory tree builder (spec C2).

use std::collections::BTreeMap;
use std::path::PathBuf;

use rayon::prelude::*;
use walkdir::WalkDir;

use crate::model::path::{CanonicalPath, CaseFold};

/// One directory in the enumerated source tree. Children are kept in a
/// `BTreeMap` keyed by case-folded name so iteration order is deterministic
/// and case-insensitive across repeated runs, while the node itself retains
/// the original-case name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub path: CanonicalPath,
    pub name: String,
    pub children: BTreeMap<CaseFold, TreeNode>,
    pub local_size: u64,
    pub local_file_count: u64,
    pub total_size: u64,
    pub total_file_count: u64,
    /// Set when this subtree's enumeration hit an error partway through;
    /// `total_size`/`total_file_count` are then a lower bound, not exact.
    pub enum_failed: bool,
}

impl TreeNode {
    fn empty(path: CanonicalPath) -> Self {
        let name = path.leaf_name().to_string();
        TreeNode {
            path,
            name,
            children: BTreeMap::new(),
            local_size: 0,
            local_file_count: 0,
            total_size: 0,
            total_file_count: 0,
            enum_failed: false,
        }
    }

    pub fn is_empty_subtree(&self) -> bool {
        self.total_file_count == 0
    }
}

/// Reported when a subdirectory under the source cannot be fully enumerated.
/// The affected subtree is still present in the tree (size 0, `enum_failed`
/// set) and the walk continues past it — spec §4.2.
#[derive(Debug, Clone)]
pub struct SubtreeEnumError {
    pub path: PathBuf,
    pub message: String,
}

/// Enumerates all directories under `source` into an in-memory tree with
/// aggregated size/count per node. A single top-down `WalkDir` pass collects
/// each directory's immediate files; a second, reverse-sorted pass folds
/// child totals into parents, giving `TotalSize(node) = LocalSize(node) +
/// Σ TotalSize(child)` directly rather than trusting filesystem metadata
/// twice.
pub fn build_tree(source: &CanonicalPath) -> (TreeNode, Vec<SubtreeEnumError>) {
    let mut errors = Vec::new();
    let mut nodes: BTreeMap<PathBuf, TreeNode> = BTreeMap::new();
    nodes.insert(
        source.as_path().to_path_buf(),
        TreeNode::empty(source.clone()),
    );

    // Directory structure and the error path have to stay on one sequential
    // walk (entries must be seen in a stable order and a failed entry needs
    // to mark its node before the walk moves on); the per-file `stat` calls
    // are independent of each other and of that structure, so they're the
    // one part of enumeration actually worth fanning out.
    let mut file_entries: Vec<walkdir::DirEntry> = Vec::new();

    let walker = WalkDir::new(source.as_path()).into_iter();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                let path = err.path().map(|p| p.to_path_buf()).unwrap_or_default();
                errors.push(SubtreeEnumError {
                    path: path.clone(),
                    message: err.to_string(),
                });
                nodes
                    .entry(path.clone())
                    .or_insert_with(|| {
                        let cp = CanonicalPath::new(&path)
                            .unwrap_or_else(|_| source.clone());
                        let mut n = TreeNode::empty(cp);
                        n.enum_failed = true;
                        n
                    })
                    .enum_failed = true;
                continue;
            }
        };

        if entry.file_type().is_dir() {
            let path = entry.path().to_path_buf();
            nodes.entry(path.clone()).or_insert_with(|| {
                let cp = CanonicalPath::new(&path).unwrap_or_else(|_| source.clone());
                TreeNode::empty(cp)
            });
            continue;
        }

        if entry.file_type().is_file() {
            file_entries.push(entry);
        }
    }

    // Parallel size fan-out (spec C2 budget note: "parallel tree
    // aggregation"); the fold back into `nodes` below stays sequential
    // since it mutates a shared map.
    let sizes: Vec<(PathBuf, u64)> = file_entries
        .par_iter()
        .map(|entry| {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let parent = entry
                .path()
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| source.as_path().to_path_buf());
            (parent, size)
        })
        .collect();

    for (parent, size) in sizes {
        let node = nodes.entry(parent.clone()).or_insert_with(|| {
            let cp = CanonicalPath::new(&parent).unwrap_or_else(|_| source.clone());
            TreeNode::empty(cp)
        });
        node.local_size += size;
        node.local_file_count += 1;
    }

    // Assemble children under their parent in reverse-path-length order so
    // every child is folded before its parent is visited.
    let mut paths: Vec<PathBuf> = nodes.keys().cloned().collect();
    paths.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    let mut assembled: BTreeMap<PathBuf, TreeNode> = BTreeMap::new();
    for path in paths {
        let mut node = nodes.remove(&path).unwrap();
        node.total_size = node.local_size;
        node.total_file_count = node.local_file_count;

        // Pull in any already-assembled children (deeper paths processed first).
        let mut to_remove = Vec::new();
        for (child_path, child_node) in assembled.iter() {
            if child_path.parent() == Some(path.as_path()) {
                node.total_size += child_node.total_size;
                node.total_file_count += child_node.total_file_count;
                node.enum_failed = node.enum_failed || child_node.enum_failed;
                to_remove.push(child_path.clone());
            }
        }
        let mut children = BTreeMap::new();
        for child_path in to_remove {
            let child_node = assembled.remove(&child_path).unwrap();
            children.insert(CaseFold::of(&child_node.name), child_node);
        }
        node.children = children;

        assembled.insert(path, node);
    }

    let root = assembled
        .remove(source.as_path())
        .unwrap_or_else(|| TreeNode::empty(source.clone()));

    (root, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write_file(path: &std::path::Path, bytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn aggregates_bottom_up() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("a.txt"), 100);
        write_file(&root.join("sub/b.txt"), 200);
        write_file(&root.join("sub/deeper/c.txt"), 300);

        let source = CanonicalPath::new(root).unwrap();
        let (tree, errors) = build_tree(&source);
        assert!(errors.is_empty());
        assert_eq!(tree.local_size, 100);
        assert_eq!(tree.local_file_count, 1);
        assert_eq!(tree.total_size, 600);
        assert_eq!(tree.total_file_count, 3);

        let sub = tree.children.get(&CaseFold::of("sub")).unwrap();
        assert_eq!(sub.local_size, 200);
        assert_eq!(sub.total_size, 500);

        let deeper = sub.children.get(&CaseFold::of("deeper")).unwrap();
        assert_eq!(deeper.total_size, 300);
    }

    #[test]
    fn matches_independent_recursive_enumeration() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("x/y/z.bin"), 77);
        write_file(&root.join("x/w.bin"), 33);
        write_file(&root.join("top.bin"), 11);

        fn recursive_sum(path: &std::path::Path) -> (u64, u64) {
            let mut bytes = 0u64;
            let mut files = 0u64;
            for entry in fs::read_dir(path).unwrap() {
                let entry = entry.unwrap();
                let ty = entry.file_type().unwrap();
                if ty.is_dir() {
                    let (b, f) = recursive_sum(&entry.path());
                    bytes += b;
                    files += f;
                } else if ty.is_file() {
                    bytes += entry.metadata().unwrap().len();
                    files += 1;
                }
            }
            (bytes, files)
        }

        let (expected_bytes, expected_files) = recursive_sum(root);
        let source = CanonicalPath::new(root).unwrap();
        let (tree, _) = build_tree(&source);
        assert_eq!(tree.total_size, expected_bytes);
        assert_eq!(tree.total_file_count, expected_files);
    }

    #[test]
    fn children_ordered_case_insensitively() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("Zeta/f.txt"), 1);
        write_file(&root.join("alpha/f.txt"), 1);
        write_file(&root.join("Beta/f.txt"), 1);

        let source = CanonicalPath::new(root).unwrap();
        let (tree, _) = build_tree(&source);
        let names: Vec<&str> = tree.children.values().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "Beta", "Zeta"]);
    }

    #[test]
    fn empty_directory_has_zero_totals() {
        let dir = tempdir().unwrap();
        let source = CanonicalPath::new(dir.path()).unwrap();
        let (tree, errors) = build_tree(&source);
        assert!(errors.is_empty());
        assert_eq!(tree.total_size, 0);
        assert_eq!(tree.total_file_count, 0);
        assert!(tree.is_empty_subtree());
    }
}
