//! Chunker (spec C3): walks a `TreeNode` and emits an ordered list of copy
//! units respecting size/files/depth caps.

use serde::{Deserialize, Serialize};

use crate::error::RobocurseError;
use crate::model::path::{self, CanonicalPath};
use crate::model::tree::TreeNode;

pub const MIN_CHUNK_MAX_SIZE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkCaps {
    pub max_size_bytes: u64,
    pub max_files: u64,
    pub max_depth: u32,
    pub min_size_bytes: u64,
}

impl ChunkCaps {
    pub fn validate(&self) -> Result<(), RobocurseError> {
        if self.max_size_bytes < MIN_CHUNK_MAX_SIZE_BYTES {
            return Err(RobocurseError::ConfigInvalid {
                field: "ChunkMaxSizeBytes".to_string(),
                reason: format!("must be >= {} bytes (1 MiB)", MIN_CHUNK_MAX_SIZE_BYTES),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Smart,
    Flat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: u64,
    pub source_path: CanonicalPath,
    pub destination_path: CanonicalPath,
    pub estimated_size: u64,
    pub estimated_files: u64,
    pub is_files_only: bool,
    pub status: ChunkStatus,
    pub retry_count: u32,
    /// Wall-clock time (seconds since epoch) after which this chunk may be
    /// re-admitted; `None` means immediately eligible.
    pub retry_after: Option<u64>,
}

struct Planner<'a> {
    source_root: &'a CanonicalPath,
    destination_root: &'a CanonicalPath,
    caps: ChunkCaps,
    next_id: u64,
    chunks: Vec<Chunk>,
}

impl<'a> Planner<'a> {
    fn next_chunk_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn make_chunk(&mut self, node: &TreeNode, is_files_only: bool, size: u64, files: u64) -> Result<(), RobocurseError> {
        let rel = path::relative_to(self.source_root, &node.path)?;
        let dest = path::join(self.destination_root, &rel);
        let chunk_id = self.next_chunk_id();
        self.chunks.push(Chunk {
            chunk_id,
            source_path: node.path.clone(),
            destination_path: dest,
            estimated_size: size,
            estimated_files: files,
            is_files_only,
            status: ChunkStatus::Pending,
            retry_count: 0,
            retry_after: None,
        });
        Ok(())
    }

    fn descend(&mut self, node: &TreeNode, depth_remaining: u32) -> Result<(), RobocurseError> {
        if node.is_empty_subtree() {
            return Ok(());
        }

        let fits = node.total_size <= self.caps.max_size_bytes && node.total_file_count <= self.caps.max_files;
        if depth_remaining == 0 || fits {
            self.make_chunk(node, false, node.total_size, node.total_file_count)?;
            return Ok(());
        }

        if node.local_file_count > 0 {
            self.make_chunk(node, true, node.local_size, node.local_file_count)?;
        }

        for child in node.children.values() {
            self.descend(child, depth_remaining - 1)?;
        }
        Ok(())
    }
}

/// Plans chunks for `tree` (rooted at `source_root`), mapping destinations
/// under `destination_root`, per `mode` and `caps`.
pub fn plan_chunks(
    tree: &TreeNode,
    source_root: &CanonicalPath,
    destination_root: &CanonicalPath,
    caps: ChunkCaps,
    mode: ScanMode,
) -> Result<Vec<Chunk>, RobocurseError> {
    caps.validate()?;

    let mut planner = Planner {
        source_root,
        destination_root,
        caps,
        next_id: 0,
        chunks: Vec::new(),
    };

    match mode {
        ScanMode::Smart => {
            planner.descend(tree, caps.max_depth)?;
        }
        ScanMode::Flat => {
            if tree.local_file_count > 0 {
                planner.make_chunk(tree, true, tree.local_size, tree.local_file_count)?;
            }
            for child in tree.children.values() {
                if child.is_empty_subtree() {
                    continue;
                }
                planner.make_chunk(child, false, child.total_size, child.total_file_count)?;
            }
        }
    }

    Ok(planner.chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tree::build_tree;
    use std::fs;
    use tempfile::tempdir;

    fn write_file(path: &std::path::Path, bytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    fn default_caps() -> ChunkCaps {
        ChunkCaps {
            max_size_bytes: 1024 * 1024,
            max_files: 50_000,
            max_depth: 5,
            min_size_bytes: 1024,
        }
    }

    #[test]
    fn rejects_caps_below_minimum() {
        let caps = ChunkCaps {
            max_size_bytes: 100,
            ..default_caps()
        };
        assert!(caps.validate().is_err());
    }

    // S1 — split into subdir chunks.
    #[test]
    fn s1_splits_into_subdir_chunks() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for name in ["a", "b", "c"] {
            write_file(&root.join(name).join("payload.bin"), 500 * 1024);
        }
        write_file(&root.join("root1.txt"), 50 * 1024);
        write_file(&root.join("root2.txt"), 50 * 1024);

        let source = CanonicalPath::new(root).unwrap();
        let dest = CanonicalPath::new(std::path::Path::new("/dest")).unwrap();
        let (tree, errors) = build_tree(&source);
        assert!(errors.is_empty());

        let chunks = plan_chunks(&tree, &source, &dest, default_caps(), ScanMode::Smart).unwrap();
        assert!(chunks.len() >= 4, "expected at least 4 chunks, got {}", chunks.len());
        assert!(chunks.iter().any(|c| c.is_files_only));

        let total_size: u64 = chunks.iter().map(|c| c.estimated_size).sum();
        assert_eq!(total_size, tree.total_size);
        let total_files: u64 = chunks.iter().map(|c| c.estimated_files).sum();
        assert_eq!(total_files, tree.total_file_count);
    }

    // S2 — depth clamp.
    #[test]
    fn s2_depth_zero_yields_one_chunk() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for name in ["a", "b", "c"] {
            write_file(&root.join(name).join("payload.bin"), 500 * 1024);
        }
        write_file(&root.join("root1.txt"), 50 * 1024);

        let source = CanonicalPath::new(root).unwrap();
        let dest = CanonicalPath::new(std::path::Path::new("/dest")).unwrap();
        let (tree, _) = build_tree(&source);

        let caps = ChunkCaps {
            max_depth: 0,
            ..default_caps()
        };
        let chunks = plan_chunks(&tree, &source, &dest, caps, ScanMode::Smart).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].is_files_only);
        assert_eq!(chunks[0].estimated_size, tree.total_size);
    }

    #[test]
    fn coverage_property_holds_across_caps() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("x/y/z.bin"), 2 * 1024 * 1024);
        write_file(&root.join("x/w.bin"), 10 * 1024);
        write_file(&root.join("top.bin"), 5 * 1024);

        let source = CanonicalPath::new(root).unwrap();
        let dest = CanonicalPath::new(std::path::Path::new("/dest")).unwrap();
        let (tree, _) = build_tree(&source);

        for caps in [
            default_caps(),
            ChunkCaps { max_depth: 1, ..default_caps() },
            ChunkCaps { max_files: 1, ..default_caps() },
        ] {
            let chunks = plan_chunks(&tree, &source, &dest, caps, ScanMode::Smart).unwrap();
            let total_size: u64 = chunks.iter().map(|c| c.estimated_size).sum();
            let total_files: u64 = chunks.iter().map(|c| c.estimated_files).sum();
            assert_eq!(total_size, tree.total_size);
            assert_eq!(total_files, tree.total_file_count);
        }
    }

    #[test]
    fn no_path_doubling_in_planned_chunks() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("sub/file.bin"), 1024);

        let source = CanonicalPath::new(root).unwrap();
        let dest = CanonicalPath::new(std::path::Path::new("/dest/root")).unwrap();
        let (tree, _) = build_tree(&source);
        let caps = ChunkCaps { max_depth: 0, ..default_caps() };
        let chunks = plan_chunks(&tree, &source, &dest, caps, ScanMode::Smart).unwrap();

        for chunk in &chunks {
            assert_eq!(
                chunk.destination_path.as_str().matches(dest.as_str()).count(),
                1
            );
            assert_eq!(
                chunk.source_path.as_str().matches(source.as_str()).count(),
                1
            );
        }
    }

    #[test]
    fn empty_tree_yields_no_chunks() {
        let dir = tempdir().unwrap();
        let source = CanonicalPath::new(dir.path()).unwrap();
        let dest = CanonicalPath::new(std::path::Path::new("/dest")).unwrap();
        let (tree, _) = build_tree(&source);
        let chunks = plan_chunks(&tree, &source, &dest, default_caps(), ScanMode::Smart).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn flat_mode_emits_one_chunk_per_top_level_child() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("a/one.bin"), 1024);
        write_file(&root.join("b/two.bin"), 1024);
        write_file(&root.join("root.bin"), 1024);

        let source = CanonicalPath::new(root).unwrap();
        let dest = CanonicalPath::new(std::path::Path::new("/dest")).unwrap();
        let (tree, _) = build_tree(&source);
        let chunks = plan_chunks(&tree, &source, &dest, default_caps(), ScanMode::Flat).unwrap();

        // one files-only chunk for root.bin + one chunk per child (a, b)
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().filter(|c| c.is_files_only).count(), 1);
    }

    #[test]
    fn oversize_single_directory_not_split_below_directory_level() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write_file(&root.join("huge/only.bin"), 2 * 1024 * 1024);

        let source = CanonicalPath::new(root).unwrap();
        let dest = CanonicalPath::new(std::path::Path::new("/dest")).unwrap();
        let (tree, _) = build_tree(&source);
        let caps = ChunkCaps { max_depth: 0, ..default_caps() };
        let chunks = plan_chunks(&tree, &source, &dest, caps, ScanMode::Smart).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].estimated_size, 2 * 1024 * 1024);
    }
}
