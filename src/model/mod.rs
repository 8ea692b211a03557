//! Core data model: canonical paths (C1), the directory tree (C2), and the
//! chunker (C3).

pub mod chunk;
pub mod path;
pub mod tree;
