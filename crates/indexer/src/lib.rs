//! Code-unit and git-commit indexing into the vector store.
//!
//! Files are parsed with tree-sitter into named units (functions, methods,
//! types); commits come from a git2 revwalk. Both keep checkpoints in the
//! metadata store so re-indexing is incremental: unchanged files are skipped
//! by content hash, and the commit walk stops at the last indexed sha.

mod code;
mod commits;
mod parse;

pub use code::{CodeIndexer, IndexDirectoryReport, IndexFileReport};
pub use commits::{CommitIndexer, IndexCommitsReport};
pub use parse::{parse_units, CodeUnit, Language};
