//! In-memory block header tree with cumulative work tracking.

pub mod tree;
pub mod work;

pub use tree::{AcceptError, BlockId, BlockTree, Validity};
pub use work::{block_proof, compact_to_u256};
