mod node;
mod tree;

pub use tree::{LeafRef, RadixTree, WalkAction, WalkOutcome};
