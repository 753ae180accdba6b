//! Code-symbol indexing with change detection

mod extract;
mod indexer;

pub use extract::{Extraction, extract};
pub use indexer::{IndexConfig, IndexOutcome, IndexStats, SymbolIndexer};
