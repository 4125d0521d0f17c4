pub mod gc;
pub mod tx_manager;
pub mod version_index;

pub use tx_manager::TransactionManager;
pub use version_index::{ChainLookup, DocumentVersion, PublishOp, VersionIndex};
