pub mod log;
pub mod overlay;

pub use log::Wal;
pub use overlay::TxPageIo;
