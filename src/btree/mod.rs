pub mod primary;
pub mod secondary;

pub use primary::PrimaryTree;
pub use secondary::SecondaryTree;
