pub mod catalog;
pub mod reconcile;
pub mod resolve;
pub mod validate;

pub use catalog::*;
pub use reconcile::*;
pub use resolve::*;
pub use validate::*;
