pub mod attribute;
pub mod common;
pub mod entity;
pub mod enum_group;
pub mod value;

pub use attribute::*;
pub use common::*;
pub use entity::*;
pub use enum_group::*;
pub use value::*;
