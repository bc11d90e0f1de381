pub mod macros;
pub mod num;
