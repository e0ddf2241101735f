//! JSON:API document assembly.

mod assembler;
pub mod links;
pub mod types;

pub use assembler::DocumentAssembler;
pub use links::LinkBuilder;
pub use types::*;
