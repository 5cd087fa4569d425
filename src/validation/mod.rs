pub mod identifier;
pub mod statement;

pub use identifier::*;
pub use statement::*;
