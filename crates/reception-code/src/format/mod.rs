mod bucket;
mod code;
mod error;

pub use bucket::*;
pub use code::*;
pub use error::*;
