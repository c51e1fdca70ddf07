mod config;
mod reception;
mod retry;
mod stats;

pub use config::*;
pub use reception::*;
pub use retry::*;
pub use stats::*;
