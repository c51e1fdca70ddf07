#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod allocator;
mod category;
mod error;
mod format;
#[cfg(feature = "futures")]
mod futures;
mod rand;
mod store;
mod time;

pub use crate::allocator::*;
pub use crate::category::*;
pub use crate::error::*;
pub use crate::format::*;
#[cfg_attr(docsrs, doc(cfg(feature = "futures")))]
#[cfg(feature = "futures")]
pub use crate::futures::*;
pub use crate::rand::*;
pub use crate::store::*;
pub use crate::time::*;
