mod counter;
mod interface;
mod memory;
mod scan;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use counter::*;
pub use interface::*;
pub use memory::*;
pub use scan::*;
#[cfg_attr(docsrs, doc(cfg(feature = "sqlite")))]
#[cfg(feature = "sqlite")]
pub use sqlite::*;
