//! Built-in classes.
//!
//! [`LocalFs`] talks to the host filesystem and is always registered first.
//! [`MemFs`] and [`TarFs`] are generic directory-cache classes.

mod local;
mod memory;
mod tar;

pub use local::{LocalFs, stat_from_metadata};
pub use memory::{MEM_PREFIX, MemFs, MemoryBackend};
pub use tar::{TAR_PREFIX, TarArchive, TarCookie, TarFs, TarMember, TarSource};
