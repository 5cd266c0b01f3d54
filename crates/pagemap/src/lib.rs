pub mod codec;
pub mod error;
pub mod persistent_map;

pub use codec::PageCodec;
pub use error::{PageMapError, Result};
pub use persistent_map::{pack_root_reference, PersistentMap};
