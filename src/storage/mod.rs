//! The storage plane's on-disk formats and the offline compactor: the
//! 256-byte-aligned data record codec, compressed hint sidecars, index
//! building, compaction planning and rewriting, and tiered expiry.

pub mod compact;
pub mod expiry;
pub mod hint;
pub mod index;
pub mod record;

pub use compact::{build_hints, compact, print_keys, self_test, validate_hints, validate_tmp_hints};
pub use expiry::ExpiryPolicy;
pub use index::FileIndex;
pub use record::Record;
