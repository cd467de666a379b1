pub use error::{Result, StoreError};
pub use export::{ExportReader, ExportWriter, BOUNDARY_SENTINEL};
pub use index::{IdentifierIndex, DEFAULT_MAX_MODIFICATIONS};
pub use lock::DirLock;
pub use record_log::{RecordLog, DEFAULT_BLOCK_SIZE};
pub use store::{Store, StoreOptions};
pub use version::CURRENT_VERSION;

pub mod error;
pub mod export;
pub mod index;
pub mod lock;
pub mod record_log;
pub mod store;
pub mod version;
