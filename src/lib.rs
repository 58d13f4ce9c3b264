pub mod allocator;
pub mod chunker;
pub mod config;
pub mod counters;
pub mod error;
pub mod export;
pub mod fs;
pub mod index;
pub mod inode;
pub mod inspect;
pub mod io;
pub mod keys;
pub mod metrics;
pub mod object;
pub mod persistent_counter;
pub mod stack;

pub use allocator::InodeAllocator;
pub use chunker::Chunker;
pub use config::StackConfig;
pub use counters::Counters;
pub use error::{ErrorKind, IoError};
pub use export::{Export, ExportResolver, StaticExportResolver};
pub use fs::{ExportFs, Owner};
pub use index::{AttributeUpdate, DirectoryEntry, InodeIndex, SimpleInodeIndex};
pub use inode::{Inode, InodeMetadata, NodeType};
pub use io::{IoOps, IoOpsExt};
pub use keys::{MetaKey, Metadata, ObjectKey, ObjectOffset};
pub use metrics::{MetricsCollector, PrometheusMetrics, SharedMetrics};
pub use object::FdsObject;
pub use persistent_counter::PersistentCounter;
pub use stack::{Backend, IoStack, IoStackBuilder};
