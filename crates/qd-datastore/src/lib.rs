// qd-datastore/crates/qd-datastore/src/lib.rs

pub mod buffer;
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod derived;
pub mod error;
pub mod identifiers;
pub mod interchange;
pub mod shared_state;
pub mod sync;
pub mod telemetry;
pub mod validation;

// Public API exports
pub use catalog::{Catalog, SearchFilter};
pub use config::{Config, ConnectionDescriptor, SampleIdentity, SampleTriple};
pub use dataset::{
    load_by_id, load_by_uuid, recover_interrupted, Dataset, DatasetBuilder, DatasetWriter, ParameterNode,
    ParameterSpec,
};
pub use derived::{ChannelRatios, Conversion, DerivedMatrix};
pub use error::{Error, Result};
pub use interchange::{import_dump, import_labeled, DatasetDump};
pub use shared_state::SharedState;
pub use sync::{SyncAgent, SyncReport, SyncWorker};
