//! Process-wide connection context.
//!
//! Holds the configuration and the opened local/remote catalogs. The context
//! is installed once with [`init`] and swapped atomically, so readers never
//! observe a half-built state.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use lazy_static::lazy_static;
use tracing::info;

use crate::catalog::Catalog;
use crate::config::Config;
use crate::dataset::{self, Dataset};
use crate::error::{Error, Result};
use crate::sync::SyncAgent;

/// Atomic counters for sync activity.
#[derive(Debug, Default)]
pub struct AtomicCounters {
    pub sync_passes: AtomicUsize,
    pub datasets_replicated: AtomicUsize,
    pub bytes_copied: AtomicU64,
    pub failures: AtomicUsize,
}

impl AtomicCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_sync_passes(&self) -> usize {
        self.sync_passes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn inc_datasets_replicated(&self) -> usize {
        self.datasets_replicated.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add_bytes_copied(&self, bytes: u64) -> u64 {
        self.bytes_copied.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn inc_failures(&self) -> usize {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Configuration plus the two opened catalogs.
pub struct SharedState {
    pub config: Arc<Config>,
    pub local: Arc<Catalog>,
    pub remote: Arc<Catalog>,
    pub counters: Arc<AtomicCounters>,
}

impl SharedState {
    /// Opens both catalogs. A single configured descriptor serves as both.
    pub fn new(config: Config) -> Result<Self> {
        let local_desc = config.local_descriptor()?.clone();
        let remote_desc = config.remote_descriptor()?.clone();
        let local = Arc::new(Catalog::open(&local_desc, config.pool_size)?);
        let remote = if remote_desc.path() == local_desc.path() {
            Arc::clone(&local)
        } else {
            Arc::new(Catalog::open(&remote_desc, config.pool_size)?)
        };
        Ok(Self {
            config: Arc::new(config),
            local,
            remote,
            counters: Arc::new(AtomicCounters::new()),
        })
    }

    /// A sync agent over this context's catalogs sharing its counters.
    pub fn agent(&self) -> SyncAgent {
        SyncAgent::new(
            Arc::clone(&self.local),
            Arc::clone(&self.remote),
            self.config.sync_chunk_bytes,
        )
        .with_counters(Arc::clone(&self.counters))
    }

    pub fn load_by_id(&self, id: i64) -> Result<Dataset> {
        dataset::load_by_id(&self.local, id)
    }

    pub fn load_by_uuid(&self, uuid: i64, sync_to_local: bool) -> Result<Dataset> {
        dataset::load_by_uuid(&self.local, &self.remote, uuid, sync_to_local)
    }
}

lazy_static! {
    static ref CURRENT: ArcSwapOption<SharedState> = ArcSwapOption::empty();
}

/// Opens the catalogs described by `config` and installs them as the
/// process-wide context, replacing any previous one.
pub fn init(config: Config) -> Result<Arc<SharedState>> {
    let state = Arc::new(SharedState::new(config)?);
    CURRENT.store(Some(Arc::clone(&state)));
    info!(
        "Connection context ready (local: {}, remote: {})",
        state.local.path().display(),
        state.remote.path().display()
    );
    Ok(state)
}

/// The installed context, or `NotConnected` before [`init`].
pub fn current() -> Result<Arc<SharedState>> {
    CURRENT
        .load_full()
        .ok_or_else(|| Error::NotConnected("connection context not initialized".into()))
}

/// Drops the installed context. Catalogs close once the last handle goes.
pub fn teardown() {
    if CURRENT.swap(None).is_some() {
        info!("Connection context torn down");
    }
}
