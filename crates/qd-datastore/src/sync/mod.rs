//! Replication between the local and the remote catalog.
//!
//! A pass pushes every local dataset whose overview row or data is flagged
//! unsynchronized to the remote catalog, in uuid order. Pulls copy a single
//! dataset the other way on request.

pub mod data;
pub mod overview;
pub mod worker;

pub use data::{mark_synchronized, replicate_data, DataOutcome};
pub use overview::{replicate_overview, KnownSamples, OverviewOutcome};
pub use worker::{SyncCommand, SyncWorker};

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, MeasurementUpdate};
use crate::error::{Error, Result};
use crate::shared_state::AtomicCounters;

/// Largest blob chunk moved in one read/write pair.
pub const DEFAULT_CHUNK_BYTES: usize = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
}

/// Counts for one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub overviews: usize,
    pub datasets: usize,
    pub bytes_copied: u64,
    pub flags_set: usize,
    pub conflicts: usize,
    pub failures: usize,
}

pub struct SyncAgent {
    local: Arc<Catalog>,
    remote: Arc<Catalog>,
    chunk_bytes: usize,
    known_samples: KnownSamples,
    counters: Arc<AtomicCounters>,
}

impl SyncAgent {
    pub fn new(local: Arc<Catalog>, remote: Arc<Catalog>, chunk_bytes: usize) -> Self {
        Self {
            local,
            remote,
            chunk_bytes: chunk_bytes.max(crate::buffer::SAMPLE_BYTES),
            known_samples: KnownSamples::new(),
            counters: Arc::new(AtomicCounters::new()),
        }
    }

    pub fn with_counters(mut self, counters: Arc<AtomicCounters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn local(&self) -> &Arc<Catalog> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<Catalog> {
        &self.remote
    }

    fn endpoints(&self, direction: Direction) -> (&Catalog, &Catalog) {
        match direction {
            Direction::LocalToRemote => (&self.local, &self.remote),
            Direction::RemoteToLocal => (&self.remote, &self.local),
        }
    }

    /// Copies the overview row of `uuid` in `direction`. When pushing, the
    /// local row is marked table-synchronized only if its data already is.
    pub fn sync_overview(&self, uuid: i64, direction: Direction) -> Result<OverviewOutcome> {
        let (source, dest) = self.endpoints(direction);
        let outcome = replicate_overview(source, dest, uuid, &self.known_samples)?;
        if direction == Direction::LocalToRemote && outcome.source_data_synchronized {
            self.local.update_measurement(
                uuid,
                &MeasurementUpdate {
                    table_synchronized: Some(true),
                    ..Default::default()
                },
            )?;
        }
        Ok(outcome)
    }

    /// Replicates the parameter rows and blob tails of `uuid` in `direction`.
    ///
    /// When pushing a dataset whose writer has ended, the local data flag is
    /// set only if the update counter did not move during the copy; a moved
    /// counter surfaces as `Conflict` and the next pass retries. Pulls set
    /// the flag unconditionally.
    pub fn sync_data(&self, uuid: i64, direction: Direction) -> Result<DataOutcome> {
        let (source, dest) = self.endpoints(direction);
        if !dest.uuid_exists(uuid)? {
            self.sync_overview(uuid, direction)?;
        }
        let outcome = replicate_data(source, dest, uuid, self.chunk_bytes)?;
        self.counters.add_bytes_copied(outcome.bytes_copied);
        if !outcome.source_ended {
            return Ok(outcome);
        }
        match direction {
            Direction::LocalToRemote => mark_synchronized(&self.local, uuid, outcome.update_count)?,
            Direction::RemoteToLocal => {
                let completed = source.find_by_uuid(uuid)?.map(|row| row.completed).unwrap_or(false);
                self.local.update_measurement(
                    uuid,
                    &MeasurementUpdate {
                        completed: Some(completed),
                        data_synchronized: Some(true),
                        table_synchronized: Some(true),
                        ..Default::default()
                    },
                )?;
            }
        }
        Ok(outcome)
    }

    fn record_failure(&self, report: &mut SyncReport, uuid: i64, stage: &str, error: &Error) {
        if error.is_conflict() {
            debug!("Dataset {} changed during {} sync, retrying next pass: {}", uuid, stage, error);
            report.conflicts += 1;
        } else {
            warn!("Failed to sync {} of dataset {}: {}", stage, uuid, error);
            report.failures += 1;
            self.counters.inc_failures();
        }
    }

    /// One local-to-remote pass over every unsynchronized dataset. Errors on
    /// a single dataset are logged and the pass moves on.
    pub fn run_pass(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        if self.local.same_store(&self.remote) {
            debug!("Local and remote catalog are the same store; nothing to sync");
            return Ok(report);
        }

        for uuid in self.local.measurements.pending_table_sync()? {
            match self.sync_overview(uuid, Direction::LocalToRemote) {
                Ok(_) => report.overviews += 1,
                Err(e) => self.record_failure(&mut report, uuid, "overview", &e),
            }
        }

        for uuid in self.local.measurements.pending_data_sync()? {
            match self.sync_data(uuid, Direction::LocalToRemote) {
                Ok(outcome) => {
                    report.datasets += 1;
                    report.bytes_copied += outcome.bytes_copied;
                    self.counters.inc_datasets_replicated();
                    if outcome.source_ended {
                        report.flags_set += 1;
                        // completion shows on the remote only after the data flag is set
                        let pending = matches!(
                            self.local.find_by_uuid(uuid),
                            Ok(Some(row)) if !row.table_synchronized
                        );
                        if pending {
                            if let Err(e) = self.sync_overview(uuid, Direction::LocalToRemote) {
                                self.record_failure(&mut report, uuid, "overview", &e);
                            }
                        }
                    }
                }
                Err(e) => self.record_failure(&mut report, uuid, "data", &e),
            }
        }

        self.counters.inc_sync_passes();
        if report.overviews + report.datasets > 0 || report.failures > 0 {
            info!(
                "Sync pass: {} overviews, {} datasets, {} bytes, {} flags set, {} conflicts, {} failures",
                report.overviews,
                report.datasets,
                report.bytes_copied,
                report.flags_set,
                report.conflicts,
                report.failures
            );
        }
        Ok(report)
    }

    /// Copies one dataset from the remote catalog into the local one.
    pub fn pull(&self, uuid: i64) -> Result<()> {
        if self.local.same_store(&self.remote) {
            return Ok(());
        }
        if !self.remote.uuid_exists(uuid)? {
            return Err(Error::NotFound(format!("dataset with uuid {} on remote", uuid)));
        }
        self.sync_overview(uuid, Direction::RemoteToLocal)?;
        let outcome = self.sync_data(uuid, Direction::RemoteToLocal)?;
        info!(
            "Pulled dataset {} from remote ({} bytes)",
            uuid, outcome.bytes_copied
        );
        Ok(())
    }
}
