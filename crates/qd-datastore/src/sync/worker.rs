//! Background sync thread.
//!
//! Runs [`SyncAgent::run_pass`] on a fixed interval inside a dedicated
//! thread with its own single-threaded runtime. Callers can also request an
//! immediate pass or a pull through the command channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{SyncAgent, SyncReport};
use crate::error::{Error, Result};

pub enum SyncCommand {
    RunPass {
        reply: oneshot::Sender<Result<SyncReport>>,
    },
    Pull {
        uuid: i64,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

pub struct SyncWorker {
    sender: mpsc::UnboundedSender<SyncCommand>,
    thread_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl SyncWorker {
    pub fn spawn(agent: Arc<SyncAgent>, interval: Duration) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let thread_handle = thread::Builder::new()
            .name("qd-sync".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create sync thread runtime: {}", e);
                        running_clone.store(false, Ordering::Relaxed);
                        return;
                    }
                };
                rt.block_on(Self::run_loop(receiver, agent, interval, running_clone));
            })?;

        info!("Spawned sync worker (interval {:?})", interval);
        Ok(Self {
            sender,
            thread_handle: Some(thread_handle),
            running,
        })
    }

    async fn run_loop(
        mut receiver: mpsc::UnboundedReceiver<SyncCommand>,
        agent: Arc<SyncAgent>,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) {
        // Commands must not push the next periodic pass back.
        let period = interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while running.load(Ordering::Relaxed) {
            tokio::select! {
                command = receiver.recv() => {
                    match command {
                        Some(SyncCommand::RunPass { reply }) => {
                            let _ = reply.send(agent.run_pass());
                        }
                        Some(SyncCommand::Pull { uuid, reply }) => {
                            let _ = reply.send(agent.pull(uuid));
                        }
                        Some(SyncCommand::Shutdown) => break,
                        None => {
                            debug!("Sync command channel closed");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = agent.run_pass() {
                        warn!("Sync pass failed: {}", e);
                    }
                }
            }
        }
        running.store(false, Ordering::Relaxed);
        info!("Sync worker shutting down");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn send(&self, command: SyncCommand) -> Result<()> {
        self.sender
            .send(command)
            .map_err(|_| Error::NotConnected("sync worker has stopped".into()))
    }

    /// Runs a pass now and waits for its report.
    pub async fn run_pass(&self) -> Result<SyncReport> {
        let (reply, response) = oneshot::channel();
        self.send(SyncCommand::RunPass { reply })?;
        response
            .await
            .map_err(|_| Error::NotConnected("sync worker dropped the request".into()))?
    }

    pub async fn pull(&self, uuid: i64) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(SyncCommand::Pull { uuid, reply })?;
        response
            .await
            .map_err(|_| Error::NotConnected("sync worker dropped the request".into()))?
    }

    /// Stops the loop after the command in flight and joins the thread.
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(SyncCommand::Shutdown);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("Sync worker thread panicked");
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::SampleTriple;
    use tempfile::TempDir;

    fn agent(dir: &TempDir) -> Arc<SyncAgent> {
        let local = Arc::new(Catalog::open_path(&dir.path().join("local.sqlite")).unwrap());
        let remote = Arc::new(Catalog::open_path(&dir.path().join("remote.sqlite")).unwrap());
        Arc::new(SyncAgent::new(local, remote, 1024))
    }

    #[tokio::test]
    async fn test_requested_pass_replicates_overview() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir);
        let triple = SampleTriple::new("six_dots", "XLD", "SQ21");
        let (_, uuid) = agent.local().create_measurement("ramsey", &triple, 1.0, Some(1)).unwrap();

        let mut worker = SyncWorker::spawn(agent.clone(), Duration::from_secs(3600)).unwrap();
        let report = worker.run_pass().await.unwrap();
        assert_eq!(report.overviews, 1);
        assert!(agent.remote().uuid_exists(uuid).unwrap());

        worker.shutdown();
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_pull_of_unknown_uuid() {
        let dir = TempDir::new().unwrap();
        let worker = SyncWorker::spawn(agent(&dir), Duration::from_secs(3600)).unwrap();
        assert!(worker.pull(42).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_stopped_worker_is_not_connected() {
        let dir = TempDir::new().unwrap();
        let mut worker = SyncWorker::spawn(agent(&dir), Duration::from_secs(3600)).unwrap();
        worker.shutdown();
        assert!(matches!(worker.run_pass().await, Err(Error::NotConnected(_))));
    }

    #[test]
    fn test_interval_passes_run_unprompted() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir);
        let triple = SampleTriple::new("six_dots", "XLD", "SQ21");
        let (_, uuid) = agent.local().create_measurement("rabi", &triple, 1.0, Some(1)).unwrap();

        let _worker = SyncWorker::spawn(agent.clone(), Duration::from_millis(20)).unwrap();
        let mut seen = false;
        for _ in 0..100 {
            if agent.remote().uuid_exists(uuid).unwrap() {
                seen = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(seen);
    }

    #[tokio::test]
    async fn test_interval_passes_survive_command_traffic() {
        let dir = TempDir::new().unwrap();
        let agent = agent(&dir);
        let triple = SampleTriple::new("six_dots", "XLD", "SQ21");
        let (_, uuid) = agent.local().create_measurement("rabi", &triple, 1.0, Some(1)).unwrap();

        let worker = SyncWorker::spawn(agent.clone(), Duration::from_millis(50)).unwrap();
        let mut seen = false;
        for _ in 0..200 {
            assert!(worker.pull(42).await.unwrap_err().is_not_found());
            if agent.remote().uuid_exists(uuid).unwrap() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);
    }
}
