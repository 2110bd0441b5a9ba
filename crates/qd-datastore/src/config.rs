// qd-datastore/crates/qd-datastore/src/config.rs

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::error::Error;
use crate::validation::validate_identifier;

/// Connection parameters for one catalog instance.
///
/// The embedded backend interprets `dbname` as the path of the catalog file;
/// the network fields are kept so descriptors round-trip through `.env` files
/// shared with server-backed deployments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub readonly: bool,
}

impl ConnectionDescriptor {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            host: "localhost".into(),
            port: 5432,
            user: String::new(),
            password: String::new(),
            dbname: path.into().to_string_lossy().into_owned(),
            readonly: false,
        }
    }

    pub fn path(&self) -> PathBuf {
        PathBuf::from(&self.dbname)
    }

    fn from_env(prefix: &str) -> Result<Option<Self>> {
        let dbname = match env::var(format!("{}_DBNAME", prefix)) {
            Ok(name) if !name.trim().is_empty() => name,
            _ => return Ok(None),
        };
        Ok(Some(Self {
            host: env::var(format!("{}_HOST", prefix)).unwrap_or_else(|_| "localhost".into()),
            port: env::var(format!("{}_PORT", prefix))
                .unwrap_or_else(|_| "5432".into())
                .parse()?,
            user: env::var(format!("{}_USER", prefix)).unwrap_or_default(),
            password: env::var(format!("{}_PASSWORD", prefix)).unwrap_or_default(),
            dbname,
            readonly: env::var(format!("{}_READONLY", prefix))
                .unwrap_or_else(|_| "false".into())
                .parse()?,
        }))
    }
}

/// The `(project, setup, sample)` triple every dataset is filed under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct SampleIdentity {
    pub project: Option<String>,
    pub setup: Option<String>,
    pub sample: Option<String>,
}

/// A fully specified sample triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleTriple {
    pub project: String,
    pub setup: String,
    pub sample: String,
}

impl SampleTriple {
    pub fn new(project: impl Into<String>, setup: impl Into<String>, sample: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            setup: setup.into(),
            sample: sample.into(),
        }
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        validate_identifier("project", &self.project)?;
        validate_identifier("setup", &self.setup)?;
        validate_identifier("sample", &self.sample)
    }
}

impl SampleIdentity {
    pub fn new(project: &str, setup: &str, sample: &str) -> Self {
        Self {
            project: Some(project.into()),
            setup: Some(setup.into()),
            sample: Some(sample.into()),
        }
    }

    /// Returns the complete triple, or a configuration error naming the first
    /// missing component.
    pub fn require(&self) -> crate::error::Result<SampleTriple> {
        let pick = |kind: &str, value: &Option<String>| {
            value
                .clone()
                .ok_or_else(|| Error::Config(format!("sample identity has no {} configured", kind)))
        };
        let triple = SampleTriple {
            project: pick("project", &self.project)?,
            setup: pick("setup", &self.setup)?,
            sample: pick("sample", &self.sample)?,
        };
        triple.validate()?;
        Ok(triple)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub local: Option<ConnectionDescriptor>,
    pub remote: Option<ConnectionDescriptor>,
    pub identity: SampleIdentity,
    pub commit_interval_ms: u64,
    pub sync_interval_ms: u64,
    pub sync_chunk_bytes: usize,
    pub prealloc_samples: usize,
    pub compress_snapshots: bool,
    pub node_id: Option<u64>,
    pub pool_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local: None,
            remote: None,
            identity: SampleIdentity::default(),
            commit_interval_ms: 200,
            sync_interval_ms: 2000,
            sync_chunk_bytes: 2_000_000,
            prealloc_samples: 125_000,
            compress_snapshots: true,
            node_id: None,
            pool_size: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let identity = SampleIdentity {
            project: env::var("QD_PROJECT").ok(),
            setup: env::var("QD_SETUP").ok(),
            sample: env::var("QD_SAMPLE").ok(),
        };
        for (kind, value) in [
            ("project", &identity.project),
            ("setup", &identity.setup),
            ("sample", &identity.sample),
        ] {
            if let Some(value) = value {
                validate_identifier(kind, value)?;
            }
        }

        let node_id = match env::var("QD_NODE_ID") {
            Ok(raw) => Some(raw.parse()?),
            Err(_) => None,
        };

        Ok(Self {
            local: ConnectionDescriptor::from_env("QD_LOCAL")?,
            remote: ConnectionDescriptor::from_env("QD_REMOTE")?,
            identity,
            commit_interval_ms: env::var("QD_COMMIT_INTERVAL_MS")
                .unwrap_or_else(|_| "200".into())
                .parse()?,
            sync_interval_ms: env::var("QD_SYNC_INTERVAL_MS")
                .unwrap_or_else(|_| "2000".into())
                .parse()?,
            sync_chunk_bytes: env::var("QD_SYNC_CHUNK_BYTES")
                .unwrap_or_else(|_| "2000000".into())
                .parse()?,
            prealloc_samples: env::var("QD_PREALLOC_SAMPLES")
                .unwrap_or_else(|_| "125000".into())
                .parse()?,
            compress_snapshots: env::var("QD_COMPRESS_SNAPSHOTS")
                .unwrap_or_else(|_| "true".into())
                .parse()?,
            node_id,
            pool_size: env::var("QD_POOL_SIZE")
                .unwrap_or_else(|_| "10".into())
                .parse()?,
        })
    }

    /// Descriptor for the local catalog, falling back to the remote one.
    pub fn local_descriptor(&self) -> crate::error::Result<&ConnectionDescriptor> {
        self.local
            .as_ref()
            .or(self.remote.as_ref())
            .ok_or_else(|| Error::NotConnected("no local or remote catalog configured".into()))
    }

    /// Descriptor for the remote catalog, falling back to the local one.
    pub fn remote_descriptor(&self) -> crate::error::Result<&ConnectionDescriptor> {
        self.remote
            .as_ref()
            .or(self.local.as_ref())
            .ok_or_else(|| Error::NotConnected("no local or remote catalog configured".into()))
    }

    pub fn require_identity(&self) -> crate::error::Result<SampleTriple> {
        self.identity.require()
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn print_config(&self) {
        let describe = |d: &Option<ConnectionDescriptor>| match d {
            Some(d) => format!(
                "{}@{}:{}/{}{}",
                d.user,
                d.host,
                d.port,
                d.dbname,
                if d.readonly { " (readonly)" } else { "" }
            ),
            None => "<unset>".into(),
        };
        info!("Current configuration:");
        info!("- Local catalog: {}", describe(&self.local));
        info!("- Remote catalog: {}", describe(&self.remote));
        info!(
            "- Identity: project={:?} setup={:?} sample={:?}",
            self.identity.project, self.identity.setup, self.identity.sample
        );
        info!("- Commit interval: {}ms", self.commit_interval_ms);
        info!("- Sync interval: {}ms", self.sync_interval_ms);
        info!("- Sync chunk: {} bytes", self.sync_chunk_bytes);
        info!("- Pre-allocation: {} samples", self.prealloc_samples);
        info!("- Compress snapshots: {}", self.compress_snapshots);
        info!("- Node id override: {:?}", self.node_id);
        info!("- Pool size: {}", self.pool_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            local: Some(ConnectionDescriptor::file("/tmp/qd-local.sqlite")),
            identity: SampleIdentity::new("six_dots", "XLD", "SQ21"),
            ..Config::default()
        }
    }

    // ===== Descriptor fallback =====

    #[test]
    fn test_remote_falls_back_to_local() {
        let cfg = create_test_config();
        assert_eq!(cfg.remote_descriptor().unwrap().dbname, "/tmp/qd-local.sqlite");
        assert_eq!(cfg.local_descriptor().unwrap().dbname, "/tmp/qd-local.sqlite");
    }

    #[test]
    fn test_local_falls_back_to_remote() {
        let cfg = Config {
            remote: Some(ConnectionDescriptor::file("/tmp/qd-remote.sqlite")),
            ..Config::default()
        };
        assert_eq!(cfg.local_descriptor().unwrap().dbname, "/tmp/qd-remote.sqlite");
    }

    #[test]
    fn test_no_descriptor_is_not_connected() {
        let cfg = Config::default();
        assert!(matches!(cfg.local_descriptor(), Err(Error::NotConnected(_))));
        assert!(matches!(cfg.remote_descriptor(), Err(Error::NotConnected(_))));
    }

    // ===== Identity =====

    #[test]
    fn test_complete_identity() {
        let triple = create_test_config().require_identity().unwrap();
        assert_eq!(triple, SampleTriple::new("six_dots", "XLD", "SQ21"));
    }

    #[test]
    fn test_missing_identity_component() {
        let mut cfg = create_test_config();
        cfg.identity.sample = None;
        match cfg.require_identity() {
            Err(Error::Config(msg)) => assert!(msg.contains("sample")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.commit_interval(), Duration::from_millis(200));
        assert_eq!(cfg.sync_interval(), Duration::from_secs(2));
        assert_eq!(cfg.sync_chunk_bytes, 2_000_000);
        assert_eq!(cfg.prealloc_samples, 125_000);
    }
}
