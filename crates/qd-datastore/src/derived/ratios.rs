use std::sync::Arc;

use tracing::debug;

use crate::catalog::{Catalog, RatioRecord};
use crate::error::{Error, Result};

/// Per-channel scale factors stored under one name.
pub struct ChannelRatios {
    catalog: Arc<Catalog>,
    name: String,
    channels: Vec<String>,
    ratios: Vec<f64>,
}

impl ChannelRatios {
    /// Loads the stored ratios of `channels`. Channels never stored start at 1.0.
    pub fn load(catalog: Arc<Catalog>, name: &str, channels: &[&str]) -> Result<Self> {
        let stored = catalog.matrices.load_ratios(name)?;
        let ratios = channels
            .iter()
            .map(|channel| {
                stored
                    .as_ref()
                    .and_then(|record| {
                        record
                            .channels
                            .iter()
                            .position(|c| c == channel)
                            .and_then(|i| record.ratios.get(i).copied())
                    })
                    .unwrap_or(1.0)
            })
            .collect();
        Ok(Self {
            catalog,
            name: name.to_string(),
            channels: channels.iter().map(|c| c.to_string()).collect(),
            ratios,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.channels.iter().map(String::as_str).zip(self.ratios.iter().copied())
    }

    fn position(&self, channel: &str) -> Result<usize> {
        self.channels
            .iter()
            .position(|c| c == channel)
            .ok_or_else(|| Error::NotFound(format!("channel '{}' not in ratios '{}'", channel, self.name)))
    }

    pub fn get(&self, channel: &str) -> Result<f64> {
        Ok(self.ratios[self.position(channel)?])
    }

    /// Sets one ratio and writes it back, leaving other stored channels intact.
    pub fn set(&mut self, channel: &str, value: f64) -> Result<()> {
        let i = self.position(channel)?;
        self.ratios[i] = value;

        let mut record = self
            .catalog
            .matrices
            .load_ratios(&self.name)?
            .unwrap_or_else(|| RatioRecord {
                name: self.name.clone(),
                channels: Vec::new(),
                ratios: Vec::new(),
            });
        record.ratios.resize(record.channels.len(), 1.0);
        match record.channels.iter().position(|c| c == channel) {
            Some(pos) => record.ratios[pos] = value,
            None => {
                record.channels.push(channel.to_string());
                record.ratios.push(value);
            }
        }
        self.catalog.matrices.save_ratios(&record)?;
        debug!("Set ratio {}={} in '{}'", channel, value, self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_new_channels_default_to_one() {
        let dir = TempDir::new().unwrap();
        let cat = Arc::new(Catalog::open_path(&dir.path().join("ratios.sqlite")).unwrap());

        let mut ratios = ChannelRatios::load(cat.clone(), "general", &["P1", "P2"]).unwrap();
        assert_eq!(ratios.get("P1").unwrap(), 1.0);
        ratios.set("P2", 0.5).unwrap();

        let other = ChannelRatios::load(cat.clone(), "general", &["P3"]).unwrap();
        assert_eq!(other.get("P3").unwrap(), 1.0);
        assert!(other.get("P2").unwrap_err().is_not_found());

        let mut wide = ChannelRatios::load(cat.clone(), "general", &["P2", "P3"]).unwrap();
        assert_eq!(wide.get("P2").unwrap(), 0.5);
        wide.set("P3", 0.25).unwrap();

        let stored = cat.matrices.load_ratios("general").unwrap().unwrap();
        assert_eq!(stored.channels, vec!["P2".to_string(), "P3".to_string()]);
        assert_eq!(stored.ratios, vec![0.5, 0.25]);
        assert_eq!(
            wide.iter().collect::<Vec<_>>(),
            vec![("P2", 0.5), ("P3", 0.25)]
        );
    }
}
