//! Content hash of a fetched job map.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use scrapegrid_core::{ConfigError, ScrapeConfig};

/// SHA-256 over every `(job name, job yaml)` entry in name order, hex
/// encoded. Equal job maps hash equally however they were built.
pub fn config_hash(jobs: &BTreeMap<String, ScrapeConfig>) -> Result<String, ConfigError> {
    let mut hasher = Sha256::new();
    for (name, job) in jobs {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(serde_yaml::to_string(job)?.as_bytes());
        hasher.update([0u8]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scrapegrid_core::PromDuration;

    fn job(name: &str, interval: u64) -> (String, ScrapeConfig) {
        let mut job = ScrapeConfig::new(name);
        job.scrape_interval = Some(PromDuration::from_secs(interval));
        (name.to_string(), job)
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let mut forward = BTreeMap::new();
        for (k, v) in [job("a", 30), job("b", 30), job("c", 60)] {
            forward.insert(k, v);
        }
        let mut reverse = BTreeMap::new();
        for (k, v) in [job("c", 60), job("b", 30), job("a", 30)] {
            reverse.insert(k, v);
        }
        assert_eq!(config_hash(&forward).unwrap(), config_hash(&reverse).unwrap());
    }

    #[test]
    fn hash_changes_with_content() {
        let before = BTreeMap::from([job("a", 30)]);
        let after = BTreeMap::from([job("a", 60)]);
        assert_ne!(config_hash(&before).unwrap(), config_hash(&after).unwrap());
        assert_eq!(config_hash(&before).unwrap().len(), 64);
    }
}
