use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use synapse_protocol::KeysFile;
use tracing::{info, warn};

/// Consecutive rate-limit reports after which a key is quarantined.
const FAIL_TOLERANCE: u32 = 2;

/// Fallback model identifiers used when `keys.json` does not list any.
const DEFAULT_MODELS: &[&str] = &["gemini-3-flash-preview", "gemini-2.5-flash"];

#[derive(Debug, Clone)]
struct PoolKey {
    key: String,
    active: bool,
    fail_count: u32,
}

/// The credential/model pair handed to a provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyModelPair {
    pub key: String,
    pub model: String,
}

/// Rotating credential pointer with failure quarantine and a revive
/// policy: when every key has been quarantined, the whole pool is
/// re-enabled and counters reset rather than hard-failing.
#[derive(Debug)]
pub struct KeyRotator {
    keys: RwLock<Vec<PoolKey>>,
    models: RwLock<Vec<String>>,
    key_index: AtomicUsize,
    model_index: AtomicUsize,
    serper: RwLock<String>,
}

impl KeyRotator {
    /// Build from an in-memory pool. Used by provider tests and by
    /// `load_from` after parsing `keys.json`.
    pub fn from_pool(keys: Vec<String>, models: Vec<String>) -> Self {
        let models = if models.is_empty() {
            DEFAULT_MODELS.iter().map(|m| (*m).to_owned()).collect()
        } else {
            models
        };
        Self {
            keys: RwLock::new(
                keys.into_iter()
                    .map(|key| PoolKey {
                        key,
                        active: true,
                        fail_count: 0,
                    })
                    .collect(),
            ),
            models: RwLock::new(models),
            key_index: AtomicUsize::new(0),
            model_index: AtomicUsize::new(0),
            serper: RwLock::new(String::new()),
        }
    }

    /// Load the pool from a `keys.json` file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading key file {path:?}"))?;
        let file: KeysFile = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing key file {path:?}"))?;

        let rotator = Self::from_pool(file.keys, file.models);
        *rotator.serper.write() = file.serper;
        info!(
            keys = rotator.total_keys(),
            models = rotator.total_models(),
            "key pool loaded"
        );
        Ok(rotator)
    }

    /// An empty rotator for degraded (keyless) operation.
    pub fn empty() -> Self {
        Self::from_pool(Vec::new(), Vec::new())
    }

    pub fn total_keys(&self) -> usize {
        self.keys.read().len()
    }

    pub fn total_models(&self) -> usize {
        self.models.read().len()
    }

    pub fn serper_key(&self) -> String {
        self.serper.read().clone()
    }

    /// The first active key at or after the pointer (linear probe modulo
    /// pool size), paired with the current model. A fully dark pool is
    /// revived in place before selection, so this returns `None` only when
    /// no keys exist at all.
    pub fn current_pair(&self) -> Option<KeyModelPair> {
        let model = {
            let models = self.models.read();
            let index = self.model_index.load(Ordering::Relaxed) % models.len().max(1);
            models.get(index).cloned().unwrap_or_default()
        };

        {
            let keys = self.keys.read();
            if keys.is_empty() {
                return None;
            }
            let start = self.key_index.load(Ordering::Relaxed);
            for offset in 0..keys.len() {
                let index = (start + offset) % keys.len();
                if keys[index].active {
                    return Some(KeyModelPair {
                        key: keys[index].key.clone(),
                        model,
                    });
                }
            }
        }

        self.revive_all();
        let keys = self.keys.read();
        keys.first().map(|entry| KeyModelPair {
            key: entry.key.clone(),
            model,
        })
    }

    /// Count a rate-limit hit against the current key; quarantine it once
    /// it exceeds the tolerance. The pointer only advances on an explicit
    /// rotate, so the selection scan is what routes around a dark key.
    pub fn report_rate_limit(&self) {
        let mut keys = self.keys.write();
        if keys.is_empty() {
            return;
        }
        let start = self.key_index.load(Ordering::Relaxed);
        let Some(index) = (0..keys.len())
            .map(|offset| (start + offset) % keys.len())
            .find(|&candidate| keys[candidate].active)
        else {
            return;
        };
        let entry = &mut keys[index];
        entry.fail_count += 1;
        if entry.fail_count > FAIL_TOLERANCE {
            entry.active = false;
            warn!(index, fails = entry.fail_count, "key quarantined after repeated rate limits");
        }
    }

    /// Advance the key pointer.
    pub fn rotate_key(&self) {
        let previous = self.key_index.fetch_add(1, Ordering::Relaxed);
        info!(from = previous, to = previous + 1, "rotating key pointer");
    }

    /// Advance the model pointer.
    pub fn rotate_model(&self) {
        self.model_index.fetch_add(1, Ordering::Relaxed);
    }

    fn revive_all(&self) {
        let mut keys = self.keys.write();
        for entry in keys.iter_mut() {
            entry.active = true;
            entry.fail_count = 0;
        }
        self.key_index.store(0, Ordering::Relaxed);
        warn!(keys = keys.len(), "all keys exhausted, reviving entire pool");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[test]
    fn current_pair_returns_first_active_key() {
        let rotator = KeyRotator::from_pool(
            vec!["K1".into(), "K2".into()],
            vec!["model-a".into()],
        );
        let pair = rotator.current_pair().unwrap();
        assert_eq!(pair.key, "K1");
        assert_eq!(pair.model, "model-a");
    }

    #[test]
    fn quarantine_after_three_failures_then_next_key() {
        let rotator = KeyRotator::from_pool(
            vec!["K1".into(), "K2".into()],
            vec!["model-a".into()],
        );

        for _ in 0..3 {
            rotator.report_rate_limit();
        }

        assert!(!rotator.keys.read()[0].active);
        assert_eq!(rotator.current_pair().unwrap().key, "K2");
    }

    #[test]
    fn dark_pool_is_revived() {
        let rotator = KeyRotator::from_pool(
            vec!["K1".into(), "K2".into()],
            vec!["model-a".into()],
        );
        // Three strikes for K1, then three for K2 (the scan retargets the
        // reports once K1 goes dark).
        for _ in 0..6 {
            rotator.report_rate_limit();
        }
        assert!(rotator.keys.read().iter().all(|k| !k.active));

        // Revive policy: the pool comes back rather than failing hard.
        let pair = rotator.current_pair().unwrap();
        assert!(pair.key == "K1" || pair.key == "K2");
        assert!(rotator.keys.read().iter().all(|k| k.active));
        assert!(rotator.keys.read().iter().all(|k| k.fail_count == 0));
    }

    #[test]
    fn missing_models_fall_back_to_defaults() {
        let rotator = KeyRotator::from_pool(vec!["K1".into()], vec![]);
        assert_eq!(rotator.total_models(), DEFAULT_MODELS.len());
        assert_eq!(
            rotator.current_pair().unwrap().model,
            DEFAULT_MODELS[0]
        );
    }

    #[test]
    fn empty_pool_yields_no_pair() {
        let rotator = KeyRotator::empty();
        assert!(rotator.current_pair().is_none());
    }

    #[test]
    fn load_from_keys_file() {
        let root = unique_test_root("synapse-keys");
        fs::create_dir_all(&root).unwrap();
        let path = root.join("keys.json");
        fs::write(
            &path,
            r#"{"keys": ["K1", "K2"], "models": ["m1"], "serper": "S"}"#,
        )
        .unwrap();

        let rotator = KeyRotator::load_from(&path).unwrap();
        assert_eq!(rotator.total_keys(), 2);
        assert_eq!(rotator.total_models(), 1);
        assert_eq!(rotator.serper_key(), "S");

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rotation_wraps_modulo_pool_size() {
        let rotator = KeyRotator::from_pool(
            vec!["K1".into(), "K2".into()],
            vec!["model-a".into()],
        );
        rotator.rotate_key();
        assert_eq!(rotator.current_pair().unwrap().key, "K2");
        rotator.rotate_key();
        assert_eq!(rotator.current_pair().unwrap().key, "K1");
    }
}
