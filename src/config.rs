use std::{fmt::Display, str::FromStr, time::Duration};

use serde::Serialize;
use tracing::warn;

use crate::{
    document_db::DocumentDb,
    error::{Error, Result},
    hnsw::HnswParams,
    model_manager::{DEFAULT_MODEL_ID, MODEL_ENV_VAR},
};

/// Setting that selects the embedding model. Not part of [`EngineConfig`].
pub const MODEL_SETTING: &str = "model_name";

/// Every key accepted in the settings table.
pub const SETTING_KEYS: &[&str] = &[
    "top_k",
    "flush_every",
    "embed_timeout_ms",
    "embed_attempts",
    "hashing_dimension",
    "hnsw.m",
    "hnsw.m0",
    "hnsw.ef_construction",
    "hnsw.ef_search",
    "seed",
    MODEL_SETTING,
];

/// Tunables of the retrieval engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    /// Results returned by a search that does not ask for a count.
    pub top_k: usize,
    /// Insertions after which a tenant is flushed to disk.
    pub flush_every: usize,
    /// Upper bound for one embedding call.
    pub embed_timeout: Duration,
    /// Tries per embedding call when the provider fails transiently.
    pub embed_attempts: usize,
    /// Vector length of the model-free hashing embedder.
    pub hashing_dimension: usize,
    /// Fixed seed for level assignment; random when unset.
    pub seed: Option<u64>,
    pub hnsw: HnswParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            flush_every: 32,
            embed_timeout: Duration::from_secs(30),
            embed_attempts: 2,
            hashing_dimension: 256,
            seed: None,
            hnsw: HnswParams::default(),
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e| {
        Error::Config(format!("invalid value '{value}' for {key}: {e}"))
    })
}

impl EngineConfig {
    /// Defaults overlaid with every recognised key of the settings table.
    pub fn from_settings(db: &DocumentDb) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in db.list_settings()? {
            if !SETTING_KEYS.contains(&key.as_str()) {
                warn!(key, "ignoring unknown setting");
                continue;
            }
            config.apply(&key, &value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set one field from its settings-table representation.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "top_k" => self.top_k = parse(key, value)?,
            "flush_every" => self.flush_every = parse(key, value)?,
            "embed_timeout_ms" => {
                self.embed_timeout = Duration::from_millis(parse(key, value)?);
            }
            "embed_attempts" => self.embed_attempts = parse(key, value)?,
            "hashing_dimension" => self.hashing_dimension = parse(key, value)?,
            "hnsw.m" => self.hnsw.m = parse(key, value)?,
            "hnsw.m0" => self.hnsw.m0 = parse(key, value)?,
            "hnsw.ef_construction" => {
                self.hnsw.ef_construction = parse(key, value)?;
            }
            "hnsw.ef_search" => self.hnsw.ef_search = parse(key, value)?,
            "seed" => self.seed = Some(parse(key, value)?),
            MODEL_SETTING => {}
            _ => {
                return Err(Error::Config(format!(
                    "unknown setting '{key}' (known: {})",
                    SETTING_KEYS.join(", ")
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.hnsw.validate().map_err(Error::Config)?;
        for (name, value) in [
            ("top_k", self.top_k),
            ("flush_every", self.flush_every),
            ("embed_attempts", self.embed_attempts),
            ("hashing_dimension", self.hashing_dimension),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if self.embed_timeout.is_zero() {
            return Err(Error::Config("embed_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    /// Current values keyed like the settings table.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("top_k", self.top_k.to_string()),
            ("flush_every", self.flush_every.to_string()),
            (
                "embed_timeout_ms",
                self.embed_timeout.as_millis().to_string(),
            ),
            ("embed_attempts", self.embed_attempts.to_string()),
            ("hashing_dimension", self.hashing_dimension.to_string()),
            ("hnsw.m", self.hnsw.m.to_string()),
            ("hnsw.m0", self.hnsw.m0.to_string()),
            ("hnsw.ef_construction", self.hnsw.ef_construction.to_string()),
            ("hnsw.ef_search", self.hnsw.ef_search.to_string()),
            (
                "seed",
                self.seed.map_or_else(|| "random".to_string(), |s| s.to_string()),
            ),
        ]
    }
}

/// Resolve the embedding model id from, in order of priority:
/// 1. An explicit id (from --model)
/// 2. The RAGDEX_MODEL environment variable
/// 3. The `model_name` setting
/// 4. [`DEFAULT_MODEL_ID`]
pub fn resolve_model_id(explicit: Option<&str>, db: &DocumentDb) -> Result<String> {
    if let Some(model) = explicit {
        return Ok(model.to_string());
    }
    if let Ok(model) = std::env::var(MODEL_ENV_VAR) {
        return Ok(model);
    }
    db.get_setting_or(MODEL_SETTING, DEFAULT_MODEL_ID)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, DocumentDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = DocumentDb::open(&tmp.path().join("documents.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.top_k, 5);
        assert_eq!(config.hnsw.ef_construction, 200);
        config.validate().unwrap();
    }

    #[test]
    fn settings_override_defaults() {
        let (_tmp, db) = test_db();
        db.set_setting("top_k", "9").unwrap();
        db.set_setting("hnsw.m", "8").unwrap();
        db.set_setting("hnsw.m0", "16").unwrap();
        db.set_setting("embed_timeout_ms", "1500").unwrap();
        db.set_setting("seed", "42").unwrap();
        db.set_setting(MODEL_SETTING, "some/model").unwrap();

        let config = EngineConfig::from_settings(&db).unwrap();
        assert_eq!(config.top_k, 9);
        assert_eq!(config.hnsw.m, 8);
        assert_eq!(config.hnsw.m0, 16);
        assert_eq!(config.embed_timeout, Duration::from_millis(1500));
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn unparsable_value_is_a_config_error() {
        let (_tmp, db) = test_db();
        db.set_setting("flush_every", "often").unwrap();
        assert!(matches!(
            EngineConfig::from_settings(&db),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn invalid_combination_rejected() {
        let (_tmp, db) = test_db();
        db.set_setting("hnsw.m", "32").unwrap();
        db.set_setting("hnsw.m0", "8").unwrap();
        assert!(EngineConfig::from_settings(&db).is_err());
    }

    #[test]
    fn zero_values_rejected() {
        let mut config = EngineConfig::default();
        config.apply("top_k", "0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_key_rejected_by_apply() {
        let mut config = EngineConfig::default();
        assert!(config.apply("colour", "blue").is_err());
    }

    #[test]
    fn entries_cover_every_engine_key() {
        let entries = EngineConfig::default().entries();
        for (key, _) in &entries {
            assert!(SETTING_KEYS.contains(key));
        }
        assert_eq!(entries.len(), SETTING_KEYS.len() - 1);
    }

    #[test]
    fn explicit_model_wins() {
        let (_tmp, db) = test_db();
        db.set_setting(MODEL_SETTING, "stored/model").unwrap();
        assert_eq!(
            resolve_model_id(Some("cli/model"), &db).unwrap(),
            "cli/model"
        );
    }
}
