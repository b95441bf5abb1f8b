use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration files merged in order: `base` (TOML) then `run` (JSON).
#[derive(Clone, Debug, Default)]
pub struct ConfigLayering {
    pub base: Option<PathBuf>,
    pub run: Option<PathBuf>,
}

impl ConfigLayering {
    /// Reads `DCNET_CONFIG_BASE` / `DCNET_CONFIG_RUN`. Paths that do not exist
    /// are ignored.
    pub fn discover() -> Self {
        let base = std::env::var("DCNET_CONFIG_BASE")
            .map(PathBuf::from)
            .ok()
            .and_then(existing_path);
        let run = std::env::var("DCNET_CONFIG_RUN")
            .map(PathBuf::from)
            .ok()
            .and_then(existing_path);
        ConfigLayering { base, run }
    }

    /// Overrides the base layer path.
    pub fn with_base<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base = Some(path.into());
        self
    }

    /// Overrides the run layer path.
    pub fn with_run<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.run = Some(path.into());
        self
    }
}

fn existing_path(path: PathBuf) -> Option<PathBuf> {
    if path.exists() {
        Some(path)
    } else {
        None
    }
}

/// Result of merging layered configuration files.
#[derive(Clone, Debug)]
pub struct LayeredConfig {
    layering: ConfigLayering,
    value: Value,
}

impl LayeredConfig {
    /// Loads the configured layers, merging base → run. The file format is
    /// picked from the extension (`.json` is JSON, everything else TOML).
    pub fn load(layering: ConfigLayering) -> Result<Self, LayeredConfigError> {
        let mut value = Value::Object(Default::default());
        for path in [layering.base.as_ref(), layering.run.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(layer) = load_file(path)? {
                tracing::debug!(path = %path.display(), "merging configuration layer");
                merge(&mut value, &layer);
            }
        }
        Ok(LayeredConfig { layering, value })
    }

    /// Returns the merged configuration.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Returns the layering metadata used for this configuration.
    pub fn layering(&self) -> &ConfigLayering {
        &self.layering
    }

    /// Extracts a typed view of a nested section. `path` is traversed key by
    /// key; a missing key yields `Ok(None)`.
    pub fn section<T>(&self, path: &[&str]) -> Result<Option<T>, LayeredConfigError>
    where
        T: DeserializeOwned,
    {
        let mut node = &self.value;
        for key in path {
            match node {
                Value::Object(map) => match map.get(*key) {
                    Some(value) => node = value,
                    None => return Ok(None),
                },
                _ => return Ok(None),
            }
        }
        serde_json::from_value(node.clone())
            .map(Some)
            .map_err(|source| LayeredConfigError::Section {
                section: path.join("."),
                source,
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LayeredConfigError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML {path:?}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to parse JSON {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("section `{section}` does not match the expected schema: {source}")]
    Section {
        section: String,
        #[source]
        source: serde_json::Error,
    },
}

fn load_file(path: &Path) -> Result<Option<Value>, LayeredConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = fs::read_to_string(path).map_err(|source| LayeredConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        return serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| LayeredConfigError::Json {
                path: path.to_path_buf(),
                source,
            });
    }
    let value: toml::Value = toml::from_str(&text).map_err(|source| LayeredConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::to_value(value)
        .map(Some)
        .map_err(|source| LayeredConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
}

fn merge(dest: &mut Value, src: &Value) {
    match (dest, src) {
        (Value::Object(dest_map), Value::Object(src_map)) => {
            for (key, value) in src_map {
                match dest_map.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        dest_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (dest_slot, src_value) => {
            *dest_slot = src_value.clone();
        }
    }
}
