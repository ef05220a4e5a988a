//! Worker configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Where finished outputs are uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    S3 {
        bucket: String,
        /// Custom endpoint for S3-compatible stores.
        endpoint: Option<String>,
        public_base_url: String,
    },
    Local {
        path: PathBuf,
        public_base_url: String,
    },
}

/// Everything the worker needs at startup. Built once and passed down
/// explicitly; nothing below `main` reads the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub database_url: String,
    /// ComfyUI HTTP base URL.
    pub comfyui_api_url: String,
    /// ComfyUI WebSocket base URL.
    pub comfyui_ws_url: String,
    /// JSON workflow (API format) rendered for every job.
    pub workflow_template_path: PathBuf,
    pub poll_interval: Duration,
    /// Upper bound on one job's execution, from submission to outcome.
    pub generation_timeout: Duration,
    /// `(node type, weight)` pairs merged over the built-in cost table.
    pub node_weight_overrides: Vec<(String, u32)>,
    /// `(node type, stage label)` pairs merged over the built-in labels.
    pub stage_label_overrides: Vec<(String, String)>,
    pub storage: StorageConfig,
}

/// Invalid or missing configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                            |
    /// |---------------------------|------------------------------------|
    /// | `DATABASE_URL`            | required                           |
    /// | `COMFYUI_API_URL`         | `http://localhost:8188`            |
    /// | `COMFYUI_WS_URL`          | API URL with `ws://` / `wss://`    |
    /// | `WORKFLOW_TEMPLATE_PATH`  | `workflows/text_to_image.json`     |
    /// | `POLL_INTERVAL_SECS`      | `5`                                |
    /// | `GENERATION_TIMEOUT_SECS` | `600`                              |
    /// | `NODE_WEIGHT_OVERRIDES`   | empty, e.g. `KSampler=80,VAEDecode=10` |
    /// | `STAGE_LABEL_OVERRIDES`   | empty, e.g. `UpscaleModelLoader=Loading upscaler` |
    /// | `STORAGE_BACKEND`         | `local` (`local` or `s3`)          |
    /// | `S3_BUCKET`               | required when backend is `s3`      |
    /// | `S3_ENDPOINT`             | unset (AWS)                        |
    /// | `PUBLIC_BASE_URL`         | local: `http://localhost:8080/media`, s3: bucket URL |
    /// | `LOCAL_STORAGE_PATH`      | `./media`                          |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let comfyui_api_url = get("COMFYUI_API_URL")
            .unwrap_or_else(|| "http://localhost:8188".into())
            .trim_end_matches('/')
            .to_string();
        let comfyui_ws_url = match get("COMFYUI_WS_URL") {
            Some(url) => url,
            None => derive_ws_url(&comfyui_api_url)?,
        };

        let workflow_template_path = get("WORKFLOW_TEMPLATE_PATH")
            .unwrap_or_else(|| "workflows/text_to_image.json".into())
            .into();

        let poll_interval = Duration::from_secs(parse_secs(
            "POLL_INTERVAL_SECS",
            get("POLL_INTERVAL_SECS"),
            5,
        )?);
        let generation_timeout = Duration::from_secs(parse_secs(
            "GENERATION_TIMEOUT_SECS",
            get("GENERATION_TIMEOUT_SECS"),
            600,
        )?);

        let node_weight_overrides = match get("NODE_WEIGHT_OVERRIDES") {
            Some(raw) => parse_weight_overrides(&raw)?,
            None => Vec::new(),
        };
        let stage_label_overrides = match get("STAGE_LABEL_OVERRIDES") {
            Some(raw) => parse_label_overrides(&raw)?,
            None => Vec::new(),
        };

        let storage = match get("STORAGE_BACKEND").as_deref().unwrap_or("local") {
            "local" => StorageConfig::Local {
                path: get("LOCAL_STORAGE_PATH")
                    .unwrap_or_else(|| "./media".into())
                    .into(),
                public_base_url: get("PUBLIC_BASE_URL")
                    .unwrap_or_else(|| "http://localhost:8080/media".into()),
            },
            "s3" => {
                let bucket = get("S3_BUCKET").ok_or(ConfigError::Missing("S3_BUCKET"))?;
                let endpoint = get("S3_ENDPOINT");
                let public_base_url = get("PUBLIC_BASE_URL")
                    .unwrap_or_else(|| format!("https://{bucket}.s3.amazonaws.com"));
                StorageConfig::S3 {
                    bucket,
                    endpoint,
                    public_base_url,
                }
            }
            other => {
                return Err(ConfigError::Invalid {
                    var: "STORAGE_BACKEND",
                    reason: format!("unknown backend '{other}', expected 'local' or 's3'"),
                })
            }
        };

        Ok(Self {
            database_url,
            comfyui_api_url,
            comfyui_ws_url,
            workflow_template_path,
            poll_interval,
            generation_timeout,
            node_weight_overrides,
            stage_label_overrides,
            storage,
        })
    }
}

/// Parse `Type=weight` pairs separated by commas.
///
/// Zero weights are accepted here and rejected by the cost table.
pub fn parse_weight_overrides(raw: &str) -> Result<Vec<(String, u32)>, ConfigError> {
    parse_pairs("NODE_WEIGHT_OVERRIDES", raw, |entry, weight| {
        weight
            .parse::<u32>()
            .map_err(|e| format!("weight in '{entry}': {e}"))
    })
}

/// Parse `Type=Stage label` pairs separated by commas.
pub fn parse_label_overrides(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    parse_pairs("STAGE_LABEL_OVERRIDES", raw, |entry, label| {
        if label.is_empty() {
            Err(format!("'{entry}' has an empty label"))
        } else {
            Ok(label.to_string())
        }
    })
}

fn parse_pairs<T>(
    var: &'static str,
    raw: &str,
    parse_value: impl Fn(&str, &str) -> Result<T, String>,
) -> Result<Vec<(String, T)>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid { var, reason };
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (type_tag, value) = entry
                .split_once('=')
                .ok_or_else(|| invalid(format!("'{entry}' is not of the form Type=value")))?;
            let type_tag = type_tag.trim();
            if type_tag.is_empty() {
                return Err(invalid(format!("'{entry}' has an empty node type")));
            }
            let value = parse_value(entry, value.trim()).map_err(invalid)?;
            Ok((type_tag.to_string(), value))
        })
        .collect()
}

fn parse_secs(var: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            var,
            reason: "must be greater than zero".into(),
        }),
        Ok(secs) => Ok(secs),
        Err(e) => Err(ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
    }
}

/// `http://host:8188` -> `ws://host:8188`, `https://…` -> `wss://…`.
fn derive_ws_url(api_url: &str) -> Result<String, ConfigError> {
    if let Some(rest) = api_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(ConfigError::Invalid {
            var: "COMFYUI_API_URL",
            reason: format!("'{api_url}' must start with http:// or https://"),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_with_only_database_url() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/genq")]).unwrap();
        assert_eq!(config.comfyui_api_url, "http://localhost:8188");
        assert_eq!(config.comfyui_ws_url, "ws://localhost:8188");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.generation_timeout, Duration::from_secs(600));
        assert!(config.node_weight_overrides.is_empty());
        assert!(config.stage_label_overrides.is_empty());
        assert_eq!(
            config.storage,
            StorageConfig::Local {
                path: "./media".into(),
                public_base_url: "http://localhost:8080/media".into(),
            }
        );
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(load(&[]), Err(ConfigError::Missing("DATABASE_URL")));
        assert_eq!(
            load(&[("DATABASE_URL", "  ")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn ws_url_follows_tls_of_api_url() {
        let config = load(&[
            ("DATABASE_URL", "postgres://db"),
            ("COMFYUI_API_URL", "https://gpu.example.com/"),
        ])
        .unwrap();
        assert_eq!(config.comfyui_api_url, "https://gpu.example.com");
        assert_eq!(config.comfyui_ws_url, "wss://gpu.example.com");
    }

    #[test]
    fn explicit_ws_url_wins() {
        let config = load(&[
            ("DATABASE_URL", "postgres://db"),
            ("COMFYUI_WS_URL", "ws://10.0.0.2:8188"),
        ])
        .unwrap();
        assert_eq!(config.comfyui_ws_url, "ws://10.0.0.2:8188");
    }

    #[test]
    fn s3_backend_requires_bucket() {
        let result = load(&[("DATABASE_URL", "postgres://db"), ("STORAGE_BACKEND", "s3")]);
        assert_eq!(result, Err(ConfigError::Missing("S3_BUCKET")));

        let config = load(&[
            ("DATABASE_URL", "postgres://db"),
            ("STORAGE_BACKEND", "s3"),
            ("S3_BUCKET", "renders"),
        ])
        .unwrap();
        assert_eq!(
            config.storage,
            StorageConfig::S3 {
                bucket: "renders".into(),
                endpoint: None,
                public_base_url: "https://renders.s3.amazonaws.com".into(),
            }
        );
    }

    #[test]
    fn unknown_backend_and_bad_numbers_are_rejected() {
        assert_matches!(
            load(&[("DATABASE_URL", "postgres://db"), ("STORAGE_BACKEND", "gcs")]),
            Err(ConfigError::Invalid { var: "STORAGE_BACKEND", .. })
        );
        assert_matches!(
            load(&[("DATABASE_URL", "postgres://db"), ("POLL_INTERVAL_SECS", "soon")]),
            Err(ConfigError::Invalid { var: "POLL_INTERVAL_SECS", .. })
        );
        assert_matches!(
            load(&[("DATABASE_URL", "postgres://db"), ("GENERATION_TIMEOUT_SECS", "0")]),
            Err(ConfigError::Invalid { var: "GENERATION_TIMEOUT_SECS", .. })
        );
    }

    #[test]
    fn weight_overrides_parse() {
        assert_eq!(
            parse_weight_overrides(" KSampler=80 , VAEDecode=10,").unwrap(),
            vec![("KSampler".to_string(), 80), ("VAEDecode".to_string(), 10)]
        );
        assert!(parse_weight_overrides("").unwrap().is_empty());
    }

    #[test]
    fn malformed_weight_overrides_are_rejected() {
        for raw in ["KSampler", "=5", "KSampler=-1", "KSampler=lots"] {
            assert_matches!(
                parse_weight_overrides(raw),
                Err(ConfigError::Invalid { var: "NODE_WEIGHT_OVERRIDES", .. }),
                "{raw}"
            );
        }
    }

    #[test]
    fn label_overrides_load_from_env() {
        let config = load(&[
            ("DATABASE_URL", "postgres://db"),
            (
                "STAGE_LABEL_OVERRIDES",
                "UpscaleModelLoader=Loading upscaler, VAEDecode = Decoding latents",
            ),
        ])
        .unwrap();
        assert_eq!(
            config.stage_label_overrides,
            vec![
                ("UpscaleModelLoader".to_string(), "Loading upscaler".to_string()),
                ("VAEDecode".to_string(), "Decoding latents".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_label_overrides_are_rejected() {
        for raw in ["VAEDecode", "=Decoding", "VAEDecode= "] {
            assert_matches!(
                parse_label_overrides(raw),
                Err(ConfigError::Invalid { var: "STAGE_LABEL_OVERRIDES", .. }),
                "{raw}"
            );
        }
    }
}
