//! Configuration parsing – reads a KEY=VALUE file shared by the capture
//! and API servers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

/// Environment variable that overrides `GENERATION_API_KEY`, so the
/// credential can stay out of the config file.
pub const API_KEY_ENV: &str = "HOOKSCRIBE_API_KEY";

/// Application configuration, shared between capture and API servers.
///
/// Both servers load the same file; each ignores fields it does not need.
#[derive(Debug, Clone)]
pub struct Config {
    // ── storage ──────────────────────────────────────────────────────
    pub db_path: PathBuf,

    // ── capture ingress ──────────────────────────────────────────────
    /// Address the webhook capture server listens on.
    pub capture_listen_addr: String,
    /// Largest webhook body accepted by the capture server.
    pub capture_max_body_bytes: usize,

    // ── API ──────────────────────────────────────────────────────────
    pub api_listen_addr: String,

    // ── generation backend ───────────────────────────────────────────
    /// Base URL of an OpenAI-compatible endpoint (without `/chat/completions`).
    pub generation_base_url: String,
    pub generation_model: String,
    pub generation_api_key: Option<String>,
    /// Language the generated handler is written in.
    pub generation_language: String,
    /// Connect timeout for the backend HTTP client (seconds).
    pub http_timeout_secs: u64,

    // ── streaming relay ──────────────────────────────────────────────
    /// Chunks buffered between the backend and a slow client.
    pub relay_buffer_chunks: usize,
    /// Upper bound on a single chunk pull, `None` when disabled.
    pub relay_pull_timeout: Option<Duration>,
}

impl Config {
    /// Default config path.
    pub fn default_path() -> &'static str {
        "/etc/hookscribe/hookscribe.conf"
    }
}

impl Default for Config {
    fn default() -> Self {
        from_map(&HashMap::new())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read config: {}", path.display()))?;

    let map = parse_conf(&text);
    info!("Loaded config from {}", path.display());

    let mut config = from_map(&map);
    if let Ok(key) = std::env::var(API_KEY_ENV) {
        if !key.is_empty() {
            config.generation_api_key = Some(key);
        }
    }
    Ok(config)
}

fn from_map(map: &HashMap<String, String>) -> Config {
    let get = |key: &str| -> Option<String> { map.get(key).cloned() };
    let get_u64 = |key: &str, default: u64| -> u64 {
        get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
    };

    Config {
        db_path: PathBuf::from(get("DB_PATH").unwrap_or_else(|| "/data/webhooks.db".into())),

        capture_listen_addr: get("CAPTURE_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8090".into()),
        capture_max_body_bytes: get_u64("CAPTURE_MAX_BODY_BYTES", 1024 * 1024) as usize,

        api_listen_addr: get("API_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:3333".into()),

        generation_base_url: get("GENERATION_BASE_URL")
            .unwrap_or_else(|| "https://api.z.ai/api/coding/paas/v4".into())
            .trim_end_matches('/')
            .to_string(),
        generation_model: get("GENERATION_MODEL").unwrap_or_else(|| "glm-4.6".into()),
        generation_api_key: get("GENERATION_API_KEY").filter(|s| !s.is_empty()),
        generation_language: get("GENERATION_LANGUAGE")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "TypeScript".into()),
        http_timeout_secs: get_u64("HTTP_TIMEOUT_SECS", 30),

        // A zero-sized channel cannot exist, so 0 falls back to 1.
        relay_buffer_chunks: (get_u64("RELAY_BUFFER_CHUNKS", 16) as usize).max(1),
        relay_pull_timeout: match get_u64("RELAY_PULL_TIMEOUT_SECS", 0) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conf() {
        let text = r#"
# comment
DB_PATH=/tmp/hooks.db
GENERATION_MODEL="gpt-4o-mini"
API_LISTEN_ADDR=127.0.0.1:4000
"#;
        let map = parse_conf(text);
        assert_eq!(map["DB_PATH"], "/tmp/hooks.db");
        assert_eq!(map["GENERATION_MODEL"], "gpt-4o-mini");
        assert_eq!(map["API_LISTEN_ADDR"], "127.0.0.1:4000");
        assert!(!map.contains_key("comment"));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_listen_addr, "0.0.0.0:3333");
        assert_eq!(config.relay_buffer_chunks, 16);
        assert_eq!(config.relay_pull_timeout, None);
        assert_eq!(config.generation_language, "TypeScript");
        assert!(config.generation_api_key.is_none());
    }

    #[test]
    fn test_relay_settings() {
        let map = parse_conf(
            "RELAY_BUFFER_CHUNKS=0\nRELAY_PULL_TIMEOUT_SECS=45\nGENERATION_BASE_URL=http://llm:8000/v1/\n",
        );
        let config = from_map(&map);
        assert_eq!(config.relay_buffer_chunks, 1);
        assert_eq!(config.relay_pull_timeout, Some(Duration::from_secs(45)));
        assert_eq!(config.generation_base_url, "http://llm:8000/v1");
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile("DB_PATH=/tmp/hookscribe-test/webhooks.db\n");
        let config = load(tmp.as_path()).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/hookscribe-test/webhooks.db"));
    }

    fn tempfile(content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("hookscribe_config_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.conf");
        std::fs::write(&path, content).unwrap();
        path
    }
}
