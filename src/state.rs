//! On-disk crawl-state snapshots (spec §6.5). The core only knows how
//! to serialize a `CrawlerState` to a file and read one back — it is
//! opaque beyond that: callers decide *when* to snapshot and *what* to
//! do with a reloaded one (the engine's `load_state` replays it into a
//! fresh frontier/dedup/result set per §6.5's "Loading" paragraph).

use crate::models::CrawlerState;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write state file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode state: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Serializes `state` as pretty JSON and writes it to `path`, replacing
/// any existing file. Unknown fields on a later reload are tolerated —
/// see `CrawlerState`'s `config` field, which carries whatever blob the
/// caller wants through unchanged.
pub async fn save(path: &str, state: &CrawlerState) -> Result<(), StateError> {
    let json = serde_json::to_vec_pretty(state)?;
    fs::write(path, json)
        .await
        .map_err(|source| StateError::Write {
            path: path.to_string(),
            source,
        })
}

/// Reads and deserializes a snapshot previously written by `save`.
pub async fn load(path: &str) -> Result<CrawlerState, StateError> {
    let bytes = fs::read(path)
        .await
        .map_err(|source| StateError::Read {
            path: path.to_string(),
            source,
        })?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrawlStatsSnapshot, QueueItem};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(label: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("crawlcore_state_test_{label}_{nanos}.json"))
            .to_string_lossy()
            .into_owned()
    }

    #[tokio::test]
    async fn test_save_then_load_round_trips() {
        let path = temp_path("roundtrip");
        let state = CrawlerState {
            target: "https://a.test/".to_string(),
            started_at: 1000,
            updated_at: 2000,
            stats: CrawlStatsSnapshot::default(),
            queue_urls: vec![QueueItem::seed("https://a.test/b")],
            visited_urls: vec!["https://a.test/".to_string()],
            endpoints: Vec::new(),
            forms: Vec::new(),
            websockets: Vec::new(),
            errors: Vec::new(),
            config: serde_json::json!({"workers": 4}),
        };

        save(&path, &state).await.unwrap();
        let loaded = load(&path).await.unwrap();

        assert_eq!(loaded.target, state.target);
        assert_eq!(loaded.visited_urls, state.visited_urls);
        assert_eq!(loaded.queue_urls.len(), 1);
        assert_eq!(loaded.config["workers"], 4);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_load_missing_file_errors() {
        let path = temp_path("missing");
        let err = load(&path).await.unwrap_err();
        assert!(matches!(err, StateError::Read { .. }));
    }
}
