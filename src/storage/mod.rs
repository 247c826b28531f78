use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::types::{Candle, TimeFrame};

/// Write JSON through a temp file and rename, so readers never observe a
/// half-written snapshot.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value).context("serializing snapshot")?;
    {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Read a JSON file; missing or corrupt content yields the default
/// without raising.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), %err, "corrupt state file, treating as empty");
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

/// Free-form per-strategy, per-symbol key-value store backed by
/// `strategy-state/{strategy_id}/{symbol}.json`. Every mutation re-reads,
/// rewrites, and atomically replaces the file.
pub struct StateStore {
    root: PathBuf,
    strategy_id: String,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>, strategy_id: &str) -> Self {
        Self {
            root: root.into(),
            strategy_id: strategy_id.to_string(),
        }
    }

    fn path(&self, symbol: &str) -> PathBuf {
        self.root
            .join("strategy-state")
            .join(&self.strategy_id)
            .join(format!("{symbol}.json"))
    }

    fn load(&self, symbol: &str) -> HashMap<String, Value> {
        read_json_or_default(&self.path(symbol))
    }

    pub fn get(&self, symbol: &str, key: &str, default: Value) -> Value {
        self.load(symbol).remove(key).unwrap_or(default)
    }

    pub fn set(&self, symbol: &str, key: &str, value: Value) -> Result<()> {
        let mut map = self.load(symbol);
        map.insert(key.to_string(), value);
        atomic_write_json(&self.path(symbol), &map)
    }

    pub fn delete(&self, symbol: &str, key: &str) -> Result<()> {
        let mut map = self.load(symbol);
        if map.remove(key).is_some() {
            atomic_write_json(&self.path(symbol), &map)?;
        }
        Ok(())
    }

    pub fn snapshot(&self, symbol: &str) -> HashMap<String, Value> {
        self.load(symbol)
    }
}

/// Append-only JSONL history writer, one serialized record per line.
pub struct JsonlAppender {
    path: PathBuf,
}

impl JsonlAppender {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening {}", self.path.display()))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Read every parseable record, skipping corrupt lines.
    pub fn read_all<T: DeserializeOwned>(&self) -> Vec<T> {
        let Ok(body) = fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

pub fn kline_cache_path(
    root: &Path,
    symbol: &str,
    interval: TimeFrame,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> PathBuf {
    root.join("logs")
        .join("kline-cache")
        .join(format!("{symbol}_{}_{start_date}_{end_date}.json", interval.as_str()))
}

/// Cache a candle range. Ranges touching the current (incomplete) day are
/// never written; returns whether a file was produced.
pub fn save_kline_cache(
    root: &Path,
    symbol: &str,
    interval: TimeFrame,
    start_date: NaiveDate,
    end_date: NaiveDate,
    today: NaiveDate,
    candles: &[Candle],
) -> Result<bool> {
    if end_date >= today {
        return Ok(false);
    }
    let path = kline_cache_path(root, symbol, interval, start_date, end_date);
    atomic_write_json(&path, &candles)?;
    Ok(true)
}

pub fn load_kline_cache(
    root: &Path,
    symbol: &str,
    interval: TimeFrame,
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Option<Vec<Candle>> {
    let path = kline_cache_path(root, symbol, interval, start_date, end_date);
    let bytes = fs::read(&path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn state_store_roundtrip_and_corruption() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path(), "default");

        assert_eq!(store.get("BTCUSDT", "missing", json!(null)), json!(null));

        store.set("BTCUSDT", "last_signal", json!("buy")).unwrap();
        store.set("BTCUSDT", "count", json!(3)).unwrap();
        assert_eq!(store.get("BTCUSDT", "last_signal", json!(null)), json!("buy"));
        assert_eq!(store.snapshot("BTCUSDT").len(), 2);

        store.delete("BTCUSDT", "count").unwrap();
        assert_eq!(store.snapshot("BTCUSDT").len(), 1);

        // corrupt file reads as empty
        let path = dir
            .path()
            .join("strategy-state")
            .join("default")
            .join("BTCUSDT.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(store.snapshot("BTCUSDT").is_empty());
    }

    #[test]
    fn jsonl_appender_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let appender = JsonlAppender::new(dir.path().join("logs").join("trades.jsonl"));
        appender.append(&json!({"n": 1})).unwrap();
        appender.append(&json!({"n": 2})).unwrap();

        fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("logs").join("trades.jsonl"))
            .unwrap()
            .write_all(b"garbage line\n")
            .unwrap();
        appender.append(&json!({"n": 3})).unwrap();

        let records: Vec<Value> = appender.read_all();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn kline_cache_refuses_current_day() {
        let dir = TempDir::new().unwrap();
        let t = Utc.timestamp_millis_opt(0).unwrap();
        let candles = vec![Candle {
            open_time: t,
            close_time: t,
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(1),
        }];
        let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let done = NaiveDate::from_ymd_opt(2024, 3, 14).unwrap();
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        // incomplete range: no file
        let written = save_kline_cache(
            dir.path(),
            "BTCUSDT",
            TimeFrame::H1,
            start,
            today,
            today,
            &candles,
        )
        .unwrap();
        assert!(!written);
        assert!(load_kline_cache(dir.path(), "BTCUSDT", TimeFrame::H1, start, today).is_none());

        // closed range: cached and loadable
        let written = save_kline_cache(
            dir.path(),
            "BTCUSDT",
            TimeFrame::H1,
            start,
            done,
            today,
            &candles,
        )
        .unwrap();
        assert!(written);
        let loaded =
            load_kline_cache(dir.path(), "BTCUSDT", TimeFrame::H1, start, done).unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
