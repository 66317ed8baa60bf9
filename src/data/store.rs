//! Incremental OHLCV store.
//!
//! One parquet file per `(exchange, symbol, timeframe)` under
//! `<root>/<exchange>/<symbol_normalized>/<tf>.parquet`. A fetch downloads
//! only the delta the file does not already cover, merges it in (dedup on
//! `ts`, sorted ascending), and rewrites the file atomically via a temp file
//! beside the original. Downloads land in a staging buffer first; the
//! per-key lock is held only for the merge and rename, never across network
//! I/O.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::DashMap;
use polars::prelude::*;

use super::exchange::ExchangeClient;
use super::{candles_to_dataframe, Candle, SeriesKey, TS_COL};
use crate::config::CoreConfig;
use crate::error::CoreError;

/// Bars fetched per staging chunk before an incremental save. Keeps an
/// interrupted download from losing everything already transferred.
const CHUNK_BARS: i64 = 1000;

#[derive(Debug, Clone)]
pub struct SeriesStats {
    pub rows: usize,
    pub first_ts: i64,
    pub last_ts: i64,
}

pub struct OhlcvStore {
    root: PathBuf,
    clients: DashMap<String, Arc<dyn ExchangeClient>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl OhlcvStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            clients: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(CoreConfig::from_env().data_root)
    }

    /// Register an upstream client; keyed by `client.name()`.
    pub fn register_client(&self, client: Arc<dyn ExchangeClient>) {
        self.clients.insert(client.name().to_lowercase(), client);
    }

    pub fn with_client(root: PathBuf, client: Arc<dyn ExchangeClient>) -> Self {
        let store = Self::new(root);
        store.register_client(client);
        store
    }

    fn client_for(&self, exchange: &str) -> Result<Arc<dyn ExchangeClient>, CoreError> {
        self.clients
            .get(exchange)
            .map(|c| Arc::clone(c.value()))
            .ok_or_else(|| CoreError::Download {
                exchange: exchange.to_string(),
                symbol: String::new(),
                message: format!("no exchange client registered for `{exchange}`"),
                last_complete_ts: None,
            })
    }

    fn series_path(&self, key: &SeriesKey) -> PathBuf {
        self.root
            .join(&key.exchange)
            .join(key.symbol_dir())
            .join(format!("{}.parquet", key.timeframe))
    }

    fn key_lock(&self, key: &SeriesKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // -- on-disk helpers ----------------------------------------------------

    fn read_series(path: &PathBuf) -> Result<Option<DataFrame>, CoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let path_str = path.to_string_lossy().to_string();
        let df = LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default())?
            .collect()?;
        Ok(Some(df))
    }

    /// Row count and ts bounds without materializing the data columns.
    fn scan_stats(path: &PathBuf) -> Result<Option<SeriesStats>, CoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let path_str = path.to_string_lossy().to_string();
        let df = LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default())?
            .select([
                col(TS_COL).min().alias("first_ts"),
                col(TS_COL).max().alias("last_ts"),
                col(TS_COL).count().alias("rows"),
            ])
            .collect()?;
        let first = df.column("first_ts")?.i64()?.get(0);
        let last = df.column("last_ts")?.i64()?.get(0);
        let rows = df.column("rows")?.u32()?.get(0).unwrap_or(0) as usize;
        match (first, last) {
            (Some(first_ts), Some(last_ts)) if rows > 0 => Ok(Some(SeriesStats {
                rows,
                first_ts,
                last_ts,
            })),
            _ => Ok(None),
        }
    }

    fn save_atomic(path: &PathBuf, df: &mut DataFrame) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write to a temp file then rename so readers never see a torn file.
        let tmp_path = path.with_extension("parquet.tmp");
        let file = std::fs::File::create(&tmp_path)?;
        ParquetWriter::new(file).finish(df)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Merge freshly-downloaded candles into the series file: union, dedup
    /// on `ts` keeping the newer row, sort ascending, atomic rewrite.
    fn merge_and_save(&self, key: &SeriesKey, candles: &[Candle]) -> Result<(), CoreError> {
        if candles.is_empty() {
            return Ok(());
        }
        let path = self.series_path(key);
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let new_df = candles_to_dataframe(candles)?;
        let merged = if let Some(existing) = Self::read_series(&path)? {
            concat(
                [existing.lazy(), new_df.lazy()],
                UnionArgs {
                    rechunk: true,
                    to_supertypes: true,
                    diagonal: true,
                    ..Default::default()
                },
            )?
            .collect()?
        } else {
            new_df
        };

        let subset: Vec<String> = vec![TS_COL.to_string()];
        let deduped =
            merged.unique::<String, String>(Some(&subset), UniqueKeepStrategy::Last, None)?;
        let mut sorted = deduped
            .lazy()
            .sort([TS_COL], SortMultipleOptions::default())
            .collect()?;

        Self::save_atomic(&path, &mut sorted)?;
        tracing::debug!(key = %key, rows = sorted.height(), "series file rewritten");
        Ok(())
    }

    // -- download -----------------------------------------------------------

    /// Download `[start, end_exclusive)` in staging chunks, persisting after
    /// each chunk so an interruption keeps everything fetched so far.
    async fn download_window(
        &self,
        client: &Arc<dyn ExchangeClient>,
        key: &SeriesKey,
        start: i64,
        end_exclusive: i64,
    ) -> Result<usize, CoreError> {
        let bar = key.timeframe.duration_ms();
        let chunk_span = CHUNK_BARS * bar;
        let native = key.native_symbol();
        let mut cursor = start;
        let mut fetched = 0usize;

        while cursor < end_exclusive {
            let chunk_end = (cursor + chunk_span).min(end_exclusive);
            let candles = client
                .fetch_klines(&native, key.timeframe, cursor, chunk_end)
                .await
                .map_err(|e| self.classify_download_error(key, e))?;
            fetched += candles.len();
            self.merge_and_save(key, &candles)?;
            cursor = chunk_end;
        }

        if fetched > 0 {
            tracing::info!(key = %key, rows = fetched, "downloaded candles");
        }
        Ok(fetched)
    }

    /// Attach the last contiguous timestamp to download failures so callers
    /// know how far the local store reaches.
    fn classify_download_error(&self, key: &SeriesKey, err: CoreError) -> CoreError {
        match err {
            CoreError::Download {
                exchange,
                symbol,
                message,
                ..
            } => {
                let last = Self::scan_stats(&self.series_path(key))
                    .ok()
                    .flatten()
                    .map(|s| s.last_ts);
                CoreError::Download {
                    exchange,
                    symbol,
                    message,
                    last_complete_ts: last,
                }
            }
            other => other,
        }
    }

    // -- public API ---------------------------------------------------------

    /// Serve the candle series for `[since_ms, until_ms]` (inclusive bounds,
    /// matching bar-open timestamps), downloading only what the local file
    /// does not already cover.
    ///
    /// Guarantees:
    /// - the on-disk file is the union of every successful fetch so far,
    ///   `ts` unique and ascending;
    /// - repeating a call issues no network I/O beyond the tail delta.
    pub async fn fetch_range(
        &self,
        exchange: &str,
        symbol: &str,
        timeframe: &str,
        since_ms: i64,
        until_ms: Option<i64>,
    ) -> Result<DataFrame, CoreError> {
        let key = SeriesKey::new(exchange, symbol, timeframe)?;
        let client = self.client_for(&key.exchange)?;
        let bar = key.timeframe.duration_ms();

        let now = Utc::now().timestamp_millis();
        let until = until_ms.unwrap_or(now).min(now);
        let since = since_ms.max(client.inception_ms());
        let path = self.series_path(&key);

        match Self::scan_stats(&path)? {
            None => {
                // Cold start: download the requested window outright.
                self.download_window(&client, &key, since, until + bar)
                    .await?;
            }
            Some(stats) => {
                // Head backfill for requests reaching before the cached range.
                if since < stats.first_ts {
                    self.download_window(&client, &key, since, stats.first_ts)
                        .await?;
                }
                // Tail refresh past the newest cached bar.
                if stats.last_ts + bar <= until {
                    self.download_window(&client, &key, stats.last_ts + bar, until + bar)
                        .await?;
                }
            }
        }

        self.load_range(&key, since, until)
    }

    /// Serve a slice from the local file only — no network.
    pub fn load_range(
        &self,
        key: &SeriesKey,
        since_ms: i64,
        until_ms: i64,
    ) -> Result<DataFrame, CoreError> {
        let path = self.series_path(key);
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let Some(df) = Self::read_series(&path)? else {
            return Ok(DataFrame::empty());
        };
        let sliced = df
            .lazy()
            .filter(
                col(TS_COL)
                    .gt_eq(lit(since_ms))
                    .and(col(TS_COL).lt_eq(lit(until_ms))),
            )
            .collect()?;
        Ok(sliced)
    }

    /// Row count and ts bounds for a cached series, if present.
    pub fn series_stats(&self, key: &SeriesKey) -> Result<Option<SeriesStats>, CoreError> {
        Self::scan_stats(&self.series_path(key))
    }

    /// Enumerate every `(exchange, symbol, timeframe)` with a cached file.
    pub fn list_series(&self) -> Vec<SeriesKey> {
        let mut keys = Vec::new();
        let Ok(exchanges) = std::fs::read_dir(&self.root) else {
            return keys;
        };
        for exchange in exchanges.flatten() {
            let exchange_name = exchange.file_name().to_string_lossy().to_string();
            let Ok(symbols) = std::fs::read_dir(exchange.path()) else {
                continue;
            };
            for symbol in symbols.flatten() {
                let symbol_name = symbol
                    .file_name()
                    .to_string_lossy()
                    .replace('_', "/");
                let Ok(files) = std::fs::read_dir(symbol.path()) else {
                    continue;
                };
                for file in files.flatten() {
                    let path = file.path();
                    if path.extension().is_none_or(|e| e != "parquet") {
                        continue;
                    }
                    let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string())
                    else {
                        continue;
                    };
                    if let Ok(key) = SeriesKey::new(&exchange_name, &symbol_name, &stem) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort_by_key(SeriesKey::to_string);
        keys
    }
}
