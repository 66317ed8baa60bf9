//! Incremental-store scenarios: cold download, tail-only refresh, and the
//! union property over overlapping fetches.

mod common;

use common::{store_with_candles, DAY};
use cryptolab::data::{Candle, CandleFrame, SeriesKey};

fn daily(start_day: i64, count: i64) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let ts = (start_day + i) * DAY;
            let close = 40_000.0 + (i as f64 * 0.1).sin() * 800.0;
            Candle {
                ts,
                open: close - 50.0,
                high: close + 400.0,
                low: close - 400.0,
                close,
                volume: 1_000.0,
            }
        })
        .collect()
}

/// First fetch persists 153 daily bars, the follow-up downloads only the
/// 30-bar tail and leaves 183 contiguous rows.
#[tokio::test]
async fn incremental_fetch_downloads_only_the_delta() {
    let (store, client, _dir) = store_with_candles("test", daily(0, 400));

    // 2024-01-01 → 2024-06-01 stand-in: days 0..=152 inclusive = 153 bars
    let first = store
        .fetch_range("test", "BTC/USDT", "1d", 0, Some(152 * DAY))
        .await
        .unwrap();
    assert_eq!(first.height(), 153);
    let calls_after_first = client.fetch_calls();
    assert!(calls_after_first >= 1);

    // Extending to day 182 fetches exactly the 30 new bars
    let second = store
        .fetch_range("test", "BTC/USDT", "1d", 0, Some(182 * DAY))
        .await
        .unwrap();
    assert_eq!(second.height(), 183);
    assert_eq!(client.fetch_calls(), calls_after_first + 1);

    let frame = CandleFrame::from_dataframe(&second).unwrap();
    assert!(
        frame.ts.windows(2).all(|w| w[1] - w[0] == DAY),
        "rows must be contiguous daily bars"
    );
}

#[tokio::test]
async fn identical_refetch_issues_no_further_download() {
    let (store, client, _dir) = store_with_candles("test", daily(0, 200));

    let a = store
        .fetch_range("test", "BTCUSDT", "1d", 10 * DAY, Some(150 * DAY))
        .await
        .unwrap();
    let calls = client.fetch_calls();

    let b = store
        .fetch_range("test", "BTC/USDT", "1d", 10 * DAY, Some(150 * DAY))
        .await
        .unwrap();
    assert_eq!(client.fetch_calls(), calls, "second call must stay local");
    assert_eq!(a.height(), b.height());

    let fa = CandleFrame::from_dataframe(&a).unwrap();
    let fb = CandleFrame::from_dataframe(&b).unwrap();
    assert_eq!(fa.ts, fb.ts);
    assert_eq!(fa.close, fb.close);
}

/// Overlapping fetches in any order leave the same on-disk union a single
/// full fetch would.
#[tokio::test]
async fn overlapping_fetches_equal_single_union() {
    let candles = daily(0, 300);

    let key = SeriesKey::new("test", "BTC/USDT", "1d").unwrap();

    // Piecewise, shuffled windows
    let (piecewise, _c1, _d1) = store_with_candles("test", candles.clone());
    for (since, until) in [(120, 220), (0, 130), (200, 299), (50, 180)] {
        piecewise
            .fetch_range("test", "BTC/USDT", "1d", since * DAY, Some(until * DAY))
            .await
            .unwrap();
    }
    let piecewise_stats = piecewise.series_stats(&key).unwrap().unwrap();

    // One shot
    let (oneshot, _c2, _d2) = store_with_candles("test", candles);
    oneshot
        .fetch_range("test", "BTC/USDT", "1d", 0, Some(299 * DAY))
        .await
        .unwrap();
    let oneshot_stats = oneshot.series_stats(&key).unwrap().unwrap();

    assert_eq!(piecewise_stats.rows, oneshot_stats.rows);
    assert_eq!(piecewise_stats.first_ts, oneshot_stats.first_ts);
    assert_eq!(piecewise_stats.last_ts, oneshot_stats.last_ts);

    let a = piecewise.load_range(&key, 0, 299 * DAY).unwrap();
    let b = oneshot.load_range(&key, 0, 299 * DAY).unwrap();
    let fa = CandleFrame::from_dataframe(&a).unwrap();
    let fb = CandleFrame::from_dataframe(&b).unwrap();
    assert_eq!(fa.ts, fb.ts);
    assert_eq!(fa.close, fb.close);
}

#[tokio::test]
async fn provider_native_symbols_share_one_series_file() {
    let (store, _client, _dir) = store_with_candles("test", daily(0, 50));

    store
        .fetch_range("test", "BTCUSDT", "1d", 0, Some(20 * DAY))
        .await
        .unwrap();
    store
        .fetch_range("test", "BTC/USDT", "1d", 0, Some(40 * DAY))
        .await
        .unwrap();

    let keys = store.list_series();
    assert_eq!(keys.len(), 1, "both spellings must normalize to one key");
    assert_eq!(keys[0].symbol, "BTC/USDT");
    assert_eq!(keys[0].timeframe.as_str(), "1d");
}
