//! Long-only spot execution simulator.
//!
//! A single forward pass over the bar series drives a FLAT/LONG state
//! machine. While LONG, exits are evaluated in a fixed priority per bar
//! (protective levels, exit signal, end of data), so results never depend
//! on evaluation order. In precise mode the stop/target check walks the bar's
//! intraday sub-candles chronologically and the first touch wins. Fast mode
//! only sees the bar's high/low: when both levels are touched in one bar it
//! credits the target, so tight stops read optimistic there. That bias is a
//! documented artifact, resolved by precise mode, never corrected silently.

use crate::data::CandleFrame;
use crate::error::CoreError;

use super::types::{
    EquityPoint, ExecutionMode, ExitReason, FillMode, SimOptions, Trade,
};

struct OpenPosition {
    entry_ts: i64,
    entry_price: f64,
    qty: f64,
    /// Cash spent to open, entry fee included.
    cost: f64,
    entry_bar: usize,
}

/// Outcome of the intra-bar stop/target check.
struct Touch {
    price: f64,
    ts: i64,
    reason: ExitReason,
}

pub fn simulate(
    frame: &CandleFrame,
    entry: &[bool],
    exit: &[bool],
    warmup: usize,
    intraday: Option<&CandleFrame>,
    bar_ms: i64,
    opts: &SimOptions,
) -> Result<(Vec<Trade>, Vec<EquityPoint>), CoreError> {
    let n = frame.len();
    if entry.len() != n || exit.len() != n {
        return Err(CoreError::Internal(anyhow::anyhow!(
            "signal vectors ({}, {}) do not match frame length {n}",
            entry.len(),
            exit.len()
        )));
    }

    let mut cash = opts.cash;
    let mut position: Option<OpenPosition> = None;
    let mut pending_entry = false;
    let mut trades: Vec<Trade> = Vec::new();
    let mut equity: Vec<EquityPoint> = Vec::with_capacity(n);

    for i in 0..n {
        check_bar_values(frame, i)?;

        // A next-open fill decided on the previous bar executes first; the
        // new position is exposed to this bar's stop/target range.
        if pending_entry && position.is_none() {
            position = Some(open_position(&mut cash, frame.open[i], frame.ts[i], i, opts));
        }
        pending_entry = false;

        // Exit priority 1 & 2: protective levels inside the bar. Skip the
        // fill bar itself for close fills — the position did not exist
        // during that bar's range.
        let touch = position.as_ref().and_then(|pos| {
            let exposed = pos.entry_bar < i
                || (pos.entry_bar == i && opts.fill_mode == FillMode::NextOpen);
            if exposed {
                protective_touch(frame, i, intraday, bar_ms, pos, opts)
            } else {
                None
            }
        });
        if let Some(touch) = touch {
            if let Some(pos) = position.take() {
                trades.push(close_position(
                    &mut cash,
                    pos,
                    touch.price,
                    touch.ts,
                    i,
                    touch.reason,
                    opts,
                ));
            }
        }

        // Exit priority 3: the exit signal at this bar's close.
        if exit[i] {
            if let Some(pos) = position.take() {
                let fill = frame.close[i] * (1.0 - opts.slippage);
                trades.push(close_position(
                    &mut cash,
                    pos,
                    fill,
                    frame.ts[i],
                    i,
                    ExitReason::SignalExit,
                    opts,
                ));
            }
        }

        // Entries; never on the final bar, which could only produce a
        // zero-length wash trade.
        if position.is_none() && entry[i] && i >= warmup && i + 1 < n {
            match opts.fill_mode {
                FillMode::Close => {
                    let fill = frame.close[i] * (1.0 + opts.slippage);
                    position = Some(open_position(&mut cash, fill, frame.ts[i], i, opts));
                }
                FillMode::NextOpen => pending_entry = true,
            }
        }

        // Exit priority 4: end of data forces a close at the last bar.
        if i + 1 == n {
            if let Some(pos) = position.take() {
                let fill = frame.close[i] * (1.0 - opts.slippage);
                trades.push(close_position(
                    &mut cash,
                    pos,
                    fill,
                    frame.ts[i],
                    i,
                    ExitReason::EndOfData,
                    opts,
                ));
            }
        }

        let position_value = position
            .as_ref()
            .map_or(0.0, |pos| pos.qty * frame.close[i]);
        equity.push(EquityPoint {
            ts: frame.ts[i],
            cash,
            position_value,
            equity: cash + position_value,
        });
    }

    Ok((trades, equity))
}

fn check_bar_values(frame: &CandleFrame, i: usize) -> Result<(), CoreError> {
    if frame.open[i].is_nan()
        || frame.high[i].is_nan()
        || frame.low[i].is_nan()
        || frame.close[i].is_nan()
    {
        return Err(CoreError::Simulation {
            bar: i,
            message: "NaN in OHLC columns".into(),
        });
    }
    Ok(())
}

fn open_position(
    cash: &mut f64,
    fill_price: f64,
    ts: i64,
    bar: usize,
    opts: &SimOptions,
) -> OpenPosition {
    let budget = *cash * opts.position_fraction;
    // Size so the notional plus entry fee consumes exactly the budget.
    let qty = budget / (fill_price * (1.0 + opts.fee_rate));
    let notional = qty * fill_price;
    let fee = notional * opts.fee_rate;
    *cash -= notional + fee;
    OpenPosition {
        entry_ts: ts,
        entry_price: fill_price,
        qty,
        cost: notional + fee,
        entry_bar: bar,
    }
}

fn close_position(
    cash: &mut f64,
    pos: OpenPosition,
    fill_price: f64,
    ts: i64,
    bar: usize,
    reason: ExitReason,
    opts: &SimOptions,
) -> Trade {
    let notional = pos.qty * fill_price;
    let fee = notional * opts.fee_rate;
    let proceeds = notional - fee;
    *cash += proceeds;
    let pnl = proceeds - pos.cost;
    Trade {
        entry_ts: pos.entry_ts,
        entry_price: pos.entry_price,
        exit_ts: ts,
        exit_price: fill_price,
        qty: pos.qty,
        pnl,
        pnl_pct: pnl / pos.cost,
        exit_reason: reason,
        held_bars: bar - pos.entry_bar,
    }
}

/// Stop/target evaluation for one bar while LONG. Returns the exit fill if
/// a protective level was touched.
fn protective_touch(
    frame: &CandleFrame,
    i: usize,
    intraday: Option<&CandleFrame>,
    bar_ms: i64,
    pos: &OpenPosition,
    opts: &SimOptions,
) -> Option<Touch> {
    let stop_price = opts.stop_loss.map(|s| pos.entry_price * (1.0 - s));
    let take_price = opts.take_profit.map(|t| pos.entry_price * (1.0 + t));
    if stop_price.is_none() && take_price.is_none() {
        return None;
    }

    if opts.mode == ExecutionMode::Precise {
        if let Some(fine) = intraday {
            let sub = fine.range(frame.ts[i], frame.ts[i] + bar_ms);
            if !sub.is_empty() {
                for j in sub {
                    if let Some(stop) = stop_price {
                        if fine.low[j] <= stop {
                            return Some(Touch {
                                price: stop,
                                ts: fine.ts[j],
                                reason: ExitReason::StopLoss,
                            });
                        }
                    }
                    if let Some(take) = take_price {
                        if fine.high[j] >= take {
                            return Some(Touch {
                                price: take,
                                ts: fine.ts[j],
                                reason: ExitReason::TakeProfit,
                            });
                        }
                    }
                }
                return None;
            }
            // No sub-candles for this bar: degrade to the bar-level check.
        }
    }

    // Bar-level resolution: the favorable order is assumed when both levels
    // sit inside the bar's range.
    if let Some(take) = take_price {
        if frame.high[i] >= take {
            return Some(Touch {
                price: take,
                ts: frame.ts[i],
                reason: ExitReason::TakeProfit,
            });
        }
    }
    if let Some(stop) = stop_price {
        if frame.low[i] <= stop {
            return Some(Touch {
                price: stop,
                ts: frame.ts[i],
                reason: ExitReason::StopLoss,
            });
        }
    }
    None
}
