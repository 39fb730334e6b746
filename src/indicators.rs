//! Technical indicators over candle series.
//!
//! Every function returns a vector aligned with its input, holding `None`
//! until the indicator has seen enough data.

/// Exponential moving average, α = 2/(window+1), seeded at the first value
pub fn ema(values: &[f64], window: usize) -> Vec<Option<f64>> {
    let alpha = 2.0 / (window as f64 + 1.0);
    smoothed(values, alpha, window)
}

/// Recursive smoothing `s = α·x + (1-α)·s` seeded at `values[0]`,
/// reported from index `min_periods - 1`
fn smoothed(values: &[f64], alpha: f64, min_periods: usize) -> Vec<Option<f64>> {
    let mut out = Vec::with_capacity(values.len());
    let mut state: Option<f64> = None;
    for (i, &x) in values.iter().enumerate() {
        let s = match state {
            None => x,
            Some(prev) => alpha * x + (1.0 - alpha) * prev,
        };
        state = Some(s);
        out.push((min_periods > 0 && i + 1 >= min_periods).then_some(s));
    }
    out
}

/// Relative strength index with Wilder smoothing
pub fn rsi(closes: &[f64], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if window == 0 || closes.len() <= window {
        return out;
    }
    let (gains, losses): (Vec<f64>, Vec<f64>) = closes
        .windows(2)
        .map(|w| {
            let d = w[1] - w[0];
            (d.max(0.0), (-d).max(0.0))
        })
        .unzip();
    let alpha = 1.0 / window as f64;
    let avg_gain = smoothed(&gains, alpha, window);
    let avg_loss = smoothed(&losses, alpha, window);

    // diffs are offset by one from closes
    for (i, (g, l)) in avg_gain.iter().zip(&avg_loss).enumerate() {
        if let (Some(g), Some(l)) = (g, l) {
            out[i + 1] = Some(rsi_value(*g, *l));
        }
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        if avg_gain == 0.0 {
            50.0
        } else {
            100.0
        }
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// MACD line: EMA(fast) − EMA(slow)
pub fn macd(closes: &[f64], fast: usize, slow: usize) -> Vec<Option<f64>> {
    ema(closes, fast)
        .into_iter()
        .zip(ema(closes, slow))
        .map(|(f, s)| Some(f? - s?))
        .collect()
}

/// True range against the previous close; the first bar uses high − low
pub fn true_range(highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<f64> {
    let n = highs.len().min(lows.len()).min(closes.len());
    (0..n)
        .map(|i| {
            let hl = highs[i] - lows[i];
            if i == 0 {
                hl
            } else {
                let prev = closes[i - 1];
                hl.max((highs[i] - prev).abs()).max((lows[i] - prev).abs())
            }
        })
        .collect()
}

/// Average true range: mean of the first `window` TRs, then Wilder smoothing
pub fn atr(highs: &[f64], lows: &[f64], closes: &[f64], window: usize) -> Vec<Option<f64>> {
    let tr = true_range(highs, lows, closes);
    let mut out = vec![None; tr.len()];
    if window == 0 || tr.len() < window {
        return out;
    }
    let mut current = mean(&tr[..window]).unwrap_or(0.0);
    out[window - 1] = Some(current);
    for i in window..tr.len() {
        current = (current * (window as f64 - 1.0) + tr[i]) / window as f64;
        out[i] = Some(current);
    }
    out
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Last `n` entries of a series (all of it when shorter)
pub fn last_n<T: Clone>(series: &[T], n: usize) -> Vec<T> {
    series[series.len().saturating_sub(n)..].to_vec()
}

/// Last value of an indicator series, if defined
pub fn latest(series: &[Option<f64>]) -> Option<f64> {
    series.last().copied().flatten()
}

/// Undefined points become 0.0
pub fn fill_zero(series: &[Option<f64>]) -> Vec<f64> {
    series.iter().map(|v| v.unwrap_or(0.0)).collect()
}
