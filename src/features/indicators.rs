//! Technical indicators
//!
//! Every function is causal: the value at row `t` only reads rows `0..=t`.
//! Warm-up rows are `NaN`, as are undefined ratios such as 0/0. Callers drop
//! those rows once all indicators have been assembled.

use crate::data::Candle;

/// Rolling mean over `period` rows; `NaN` until the window is full
pub fn rolling_mean(data: &[f64], period: usize) -> Vec<f64> {
    rolling(data, period, |window| {
        window.iter().sum::<f64>() / window.len() as f64
    })
}

/// Rolling sample standard deviation (n - 1 denominator)
pub fn rolling_std(data: &[f64], period: usize) -> Vec<f64> {
    rolling(data, period, |window| {
        let n = window.len() as f64;
        if n < 2.0 {
            return f64::NAN;
        }
        let mean = window.iter().sum::<f64>() / n;
        let var = window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        var.sqrt()
    })
}

pub fn rolling_min(data: &[f64], period: usize) -> Vec<f64> {
    rolling(data, period, |window| {
        window.iter().cloned().fold(f64::INFINITY, f64::min)
    })
}

pub fn rolling_max(data: &[f64], period: usize) -> Vec<f64> {
    rolling(data, period, |window| {
        window.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    })
}

fn rolling<F>(data: &[f64], period: usize, f: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    if period == 0 {
        return vec![f64::NAN; data.len()];
    }
    (0..data.len())
        .map(|i| {
            if i + 1 < period {
                return f64::NAN;
            }
            let window = &data[i + 1 - period..=i];
            if window.iter().any(|v| v.is_nan()) {
                f64::NAN
            } else {
                f(window)
            }
        })
        .collect()
}

/// Simple Moving Average
pub fn sma(data: &[f64], period: usize) -> Vec<f64> {
    rolling_mean(data, period)
}

/// Exponential Moving Average, seeded with the first value (alpha = 2 / (n + 1))
pub fn ema(data: &[f64], period: usize) -> Vec<f64> {
    if data.is_empty() {
        return vec![];
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut result = Vec::with_capacity(data.len());
    result.push(data[0]);

    for i in 1..data.len() {
        let prev = result[i - 1];
        result.push((data[i] - prev) * multiplier + prev);
    }

    result
}

/// Relative Strength Index from rolling mean gains and losses.
///
/// The first row has no change and counts as zero gain and zero loss, so the
/// first defined value sits at row `period - 1`.
pub fn rsi(data: &[f64], period: usize) -> Vec<f64> {
    let mut gains = vec![0.0; data.len()];
    let mut losses = vec![0.0; data.len()];
    for i in 1..data.len() {
        let change = data[i] - data[i - 1];
        if change > 0.0 {
            gains[i] = change;
        } else if change < 0.0 {
            losses[i] = -change;
        }
    }

    let avg_gain = rolling_mean(&gains, period);
    let avg_loss = rolling_mean(&losses, period);

    avg_gain
        .iter()
        .zip(avg_loss.iter())
        .map(|(&g, &l)| {
            if g.is_nan() || l.is_nan() {
                f64::NAN
            } else if l == 0.0 {
                if g == 0.0 {
                    f64::NAN
                } else {
                    100.0
                }
            } else {
                100.0 - 100.0 / (1.0 + g / l)
            }
        })
        .collect()
}

/// Moving Average Convergence Divergence
pub struct Macd {
    pub macd_line: Vec<f64>,
    pub signal_line: Vec<f64>,
    pub histogram: Vec<f64>,
}

pub fn macd(data: &[f64], fast: usize, slow: usize, signal: usize) -> Macd {
    let ema_fast = ema(data, fast);
    let ema_slow = ema(data, slow);

    let macd_line: Vec<f64> = ema_fast
        .iter()
        .zip(ema_slow.iter())
        .map(|(&f, &s)| f - s)
        .collect();

    let signal_line = ema(&macd_line, signal);

    let histogram: Vec<f64> = macd_line
        .iter()
        .zip(signal_line.iter())
        .map(|(&m, &s)| m - s)
        .collect();

    Macd {
        macd_line,
        signal_line,
        histogram,
    }
}

/// Bollinger Bands
pub struct BollingerBands {
    pub upper: Vec<f64>,
    pub middle: Vec<f64>,
    pub lower: Vec<f64>,
}

impl BollingerBands {
    pub fn width(&self) -> Vec<f64> {
        self.upper
            .iter()
            .zip(self.lower.iter())
            .map(|(u, l)| u - l)
            .collect()
    }
}

pub fn bollinger_bands(data: &[f64], period: usize, num_std: f64) -> BollingerBands {
    let middle = sma(data, period);
    let std = rolling_std(data, period);

    let upper = middle
        .iter()
        .zip(std.iter())
        .map(|(m, s)| m + num_std * s)
        .collect();
    let lower = middle
        .iter()
        .zip(std.iter())
        .map(|(m, s)| m - num_std * s)
        .collect();

    BollingerBands {
        upper,
        middle,
        lower,
    }
}

/// True range; the first row has no previous close and uses high - low
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    (0..high.len())
        .map(|i| {
            let hl = high[i] - low[i];
            if i == 0 {
                hl
            } else {
                let hc = (high[i] - close[i - 1]).abs();
                let lc = (low[i] - close[i - 1]).abs();
                hl.max(hc).max(lc)
            }
        })
        .collect()
}

/// Average True Range (simple rolling mean of the true range)
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    rolling_mean(&true_range(high, low, close), period)
}

/// On-Balance Volume, starting at zero
pub fn obv(close: &[f64], volume: &[f64]) -> Vec<f64> {
    let mut result = Vec::with_capacity(close.len());
    let mut total = 0.0;

    for i in 0..close.len() {
        if i > 0 {
            if close[i] > close[i - 1] {
                total += volume[i];
            } else if close[i] < close[i - 1] {
                total -= volume[i];
            }
        }
        result.push(total);
    }

    result
}

/// Stochastic oscillator: smoothed %K and %D
pub struct Stochastic {
    pub k: Vec<f64>,
    pub d: Vec<f64>,
}

pub fn stochastic(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    period: usize,
    smooth_k: usize,
    smooth_d: usize,
) -> Stochastic {
    let lowest = rolling_min(low, period);
    let highest = rolling_max(high, period);

    let raw_k: Vec<f64> = (0..close.len())
        .map(|i| 100.0 * (close[i] - lowest[i]) / (highest[i] - lowest[i]))
        .collect();

    let k = rolling_mean(&raw_k, smooth_k);
    let d = rolling_mean(&k, smooth_d);

    Stochastic { k, d }
}

/// Price difference over `period` rows
pub fn momentum(data: &[f64], period: usize) -> Vec<f64> {
    (0..data.len())
        .map(|i| {
            if i < period {
                f64::NAN
            } else {
                data[i] - data[i - period]
            }
        })
        .collect()
}

/// Fractional change over `period` rows
pub fn pct_change(data: &[f64], period: usize) -> Vec<f64> {
    (0..data.len())
        .map(|i| {
            if i < period {
                f64::NAN
            } else {
                (data[i] - data[i - period]) / data[i - period]
            }
        })
        .collect()
}

/// Rate of change in percent
pub fn roc(data: &[f64], period: usize) -> Vec<f64> {
    pct_change(data, period).iter().map(|v| v * 100.0).collect()
}

/// Williams %R, bounded to [-100, 0]
pub fn williams_r(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<f64> {
    let highest = rolling_max(high, period);
    let lowest = rolling_min(low, period);

    (0..close.len())
        .map(|i| -100.0 * (highest[i] - close[i]) / (highest[i] - lowest[i]))
        .collect()
}

fn ratio(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b.iter()).map(|(x, y)| x / y).collect()
}

/// A named indicator series
pub type Series = (String, Vec<f64>);

/// Computes the full indicator catalogue for a candle sequence.
///
/// Every returned series has the same length as the input. Column names are
/// the ones accepted by `DataConfig::feature_columns`.
pub fn compute_all(candles: &[Candle]) -> Vec<Series> {
    let open: Vec<f64> = candles.iter().map(|c| c.open).collect();
    let high: Vec<f64> = candles.iter().map(|c| c.high).collect();
    let low: Vec<f64> = candles.iter().map(|c| c.low).collect();
    let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volume: Vec<f64> = candles.iter().map(|c| c.volume).collect();

    let mut out: Vec<Series> = Vec::new();
    let mut push = |name: &str, values: Vec<f64>| out.push((name.to_string(), values));

    push("rsi", rsi(&close, 14));

    let m = macd(&close, 12, 26, 9);
    push("macd", m.macd_line);
    push("macd_signal", m.signal_line);
    push("macd_hist", m.histogram);

    let bb = bollinger_bands(&close, 20, 2.0);
    push("bb_width", bb.width());
    push("bb_upper", bb.upper);
    push("bb_middle", bb.middle);
    push("bb_lower", bb.lower);

    push("ema_12", ema(&close, 12));
    push("ema_26", ema(&close, 26));
    push("ema_50", ema(&close, 50));
    push("sma_20", sma(&close, 20));
    push("sma_50", sma(&close, 50));

    push("atr", atr(&high, &low, &close, 14));
    push("obv", obv(&close, &volume));

    let stoch = stochastic(&high, &low, &close, 14, 3, 3);
    push("stoch_k", stoch.k);
    push("stoch_d", stoch.d);

    push("momentum", momentum(&close, 10));
    push("roc", roc(&close, 12));
    push("williams_r", williams_r(&high, &low, &close, 14));

    push("close_open_ratio", ratio(&close, &open));
    push("high_low_ratio", ratio(&high, &low));
    push("price_change", pct_change(&close, 1));
    push("volume_change", pct_change(&volume, 1));

    // Direction-classifier features
    push("sma_7", sma(&close, 7));
    push("sma_25", sma(&close, 25));
    push("rsi_14", rsi(&close, 14));
    push("roc_5", pct_change(&close, 5));
    push("volatility", rolling_std(&close, 7));

    out
}
