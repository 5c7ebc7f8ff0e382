//! Technical indicators over bar sequences.
//!
//! Every function here is pure and side-effect free: bars in, value out.
//! Too little history is reported as `InsufficientData`, which callers treat
//! as "no signal this tick" rather than a failure.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::models::Bar;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndicatorError {
    #[error("insufficient data: need {needed} bars, got {got}")]
    InsufficientData { needed: usize, got: usize },
}

/// Average true range over the trailing `period` bars: the simple moving
/// average of true ranges for the most recent complete window.
///
/// Needs `period + 1` bars because each true range references the previous
/// close.
pub fn atr(bars: &[Bar], period: usize) -> Result<Decimal, IndicatorError> {
    if bars.len() < period + 1 {
        return Err(IndicatorError::InsufficientData {
            needed: period + 1,
            got: bars.len(),
        });
    }

    let window = &bars[bars.len() - (period + 1)..];
    let mut sum = Decimal::ZERO;
    for pair in window.windows(2) {
        sum += pair[1].true_range(pair[0].close);
    }
    Ok(sum / Decimal::from(period as u64))
}

/// Exponential moving average of closing prices, aligned to the latest bar.
///
/// Smoothing factor k = 2 / (period + 1); seeded with the simple average of
/// the first `period` closes, recurrence applied forward from there.
pub fn ema(bars: &[Bar], period: usize) -> Result<Decimal, IndicatorError> {
    if period == 0 || bars.len() < period + 1 {
        return Err(IndicatorError::InsufficientData {
            needed: period + 1,
            got: bars.len(),
        });
    }

    let k = dec!(2) / Decimal::from(period as u64 + 1);
    let seed: Decimal =
        bars[..period].iter().map(|b| b.close).sum::<Decimal>() / Decimal::from(period as u64);

    let mut value = seed;
    for bar in &bars[period..] {
        value = bar.close * k + value * (Decimal::ONE - k);
    }
    Ok(value)
}

/// Simple moving average of the trailing `period` values.
pub fn sma(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let sum: Decimal = values[values.len() - period..].iter().sum();
    Some(sum / Decimal::from(period as u64))
}

/// Relative strength index series with Wilder smoothing; one value per close
/// beyond the seed window, aligned so the last element matches the latest
/// close.
pub fn rsi_series(closes: &[Decimal], period: usize) -> Vec<Decimal> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let mut gains = Vec::with_capacity(closes.len() - 1);
    let mut losses = Vec::with_capacity(closes.len() - 1);
    for pair in closes.windows(2) {
        let change = pair[1] - pair[0];
        gains.push(change.max(Decimal::ZERO));
        losses.push((-change).max(Decimal::ZERO));
    }

    let p = Decimal::from(period as u64);
    let mut avg_gain: Decimal = gains[..period].iter().sum::<Decimal>() / p;
    let mut avg_loss: Decimal = losses[..period].iter().sum::<Decimal>() / p;

    let mut out = Vec::with_capacity(gains.len() - period + 1);
    out.push(rsi_value(avg_gain, avg_loss));
    for i in period..gains.len() {
        avg_gain = (avg_gain * (p - Decimal::ONE) + gains[i]) / p;
        avg_loss = (avg_loss * (p - Decimal::ONE) + losses[i]) / p;
        out.push(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: Decimal, avg_loss: Decimal) -> Decimal {
    if avg_loss.is_zero() {
        return dec!(100);
    }
    let rs = avg_gain / avg_loss;
    dec!(100) - dec!(100) / (Decimal::ONE + rs)
}

/// Stochastic oscillator: %K over `k_period` highs/lows and %D as the
/// `d_period` moving average of %K. Both series are trimmed to equal length,
/// aligned to the latest bar.
pub fn stoch_kd(bars: &[Bar], k_period: usize, d_period: usize) -> (Vec<Decimal>, Vec<Decimal>) {
    if k_period == 0 || d_period == 0 || bars.len() < k_period {
        return (Vec::new(), Vec::new());
    }

    let mut k_vals = Vec::with_capacity(bars.len() - k_period + 1);
    for i in (k_period - 1)..bars.len() {
        let window = &bars[i + 1 - k_period..=i];
        let high = window.iter().map(|b| b.high).max().unwrap_or(Decimal::ZERO);
        let low = window.iter().map(|b| b.low).min().unwrap_or(Decimal::ZERO);
        let denom = high - low;
        let k = if denom.is_zero() {
            Decimal::ZERO
        } else {
            dec!(100) * (bars[i].close - low) / denom
        };
        k_vals.push(k);
    }

    if k_vals.len() < d_period {
        return (Vec::new(), Vec::new());
    }
    let mut d_vals = Vec::with_capacity(k_vals.len() - d_period + 1);
    for i in (d_period - 1)..k_vals.len() {
        let sum: Decimal = k_vals[i + 1 - d_period..=i].iter().sum();
        d_vals.push(sum / Decimal::from(d_period as u64));
    }

    let k_trimmed = k_vals[k_vals.len() - d_vals.len()..].to_vec();
    (k_trimmed, d_vals)
}

/// Parabolic SAR (Wilder) series, one value per bar. Empty below 5 bars.
pub fn parabolic_sar(bars: &[Bar], af: Decimal, af_max: Decimal) -> Vec<Decimal> {
    let n = bars.len();
    if n < 5 {
        return Vec::new();
    }

    let mut up = bars[1].close >= bars[0].close;
    let mut ep = if up { bars[0].high } else { bars[0].low };
    let mut accel = af;
    let mut sar = Vec::with_capacity(n);
    sar.push(if up { bars[0].low } else { bars[0].high });

    for i in 1..n {
        let prev = *sar.last().unwrap_or(&Decimal::ZERO);
        let mut s = prev + accel * (ep - prev);
        if up {
            s = s.min(bars[i - 1].low).min(bars[i].low);
            if bars[i].high > ep {
                ep = bars[i].high;
                accel = af_max.min(accel + af);
            }
            if bars[i].low < s {
                up = false;
                s = bars[i - 1].high.max(bars[i].high);
                ep = bars[i].low;
                accel = af;
            }
        } else {
            s = s.max(bars[i - 1].high).max(bars[i].high);
            if bars[i].low < ep {
                ep = bars[i].low;
                accel = af_max.min(accel + af);
            }
            if bars[i].high > s {
                up = true;
                s = bars[i - 1].low.min(bars[i].low);
                ep = bars[i].high;
                accel = af;
            }
        }
        sar.push(s);
    }
    sar
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bar(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open,
            high,
            low,
            close,
        }
    }

    fn flat_bars(price: Decimal, count: usize) -> Vec<Bar> {
        (0..count).map(|_| bar(price, price, price, price)).collect()
    }

    fn bars_from_closes(closes: &[Decimal]) -> Vec<Bar> {
        closes.iter().map(|&c| bar(c, c, c, c)).collect()
    }

    #[test]
    fn atr_of_flat_series_is_zero() {
        let bars = flat_bars(dec!(100), 20);
        assert_eq!(atr(&bars, 14).unwrap(), dec!(0));
    }

    #[test]
    fn atr_requires_period_plus_one_bars() {
        let bars = flat_bars(dec!(100), 14);
        assert_eq!(
            atr(&bars, 14),
            Err(IndicatorError::InsufficientData { needed: 15, got: 14 })
        );
        let bars = flat_bars(dec!(100), 15);
        assert!(atr(&bars, 14).is_ok());
    }

    #[test]
    fn atr_averages_true_ranges() {
        // Three bars after the seed close, each with a 2-point range.
        let bars = vec![
            bar(dec!(100), dec!(100), dec!(100), dec!(100)),
            bar(dec!(100), dec!(101), dec!(99), dec!(100)),
            bar(dec!(100), dec!(101), dec!(99), dec!(100)),
            bar(dec!(100), dec!(101), dec!(99), dec!(100)),
        ];
        assert_eq!(atr(&bars, 3).unwrap(), dec!(2));
    }

    #[test]
    fn atr_counts_gaps_via_previous_close() {
        // Bar gaps up: high-low is 1 but distance from previous close is 5.
        let bars = vec![
            bar(dec!(100), dec!(100), dec!(100), dec!(100)),
            bar(dec!(105), dec!(105), dec!(104), dec!(105)),
        ];
        assert_eq!(atr(&bars, 1).unwrap(), dec!(5));
    }

    #[test]
    fn ema_of_constant_series_is_the_constant() {
        // period 3 gives k = 0.5, exact in decimal arithmetic
        let bars = flat_bars(dec!(123.45), 10);
        assert_eq!(ema(&bars, 3).unwrap(), dec!(123.45));
    }

    #[test]
    fn ema_requires_period_plus_one_bars() {
        let bars = flat_bars(dec!(100), 20);
        assert_eq!(
            ema(&bars, 20),
            Err(IndicatorError::InsufficientData { needed: 21, got: 20 })
        );
    }

    #[test]
    fn ema_moves_toward_recent_closes() {
        // Seed = avg(1,2,3) = 2; one step toward 10 with k = 0.5 -> 6
        let bars = bars_from_closes(&[dec!(1), dec!(2), dec!(3), dec!(10)]);
        assert_eq!(ema(&bars, 3).unwrap(), dec!(6));
    }

    #[test]
    fn sma_of_trailing_window() {
        let values = [dec!(1), dec!(2), dec!(3), dec!(4)];
        assert_eq!(sma(&values, 2), Some(dec!(3.5)));
        assert_eq!(sma(&values, 4), Some(dec!(2.5)));
        assert_eq!(sma(&values, 5), None);
    }

    #[test]
    fn rsi_is_100_on_straight_gains() {
        let closes: Vec<Decimal> = (1..=20).map(Decimal::from).collect();
        let rsis = rsi_series(&closes, 14);
        assert!(!rsis.is_empty());
        assert_eq!(*rsis.last().unwrap(), dec!(100));
    }

    #[test]
    fn rsi_is_balanced_on_alternating_moves() {
        // Equal-size up and down moves keep RSI pinned at 50.
        let mut closes = vec![dec!(100)];
        for i in 0..20 {
            let last = *closes.last().unwrap();
            closes.push(if i % 2 == 0 { last + dec!(1) } else { last - dec!(1) });
        }
        let rsis = rsi_series(&closes, 14);
        let last = *rsis.last().unwrap();
        assert!(last > dec!(45) && last < dec!(55), "rsi {last}");
    }

    #[test]
    fn rsi_needs_period_plus_one_closes() {
        let closes: Vec<Decimal> = (1..=14).map(Decimal::from).collect();
        assert!(rsi_series(&closes, 14).is_empty());
    }

    #[test]
    fn stochastic_extremes() {
        // Close at the high of the window -> %K = 100
        let mut bars = Vec::new();
        for i in 0..10u32 {
            let c = Decimal::from(100 + i);
            bars.push(bar(c, c + dec!(0.5), c - dec!(0.5), c + dec!(0.5)));
        }
        let (k, d) = stoch_kd(&bars, 5, 3);
        assert_eq!(k.len(), d.len());
        assert_eq!(*k.last().unwrap(), dec!(100));

        // Flat window -> denominator zero -> %K = 0 by convention
        let bars = flat_bars(dec!(100), 10);
        let (k, _) = stoch_kd(&bars, 5, 3);
        assert_eq!(*k.last().unwrap(), dec!(0));
    }

    #[test]
    fn parabolic_sar_tracks_below_an_uptrend() {
        let mut bars = Vec::new();
        for i in 0..30u32 {
            let c = Decimal::from(100 + i);
            bars.push(bar(c, c + dec!(1), c - dec!(1), c));
        }
        let sar = parabolic_sar(&bars, dec!(0.02), dec!(0.2));
        assert_eq!(sar.len(), bars.len());
        // In a steady uptrend the SAR stays below price.
        assert!(*sar.last().unwrap() < bars.last().unwrap().close);
    }

    #[test]
    fn parabolic_sar_empty_below_five_bars() {
        let bars = flat_bars(dec!(100), 4);
        assert!(parabolic_sar(&bars, dec!(0.02), dec!(0.2)).is_empty());
    }
}
