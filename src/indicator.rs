//! Rolling indicators over aligned series.
//!
//! Every function takes and returns one value per bar. `None` marks bars where
//! the value is undefined (warm-up, or an undefined input inside the window).

use statrs::statistics::Statistics;

pub type Series = Vec<Option<f64>>;

pub fn lift(x: &[f64]) -> Series {
    x.iter().map(|v| Some(*v)).collect()
}

/// Values of the `w` bars ending at `i`, or `None` if any is undefined.
fn window(x: &[Option<f64>], i: usize, w: usize) -> Option<Vec<f64>> {
    if w == 0 || i + 1 < w {
        return None;
    }
    x[i + 1 - w..=i].iter().copied().collect()
}

pub fn sma(x: &[Option<f64>], w: usize) -> Series {
    (0..x.len())
        .map(|i| window(x, i, w).map(|s| s.iter().sum::<f64>() / w as f64))
        .collect()
}

/// EMA seeded with the SMA of the first `w` defined values. An undefined
/// input after seeding resets the average.
pub fn ema(x: &[Option<f64>], w: usize) -> Series {
    let mut out = vec![None; x.len()];
    if w == 0 {
        return out;
    }
    let k = 2.0 / (w as f64 + 1.0);
    let mut prev: Option<f64> = None;
    let mut seed: Vec<f64> = Vec::with_capacity(w);
    for (i, v) in x.iter().enumerate() {
        match (v, prev) {
            (Some(v), Some(p)) => {
                let e = (v - p) * k + p;
                prev = Some(e);
                out[i] = prev;
            }
            (Some(v), None) => {
                seed.push(*v);
                if seed.len() == w {
                    prev = Some(seed.iter().sum::<f64>() / w as f64);
                    out[i] = prev;
                    seed.clear();
                }
            }
            (None, _) => {
                prev = None;
                seed.clear();
            }
        }
    }
    out
}

/// Wilder RSI in `[0, 100]`.
pub fn rsi(x: &[Option<f64>], w: usize) -> Series {
    let mut out = vec![None; x.len()];
    if w == 0 || x.len() <= w {
        return out;
    }
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    let mut seeded = false;
    let mut n = 0usize;
    for i in 1..x.len() {
        let (Some(cur), Some(prev)) = (x[i], x[i - 1]) else {
            seeded = false;
            n = 0;
            avg_gain = 0.0;
            avg_loss = 0.0;
            continue;
        };
        let change = cur - prev;
        let gain = change.max(0.0);
        let loss = (-change).max(0.0);
        if seeded {
            avg_gain = (avg_gain * (w as f64 - 1.0) + gain) / w as f64;
            avg_loss = (avg_loss * (w as f64 - 1.0) + loss) / w as f64;
        } else {
            avg_gain += gain;
            avg_loss += loss;
            n += 1;
            if n < w {
                continue;
            }
            avg_gain /= w as f64;
            avg_loss /= w as f64;
            seeded = true;
        }
        out[i] = Some(if avg_loss == 0.0 {
            if avg_gain == 0.0 { 50.0 } else { 100.0 }
        } else {
            100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
        });
    }
    out
}

/// Rate of change over `w` bars, as a fraction.
pub fn roc(x: &[Option<f64>], w: usize) -> Series {
    (0..x.len())
        .map(|i| {
            if w == 0 || i < w {
                return None;
            }
            match (x[i], x[i - w]) {
                (Some(cur), Some(prev)) if prev != 0.0 => Some((cur - prev) / prev),
                _ => None,
            }
        })
        .collect()
}

/// Population standard deviation over a rolling window.
pub fn rolling_std(x: &[Option<f64>], w: usize) -> Series {
    (0..x.len())
        .map(|i| window(x, i, w).map(|s| s.population_std_dev()))
        .collect()
}

pub fn lag(x: &[Option<f64>], n: usize) -> Series {
    (0..x.len())
        .map(|i| if i >= n { x[i - n] } else { None })
        .collect()
}

pub fn highest(x: &[Option<f64>], w: usize) -> Series {
    (0..x.len())
        .map(|i| window(x, i, w).map(|s| s.iter().copied().fold(f64::MIN, f64::max)))
        .collect()
}

pub fn lowest(x: &[Option<f64>], w: usize) -> Series {
    (0..x.len())
        .map(|i| window(x, i, w).map(|s| s.iter().copied().fold(f64::MAX, f64::min)))
        .collect()
}

/// Simple close-to-close returns; the first bar has no return.
pub fn pct_change(x: &[f64]) -> Vec<f64> {
    std::iter::once(0.0)
        .chain(x.windows(2).map(|w| (w[1] - w[0]) / w[0]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.map(|a| (a - b).abs() < 1e-9).unwrap_or(false)
    }

    #[test]
    fn sma_warms_up_then_averages() {
        let s = sma(&lift(&[1.0, 2.0, 3.0, 4.0]), 3);
        assert_eq!(s[0], None);
        assert_eq!(s[1], None);
        assert!(approx(s[2], 2.0));
        assert!(approx(s[3], 3.0));
    }

    #[test]
    fn sma_of_undefined_window_is_undefined() {
        let x = vec![None, Some(2.0), Some(4.0), Some(6.0)];
        let s = sma(&x, 2);
        assert_eq!(s[1], None);
        assert!(approx(s[2], 3.0));
    }

    #[test]
    fn ema_seeds_with_sma() {
        let s = ema(&lift(&[2.0, 4.0, 6.0, 8.0]), 3);
        assert_eq!(s[1], None);
        assert!(approx(s[2], 4.0));
        // k = 0.5 -> (8 - 4) * 0.5 + 4
        assert!(approx(s[3], 6.0));
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let s = rsi(&lift(&[1.0, 2.0, 3.0, 4.0, 5.0]), 3);
        assert_eq!(s[2], None);
        assert!(approx(s[3], 100.0));
        assert!(approx(s[4], 100.0));
    }

    #[test]
    fn rsi_balanced_moves_is_50() {
        let s = rsi(&lift(&[10.0, 11.0, 10.0, 11.0, 10.0]), 4);
        assert!(approx(s[4], 50.0));
    }

    #[test]
    fn roc_lag_and_extremes() {
        let x = lift(&[100.0, 110.0, 99.0]);
        assert!(approx(roc(&x, 1)[1], 0.1));
        assert_eq!(lag(&x, 1), vec![None, Some(100.0), Some(110.0)]);
        assert!(approx(highest(&x, 2)[2], 110.0));
        assert!(approx(lowest(&x, 3)[2], 99.0));
    }

    #[test]
    fn pct_change_starts_at_zero() {
        let r = pct_change(&[100.0, 101.0, 99.0]);
        assert_eq!(r.len(), 3);
        assert_eq!(r[0], 0.0);
        assert!((r[1] - 0.01).abs() < 1e-12);
    }
}
