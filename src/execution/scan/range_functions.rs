//! Functions evaluated over the samples of a range window.
//!
//! Only float samples take part; histogram points in the window are skipped
//! by the matrix selector before a function sees them.

/// The float samples of one series that fall into `(step_time - range, step_time]`.
pub struct RangeWindow<'a> {
    pub samples: &'a [(i64, f64)],
    pub step_time: i64,
    pub range: i64,
}

pub type RangeFunction = fn(&RangeWindow<'_>) -> Option<f64>;

pub fn range_function(name: &str) -> Option<RangeFunction> {
    let f: RangeFunction = match name {
        "rate" => |w| extrapolated_rate(w, true, true),
        "increase" => |w| extrapolated_rate(w, true, false),
        "delta" => |w| extrapolated_rate(w, false, false),
        "irate" => |w| instant_value(w, true),
        "idelta" => |w| instant_value(w, false),
        "changes" => changes,
        "resets" => resets,
        "deriv" => deriv,
        "sum_over_time" => |w| non_empty(w).map(|s| s.iter().map(|(_, v)| v).sum()),
        "avg_over_time" => |w| non_empty(w).map(|s| s.iter().map(|(_, v)| v).sum::<f64>() / s.len() as f64),
        "count_over_time" => |w| non_empty(w).map(|s| s.len() as f64),
        "present_over_time" => |w| non_empty(w).map(|_| 1.0),
        "last_over_time" => |w| w.samples.last().map(|(_, v)| *v),
        "min_over_time" => |w| {
            non_empty(w).map(|s| {
                s.iter()
                    .map(|(_, v)| *v)
                    .fold(f64::NAN, |min, v| if v < min || min.is_nan() { v } else { min })
            })
        },
        "max_over_time" => |w| {
            non_empty(w).map(|s| {
                s.iter()
                    .map(|(_, v)| *v)
                    .fold(f64::NAN, |max, v| if v > max || max.is_nan() { v } else { max })
            })
        },
        "stddev_over_time" => |w| non_empty(w).map(|s| variance(s).sqrt()),
        "stdvar_over_time" => |w| non_empty(w).map(variance),
        _ => return None,
    };
    Some(f)
}

/// Whether the output series keep the metric name of their input.
pub fn keeps_metric_name(name: &str) -> bool {
    name == "last_over_time"
}

fn non_empty<'a>(w: &RangeWindow<'a>) -> Option<&'a [(i64, f64)]> {
    if w.samples.is_empty() {
        None
    } else {
        Some(w.samples)
    }
}

fn variance(samples: &[(i64, f64)]) -> f64 {
    let n = samples.len() as f64;
    let mean = samples.iter().map(|(_, v)| v).sum::<f64>() / n;
    samples.iter().map(|(_, v)| (v - mean) * (v - mean)).sum::<f64>() / n
}

/// Rate of change over the window, extrapolated towards the window edges
/// when the first or last sample is close enough to them.
fn extrapolated_rate(w: &RangeWindow<'_>, is_counter: bool, is_rate: bool) -> Option<f64> {
    let samples = w.samples;
    if samples.len() < 2 {
        return None;
    }
    let (first_t, first_v) = samples[0];
    let (last_t, last_v) = samples[samples.len() - 1];
    let range_start = w.step_time - w.range;
    let range_end = w.step_time;

    let mut result = last_v - first_v;
    if is_counter {
        let mut prev = first_v;
        for &(_, v) in &samples[1..] {
            if v < prev {
                result += prev;
            }
            prev = v;
        }
    }

    let mut duration_to_start = (first_t - range_start) as f64 / 1000.0;
    let duration_to_end = (range_end - last_t) as f64 / 1000.0;
    let sampled_interval = (last_t - first_t) as f64 / 1000.0;
    let avg_between = sampled_interval / (samples.len() - 1) as f64;

    // A counter cannot go below zero, so do not extrapolate past the point it would reach zero.
    if is_counter && result > 0.0 && first_v >= 0.0 {
        let duration_to_zero = sampled_interval * (first_v / result);
        if duration_to_zero < duration_to_start {
            duration_to_start = duration_to_zero;
        }
    }

    let threshold = avg_between * 1.1;
    let mut extrapolate_to = sampled_interval;
    extrapolate_to += if duration_to_start < threshold {
        duration_to_start
    } else {
        avg_between / 2.0
    };
    extrapolate_to += if duration_to_end < threshold {
        duration_to_end
    } else {
        avg_between / 2.0
    };

    result *= extrapolate_to / sampled_interval;
    if is_rate {
        result /= w.range as f64 / 1000.0;
    }
    Some(result)
}

/// Difference between the last two samples, per second when `is_rate`.
fn instant_value(w: &RangeWindow<'_>, is_rate: bool) -> Option<f64> {
    let n = w.samples.len();
    if n < 2 {
        return None;
    }
    let (prev_t, prev_v) = w.samples[n - 2];
    let (last_t, last_v) = w.samples[n - 1];

    let mut result = last_v - prev_v;
    if is_rate && last_v < prev_v {
        // Counter reset.
        result = last_v;
    }
    if is_rate {
        let interval = last_t - prev_t;
        if interval == 0 {
            return None;
        }
        result /= interval as f64 / 1000.0;
    }
    Some(result)
}

fn changes(w: &RangeWindow<'_>) -> Option<f64> {
    let samples = non_empty(w)?;
    let count = samples
        .windows(2)
        .filter(|p| {
            let (a, b) = (p[0].1, p[1].1);
            !(a == b || (a.is_nan() && b.is_nan()))
        })
        .count();
    Some(count as f64)
}

fn resets(w: &RangeWindow<'_>) -> Option<f64> {
    let samples = non_empty(w)?;
    let count = samples.windows(2).filter(|p| p[1].1 < p[0].1).count();
    Some(count as f64)
}

/// Per-second slope of a least-squares fit through the window.
fn deriv(w: &RangeWindow<'_>) -> Option<f64> {
    let samples = w.samples;
    if samples.len() < 2 {
        return None;
    }
    let intercept_t = samples[0].0;
    let init_v = samples[0].1;
    if samples.iter().all(|(_, v)| *v == init_v) {
        return Some(if init_v.is_infinite() { f64::NAN } else { 0.0 });
    }

    let n = samples.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for &(t, v) in samples {
        let x = (t - intercept_t) as f64 / 1000.0;
        sum_x += x;
        sum_y += v;
        sum_xy += x * v;
        sum_x2 += x * x;
    }
    let cov_xy = sum_xy - sum_x * sum_y / n;
    let var_x = sum_x2 - sum_x * sum_x / n;
    Some(cov_xy / var_x)
}
