//! Bodies of the built-in functions evaluated sample by sample.

use std::f64::consts::PI;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

use crate::storage::FloatHistogram;

/// Evaluates a function on one sample. Exactly one of the float value and
/// the histogram is meaningful: the histogram when it is `Some`. `args`
/// holds the scalar arguments of the current step in argument order.
/// Returns `None` when the sample has no result.
pub type FunctionCall = fn(f64, Option<&FloatHistogram>, &[f64]) -> Option<f64>;

/// Evaluates a function that depends only on the step timestamp (ms).
pub type NoArgFunctionCall = fn(i64) -> f64;

macro_rules! float_fn {
    ($f:expr) => {
        |v: f64, h: Option<&FloatHistogram>, _: &[f64]| match h {
            Some(_) => None,
            None => Some(($f)(v)),
        }
    };
}

macro_rules! histogram_fn {
    ($f:expr) => {
        |_: f64, h: Option<&FloatHistogram>, _: &[f64]| h.map($f)
    };
}

macro_rules! date_fn {
    ($f:expr) => {
        |v: f64, h: Option<&FloatHistogram>, _: &[f64]| match h {
            Some(_) => None,
            None => date_part(v, $f),
        }
    };
}

pub fn instant_vector_function(name: &str) -> Option<FunctionCall> {
    let f: FunctionCall = match name {
        "abs" => float_fn!(f64::abs),
        "ceil" => float_fn!(f64::ceil),
        "floor" => float_fn!(f64::floor),
        "exp" => float_fn!(f64::exp),
        "sqrt" => float_fn!(f64::sqrt),
        "ln" => float_fn!(f64::ln),
        "log2" => float_fn!(f64::log2),
        "log10" => float_fn!(f64::log10),
        "sin" => float_fn!(f64::sin),
        "cos" => float_fn!(f64::cos),
        "tan" => float_fn!(f64::tan),
        "asin" => float_fn!(f64::asin),
        "acos" => float_fn!(f64::acos),
        "atan" => float_fn!(f64::atan),
        "sinh" => float_fn!(f64::sinh),
        "cosh" => float_fn!(f64::cosh),
        "tanh" => float_fn!(f64::tanh),
        "asinh" => float_fn!(f64::asinh),
        "acosh" => float_fn!(f64::acosh),
        "atanh" => float_fn!(f64::atanh),
        "deg" => float_fn!(|v: f64| v * 180.0 / PI),
        "rad" => float_fn!(|v: f64| v * PI / 180.0),
        "sgn" => float_fn!(sgn),
        // Ordering only matters to a final presentation step.
        "vector" | "sort" | "sort_desc" => float_fn!(|v: f64| v),
        "round" => |v, h, args| {
            if h.is_some() {
                return None;
            }
            let to_nearest = args.first().copied().unwrap_or(1.0);
            let inverse = 1.0 / to_nearest;
            Some((v * inverse + 0.5).floor() / inverse)
        },
        "clamp" => |v, h, args| {
            let (min, max) = (arg(args, 0), arg(args, 1));
            if h.is_some() || max < min {
                return None;
            }
            Some(go_max(min, go_min(max, v)))
        },
        "clamp_min" => |v, h, args| match h {
            Some(_) => None,
            None => Some(go_max(arg(args, 0), v)),
        },
        "clamp_max" => |v, h, args| match h {
            Some(_) => None,
            None => Some(go_min(arg(args, 0), v)),
        },
        "year" => date_fn!(|t: &DateTime<Utc>| t.year() as f64),
        "month" => date_fn!(|t: &DateTime<Utc>| t.month() as f64),
        "day_of_month" => date_fn!(|t: &DateTime<Utc>| t.day() as f64),
        "day_of_week" => date_fn!(|t: &DateTime<Utc>| t.weekday().num_days_from_sunday() as f64),
        "day_of_year" => date_fn!(|t: &DateTime<Utc>| t.ordinal() as f64),
        "days_in_month" => date_fn!(days_in_month),
        "hour" => date_fn!(|t: &DateTime<Utc>| t.hour() as f64),
        "minute" => date_fn!(|t: &DateTime<Utc>| t.minute() as f64),
        "histogram_count" => histogram_fn!(|h: &FloatHistogram| h.count),
        "histogram_sum" => histogram_fn!(|h: &FloatHistogram| h.sum),
        "histogram_avg" => histogram_fn!(|h: &FloatHistogram| h.sum / h.count),
        _ => return None,
    };
    Some(f)
}

pub fn no_arg_function(name: &str) -> Option<NoArgFunctionCall> {
    let f: NoArgFunctionCall = match name {
        "pi" => |_| PI,
        "time" => |t| t as f64 / 1000.0,
        "year" => |t| step_date_part(t, |d| d.year() as f64),
        "month" => |t| step_date_part(t, |d| d.month() as f64),
        "day_of_month" => |t| step_date_part(t, |d| d.day() as f64),
        "day_of_week" => |t| step_date_part(t, |d| d.weekday().num_days_from_sunday() as f64),
        "day_of_year" => |t| step_date_part(t, |d| d.ordinal() as f64),
        "days_in_month" => |t| step_date_part(t, days_in_month),
        "hour" => |t| step_date_part(t, |d| d.hour() as f64),
        "minute" => |t| step_date_part(t, |d| d.minute() as f64),
        _ => return None,
    };
    Some(f)
}

/// Scalar argument `i`, or NaN when the step had no value for it.
fn arg(args: &[f64], i: usize) -> f64 {
    args.get(i).copied().unwrap_or(f64::NAN)
}

/// Maximum that propagates NaN.
fn go_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.max(b)
    }
}

/// Minimum that propagates NaN.
fn go_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else {
        a.min(b)
    }
}

fn sgn(v: f64) -> f64 {
    if v < 0.0 {
        -1.0
    } else if v > 0.0 {
        1.0
    } else {
        v
    }
}

/// Applies `f` to the UTC time `v` seconds after the epoch.
fn date_part(v: f64, f: impl Fn(&DateTime<Utc>) -> f64) -> Option<f64> {
    if !v.is_finite() {
        return None;
    }
    DateTime::from_timestamp(v as i64, 0).map(|t| f(&t))
}

fn step_date_part(t: i64, f: impl Fn(&DateTime<Utc>) -> f64) -> f64 {
    DateTime::from_timestamp_millis(t).map_or(f64::NAN, |t| f(&t))
}

fn days_in_month(t: &DateTime<Utc>) -> f64 {
    let (year, month) = (t.year(), t.month());
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    match (
        NaiveDate::from_ymd_opt(year, month, 1),
        NaiveDate::from_ymd_opt(next_year, next_month, 1),
    ) {
        (Some(first), Some(next)) => (next - first).num_days() as f64,
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::HistogramBucket;

    fn call(name: &str, v: f64, args: &[f64]) -> Option<f64> {
        instant_vector_function(name).unwrap()(v, None, args)
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(call("abs", -2.5, &[]), Some(2.5));
        assert_eq!(call("ceil", 1.2, &[]), Some(2.0));
        assert_eq!(call("sgn", -3.0, &[]), Some(-1.0));
        assert_eq!(call("sgn", 0.0, &[]), Some(0.0));
        assert!((call("deg", PI, &[]).unwrap() - 180.0).abs() < 1e-9);
        assert!(call("ln", -1.0, &[]).unwrap().is_nan());
    }

    #[test]
    fn test_round() {
        assert_eq!(call("round", 2.5, &[]), Some(3.0));
        assert_eq!(call("round", 7.0, &[5.0]), Some(5.0));
        assert_eq!(call("round", 8.0, &[5.0]), Some(10.0));
    }

    #[test]
    fn test_clamp() {
        assert_eq!(call("clamp", 15.0, &[0.0, 10.0]), Some(10.0));
        assert_eq!(call("clamp", -1.0, &[0.0, 10.0]), Some(0.0));
        // An empty range drops the sample.
        assert_eq!(call("clamp", 5.0, &[10.0, 0.0]), None);
        assert!(call("clamp_min", 5.0, &[f64::NAN]).unwrap().is_nan());
        assert_eq!(call("clamp_max", 5.0, &[3.0]), Some(3.0));
    }

    #[test]
    fn test_date_functions() {
        // 2024-02-10T13:45:00Z
        let t = 1_707_572_700.0;
        assert_eq!(call("year", t, &[]), Some(2024.0));
        assert_eq!(call("month", t, &[]), Some(2.0));
        assert_eq!(call("day_of_month", t, &[]), Some(10.0));
        assert_eq!(call("day_of_week", t, &[]), Some(6.0));
        assert_eq!(call("days_in_month", t, &[]), Some(29.0));
        assert_eq!(call("hour", t, &[]), Some(13.0));
        assert_eq!(call("minute", t, &[]), Some(45.0));
        assert_eq!(call("year", f64::NAN, &[]), None);
    }

    #[test]
    fn test_histogram_functions() {
        let h = FloatHistogram::new(
            10.0,
            vec![HistogramBucket {
                lower: 0.0,
                upper: 5.0,
                count: 4.0,
            }],
        )
        .unwrap();
        let count = instant_vector_function("histogram_count").unwrap();
        assert_eq!(count(0.0, Some(&h), &[]), Some(4.0));
        assert_eq!(count(3.0, None, &[]), None);
        let avg = instant_vector_function("histogram_avg").unwrap();
        assert_eq!(avg(0.0, Some(&h), &[]), Some(2.5));
        // Float functions drop histograms.
        assert_eq!(instant_vector_function("abs").unwrap()(0.0, Some(&h), &[]), None);
    }

    #[test]
    fn test_no_arg_functions() {
        assert_eq!(no_arg_function("time").unwrap()(5000), 5.0);
        assert_eq!(no_arg_function("pi").unwrap()(0), PI);
        assert_eq!(no_arg_function("year").unwrap()(0), 1970.0);
        assert_eq!(no_arg_function("days_in_month").unwrap()(0), 31.0);
        assert!(no_arg_function("abs").is_none());
        assert!(instant_vector_function("rate").is_none());
    }
}
