//! Per-group reduction state for one step.

use std::cmp::Ordering;

use crate::execution::model::StepVector;
use crate::query::ast::AggregateOp;
use crate::storage::FloatHistogram;

/// Running state of one aggregation group. Reset before every step.
#[derive(Debug, Clone)]
pub(crate) enum Accumulator {
    Sum {
        sum: f64,
        floats: usize,
        histogram: Option<FloatHistogram>,
    },
    Avg {
        sum: f64,
        floats: usize,
        histogram: Option<FloatHistogram>,
        histograms: usize,
    },
    Min(Option<f64>),
    Max(Option<f64>),
    Count(usize),
    Group(bool),
    /// Welford state shared by stddev and stdvar
    Stats {
        count: usize,
        mean: f64,
        m2: f64,
        stddev: bool,
    },
    Quantile(Vec<f64>),
    /// Candidates for topk (`top`) or bottomk, with their input sample IDs
    Select {
        values: Vec<(f64, u64)>,
        top: bool,
    },
}

impl Accumulator {
    /// Returns `None` for operators without a per-step reduction.
    pub fn new(op: AggregateOp) -> Option<Self> {
        let acc = match op {
            AggregateOp::Sum => Accumulator::Sum {
                sum: 0.0,
                floats: 0,
                histogram: None,
            },
            AggregateOp::Avg => Accumulator::Avg {
                sum: 0.0,
                floats: 0,
                histogram: None,
                histograms: 0,
            },
            AggregateOp::Min => Accumulator::Min(None),
            AggregateOp::Max => Accumulator::Max(None),
            AggregateOp::Count => Accumulator::Count(0),
            AggregateOp::Group => Accumulator::Group(false),
            AggregateOp::Stddev | AggregateOp::Stdvar => Accumulator::Stats {
                count: 0,
                mean: 0.0,
                m2: 0.0,
                stddev: op == AggregateOp::Stddev,
            },
            AggregateOp::Quantile => Accumulator::Quantile(Vec::new()),
            AggregateOp::Topk | AggregateOp::Bottomk => Accumulator::Select {
                values: Vec::new(),
                top: op == AggregateOp::Topk,
            },
            AggregateOp::CountValues => return None,
        };
        Some(acc)
    }

    pub fn reset(&mut self) {
        match self {
            Accumulator::Sum { sum, floats, histogram } => {
                *sum = 0.0;
                *floats = 0;
                *histogram = None;
            }
            Accumulator::Avg {
                sum,
                floats,
                histogram,
                histograms,
            } => {
                *sum = 0.0;
                *floats = 0;
                *histogram = None;
                *histograms = 0;
            }
            Accumulator::Min(v) | Accumulator::Max(v) => *v = None,
            Accumulator::Count(n) => *n = 0,
            Accumulator::Group(seen) => *seen = false,
            Accumulator::Stats { count, mean, m2, .. } => {
                *count = 0;
                *mean = 0.0;
                *m2 = 0.0;
            }
            Accumulator::Quantile(values) => values.clear(),
            Accumulator::Select { values, .. } => values.clear(),
        }
    }

    pub fn add(&mut self, id: u64, v: f64) {
        match self {
            Accumulator::Sum { sum, floats, .. } | Accumulator::Avg { sum, floats, .. } => {
                *sum += v;
                *floats += 1;
            }
            Accumulator::Min(cur) => {
                if cur.map_or(true, |m| m > v || m.is_nan()) {
                    *cur = Some(v);
                }
            }
            Accumulator::Max(cur) => {
                if cur.map_or(true, |m| m < v || m.is_nan()) {
                    *cur = Some(v);
                }
            }
            Accumulator::Count(n) => *n += 1,
            Accumulator::Group(seen) => *seen = true,
            Accumulator::Stats { count, mean, m2, .. } => {
                *count += 1;
                let delta = v - *mean;
                *mean += delta / *count as f64;
                *m2 += delta * (v - *mean);
            }
            Accumulator::Quantile(values) => values.push(v),
            Accumulator::Select { values, .. } => values.push((v, id)),
        }
    }

    /// Histograms only take part in sum, avg, count and group.
    pub fn add_histogram(&mut self, h: &FloatHistogram) {
        match self {
            Accumulator::Sum { histogram, .. } => merge(histogram, h),
            Accumulator::Avg {
                histogram, histograms, ..
            } => {
                merge(histogram, h);
                *histograms += 1;
            }
            Accumulator::Count(n) => *n += 1,
            Accumulator::Group(seen) => *seen = true,
            _ => {}
        }
    }

    /// Appends the result of this group to `out`. Every operator except topk
    /// and bottomk emits at most one sample with ID `group_id`; those two emit
    /// the selected input samples under their own IDs.
    pub fn emit(&mut self, group_id: u64, param: f64, out: &mut StepVector) {
        match self {
            Accumulator::Sum {
                sum,
                floats,
                histogram,
            } => match histogram.take() {
                Some(h) if *floats == 0 => out.append_histogram(group_id, h),
                Some(_) => {}
                None if *floats > 0 => out.append_sample(group_id, *sum),
                None => {}
            },
            Accumulator::Avg {
                sum,
                floats,
                histogram,
                histograms,
            } => match histogram.take() {
                Some(mut h) if *floats == 0 => {
                    h.scale(1.0 / *histograms as f64);
                    out.append_histogram(group_id, h);
                }
                Some(_) => {}
                None if *floats > 0 => out.append_sample(group_id, *sum / *floats as f64),
                None => {}
            },
            Accumulator::Min(v) | Accumulator::Max(v) => {
                if let Some(v) = v {
                    out.append_sample(group_id, *v);
                }
            }
            Accumulator::Count(n) => {
                if *n > 0 {
                    out.append_sample(group_id, *n as f64);
                }
            }
            Accumulator::Group(seen) => {
                if *seen {
                    out.append_sample(group_id, 1.0);
                }
            }
            Accumulator::Stats { count, m2, stddev, .. } => {
                if *count > 0 {
                    let variance = *m2 / *count as f64;
                    out.append_sample(group_id, if *stddev { variance.sqrt() } else { variance });
                }
            }
            Accumulator::Quantile(values) => {
                if !values.is_empty() {
                    out.append_sample(group_id, quantile(param, values));
                }
            }
            Accumulator::Select { values, top } => {
                if param.is_nan() || param < 1.0 {
                    return;
                }
                let k = (param as usize).min(values.len());
                let top = *top;
                values.sort_by(|a, b| compare_for_selection(a.0, b.0, top));
                for &(v, id) in &values[..k] {
                    out.append_sample(id, v);
                }
            }
        }
    }
}

fn merge(acc: &mut Option<FloatHistogram>, h: &FloatHistogram) {
    match acc {
        Some(sum) => sum.add(h),
        None => *acc = Some(h.clone()),
    }
}

/// Orders candidates best first; NaN always sorts last.
fn compare_for_selection(a: f64, b: f64, top: bool) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        _ if top => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        _ => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// The q-quantile of `values` with linear interpolation between the closest
/// ranks. Sorts `values` in place.
pub(crate) fn quantile(q: f64, values: &mut [f64]) -> f64 {
    if values.is_empty() || q.is_nan() {
        return f64::NAN;
    }
    if q < 0.0 {
        return f64::NEG_INFINITY;
    }
    if q > 1.0 {
        return f64::INFINITY;
    }
    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len() as f64;
    let rank = q * (n - 1.0);
    let lower = rank.floor().max(0.0) as usize;
    let upper = (lower + 1).min(values.len() - 1);
    let weight = rank - rank.floor();
    values[lower] * (1.0 - weight) + values[upper] * weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::HistogramBucket;

    fn run(op: AggregateOp, param: f64, values: &[f64]) -> StepVector {
        let mut acc = Accumulator::new(op).unwrap();
        for (i, v) in values.iter().enumerate() {
            acc.add(i as u64, *v);
        }
        let mut out = StepVector::new(0);
        acc.emit(7, param, &mut out);
        out
    }

    fn single(op: AggregateOp, values: &[f64]) -> f64 {
        let out = run(op, f64::NAN, values);
        assert_eq!(out.sample_ids, vec![7]);
        out.samples[0]
    }

    fn histogram(count: f64) -> FloatHistogram {
        FloatHistogram::new(
            count,
            vec![HistogramBucket {
                lower: 0.0,
                upper: 1.0,
                count,
            }],
        )
        .unwrap()
    }

    #[test]
    fn test_float_reductions() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert_eq!(single(AggregateOp::Sum, &values), 40.0);
        assert_eq!(single(AggregateOp::Avg, &values), 5.0);
        assert_eq!(single(AggregateOp::Min, &values), 2.0);
        assert_eq!(single(AggregateOp::Max, &values), 9.0);
        assert_eq!(single(AggregateOp::Count, &values), 8.0);
        assert_eq!(single(AggregateOp::Group, &values), 1.0);
        assert!((single(AggregateOp::Stdvar, &values) - 4.0).abs() < 1e-9);
        assert!((single(AggregateOp::Stddev, &values) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_min_replaces_leading_nan() {
        assert_eq!(single(AggregateOp::Min, &[f64::NAN, 3.0, 1.0]), 1.0);
        assert_eq!(single(AggregateOp::Max, &[f64::NAN, 3.0, 1.0]), 3.0);
    }

    #[test]
    fn test_empty_group_emits_nothing() {
        for op in [AggregateOp::Sum, AggregateOp::Avg, AggregateOp::Min, AggregateOp::Count, AggregateOp::Quantile] {
            assert!(run(op, 0.5, &[]).is_empty(), "{:?}", op);
        }
    }

    #[test]
    fn test_quantile_interpolates() {
        let out = run(AggregateOp::Quantile, 0.5, &[1.0, 4.0, 2.0, 3.0]);
        assert_eq!(out.samples, vec![2.5]);
        let out = run(AggregateOp::Quantile, 2.0, &[1.0]);
        assert_eq!(out.samples, vec![f64::INFINITY]);
    }

    #[test]
    fn test_topk_and_bottomk_keep_input_ids() {
        let values = [3.0, f64::NAN, 9.0, 1.0];
        let top = run(AggregateOp::Topk, 2.0, &values);
        assert_eq!(top.sample_ids, vec![2, 0]);
        assert_eq!(top.samples, vec![9.0, 3.0]);

        let bottom = run(AggregateOp::Bottomk, 10.0, &values);
        assert_eq!(bottom.sample_ids, vec![3, 0, 2, 1]);

        assert!(run(AggregateOp::Topk, 0.0, &values).is_empty());
    }

    #[test]
    fn test_histogram_sum_and_avg() {
        let mut acc = Accumulator::new(AggregateOp::Avg).unwrap();
        acc.add_histogram(&histogram(2.0));
        acc.add_histogram(&histogram(4.0));
        let mut out = StepVector::new(0);
        acc.emit(0, f64::NAN, &mut out);
        assert!(out.samples.is_empty());
        assert_eq!(out.histograms[0].count, 3.0);

        // Mixed floats and histograms yield no result.
        let mut acc = Accumulator::new(AggregateOp::Sum).unwrap();
        acc.add_histogram(&histogram(2.0));
        acc.add(1, 5.0);
        let mut out = StepVector::new(0);
        acc.emit(0, f64::NAN, &mut out);
        assert!(out.is_empty());

        let mut acc = Accumulator::new(AggregateOp::Count).unwrap();
        acc.add_histogram(&histogram(2.0));
        acc.add(1, 5.0);
        let mut out = StepVector::new(0);
        acc.emit(0, f64::NAN, &mut out);
        assert_eq!(out.samples, vec![2.0]);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut acc = Accumulator::new(AggregateOp::Sum).unwrap();
        acc.add(0, 10.0);
        acc.reset();
        acc.add(0, 1.0);
        let mut out = StepVector::new(0);
        acc.emit(0, f64::NAN, &mut out);
        assert_eq!(out.samples, vec![1.0]);
        assert!(Accumulator::new(AggregateOp::CountValues).is_none());
    }
}
