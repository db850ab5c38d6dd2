use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use super::functions::{get_function, Function};
use crate::labels::{Matcher, METRIC_NAME};

#[derive(Debug, Error)]
pub enum AstError {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Unknown aggregation operator: {0}")]
    UnknownAggregation(String),
    #[error("Invalid argument count for function {0}: expected {1}, got {2}")]
    InvalidArgumentCount(String, String, usize),
    #[error("Invalid argument type for function {0}: {1}")]
    InvalidArgumentType(String, String),
}

/// The type of value an expression evaluates to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Scalar,
    Vector,
    Matrix,
    String,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Scalar => "scalar",
            ValueType::Vector => "instant vector",
            ValueType::Matrix => "range vector",
            ValueType::String => "string",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
    Group,
    Stddev,
    Stdvar,
    Topk,
    Bottomk,
    Quantile,
    CountValues,
}

impl AggregateOp {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Count => "count",
            AggregateOp::Group => "group",
            AggregateOp::Stddev => "stddev",
            AggregateOp::Stdvar => "stdvar",
            AggregateOp::Topk => "topk",
            AggregateOp::Bottomk => "bottomk",
            AggregateOp::Quantile => "quantile",
            AggregateOp::CountValues => "count_values",
        }
    }

    /// Whether the operator takes a parameter before the aggregated expression.
    pub fn takes_param(&self) -> bool {
        matches!(
            self,
            AggregateOp::Topk | AggregateOp::Bottomk | AggregateOp::Quantile | AggregateOp::CountValues
        )
    }
}

impl FromStr for AggregateOp {
    type Err = AstError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "sum" => AggregateOp::Sum,
            "avg" => AggregateOp::Avg,
            "min" => AggregateOp::Min,
            "max" => AggregateOp::Max,
            "count" => AggregateOp::Count,
            "group" => AggregateOp::Group,
            "stddev" => AggregateOp::Stddev,
            "stdvar" => AggregateOp::Stdvar,
            "topk" => AggregateOp::Topk,
            "bottomk" => AggregateOp::Bottomk,
            "quantile" => AggregateOp::Quantile,
            "count_values" => AggregateOp::CountValues,
            _ => return Err(AstError::UnknownAggregation(s.to_string())),
        };
        Ok(op)
    }
}

#[derive(Debug, Clone)]
pub struct VectorSelector {
    pub name: Option<String>,
    pub matchers: Vec<Matcher>,
}

impl VectorSelector {
    /// Selects series by metric name plus any additional matchers.
    pub fn new(name: &str, matchers: Vec<Matcher>) -> Self {
        let mut all = vec![Matcher::equal(METRIC_NAME, name)];
        all.extend(matchers);
        Self {
            name: Some(name.to_string()),
            matchers: all,
        }
    }

    pub fn with_matchers(matchers: Vec<Matcher>) -> Self {
        Self { name: None, matchers }
    }
}

#[derive(Debug, Clone)]
pub struct MatrixSelector {
    pub vs: VectorSelector,
    pub range: Duration,
}

#[derive(Debug, Clone)]
pub struct AggregateExpr {
    pub op: AggregateOp,
    pub expr: Box<Expr>,
    pub param: Option<Box<Expr>>,
    pub grouping: Vec<String>,
    /// True for `without (...)`, false for `by (...)`.
    pub without: bool,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub func: Function,
    pub args: Vec<Expr>,
}

impl Call {
    /// Builds a call after checking the argument count and types against the
    /// function's signature.
    pub fn new(name: &str, args: Vec<Expr>) -> Result<Self, AstError> {
        let func = get_function(name).ok_or_else(|| AstError::UnknownFunction(name.to_string()))?;

        let too_many = func.max_args().map_or(false, |max| args.len() > max);
        if args.len() < func.min_args() || too_many {
            let expected = match func.max_args() {
                Some(max) if max == func.min_args() => max.to_string(),
                Some(max) => format!("{}..{}", func.min_args(), max),
                None => format!("at least {}", func.min_args()),
            };
            return Err(AstError::InvalidArgumentCount(name.to_string(), expected, args.len()));
        }

        for (i, arg) in args.iter().enumerate() {
            let expected = func.arg_type(i);
            if expected != Some(arg.value_type()) {
                return Err(AstError::InvalidArgumentType(
                    name.to_string(),
                    format!("argument {} is {}, expected {:?}", i, arg.value_type(), expected),
                ));
            }
        }

        Ok(Self { func, args })
    }
}

#[derive(Debug, Clone)]
pub struct BinaryExpr {
    pub op: String,
    pub lhs: Box<Expr>,
    pub rhs: Box<Expr>,
}

#[derive(Debug, Clone)]
pub struct SubqueryExpr {
    pub expr: Box<Expr>,
    pub range: Duration,
    pub step: Option<Duration>,
}

/// A parsed query expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Aggregate(AggregateExpr),
    VectorSelector(VectorSelector),
    MatrixSelector(MatrixSelector),
    Call(Call),
    NumberLiteral(f64),
    StringLiteral(String),
    Paren(Box<Expr>),
    Binary(BinaryExpr),
    Subquery(SubqueryExpr),
}

impl Expr {
    pub fn value_type(&self) -> ValueType {
        match self {
            Expr::Aggregate(_) | Expr::VectorSelector(_) => ValueType::Vector,
            Expr::MatrixSelector(_) | Expr::Subquery(_) => ValueType::Matrix,
            Expr::Call(c) => c.func.return_type,
            Expr::NumberLiteral(_) => ValueType::Scalar,
            Expr::StringLiteral(_) => ValueType::String,
            Expr::Paren(e) => e.value_type(),
            Expr::Binary(b) => {
                if b.lhs.value_type() == ValueType::Scalar && b.rhs.value_type() == ValueType::Scalar {
                    ValueType::Scalar
                } else {
                    ValueType::Vector
                }
            }
        }
    }

    pub fn selector(name: &str, matchers: Vec<Matcher>) -> Self {
        Expr::VectorSelector(VectorSelector::new(name, matchers))
    }

    pub fn range(name: &str, matchers: Vec<Matcher>, range: Duration) -> Self {
        Expr::MatrixSelector(MatrixSelector {
            vs: VectorSelector::new(name, matchers),
            range,
        })
    }

    pub fn call(name: &str, args: Vec<Expr>) -> Result<Self, AstError> {
        Call::new(name, args).map(Expr::Call)
    }

    pub fn aggregate(op: &str, expr: Expr, grouping: &[&str], without: bool) -> Result<Self, AstError> {
        Ok(Expr::Aggregate(AggregateExpr {
            op: op.parse()?,
            expr: Box::new(expr),
            param: None,
            grouping: grouping.iter().map(|s| s.to_string()).collect(),
            without,
        }))
    }

    pub fn aggregate_with_param(
        op: &str,
        param: Expr,
        expr: Expr,
        grouping: &[&str],
        without: bool,
    ) -> Result<Self, AstError> {
        let mut agg = Self::aggregate(op, expr, grouping, without)?;
        if let Expr::Aggregate(a) = &mut agg {
            a.param = Some(Box::new(param));
        }
        Ok(agg)
    }
}

pub(crate) fn fmt_duration(d: &Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    for (unit, size) in [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
        if ms % size == 0 {
            return format!("{}{}", ms / size, unit);
        }
    }
    format!("{}ms", ms)
}

impl fmt::Display for VectorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rest: Vec<String> = self
            .matchers
            .iter()
            .filter(|m| !(self.name.is_some() && m.name == METRIC_NAME))
            .map(|m| m.to_string())
            .collect();
        if let Some(name) = &self.name {
            write!(f, "{}", name)?;
            if rest.is_empty() {
                return Ok(());
            }
        }
        write!(f, "{{{}}}", rest.join(", "))
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "{}({})", self.func.name, args.join(", "))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Aggregate(a) => {
                write!(f, "{}", a.op.name())?;
                if !a.grouping.is_empty() || a.without {
                    let kw = if a.without { "without" } else { "by" };
                    write!(f, " {} ({}) ", kw, a.grouping.join(", "))?;
                }
                match &a.param {
                    Some(p) => write!(f, "({}, {})", p, a.expr),
                    None => write!(f, "({})", a.expr),
                }
            }
            Expr::VectorSelector(vs) => write!(f, "{}", vs),
            Expr::MatrixSelector(ms) => write!(f, "{}[{}]", ms.vs, fmt_duration(&ms.range)),
            Expr::Call(c) => write!(f, "{}", c),
            Expr::NumberLiteral(v) => write!(f, "{}", v),
            Expr::StringLiteral(s) => write!(f, "{:?}", s),
            Expr::Paren(e) => write!(f, "({})", e),
            Expr::Binary(b) => write!(f, "{} {} {}", b.lhs, b.op, b.rhs),
            Expr::Subquery(s) => {
                let step = s.step.as_ref().map(fmt_duration).unwrap_or_default();
                write!(f, "{}[{}:{}]", s.expr, fmt_duration(&s.range), step)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::MatchOp;

    #[test]
    fn test_display() {
        let sel = Expr::selector(
            "http_requests_total",
            vec![Matcher::new(MatchOp::Regex, "job", "api.*").unwrap()],
        );
        assert_eq!(sel.to_string(), r#"http_requests_total{job=~"api.*"}"#);
        let unnamed = Expr::VectorSelector(VectorSelector::with_matchers(vec![Matcher::equal("job", "api")]));
        assert_eq!(unnamed.to_string(), r#"{job="api"}"#);

        let rate = Expr::call(
            "rate",
            vec![Expr::range("http_requests_total", vec![], Duration::from_secs(300))],
        )
        .unwrap();
        assert_eq!(rate.to_string(), "rate(http_requests_total[5m])");

        let sum = Expr::aggregate("sum", rate, &["job"], false).unwrap();
        assert_eq!(sum.to_string(), "sum by (job) (rate(http_requests_total[5m]))");

        let clamp = Call::new(
            "clamp_min",
            vec![Expr::selector("temp", vec![]), Expr::NumberLiteral(0.5)],
        )
        .unwrap();
        assert_eq!(clamp.to_string(), "clamp_min(temp, 0.5)");
        assert_eq!(Expr::Call(clamp).to_string(), "clamp_min(temp, 0.5)");
    }

    #[test]
    fn test_value_types() {
        assert_eq!(Expr::NumberLiteral(1.0).value_type(), ValueType::Scalar);
        assert_eq!(Expr::call("time", vec![]).unwrap().value_type(), ValueType::Scalar);
        assert_eq!(
            Expr::Paren(Box::new(Expr::selector("up", vec![]))).value_type(),
            ValueType::Vector
        );
    }

    #[test]
    fn test_call_validation() {
        assert!(matches!(Expr::call("nope", vec![]), Err(AstError::UnknownFunction(_))));
        assert!(matches!(
            Expr::call("abs", vec![]),
            Err(AstError::InvalidArgumentCount(_, _, 0))
        ));
        assert!(matches!(
            Expr::call("abs", vec![Expr::NumberLiteral(1.0)]),
            Err(AstError::InvalidArgumentType(_, _))
        ));
        assert!(Expr::call("round", vec![Expr::selector("up", vec![])]).is_ok());
    }

    #[test]
    fn test_unknown_aggregation() {
        assert!(matches!(
            Expr::aggregate("median", Expr::selector("up", vec![]), &[], false),
            Err(AstError::UnknownAggregation(_))
        ));
    }
}
