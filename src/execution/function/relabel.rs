use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::execution::model::{StepVector, VectorOperator};
use crate::execution::pool::VectorPool;
use crate::execution::{check_cancelled, ExecutionError, ExecutionResult};
use crate::labels::{is_valid_label_name, Labels};
use crate::query::ast::{Call, Expr};

enum Rule {
    /// `label_replace(v, dst, replacement, src, regex)`
    Replace {
        dst: String,
        replacement: String,
        src: String,
        regex: Regex,
    },
    /// `label_join(v, dst, separator, src...)`
    Join {
        dst: String,
        separator: String,
        srcs: Vec<String>,
    },
}

impl Rule {
    fn apply(&self, labels: &Labels) -> Labels {
        let mut out = labels.clone();
        match self {
            Rule::Replace {
                dst,
                replacement,
                src,
                regex,
            } => {
                let value = labels.get(src).unwrap_or("");
                if let Some(caps) = regex.captures(value) {
                    let mut expanded = String::new();
                    caps.expand(replacement, &mut expanded);
                    out.set(dst.clone(), expanded);
                }
            }
            Rule::Join { dst, separator, srcs } => {
                let values: Vec<&str> = srcs.iter().map(|s| labels.get(s).unwrap_or("")).collect();
                out.set(dst.clone(), values.join(separator));
            }
        }
        out
    }
}

/// `label_replace` and `label_join`: rewrites the series labels and passes
/// the samples of the child through untouched.
pub struct RelabelFunctionOperator {
    next: Arc<dyn VectorOperator>,
    name: &'static str,
    rule: Rule,
    series: OnceCell<Arc<[Labels]>>,
}

impl RelabelFunctionOperator {
    pub fn new(next: Arc<dyn VectorOperator>, call: &Call) -> ExecutionResult<Self> {
        let name = call.func.name;
        let dst = string_arg(call, 1)?.to_string();
        if !is_valid_label_name(&dst) {
            return Err(ExecutionError::InvalidArgument(format!("invalid destination label name {:?}", dst)));
        }

        let rule = match name {
            "label_replace" => {
                let pattern = string_arg(call, 4)?;
                let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                    ExecutionError::InvalidArgument(format!("invalid regular expression {:?}: {}", pattern, e))
                })?;
                Rule::Replace {
                    dst,
                    replacement: string_arg(call, 2)?.to_string(),
                    src: string_arg(call, 3)?.to_string(),
                    regex,
                }
            }
            "label_join" => {
                let mut srcs = Vec::new();
                for i in 3..call.args.len() {
                    let src = string_arg(call, i)?;
                    if !is_valid_label_name(src) {
                        return Err(ExecutionError::InvalidArgument(format!("invalid source label name {:?}", src)));
                    }
                    srcs.push(src.to_string());
                }
                Rule::Join {
                    dst,
                    separator: string_arg(call, 2)?.to_string(),
                    srcs,
                }
            }
            other => return Err(ExecutionError::UnknownFunction(other.to_string())),
        };

        Ok(Self {
            next,
            name,
            rule,
            series: OnceCell::new(),
        })
    }
}

fn string_arg(call: &Call, i: usize) -> ExecutionResult<&str> {
    let mut arg = call.args.get(i);
    while let Some(Expr::Paren(inner)) = arg {
        arg = Some(inner.as_ref());
    }
    match arg {
        Some(Expr::StringLiteral(s)) => Ok(s),
        _ => Err(ExecutionError::InvalidArgument(format!(
            "argument {} of {} must be a string literal",
            i, call.func.name
        ))),
    }
}

#[async_trait]
impl VectorOperator for RelabelFunctionOperator {
    async fn next(&self, ctx: &CancellationToken) -> ExecutionResult<Option<Vec<StepVector>>> {
        check_cancelled(ctx)?;
        self.next.next(ctx).await
    }

    async fn series(&self, ctx: &CancellationToken) -> ExecutionResult<Arc<[Labels]>> {
        let series = self
            .series
            .get_or_try_init(|| async {
                let input = self.next.series(ctx).await?;
                Ok::<_, ExecutionError>(input.iter().map(|l| self.rule.apply(l)).collect())
            })
            .await?;
        Ok(Arc::clone(series))
    }

    fn pool(&self) -> Arc<VectorPool> {
        self.next.pool()
    }

    fn explain(&self) -> (String, Vec<Arc<dyn VectorOperator>>) {
        (format!("[*relabelFunctionOperator] {}", self.name), vec![Arc::clone(&self.next)])
    }
}
