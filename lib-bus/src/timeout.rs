//! Per-operation timeout enforcement.
//!
//! Every IPC-facing operation runs under a budget selected by operation
//! class. Exceeding the budget yields `OperationTimeout` and records a
//! failed metric sample; completing records a latency sample either way.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::{BusError, BusResult};
use crate::metrics::MetricsCollector;

/// Operation classes with distinct default budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Connect,
    Disconnect,
    Pair,
    GetProperty,
    SetProperty,
    Read,
    Write,
    NotifyStart,
    NotifyStop,
    Default,
}

impl OpClass {
    pub fn budget(self) -> Duration {
        match self {
            OpClass::Connect => Duration::from_secs(15),
            OpClass::Disconnect => Duration::from_secs(5),
            OpClass::Pair => Duration::from_secs(30),
            OpClass::GetProperty => Duration::from_secs(5),
            OpClass::SetProperty => Duration::from_secs(5),
            OpClass::Read => Duration::from_secs(10),
            OpClass::Write => Duration::from_secs(10),
            OpClass::NotifyStart => Duration::from_secs(5),
            OpClass::NotifyStop => Duration::from_secs(5),
            OpClass::Default => Duration::from_secs(10),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpClass::Connect => "connect",
            OpClass::Disconnect => "disconnect",
            OpClass::Pair => "pair",
            OpClass::GetProperty => "get_property",
            OpClass::SetProperty => "set_property",
            OpClass::Read => "read",
            OpClass::Write => "write",
            OpClass::NotifyStart => "notify_start",
            OpClass::NotifyStop => "notify_stop",
            OpClass::Default => "default",
        }
    }
}

/// Run `fut` under the budget for `op`, recording a metric sample.
///
/// `context` carries device/characteristic identity for error reporting.
pub async fn with_timeout<T, F>(
    op: OpClass,
    context: &str,
    metrics: &MetricsCollector,
    fut: F,
) -> BusResult<T>
where
    F: Future<Output = BusResult<T>>,
{
    with_budget(op, op.budget(), context, metrics, fut).await
}

/// Same as [`with_timeout`] with an explicit budget override.
pub async fn with_budget<T, F>(
    op: OpClass,
    budget: Duration,
    context: &str,
    metrics: &MetricsCollector,
    fut: F,
) -> BusResult<T>
where
    F: Future<Output = BusResult<T>>,
{
    let start = Instant::now();
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => {
            metrics.record(op.name(), start.elapsed(), result.is_ok());
            result
        }
        Err(_) => {
            metrics.record(op.name(), start.elapsed(), false);
            tracing::warn!(
                target: "bleep::bus",
                operation = op.name(),
                context,
                budget_ms = budget.as_millis() as u64,
                "operation exceeded its budget"
            );
            Err(BusError::OperationTimeout {
                op: op.name().to_string(),
                budget,
                context: context.to_string(),
            })
        }
    }
}
