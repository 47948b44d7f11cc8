//! Demo math service.
//!
//! Integer arithmetic over RPC. When the container's settings name a publish
//! endpoint, every `sum` result is also published as the `math:sum` event.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;
use zerolink::{
    param, CallArgs, EventDispatcher, Fault, MethodRegistry, ParamKind, Service, ServiceContext,
    ServiceError,
};

use crate::config::PublishConfig;

/// Container settings of a math service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MathSettings {
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

/// Argument of `calculate`: which operation to apply to `a` and `b`.
#[derive(Debug, Clone, Deserialize)]
pub struct Calculate {
    pub a: i64,
    pub b: i64,
    pub method: String,
}

pub struct MathService {
    events: Option<EventDispatcher>,
}

impl MathService {
    pub fn new(events: Option<EventDispatcher>) -> Self {
        Self { events }
    }

    async fn publish(&self, topic: &str, value: i64) {
        if let Some(events) = &self.events {
            if let Err(e) = events.dispatch(topic, value).await {
                warn!("Failed to publish math:{}: {}", topic, e);
            }
        }
    }
}

#[async_trait]
impl Service for MathService {
    const CLASS: &'static str = "MathService";

    fn name(&self) -> &str {
        "math"
    }

    async fn init(ctx: &ServiceContext) -> zerolink::Result<Self> {
        let settings: MathSettings = ctx.settings_as()?.unwrap_or_default();
        let events = match settings.publish {
            Some(publish) => Some(
                EventDispatcher::bind(
                    "math",
                    publish.endpoint(),
                    publish.through_broker,
                    ctx.protocol().clone(),
                )
                .await?,
            ),
            None => None,
        };
        Ok(Self::new(events))
    }
}

fn overflow() -> Fault {
    ServiceError::value("integer overflow").into()
}

/// Floor division, rounding toward negative infinity.
pub fn floor_div(a: i64, b: i64) -> Result<i64, Fault> {
    if b == 0 {
        return Err(ServiceError::zero_division("integer division or modulo by zero").into());
    }
    let quotient = a.checked_div(b).ok_or_else(overflow)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(quotient - 1)
    } else {
        Ok(quotient)
    }
}

/// Apply the operation called `method`.
pub fn apply(method: &str, a: i64, b: i64) -> Result<i64, Fault> {
    match method {
        "sum" => a.checked_add(b).ok_or_else(overflow),
        "mul" => a.checked_mul(b).ok_or_else(overflow),
        "div" => floor_div(a, b),
        other => Err(ServiceError::key(format!("unknown method '{}'", other)).into()),
    }
}

fn operands(call: &CallArgs) -> Result<(i64, i64), Fault> {
    Ok((call.get(0, "a")?, call.get(1, "b")?))
}

/// The remotely callable methods of [`MathService`].
pub fn methods() -> MethodRegistry<MathService> {
    let pair = || vec![param("a", ParamKind::Int), param("b", ParamKind::Int)];
    let mut methods = MethodRegistry::new();
    methods
        .register("sum", pair(), |svc: Arc<MathService>, call| async move {
            let (a, b) = operands(&call)?;
            let total = apply("sum", a, b)?;
            svc.publish("sum", total).await;
            Ok(json!(total))
        })
        .register("div", pair(), |_: Arc<MathService>, call| async move {
            let (a, b) = operands(&call)?;
            Ok(json!(apply("div", a, b)?))
        })
        .register("mul", pair(), |_: Arc<MathService>, call| async move {
            let (a, b) = operands(&call)?;
            Ok(json!(apply("mul", a, b)?))
        })
        .register(
            "calculate",
            vec![param("c", ParamKind::Map)],
            |_: Arc<MathService>, call| async move {
                let c: Calculate = call.get(0, "c")?;
                Ok(json!(apply(&c.method, c.a, c.b)?))
            },
        );
    methods
}
