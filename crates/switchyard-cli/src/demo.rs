//! Methods served by `switchyard worker`.

use chrono::Utc;
use serde_json::{json, Value};
use switchyard_node::{MethodTable, NodeContext};
use switchyard_wire::RpcError;
use uuid::Uuid;

/// `echo`, `add` and `whoami`.
pub fn methods() -> MethodTable {
    let instance = Uuid::new_v4().to_string();
    let started_at = Utc::now();
    MethodTable::new()
        .with("echo", |_ctx, params| async move {
            Ok(params.into_iter().next().unwrap_or(Value::Null))
        })
        .with("add", |_ctx, params| async move { add(&params) })
        .with("whoami", move |ctx: NodeContext, _params| {
            let instance = instance.clone();
            async move {
                Ok(json!({
                    "service": ctx.current_service(),
                    "instance": instance,
                    "startedAt": started_at.to_rfc3339(),
                }))
            }
        })
}

/// Sum numeric arguments; integers stay integers unless a float is present.
fn add(params: &[Value]) -> Result<Value, RpcError> {
    let mut int_sum: i64 = 0;
    let mut float_sum = 0f64;
    let mut any_float = false;
    for (i, param) in params.iter().enumerate() {
        if let Some(n) = param.as_i64() {
            int_sum = int_sum
                .checked_add(n)
                .ok_or_else(|| RpcError::invalid_params("integer overflow"))?;
            float_sum += n as f64;
        } else if let Some(f) = param.as_f64() {
            any_float = true;
            float_sum += f;
        } else {
            return Err(RpcError::invalid_params(format!(
                "argument {i} is not a number"
            )));
        }
    }
    Ok(if any_float {
        json!(float_sum)
    } else {
        json!(int_sum)
    })
}
