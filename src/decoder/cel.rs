//! CEL evaluation of decoding functions.
//!
//! A decoding function is a single CEL expression. It sees two variables:
//!
//! - `payload`: the raw uplink payload as JSON
//! - `device`: device metadata (id, name, type, applicationId and the
//!   transport identifier), never credentials
//!
//! and these helper functions:
//!
//! - `json_parse(string) -> any`
//! - `base64_decode(string) -> bytes`
//! - `hex_decode(string) -> bytes`
//! - `bytes_to_list(bytes) -> list<int>`
//!
//! ```cel
//! {'temperature': bytes_to_list(base64_decode(payload.data))[0] / 2, 'sensor': device.name}
//! ```
//!
//! Comprehensions (`map`, `filter`, `all`, `exists`, `exists_one`) are
//! metered. Each one charges the size of the collection it walks against the
//! evaluation's step allowance and checks the deadline before it starts, so
//! a decoder that outlives its budget stops at its next comprehension.

use super::DecodeError;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cel_interpreter::extractors::{Identifier, This};
use cel_interpreter::objects::{Key, Map};
use cel_interpreter::{
    functions, Context, ExecutionError, Expression, FunctionContext, Program, Value as CelValue,
};
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Work allowance for one evaluation.
#[derive(Debug, Clone)]
pub(super) struct Budget {
    timeout: Duration,
    deadline: Instant,
    max_steps: u64,
    steps: u64,
    exhausted: Option<Exhausted>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Exhausted {
    Deadline,
    Steps,
}

impl Budget {
    /// The deadline starts counting now.
    pub(super) fn new(timeout: Duration, max_steps: u64) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            max_steps,
            steps: 0,
            exhausted: None,
        }
    }

    fn charge(&mut self, items: usize) -> Result<(), ExecutionError> {
        if Instant::now() >= self.deadline {
            self.exhausted = Some(Exhausted::Deadline);
            return Err(function_error("comprehension", "deadline exceeded"));
        }
        self.steps = self.steps.saturating_add(items as u64);
        if self.steps > self.max_steps {
            self.exhausted = Some(Exhausted::Steps);
            return Err(function_error("comprehension", "step limit exceeded"));
        }
        Ok(())
    }

    fn into_error(self, cause: ExecutionError) -> DecodeError {
        match self.exhausted {
            Some(Exhausted::Deadline) => DecodeError::Timeout(self.timeout),
            Some(Exhausted::Steps) => DecodeError::StepLimit {
                limit: self.max_steps,
            },
            None => DecodeError::Execution(cause.to_string()),
        }
    }
}

thread_local! {
    static BUDGET: RefCell<Option<Budget>> = const { RefCell::new(None) };
}

/// Installs a budget on the current thread for the duration of one program run.
struct BudgetGuard;

impl BudgetGuard {
    fn install(budget: Budget) -> Self {
        BUDGET.with(|slot| *slot.borrow_mut() = Some(budget));
        BudgetGuard
    }

    fn take(self) -> Option<Budget> {
        BUDGET.with(|slot| slot.borrow_mut().take())
    }
}

impl Drop for BudgetGuard {
    fn drop(&mut self) {
        BUDGET.with(|slot| slot.borrow_mut().take());
    }
}

fn charge(target: &CelValue) -> Result<(), ExecutionError> {
    let items = match target {
        CelValue::List(items) => items.len(),
        CelValue::Map(map) => map.map.len(),
        _ => 0,
    };
    BUDGET.with(|slot| match slot.borrow_mut().as_mut() {
        Some(budget) => budget.charge(items),
        None => Ok(()),
    })
}

/// Compile and run `source` against fresh variables. Blocking.
pub(super) fn evaluate(
    source: &str,
    device: JsonValue,
    payload: JsonValue,
    budget: Budget,
) -> Result<JsonValue, DecodeError> {
    let program =
        Program::compile(source).map_err(|e| DecodeError::Compilation(e.to_string()))?;

    let mut context = Context::default();
    register_helpers(&mut context);
    register_metered_comprehensions(&mut context);

    context.add_variable_from_value(
        "payload",
        json_to_cel_value(payload).map_err(|_| DecodeError::InvalidInput("payload".to_string()))?,
    );
    context.add_variable_from_value(
        "device",
        json_to_cel_value(device).map_err(|_| DecodeError::InvalidInput("device".to_string()))?,
    );

    let guard = BudgetGuard::install(budget);
    let outcome = program.execute(&context);
    let budget = guard.take();

    match outcome {
        Ok(result) => cel_value_to_json(result),
        Err(e) => Err(match budget {
            Some(budget) => budget.into_error(e),
            None => DecodeError::Execution(e.to_string()),
        }),
    }
}

fn function_error(function: &str, message: impl ToString) -> ExecutionError {
    ExecutionError::FunctionError {
        function: function.to_string(),
        message: message.to_string(),
    }
}

fn register_helpers(context: &mut Context) {
    context.add_function(
        "json_parse",
        |text: Arc<String>| -> Result<CelValue, ExecutionError> {
            let parsed: JsonValue = serde_json::from_str(&text)
                .map_err(|e| function_error("json_parse", e))?;
            json_to_cel_value(parsed).map_err(|e| function_error("json_parse", e))
        },
    );

    context.add_function(
        "base64_decode",
        |text: Arc<String>| -> Result<CelValue, ExecutionError> {
            BASE64
                .decode(text.trim())
                .map(|bytes| CelValue::Bytes(Arc::new(bytes)))
                .map_err(|e| function_error("base64_decode", e))
        },
    );

    context.add_function(
        "hex_decode",
        |text: Arc<String>| -> Result<CelValue, ExecutionError> {
            decode_hex(text.trim())
                .map(|bytes| CelValue::Bytes(Arc::new(bytes)))
                .ok_or_else(|| function_error("hex_decode", "invalid hex string"))
        },
    );

    context.add_function(
        "bytes_to_list",
        |bytes: Arc<Vec<u8>>| -> Result<CelValue, ExecutionError> {
            let items = bytes.iter().map(|b| CelValue::Int(i64::from(*b))).collect();
            Ok(CelValue::List(Arc::new(items)))
        },
    );
}

fn metered_map(
    ftx: &FunctionContext,
    This(target): This<CelValue>,
    ident: Identifier,
    expr: Expression,
) -> Result<CelValue, ExecutionError> {
    charge(&target)?;
    functions::map(ftx, This(target), ident, expr)
}

fn metered_filter(
    ftx: &FunctionContext,
    This(target): This<CelValue>,
    ident: Identifier,
    expr: Expression,
) -> Result<CelValue, ExecutionError> {
    charge(&target)?;
    functions::filter(ftx, This(target), ident, expr)
}

fn metered_all(
    ftx: &FunctionContext,
    This(target): This<CelValue>,
    ident: Identifier,
    expr: Expression,
) -> Result<bool, ExecutionError> {
    charge(&target)?;
    functions::all(ftx, This(target), ident, expr)
}

fn metered_exists(
    ftx: &FunctionContext,
    This(target): This<CelValue>,
    ident: Identifier,
    expr: Expression,
) -> Result<bool, ExecutionError> {
    charge(&target)?;
    functions::exists(ftx, This(target), ident, expr)
}

fn metered_exists_one(
    ftx: &FunctionContext,
    This(target): This<CelValue>,
    ident: Identifier,
    expr: Expression,
) -> Result<bool, ExecutionError> {
    charge(&target)?;
    functions::exists_one(ftx, This(target), ident, expr)
}

fn register_metered_comprehensions(context: &mut Context) {
    context.add_function("map", metered_map);
    context.add_function("filter", metered_filter);
    context.add_function("all", metered_all);
    context.add_function("exists", metered_exists);
    context.add_function("exists_one", metered_exists_one);
}

fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| text.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

/// Convert a CEL result to JSON. Timestamps, durations and functions have no
/// JSON form and are rejected.
fn cel_value_to_json(value: CelValue) -> Result<JsonValue, DecodeError> {
    match value {
        CelValue::Null => Ok(JsonValue::Null),
        CelValue::Bool(b) => Ok(JsonValue::Bool(b)),
        CelValue::Int(i) => Ok(JsonValue::Number(i.into())),
        CelValue::UInt(u) => Ok(JsonValue::Number(u.into())),
        CelValue::Float(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .ok_or_else(|| DecodeError::NonSerializable(format!("float {}", f))),
        CelValue::String(s) => Ok(JsonValue::String(s.to_string())),
        CelValue::Bytes(b) => Ok(JsonValue::String(BASE64.encode(b.as_slice()))),
        CelValue::List(items) => items
            .iter()
            .cloned()
            .map(cel_value_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        CelValue::Map(map) => {
            let mut object = serde_json::Map::new();
            for (key, value) in map.map.iter() {
                let key = match key {
                    Key::String(s) => s.to_string(),
                    Key::Int(i) => i.to_string(),
                    Key::Uint(u) => u.to_string(),
                    Key::Bool(b) => b.to_string(),
                };
                object.insert(key, cel_value_to_json(value.clone())?);
            }
            Ok(JsonValue::Object(object))
        }
        other => Err(DecodeError::NonSerializable(format!("{:?}", other))),
    }
}

fn json_to_cel_value(json: JsonValue) -> Result<CelValue, String> {
    match json {
        JsonValue::Null => Ok(CelValue::Null),
        JsonValue::Bool(b) => Ok(CelValue::Bool(b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(CelValue::Int(i))
            } else if let Some(u) = n.as_u64() {
                Ok(CelValue::UInt(u))
            } else if let Some(f) = n.as_f64() {
                Ok(CelValue::Float(f))
            } else {
                Err(format!("unrepresentable number {}", n))
            }
        }
        JsonValue::String(s) => Ok(CelValue::String(Arc::new(s))),
        JsonValue::Array(items) => {
            let list = items
                .into_iter()
                .map(json_to_cel_value)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(CelValue::List(Arc::new(list)))
        }
        JsonValue::Object(object) => {
            let mut map: HashMap<Key, CelValue> = HashMap::with_capacity(object.len());
            for (key, value) in object {
                map.insert(Key::String(Arc::new(key)), json_to_cel_value(value)?);
            }
            Ok(CelValue::Map(Map { map: Arc::new(map) }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn budget() -> Budget {
        Budget::new(Duration::from_secs(5), 1_000_000)
    }

    #[test]
    fn test_payload_and_device_are_visible() {
        let result = evaluate(
            "{'t': payload.t * 2.0, 'from': device.name}",
            json!({"name": "meter"}),
            json!({"t": 10.5}),
            budget(),
        )
        .unwrap();
        assert_eq!(result, json!({"t": 21.0, "from": "meter"}));
    }

    #[test]
    fn test_helpers() {
        let result = evaluate(
            "[bytes_to_list(hex_decode(payload.hex)), bytes_to_list(base64_decode(payload.b64)), json_parse(payload.doc).a]",
            json!({}),
            json!({"hex": "01ff", "b64": "AQI=", "doc": "{\"a\": [1, 2]}"}),
            budget(),
        )
        .unwrap();
        assert_eq!(result, json!([[1, 255], [1, 2], [1, 2]]));
    }

    #[test]
    fn test_bytes_result_is_base64() {
        let result = evaluate("hex_decode('0102')", json!({}), json!({}), budget()).unwrap();
        assert_eq!(result, json!("AQI="));
    }

    #[test]
    fn test_hex_rejects_odd_input() {
        assert!(decode_hex("abc").is_none());
        assert!(decode_hex("zz").is_none());
        assert_eq!(decode_hex(""), Some(vec![]));
    }

    #[test]
    fn test_comprehensions_still_work() {
        let result = evaluate(
            "[payload.l.map(x, x * 2), payload.l.filter(x, x > 1), payload.l.all(x, x > 0), payload.l.exists_one(x, x == 2)]",
            json!({}),
            json!({"l": [1, 2, 3]}),
            budget(),
        )
        .unwrap();
        assert_eq!(result, json!([[2, 4, 6], [2, 3], true, true]));
    }

    #[test]
    fn test_nested_comprehension_hits_step_limit() {
        let list: Vec<u32> = (0..100).collect();
        let err = evaluate(
            "payload.l.all(x, payload.l.all(y, x + y >= 0))",
            json!({}),
            json!({ "l": list }),
            Budget::new(Duration::from_secs(5), 1_000),
        )
        .unwrap_err();
        assert_eq!(err, DecodeError::StepLimit { limit: 1_000 });
    }

    #[test]
    fn test_expired_deadline_stops_comprehension() {
        let err = evaluate(
            "[1, 2].exists(x, x == 2)",
            json!({}),
            json!({}),
            Budget::new(Duration::ZERO, 1_000),
        )
        .unwrap_err();
        assert_eq!(err, DecodeError::Timeout(Duration::ZERO));
    }

    #[test]
    fn test_budget_is_cleared_after_evaluation() {
        evaluate("[1].all(x, x > 0)", json!({}), json!({}), budget()).unwrap();
        BUDGET.with(|slot| assert!(slot.borrow().is_none()));
    }
}
