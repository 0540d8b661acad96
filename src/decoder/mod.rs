//! Payload decoder executor.
//!
//! Runs tenant-authored decoding functions under a wall-clock budget, a
//! concurrency limit and size caps on source, input and output.

mod cel;

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("decoding function is {size} bytes, limit is {limit}")]
    SourceTooLarge { size: usize, limit: usize },
    #[error("decoder input is {size} bytes, limit is {limit}")]
    InputTooLarge { size: usize, limit: usize },
    #[error("decoding function does not compile: {0}")]
    Compilation(String),
    #[error("decoding function failed: {0}")]
    Execution(String),
    #[error("decoding function exceeded {0:?}")]
    Timeout(Duration),
    #[error("decoding function exceeded {limit} evaluation steps")]
    StepLimit { limit: u64 },
    #[error("decoder output exceeds {limit} bytes")]
    ResourceExceeded { limit: usize },
    #[error("decoder result is not JSON serializable: {0}")]
    NonSerializable(String),
    #[error("invalid decoder input: {0}")]
    InvalidInput(String),
    #[error("decoder invocation aborted")]
    Aborted,
}

#[derive(Debug, Clone)]
pub struct DecoderLimits {
    pub timeout: Duration,
    pub max_source_bytes: usize,
    pub max_input_bytes: usize,
    pub max_output_bytes: usize,
    pub max_concurrency: usize,
    /// Collection items all comprehensions of one invocation may visit.
    pub max_steps: u64,
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            max_source_bytes: 64 * 1024,
            max_input_bytes: 256 * 1024,
            max_output_bytes: 256 * 1024,
            max_concurrency: 8,
            max_steps: 250_000,
        }
    }
}

/// Executes decoding functions. Cheap to clone.
#[derive(Clone)]
pub struct PayloadDecoderExecutor {
    limits: DecoderLimits,
    permits: Arc<Semaphore>,
}

impl PayloadDecoderExecutor {
    pub fn new(limits: DecoderLimits) -> Self {
        let permits = Arc::new(Semaphore::new(limits.max_concurrency.max(1)));
        Self { limits, permits }
    }

    /// Run `code` against a device and a raw payload.
    ///
    /// The timeout covers waiting for a concurrency permit as well as the
    /// evaluation. Evaluation happens on the blocking pool and holds its permit
    /// until it returns; the evaluation budget shares the same deadline, so an
    /// invocation that times out stops at its next comprehension.
    pub async fn execute(
        &self,
        code: &str,
        device: &Value,
        payload: &Value,
    ) -> Result<Value, DecodeError> {
        if code.len() > self.limits.max_source_bytes {
            return Err(DecodeError::SourceTooLarge {
                size: code.len(),
                limit: self.limits.max_source_bytes,
            });
        }

        let input_size = serialized_len(device) + serialized_len(payload);
        if input_size > self.limits.max_input_bytes {
            return Err(DecodeError::InputTooLarge {
                size: input_size,
                limit: self.limits.max_input_bytes,
            });
        }

        let budget = cel::Budget::new(self.limits.timeout, self.limits.max_steps);
        let permits = self.permits.clone();
        let source = code.to_string();
        let device = device.clone();
        let payload = payload.clone();

        let invocation = async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Err(DecodeError::Aborted),
            };
            let task = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                cel::evaluate(&source, device, payload, budget)
            });
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    tracing::error!("Decoder evaluation panicked: {}", join_error);
                    Err(DecodeError::Aborted)
                }
            }
        };

        let result = match tokio::time::timeout(self.limits.timeout, invocation).await {
            Ok(result) => result?,
            Err(_) => return Err(DecodeError::Timeout(self.limits.timeout)),
        };

        if serialized_len(&result) > self.limits.max_output_bytes {
            return Err(DecodeError::ResourceExceeded {
                limit: self.limits.max_output_bytes,
            });
        }

        Ok(result)
    }

    /// Test entry point taking pre-serialized device and payload. `code` may be
    /// the expression itself or a JSON string literal containing it.
    pub async fn execute_json_strings(
        &self,
        code: &str,
        device_json: &str,
        payload_json: &str,
    ) -> Result<Value, DecodeError> {
        let code = match serde_json::from_str::<Value>(code) {
            Ok(Value::String(inner)) => inner,
            _ => code.to_string(),
        };
        let device: Value = serde_json::from_str(device_json)
            .map_err(|e| DecodeError::InvalidInput(format!("device: {}", e)))?;
        let payload: Value = serde_json::from_str(payload_json)
            .map_err(|e| DecodeError::InvalidInput(format!("payload: {}", e)))?;

        self.execute(&code, &device, &payload).await
    }
}

fn serialized_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use serde_json::json;

    fn executor() -> PayloadDecoderExecutor {
        PayloadDecoderExecutor::new(DecoderLimits::default())
    }

    #[tokio::test]
    async fn test_decodes_payload() {
        let result = executor()
            .execute(
                "{'celsius': payload.t, 'device': device.id}",
                &json!({"id": 4}),
                &json!({"t": 21.5}),
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"celsius": 21.5, "device": 4}));
    }

    #[tokio::test]
    async fn test_parse_failure_is_a_decode_error() {
        let err = executor()
            .execute("json_parse(payload)", &json!({}), &json!("not json at all"))
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::Execution(_)));
    }

    #[tokio::test]
    async fn test_syntax_error() {
        let err = executor()
            .execute("payload.(", &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::Compilation(_)));
    }

    #[tokio::test]
    async fn test_no_state_between_invocations() {
        let exec = executor();
        exec.execute("payload", &json!({}), &json!({"secret": 1}))
            .await
            .unwrap();
        let err = exec
            .execute("secret", &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::Execution(_)));
    }

    #[tokio::test]
    async fn test_slow_decoder_times_out() {
        let exec = PayloadDecoderExecutor::new(DecoderLimits {
            timeout: Duration::from_millis(1),
            ..DecoderLimits::default()
        });
        let blob = BASE64.encode(vec![7u8; 600]);
        let err = exec
            .execute(
                "bytes_to_list(base64_decode(payload.blob)).all(x, bytes_to_list(base64_decode(payload.blob)).all(y, x * y >= 0))",
                &json!({}),
                &json!({ "blob": blob }),
            )
            .await
            .unwrap_err();
        assert_eq!(err, DecodeError::Timeout(Duration::from_millis(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runaway_decoder_does_not_starve_the_next_invocation() {
        let exec = PayloadDecoderExecutor::new(DecoderLimits {
            timeout: Duration::from_millis(50),
            max_concurrency: 1,
            max_steps: u64::MAX,
            ..DecoderLimits::default()
        });
        let blob = BASE64.encode(vec![7u8; 6000]);
        let err = exec
            .execute(
                "bytes_to_list(base64_decode(payload.blob)).all(x, bytes_to_list(base64_decode(payload.blob)).all(y, x * y >= 0))",
                &json!({}),
                &json!({ "blob": blob }),
            )
            .await
            .unwrap_err();
        assert_eq!(err, DecodeError::Timeout(Duration::from_millis(50)));

        let started = std::time::Instant::now();
        let mut result = exec.execute("payload", &json!({}), &json!({"t": 1})).await;
        // The runaway evaluation may still be releasing its permit.
        if result == Err(DecodeError::Timeout(Duration::from_millis(50))) {
            result = exec.execute("payload", &json!({}), &json!({"t": 1})).await;
        }
        assert_eq!(result, Ok(json!({"t": 1})));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_waiting_for_a_permit_counts_against_the_timeout() {
        let exec = PayloadDecoderExecutor::new(DecoderLimits {
            timeout: Duration::from_millis(20),
            max_concurrency: 1,
            ..DecoderLimits::default()
        });
        let held = exec.permits.clone().acquire_owned().await.unwrap();

        let err = exec
            .execute("payload", &json!({}), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, DecodeError::Timeout(Duration::from_millis(20)));

        drop(held);
        assert_eq!(exec.execute("1", &json!({}), &json!({})).await, Ok(json!(1)));
    }

    #[tokio::test]
    async fn test_step_limit() {
        let exec = PayloadDecoderExecutor::new(DecoderLimits {
            max_steps: 500,
            ..DecoderLimits::default()
        });
        let blob = BASE64.encode(vec![1u8; 100]);
        let err = exec
            .execute(
                "bytes_to_list(base64_decode(payload.blob)).map(x, bytes_to_list(base64_decode(payload.blob)).filter(y, y == x))",
                &json!({}),
                &json!({ "blob": blob }),
            )
            .await
            .unwrap_err();
        assert_eq!(err, DecodeError::StepLimit { limit: 500 });
    }

    #[tokio::test]
    async fn test_size_caps() {
        let exec = PayloadDecoderExecutor::new(DecoderLimits {
            max_source_bytes: 20,
            max_input_bytes: 50,
            max_output_bytes: 20,
            ..DecoderLimits::default()
        });

        let err = exec
            .execute("payload + payload + payload", &json!({}), &json!("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::SourceTooLarge { .. }));

        let err = exec
            .execute("payload", &json!({}), &json!("x".repeat(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::InputTooLarge { .. }));

        let err = exec
            .execute("[payload,payload]", &json!({}), &json!("y".repeat(20)))
            .await
            .unwrap_err();
        assert_eq!(err, DecodeError::ResourceExceeded { limit: 20 });
    }

    #[tokio::test]
    async fn test_json_string_entry_point() {
        let exec = executor();
        let result = exec
            .execute_json_strings("\"payload.value + 1\"", "{\"id\": 1}", "{\"value\": 41}")
            .await
            .unwrap();
        assert_eq!(result, json!(42));

        let result = exec
            .execute_json_strings("device.id", "{\"id\": 1}", "{}")
            .await
            .unwrap();
        assert_eq!(result, json!(1));

        let err = exec
            .execute_json_strings("payload", "{}", "{broken")
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidInput(_)));
    }
}
