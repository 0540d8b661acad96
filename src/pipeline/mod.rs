//! Processing stages behind the bus: decoding, target resolution, dispatch
//! and outcome bookkeeping.

mod decoder_listener;
mod dispatcher;
mod recorder;
mod resolver;

pub use decoder_listener::*;
pub use dispatcher::*;
pub use recorder::*;
pub use resolver::*;

/// Consumer group of the decoder listener on the raw topic.
pub const DECODER_GROUP: &str = "payload-decoder";
/// Consumer group of the dispatcher on the transformed topic.
pub const DISPATCH_GROUP: &str = "data-target-dispatcher";

#[cfg(test)]
pub(crate) mod test_support {
    use crate::db::{DataTarget, DataTargetKind};
    use crate::sender::{DataTargetSender, SendError, SendReport};

    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every send. Targets whose name starts with `fail` error out,
    /// targets whose name starts with `slow` take 300ms.
    #[derive(Default)]
    pub struct FakeSender {
        pub sent: Mutex<Vec<(String, Value)>>,
    }

    impl FakeSender {
        pub fn sent_to(&self, name: &str) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .collect()
        }

        pub fn total(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DataTargetSender for FakeSender {
        async fn send(&self, target: &DataTarget, payload: &Value) -> Result<SendReport, SendError> {
            assert!(!matches!(target.kind, DataTargetKind::OpenDataDk));
            self.sent
                .lock()
                .unwrap()
                .push((target.name.clone(), payload.clone()));

            if target.name.starts_with("slow") {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            if target.name.starts_with("fail") {
                return Err(SendError::Network("connection refused".to_string()));
            }
            Ok(SendReport {
                status_code: Some(200),
                message: None,
            })
        }
    }
}
