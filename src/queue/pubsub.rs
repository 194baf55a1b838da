//! External pub/sub queue backing.
//!
//! Jobs are serialised as JSON and must round-trip byte-exactly across the
//! topic. Acknowledgement is deferred until the handler returns: a handler
//! error nacks the message, and redelivery is capped by the backing's own
//! retry policy. The transport itself is behind a trait; a REST transport
//! for GCP Pub/Sub is provided.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{HandlerError, Queue, QueueError};
use crate::models::job::QueuedJob;

/// A message pulled from the subscription.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// Opaque acknowledgement handle.
    pub ack_id: String,
    pub payload: Vec<u8>,
}

/// Transport operations the queue needs from a pub/sub backing.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn publish(&self, payload: &[u8]) -> Result<(), QueueError>;

    /// Pull at most one message; `None` when nothing was available before
    /// the transport's own deadline.
    async fn pull(&self) -> Result<Option<PubSubMessage>, QueueError>;

    async fn ack(&self, ack_id: &str) -> Result<(), QueueError>;

    /// Return the message to the subscription for redelivery.
    async fn nack(&self, ack_id: &str) -> Result<(), QueueError>;
}

/// Producer handle for the pub/sub backing.
#[derive(Clone)]
pub struct PubSubQueue {
    transport: Arc<dyn PubSubTransport>,
}

impl PubSubQueue {
    pub fn new(transport: Arc<dyn PubSubTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Queue for PubSubQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        let payload = serde_json::to_vec(&job)?;
        self.transport.publish(&payload).await
    }
}

/// Drive the worker loop until cancellation.
///
/// Messages are acked only after the handler returns `Ok`; failures nack
/// for redelivery. Undecodable payloads are acked and dropped so a poison
/// message cannot wedge the subscription.
pub fn wait<F, Fut>(
    transport: Arc<dyn PubSubTransport>,
    cancel: CancellationToken,
    handler: F,
) -> JoinHandle<()>
where
    F: Fn(QueuedJob) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    tokio::spawn(async move {
        loop {
            let pulled = tokio::select! {
                _ = cancel.cancelled() => break,
                pulled = transport.pull() => pulled,
            };
            let message = match pulled {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "pub/sub pull failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            let job: QueuedJob = match serde_json::from_slice(&message.payload) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(error = %e, "dropping undecodable queue payload");
                    if let Err(e) = transport.ack(&message.ack_id).await {
                        tracing::error!(error = %e, "ack failed");
                    }
                    continue;
                }
            };

            let outcome = handler(job).await;
            let settle = match outcome {
                Ok(()) => transport.ack(&message.ack_id).await,
                Err(e) => {
                    tracing::error!(error = %e, "job handler failed, nacking for redelivery");
                    transport.nack(&message.ack_id).await
                }
            };
            if let Err(e) = settle {
                tracing::error!(error = %e, "could not settle pub/sub message");
            }
        }
        tracing::info!("pub/sub queue worker stopped");
    })
}

/// REST transport for GCP Pub/Sub.
///
/// Authenticates with an access token from `PUBSUB_AUTH_TOKEN` when set
/// (local development), otherwise from the GCE metadata server.
pub struct GcpPubSubTransport {
    http: reqwest::Client,
    topic_path: String,
    subscription_path: String,
}

const PUBSUB_API: &str = "https://pubsub.googleapis.com/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

#[derive(serde::Deserialize)]
struct MetadataToken {
    access_token: String,
}

#[derive(serde::Deserialize)]
struct PullResponse {
    #[serde(default, rename = "receivedMessages")]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(serde::Deserialize)]
struct ReceivedMessage {
    #[serde(rename = "ackId")]
    ack_id: String,
    message: PubSubPayload,
}

#[derive(serde::Deserialize)]
struct PubSubPayload {
    #[serde(default)]
    data: String,
}

impl GcpPubSubTransport {
    /// The subscription is derived from the topic; it must exist before the
    /// service starts.
    pub fn new(project: &str, topic: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            topic_path: format!("projects/{project}/topics/{topic}"),
            subscription_path: format!("projects/{project}/subscriptions/{topic}-worker"),
        }
    }

    async fn token(&self) -> Result<String, QueueError> {
        if let Ok(token) = std::env::var("PUBSUB_AUTH_TOKEN") {
            return Ok(token);
        }
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| QueueError::Transport(format!("metadata token: {e}")))?;
        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| QueueError::Transport(format!("metadata token: {e}")))?;
        Ok(token.access_token)
    }

    async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, QueueError> {
        let token = self.token().await?;
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(QueueError::Transport(format!("{status}: {text}")));
        }
        response
            .json()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))
    }
}

#[async_trait]
impl PubSubTransport for GcpPubSubTransport {
    async fn publish(&self, payload: &[u8]) -> Result<(), QueueError> {
        let data = base64::engine::general_purpose::STANDARD.encode(payload);
        let url = format!("{PUBSUB_API}/{}:publish", self.topic_path);
        self.post(&url, serde_json::json!({ "messages": [{ "data": data }] }))
            .await?;
        Ok(())
    }

    async fn pull(&self) -> Result<Option<PubSubMessage>, QueueError> {
        let url = format!("{PUBSUB_API}/{}:pull", self.subscription_path);
        let value = self
            .post(&url, serde_json::json!({ "maxMessages": 1 }))
            .await?;
        let response: PullResponse =
            serde_json::from_value(value).map_err(|e| QueueError::Transport(e.to_string()))?;
        let Some(received) = response.received_messages.into_iter().next() else {
            return Ok(None);
        };
        let payload = base64::engine::general_purpose::STANDARD
            .decode(received.message.data.as_bytes())
            .map_err(|e| QueueError::Transport(format!("payload decode: {e}")))?;
        Ok(Some(PubSubMessage {
            ack_id: received.ack_id,
            payload,
        }))
    }

    async fn ack(&self, ack_id: &str) -> Result<(), QueueError> {
        let url = format!("{PUBSUB_API}/{}:acknowledge", self.subscription_path);
        self.post(&url, serde_json::json!({ "ackIds": [ack_id] }))
            .await?;
        Ok(())
    }

    async fn nack(&self, ack_id: &str) -> Result<(), QueueError> {
        // Zeroing the ack deadline asks the backing to redeliver now.
        let url = format!("{PUBSUB_API}/{}:modifyAckDeadline", self.subscription_path);
        self.post(
            &url,
            serde_json::json!({ "ackIds": [ack_id], "ackDeadlineSeconds": 0 }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;
    use crate::models::job::Job;

    /// Scripted in-memory transport recording every settle call.
    #[derive(Default)]
    struct FakeTransport {
        published: Mutex<Vec<Vec<u8>>>,
        deliveries: Mutex<VecDeque<PubSubMessage>>,
        acked: Mutex<Vec<String>>,
        nacked: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PubSubTransport for FakeTransport {
        async fn publish(&self, payload: &[u8]) -> Result<(), QueueError> {
            self.published.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        async fn pull(&self) -> Result<Option<PubSubMessage>, QueueError> {
            if let Some(message) = self.deliveries.lock().unwrap().pop_front() {
                return Ok(Some(message));
            }
            // Park like a real long-poll so the select loop can cancel us.
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn ack(&self, ack_id: &str) -> Result<(), QueueError> {
            self.acked.lock().unwrap().push(ack_id.to_string());
            Ok(())
        }

        async fn nack(&self, ack_id: &str) -> Result<(), QueueError> {
            self.nacked.lock().unwrap().push(ack_id.to_string());
            Ok(())
        }
    }

    fn queued_job() -> QueuedJob {
        QueuedJob {
            analysis_id: Uuid::new_v4(),
            repo: "owner/demo".to_string(),
            head_sha: "abc".to_string(),
            job: Job::Push {
                base_url: "u".to_string(),
                base_ref: "a~1".to_string(),
                head_url: "u".to_string(),
                head_ref: "a".to_string(),
                installation_id: 1,
                repo_id: 2,
            },
        }
    }

    #[tokio::test]
    async fn enqueue_publishes_round_trippable_payload() {
        let transport = Arc::new(FakeTransport::default());
        let queue = PubSubQueue::new(transport.clone());
        let job = queued_job();

        queue.enqueue(job.clone()).await.unwrap();

        let published = transport.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let restored: QueuedJob = serde_json::from_slice(&published[0]).unwrap();
        assert_eq!(restored, job);
        assert_eq!(serde_json::to_vec(&restored).unwrap(), published[0]);
    }

    #[tokio::test]
    async fn successful_handler_acks() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .deliveries
            .lock()
            .unwrap()
            .push_back(PubSubMessage {
                ack_id: "m1".to_string(),
                payload: serde_json::to_vec(&queued_job()).unwrap(),
            });

        let cancel = CancellationToken::new();
        let worker = wait(transport.clone(), cancel.clone(), |_job| async { Ok(()) });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(*transport.acked.lock().unwrap(), vec!["m1"]);
        assert!(transport.nacked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_handler_nacks_for_redelivery() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .deliveries
            .lock()
            .unwrap()
            .push_back(PubSubMessage {
                ack_id: "m1".to_string(),
                payload: serde_json::to_vec(&queued_job()).unwrap(),
            });

        let cancel = CancellationToken::new();
        let worker = wait(transport.clone(), cancel.clone(), |_job| async {
            Err("engine exploded".into())
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert!(transport.acked.lock().unwrap().is_empty());
        assert_eq!(*transport.nacked.lock().unwrap(), vec!["m1"]);
    }

    #[tokio::test]
    async fn undecodable_payload_is_acked_and_dropped() {
        let transport = Arc::new(FakeTransport::default());
        transport
            .deliveries
            .lock()
            .unwrap()
            .push_back(PubSubMessage {
                ack_id: "poison".to_string(),
                payload: b"not json".to_vec(),
            });

        let cancel = CancellationToken::new();
        let worker = wait(transport.clone(), cancel.clone(), |_job| async {
            panic!("handler must not see a poison message")
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        worker.await.unwrap();

        assert_eq!(*transport.acked.lock().unwrap(), vec!["poison"]);
    }
}
