// Queue Dispatcher (C10): owns the worker pool per stage, consumes the
// external queue, bounds concurrency, and handles ack/nack (spec §4.10,
// §6).
//
// The queue substrate's own durability is out of scope (spec §1); only its
// contract — at-least-once delivery, per-queue visibility timeout, DLQ on
// repeated nack — is assumed, mirrored here as the `Queue<M>` trait. One
// implementation, `SqsQueue` (`aws-sdk-sqs`); an `InMemoryQueue` test double
// stands in for it in worker/dispatcher tests, grounded in the teacher's own
// pattern of an in-process test harness substituting production
// infrastructure (`testing-framework`).
//
// Bounded concurrency follows the teacher's `Arc<Semaphore>`-per-permit
// idiom (see `a2a::executor::RuleBasedExecutor`), generalized from "one
// semaphore for one executor" to "one semaphore per dispatcher".

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::{Mutex, Semaphore};

use crate::core::error::{BundlerError, BundlerResult};

/// A message pulled off a queue, carrying whatever a receipt handle the
/// substrate needs to ack/nack it later.
#[derive(Debug, Clone)]
pub struct QueueMessage<M> {
    pub receipt_handle: String,
    pub body: M,
}

/// The subset of SQS-style semantics this crate depends on (spec §1, §4.10):
/// batched receive, ack (delete), nack (make visible again so the
/// substrate's own redelivery/backoff/DLQ machinery takes over).
#[async_trait]
pub trait Queue<M: Send + Sync + 'static>: Send + Sync {
    async fn receive_batch(&self, max_messages: u32) -> BundlerResult<Vec<QueueMessage<M>>>;
    async fn ack(&self, receipt_handle: &str) -> BundlerResult<()>;
    async fn nack(&self, receipt_handle: &str) -> BundlerResult<()>;

    /// Enqueue one message. Part of the trait (rather than an inherent
    /// method on each implementation) so producers — the plan, prepare,
    /// and post workers — can hold a `Arc<dyn Queue<M>>` rather than a
    /// concrete queue type.
    async fn send(&self, body: &M) -> BundlerResult<()>;
}

/// Tuning for one queue (spec §6): batch size, visibility timeout, and
/// retry count before a message lands in that queue's DLQ (enforced by the
/// substrate, not this crate — this is carried only to size the receive
/// loop's batch and to log/report it accurately).
#[derive(Debug, Clone, Copy)]
pub struct QueueTuning {
    pub batch_size: u32,
    pub visibility_timeout: Duration,
    pub max_retries: u32,
}

/// Runs one stage's worker function against one queue, with bounded
/// concurrency and cooperative shutdown (spec §5, §4.10).
pub struct Dispatcher<M: Send + Sync + 'static> {
    queue: Arc<dyn Queue<M>>,
    tuning: QueueTuning,
    concurrency: Arc<Semaphore>,
    stage_name: &'static str,
}

impl<M: Send + Sync + 'static> Dispatcher<M> {
    pub fn new(
        stage_name: &'static str,
        queue: Arc<dyn Queue<M>>,
        tuning: QueueTuning,
        max_concurrency: usize,
    ) -> Self {
        Self {
            queue,
            tuning,
            concurrency: Arc::new(Semaphore::new(max_concurrency.max(1))),
            stage_name,
        }
    }

    /// Pull one batch, run `handler` on each message with bounded
    /// concurrency, and ack/nack based on the result. Returns the number of
    /// messages processed (for the caller's poll-loop backoff decision).
    pub async fn run_once<F, Fut>(&self, handler: F) -> BundlerResult<usize>
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = BundlerResult<()>> + Send + 'static,
    {
        let messages = self.queue.receive_batch(self.tuning.batch_size).await?;
        let count = messages.len();
        counter!("bundler_queue_received_total", "stage" => self.stage_name).increment(count as u64);
        let handler = Arc::new(handler);

        let mut handles = Vec::with_capacity(count);
        for message in messages {
            let permit = self
                .concurrency
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let queue = self.queue.clone();
            let handler = handler.clone();
            let stage_name = self.stage_name;

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let result = handler(message.body).await;
                match result {
                    Ok(()) => {
                        counter!("bundler_stage_processed_total", "stage" => stage_name, "outcome" => "success")
                            .increment(1);
                        if let Err(e) = queue.ack(&message.receipt_handle).await {
                            error!("{stage_name}: failed to ack message: {e}");
                        }
                    }
                    Err(e) => {
                        if e.is_retryable() {
                            counter!("bundler_stage_processed_total", "stage" => stage_name, "outcome" => "retry")
                                .increment(1);
                            warn!("{stage_name}: handler failed, nacking for redelivery: {e}");
                            if let Err(nack_err) = queue.nack(&message.receipt_handle).await {
                                error!("{stage_name}: failed to nack message: {nack_err}");
                            }
                        } else {
                            // bad_input / already_advanced / irrecoverable: ack so the
                            // message does not redeliver forever (spec §7 policy).
                            counter!("bundler_stage_processed_total", "stage" => stage_name, "outcome" => "non_retryable")
                                .increment(1);
                            info!("{stage_name}: handler returned non-retryable error, acking: {e}");
                            if let Err(ack_err) = queue.ack(&message.receipt_handle).await {
                                error!("{stage_name}: failed to ack message: {ack_err}");
                            }
                        }
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(count)
    }

    /// Cooperative poll loop: run batches back to back, sleeping briefly
    /// when a batch comes back empty, until `shutdown` resolves. In-flight
    /// workers for the last batch are awaited inside `run_once` itself; a
    /// hard deadline is the caller's responsibility (spec §5: "a hard
    /// deadline terminates remaining workers").
    pub async fn run_forever<F, Fut>(&self, handler: F, mut shutdown: tokio::sync::watch::Receiver<bool>)
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = BundlerResult<()>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        loop {
            if *shutdown.borrow() {
                return;
            }
            let handler = handler.clone();
            let processed = tokio::select! {
                result = self.run_once(move |m| handler(m)) => result,
                _ = shutdown.changed() => return,
            };
            match processed {
                Ok(0) => tokio::time::sleep(Duration::from_millis(500)).await,
                Ok(_) => {}
                Err(e) => {
                    error!("{}: receive_batch failed: {e}", self.stage_name);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// SQS-compatible implementation
// ---------------------------------------------------------------------

pub struct SqsQueue<M> {
    client: aws_sdk_sqs::Client,
    queue_url: String,
    visibility_timeout: Duration,
    decode: Box<dyn Fn(&str) -> BundlerResult<M> + Send + Sync>,
    encode: Box<dyn Fn(&M) -> BundlerResult<String> + Send + Sync>,
}

impl<M> SqsQueue<M> {
    pub fn new(
        client: aws_sdk_sqs::Client,
        queue_url: String,
        visibility_timeout: Duration,
        decode: impl Fn(&str) -> BundlerResult<M> + Send + Sync + 'static,
        encode: impl Fn(&M) -> BundlerResult<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            client,
            queue_url,
            visibility_timeout,
            decode: Box::new(decode),
            encode: Box::new(encode),
        }
    }
}

#[async_trait]
impl<M: Send + Sync + 'static> Queue<M> for SqsQueue<M> {
    async fn receive_batch(&self, max_messages: u32) -> BundlerResult<Vec<QueueMessage<M>>> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(10) as i32)
            .visibility_timeout(self.visibility_timeout.as_secs() as i32)
            .wait_time_seconds(5)
            .send()
            .await
            .map_err(|e| BundlerError::Gateway(format!("sqs receive_message failed: {e}")))?;

        let mut out = Vec::new();
        for message in output.messages() {
            let (Some(body), Some(receipt_handle)) = (message.body(), message.receipt_handle()) else {
                continue;
            };
            let decoded = (self.decode)(body)?;
            out.push(QueueMessage {
                receipt_handle: receipt_handle.to_string(),
                body: decoded,
            });
        }
        Ok(out)
    }

    async fn ack(&self, receipt_handle: &str) -> BundlerResult<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| BundlerError::Gateway(format!("sqs delete_message failed: {e}")))?;
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> BundlerResult<()> {
        // Make the message immediately visible again so the substrate's
        // own redelivery/backoff takes over (spec §4.10).
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| BundlerError::Gateway(format!("sqs change_message_visibility failed: {e}")))?;
        Ok(())
    }

    async fn send(&self, body: &M) -> BundlerResult<()> {
        let encoded = (self.encode)(body)?;
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(encoded)
            .send()
            .await
            .map_err(|e| BundlerError::Gateway(format!("sqs send_message failed: {e}")))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// In-memory test double
// ---------------------------------------------------------------------

struct InMemoryQueueState<M> {
    ready: VecDeque<QueueMessage<M>>,
    in_flight: std::collections::HashMap<String, QueueMessage<M>>,
    next_id: u64,
}

/// Bounded-channel-backed stand-in for `SqsQueue`, used by worker and
/// dispatcher tests so they run without network access (spec §8, grounded
/// in the teacher's `testing-framework` in-process harness pattern).
pub struct InMemoryQueue<M> {
    state: Mutex<InMemoryQueueState<M>>,
}

impl<M: Clone + Send + 'static> InMemoryQueue<M> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InMemoryQueueState {
                ready: VecDeque::new(),
                in_flight: std::collections::HashMap::new(),
                next_id: 0,
            }),
        }
    }

    pub async fn push(&self, body: M) {
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        state.ready.push_back(QueueMessage {
            receipt_handle: id.to_string(),
            body,
        });
    }

    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.in_flight.len()
    }
}

impl<M: Clone + Send + 'static> Default for InMemoryQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M: Clone + Send + Sync + 'static> Queue<M> for InMemoryQueue<M> {
    async fn receive_batch(&self, max_messages: u32) -> BundlerResult<Vec<QueueMessage<M>>> {
        let mut state = self.state.lock().await;
        let mut out = Vec::new();
        for _ in 0..max_messages {
            let Some(message) = state.ready.pop_front() else {
                break;
            };
            state
                .in_flight
                .insert(message.receipt_handle.clone(), message.clone());
            out.push(message);
        }
        Ok(out)
    }

    async fn ack(&self, receipt_handle: &str) -> BundlerResult<()> {
        let mut state = self.state.lock().await;
        state.in_flight.remove(receipt_handle);
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str) -> BundlerResult<()> {
        let mut state = self.state.lock().await;
        if let Some(message) = state.in_flight.remove(receipt_handle) {
            state.ready.push_back(message);
        }
        Ok(())
    }

    async fn send(&self, body: &M) -> BundlerResult<()> {
        self.push(body.clone()).await;
        Ok(())
    }
}
