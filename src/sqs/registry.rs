use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::SqsError;
use super::message::{Message, ReceivedMessage, SendParams, SendReceipt};
use super::queue::{
    Queue, QueueAttributes, RedrivePolicy, MAX_VISIBILITY_TIMEOUT, MAX_WAIT_TIME_SECONDS,
};

/// Interval between eligibility scans while a receive is long-polling.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const MAX_RECEIVE_BATCH: usize = 10;

pub type QueueRef = Arc<Mutex<Queue>>;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveParams {
    /// 1..=10, defaults to 1.
    pub max_messages: Option<usize>,
    /// Long-poll budget; defaults to the queue's ReceiveMessageWaitTimeSeconds.
    pub wait_time_seconds: Option<u32>,
    /// Overrides the queue's VisibilityTimeout for this delivery.
    pub visibility_timeout: Option<u32>,
}

/// Every queue known to the process.
///
/// The map lock only guards lookups and membership changes. Message state
/// lives behind each queue's own lock. A queue lock may be held while the map
/// lock is briefly taken, never the other way round.
#[derive(Default)]
pub struct QueueRegistry {
    queues: Mutex<HashMap<String, QueueRef>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate_queue_name(name: &str, is_fifo: bool) -> Result<(), SqsError> {
        let base = name.strip_suffix(".fifo").unwrap_or(name);
        if name.is_empty() || name.len() > 80 {
            return Err(SqsError::InvalidParameterValue(
                "Queue name must be 1-80 characters".into(),
            ));
        }
        let valid = !base.is_empty()
            && base
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SqsError::InvalidParameterValue(
                "Queue name can only contain alphanumeric characters, hyphens, and underscores"
                    .into(),
            ));
        }
        if is_fifo != name.ends_with(".fifo") {
            return Err(SqsError::InvalidParameterValue(
                "The name of a FIFO queue can only include alphanumeric characters, hyphens, or underscores, must end with .fifo suffix".into(),
            ));
        }
        Ok(())
    }

    /// Creates the queue, or returns the existing one when every supplied
    /// attribute agrees with it.
    pub async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<QueueRef, SqsError> {
        let is_fifo = match attributes.get("FifoQueue") {
            Some(v) => v.eq_ignore_ascii_case("true"),
            None => name.ends_with(".fifo"),
        };
        Self::validate_queue_name(name, is_fifo)?;

        let mut config = QueueAttributes {
            fifo_queue: is_fifo,
            ..Default::default()
        };
        config.apply(attributes)?;
        if let Some(ref policy) = config.redrive_policy {
            self.check_dead_letter_target(name, is_fifo, policy).await?;
        }

        let mut queues = self.queues.lock().await;
        if let Some(existing) = queues.get(name).cloned() {
            drop(queues);
            let current = existing.lock().await.attributes.to_map();
            let requested = config.to_map();
            let conflict = attributes.keys().any(|key| {
                let key = key.as_str();
                current.get(key) != requested.get(key)
            });
            if conflict {
                return Err(SqsError::QueueAlreadyExists(format!(
                    "A queue already exists with the same name and a different value for attribute(s) on queue {name}"
                )));
            }
            return Ok(existing);
        }

        let queue = Arc::new(Mutex::new(Queue::new(name.to_string(), config)));
        queues.insert(name.to_string(), queue.clone());
        info!(queue = %name, fifo = is_fifo, "Queue created");
        Ok(queue)
    }

    pub async fn lookup(&self, name: &str) -> Result<QueueRef, SqsError> {
        self.queues
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(SqsError::queue_not_found)
    }

    pub async fn delete_queue(&self, name: &str) -> Result<(), SqsError> {
        let queue = self
            .queues
            .lock()
            .await
            .remove(name)
            .ok_or_else(SqsError::queue_not_found)?;
        queue.lock().await.mark_deleted();
        info!(queue = %name, "Queue deleted");
        Ok(())
    }

    pub async fn list_queues(&self, prefix: Option<&str>) -> Vec<String> {
        let queues = self.queues.lock().await;
        let mut names: Vec<String> = queues
            .keys()
            .filter(|name| prefix.map_or(true, |p| name.starts_with(p)))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Drops every queue. Meant for tests that share one registry.
    pub async fn reset(&self) {
        let drained: Vec<QueueRef> = self.queues.lock().await.drain().map(|(_, q)| q).collect();
        for queue in drained {
            queue.lock().await.mark_deleted();
        }
    }

    /// A dead-letter target must already exist, differ from the source and
    /// match its queue type.
    async fn check_dead_letter_target(
        &self,
        source: &str,
        source_fifo: bool,
        policy: &RedrivePolicy,
    ) -> Result<(), SqsError> {
        let target = policy.target_queue_name();
        if target == source {
            return Err(SqsError::InvalidParameterValue(
                "Value for parameter RedrivePolicy is invalid. Reason: a queue cannot be its own dead-letter queue.".into(),
            ));
        }
        let dlq = self.lookup(target).await.map_err(|_| {
            SqsError::InvalidParameterValue(format!(
                "Value for parameter RedrivePolicy is invalid. Reason: Dead letter target does not exist: {}",
                policy.dead_letter_target_arn
            ))
        })?;
        if dlq.lock().await.is_fifo() != source_fifo {
            return Err(SqsError::InvalidParameterValue(
                "Value for parameter RedrivePolicy is invalid. Reason: Dead-letter queue must be the same type of queue as the source queue.".into(),
            ));
        }
        Ok(())
    }

    /// Locks a live queue and brings its visibility state up to `now`.
    /// Dead letters released by the expiry are returned for redelivery once
    /// the lock is gone. While the dead-letter target is missing, exhausted
    /// messages stay in the queue.
    async fn lock_live<'a>(
        &self,
        queue: &'a QueueRef,
        now: Instant,
    ) -> Result<(MutexGuard<'a, Queue>, Vec<Message>, Option<String>), SqsError> {
        let mut guard = queue.lock().await;
        if guard.is_deleted() {
            return Err(SqsError::queue_not_found());
        }
        let target = guard
            .attributes
            .redrive_policy
            .as_ref()
            .map(|rp| rp.target_queue_name().to_string());
        let redrive = match target {
            Some(ref name) => self.queues.lock().await.contains_key(name),
            None => false,
        };
        let dead_letters = guard.expire_with_redrive(now, redrive);
        Ok((guard, dead_letters, target))
    }

    async fn redrive(&self, source: &str, target: Option<String>, dead_letters: Vec<Message>) {
        if dead_letters.is_empty() {
            return;
        }
        let Some(target) = target else {
            return;
        };
        let count = dead_letters.len();
        if let Ok(dlq) = self.lookup(&target).await {
            let mut dlq = dlq.lock().await;
            if !dlq.is_deleted() {
                let now = Instant::now();
                for msg in dead_letters {
                    dlq.accept_dead_letter(msg, now);
                }
                info!(queue = %source, dlq = %target, count, "Messages moved to dead-letter queue");
                return;
            }
        }
        warn!(queue = %source, dlq = %target, count, "Dead-letter queue gone, messages kept in source");
        if let Ok(queue) = self.lookup(source).await {
            queue.lock().await.restore(dead_letters);
        }
    }

    /// Runs `op` against the named queue under its lock, after lazy expiry.
    async fn with_queue<T>(
        &self,
        name: &str,
        op: impl FnOnce(&mut Queue, Instant) -> Result<T, SqsError>,
    ) -> Result<T, SqsError> {
        let queue = self.lookup(name).await?;
        let now = Instant::now();
        let (result, dead_letters, target) = {
            let (mut guard, dead_letters, target) = self.lock_live(&queue, now).await?;
            (op(&mut *guard, now), dead_letters, target)
        };
        self.redrive(name, target, dead_letters).await;
        result
    }

    pub async fn send_message(
        &self,
        name: &str,
        params: SendParams,
    ) -> Result<SendReceipt, SqsError> {
        self.with_queue(name, |queue, now| queue.send(params, now))
            .await
    }

    /// Long-polls the queue until messages are available, the wait time runs
    /// out, or `cancel` fires.
    ///
    /// A non-empty batch returns as soon as it is found. Timeout and
    /// cancellation both yield an empty batch. A queue deleted while the call
    /// is waiting is reported as `QueueNotFound` at the next scan.
    pub async fn receive_message(
        &self,
        name: &str,
        params: ReceiveParams,
        cancel: &CancellationToken,
    ) -> Result<Vec<ReceivedMessage>, SqsError> {
        let started = Instant::now();
        let max = params.max_messages.unwrap_or(1);
        if !(1..=MAX_RECEIVE_BATCH).contains(&max) {
            return Err(SqsError::InvalidParameterValue(format!(
                "Value {max} for parameter MaxNumberOfMessages is invalid. Reason: Must be between 1 and {MAX_RECEIVE_BATCH}, if provided."
            )));
        }
        if params.wait_time_seconds.is_some_and(|w| w > MAX_WAIT_TIME_SECONDS) {
            return Err(SqsError::InvalidParameterValue(format!(
                "Value for parameter WaitTimeSeconds is invalid. Reason: Must be >= 0 and <= {MAX_WAIT_TIME_SECONDS}, if provided."
            )));
        }
        if params
            .visibility_timeout
            .is_some_and(|v| v > MAX_VISIBILITY_TIMEOUT)
        {
            return Err(SqsError::InvalidParameterValue(format!(
                "VisibilityTimeout must be between 0 and {MAX_VISIBILITY_TIMEOUT}"
            )));
        }

        let queue = self.lookup(name).await?;
        let mut deadline: Option<Instant> = None;

        loop {
            let now = Instant::now();
            let (batch, dead_letters, target, wait_seconds) = {
                let (mut guard, dead_letters, target) = self.lock_live(&queue, now).await?;
                let batch = guard.receive(max, params.visibility_timeout, now);
                let wait_seconds = params
                    .wait_time_seconds
                    .unwrap_or(guard.attributes.receive_message_wait_time_seconds);
                (batch, dead_letters, target, wait_seconds)
            };
            self.redrive(name, target, dead_letters).await;

            if !batch.is_empty() {
                return Ok(batch);
            }

            let deadline =
                *deadline.get_or_insert(started + Duration::from_secs(wait_seconds as u64));
            let now = Instant::now();
            if now >= deadline || cancel.is_cancelled() {
                return Ok(Vec::new());
            }

            let nap = POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(queue = %name, "Receive cancelled by caller");
                    return Ok(Vec::new());
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    pub async fn delete_message(&self, name: &str, receipt_handle: &str) -> Result<(), SqsError> {
        self.with_queue(name, |queue, now| queue.delete_message(receipt_handle, now))
            .await
    }

    pub async fn change_message_visibility(
        &self,
        name: &str,
        receipt_handle: &str,
        timeout: u32,
    ) -> Result<(), SqsError> {
        self.with_queue(name, |queue, now| {
            queue.change_visibility(receipt_handle, timeout, now)
        })
        .await
    }

    pub async fn purge_queue(&self, name: &str) -> Result<(), SqsError> {
        self.with_queue(name, |queue, _| {
            queue.purge();
            Ok(())
        })
        .await?;
        info!(queue = %name, "Queue purged");
        Ok(())
    }

    pub async fn get_queue_attributes(
        &self,
        name: &str,
    ) -> Result<HashMap<String, String>, SqsError> {
        self.with_queue(name, |queue, now| Ok(queue.attribute_map(now)))
            .await
    }

    pub async fn set_queue_attributes(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<(), SqsError> {
        if let Some(value) = attributes.get("RedrivePolicy").filter(|v| !v.is_empty()) {
            let policy = RedrivePolicy::from_json(value)?;
            let source_fifo = self.lookup(name).await?.lock().await.is_fifo();
            self.check_dead_letter_target(name, source_fifo, &policy).await?;
        }
        self.with_queue(name, |queue, _| queue.set_attributes(attributes))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    async fn registry_with(name: &str, pairs: &[(&str, &str)]) -> Arc<QueueRegistry> {
        let registry = Arc::new(QueueRegistry::new());
        registry.create_queue(name, &attrs(pairs)).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn long_poll_round_trip() {
        let registry = registry_with("Q", &[("ReceiveMessageWaitTimeSeconds", "2")]).await;
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let empty = registry
            .receive_message("Q", ReceiveParams::default(), &cancel)
            .await
            .unwrap();
        assert!(empty.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(2));

        registry
            .send_message("Q", SendParams::new("hello"))
            .await
            .unwrap();
        let started = Instant::now();
        let got = registry
            .receive_message("Q", ReceiveParams::default(), &cancel)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "hello");

        assert!(matches!(
            registry.delete_message("Q", "not-a-handle").await,
            Err(SqsError::MessageDoesNotExist(_))
        ));
        registry
            .delete_message("Q", &got[0].receipt_handle)
            .await
            .unwrap();

        let params = ReceiveParams {
            wait_time_seconds: Some(0),
            ..Default::default()
        };
        assert!(registry
            .receive_message("Q", params, &cancel)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn waiting_receive_wakes_on_send() {
        let registry = registry_with("wake", &[]).await;
        let poller = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let params = ReceiveParams {
                    wait_time_seconds: Some(10),
                    ..Default::default()
                };
                registry
                    .receive_message("wake", params, &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        registry
            .send_message("wake", SendParams::new("ping"))
            .await
            .unwrap();
        let got = poller.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cancelled_receive_returns_empty_promptly() {
        let registry = registry_with("cancel-queue", &[("ReceiveMessageWaitTimeSeconds", "20")]).await;
        let cancel = CancellationToken::new();
        let poller = {
            let registry = registry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                registry
                    .receive_message("cancel-queue", ReceiveParams::default(), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), poller)
            .await
            .expect("receive should stop after cancellation")
            .unwrap();
        assert!(result.unwrap().is_empty());
        assert!(cancelled_at.elapsed() <= POLL_INTERVAL * 4);

        registry
            .send_message("cancel-queue", SendParams::new("12345"))
            .await
            .unwrap();
        let got = registry
            .receive_message(
                "cancel-queue",
                ReceiveParams::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].body, "12345");
    }

    #[tokio::test]
    async fn already_cancelled_token_still_takes_available_messages() {
        let registry = registry_with("ready", &[("ReceiveMessageWaitTimeSeconds", "20")]).await;
        registry
            .send_message("ready", SendParams::new("now"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let got = registry
            .receive_message("ready", ReceiveParams::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn deleting_queue_ends_waiting_receive_with_error() {
        let registry = registry_with("waiting-queue", &[("ReceiveMessageWaitTimeSeconds", "1")]).await;
        let poller = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .receive_message(
                        "waiting-queue",
                        ReceiveParams::default(),
                        &CancellationToken::new(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        registry.delete_queue("waiting-queue").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), poller)
            .await
            .expect("receive should not hang")
            .unwrap();
        assert!(matches!(result, Err(SqsError::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn delay_is_honored_by_a_waiting_receive() {
        let registry = registry_with("delay-seconds-queue", &[("DelaySeconds", "2")]).await;
        registry
            .send_message("delay-seconds-queue", SendParams::new("1"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        assert!(registry
            .receive_message("delay-seconds-queue", ReceiveParams::default(), &cancel)
            .await
            .unwrap()
            .is_empty());

        let started = Instant::now();
        let params = ReceiveParams {
            wait_time_seconds: Some(10),
            ..Default::default()
        };
        let got = registry
            .receive_message("delay-seconds-queue", params, &cancel)
            .await
            .unwrap();
        let elapsed = started.elapsed();
        assert_eq!(got.len(), 1);
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn concurrent_receivers_never_share_a_message() {
        let registry = registry_with("shared", &[]).await;
        for i in 0..50 {
            registry
                .send_message("shared", SendParams::new(format!("m{i}")))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                loop {
                    let params = ReceiveParams {
                        max_messages: Some(3),
                        wait_time_seconds: Some(0),
                        ..Default::default()
                    };
                    let batch = registry
                        .receive_message("shared", params, &CancellationToken::new())
                        .await
                        .unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    ids.extend(batch.into_iter().map(|m| m.message_id));
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "message delivered twice");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn message_returns_after_visibility_expires() {
        let registry = registry_with("retry", &[("VisibilityTimeout", "1")]).await;
        registry
            .send_message("retry", SendParams::new("again"))
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let first = registry
            .receive_message("retry", ReceiveParams::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        let params = ReceiveParams {
            wait_time_seconds: Some(3),
            ..Default::default()
        };
        let second = registry
            .receive_message("retry", params, &cancel)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert!(matches!(
            registry
                .delete_message("retry", &first[0].receipt_handle)
                .await,
            Err(SqsError::MessageDoesNotExist(_))
        ));
    }

    #[tokio::test]
    async fn fifo_group_blocks_until_delete() {
        let registry = registry_with("orders.fifo", &[("ContentBasedDeduplication", "true")]).await;
        for body in ["a1", "a2"] {
            registry
                .send_message("orders.fifo", SendParams::new(body).with_group("a"))
                .await
                .unwrap();
        }
        let cancel = CancellationToken::new();
        let ten = ReceiveParams {
            max_messages: Some(10),
            ..Default::default()
        };
        let first = registry
            .receive_message("orders.fifo", ten, &cancel)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(registry
            .receive_message("orders.fifo", ten, &cancel)
            .await
            .unwrap()
            .is_empty());

        registry
            .delete_message("orders.fifo", &first[0].receipt_handle)
            .await
            .unwrap();
        let next = registry
            .receive_message("orders.fifo", ten, &cancel)
            .await
            .unwrap();
        assert_eq!(next[0].body, "a2");
    }

    #[tokio::test]
    async fn dead_letters_move_to_target_queue() {
        let registry = Arc::new(QueueRegistry::new());
        registry.create_queue("dlq", &HashMap::new()).await.unwrap();
        registry
            .create_queue(
                "work",
                &attrs(&[(
                    "RedrivePolicy",
                    r#"{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:000000000000:dlq","maxReceiveCount":1}"#,
                )]),
            )
            .await
            .unwrap();
        registry
            .send_message("work", SendParams::new("poison"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let params = ReceiveParams {
            visibility_timeout: Some(0),
            ..Default::default()
        };
        assert_eq!(
            registry
                .receive_message("work", params, &cancel)
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(registry
            .receive_message("work", ReceiveParams::default(), &cancel)
            .await
            .unwrap()
            .is_empty());

        let moved = registry
            .receive_message("dlq", ReceiveParams::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].body, "poison");
    }

    fn redrive_to(target: &str) -> HashMap<String, String> {
        let policy = format!(
            r#"{{"deadLetterTargetArn":"arn:aws:sqs:us-east-1:000000000000:{target}","maxReceiveCount":1}}"#
        );
        attrs(&[("RedrivePolicy", policy.as_str())])
    }

    #[tokio::test]
    async fn zero_visibility_nack_still_reaches_dead_letter_queue() {
        let registry = Arc::new(QueueRegistry::new());
        registry.create_queue("dlq", &HashMap::new()).await.unwrap();
        registry.create_queue("work", &redrive_to("dlq")).await.unwrap();
        registry
            .send_message("work", SendParams::new("poison"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let first = registry
            .receive_message("work", ReceiveParams::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        registry
            .change_message_visibility("work", &first[0].receipt_handle, 0)
            .await
            .unwrap();

        assert!(registry
            .receive_message("work", ReceiveParams::default(), &cancel)
            .await
            .unwrap()
            .is_empty());
        let moved = registry
            .receive_message("dlq", ReceiveParams::default(), &cancel)
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].body, "poison");
    }

    #[tokio::test]
    async fn redrive_policy_needs_existing_target_of_same_type() {
        let registry = Arc::new(QueueRegistry::new());
        assert!(matches!(
            registry.create_queue("work", &redrive_to("missing")).await,
            Err(SqsError::InvalidParameterValue(_))
        ));
        assert!(registry.lookup("work").await.is_err());

        registry.create_queue("work", &HashMap::new()).await.unwrap();
        assert!(matches!(
            registry.set_queue_attributes("work", &redrive_to("missing")).await,
            Err(SqsError::InvalidParameterValue(_))
        ));
        assert!(matches!(
            registry.set_queue_attributes("work", &redrive_to("work")).await,
            Err(SqsError::InvalidParameterValue(_))
        ));

        registry
            .create_queue("dlq.fifo", &HashMap::new())
            .await
            .unwrap();
        assert!(matches!(
            registry.set_queue_attributes("work", &redrive_to("dlq.fifo")).await,
            Err(SqsError::InvalidParameterValue(_))
        ));

        registry.create_queue("dlq", &HashMap::new()).await.unwrap();
        registry
            .set_queue_attributes("work", &redrive_to("dlq"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn exhausted_messages_stay_when_dead_letter_queue_is_gone() {
        let registry = Arc::new(QueueRegistry::new());
        registry.create_queue("dlq", &HashMap::new()).await.unwrap();
        registry.create_queue("work", &redrive_to("dlq")).await.unwrap();
        registry.delete_queue("dlq").await.unwrap();
        registry
            .send_message("work", SendParams::new("keep me"))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let params = ReceiveParams {
            visibility_timeout: Some(0),
            ..Default::default()
        };
        for expected_count in ["1", "2"] {
            let got = registry
                .receive_message("work", params, &cancel)
                .await
                .unwrap();
            assert_eq!(got.len(), 1);
            assert_eq!(got[0].body, "keep me");
            assert_eq!(got[0].attributes["ApproximateReceiveCount"], expected_count);
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_unless_attributes_differ() {
        let registry = registry_with("same", &[("VisibilityTimeout", "60")]).await;
        registry
            .create_queue("same", &attrs(&[("VisibilityTimeout", "60")]))
            .await
            .unwrap();
        registry.create_queue("same", &HashMap::new()).await.unwrap();
        assert!(matches!(
            registry
                .create_queue("same", &attrs(&[("VisibilityTimeout", "10")]))
                .await,
            Err(SqsError::QueueAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn create_validates_names() {
        let registry = QueueRegistry::new();
        let too_long = "x".repeat(81);
        for bad in ["", "has space", "plain.fifo.not", too_long.as_str()] {
            assert!(registry.create_queue(bad, &HashMap::new()).await.is_err());
        }
        assert!(registry
            .create_queue("standard", &attrs(&[("FifoQueue", "true")]))
            .await
            .is_err());
        let fifo = registry.create_queue("ok.fifo", &HashMap::new()).await.unwrap();
        assert!(fifo.lock().await.is_fifo());
    }

    #[tokio::test]
    async fn list_filters_by_prefix_in_order() {
        let registry = QueueRegistry::new();
        for name in ["beta", "alpha-2", "alpha-1"] {
            registry.create_queue(name, &HashMap::new()).await.unwrap();
        }
        assert_eq!(
            registry.list_queues(Some("alpha")).await,
            vec!["alpha-1", "alpha-2"]
        );
        assert_eq!(registry.list_queues(None).await.len(), 3);
        registry.reset().await;
        assert!(registry.list_queues(None).await.is_empty());
    }

    #[tokio::test]
    async fn operations_on_missing_queue_fail() {
        let registry = QueueRegistry::new();
        let cancel = CancellationToken::new();
        assert!(matches!(
            registry.send_message("ghost", SendParams::new("x")).await,
            Err(SqsError::QueueNotFound(_))
        ));
        assert!(matches!(
            registry
                .receive_message("ghost", ReceiveParams::default(), &cancel)
                .await,
            Err(SqsError::QueueNotFound(_))
        ));
        assert!(matches!(
            registry.purge_queue("ghost").await,
            Err(SqsError::QueueNotFound(_))
        ));
        assert!(matches!(
            registry.delete_queue("ghost").await,
            Err(SqsError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn receive_rejects_out_of_range_parameters() {
        let registry = registry_with("bounds", &[]).await;
        let cancel = CancellationToken::new();
        for params in [
            ReceiveParams {
                max_messages: Some(0),
                ..Default::default()
            },
            ReceiveParams {
                max_messages: Some(11),
                ..Default::default()
            },
            ReceiveParams {
                wait_time_seconds: Some(21),
                ..Default::default()
            },
        ] {
            assert!(matches!(
                registry.receive_message("bounds", params, &cancel).await,
                Err(SqsError::InvalidParameterValue(_))
            ));
        }
    }

    #[tokio::test]
    async fn purge_empties_queue_but_keeps_config() {
        let registry = registry_with("purge-me", &[("VisibilityTimeout", "45")]).await;
        registry
            .send_message("purge-me", SendParams::new("x"))
            .await
            .unwrap();
        registry.purge_queue("purge-me").await.unwrap();
        let attrs = registry.get_queue_attributes("purge-me").await.unwrap();
        assert_eq!(attrs["ApproximateNumberOfMessages"], "0");
        assert_eq!(attrs["VisibilityTimeout"], "45");
    }
}
