use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use super::error::SqsError;
use super::message::{
    attributes_size, md5_hex, md5_of_attributes, sha256_hex, Message, ReceivedMessage, SendParams,
    SendReceipt,
};

pub const DEDUP_WINDOW: Duration = Duration::from_secs(300);
pub const MAX_VISIBILITY_TIMEOUT: u32 = 43_200;
pub const MAX_DELAY_SECONDS: u32 = 900;
pub const MAX_WAIT_TIME_SECONDS: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    pub max_receive_count: u32,
}

impl RedrivePolicy {
    pub fn from_json(s: &str) -> Result<Self, SqsError> {
        let v: serde_json::Value = serde_json::from_str(s).map_err(|e| {
            SqsError::InvalidAttributeValue(format!("Invalid RedrivePolicy JSON: {e}"))
        })?;
        let arn = v
            .get("deadLetterTargetArn")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                SqsError::InvalidAttributeValue(
                    "RedrivePolicy must contain deadLetterTargetArn".into(),
                )
            })?
            .to_string();
        let max_count = v
            .get("maxReceiveCount")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .ok_or_else(|| {
                SqsError::InvalidAttributeValue("RedrivePolicy must contain maxReceiveCount".into())
            })?;
        if !(1..=1000).contains(&max_count) {
            return Err(SqsError::InvalidAttributeValue(
                "maxReceiveCount must be between 1 and 1000".into(),
            ));
        }
        Ok(RedrivePolicy {
            dead_letter_target_arn: arn,
            max_receive_count: max_count as u32,
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "deadLetterTargetArn": self.dead_letter_target_arn,
            "maxReceiveCount": self.max_receive_count,
        })
        .to_string()
    }

    /// Queue name of the dead-letter target, taken from the last ARN segment.
    pub fn target_queue_name(&self) -> &str {
        self.dead_letter_target_arn
            .rsplit(':')
            .next()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueAttributes {
    pub visibility_timeout: u32,
    pub delay_seconds: u32,
    pub receive_message_wait_time_seconds: u32,
    pub maximum_message_size: u32,
    pub message_retention_period: u32,
    pub fifo_queue: bool,
    pub content_based_deduplication: bool,
    pub redrive_policy: Option<RedrivePolicy>,
}

impl Default for QueueAttributes {
    fn default() -> Self {
        QueueAttributes {
            visibility_timeout: 30,
            delay_seconds: 0,
            receive_message_wait_time_seconds: 0,
            maximum_message_size: 262_144,
            message_retention_period: 345_600,
            fifo_queue: false,
            content_based_deduplication: false,
            redrive_policy: None,
        }
    }
}

fn parse_bounded(key: &str, value: &str, min: u32, max: u32) -> Result<u32, SqsError> {
    let v: u32 = value
        .trim()
        .parse()
        .map_err(|_| SqsError::InvalidAttributeValue(format!("Invalid {key}: {value}")))?;
    if !(min..=max).contains(&v) {
        return Err(SqsError::InvalidAttributeValue(format!(
            "{key} must be between {min} and {max}"
        )));
    }
    Ok(v)
}

fn parse_flag(key: &str, value: &str) -> Result<bool, SqsError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(SqsError::InvalidAttributeValue(format!("Invalid {key}: {value}"))),
    }
}

impl QueueAttributes {
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("VisibilityTimeout".into(), self.visibility_timeout.to_string());
        m.insert("DelaySeconds".into(), self.delay_seconds.to_string());
        m.insert(
            "ReceiveMessageWaitTimeSeconds".into(),
            self.receive_message_wait_time_seconds.to_string(),
        );
        m.insert("MaximumMessageSize".into(), self.maximum_message_size.to_string());
        m.insert(
            "MessageRetentionPeriod".into(),
            self.message_retention_period.to_string(),
        );
        if let Some(ref rp) = self.redrive_policy {
            m.insert("RedrivePolicy".into(), rp.to_json());
        }
        if self.fifo_queue {
            m.insert("FifoQueue".into(), "true".into());
            m.insert(
                "ContentBasedDeduplication".into(),
                self.content_based_deduplication.to_string(),
            );
        }
        m
    }

    pub fn apply(&mut self, attrs: &HashMap<String, String>) -> Result<(), SqsError> {
        for (key, value) in attrs {
            match key.as_str() {
                "VisibilityTimeout" => {
                    self.visibility_timeout = parse_bounded(key, value, 0, MAX_VISIBILITY_TIMEOUT)?;
                }
                "DelaySeconds" => {
                    self.delay_seconds = parse_bounded(key, value, 0, MAX_DELAY_SECONDS)?;
                }
                "ReceiveMessageWaitTimeSeconds" => {
                    self.receive_message_wait_time_seconds =
                        parse_bounded(key, value, 0, MAX_WAIT_TIME_SECONDS)?;
                }
                "MaximumMessageSize" => {
                    self.maximum_message_size = parse_bounded(key, value, 1024, 262_144)?;
                }
                "MessageRetentionPeriod" => {
                    self.message_retention_period = parse_bounded(key, value, 60, 1_209_600)?;
                }
                "RedrivePolicy" => {
                    self.redrive_policy = if value.is_empty() {
                        None
                    } else {
                        Some(RedrivePolicy::from_json(value)?)
                    };
                }
                "FifoQueue" => {
                    self.fifo_queue = parse_flag(key, value)?;
                }
                "ContentBasedDeduplication" => {
                    self.content_based_deduplication = parse_flag(key, value)?;
                }
                _ => {
                    return Err(SqsError::InvalidAttributeName(format!(
                        "Unknown Attribute {key}."
                    )));
                }
            }
        }
        if self.content_based_deduplication && !self.fifo_queue {
            return Err(SqsError::InvalidAttributeName(
                "ContentBasedDeduplication is only valid for FIFO queues".into(),
            ));
        }
        Ok(())
    }
}

struct DedupEntry {
    receipt: SendReceipt,
    recorded_at: Instant,
}

pub struct Queue {
    pub name: String,
    pub attributes: QueueAttributes,
    pub created_at: i64,
    pub last_modified: i64,
    messages: Vec<Message>,
    dedup_window: HashMap<String, DedupEntry>,
    // group id -> id of the message holding the group
    locked_groups: HashMap<String, String>,
    sequence_counter: u64,
    deleted: bool,
}

fn release_group(locked_groups: &mut HashMap<String, String>, msg: &Message) {
    if let Some(ref gid) = msg.group_id {
        if locked_groups.get(gid) == Some(&msg.message_id) {
            locked_groups.remove(gid);
        }
    }
}

impl Queue {
    pub fn new(name: String, attributes: QueueAttributes) -> Self {
        let now = chrono::Utc::now().timestamp();
        Queue {
            name,
            attributes,
            created_at: now,
            last_modified: now,
            messages: Vec::new(),
            dedup_window: HashMap::new(),
            locked_groups: HashMap::new(),
            sequence_counter: 0,
            deleted: false,
        }
    }

    pub fn is_fifo(&self) -> bool {
        self.attributes.fifo_queue
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Detaches the queue from service. Every outstanding receipt handle
    /// becomes invalid and any waiter sees the queue as gone.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.purge();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_group_locked(&self, group_id: &str) -> bool {
        self.locked_groups.contains_key(group_id)
    }

    pub fn send(&mut self, params: SendParams, now: Instant) -> Result<SendReceipt, SqsError> {
        let SendParams {
            body,
            delay_seconds,
            group_id,
            dedup_id,
            attributes,
        } = params;

        if body.is_empty() {
            return Err(SqsError::MissingParameter(
                "The request must contain the parameter MessageBody.".into(),
            ));
        }
        let size = body.len() + attributes_size(&attributes);
        if size > self.attributes.maximum_message_size as usize {
            return Err(SqsError::InvalidParameterValue(format!(
                "Message must be shorter than {} bytes.",
                self.attributes.maximum_message_size
            )));
        }
        if delay_seconds.is_some_and(|d| d > MAX_DELAY_SECONDS) {
            return Err(SqsError::InvalidParameterValue(format!(
                "DelaySeconds must be between 0 and {MAX_DELAY_SECONDS}"
            )));
        }

        let dedup_id = if self.is_fifo() {
            if group_id.is_none() {
                return Err(SqsError::MissingParameter(
                    "The request must contain the parameter MessageGroupId.".into(),
                ));
            }
            if delay_seconds.is_some_and(|d| d > 0) {
                return Err(SqsError::InvalidParameterValue(
                    "FIFO queues don't support per-message delays, only per-queue delays".into(),
                ));
            }
            match dedup_id {
                Some(id) => Some(id),
                None if self.attributes.content_based_deduplication => {
                    Some(sha256_hex(body.as_bytes()))
                }
                None => {
                    return Err(SqsError::InvalidParameterValue(
                        "The queue should either have ContentBasedDeduplication enabled or MessageDeduplicationId provided explicitly".into(),
                    ));
                }
            }
        } else {
            None
        };

        self.dedup_window
            .retain(|_, entry| now.saturating_duration_since(entry.recorded_at) < DEDUP_WINDOW);
        if let Some(ref id) = dedup_id {
            if let Some(entry) = self.dedup_window.get(id) {
                debug!(queue = %self.name, dedup_id = %id, "Duplicate send suppressed");
                return Ok(entry.receipt.clone());
            }
        }

        let sequence_number = if self.is_fifo() {
            self.sequence_counter += 1;
            Some(format!("{:020}", self.sequence_counter))
        } else {
            None
        };

        let delay = delay_seconds.unwrap_or(self.attributes.delay_seconds);
        let md5_of_message_attributes = md5_of_attributes(&attributes);
        let receipt = SendReceipt {
            message_id: Uuid::new_v4().to_string(),
            md5_of_body: md5_hex(body.as_bytes()),
            md5_of_message_attributes: md5_of_message_attributes.clone(),
            sequence_number: sequence_number.clone(),
        };

        self.messages.push(Message {
            message_id: receipt.message_id.clone(),
            body,
            md5_of_body: receipt.md5_of_body.clone(),
            message_attributes: attributes,
            md5_of_message_attributes,
            enqueued_at: now,
            sent_timestamp: chrono::Utc::now().timestamp_millis(),
            visible_after: now + Duration::from_secs(delay as u64),
            invisible_until: None,
            receipt_handle: None,
            receive_count: 0,
            first_receive_timestamp: None,
            group_id,
            dedup_id: dedup_id.clone(),
            sequence_number,
        });

        if let Some(id) = dedup_id {
            self.dedup_window.insert(
                id,
                DedupEntry {
                    receipt: receipt.clone(),
                    recorded_at: now,
                },
            );
        }

        debug!(queue = %self.name, message_id = %receipt.message_id, delay, "Message enqueued");
        Ok(receipt)
    }

    /// Applies every time-based transition due at `now`: in-flight messages
    /// whose visibility timeout ran out become visible again and release their
    /// group, and messages past the retention period are dropped.
    ///
    /// Returns the visible messages that exhausted the redrive policy's
    /// receive count; they are no longer part of this queue.
    pub fn expire(&mut self, now: Instant) -> Vec<Message> {
        self.expire_with_redrive(now, true)
    }

    /// Same as [`Queue::expire`], but with `redrive` off exhausted messages
    /// stay in this queue and remain deliverable.
    pub fn expire_with_redrive(&mut self, now: Instant, redrive: bool) -> Vec<Message> {
        let retention = Duration::from_secs(self.attributes.message_retention_period as u64);
        let max_receives = self
            .attributes
            .redrive_policy
            .as_ref()
            .map(|rp| rp.max_receive_count)
            .filter(|_| redrive);

        let mut dead_letters = Vec::new();
        let mut kept = Vec::with_capacity(self.messages.len());
        for mut msg in std::mem::take(&mut self.messages) {
            if msg.invisible_until.is_some_and(|until| now >= until) {
                release_group(&mut self.locked_groups, &msg);
                msg.make_visible();
            }
            // Covers messages returned early through a zero visibility timeout.
            if !msg.is_inflight() && max_receives.is_some_and(|max| msg.receive_count >= max) {
                release_group(&mut self.locked_groups, &msg);
                dead_letters.push(msg);
                continue;
            }
            if !msg.is_inflight() && now.saturating_duration_since(msg.enqueued_at) >= retention {
                release_group(&mut self.locked_groups, &msg);
                debug!(queue = %self.name, message_id = %msg.message_id, "Message retention expired");
                continue;
            }
            kept.push(msg);
        }
        self.messages = kept;
        dead_letters
    }

    /// Takes up to `max` eligible messages in arrival order and marks them in
    /// flight. On FIFO queues at most one message per group is handed out,
    /// and a group's later messages wait behind its earliest one.
    pub fn receive(
        &mut self,
        max: usize,
        visibility_timeout: Option<u32>,
        now: Instant,
    ) -> Vec<ReceivedMessage> {
        let timeout = Duration::from_secs(
            visibility_timeout.unwrap_or(self.attributes.visibility_timeout) as u64,
        );
        let fifo = self.is_fifo();
        let received_at = chrono::Utc::now().timestamp_millis();
        let mut seen_groups: HashSet<String> = HashSet::new();
        let mut batch = Vec::new();

        for msg in self.messages.iter_mut() {
            if batch.len() >= max {
                break;
            }
            if fifo {
                if let Some(ref gid) = msg.group_id {
                    if !seen_groups.insert(gid.clone()) {
                        continue;
                    }
                    if let Some(owner) = self.locked_groups.get(gid) {
                        if owner != &msg.message_id {
                            continue;
                        }
                    }
                }
            }
            if !msg.is_visible(now) {
                continue;
            }

            let handle = Uuid::new_v4().to_string();
            msg.receipt_handle = Some(handle.clone());
            msg.invisible_until = Some(now + timeout);
            msg.receive_count += 1;
            msg.first_receive_timestamp.get_or_insert(received_at);
            if fifo {
                if let Some(ref gid) = msg.group_id {
                    self.locked_groups.insert(gid.clone(), msg.message_id.clone());
                }
            }

            batch.push(ReceivedMessage {
                message_id: msg.message_id.clone(),
                receipt_handle: handle,
                body: msg.body.clone(),
                md5_of_body: msg.md5_of_body.clone(),
                md5_of_message_attributes: msg.md5_of_message_attributes.clone(),
                attributes: msg.system_attributes(),
                message_attributes: msg.message_attributes.clone(),
            });
        }

        if !batch.is_empty() {
            debug!(queue = %self.name, count = batch.len(), "Messages received");
        }
        batch
    }

    fn position_of_handle(&self, receipt_handle: &str, now: Instant) -> Option<usize> {
        self.messages.iter().position(|m| {
            m.receipt_handle.as_deref() == Some(receipt_handle)
                && m.invisible_until.is_some_and(|until| now < until)
        })
    }

    pub fn delete_message(&mut self, receipt_handle: &str, now: Instant) -> Result<(), SqsError> {
        let idx = self.position_of_handle(receipt_handle, now).ok_or_else(|| {
            SqsError::MessageDoesNotExist("The specified message does not exist.".into())
        })?;
        let msg = self.messages.remove(idx);
        release_group(&mut self.locked_groups, &msg);
        if let Some(ref did) = msg.dedup_id {
            if self
                .dedup_window
                .get(did)
                .is_some_and(|entry| entry.receipt.message_id == msg.message_id)
            {
                self.dedup_window.remove(did);
            }
        }
        debug!(queue = %self.name, message_id = %msg.message_id, "Message deleted");
        Ok(())
    }

    /// A timeout of zero makes the message visible at once. Its FIFO group
    /// stays held by it, so no other message of the group overtakes it.
    pub fn change_visibility(
        &mut self,
        receipt_handle: &str,
        timeout: u32,
        now: Instant,
    ) -> Result<(), SqsError> {
        if timeout > MAX_VISIBILITY_TIMEOUT {
            return Err(SqsError::InvalidParameterValue(format!(
                "VisibilityTimeout must be between 0 and {MAX_VISIBILITY_TIMEOUT}"
            )));
        }
        let idx = self.position_of_handle(receipt_handle, now).ok_or_else(|| {
            SqsError::MessageDoesNotExist("The specified message does not exist.".into())
        })?;
        let msg = &mut self.messages[idx];
        if timeout == 0 {
            msg.make_visible();
        } else {
            msg.invisible_until = Some(now + Duration::from_secs(timeout as u64));
        }
        debug!(queue = %self.name, message_id = %msg.message_id, timeout, "Visibility changed");
        Ok(())
    }

    pub fn purge(&mut self) {
        self.messages.clear();
        self.dedup_window.clear();
        self.locked_groups.clear();
    }

    /// Puts back messages taken out by expiry that could not be redriven,
    /// keeping arrival order.
    pub fn restore(&mut self, messages: Vec<Message>) {
        for msg in messages {
            let idx = self
                .messages
                .iter()
                .position(|m| m.enqueued_at > msg.enqueued_at)
                .unwrap_or(self.messages.len());
            self.messages.insert(idx, msg);
        }
    }

    /// Appends a message redriven from another queue as a fresh, visible entry.
    pub fn accept_dead_letter(&mut self, mut msg: Message, now: Instant) {
        msg.make_visible();
        msg.visible_after = now;
        if msg.group_id.is_some() && self.is_fifo() {
            self.sequence_counter += 1;
            msg.sequence_number = Some(format!("{:020}", self.sequence_counter));
        }
        self.messages.push(msg);
    }

    pub fn attribute_map(&self, now: Instant) -> HashMap<String, String> {
        let mut visible = 0usize;
        let mut not_visible = 0usize;
        let mut delayed = 0usize;
        for msg in &self.messages {
            if msg.is_inflight() {
                not_visible += 1;
            } else if now < msg.visible_after {
                delayed += 1;
            } else {
                visible += 1;
            }
        }

        let mut m = self.attributes.to_map();
        m.insert("ApproximateNumberOfMessages".into(), visible.to_string());
        m.insert(
            "ApproximateNumberOfMessagesNotVisible".into(),
            not_visible.to_string(),
        );
        m.insert("ApproximateNumberOfMessagesDelayed".into(), delayed.to_string());
        m.insert("CreatedTimestamp".into(), self.created_at.to_string());
        m.insert("LastModifiedTimestamp".into(), self.last_modified.to_string());
        m
    }

    pub fn set_attributes(&mut self, attrs: &HashMap<String, String>) -> Result<(), SqsError> {
        if attrs.contains_key("FifoQueue") {
            return Err(SqsError::InvalidAttributeName(
                "FifoQueue cannot be changed after creation".into(),
            ));
        }
        let mut updated = self.attributes.clone();
        updated.apply(attrs)?;
        self.attributes = updated;
        self.last_modified = chrono::Utc::now().timestamp();
        Ok(())
    }
}
