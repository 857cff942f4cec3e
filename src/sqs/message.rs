use std::collections::HashMap;
use std::time::Instant;

use md5::{Digest as Md5Digest, Md5};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MessageAttributeValue {
    pub data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary_value: Option<String>,
}

pub fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn decode_binary(encoded: &str) -> Vec<u8> {
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
        .unwrap_or_default()
}

/// Bytes the attributes add to a message: every name, data type and value.
pub fn attributes_size(attrs: &HashMap<String, MessageAttributeValue>) -> usize {
    attrs
        .iter()
        .map(|(name, attr)| {
            let value = match attr.binary_value {
                Some(ref encoded) => decode_binary(encoded).len(),
                None => attr.string_value.as_ref().map_or(0, String::len),
            };
            name.len() + attr.data_type.len() + value
        })
        .sum()
}

/// MD5 over message attributes using the SQS encoding: attributes sorted by
/// name, each field length-prefixed, transport byte 1 for strings and numbers,
/// 2 for binary.
pub fn md5_of_attributes(attrs: &HashMap<String, MessageAttributeValue>) -> Option<String> {
    if attrs.is_empty() {
        return None;
    }
    let mut names: Vec<&String> = attrs.keys().collect();
    names.sort();

    let mut buf: Vec<u8> = Vec::new();
    for name in names {
        let attr = &attrs[name];
        push_len_prefixed(&mut buf, name.as_bytes());
        push_len_prefixed(&mut buf, attr.data_type.as_bytes());

        if attr.data_type.starts_with("Binary") {
            buf.push(2);
            if let Some(ref encoded) = attr.binary_value {
                push_len_prefixed(&mut buf, &decode_binary(encoded));
            }
        } else {
            buf.push(1);
            if let Some(ref value) = attr.string_value {
                push_len_prefixed(&mut buf, value.as_bytes());
            }
        }
    }

    Some(md5_hex(&buf))
}

/// Caller-supplied parameters of a send.
#[derive(Debug, Clone, Default)]
pub struct SendParams {
    pub body: String,
    pub delay_seconds: Option<u32>,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
    pub attributes: HashMap<String, MessageAttributeValue>,
}

impl SendParams {
    pub fn new(body: impl Into<String>) -> Self {
        SendParams {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_dedup_id(mut self, dedup_id: impl Into<String>) -> Self {
        self.dedup_id = Some(dedup_id.into());
        self
    }

    pub fn with_delay(mut self, seconds: u32) -> Self {
        self.delay_seconds = Some(seconds);
        self
    }
}

/// Result of a send. A deduplicated send hands back the receipt of the
/// original message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub md5_of_body: String,
    pub md5_of_message_attributes: Option<String>,
    pub sequence_number: Option<String>,
}

/// One delivery handed to a receiver.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub md5_of_body: String,
    pub md5_of_message_attributes: Option<String>,
    pub attributes: HashMap<String, String>,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub body: String,
    pub md5_of_body: String,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    pub md5_of_message_attributes: Option<String>,
    pub enqueued_at: Instant,
    pub sent_timestamp: i64,
    pub visible_after: Instant,
    /// `None` while the message is visible.
    pub invisible_until: Option<Instant>,
    pub receipt_handle: Option<String>,
    pub receive_count: u32,
    pub first_receive_timestamp: Option<i64>,
    pub group_id: Option<String>,
    pub dedup_id: Option<String>,
    pub sequence_number: Option<String>,
}

impl Message {
    pub fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_after && self.invisible_until.map_or(true, |until| now >= until)
    }

    pub fn is_inflight(&self) -> bool {
        self.receipt_handle.is_some()
    }

    pub(crate) fn make_visible(&mut self) {
        self.invisible_until = None;
        self.receipt_handle = None;
    }

    pub(crate) fn system_attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("SentTimestamp".into(), self.sent_timestamp.to_string());
        attrs.insert("ApproximateReceiveCount".into(), self.receive_count.to_string());
        if let Some(ts) = self.first_receive_timestamp {
            attrs.insert("ApproximateFirstReceiveTimestamp".into(), ts.to_string());
        }
        if let Some(ref gid) = self.group_id {
            attrs.insert("MessageGroupId".into(), gid.clone());
        }
        if let Some(ref did) = self.dedup_id {
            attrs.insert("MessageDeduplicationId".into(), did.clone());
        }
        if let Some(ref seq) = self.sequence_number {
            attrs.insert("SequenceNumber".into(), seq.clone());
        }
        attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_of_body_matches_known_digest() {
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn string_attributes_are_sorted_by_name() {
        let mut attrs = HashMap::new();
        attrs.insert(
            "b".to_string(),
            MessageAttributeValue {
                data_type: "String".into(),
                string_value: Some("2".into()),
                binary_value: None,
            },
        );
        attrs.insert(
            "a".to_string(),
            MessageAttributeValue {
                data_type: "Number".into(),
                string_value: Some("1".into()),
                binary_value: None,
            },
        );
        let mut expected = Vec::new();
        push_len_prefixed(&mut expected, b"a");
        push_len_prefixed(&mut expected, b"Number");
        expected.push(1);
        push_len_prefixed(&mut expected, b"1");
        push_len_prefixed(&mut expected, b"b");
        push_len_prefixed(&mut expected, b"String");
        expected.push(1);
        push_len_prefixed(&mut expected, b"2");
        assert_eq!(md5_of_attributes(&attrs), Some(md5_hex(&expected)));
        assert!(md5_of_attributes(&HashMap::new()).is_none());
    }

    #[test]
    fn attribute_size_counts_names_types_and_decoded_values() {
        let mut attrs = HashMap::new();
        attrs.insert(
            "k".to_string(),
            MessageAttributeValue {
                data_type: "String".into(),
                string_value: Some("abc".into()),
                binary_value: None,
            },
        );
        attrs.insert(
            "blob".to_string(),
            MessageAttributeValue {
                data_type: "Binary".into(),
                string_value: None,
                binary_value: Some("aGVsbG8=".into()),
            },
        );
        assert_eq!(attributes_size(&attrs), (1 + 6 + 3) + (4 + 6 + 5));
        assert_eq!(attributes_size(&HashMap::new()), 0);
    }

    #[test]
    fn binary_attributes_hash_decoded_bytes() {
        let mut attrs = HashMap::new();
        attrs.insert(
            "blob".to_string(),
            MessageAttributeValue {
                data_type: "Binary".into(),
                string_value: None,
                binary_value: Some("aGVsbG8=".into()),
            },
        );
        let mut expected = Vec::new();
        push_len_prefixed(&mut expected, b"blob");
        push_len_prefixed(&mut expected, b"Binary");
        expected.push(2);
        push_len_prefixed(&mut expected, b"hello");
        assert_eq!(md5_of_attributes(&attrs), Some(md5_hex(&expected)));
    }
}
