//! Form-encoded query protocol: `Action=...` bodies in, XML documents out.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write as _;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use quick_xml::escape::escape;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::SqsError;
use super::state::SqsState;
use super::types::*;

const NS: &str = "http://queue.amazonaws.com/doc/2012-11-05/";

// ── form parsing helpers ───────────────────────────────────────────────

type Params = HashMap<String, String>;

pub fn parse_form(body: &str) -> Params {
    form_urlencoded::parse(body.as_bytes()).into_owned().collect()
}

fn require(params: &Params, key: &str) -> Result<String, SqsError> {
    params.get(key).cloned().ok_or_else(|| {
        SqsError::MissingParameter(format!("The request must contain the parameter {key}."))
    })
}

fn int_param(params: &Params, key: &str) -> Result<Option<i64>, SqsError> {
    params
        .get(key)
        .map(|v| {
            v.trim().parse::<i64>().map_err(|_| {
                SqsError::InvalidParameterValue(format!(
                    "Value {v} for parameter {key} is invalid."
                ))
            })
        })
        .transpose()
}

/// `Prefix.N` values, in index order.
fn parse_string_list(params: &Params, prefix: &str) -> Option<Vec<String>> {
    let mut items = Vec::new();
    for i in 1.. {
        match params.get(&format!("{prefix}.{i}")) {
            Some(v) => items.push(v.clone()),
            None => break,
        }
    }
    (!items.is_empty()).then_some(items)
}

/// `Prefix.N.Name` / `Prefix.N.Value` pairs.
fn parse_attributes(params: &Params, prefix: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for i in 1.. {
        let name = params.get(&format!("{prefix}.{i}.Name"));
        let value = params.get(&format!("{prefix}.{i}.Value"));
        match (name, value) {
            (Some(n), Some(v)) => {
                map.insert(n.clone(), v.clone());
            }
            _ => break,
        }
    }
    map
}

/// `Prefix.N.Name` with `Prefix.N.Value.DataType` / `.StringValue` / `.BinaryValue`.
fn parse_message_attributes(
    params: &Params,
    prefix: &str,
) -> Option<HashMap<String, MessageAttributeValue>> {
    let mut map = HashMap::new();
    for i in 1.. {
        let Some(name) = params.get(&format!("{prefix}.{i}.Name")) else {
            break;
        };
        let value = MessageAttributeValue {
            data_type: params
                .get(&format!("{prefix}.{i}.Value.DataType"))
                .cloned()
                .unwrap_or_else(|| "String".into()),
            string_value: params.get(&format!("{prefix}.{i}.Value.StringValue")).cloned(),
            binary_value: params.get(&format!("{prefix}.{i}.Value.BinaryValue")).cloned(),
        };
        map.insert(name.clone(), value);
    }
    (!map.is_empty()).then_some(map)
}

/// Indices `1..` for which `Prefix.N.Id` is present.
fn batch_indices(params: &Params, prefix: &str) -> Vec<usize> {
    (1..)
        .take_while(|i| params.contains_key(&format!("{prefix}.{i}.Id")))
        .collect()
}

fn send_batch_entries(params: &Params) -> Result<Vec<SendMessageBatchEntry>, SqsError> {
    const P: &str = "SendMessageBatchRequestEntry";
    batch_indices(params, P)
        .into_iter()
        .map(|i| -> Result<SendMessageBatchEntry, SqsError> {
            let key = |field: &str| format!("{P}.{i}.{field}");
            Ok(SendMessageBatchEntry {
                id: require(params, &key("Id"))?,
                message_body: params.get(&key("MessageBody")).cloned().unwrap_or_default(),
                delay_seconds: int_param(params, &key("DelaySeconds"))?,
                message_attributes: parse_message_attributes(params, &key("MessageAttribute")),
                message_deduplication_id: params.get(&key("MessageDeduplicationId")).cloned(),
                message_group_id: params.get(&key("MessageGroupId")).cloned(),
            })
        })
        .collect()
}

fn delete_batch_entries(params: &Params) -> Result<Vec<DeleteMessageBatchEntry>, SqsError> {
    const P: &str = "DeleteMessageBatchRequestEntry";
    batch_indices(params, P)
        .into_iter()
        .map(|i| -> Result<DeleteMessageBatchEntry, SqsError> {
            Ok(DeleteMessageBatchEntry {
                id: require(params, &format!("{P}.{i}.Id"))?,
                receipt_handle: require(params, &format!("{P}.{i}.ReceiptHandle"))?,
            })
        })
        .collect()
}

fn visibility_batch_entries(
    params: &Params,
) -> Result<Vec<ChangeMessageVisibilityBatchEntry>, SqsError> {
    const P: &str = "ChangeMessageVisibilityBatchRequestEntry";
    batch_indices(params, P)
        .into_iter()
        .map(|i| -> Result<ChangeMessageVisibilityBatchEntry, SqsError> {
            let timeout_key = format!("{P}.{i}.VisibilityTimeout");
            Ok(ChangeMessageVisibilityBatchEntry {
                id: require(params, &format!("{P}.{i}.Id"))?,
                receipt_handle: require(params, &format!("{P}.{i}.ReceiptHandle"))?,
                visibility_timeout: int_param(params, &timeout_key)?.ok_or_else(|| {
                    SqsError::MissingParameter(format!(
                        "The request must contain the parameter {timeout_key}."
                    ))
                })?,
            })
        })
        .collect()
}

// ── XML response helpers ───────────────────────────────────────────────

fn esc(s: &str) -> Cow<'_, str> {
    escape(s)
}

fn xml_ok(action: &str, result_body: &str) -> Response {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<{action}Response xmlns="{NS}">
  <{action}Result>
{result_body}
  </{action}Result>
  <ResponseMetadata>
    <RequestId>{rid}</RequestId>
  </ResponseMetadata>
</{action}Response>"#,
        rid = Uuid::new_v4(),
    );
    (StatusCode::OK, [("content-type", "text/xml")], xml).into_response()
}

fn xml_empty(action: &str) -> Response {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<{action}Response xmlns="{NS}">
  <ResponseMetadata>
    <RequestId>{rid}</RequestId>
  </ResponseMetadata>
</{action}Response>"#,
        rid = Uuid::new_v4(),
    );
    (StatusCode::OK, [("content-type", "text/xml")], xml).into_response()
}

fn optional_element(xml: &mut String, tag: &str, value: Option<&str>) {
    if let Some(v) = value {
        let _ = write!(xml, "<{tag}>{}</{tag}>", esc(v));
    }
}

fn name_value_xml(xml: &mut String, tag: &str, attrs: &HashMap<String, String>) {
    let mut keys: Vec<&String> = attrs.keys().collect();
    keys.sort();
    for key in keys {
        let _ = write!(
            xml,
            "    <{tag}><Name>{}</Name><Value>{}</Value></{tag}>\n",
            esc(key),
            esc(&attrs[key]),
        );
    }
}

fn message_attributes_xml(xml: &mut String, attrs: &HashMap<String, MessageAttributeValue>) {
    let mut keys: Vec<&String> = attrs.keys().collect();
    keys.sort();
    for key in keys {
        let attr = &attrs[key];
        let _ = write!(
            xml,
            "    <MessageAttribute><Name>{}</Name><Value><DataType>{}</DataType>",
            esc(key),
            esc(&attr.data_type),
        );
        optional_element(xml, "StringValue", attr.string_value.as_deref());
        optional_element(xml, "BinaryValue", attr.binary_value.as_deref());
        xml.push_str("</Value></MessageAttribute>\n");
    }
}

fn batch_errors_xml(xml: &mut String, failed: &[BatchResultErrorEntry]) {
    for f in failed {
        let _ = write!(
            xml,
            "    <BatchResultErrorEntry><Id>{}</Id><Code>{}</Code><Message>{}</Message><SenderFault>{}</SenderFault></BatchResultErrorEntry>\n",
            esc(&f.id),
            f.code,
            esc(&f.message),
            f.sender_fault,
        );
    }
}

fn id_entries_xml(xml: &mut String, tag: &str, successful: &[BatchResultEntry]) {
    for s in successful {
        let _ = write!(xml, "    <{tag}><Id>{}</Id></{tag}>\n", esc(&s.id));
    }
}

// ── dispatch ───────────────────────────────────────────────────────────

/// Serves one query-protocol request. `path_queue_url` is the queue URL
/// implied by the request path, used when the form carries no `QueueUrl`.
pub async fn handle_query(
    state: &SqsState,
    path_queue_url: Option<String>,
    body: &str,
    cancel: &CancellationToken,
) -> Response {
    let params = parse_form(body);
    match dispatch(state, path_queue_url, &params, cancel).await {
        Ok(resp) => resp,
        Err(err) => err.into_xml_response(),
    }
}

async fn dispatch(
    state: &SqsState,
    path_queue_url: Option<String>,
    params: &Params,
    cancel: &CancellationToken,
) -> Result<Response, SqsError> {
    let action = params
        .get("Action")
        .ok_or_else(|| SqsError::MissingParameter("Missing Action parameter".into()))?;
    let queue_url = || {
        params
            .get("QueueUrl")
            .cloned()
            .or_else(|| path_queue_url.clone())
            .ok_or_else(|| {
                SqsError::MissingParameter(
                    "The request must contain the parameter QueueUrl.".into(),
                )
            })
    };

    match action.as_str() {
        "CreateQueue" => {
            let attributes = parse_attributes(params, "Attribute");
            let resp = state
                .create_queue(CreateQueueRequest {
                    queue_name: require(params, "QueueName")?,
                    attributes: (!attributes.is_empty()).then_some(attributes),
                })
                .await?;
            Ok(xml_ok(
                action,
                &format!("    <QueueUrl>{}</QueueUrl>", esc(&resp.queue_url)),
            ))
        }
        "DeleteQueue" => {
            state
                .delete_queue(DeleteQueueRequest {
                    queue_url: queue_url()?,
                })
                .await?;
            Ok(xml_empty(action))
        }
        "GetQueueUrl" => {
            let resp = state
                .get_queue_url(GetQueueUrlRequest {
                    queue_name: require(params, "QueueName")?,
                })
                .await?;
            Ok(xml_ok(
                action,
                &format!("    <QueueUrl>{}</QueueUrl>", esc(&resp.queue_url)),
            ))
        }
        "ListQueues" => {
            let resp = state
                .list_queues(ListQueuesRequest {
                    queue_name_prefix: params.get("QueueNamePrefix").cloned(),
                    max_results: int_param(params, "MaxResults")?,
                    next_token: params.get("NextToken").cloned(),
                })
                .await?;
            let mut xml = String::new();
            for url in resp.queue_urls.unwrap_or_default() {
                let _ = writeln!(xml, "    <QueueUrl>{}</QueueUrl>", esc(&url));
            }
            optional_element(&mut xml, "NextToken", resp.next_token.as_deref());
            Ok(xml_ok(action, xml.trim_end()))
        }
        "GetQueueAttributes" => {
            let resp = state
                .get_queue_attributes(GetQueueAttributesRequest {
                    queue_url: queue_url()?,
                    attribute_names: parse_string_list(params, "AttributeName"),
                })
                .await?;
            let mut xml = String::new();
            name_value_xml(&mut xml, "Attribute", &resp.attributes);
            Ok(xml_ok(action, xml.trim_end()))
        }
        "SetQueueAttributes" => {
            state
                .set_queue_attributes(SetQueueAttributesRequest {
                    queue_url: queue_url()?,
                    attributes: parse_attributes(params, "Attribute"),
                })
                .await?;
            Ok(xml_empty(action))
        }
        "PurgeQueue" => {
            state
                .purge_queue(PurgeQueueRequest {
                    queue_url: queue_url()?,
                })
                .await?;
            Ok(xml_empty(action))
        }
        "SendMessage" => {
            let resp = state
                .send_message(SendMessageRequest {
                    queue_url: queue_url()?,
                    message_body: require(params, "MessageBody")?,
                    delay_seconds: int_param(params, "DelaySeconds")?,
                    message_attributes: parse_message_attributes(params, "MessageAttribute"),
                    message_deduplication_id: params.get("MessageDeduplicationId").cloned(),
                    message_group_id: params.get("MessageGroupId").cloned(),
                })
                .await?;
            let mut xml = String::from("    ");
            let _ = write!(
                xml,
                "<MessageId>{}</MessageId><MD5OfMessageBody>{}</MD5OfMessageBody>",
                resp.message_id, resp.md5_of_message_body
            );
            optional_element(
                &mut xml,
                "MD5OfMessageAttributes",
                resp.md5_of_message_attributes.as_deref(),
            );
            optional_element(&mut xml, "SequenceNumber", resp.sequence_number.as_deref());
            Ok(xml_ok(action, &xml))
        }
        "SendMessageBatch" => {
            let resp = state
                .send_message_batch(SendMessageBatchRequest {
                    queue_url: queue_url()?,
                    entries: send_batch_entries(params)?,
                })
                .await?;
            let mut xml = String::new();
            for s in &resp.successful {
                let _ = write!(
                    xml,
                    "    <SendMessageBatchResultEntry><Id>{}</Id><MessageId>{}</MessageId><MD5OfMessageBody>{}</MD5OfMessageBody>",
                    esc(&s.id),
                    s.message_id,
                    s.md5_of_message_body,
                );
                optional_element(
                    &mut xml,
                    "MD5OfMessageAttributes",
                    s.md5_of_message_attributes.as_deref(),
                );
                optional_element(&mut xml, "SequenceNumber", s.sequence_number.as_deref());
                xml.push_str("</SendMessageBatchResultEntry>\n");
            }
            batch_errors_xml(&mut xml, &resp.failed);
            Ok(xml_ok(action, xml.trim_end()))
        }
        "ReceiveMessage" => {
            let req = ReceiveMessageRequest {
                queue_url: queue_url()?,
                max_number_of_messages: int_param(params, "MaxNumberOfMessages")?,
                visibility_timeout: int_param(params, "VisibilityTimeout")?,
                wait_time_seconds: int_param(params, "WaitTimeSeconds")?,
                attribute_names: parse_string_list(params, "AttributeName"),
                message_system_attribute_names: parse_string_list(
                    params,
                    "MessageSystemAttributeName",
                ),
                message_attribute_names: parse_string_list(params, "MessageAttributeName"),
            };
            let resp = state.receive_message(req, cancel).await?;
            let mut xml = String::new();
            for m in resp.messages.unwrap_or_default() {
                let _ = write!(
                    xml,
                    "    <Message>\n    <MessageId>{}</MessageId>\n    <ReceiptHandle>{}</ReceiptHandle>\n    <MD5OfBody>{}</MD5OfBody>\n    <Body>{}</Body>\n",
                    m.message_id,
                    esc(&m.receipt_handle),
                    m.md5_of_body,
                    esc(&m.body),
                );
                if let Some(ref attrs) = m.attributes {
                    name_value_xml(&mut xml, "Attribute", attrs);
                }
                if let Some(ref md5) = m.md5_of_message_attributes {
                    let _ = writeln!(xml, "    <MD5OfMessageAttributes>{md5}</MD5OfMessageAttributes>");
                }
                if let Some(ref attrs) = m.message_attributes {
                    message_attributes_xml(&mut xml, attrs);
                }
                xml.push_str("    </Message>\n");
            }
            Ok(xml_ok(action, xml.trim_end()))
        }
        "DeleteMessage" => {
            state
                .delete_message(DeleteMessageRequest {
                    queue_url: queue_url()?,
                    receipt_handle: require(params, "ReceiptHandle")?,
                })
                .await?;
            Ok(xml_empty(action))
        }
        "DeleteMessageBatch" => {
            let resp = state
                .delete_message_batch(DeleteMessageBatchRequest {
                    queue_url: queue_url()?,
                    entries: delete_batch_entries(params)?,
                })
                .await?;
            let mut xml = String::new();
            id_entries_xml(&mut xml, "DeleteMessageBatchResultEntry", &resp.successful);
            batch_errors_xml(&mut xml, &resp.failed);
            Ok(xml_ok(action, xml.trim_end()))
        }
        "ChangeMessageVisibility" => {
            state
                .change_message_visibility(ChangeMessageVisibilityRequest {
                    queue_url: queue_url()?,
                    receipt_handle: require(params, "ReceiptHandle")?,
                    visibility_timeout: int_param(params, "VisibilityTimeout")?.ok_or_else(
                        || {
                            SqsError::MissingParameter(
                                "The request must contain the parameter VisibilityTimeout."
                                    .into(),
                            )
                        },
                    )?,
                })
                .await?;
            Ok(xml_empty(action))
        }
        "ChangeMessageVisibilityBatch" => {
            let resp = state
                .change_message_visibility_batch(ChangeMessageVisibilityBatchRequest {
                    queue_url: queue_url()?,
                    entries: visibility_batch_entries(params)?,
                })
                .await?;
            let mut xml = String::new();
            id_entries_xml(
                &mut xml,
                "ChangeMessageVisibilityBatchResultEntry",
                &resp.successful,
            );
            batch_errors_xml(&mut xml, &resp.failed);
            Ok(xml_ok(action, xml.trim_end()))
        }
        _ => Err(SqsError::InvalidAction(format!(
            "The action {action} is not valid for this endpoint."
        ))),
    }
}
