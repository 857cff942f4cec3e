use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::error::SqsError;
use super::message::SendParams;
use super::registry::{QueueRegistry, ReceiveParams};
use super::types::*;

/// Protocol-facing side of the service: maps queue URLs onto registry names
/// and shapes engine results into response records.
pub struct SqsState {
    registry: Arc<QueueRegistry>,
    account_id: String,
    region: String,
    base_url: String,
}

fn non_negative(name: &str, value: Option<i64>) -> Result<Option<u32>, SqsError> {
    value
        .map(|v| {
            u32::try_from(v).map_err(|_| {
                SqsError::InvalidParameterValue(format!(
                    "Value {v} for parameter {name} is invalid."
                ))
            })
        })
        .transpose()
}

impl SqsState {
    pub fn new(registry: Arc<QueueRegistry>, account_id: String, region: String, port: u16) -> Self {
        SqsState {
            registry,
            account_id,
            region,
            base_url: format!("http://localhost:{}", port),
        }
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn queue_url(&self, name: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.account_id, name)
    }

    fn queue_arn(&self, name: &str) -> String {
        format!("arn:aws:sqs:{}:{}:{}", self.region, self.account_id, name)
    }

    /// Queue name from a queue URL: its last, percent-decoded path segment.
    pub fn resolve_queue_name(queue_url: &str) -> Result<String, SqsError> {
        let segment = queue_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SqsError::QueueNotFound("Invalid queue URL".into()))?;
        percent_encoding::percent_decode_str(segment)
            .decode_utf8()
            .map(|s| s.into_owned())
            .map_err(|_| SqsError::QueueNotFound("Invalid queue URL".into()))
    }

    fn validate_batch_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Result<(), SqsError> {
        let mut seen = HashSet::new();
        for id in ids {
            if id.is_empty()
                || id.len() > 80
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(SqsError::InvalidBatchEntryId(format!(
                    "A batch entry id can only contain alphanumeric characters, hyphens and underscores. It can be at most 80 letters long: {id}"
                )));
            }
            if !seen.insert(id) {
                return Err(SqsError::BatchEntryIdsNotDistinct(format!(
                    "Id {id} repeated."
                )));
            }
        }
        match seen.len() {
            0 => Err(SqsError::EmptyBatchRequest(
                "There should be at least one entry in the request.".into(),
            )),
            n if n > 10 => Err(SqsError::TooManyEntriesInBatchRequest(format!(
                "Maximum number of entries per request are 10. You have sent {n}."
            ))),
            _ => Ok(()),
        }
    }

    fn batch_error(id: String, err: &SqsError) -> BatchResultErrorEntry {
        BatchResultErrorEntry {
            id,
            code: err.error_code().to_string(),
            message: err.to_string(),
            sender_fault: true,
        }
    }

    pub async fn create_queue(
        &self,
        req: CreateQueueRequest,
    ) -> Result<CreateQueueResponse, SqsError> {
        let attributes = req.attributes.unwrap_or_default();
        self.registry
            .create_queue(&req.queue_name, &attributes)
            .await?;
        Ok(CreateQueueResponse {
            queue_url: self.queue_url(&req.queue_name),
        })
    }

    pub async fn delete_queue(&self, req: DeleteQueueRequest) -> Result<(), SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        self.registry.delete_queue(&name).await
    }

    pub async fn get_queue_url(
        &self,
        req: GetQueueUrlRequest,
    ) -> Result<GetQueueUrlResponse, SqsError> {
        self.registry.lookup(&req.queue_name).await?;
        Ok(GetQueueUrlResponse {
            queue_url: self.queue_url(&req.queue_name),
        })
    }

    pub async fn list_queues(
        &self,
        req: ListQueuesRequest,
    ) -> Result<ListQueuesResponse, SqsError> {
        let max = match req.max_results {
            None => 1000,
            Some(n @ 1..=1000) => n as usize,
            Some(n) => {
                return Err(SqsError::InvalidParameterValue(format!(
                    "Value {n} for parameter MaxResults is invalid. Reason: Must be between 1 and 1000."
                )))
            }
        };
        let names = self
            .registry
            .list_queues(req.queue_name_prefix.as_deref())
            .await;

        let start = match req.next_token {
            Some(ref token) => names
                .iter()
                .position(|n| n.as_str() > token.as_str())
                .unwrap_or(names.len()),
            None => 0,
        };
        let page: Vec<String> = names[start..]
            .iter()
            .take(max)
            .map(|n| self.queue_url(n))
            .collect();
        // The token is the last name handed out; the next page starts after it.
        let next_token = if req.max_results.is_some() && start + max < names.len() {
            names.get(start + max - 1).cloned()
        } else {
            None
        };

        Ok(ListQueuesResponse {
            queue_urls: if page.is_empty() { None } else { Some(page) },
            next_token,
        })
    }

    pub async fn get_queue_attributes(
        &self,
        req: GetQueueAttributesRequest,
    ) -> Result<GetQueueAttributesResponse, SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let mut all = self.registry.get_queue_attributes(&name).await?;
        all.insert("QueueArn".into(), self.queue_arn(&name));

        let names = req.attribute_names.unwrap_or_default();
        let attributes = if names.is_empty() || names.iter().any(|n| n == "All") {
            all
        } else {
            all.into_iter()
                .filter(|(k, _)| names.contains(k))
                .collect()
        };
        Ok(GetQueueAttributesResponse { attributes })
    }

    pub async fn set_queue_attributes(
        &self,
        req: SetQueueAttributesRequest,
    ) -> Result<(), SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        self.registry
            .set_queue_attributes(&name, &req.attributes)
            .await
    }

    pub async fn purge_queue(&self, req: PurgeQueueRequest) -> Result<(), SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        self.registry.purge_queue(&name).await
    }

    pub async fn send_message(
        &self,
        req: SendMessageRequest,
    ) -> Result<SendMessageResponse, SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let params = SendParams {
            body: req.message_body,
            delay_seconds: non_negative("DelaySeconds", req.delay_seconds)?,
            group_id: req.message_group_id,
            dedup_id: req.message_deduplication_id,
            attributes: req.message_attributes.unwrap_or_default(),
        };
        let receipt = self.registry.send_message(&name, params).await?;
        Ok(receipt.into())
    }

    pub async fn send_message_batch(
        &self,
        req: SendMessageBatchRequest,
    ) -> Result<SendMessageBatchResponse, SqsError> {
        Self::validate_batch_ids(req.entries.iter().map(|e| e.id.as_str()))?;
        let name = Self::resolve_queue_name(&req.queue_url)?;
        self.registry.lookup(&name).await?;

        let mut successful = Vec::new();
        let mut failed = Vec::new();

        for e in req.entries {
            let outcome = match non_negative("DelaySeconds", e.delay_seconds) {
                Ok(delay_seconds) => {
                    let params = SendParams {
                        body: e.message_body,
                        delay_seconds,
                        group_id: e.message_group_id,
                        dedup_id: e.message_deduplication_id,
                        attributes: e.message_attributes.unwrap_or_default(),
                    };
                    self.registry.send_message(&name, params).await
                }
                Err(err) => Err(err),
            };
            match outcome {
                Ok(receipt) => successful.push(SendMessageBatchResultEntry {
                    id: e.id,
                    message_id: receipt.message_id,
                    md5_of_message_body: receipt.md5_of_body,
                    md5_of_message_attributes: receipt.md5_of_message_attributes,
                    sequence_number: receipt.sequence_number,
                }),
                Err(SqsError::QueueNotFound(m)) => return Err(SqsError::QueueNotFound(m)),
                Err(err) => failed.push(Self::batch_error(e.id, &err)),
            }
        }

        Ok(SendMessageBatchResponse { successful, failed })
    }

    pub async fn receive_message(
        &self,
        req: ReceiveMessageRequest,
        cancel: &CancellationToken,
    ) -> Result<ReceiveMessageResponse, SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let params = ReceiveParams {
            max_messages: non_negative("MaxNumberOfMessages", req.max_number_of_messages)?
                .map(|n| n as usize),
            wait_time_seconds: non_negative("WaitTimeSeconds", req.wait_time_seconds)?,
            visibility_timeout: non_negative("VisibilityTimeout", req.visibility_timeout)?,
        };

        let batch = self.registry.receive_message(&name, params, cancel).await?;
        if batch.is_empty() {
            return Ok(ReceiveMessageResponse { messages: None });
        }

        let system_names = match (req.attribute_names, req.message_system_attribute_names) {
            (None, None) => None,
            (a, b) => Some(a.into_iter().chain(b).flatten().collect::<Vec<_>>()),
        };
        let results: Vec<ReceiveMessageResult> = batch
            .into_iter()
            .map(|msg| {
                let mut result = ReceiveMessageResult::from(msg);
                if let Some(ref mut attrs) = result.attributes {
                    attrs.insert("SenderId".into(), self.account_id.clone());
                }
                result
            })
            .collect();
        let results =
            filter_receive_results(results, &system_names, &req.message_attribute_names);
        Ok(ReceiveMessageResponse {
            messages: Some(results),
        })
    }

    pub async fn delete_message(&self, req: DeleteMessageRequest) -> Result<(), SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        self.registry
            .delete_message(&name, &req.receipt_handle)
            .await
    }

    pub async fn delete_message_batch(
        &self,
        req: DeleteMessageBatchRequest,
    ) -> Result<DeleteMessageBatchResponse, SqsError> {
        Self::validate_batch_ids(req.entries.iter().map(|e| e.id.as_str()))?;
        let name = Self::resolve_queue_name(&req.queue_url)?;
        self.registry.lookup(&name).await?;

        let mut successful = Vec::new();
        let mut failed = Vec::new();

        for e in req.entries {
            match self.registry.delete_message(&name, &e.receipt_handle).await {
                Ok(()) => successful.push(BatchResultEntry { id: e.id }),
                Err(SqsError::QueueNotFound(m)) => return Err(SqsError::QueueNotFound(m)),
                Err(err) => failed.push(Self::batch_error(e.id, &err)),
            }
        }

        Ok(DeleteMessageBatchResponse { successful, failed })
    }

    pub async fn change_message_visibility(
        &self,
        req: ChangeMessageVisibilityRequest,
    ) -> Result<(), SqsError> {
        let name = Self::resolve_queue_name(&req.queue_url)?;
        let timeout = non_negative("VisibilityTimeout", Some(req.visibility_timeout))?
            .unwrap_or_default();
        self.registry
            .change_message_visibility(&name, &req.receipt_handle, timeout)
            .await
    }

    pub async fn change_message_visibility_batch(
        &self,
        req: ChangeMessageVisibilityBatchRequest,
    ) -> Result<ChangeMessageVisibilityBatchResponse, SqsError> {
        Self::validate_batch_ids(req.entries.iter().map(|e| e.id.as_str()))?;
        let name = Self::resolve_queue_name(&req.queue_url)?;
        self.registry.lookup(&name).await?;

        let mut successful = Vec::new();
        let mut failed = Vec::new();

        for e in req.entries {
            let outcome = match non_negative("VisibilityTimeout", Some(e.visibility_timeout)) {
                Ok(timeout) => {
                    self.registry
                        .change_message_visibility(
                            &name,
                            &e.receipt_handle,
                            timeout.unwrap_or_default(),
                        )
                        .await
                }
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => successful.push(BatchResultEntry { id: e.id }),
                Err(SqsError::QueueNotFound(m)) => return Err(SqsError::QueueNotFound(m)),
                Err(err) => failed.push(Self::batch_error(e.id, &err)),
            }
        }

        Ok(ChangeMessageVisibilityBatchResponse { successful, failed })
    }
}

/// Keeps only the attributes the caller asked for. System attributes are
/// matched by name or `All`; message attributes also accept `prefix.*`.
fn filter_receive_results(
    results: Vec<ReceiveMessageResult>,
    attr_names: &Option<Vec<String>>,
    msg_attr_names: &Option<Vec<String>>,
) -> Vec<ReceiveMessageResult> {
    let wants_all = |names: &[String]| names.iter().any(|n| n == "All" || n == ".*");

    results
        .into_iter()
        .map(|mut r| {
            r.attributes = match (attr_names, r.attributes.take()) {
                (Some(names), Some(attrs)) => {
                    let filtered: HashMap<String, String> = if wants_all(names) {
                        attrs
                    } else {
                        attrs
                            .into_iter()
                            .filter(|(k, _)| names.contains(k))
                            .collect()
                    };
                    (!filtered.is_empty()).then_some(filtered)
                }
                _ => None,
            };

            r.message_attributes = match (msg_attr_names, r.message_attributes.take()) {
                (Some(names), Some(attrs)) => {
                    let filtered: HashMap<String, MessageAttributeValue> = if wants_all(names) {
                        attrs
                    } else {
                        attrs
                            .into_iter()
                            .filter(|(k, _)| {
                                names.contains(k)
                                    || names.iter().any(|n| {
                                        n.strip_suffix(".*")
                                            .is_some_and(|prefix| k.starts_with(prefix))
                                    })
                            })
                            .collect()
                    };
                    (!filtered.is_empty()).then_some(filtered)
                }
                _ => None,
            };
            if r.message_attributes.is_none() {
                r.md5_of_message_attributes = None;
            }

            r
        })
        .collect()
}
