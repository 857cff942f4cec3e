use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::SqsError;
use super::query;
use super::state::SqsState;
use super::types::*;

#[derive(Clone)]
pub struct AppState {
    pub sqs: Arc<SqsState>,
    /// Cancelled on shutdown; waiting receives return what they have.
    pub shutdown: CancellationToken,
}

macro_rules! dispatch {
    ($state:expr, $body:expr, $req_type:ty, $method:ident) => {{
        let req: $req_type = serde_json::from_slice(&$body)
            .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?;
        let resp = $state.$method(req).await?;
        Ok(Json(resp).into_response())
    }};
}

macro_rules! dispatch_empty {
    ($state:expr, $body:expr, $req_type:ty, $method:ident) => {{
        let req: $req_type = serde_json::from_slice(&$body)
            .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?;
        $state.$method(req).await?;
        Ok(Json(serde_json::json!({})).into_response())
    }};
}

async fn handle_json(
    state: &AppState,
    target: &str,
    body: Bytes,
) -> Result<Response, SqsError> {
    let action = target.strip_prefix("AmazonSQS.").ok_or_else(|| {
        SqsError::InvalidAction(format!("Invalid target: {target}"))
    })?;
    debug!(action, "json request");
    let sqs = &state.sqs;

    match action {
        "CreateQueue" => dispatch!(sqs, body, CreateQueueRequest, create_queue),
        "DeleteQueue" => dispatch_empty!(sqs, body, DeleteQueueRequest, delete_queue),
        "GetQueueUrl" => dispatch!(sqs, body, GetQueueUrlRequest, get_queue_url),
        "ListQueues" => dispatch!(sqs, body, ListQueuesRequest, list_queues),
        "GetQueueAttributes" => {
            dispatch!(sqs, body, GetQueueAttributesRequest, get_queue_attributes)
        }
        "SetQueueAttributes" => {
            dispatch_empty!(sqs, body, SetQueueAttributesRequest, set_queue_attributes)
        }
        "PurgeQueue" => dispatch_empty!(sqs, body, PurgeQueueRequest, purge_queue),
        "SendMessage" => dispatch!(sqs, body, SendMessageRequest, send_message),
        "SendMessageBatch" => {
            dispatch!(sqs, body, SendMessageBatchRequest, send_message_batch)
        }
        "ReceiveMessage" => {
            let req: ReceiveMessageRequest = serde_json::from_slice(&body)
                .map_err(|e| SqsError::InvalidParameterValue(e.to_string()))?;
            let cancel = state.shutdown.child_token();
            let resp = sqs.receive_message(req, &cancel).await?;
            Ok(Json(resp).into_response())
        }
        "DeleteMessage" => {
            dispatch_empty!(sqs, body, DeleteMessageRequest, delete_message)
        }
        "DeleteMessageBatch" => {
            dispatch!(sqs, body, DeleteMessageBatchRequest, delete_message_batch)
        }
        "ChangeMessageVisibility" => {
            dispatch_empty!(
                sqs,
                body,
                ChangeMessageVisibilityRequest,
                change_message_visibility
            )
        }
        "ChangeMessageVisibilityBatch" => {
            dispatch!(
                sqs,
                body,
                ChangeMessageVisibilityBatchRequest,
                change_message_visibility_batch
            )
        }
        _ => Err(SqsError::InvalidAction(format!(
            "Unknown action: {action}"
        ))),
    }
}

/// JSON when the request names an `X-Amz-Target`, query protocol otherwise.
async fn handle(
    state: AppState,
    path_queue_url: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(target) = headers.get("x-amz-target").and_then(|v| v.to_str().ok()) {
        return match handle_json(&state, target, body).await {
            Ok(resp) => resp,
            Err(err) => err.into_response(),
        };
    }

    let form = match std::str::from_utf8(&body) {
        Ok(form) => form,
        Err(e) => {
            return SqsError::InvalidParameterValue(format!(
                "Request body is not valid UTF-8: {e}"
            ))
            .into_xml_response();
        }
    };
    let cancel = state.shutdown.child_token();
    query::handle_query(&state.sqs, path_queue_url, form, &cancel).await
}

async fn handle_root(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    handle(state, None, headers, body).await
}

async fn handle_queue_path(
    State(state): State<AppState>,
    Path((_account, queue)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let url = state.sqs.queue_url(&queue);
    handle(state, Some(url), headers, body).await
}

pub fn create_router(sqs: Arc<SqsState>, shutdown: CancellationToken) -> Router {
    Router::new()
        .route("/", post(handle_root))
        .route("/{account}/{queue}", post(handle_queue_path))
        .with_state(AppState { sqs, shutdown })
}
