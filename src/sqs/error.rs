use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqsError {
    #[error("{0}")]
    QueueNotFound(String),
    #[error("{0}")]
    QueueAlreadyExists(String),
    #[error("{0}")]
    MessageDoesNotExist(String),
    #[error("{0}")]
    InvalidParameterValue(String),
    #[error("{0}")]
    MissingParameter(String),
    #[error("{0}")]
    InvalidAttributeName(String),
    #[error("{0}")]
    InvalidAttributeValue(String),
    #[error("{0}")]
    InvalidAction(String),
    #[error("{0}")]
    EmptyBatchRequest(String),
    #[error("{0}")]
    TooManyEntriesInBatchRequest(String),
    #[error("{0}")]
    BatchEntryIdsNotDistinct(String),
    #[error("{0}")]
    InvalidBatchEntryId(String),
}

impl SqsError {
    pub fn queue_not_found() -> Self {
        SqsError::QueueNotFound("The specified queue does not exist.".into())
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            SqsError::QueueNotFound(_) => "QueueDoesNotExist",
            SqsError::QueueAlreadyExists(_) => "QueueAlreadyExists",
            SqsError::MessageDoesNotExist(_) => "MessageDoesNotExist",
            SqsError::InvalidParameterValue(_) => "InvalidParameterValue",
            SqsError::MissingParameter(_) => "MissingParameter",
            SqsError::InvalidAttributeName(_) => "InvalidAttributeName",
            SqsError::InvalidAttributeValue(_) => "InvalidAttributeValue",
            SqsError::InvalidAction(_) => "InvalidAction",
            SqsError::EmptyBatchRequest(_) => "EmptyBatchRequest",
            SqsError::TooManyEntriesInBatchRequest(_) => "TooManyEntriesInBatchRequest",
            SqsError::BatchEntryIdsNotDistinct(_) => "BatchEntryIdsNotDistinct",
            SqsError::InvalidBatchEntryId(_) => "InvalidBatchEntryId",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SqsError::QueueAlreadyExists(_) => StatusCode::CONFLICT,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Response for the query protocol, which expects an XML error document.
    pub fn into_xml_response(self) -> Response {
        let message = self.to_string();
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ErrorResponse>
  <Error>
    <Type>Sender</Type>
    <Code>{code}</Code>
    <Message>{message}</Message>
  </Error>
  <RequestId>{rid}</RequestId>
</ErrorResponse>"#,
            code = self.error_code(),
            message = quick_xml::escape::escape(message.as_str()),
            rid = uuid::Uuid::new_v4(),
        );
        (self.status_code(), [("content-type", "text/xml")], xml).into_response()
    }
}

impl IntoResponse for SqsError {
    fn into_response(self) -> Response {
        let body = json!({
            "__type": format!("com.amazonaws.sqs#{}", self.error_code()),
            "message": self.to_string(),
        });
        (self.status_code(), axum::Json(body)).into_response()
    }
}
