//! Local, in-memory implementation of the Amazon SQS API.
//!
//! [`sqs::registry::QueueRegistry`] is the engine and can be embedded
//! directly. [`sqs::server::create_router`] puts the JSON and query
//! protocols in front of it.

pub mod sqs;
