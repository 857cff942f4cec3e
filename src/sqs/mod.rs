pub mod error;
pub mod message;
pub mod query;
pub mod queue;
pub mod registry;
pub mod server;
pub mod state;
pub mod types;
