//! Command monitoring. The cluster reports every monitored command to a
//! [`CommandEventHandler`]; the default implementation ignores everything,
//! so monitoring costs nothing unless a sink is installed.
use std::time::Duration;

use mongo_protocol::ServerId;

/// Emitted just before a command's message is written to the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandStartedEvent {
    pub operation_id: i64,
    pub request_id: i32,
    pub server_id: ServerId,
    pub address: String,
    pub database: String,
    pub command_name: String,
}

/// Emitted when the server reply arrived and reported success.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSucceededEvent {
    pub operation_id: i64,
    pub request_id: i32,
    pub server_id: ServerId,
    pub address: String,
    pub command_name: String,
    pub duration: Duration,
}

/// Emitted when the command failed, on the wire or server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFailedEvent {
    pub operation_id: i64,
    pub request_id: i32,
    pub server_id: ServerId,
    pub address: String,
    pub command_name: String,
    pub duration: Duration,
    pub failure: String,
}

/// Sink for command lifecycle events.
pub trait CommandEventHandler {
    fn command_started(&self, _event: CommandStartedEvent) {}

    fn command_succeeded(&self, _event: CommandSucceededEvent) {}

    fn command_failed(&self, _event: CommandFailedEvent) {}
}

/// Handler that drops every event.
#[derive(Debug, Default)]
pub struct NoopEventHandler;

impl CommandEventHandler for NoopEventHandler {}
