//! Endpoint ids, application-facing events and the actions the core hands back to the host.

use serde::Serialize;
use uuid::Uuid;

use crate::blobdb::{Database, Operation, Status};
use crate::phone::{CallEventKind, CallState};
use crate::timeline::TimelineItem;

/// Reserved endpoint ids. These must match the watch firmware bit for bit.
pub mod endpoints {
    /// Phone call control and call state.
    pub const PHONE_CONTROL: u16 = 0x0021;
    /// BlobDB commands and their responses.
    pub const BLOB_DB: u16 = 0xB1DB;
    /// BlobDB pushes initiated by the watch.
    pub const BLOB_DB_SYNC: u16 = 0xB2DB;
}

/// Events emitted upward to the application layer. Names are the integration contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum WatchEvent {
    BlobCommandResult {
        database: Database,
        operation: Operation,
        key: Vec<u8>,
        status: Status,
    },
    NotifyTimeline {
        timestamp: u32,
        uuid: Uuid,
        item: TimelineItem,
    },
    AppInserted {
        uuid: Uuid,
    },
    CallState {
        cookie: u32,
        states: Vec<CallState>,
    },
    AnswerCall {
        cookie: u32,
    },
    HangupCall {
        cookie: u32,
    },
    CallStateRequested {
        cookie: u32,
    },
    Call {
        kind: CallEventKind,
        cookie: u32,
        number: Option<String>,
        name: Option<String>,
    },
    Connected,
    Disconnected,
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Frame `payload` for `endpoint` and write it to the transport.
    Send { endpoint: u16, payload: Vec<u8> },
    /// Hand an event to the application layer.
    Emit(WatchEvent),
    /// Drop the transport; the stream cannot be trusted any more.
    Disconnect(String),
}

impl OutboundAction {
    pub fn send(endpoint: u16, payload: Vec<u8>) -> Self {
        OutboundAction::Send { endpoint, payload }
    }
}
