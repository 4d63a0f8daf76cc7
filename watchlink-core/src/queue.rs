//! BlobDB command queue: one command in flight, FIFO backlog, token-matched acknowledgements.
//!
//! The watch cannot pipeline BlobDB commands, so the queue transmits the backlog head only
//! from `Idle` and waits for the matching response (or a watchdog timeout, or transport loss)
//! before sending the next one.

use std::collections::VecDeque;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blobdb::{
    BlobCommand, BlobDbError, BlobItem, Database, NotifyPush, Operation, Response, Status,
};
use crate::endpoint::Endpoint;
use crate::metadata::{self, AppInfo, AppMetadata, HardwarePlatform, HealthParams, MetadataError};
use crate::protocol::{endpoints, OutboundAction, WatchEvent};
use crate::timeline::TimelineItem;

/// Default watchdog for an unacknowledged command, in host ticks. 0 disables it.
pub const DEFAULT_ACK_TIMEOUT_TICKS: u64 = 10;

/// Monotonic 16-bit token source. Never yields zero.
#[derive(Debug)]
pub struct TokenGenerator {
    next: u16,
}

impl TokenGenerator {
    /// Start somewhere random so a restarted host does not reuse the previous run's tokens.
    pub fn new() -> Self {
        Self::starting_at(rand::random())
    }

    pub fn starting_at(first: u16) -> Self {
        Self { next: first.max(1) }
    }

    pub fn next_token(&mut self) -> u16 {
        let token = self.next;
        self.next = match token.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        token
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

enum QueueState {
    Idle,
    AwaitingAck {
        command: BlobCommand,
        sent_tick: u64,
    },
}

/// The BlobDB endpoint handler and its command queue.
pub struct BlobDb {
    state: QueueState,
    backlog: VecDeque<BlobCommand>,
    tokens: TokenGenerator,
    link_up: bool,
    tick_count: u64,
    ack_timeout_ticks: u64,
}

impl BlobDb {
    pub fn new() -> Self {
        Self::with_tokens(TokenGenerator::new())
    }

    pub fn with_tokens(tokens: TokenGenerator) -> Self {
        Self {
            state: QueueState::Idle,
            backlog: VecDeque::new(),
            tokens,
            link_up: false,
            tick_count: 0,
            ack_timeout_ticks: DEFAULT_ACK_TIMEOUT_TICKS,
        }
    }

    pub fn set_ack_timeout(&mut self, ticks: u64) {
        self.ack_timeout_ticks = ticks;
    }

    /// Token of the command awaiting its response, if any.
    pub fn in_flight_token(&self) -> Option<u16> {
        match &self.state {
            QueueState::Idle => None,
            QueueState::AwaitingAck { command, .. } => Some(command.token()),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, QueueState::Idle)
    }

    /// Commands not yet transmitted.
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Append to the backlog; transmits right away when nothing is in flight.
    pub fn enqueue(&mut self, command: BlobCommand) -> Vec<OutboundAction> {
        debug!(
            op = ?command.operation(),
            db = ?command.database(),
            backlog = self.backlog.len(),
            "blobdb enqueue"
        );
        self.backlog.push_back(command);
        self.pump()
    }

    pub fn insert(
        &mut self,
        database: Database,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Vec<OutboundAction>, BlobDbError> {
        Ok(self.enqueue(BlobCommand::insert(database, key, value)?))
    }

    pub fn insert_item(
        &mut self,
        database: Database,
        item: &dyn BlobItem,
    ) -> Result<Vec<OutboundAction>, BlobDbError> {
        self.insert(database, item.key(), item.value())
    }

    pub fn remove(
        &mut self,
        database: Database,
        key: Vec<u8>,
    ) -> Result<Vec<OutboundAction>, BlobDbError> {
        Ok(self.enqueue(BlobCommand::delete(database, key)?))
    }

    pub fn clear(&mut self, database: Database) -> Vec<OutboundAction> {
        self.enqueue(BlobCommand::clear(database))
    }

    /// Sync an app's metadata record. Whether an already synced app is worth resending is the
    /// caller's call; `force` is only recorded here and nothing is deduplicated.
    pub fn insert_app_metadata(
        &mut self,
        info: &AppInfo,
        platform: HardwarePlatform,
        force: bool,
    ) -> Result<Vec<OutboundAction>, SyncError> {
        let meta = AppMetadata::from_app_info(info, platform)?;
        debug!(uuid = %info.uuid, force, platform = platform.name(), "insert app metadata");
        Ok(self.insert_item(Database::App, &meta)?)
    }

    pub fn remove_app(&mut self, info: &AppInfo) -> Result<Vec<OutboundAction>, BlobDbError> {
        self.remove(Database::App, info.uuid.as_bytes().to_vec())
    }

    /// On success every app entry previously synced is gone from the watch.
    pub fn clear_apps(&mut self) -> Vec<OutboundAction> {
        self.clear(Database::App)
    }

    pub fn set_health_params(
        &mut self,
        params: &HealthParams,
    ) -> Result<Vec<OutboundAction>, BlobDbError> {
        self.insert_item(Database::AppSettings, params)
    }

    pub fn set_units(&mut self, imperial: bool) -> Result<Vec<OutboundAction>, BlobDbError> {
        self.insert(
            Database::AppSettings,
            metadata::UNITS_KEY.to_vec(),
            metadata::encode_units(imperial),
        )
    }

    /// Transmit the backlog head if idle and connected.
    fn pump(&mut self) -> Vec<OutboundAction> {
        if !self.link_up || !self.is_idle() {
            return Vec::new();
        }
        let Some(mut command) = self.backlog.pop_front() else {
            return Vec::new();
        };
        command.set_token(self.tokens.next_token());
        debug!(token = command.token(), op = ?command.operation(), "blobdb send");
        let payload = command.encode();
        self.state = QueueState::AwaitingAck {
            command,
            sent_tick: self.tick_count,
        };
        vec![OutboundAction::send(endpoints::BLOB_DB, payload)]
    }

    fn resolve(&mut self, command: BlobCommand, status: Status) -> Vec<OutboundAction> {
        if !status.is_success() {
            warn!(
                token = command.token(),
                op = ?command.operation(),
                db = ?command.database(),
                ?status,
                rejected_by_watch = status.is_device_reported(),
                "blobdb command not applied"
            );
        }
        let mut actions = Vec::with_capacity(2);
        if status.is_success()
            && command.operation() == Operation::Insert
            && command.database() == Database::App
        {
            if let Ok(uuid) = Uuid::from_slice(command.key()) {
                actions.push(OutboundAction::Emit(WatchEvent::AppInserted { uuid }));
            }
        }
        actions.insert(
            0,
            OutboundAction::Emit(WatchEvent::BlobCommandResult {
                database: command.database(),
                operation: command.operation(),
                key: command.key().to_vec(),
                status,
            }),
        );
        actions
    }

    fn on_response(&mut self, payload: &[u8]) -> Vec<OutboundAction> {
        let response = match Response::decode(payload) {
            Ok(r) => r,
            Err(e) => {
                warn!("dropping blobdb response: {e}");
                return Vec::new();
            }
        };
        let command = match std::mem::replace(&mut self.state, QueueState::Idle) {
            QueueState::AwaitingAck { command, .. } if command.token() == response.token => command,
            other => {
                self.state = other;
                debug!(
                    token = response.token,
                    outstanding = ?self.in_flight_token(),
                    "stale blobdb response"
                );
                return Vec::new();
            }
        };
        let mut actions = self.resolve(command, response.status);
        actions.extend(self.pump());
        actions
    }

    fn on_notify(&mut self, payload: &[u8]) -> Vec<OutboundAction> {
        let push = match NotifyPush::decode(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!("dropping blobdb push: {e}");
                return Vec::new();
            }
        };
        match TimelineItem::decode(&push.value) {
            Ok(item) => vec![OutboundAction::Emit(WatchEvent::NotifyTimeline {
                timestamp: push.timestamp,
                uuid: push.key,
                item,
            })],
            Err(e) => {
                warn!(uuid = %push.key, "dropping timeline push: {e}");
                Vec::new()
            }
        }
    }
}

impl Default for BlobDb {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint for BlobDb {
    fn name(&self) -> &'static str {
        "blobdb"
    }

    fn on_payload(&mut self, endpoint: u16, payload: &[u8]) -> Vec<OutboundAction> {
        if endpoint == endpoints::BLOB_DB_SYNC {
            self.on_notify(payload)
        } else {
            self.on_response(payload)
        }
    }

    fn on_connected(&mut self) -> Vec<OutboundAction> {
        self.link_up = true;
        if !self.backlog.is_empty() {
            info!(backlog = self.backlog.len(), "blobdb resuming backlog");
        }
        self.pump()
    }

    /// The in-flight command fails with `TransportLost`; the backlog waits for the next link.
    fn on_disconnected(&mut self) -> Vec<OutboundAction> {
        self.link_up = false;
        match std::mem::replace(&mut self.state, QueueState::Idle) {
            QueueState::AwaitingAck { command, .. } => self.resolve(command, Status::TransportLost),
            QueueState::Idle => Vec::new(),
        }
    }

    fn tick(&mut self) -> Vec<OutboundAction> {
        self.tick_count = self.tick_count.saturating_add(1);
        if self.ack_timeout_ticks == 0 {
            return Vec::new();
        }
        let overdue = matches!(
            &self.state,
            QueueState::AwaitingAck { sent_tick, .. }
                if self.tick_count.saturating_sub(*sent_tick) >= self.ack_timeout_ticks
        );
        if !overdue {
            return Vec::new();
        }
        let mut actions = match std::mem::replace(&mut self.state, QueueState::Idle) {
            QueueState::AwaitingAck { command, .. } => self.resolve(command, Status::TimedOut),
            QueueState::Idle => Vec::new(),
        };
        actions.extend(self.pump());
        actions
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    BlobDb(#[from] BlobDbError),
}
