//! Host-driven API: WatchConnection receives transport events from host, returns actions.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::blobdb::{BlobDbError, Database};
use crate::endpoint::Endpoint;
use crate::metadata::{AppInfo, HardwarePlatform, HealthParams};
use crate::phone::{PhoneCallEndpoint, PhoneError};
use crate::protocol::{endpoints, OutboundAction, WatchEvent};
use crate::queue::{BlobDb, SyncError, TokenGenerator, DEFAULT_ACK_TIMEOUT_TICKS};
use crate::wire::{check_payload_len, Frame, FrameBuffer, FrameEncodeError, DEFAULT_MAX_PAYLOAD_LEN};

/// Default number of back-to-back malformed headers tolerated before dropping the link.
pub const DEFAULT_MAX_MALFORMED_FRAMES: u32 = 8;

/// Protocol knobs for one connection.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub max_frame_payload: usize,
    pub max_malformed_frames: u32,
    /// BlobDB watchdog in ticks; 0 disables it.
    pub ack_timeout_ticks: u64,
    pub platform: HardwarePlatform,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: DEFAULT_MAX_PAYLOAD_LEN,
            max_malformed_frames: DEFAULT_MAX_MALFORMED_FRAMES,
            ack_timeout_ticks: DEFAULT_ACK_TIMEOUT_TICKS,
            platform: HardwarePlatform::Basalt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    BlobDb,
    Phone,
    Custom(usize),
}

/// Routes frames between the transport and the endpoint handlers.
pub struct WatchConnection {
    routes: HashMap<u16, Handler>,
    blob_db: BlobDb,
    phone: PhoneCallEndpoint,
    custom: Vec<Option<Box<dyn Endpoint>>>,
    rx: FrameBuffer,
    connected: bool,
    shut_down: bool,
    malformed_run: u32,
    max_malformed: u32,
    platform: HardwarePlatform,
}

impl WatchConnection {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_blob_db(config, BlobDb::new())
    }

    /// Deterministic tokens, for replaying captures.
    pub fn with_first_token(config: LinkConfig, first: u16) -> Self {
        Self::with_blob_db(config, BlobDb::with_tokens(TokenGenerator::starting_at(first)))
    }

    fn with_blob_db(config: LinkConfig, mut blob_db: BlobDb) -> Self {
        blob_db.set_ack_timeout(config.ack_timeout_ticks);
        let mut routes = HashMap::new();
        routes.insert(endpoints::BLOB_DB, Handler::BlobDb);
        routes.insert(endpoints::BLOB_DB_SYNC, Handler::BlobDb);
        routes.insert(endpoints::PHONE_CONTROL, Handler::Phone);
        Self {
            routes,
            blob_db,
            phone: PhoneCallEndpoint::new(),
            custom: Vec::new(),
            rx: FrameBuffer::new(config.max_frame_payload),
            connected: false,
            shut_down: false,
            malformed_run: 0,
            max_malformed: config.max_malformed_frames,
            platform: config.platform,
        }
    }

    /// Route `endpoint` to `handler`. The last registration for an id wins.
    pub fn register_endpoint(&mut self, endpoint: u16, handler: Box<dyn Endpoint>) {
        debug!(endpoint, name = handler.name(), "register endpoint");
        self.custom.push(Some(handler));
        let idx = self.custom.len() - 1;
        if let Some(Handler::Custom(old)) = self.routes.insert(endpoint, Handler::Custom(idx)) {
            if !self.routes.values().any(|h| *h == Handler::Custom(old)) {
                self.custom[old] = None;
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn blob_db(&self) -> &BlobDb {
        &self.blob_db
    }

    /// Frame-level send for callers outside the built-in endpoints.
    pub fn send(&self, endpoint: u16, payload: Vec<u8>) -> Result<OutboundAction, TransportError> {
        check_payload_len(payload.len())?;
        self.guard(OutboundAction::send(endpoint, payload))
    }

    fn guard(&self, action: OutboundAction) -> Result<OutboundAction, TransportError> {
        if !self.connected {
            return Err(TransportError::Closed);
        }
        Ok(action)
    }

    pub fn on_transport_opened(&mut self) -> Vec<OutboundAction> {
        if self.connected || self.shut_down {
            return Vec::new();
        }
        info!("watch transport up");
        self.connected = true;
        self.rx.clear();
        self.malformed_run = 0;
        let mut actions = vec![OutboundAction::Emit(WatchEvent::Connected)];
        actions.extend(self.each_handler(|h| h.on_connected()));
        actions
    }

    /// Feed bytes read from the transport. Frames are dispatched as they complete.
    pub fn on_bytes_received(&mut self, bytes: &[u8]) -> Vec<OutboundAction> {
        if !self.connected {
            debug!(len = bytes.len(), "bytes while disconnected, ignored");
            return Vec::new();
        }
        self.rx.extend(bytes);
        let mut actions = Vec::new();
        loop {
            match self.rx.next_frame() {
                Ok(Some(frame)) => {
                    self.malformed_run = 0;
                    actions.extend(self.dispatch(frame));
                }
                Ok(None) => break,
                Err(e) => {
                    self.malformed_run += 1;
                    warn!(run = self.malformed_run, "malformed frame: {e}");
                    if self.malformed_run > self.max_malformed {
                        self.rx.clear();
                        actions.push(OutboundAction::Disconnect(format!(
                            "{} consecutive malformed frames",
                            self.malformed_run
                        )));
                        break;
                    }
                }
            }
        }
        actions
    }

    /// Transport closed or failed. Handlers are told once; repeated calls are no-ops.
    pub fn on_transport_closed(&mut self) -> Vec<OutboundAction> {
        if !self.connected {
            return Vec::new();
        }
        info!(discarded = self.rx.pending(), "watch transport down");
        self.connected = false;
        self.rx.clear();
        let mut actions = self.each_handler(|h| h.on_disconnected());
        actions.push(OutboundAction::Emit(WatchEvent::Disconnected));
        actions
    }

    /// Tear down for good: like a close, and later opens are refused.
    pub fn shutdown(&mut self) -> Vec<OutboundAction> {
        self.shut_down = true;
        self.on_transport_closed()
    }

    /// Periodic tick: drives handler timeouts.
    pub fn tick(&mut self) -> Vec<OutboundAction> {
        self.each_handler(|h| h.tick())
    }

    fn dispatch(&mut self, frame: Frame) -> Vec<OutboundAction> {
        let Some(handler) = self.routes.get(&frame.endpoint).copied() else {
            warn!(
                endpoint = format_args!("0x{:04x}", frame.endpoint),
                len = frame.payload.len(),
                "unroutable frame dropped"
            );
            return Vec::new();
        };
        match handler {
            Handler::BlobDb => self.blob_db.on_payload(frame.endpoint, &frame.payload),
            Handler::Phone => self.phone.on_payload(frame.endpoint, &frame.payload),
            Handler::Custom(idx) => match self.custom.get_mut(idx).and_then(Option::as_mut) {
                Some(h) => h.on_payload(frame.endpoint, &frame.payload),
                None => Vec::new(),
            },
        }
    }

    fn each_handler(
        &mut self,
        mut f: impl FnMut(&mut dyn Endpoint) -> Vec<OutboundAction>,
    ) -> Vec<OutboundAction> {
        let mut actions = f(&mut self.blob_db);
        actions.extend(f(&mut self.phone));
        for h in self.custom.iter_mut().flatten() {
            actions.extend(f(h.as_mut()));
        }
        actions
    }

    // Application commands.

    pub fn insert_app_metadata(
        &mut self,
        info: &AppInfo,
        force: bool,
    ) -> Result<Vec<OutboundAction>, CommandError> {
        let platform = self.platform;
        Ok(self.blob_db.insert_app_metadata(info, platform, force)?)
    }

    pub fn remove_app(&mut self, info: &AppInfo) -> Result<Vec<OutboundAction>, CommandError> {
        Ok(self.blob_db.remove_app(info)?)
    }

    pub fn clear_apps(&mut self) -> Vec<OutboundAction> {
        self.blob_db.clear_apps()
    }

    pub fn insert(
        &mut self,
        database: Database,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Vec<OutboundAction>, CommandError> {
        Ok(self.blob_db.insert(database, key, value)?)
    }

    pub fn remove(
        &mut self,
        database: Database,
        key: Vec<u8>,
    ) -> Result<Vec<OutboundAction>, CommandError> {
        Ok(self.blob_db.remove(database, key)?)
    }

    pub fn clear(&mut self, database: Database) -> Vec<OutboundAction> {
        self.blob_db.clear(database)
    }

    pub fn set_health_params(
        &mut self,
        params: &HealthParams,
    ) -> Result<Vec<OutboundAction>, CommandError> {
        Ok(self.blob_db.set_health_params(params)?)
    }

    pub fn set_units(&mut self, imperial: bool) -> Result<Vec<OutboundAction>, CommandError> {
        Ok(self.blob_db.set_units(imperial)?)
    }

    pub fn answer_call(&self, cookie: u32) -> Result<OutboundAction, CommandError> {
        Ok(self.guard(self.phone.send_answer(cookie))?)
    }

    pub fn hangup_call(&self, cookie: u32) -> Result<OutboundAction, CommandError> {
        Ok(self.guard(self.phone.send_hangup(cookie))?)
    }

    pub fn get_call_state(&self, cookie: u32) -> Result<OutboundAction, CommandError> {
        Ok(self.guard(self.phone.send_get_state(cookie))?)
    }

    pub fn incoming_call(
        &self,
        cookie: u32,
        number: &str,
        name: &str,
    ) -> Result<OutboundAction, CommandError> {
        let action = self.phone.send_incoming_call(cookie, number, name)?;
        Ok(self.guard(action)?)
    }

    pub fn call_started(&self, cookie: u32) -> Result<OutboundAction, CommandError> {
        Ok(self.guard(self.phone.send_call_started(cookie))?)
    }

    pub fn call_ended(&self, cookie: u32, missed: bool) -> Result<OutboundAction, CommandError> {
        Ok(self.guard(self.phone.send_call_ended(cookie, missed))?)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
}

/// Why an application command could not be carried out.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Phone(#[from] PhoneError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    BlobDb(#[from] BlobDbError),
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::blobdb::{BlobCommand, Operation, Response, Status};
    use crate::wire::{encode_frame, MAX_ENCODABLE_PAYLOAD_LEN};

    /// Records what it is told; used to observe routing and lifecycle.
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    }

    impl Endpoint for Recorder {
        fn name(&self) -> &'static str {
            self.tag
        }

        fn on_payload(&mut self, endpoint: u16, payload: &[u8]) -> Vec<OutboundAction> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}:{:?}", self.tag, endpoint, payload));
            Vec::new()
        }

        fn on_disconnected(&mut self) -> Vec<OutboundAction> {
            self.log.lock().unwrap().push(format!("{}:down", self.tag));
            Vec::new()
        }
    }

    fn frame(endpoint: u16, payload: &[u8]) -> Vec<u8> {
        encode_frame(endpoint, payload).unwrap()
    }

    fn open_conn() -> WatchConnection {
        let mut conn = WatchConnection::with_first_token(LinkConfig::default(), 1);
        let actions = conn.on_transport_opened();
        assert_eq!(actions, vec![OutboundAction::Emit(WatchEvent::Connected)]);
        conn
    }

    fn response_frame(token: u16, status: Status) -> Vec<u8> {
        frame(endpoints::BLOB_DB, &Response { token, status }.encode())
    }

    fn results(actions: &[OutboundAction]) -> Vec<(Vec<u8>, Status)> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Emit(WatchEvent::BlobCommandResult { key, status, .. }) => {
                    Some((key.clone(), *status))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn routes_blobdb_responses_delivered_bytewise() {
        let mut conn = open_conn();
        conn.insert(Database::Pin, vec![1], vec![1]).unwrap();
        conn.insert(Database::Pin, vec![2], vec![2]).unwrap();

        let mut stream = response_frame(1, Status::Success);
        stream.extend(response_frame(2, Status::InvalidData));
        let mut actions = Vec::new();
        for b in &stream {
            actions.extend(conn.on_bytes_received(std::slice::from_ref(b)));
        }
        assert_eq!(
            results(&actions),
            vec![(vec![1], Status::Success), (vec![2], Status::InvalidData)]
        );
        assert!(conn.blob_db().is_idle());
    }

    #[test]
    fn unroutable_frames_are_dropped() {
        let mut conn = open_conn();
        let actions = conn.on_bytes_received(&frame(0x1234, &[1, 2, 3]));
        assert!(actions.is_empty());
        assert!(conn.is_connected());
    }

    #[test]
    fn phone_frames_become_events() {
        let mut conn = open_conn();
        let actions =
            conn.on_bytes_received(&frame(endpoints::PHONE_CONTROL, &[0x02, 0, 0, 0, 3]));
        assert_eq!(
            actions,
            vec![OutboundAction::Emit(WatchEvent::HangupCall { cookie: 3 })]
        );
    }

    #[test]
    fn last_registration_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut conn = open_conn();
        conn.register_endpoint(
            0x0030,
            Box::new(Recorder {
                log: log.clone(),
                tag: "a",
            }),
        );
        conn.register_endpoint(
            0x0030,
            Box::new(Recorder {
                log: log.clone(),
                tag: "b",
            }),
        );
        conn.on_bytes_received(&frame(0x0030, &[7]));
        conn.on_transport_closed();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["b:48:[7]".to_string(), "b:down".to_string()]
        );
    }

    #[test]
    fn teardown_fails_in_flight_exactly_once() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut conn = open_conn();
        conn.register_endpoint(
            0x0040,
            Box::new(Recorder {
                log: log.clone(),
                tag: "c",
            }),
        );
        conn.insert(Database::App, vec![9], vec![9]).unwrap();
        let actions = conn.shutdown();
        assert_eq!(results(&actions), vec![(vec![9], Status::TransportLost)]);
        assert_eq!(actions.last(), Some(&OutboundAction::Emit(WatchEvent::Disconnected)));
        assert!(conn.shutdown().is_empty());
        assert!(conn.on_transport_closed().is_empty());
        assert!(conn.on_transport_opened().is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["c:down".to_string()]);
    }

    #[test]
    fn reconnect_retransmits_backlog_in_order() {
        let mut conn = open_conn();
        for k in 1..=3u8 {
            conn.insert(Database::Pin, vec![k], vec![k]).unwrap();
        }
        let down = conn.on_transport_closed();
        assert_eq!(results(&down), vec![(vec![1], Status::TransportLost)]);

        let up = conn.on_transport_opened();
        let sent: Vec<BlobCommand> = up
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send { payload, .. } => BlobCommand::decode(payload).ok(),
                _ => None,
            })
            .collect();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key(), &[2]);
        assert_eq!(sent[0].operation(), Operation::Insert);
        let actions = conn.on_bytes_received(&response_frame(sent[0].token(), Status::Success));
        assert_eq!(results(&actions), vec![(vec![2], Status::Success)]);
        match &actions[1] {
            OutboundAction::Send { payload, .. } => {
                assert_eq!(BlobCommand::decode(payload).unwrap().key(), &[3]);
            }
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[test]
    fn repeated_malformed_frames_disconnect() {
        let mut conn = WatchConnection::new(LinkConfig {
            max_frame_payload: 16,
            max_malformed_frames: 2,
            ..LinkConfig::default()
        });
        conn.on_transport_opened();
        let actions = conn.on_bytes_received(&[0xFF; 8]);
        assert!(matches!(actions.last(), Some(OutboundAction::Disconnect(_))));
    }

    #[test]
    fn malformed_then_valid_frame_recovers() {
        let mut conn = WatchConnection::new(LinkConfig {
            max_frame_payload: 16,
            ..LinkConfig::default()
        });
        conn.on_transport_opened();
        let mut bytes = vec![0xFF];
        bytes.extend(frame(endpoints::PHONE_CONTROL, &[0x01, 0, 0, 0, 1]));
        let actions = conn.on_bytes_received(&bytes);
        assert_eq!(
            actions,
            vec![OutboundAction::Emit(WatchEvent::AnswerCall { cookie: 1 })]
        );
    }

    #[test]
    fn phone_send_requires_transport() {
        let mut conn = WatchConnection::new(LinkConfig::default());
        assert_eq!(
            conn.answer_call(1),
            Err(CommandError::Transport(TransportError::Closed))
        );
        assert_eq!(conn.send(0x0021, vec![]), Err(TransportError::Closed));
        assert!(matches!(
            conn.send(0x0030, vec![0; MAX_ENCODABLE_PAYLOAD_LEN + 1]),
            Err(TransportError::Encode(FrameEncodeError::TooLarge { .. }))
        ));
        conn.on_transport_opened();
        assert!(matches!(
            conn.hangup_call(1),
            Ok(OutboundAction::Send {
                endpoint: endpoints::PHONE_CONTROL,
                ..
            })
        ));
        assert!(matches!(
            conn.incoming_call(1, &"9".repeat(300), "x"),
            Err(CommandError::Phone(PhoneError::FieldTooLong { .. }))
        ));
    }

    #[test]
    fn blob_commands_queue_while_disconnected() {
        let mut conn = WatchConnection::with_first_token(LinkConfig::default(), 1);
        assert!(conn.clear_apps().is_empty());
        assert!(conn.set_units(false).unwrap().is_empty());
        assert_eq!(conn.blob_db().backlog_len(), 2);
        let actions = conn.on_transport_opened();
        assert_eq!(
            actions
                .iter()
                .filter(|a| matches!(a, OutboundAction::Send { .. }))
                .count(),
            1
        );
    }
}
