//! BlobDB wire types: databases, operations, status codes, the command packet,
//! the response packet and the watch-initiated notify push.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reader::{ByteReader, Truncated};

/// Longest key or value a command can carry (single-byte length prefix).
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Watch-side database partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Database {
    Test = 0,
    Pin = 1,
    App = 2,
    Reminder = 3,
    Notification = 4,
    WeatherData = 5,
    SendTextData = 6,
    /// Health app settings (activity preferences, units).
    AppSettings = 7,
    Contacts = 8,
    /// Config data references.
    AppConfigs = 9,
}

impl Database {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Database::Test,
            1 => Database::Pin,
            2 => Database::App,
            3 => Database::Reminder,
            4 => Database::Notification,
            5 => Database::WeatherData,
            6 => Database::SendTextData,
            7 => Database::AppSettings,
            8 => Database::Contacts,
            9 => Database::AppConfigs,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Insert = 0x01,
    Delete = 0x04,
    Clear = 0x05,
    Notify = 0x08,
}

impl Operation {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Operation::Insert),
            0x04 => Some(Operation::Delete),
            0x05 => Some(Operation::Clear),
            0x08 => Some(Operation::Notify),
            _ => None,
        }
    }
}

/// Outcome of a command. Everything up to `DbIsStale` is reported by the watch;
/// `TransportLost` and `TimedOut` are decided on this side and never seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Ignore,
    Success,
    Failure,
    InvalidOperation,
    InvalidId,
    InvalidData,
    NoSuchKey,
    DbIsFull,
    DbIsStale,
    Unknown(u8),
    TransportLost,
    TimedOut,
}

impl Status {
    pub fn from_wire(v: u8) -> Self {
        match v {
            0x0 => Status::Ignore,
            0x1 => Status::Success,
            0x2 => Status::Failure,
            0x3 => Status::InvalidOperation,
            0x4 => Status::InvalidId,
            0x5 => Status::InvalidData,
            0x6 => Status::NoSuchKey,
            0x7 => Status::DbIsFull,
            0x8 => Status::DbIsStale,
            other => Status::Unknown(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    pub fn is_device_reported(self) -> bool {
        !matches!(self, Status::TransportLost | Status::TimedOut)
    }
}

/// Anything that can be stored in a BlobDB partition.
pub trait BlobItem {
    fn key(&self) -> Vec<u8>;
    fn value(&self) -> Vec<u8>;
}

/// One BlobDB command. Key and value lengths are checked at construction, so
/// `encode` cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobCommand {
    operation: Operation,
    token: u16,
    database: Database,
    timestamp: u32,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl BlobCommand {
    pub fn insert(database: Database, key: Vec<u8>, value: Vec<u8>) -> Result<Self, BlobDbError> {
        check_len("key", &key)?;
        check_len("value", &value)?;
        Ok(Self::build(Operation::Insert, database, key, value))
    }

    pub fn delete(database: Database, key: Vec<u8>) -> Result<Self, BlobDbError> {
        check_len("key", &key)?;
        Ok(Self::build(Operation::Delete, database, key, Vec::new()))
    }

    pub fn clear(database: Database) -> Self {
        Self::build(Operation::Clear, database, Vec::new(), Vec::new())
    }

    fn build(operation: Operation, database: Database, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            operation,
            token: 0,
            database,
            timestamp: unix_now(),
            key,
            value,
        }
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Zero until the queue transmits the command.
    pub fn token(&self) -> u16 {
        self.token
    }

    pub fn database(&self) -> Database {
        self.database
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub(crate) fn set_token(&mut self, token: u16) {
        self.token = token;
    }

    /// `[op][token LE][db][timestamp LE][key_len][key][value_len][value]`; Delete stops after
    /// the key, Clear after the timestamp.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(10 + self.key.len() + self.value.len());
        out.push(self.operation as u8);
        out.extend_from_slice(&self.token.to_le_bytes());
        out.push(self.database as u8);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        if matches!(self.operation, Operation::Insert | Operation::Delete) {
            out.push(self.key.len() as u8);
            out.extend_from_slice(&self.key);
        }
        if self.operation == Operation::Insert {
            out.push(self.value.len() as u8);
            out.extend_from_slice(&self.value);
        }
        out
    }

    /// Parse a command as the watch would see it.
    pub fn decode(bytes: &[u8]) -> Result<Self, BlobDbError> {
        let mut r = ByteReader::new(bytes);
        let op = r.u8()?;
        let operation = Operation::from_u8(op).ok_or(BlobDbError::UnknownOperation(op))?;
        let token = r.u16_le()?;
        let db = r.u8()?;
        let database = Database::from_u8(db).ok_or(BlobDbError::UnknownDatabase(db))?;
        let timestamp = r.u32_le()?;
        let (key, value) = match operation {
            Operation::Insert => {
                let key = r.short_bytes()?.to_vec();
                (key, r.short_bytes()?.to_vec())
            }
            Operation::Delete => (r.short_bytes()?.to_vec(), Vec::new()),
            Operation::Clear => (Vec::new(), Vec::new()),
            Operation::Notify => return Err(BlobDbError::UnexpectedOperation(operation)),
        };
        Ok(Self {
            operation,
            token,
            database,
            timestamp,
            key,
            value,
        })
    }
}

fn check_len(field: &'static str, bytes: &[u8]) -> Result<(), BlobDbError> {
    if bytes.len() > MAX_FIELD_LEN {
        return Err(BlobDbError::EncodingViolation {
            field,
            len: bytes.len(),
        });
    }
    Ok(())
}

pub(crate) fn unix_now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Watch reply to a command: `[token LE][status]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub token: u16,
    pub status: Status,
}

impl Response {
    pub fn decode(bytes: &[u8]) -> Result<Self, BlobDbError> {
        let mut r = ByteReader::new(bytes);
        let token = r.u16_le()?;
        let status = Status::from_wire(r.u8()?);
        Ok(Self { token, status })
    }

    /// Only device-reported statuses have a wire code; host-side ones encode as Failure.
    pub fn encode(&self) -> Vec<u8> {
        let code = match self.status {
            Status::Ignore => 0x0,
            Status::Success => 0x1,
            Status::InvalidOperation => 0x3,
            Status::InvalidId => 0x4,
            Status::InvalidData => 0x5,
            Status::NoSuchKey => 0x6,
            Status::DbIsFull => 0x7,
            Status::DbIsStale => 0x8,
            Status::Unknown(code) => code,
            Status::Failure | Status::TransportLost | Status::TimedOut => 0x2,
        };
        let mut out = self.token.to_le_bytes().to_vec();
        out.push(code);
        out
    }
}

/// Unsolicited push from the watch: `[Notify][timestamp LE][uuid][value]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPush {
    pub timestamp: u32,
    pub key: Uuid,
    pub value: Vec<u8>,
}

impl NotifyPush {
    pub fn decode(bytes: &[u8]) -> Result<Self, BlobDbError> {
        let mut r = ByteReader::new(bytes);
        let op = r.u8()?;
        match Operation::from_u8(op) {
            Some(Operation::Notify) => {}
            Some(other) => return Err(BlobDbError::UnexpectedOperation(other)),
            None => return Err(BlobDbError::UnknownOperation(op)),
        }
        let timestamp = r.u32_le()?;
        let key = r.uuid()?;
        let value = r.rest().to_vec();
        Ok(Self {
            timestamp,
            key,
            value,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(21 + self.value.len());
        out.push(Operation::Notify as u8);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(self.key.as_bytes());
        out.extend_from_slice(&self.value);
        out
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlobDbError {
    #[error("encoding violation: {field} is {len} bytes, limit is 255")]
    EncodingViolation { field: &'static str, len: usize },
    #[error("unknown operation 0x{0:02x}")]
    UnknownOperation(u8),
    #[error("unexpected operation {0:?}")]
    UnexpectedOperation(Operation),
    #[error("unknown database {0}")]
    UnknownDatabase(u8),
    #[error(transparent)]
    Truncated(#[from] Truncated),
}
