//! Timeline items: pins, notifications and reminders as stored in BlobDB and pushed by the watch.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::blobdb::BlobItem;
use crate::reader::{ByteReader, Truncated};

const HEADER_LEN: usize = 16 + 16 + 4 + 2 + 1 + 2 + 1 + 2 + 1 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemKind {
    Notification = 1,
    Pin = 2,
    Reminder = 3,
}

impl ItemKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ItemKind::Notification),
            2 => Some(ItemKind::Pin),
            3 => Some(ItemKind::Reminder),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub id: u8,
    pub data: Vec<u8>,
}

impl Attribute {
    pub fn text(id: u8, s: &str) -> Self {
        Self {
            id,
            data: s.as_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub id: u8,
    pub kind: u8,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineItem {
    pub item_id: Uuid,
    pub parent_id: Uuid,
    pub timestamp: u32,
    /// Minutes.
    pub duration: u16,
    pub kind: ItemKind,
    pub flags: u16,
    pub layout: u8,
    pub attributes: Vec<Attribute>,
    pub actions: Vec<Action>,
}

impl TimelineItem {
    pub fn decode(bytes: &[u8]) -> Result<Self, TimelineError> {
        let mut r = ByteReader::new(bytes);
        let item_id = r.uuid()?;
        let parent_id = r.uuid()?;
        let timestamp = r.u32_le()?;
        let duration = r.u16_le()?;
        let kind_byte = r.u8()?;
        let kind = ItemKind::from_u8(kind_byte).ok_or(TimelineError::UnknownKind(kind_byte))?;
        let flags = r.u16_le()?;
        let layout = r.u8()?;
        let data_len = r.u16_le()? as usize;
        let attr_count = r.u8()?;
        let action_count = r.u8()?;

        let mut body = ByteReader::new(r.take(data_len)?);
        let attributes = read_attributes(&mut body, attr_count)?;
        let mut actions = Vec::with_capacity(action_count as usize);
        for _ in 0..action_count {
            let id = body.u8()?;
            let kind = body.u8()?;
            let count = body.u8()?;
            actions.push(Action {
                id,
                kind,
                attributes: read_attributes(&mut body, count)?,
            });
        }
        if !body.is_empty() {
            return Err(TimelineError::TrailingBytes(body.remaining()));
        }
        Ok(Self {
            item_id,
            parent_id,
            timestamp,
            duration,
            kind,
            flags,
            layout,
            attributes,
            actions,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        write_attributes(&mut body, &self.attributes);
        for action in &self.actions {
            body.push(action.id);
            body.push(action.kind);
            body.push(action.attributes.len() as u8);
            write_attributes(&mut body, &action.attributes);
        }
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(self.item_id.as_bytes());
        out.extend_from_slice(self.parent_id.as_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.duration.to_le_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.push(self.layout);
        out.extend_from_slice(&(body.len() as u16).to_le_bytes());
        out.push(self.attributes.len() as u8);
        out.push(self.actions.len() as u8);
        out.extend_from_slice(&body);
        out
    }
}

impl BlobItem for TimelineItem {
    fn key(&self) -> Vec<u8> {
        self.item_id.as_bytes().to_vec()
    }

    fn value(&self) -> Vec<u8> {
        self.encode()
    }
}

fn read_attributes(r: &mut ByteReader<'_>, count: u8) -> Result<Vec<Attribute>, TimelineError> {
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id = r.u8()?;
        let len = r.u16_le()? as usize;
        out.push(Attribute {
            id,
            data: r.take(len)?.to_vec(),
        });
    }
    Ok(out)
}

fn write_attributes(out: &mut Vec<u8>, attributes: &[Attribute]) {
    for attr in attributes {
        out.push(attr.id);
        out.extend_from_slice(&(attr.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&attr.data);
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimelineError {
    #[error("unknown timeline item type {0}")]
    UnknownKind(u8),
    #[error("{0} unparsed bytes after attributes and actions")]
    TrailingBytes(usize),
    #[error(transparent)]
    Truncated(#[from] Truncated),
}
