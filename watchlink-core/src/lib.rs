//! Watch link protocol implementation.
//! Host-driven: no I/O; host passes transport events and receives actions.

pub mod blobdb;
pub mod endpoint;
pub mod metadata;
pub mod phone;
pub mod protocol;
pub mod queue;
pub mod reader;
pub mod timeline;
pub mod wire;

pub mod core;

pub use blobdb::{BlobCommand, BlobDbError, BlobItem, Database, Operation, Status};
pub use crate::core::{CommandError, LinkConfig, TransportError, WatchConnection};
pub use endpoint::Endpoint;
pub use metadata::{AppInfo, HardwarePlatform, HealthParams};
pub use phone::PhoneCallEndpoint;
pub use protocol::{endpoints, OutboundAction, WatchEvent};
pub use queue::BlobDb;
pub use wire::{decode_frame, encode_frame, Frame, FrameBuffer, FrameDecodeError, FrameEncodeError};
