//! Contract shared by every protocol handler the connection routes frames to.

use crate::protocol::OutboundAction;

/// A handler for one or more endpoint ids.
///
/// Handlers see payloads with the frame envelope already stripped. They must not block:
/// anything slow is returned as an action for the host to carry out.
pub trait Endpoint: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Decode and react to a payload received on `endpoint`.
    fn on_payload(&mut self, endpoint: u16, payload: &[u8]) -> Vec<OutboundAction>;

    /// Transport is up; handlers with pending work may start sending.
    fn on_connected(&mut self) -> Vec<OutboundAction> {
        Vec::new()
    }

    /// Transport is gone. Fail anything that was waiting on the watch.
    fn on_disconnected(&mut self) -> Vec<OutboundAction> {
        Vec::new()
    }

    /// Periodic tick from the host (timeouts).
    fn tick(&mut self) -> Vec<OutboundAction> {
        Vec::new()
    }
}
