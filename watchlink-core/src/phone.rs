//! Phone control endpoint: call notifications to the watch, answer/hangup requests from it.
//! Fire-and-forget in both directions.

use serde::Serialize;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::protocol::{endpoints, OutboundAction, WatchEvent};
use crate::reader::{ByteReader, Truncated};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallAction {
    Answer = 0x01,
    Hangup = 0x02,
    GetState = 0x03,
    Incoming = 0x04,
    Outgoing = 0x05,
    Missed = 0x06,
    Ring = 0x07,
    Start = 0x08,
    End = 0x09,
    ResState = 0x83,
}

impl CallAction {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => CallAction::Answer,
            0x02 => CallAction::Hangup,
            0x03 => CallAction::GetState,
            0x04 => CallAction::Incoming,
            0x05 => CallAction::Outgoing,
            0x06 => CallAction::Missed,
            0x07 => CallAction::Ring,
            0x08 => CallAction::Start,
            0x09 => CallAction::End,
            0x83 => CallAction::ResState,
            _ => return None,
        })
    }
}

/// One entry of a state report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallState {
    pub action: CallAction,
    pub cookie: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CallEventKind {
    Incoming,
    Outgoing,
    Started,
    Ended,
    Missed,
}

/// Stateless; every method just encodes or decodes.
#[derive(Debug, Default)]
pub struct PhoneCallEndpoint;

impl PhoneCallEndpoint {
    pub fn new() -> Self {
        Self
    }

    pub fn send_answer(&self, cookie: u32) -> OutboundAction {
        control(CallAction::Answer, cookie, Vec::new())
    }

    pub fn send_hangup(&self, cookie: u32) -> OutboundAction {
        control(CallAction::Hangup, cookie, Vec::new())
    }

    pub fn send_get_state(&self, cookie: u32) -> OutboundAction {
        control(CallAction::GetState, cookie, Vec::new())
    }

    /// Tell the watch a call is ringing, with caller number and name.
    pub fn send_incoming_call(
        &self,
        cookie: u32,
        number: &str,
        name: &str,
    ) -> Result<OutboundAction, PhoneError> {
        let mut fields = Vec::with_capacity(2 + number.len() + name.len());
        push_short_str(&mut fields, "number", number)?;
        push_short_str(&mut fields, "name", name)?;
        Ok(control(CallAction::Incoming, cookie, fields))
    }

    pub fn send_call_started(&self, cookie: u32) -> OutboundAction {
        control(CallAction::Start, cookie, Vec::new())
    }

    pub fn send_call_ended(&self, cookie: u32, missed: bool) -> OutboundAction {
        let action = if missed {
            CallAction::Missed
        } else {
            CallAction::End
        };
        control(action, cookie, Vec::new())
    }

    /// Decode an inbound payload into the event it stands for.
    pub fn decode_event(payload: &[u8]) -> Result<WatchEvent, PhoneError> {
        let mut r = ByteReader::new(payload);
        let byte = r.u8()?;
        let action = CallAction::from_u8(byte).ok_or(PhoneError::UnknownAction(byte))?;
        let cookie = r.u32_be()?;
        let event = match action {
            CallAction::Answer => WatchEvent::AnswerCall { cookie },
            CallAction::Hangup => WatchEvent::HangupCall { cookie },
            CallAction::GetState => WatchEvent::CallStateRequested { cookie },
            CallAction::ResState => {
                let mut states = Vec::new();
                while !r.is_empty() {
                    let byte = r.u8()?;
                    let action =
                        CallAction::from_u8(byte).ok_or(PhoneError::UnknownAction(byte))?;
                    states.push(CallState {
                        action,
                        cookie: r.u32_be()?,
                    });
                }
                WatchEvent::CallState { cookie, states }
            }
            CallAction::Ring | CallAction::Incoming | CallAction::Outgoing => {
                let number = read_opt_str(&mut r)?;
                let name = read_opt_str(&mut r)?;
                let kind = if action == CallAction::Outgoing {
                    CallEventKind::Outgoing
                } else {
                    CallEventKind::Incoming
                };
                WatchEvent::Call {
                    kind,
                    cookie,
                    number,
                    name,
                }
            }
            CallAction::Start | CallAction::End | CallAction::Missed => {
                let kind = match action {
                    CallAction::Start => CallEventKind::Started,
                    CallAction::End => CallEventKind::Ended,
                    _ => CallEventKind::Missed,
                };
                WatchEvent::Call {
                    kind,
                    cookie,
                    number: None,
                    name: None,
                }
            }
        };
        Ok(event)
    }
}

impl Endpoint for PhoneCallEndpoint {
    fn name(&self) -> &'static str {
        "phone"
    }

    fn on_payload(&mut self, _endpoint: u16, payload: &[u8]) -> Vec<OutboundAction> {
        match Self::decode_event(payload) {
            Ok(event) => {
                debug!(?event, "phone event");
                vec![OutboundAction::Emit(event)]
            }
            Err(e) => {
                warn!("dropping phone payload: {e}");
                Vec::new()
            }
        }
    }
}

fn control(action: CallAction, cookie: u32, fields: Vec<u8>) -> OutboundAction {
    let mut payload = Vec::with_capacity(5 + fields.len());
    payload.push(action as u8);
    payload.extend_from_slice(&cookie.to_be_bytes());
    payload.extend_from_slice(&fields);
    OutboundAction::send(endpoints::PHONE_CONTROL, payload)
}

fn push_short_str(out: &mut Vec<u8>, field: &'static str, s: &str) -> Result<(), PhoneError> {
    if s.len() > u8::MAX as usize {
        return Err(PhoneError::FieldTooLong {
            field,
            len: s.len(),
        });
    }
    out.push(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn read_opt_str(r: &mut ByteReader<'_>) -> Result<Option<String>, PhoneError> {
    if r.is_empty() {
        return Ok(None);
    }
    let raw = r.short_bytes()?;
    Ok(Some(String::from_utf8_lossy(raw).into_owned()))
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PhoneError {
    #[error("{field} is {len} bytes, limit is 255")]
    FieldTooLong { field: &'static str, len: usize },
    #[error("unknown call action 0x{0:02x}")]
    UnknownAction(u8),
    #[error(transparent)]
    Truncated(#[from] Truncated),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(action: OutboundAction) -> Vec<u8> {
        match action {
            OutboundAction::Send { endpoint, payload } => {
                assert_eq!(endpoint, endpoints::PHONE_CONTROL);
                payload
            }
            other => panic!("expected Send, got {:?}", other),
        }
    }

    #[test]
    fn outbound_answer_hangup_get_state() {
        let phone = PhoneCallEndpoint::new();
        assert_eq!(
            payload_of(phone.send_answer(0x0102_0304)),
            vec![0x01, 0x01, 0x02, 0x03, 0x04]
        );
        assert_eq!(payload_of(phone.send_hangup(7)), vec![0x02, 0, 0, 0, 7]);
        assert_eq!(payload_of(phone.send_get_state(7)), vec![0x03, 0, 0, 0, 7]);
    }

    #[test]
    fn outbound_incoming_call_strings() {
        let phone = PhoneCallEndpoint::new();
        let payload = payload_of(phone.send_incoming_call(1, "555", "Ann").unwrap());
        assert_eq!(
            payload,
            vec![0x04, 0, 0, 0, 1, 3, b'5', b'5', b'5', 3, b'A', b'n', b'n']
        );
        assert_eq!(
            payload_of(phone.send_call_ended(1, true))[0],
            CallAction::Missed as u8
        );
        assert_eq!(
            payload_of(phone.send_call_ended(1, false))[0],
            CallAction::End as u8
        );
    }

    #[test]
    fn outbound_string_too_long() {
        let phone = PhoneCallEndpoint::new();
        let long = "x".repeat(256);
        assert_eq!(
            phone.send_incoming_call(1, &long, "Ann"),
            Err(PhoneError::FieldTooLong {
                field: "number",
                len: 256
            })
        );
    }

    #[test]
    fn inbound_answer_and_hangup() {
        assert_eq!(
            PhoneCallEndpoint::decode_event(&[0x01, 0, 0, 0, 9]).unwrap(),
            WatchEvent::AnswerCall { cookie: 9 }
        );
        assert_eq!(
            PhoneCallEndpoint::decode_event(&[0x02, 0, 0, 1, 0]).unwrap(),
            WatchEvent::HangupCall { cookie: 256 }
        );
    }

    #[test]
    fn inbound_res_state_list() {
        let payload = [0x83, 0, 0, 0, 1, 0x08, 0, 0, 0, 2, 0x04, 0, 0, 0, 3];
        assert_eq!(
            PhoneCallEndpoint::decode_event(&payload).unwrap(),
            WatchEvent::CallState {
                cookie: 1,
                states: vec![
                    CallState {
                        action: CallAction::Start,
                        cookie: 2
                    },
                    CallState {
                        action: CallAction::Incoming,
                        cookie: 3
                    },
                ],
            }
        );
        assert!(matches!(
            PhoneCallEndpoint::decode_event(&payload[..12]),
            Err(PhoneError::Truncated(_))
        ));
    }

    #[test]
    fn inbound_ring_and_end() {
        let payload = [0x07, 0, 0, 0, 4, 2, b'4', b'2', 3, b'B', b'o', b'b'];
        assert_eq!(
            PhoneCallEndpoint::decode_event(&payload).unwrap(),
            WatchEvent::Call {
                kind: CallEventKind::Incoming,
                cookie: 4,
                number: Some("42".to_string()),
                name: Some("Bob".to_string()),
            }
        );
        assert_eq!(
            PhoneCallEndpoint::decode_event(&[0x09, 0, 0, 0, 4]).unwrap(),
            WatchEvent::Call {
                kind: CallEventKind::Ended,
                cookie: 4,
                number: None,
                name: None,
            }
        );
    }

    #[test]
    fn bad_payload_is_dropped_not_fatal() {
        let mut phone = PhoneCallEndpoint::new();
        assert!(phone.on_payload(endpoints::PHONE_CONTROL, &[0x55]).is_empty());
        assert!(phone.on_payload(endpoints::PHONE_CONTROL, &[]).is_empty());
        let actions = phone.on_payload(endpoints::PHONE_CONTROL, &[0x01, 0, 0, 0, 1]);
        assert_eq!(
            actions,
            vec![OutboundAction::Emit(WatchEvent::AnswerCall { cookie: 1 })]
        );
    }
}
