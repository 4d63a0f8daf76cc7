//! Application boundary: JSON command lines on stdin, JSON event lines on stdout.

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use watchlink_core::{
    AppInfo, CommandError, Database, HealthParams, OutboundAction, WatchConnection, WatchEvent,
};

use crate::transport::Request;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    InsertApp {
        app: AppInfo,
        #[serde(default)]
        force: bool,
    },
    RemoveApp {
        app: AppInfo,
    },
    ClearApps,
    Insert {
        database: Database,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Remove {
        database: Database,
        key: Vec<u8>,
    },
    Clear {
        database: Database,
    },
    SetHealthParams {
        params: HealthParams,
    },
    SetUnits {
        imperial: bool,
    },
    AnswerCall {
        cookie: u32,
    },
    HangupCall {
        cookie: u32,
    },
    GetCallState {
        cookie: u32,
    },
    IncomingCall {
        cookie: u32,
        number: String,
        #[serde(default)]
        name: String,
    },
    CallStarted {
        cookie: u32,
    },
    CallEnded {
        cookie: u32,
        #[serde(default)]
        missed: bool,
    },
}

pub fn parse_line(line: &str) -> Result<Command, serde_json::Error> {
    serde_json::from_str(line)
}

/// Run one command against the connection.
pub fn apply(conn: &mut WatchConnection, cmd: Command) -> Result<Vec<OutboundAction>, CommandError> {
    let one = |r: Result<OutboundAction, CommandError>| r.map(|a| vec![a]);
    match cmd {
        Command::InsertApp { app, force } => conn.insert_app_metadata(&app, force),
        Command::RemoveApp { app } => conn.remove_app(&app),
        Command::ClearApps => Ok(conn.clear_apps()),
        Command::Insert {
            database,
            key,
            value,
        } => conn.insert(database, key, value),
        Command::Remove { database, key } => conn.remove(database, key),
        Command::Clear { database } => Ok(conn.clear(database)),
        Command::SetHealthParams { params } => conn.set_health_params(&params),
        Command::SetUnits { imperial } => conn.set_units(imperial),
        Command::AnswerCall { cookie } => one(conn.answer_call(cookie)),
        Command::HangupCall { cookie } => one(conn.hangup_call(cookie)),
        Command::GetCallState { cookie } => one(conn.get_call_state(cookie)),
        Command::IncomingCall {
            cookie,
            number,
            name,
        } => one(conn.incoming_call(cookie, &number, &name)),
        Command::CallStarted { cookie } => one(conn.call_started(cookie)),
        Command::CallEnded { cookie, missed } => one(conn.call_ended(cookie, missed)),
    }
}

/// What the link task reports to the application.
#[derive(Debug, PartialEq)]
pub enum Output {
    Event(WatchEvent),
    /// A command rejected before it reached the watch.
    CommandFailed(CommandError),
}

impl Output {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        match self {
            Output::Event(event) => serde_json::to_string(event),
            Output::CommandFailed(err) => serde_json::to_string(&serde_json::json!({
                "event": "commandFailed",
                "error": err.to_string(),
            })),
        }
    }
}

/// Read commands from stdin until EOF. Unparseable lines are logged and skipped.
pub async fn read_commands(tx: mpsc::Sender<Request>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_line(line) {
                    Ok(cmd) => {
                        debug!(?cmd, "command");
                        if tx.send(Request::Command(cmd)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("bad command line: {e}"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("stdin: {e}");
                break;
            }
        }
    }
}

/// Write each output as one JSON line on stdout.
pub async fn write_outputs(mut rx: mpsc::UnboundedReceiver<Output>) {
    let mut out = tokio::io::stdout();
    while let Some(output) = rx.recv().await {
        let mut line = match output.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("unserializable output: {e}");
                continue;
            }
        };
        line.push('\n');
        if out.write_all(line.as_bytes()).await.is_err() || out.flush().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchlink_core::{LinkConfig, TransportError};

    #[test]
    fn parses_tagged_commands() {
        assert_eq!(
            parse_line(r#"{"cmd":"insert","database":"pin","key":[1,2],"value":[3]}"#).unwrap(),
            Command::Insert {
                database: Database::Pin,
                key: vec![1, 2],
                value: vec![3],
            }
        );
        assert_eq!(
            parse_line(r#"{"cmd":"call_ended","cookie":7}"#).unwrap(),
            Command::CallEnded {
                cookie: 7,
                missed: false
            }
        );
        assert_eq!(parse_line(r#"{"cmd":"clear_apps"}"#).unwrap(), Command::ClearApps);
        assert!(parse_line(r#"{"cmd":"reboot"}"#).is_err());
    }

    #[test]
    fn parses_app_info() {
        let uuid = uuid::Uuid::new_v4();
        let line = format!(
            r#"{{"cmd":"insert_app","app":{{"uuid":"{uuid}","short_name":"Clock","version_major":1,"version_minor":2,"binaries":{{"basalt":{{"sdk_major":5,"sdk_minor":86,"icon_resource_id":3}}}}}}}}"#
        );
        match parse_line(&line).unwrap() {
            Command::InsertApp { app, force } => {
                assert_eq!(app.uuid, uuid);
                assert_eq!(app.short_name, "Clock");
                assert!(!force);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn phone_command_while_down_reports_failure() {
        let mut conn = WatchConnection::new(LinkConfig::default());
        let err = apply(&mut conn, Command::AnswerCall { cookie: 1 }).unwrap_err();
        assert_eq!(err, CommandError::Transport(TransportError::Closed));
        let line = Output::CommandFailed(err).to_line().unwrap();
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["event"], "commandFailed");
        assert_eq!(json["error"], "transport closed");
    }

    #[test]
    fn blob_command_while_down_is_queued() {
        let mut conn = WatchConnection::new(LinkConfig::default());
        let actions = apply(&mut conn, Command::SetUnits { imperial: true }).unwrap();
        assert!(actions.is_empty());
        assert_eq!(conn.blob_db().backlog_len(), 1);
    }
}
