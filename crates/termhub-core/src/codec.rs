//! JSON text framing for the stream and control channels.
//!
//! Wire format: one JSON object per WebSocket text frame.

use crate::error::{TermError, TermResult};

/// Encode a serializable value into a JSON text frame.
pub fn encode<T: serde::Serialize>(value: &T) -> TermResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text frame into a typed value.
pub fn decode<T: serde::de::DeserializeOwned>(text: &str) -> TermResult<T> {
    serde_json::from_str(text).map_err(|e| TermError::InvalidMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;

    #[test]
    fn client_messages_use_type_tag() {
        let msg: ClientMessage = decode(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Input {
                data: "ls\n".into()
            }
        );

        let msg: ClientMessage = decode(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg, ClientMessage::Resize { cols: 120, rows: 40 });

        let msg: ClientMessage = decode(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn exit_event_shape() {
        let text = encode(&ServerMessage::Exit {
            code: 137,
            signal: Some("SIGKILL".into()),
        })
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "exit");
        assert_eq!(value["code"], 137);
        assert_eq!(value["signal"], "SIGKILL");
    }

    #[test]
    fn pong_is_bare() {
        assert_eq!(encode(&ServerMessage::Pong).unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn unknown_type_is_invalid_message() {
        let err = decode::<ClientMessage>(r#"{"type":"launch"}"#).unwrap_err();
        assert!(matches!(err, TermError::InvalidMessage(_)));
    }

    #[test]
    fn control_request_defaults() {
        let req: ControlRequest = decode(r#"{"op":"create","cwd":"/tmp/proj"}"#).unwrap();
        match req {
            ControlRequest::Create {
                cwd,
                name,
                command,
                args,
                env,
                persist,
            } => {
                assert_eq!(cwd, std::path::PathBuf::from("/tmp/proj"));
                assert!(name.is_none());
                assert!(command.is_none());
                assert!(args.is_empty());
                assert!(env.is_empty());
                assert!(!persist);
            }
            other => panic!("unexpected request: {other:?}"),
        }

        let req: ControlRequest = decode(r#"{"op":"close","id":"abc"}"#).unwrap();
        assert_eq!(
            req,
            ControlRequest::Close {
                id: "abc".into(),
                kill_persistent: true
            }
        );

        let req: ControlRequest = decode(r#"{"op":"recent","id":"abc"}"#).unwrap();
        assert_eq!(
            req,
            ControlRequest::Recent {
                id: "abc".into(),
                max_lines: 50
            }
        );

        let req: ControlRequest = decode(r#"{"op":"allocate_ports","count":3}"#).unwrap();
        assert_eq!(req, ControlRequest::AllocatePorts { count: 3 });
    }

    #[test]
    fn summary_is_camel_case() {
        let now = chrono::Utc::now();
        let summary = SessionSummary {
            id: "a1".into(),
            name: "proj".into(),
            cwd: "/tmp/proj".into(),
            status: SessionStatus::Idle,
            pid: Some(42),
            created_at: now,
            last_activity_at: now,
            persistent_name: None,
        };
        let value: serde_json::Value = serde_json::from_str(&encode(&summary).unwrap()).unwrap();
        assert_eq!(value["status"], "idle");
        assert!(value.get("lastActivityAt").is_some());
        assert!(value.get("persistentName").is_none());
    }

    #[test]
    fn error_response_shape() {
        let text = encode(&ControlResponse::not_found("session not found: x")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["result"], "error");
        assert_eq!(value["kind"], "not_found");
    }
}
