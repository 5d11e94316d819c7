//! Decoding of RPC reply bodies.

use crate::error::{Result, RpcError};
use chrono::{DateTime, Utc};
use choria_client::Reply;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome reported by an agent for one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StatusCode {
    /// The action succeeded.
    Ok = 0,
    /// The action was aborted by the agent.
    Aborted = 1,
    /// The agent has no such action.
    UnknownAction = 2,
    /// Required input was missing.
    MissingData = 3,
    /// Input failed validation.
    InvalidData = 4,
    /// Any other failure.
    UnknownError = 5,
}

impl TryFrom<u8> for StatusCode {
    type Error = String;

    fn try_from(code: u8) -> std::result::Result<Self, Self::Error> {
        match code {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::Aborted),
            2 => Ok(StatusCode::UnknownAction),
            3 => Ok(StatusCode::MissingData),
            4 => Ok(StatusCode::InvalidData),
            5 => Ok(StatusCode::UnknownError),
            other => Err(format!("invalid status code {}", other)),
        }
    }
}

impl From<StatusCode> for u8 {
    fn from(code: StatusCode) -> u8 {
        code as u8
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::Aborted => "Aborted",
            StatusCode::UnknownAction => "Unknown Action",
            StatusCode::MissingData => "Missing Data",
            StatusCode::InvalidData => "Invalid Data",
            StatusCode::UnknownError => "Unknown Error",
        };
        write!(f, "{}", name)
    }
}

/// A decoded reply body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcReply {
    /// Status reported by the agent.
    pub statuscode: StatusCode,
    /// Human readable status.
    #[serde(default)]
    pub statusmsg: String,
    /// Action specific result data.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Action the reply answers.
    #[serde(skip)]
    pub action: String,
    /// Node that sent the reply.
    #[serde(skip)]
    pub sender: String,
    /// When the reply was decoded.
    #[serde(skip)]
    pub time_utc: Option<DateTime<Utc>>,
}

impl RpcReply {
    /// Builds a reply body, mostly useful for agents and tests.
    pub fn new(statuscode: StatusCode, statusmsg: &str, data: serde_json::Value) -> Self {
        Self {
            statuscode,
            statusmsg: statusmsg.to_string(),
            data,
            action: String::new(),
            sender: String::new(),
            time_utc: None,
        }
    }

    /// Returns true when the agent reported success.
    pub fn is_ok(&self) -> bool {
        self.statuscode == StatusCode::Ok
    }

    /// Encodes the body as sent by agents.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decodes the body of `reply` to `action`.
pub fn parse_reply(reply: &Reply, action: &str) -> Result<RpcReply> {
    let mut parsed: RpcReply =
        serde_json::from_str(reply.message()).map_err(|e| RpcError::InvalidReply {
            sender: reply.sender_id().to_string(),
            reason: e.to_string(),
        })?;

    parsed.action = action.to_string();
    parsed.sender = reply.sender_id().to_string();
    parsed.time_utc = Some(Utc::now());

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use choria_client::{Message, RequestType};
    use serde_json::json;

    fn reply_with(body: &str) -> Reply {
        let msg =
            Message::new("{}", "package", "mcollective", "me", "r1", RequestType::Direct).unwrap();
        Reply::new(&msg, "n1", body)
    }

    #[test]
    fn test_parse_ok_reply() {
        let reply = reply_with(r#"{"statuscode":0,"statusmsg":"OK","data":{"version":"1.2"}}"#);
        let parsed = parse_reply(&reply, "status").unwrap();

        assert!(parsed.is_ok());
        assert_eq!(parsed.statusmsg, "OK");
        assert_eq!(parsed.data["version"], "1.2");
        assert_eq!(parsed.sender, "n1");
        assert_eq!(parsed.action, "status");
        assert!(parsed.time_utc.is_some());
    }

    #[test]
    fn test_parse_failure_status() {
        let reply = reply_with(r#"{"statuscode":4,"statusmsg":"bad input"}"#);
        let parsed = parse_reply(&reply, "status").unwrap();

        assert!(!parsed.is_ok());
        assert_eq!(parsed.statuscode, StatusCode::InvalidData);
        assert_eq!(parsed.data, serde_json::Value::Null);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_reply(&reply_with("not json"), "status").unwrap_err();
        assert!(matches!(err, RpcError::InvalidReply { ref sender, .. } if sender == "n1"));
    }

    #[test]
    fn test_parse_rejects_unknown_status_code() {
        assert!(parse_reply(&reply_with(r#"{"statuscode":9}"#), "status").is_err());
    }

    #[test]
    fn test_to_json_is_numeric_status() {
        let body = RpcReply::new(StatusCode::Aborted, "stopped", json!({"x": 1}))
            .to_json()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["statuscode"], 1);
        assert!(value.get("sender").is_none());
    }

    #[test]
    fn test_status_code_display() {
        assert_eq!(StatusCode::Ok.to_string(), "OK");
        assert_eq!(StatusCode::UnknownAction.to_string(), "Unknown Action");
    }
}
