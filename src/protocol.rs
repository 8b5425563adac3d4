use crate::deploy::{DeployPhase, RestartKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Full status snapshot: every process plus the deployer phase.
    Status,
    Start {
        name: String,
    },
    Stop {
        name: String,
    },
    Restart {
        name: String,
    },
    /// Request a deploy restart; `force` pre-empts the quiescence wait.
    Update {
        #[serde(default)]
        force: bool,
    },
    /// Cancel a pending restart (only while waiting for quiescence).
    Cancel,
    /// Orderly shutdown, exit code 0.
    Kill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
    Status {
        snapshot: StatusSnapshot,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::NotStarted => write!(f, "not started"),
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Stopping => write!(f, "stopping"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Crashed => write!(f, "crashed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(default)]
    pub restarts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub optional: bool,
}

/// Read-only aggregate published each tick for external observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub processes: Vec<ProcessReport>,
    pub phase: DeployPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<RestartKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(req)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(resp)?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_request(req: &Request) -> Request {
        let bytes = encode_request(req).unwrap();
        decode_request(std::str::from_utf8(&bytes).unwrap()).unwrap()
    }

    fn roundtrip_response(resp: &Response) -> Response {
        let bytes = encode_response(resp).unwrap();
        decode_response(std::str::from_utf8(&bytes).unwrap()).unwrap()
    }

    #[test]
    fn test_request_roundtrips() {
        for req in [
            Request::Status,
            Request::Start {
                name: "bot".to_string(),
            },
            Request::Stop {
                name: "bot".to_string(),
            },
            Request::Restart {
                name: "mcp".to_string(),
            },
            Request::Update { force: true },
            Request::Update { force: false },
            Request::Cancel,
            Request::Kill,
        ] {
            assert_eq!(roundtrip_request(&req), req);
        }
    }

    #[test]
    fn test_status_response_roundtrip() {
        let resp = Response::Status {
            snapshot: StatusSnapshot {
                processes: vec![ProcessReport {
                    name: "bot".to_string(),
                    pid: Some(1234),
                    status: ProcessStatus::Running,
                    uptime: Some(3600),
                    restarts: 2,
                    last_exit_code: Some(1),
                    optional: false,
                }],
                phase: DeployPhase::WaitingForQuiescence,
                pending: Some(RestartKind::Update),
                target_ref: Some("abc123".to_string()),
            },
        };
        assert_eq!(roundtrip_response(&resp), resp);
    }

    #[test]
    fn test_error_response_roundtrip() {
        let resp = Response::Error {
            message: "process not found".to_string(),
        };
        assert_eq!(roundtrip_response(&resp), resp);
    }

    #[test]
    fn test_decode_invalid_json() {
        let result = decode_request("not json at all");
        assert!(matches!(result.unwrap_err(), ProtocolError::Json(_)));
    }

    #[test]
    fn test_update_force_defaults_false() {
        let req = decode_request(r#"{"type":"update"}"#).unwrap();
        assert_eq!(req, Request::Update { force: false });
    }

    #[test]
    fn test_encode_appends_newline() {
        let bytes = encode_request(&Request::Status).unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
    }

    #[test]
    fn test_process_status_display() {
        assert_eq!(ProcessStatus::Running.to_string(), "running");
        assert_eq!(ProcessStatus::NotStarted.to_string(), "not started");
        assert_eq!(ProcessStatus::Crashed.to_string(), "crashed");
    }
}
