//! Wire format of the registry endpoint.
//!
//! Newline-delimited JSON: every line is one JSON-RPC 2.0 envelope and every
//! response is written back as one line.
//!
//! ```text
//! {"jsonrpc":"2.0","method":"query_instance","params":{"identifier":"/p"},"id":1}\n
//! ```

use crate::config::RegistryConfig;
use crate::registry::{ActiveInstance, Reservation, ReservationToken};
use crate::{RegistryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Method names understood by the endpoint.
pub mod methods {
    pub const QUERY_INSTANCE: &str = "query_instance";
    pub const LIST_INSTANCES: &str = "list_instances";
    pub const REGISTER_INSTANCE: &str = "register_instance";
    pub const UNREGISTER_INSTANCE: &str = "unregister_instance";
    pub const SHUTDOWN: &str = "shutdown";
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

impl IpcRequest {
    pub fn new(method: impl Into<String>, params: serde_json::Value, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(params),
            id: Some(serde_json::Value::Number(id.into())),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

impl IpcResponse {
    pub fn success(id: Option<serde_json::Value>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<serde_json::Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(IpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    pub fn from_error(id: Option<serde_json::Value>, err: &RegistryError) -> Self {
        Self::error(id, err.to_rpc_error_code(), err.to_string())
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// Method parameters. Address and token keys accept camelCase as well.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryParams {
    pub identifier: String,
    /// Reserve the identifier when it is absent.
    #[serde(default)]
    pub reserve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterParams {
    pub identifier: String,
    #[serde(alias = "serverAddress")]
    pub server_address: String,
    #[serde(
        default,
        alias = "reservationToken",
        skip_serializing_if = "Option::is_none"
    )]
    pub reservation_token: Option<ReservationToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterParams {
    pub identifier: String,
    #[serde(
        default,
        alias = "reservationToken",
        skip_serializing_if = "Option::is_none"
    )]
    pub reservation_token: Option<ReservationToken>,
}

/// Public view of an Active instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub identifier: String,
    pub server_address: String,
    pub registered_at: DateTime<Utc>,
    pub last_probe_success: Option<DateTime<Utc>>,
}

impl From<ActiveInstance> for InstanceSummary {
    fn from(instance: ActiveInstance) -> Self {
        Self {
            identifier: instance.identifier,
            server_address: instance.server_address,
            registered_at: instance.registered_at,
            last_probe_success: instance.last_probe_success,
        }
    }
}

/// A reservation handed to the caller that must now launch the editor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantedReservation {
    pub identifier: String,
    pub reservation_token: ReservationToken,
    pub expires_in_ms: u64,
}

impl GrantedReservation {
    pub fn from_reservation(reservation: Reservation, now: Instant) -> Self {
        let expires_in_ms = u64::try_from(reservation.expires_in(now).as_millis()).unwrap_or(u64::MAX);
        Self {
            identifier: reservation.identifier,
            reservation_token: reservation.token,
            expires_in_ms,
        }
    }
}

/// Non-null result of `query_instance`. Absence is encoded as JSON `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueryResult {
    Active(InstanceSummary),
    Reserved(GrantedReservation),
}

/// Read one newline-terminated frame.
///
/// Blank lines are skipped. A trailing `\r` is stripped. Returns `None` on
/// clean EOF, and the final unterminated line if the peer closed mid-line.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let max = RegistryConfig::MAX_IPC_MESSAGE_SIZE;

    loop {
        let mut line = Vec::new();
        // One byte over the limit leaves room for the terminator.
        let mut limited = (&mut *reader).take(max as u64 + 1);
        let read = limited.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Ok(None);
        }

        if line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        } else if line.len() > max {
            return Err(RegistryError::FrameTooLarge {
                size: line.len(),
                max,
            });
        }

        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return Ok(Some(line));
    }
}

/// Write one frame followed by a newline.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_ipc_request_serialization() {
        let req = IpcRequest::new(methods::LIST_INSTANCES, serde_json::json!({}), 1);
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains('\n'));

        let parsed: IpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.jsonrpc, "2.0");
        assert_eq!(parsed.method, "list_instances");
    }

    #[test]
    fn test_error_response_omits_result() {
        let resp = IpcResponse::error(None, -32700, "Parse error".to_string());
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32700);
        assert!(json["id"].is_null());
    }

    #[test]
    fn test_register_params_accept_both_casings() {
        let snake: RegisterParams = serde_json::from_value(serde_json::json!({
            "identifier": "/p",
            "server_address": "127.0.0.1:1",
            "reservation_token": "t"
        }))
        .unwrap();
        let camel: RegisterParams = serde_json::from_value(serde_json::json!({
            "identifier": "/p",
            "serverAddress": "127.0.0.1:1",
            "reservationToken": "t"
        }))
        .unwrap();
        assert_eq!(snake.server_address, camel.server_address);
        assert_eq!(snake.reservation_token, camel.reservation_token);

        let legacy: RegisterParams = serde_json::from_value(serde_json::json!({
            "identifier": "/p",
            "serverAddress": "127.0.0.1:1"
        }))
        .unwrap();
        assert!(legacy.reservation_token.is_none());
    }

    #[test]
    fn test_query_result_is_tagged_by_state() {
        let result = QueryResult::Reserved(GrantedReservation {
            identifier: "/p".into(),
            reservation_token: ReservationToken::from("tok"),
            expires_in_ms: 15_000,
        });
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["state"], "reserved");
        assert_eq!(json["reservation_token"], "tok");

        let back: QueryResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[tokio::test]
    async fn test_frames_split_on_newlines() {
        let input = b"{\"a\":1}\n\r\n\n{\"b\":2}\r\n{\"c\":3}".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(input));

        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"{\"a\":1}");
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"{\"b\":2}");
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"{\"c\":3}");
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_frame_terminates_line() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"{}").await.unwrap();
        assert_eq!(buf, b"{}\n");
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let input = vec![b'x'; RegistryConfig::MAX_IPC_MESSAGE_SIZE + 10];
        let mut reader = BufReader::new(std::io::Cursor::new(input));
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(matches!(err, RegistryError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_frame_at_limit_is_accepted() {
        let mut input = vec![b'x'; RegistryConfig::MAX_IPC_MESSAGE_SIZE];
        input.push(b'\n');
        let mut reader = BufReader::new(std::io::Cursor::new(input));
        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.len(), RegistryConfig::MAX_IPC_MESSAGE_SIZE);
    }
}
