//! Persistent RPC backend: a long-lived evaluator in the guest, reachable
//! over a binary port, so state survives between calls.
//!
//! There is no Rserve-equivalent crate available to this project, so the
//! wire format is a small custom protocol: each request and response is a
//! single JSON value preceded by a 4-byte big-endian length prefix, sent
//! over a fresh `TcpStream` per call. The guest evaluator is expected to
//! speak the same framing (see the guest image contract).

use super::{is_guest_timeout, ExecOutcome, GuestTransport};
use crate::limits::ExecutionLimits;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{instrument, warn};

const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Request sent to the guest evaluator.
#[derive(Debug, Serialize)]
struct EvalRequest<'a> {
    code: &'a str,
    max_duration_secs: f64,
}

/// Response read back from the guest evaluator, matching the record shape
/// the code-wrapping harness produces: captured output, an optional
/// result value, and an optional error message.
#[derive(Debug, Deserialize)]
struct EvalResponse {
    output: String,
    result: Option<String>,
    error: Option<String>,
}

/// Talks to a persistent in-guest evaluator over `localhost:host_port`.
pub struct PersistentTransport {
    host_port: u16,
}

impl PersistentTransport {
    /// Build a transport bound to the session's discovered host port.
    pub fn new(host_port: u16) -> Self {
        Self { host_port }
    }

    async fn write_frame(stream: &mut TcpStream, payload: &[u8]) -> Result<()> {
        if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
            return Err(Error::ExecutionTransport(
                "request frame exceeds the maximum RPC size".to_string(),
            ));
        }
        stream
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            return Err(Error::ExecutionTransport(
                "response frame exceeds the maximum RPC size".to_string(),
            ));
        }
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

#[async_trait]
impl GuestTransport for PersistentTransport {
    #[instrument(skip(self, code, _container_id))]
    async fn execute(
        &self,
        _container_id: &str,
        code: &str,
        limits: ExecutionLimits,
    ) -> Result<ExecOutcome> {
        let started = Instant::now();
        let host_deadline = Duration::from_secs_f64(limits.max_duration_secs + 2.0);

        let call = async {
            let mut stream = TcpStream::connect(("127.0.0.1", self.host_port))
                .await
                .map_err(|e| Error::ExecutionTransport(format!("failed to connect to guest evaluator: {e}")))?;

            let request = EvalRequest {
                code,
                max_duration_secs: limits.max_duration_secs,
            };
            let request_bytes = serde_json::to_vec(&request)?;
            Self::write_frame(&mut stream, &request_bytes).await?;

            let response_bytes = Self::read_frame(&mut stream).await?;
            let response: EvalResponse = serde_json::from_slice(&response_bytes)
                .map_err(|e| Error::ExecutionTransport(format!("malformed evaluator response: {e}")))?;
            Ok::<EvalResponse, Error>(response)
        };

        let response = match tokio::time::timeout(host_deadline, call).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(host_port = self.host_port, "persistent RPC exceeded host deadline");
                return Ok(ExecOutcome {
                    output: String::new(),
                    result: None,
                    guest_error: Some(format!(
                        "elapsed time limit exceeded ({:.1}s)",
                        limits.max_duration_secs
                    )),
                    elapsed_secs: started.elapsed().as_secs_f64(),
                    exit_code: None,
                });
            }
        };

        Ok(ExecOutcome {
            output: response.output,
            result: response.result,
            guest_error: response.error,
            elapsed_secs: started.elapsed().as_secs_f64(),
            exit_code: None,
        })
    }
}

/// Classify an [`ExecOutcome`] produced by this backend into the
/// `execution_timeout` / `execution_error` split described in the error
/// model.
pub fn classify_guest_error(message: &str, elapsed_secs: f64) -> Error {
    if is_guest_timeout(message) {
        Error::ExecutionTimeout(elapsed_secs)
    } else {
        Error::ExecutionError(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_with_expected_fields() {
        let request = EvalRequest {
            code: "1 + 1",
            max_duration_secs: 5.0,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["code"], "1 + 1");
        assert_eq!(value["max_duration_secs"], 5.0);
    }

    #[test]
    fn response_deserializes_success_and_error_shapes() {
        let success: EvalResponse =
            serde_json::from_str(r#"{"output":"hi\n","result":"4","error":null}"#).unwrap();
        assert_eq!(success.result.as_deref(), Some("4"));
        assert!(success.error.is_none());

        let failure: EvalResponse =
            serde_json::from_str(r#"{"output":"","result":null,"error":"boom"}"#).unwrap();
        assert_eq!(failure.error.as_deref(), Some("boom"));
    }

    #[test]
    fn classifies_timeout_vs_execution_error() {
        assert!(matches!(
            classify_guest_error("Elapsed time limit exceeded", 1.5),
            Error::ExecutionTimeout(_)
        ));
        assert!(matches!(
            classify_guest_error("object 'y' not found", 1.5),
            Error::ExecutionError(_)
        ));
    }
}
