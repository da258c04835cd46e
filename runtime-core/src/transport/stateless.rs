//! One-shot `exec` backend: no interpreter state survives between calls.

use super::{ExecOutcome, GuestTransport};
use crate::container_runtime::ContainerRuntime;
use crate::limits::ExecutionLimits;
use crate::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

/// Invokes the guest's language runtime directly via `docker exec`,
/// passing the user's code as a single argv element (never a shell
/// string, so no escaping or quoting is ever needed).
pub struct StatelessTransport {
    runtime: ContainerRuntime,
    /// argv prefix the code is appended to, e.g. `["python3", "-c"]`.
    interpreter: Vec<String>,
}

impl StatelessTransport {
    /// Build a transport that runs `interpreter + [code]` per call.
    pub fn new(runtime: ContainerRuntime, interpreter: Vec<String>) -> Self {
        Self {
            runtime,
            interpreter,
        }
    }

    /// Convenience constructor for the default Python 3 interpreter.
    pub fn python3(runtime: ContainerRuntime) -> Self {
        Self::new(runtime, vec!["python3".to_string(), "-c".to_string()])
    }
}

#[async_trait]
impl GuestTransport for StatelessTransport {
    #[instrument(skip(self, code))]
    async fn execute(
        &self,
        container_id: &str,
        code: &str,
        limits: ExecutionLimits,
    ) -> Result<ExecOutcome> {
        let mut argv = self.interpreter.clone();
        argv.push(code.to_string());

        let deadline = Duration::from_secs_f64(limits.max_duration_secs + 2.0);
        let started = Instant::now();

        let exec_fut = self.runtime.exec(container_id, &argv);
        let (output, exit_code) = match tokio::time::timeout(deadline, exec_fut).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(container_id = %container_id, "stateless exec exceeded host deadline");
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

        let elapsed_secs = started.elapsed().as_secs_f64();
        let guest_error = if exit_code != 0 {
            Some(format!("process exited with status {exit_code}"))
        } else {
            None
        };

        Ok(ExecOutcome {
            output,
            result: None,
            guest_error,
            elapsed_secs,
            exit_code: Some(exit_code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_code_as_single_argv_element() {
        let interpreter = vec!["python3".to_string(), "-c".to_string()];
        let code = "print('it; works')";
        let mut argv = interpreter.clone();
        argv.push(code.to_string());
        assert_eq!(argv.len(), 3);
        assert_eq!(argv[2], code);
    }
}
