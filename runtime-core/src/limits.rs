//! Per-call execution limits.

use crate::{Error, Result};
use serde_json::Value;

/// Resolved, validated limits for a single `execute_in_session` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionLimits {
    /// Wall-clock budget for the call, in seconds.
    pub max_duration_secs: f64,
    /// Cap on captured output, in bytes.
    pub max_output_bytes: usize,
}

impl ExecutionLimits {
    /// Parse an optional limits payload, falling back to the given
    /// defaults for any field left unset. `payload` is expected to be a
    /// JSON object if present; anything else is `invalid_limits`.
    pub fn from_payload(
        payload: Option<&Value>,
        default_duration_secs: f64,
        default_output_bytes: usize,
    ) -> Result<Self> {
        let payload = match payload {
            None => {
                return Ok(Self {
                    max_duration_secs: default_duration_secs,
                    max_output_bytes: default_output_bytes,
                })
            }
            Some(v) => v,
        };
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidLimits("limits must be an object".to_string()))?;

        let duration = match obj.get("max_duration_secs") {
            None => default_duration_secs,
            Some(v) => v.as_f64().ok_or_else(|| {
                Error::InvalidLimits("max_duration_secs must be a number".to_string())
            })?,
        };
        if duration <= 0.0 {
            return Err(Error::InvalidLimits(
                "max_duration_secs must be > 0".to_string(),
            ));
        }

        let output_bytes = match obj.get("max_output_bytes") {
            None => default_output_bytes as i64,
            Some(v) => v.as_i64().ok_or_else(|| {
                Error::InvalidLimits("max_output_bytes must be an integer".to_string())
            })?,
        };
        if output_bytes <= 0 {
            return Err(Error::InvalidLimits(
                "max_output_bytes must be > 0".to_string(),
            ));
        }

        Ok(Self {
            max_duration_secs: duration,
            max_output_bytes: output_bytes as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn none_uses_defaults() {
        let limits = ExecutionLimits::from_payload(None, 30.0, 65_536).unwrap();
        assert_eq!(limits.max_duration_secs, 30.0);
        assert_eq!(limits.max_output_bytes, 65_536);
    }

    #[test]
    fn overrides_apply() {
        let payload = json!({"max_duration_secs": 5, "max_output_bytes": 1024});
        let limits = ExecutionLimits::from_payload(Some(&payload), 30.0, 65_536).unwrap();
        assert_eq!(limits.max_duration_secs, 5.0);
        assert_eq!(limits.max_output_bytes, 1024);
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let payload = json!([1, 2, 3]);
        assert!(ExecutionLimits::from_payload(Some(&payload), 30.0, 65_536).is_err());
    }

    #[test]
    fn non_positive_values_are_rejected() {
        assert!(ExecutionLimits::from_payload(
            Some(&json!({"max_duration_secs": 0})),
            30.0,
            65_536
        )
        .is_err());
        assert!(ExecutionLimits::from_payload(
            Some(&json!({"max_output_bytes": -1})),
            30.0,
            65_536
        )
        .is_err());
    }

    #[test]
    fn non_numeric_values_are_rejected() {
        assert!(ExecutionLimits::from_payload(
            Some(&json!({"max_duration_secs": "soon"})),
            30.0,
            65_536
        )
        .is_err());
    }
}
