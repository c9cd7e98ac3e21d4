//! Helper wire encoding: `base64(json(value))` on a single line.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::DaemonError;

/// Encode a request as the helper's positional argument.
pub fn encode_request<T: Serialize>(request: &T) -> Result<String, DaemonError> {
    let json = serde_json::to_vec(request)?;
    Ok(STANDARD.encode(json))
}

/// Decode one helper stdout line.
///
/// Every failure is reported as `HelperProtocol` so callers can tell a
/// misbehaving helper from a local fault.
pub fn decode_payload<T: DeserializeOwned>(line: &str) -> Result<T, DaemonError> {
    let bytes = STANDARD
        .decode(line.trim())
        .map_err(|e| DaemonError::HelperProtocol(format!("invalid base64 {line:?}: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        DaemonError::HelperProtocol(format!(
            "invalid JSON {:?}: {e}",
            String::from_utf8_lossy(&bytes)
        ))
    })
}
