//! Request/response correlation over the agent socket.
//!
//! One entry point: [`forward`]. The caller parks on a rendezvous slot
//! until the matching response frame arrives, the deadline fires, or the
//! session goes away.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use super::protocol::{Frame, FrameType, RequestData, ResponseData};
use super::record::TunnelStatus;
use super::registry::TunnelRegistry;

/// A public HTTP request flattened for the wire: first header value per
/// name, body fully buffered.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// The reconstructed upstream response.
#[derive(Debug)]
pub struct ForwardResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("no tunnel for that subdomain")]
    NoSuchTunnel,
    #[error("tunnel is {0}")]
    TunnelUnavailable(TunnelStatus),
    #[error("failed to write request to the tunnel")]
    UpstreamWriteFailed,
    #[error("tunnel request timed out")]
    UpstreamTimeout,
    #[error("tunnel closed while the request was in flight")]
    TunnelClosed,
    #[error("agent error: {0}")]
    Agent(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Forward one public request through the tunnel for `subdomain`.
pub async fn forward(
    registry: &TunnelRegistry,
    subdomain: &str,
    request: ForwardRequest,
    deadline: Duration,
) -> Result<ForwardResponse, ForwardError> {
    let entry = registry
        .by_subdomain(subdomain)
        .ok_or(ForwardError::NoSuchTunnel)?;

    let status = entry.status();
    if status != TunnelStatus::Active {
        return Err(ForwardError::TunnelUnavailable(status));
    }
    let session = entry
        .session()
        .ok_or(ForwardError::TunnelUnavailable(status))?;

    let endpoint = request.path.clone();
    let bytes_in = request.body.len() as u64;
    let frame = request_frame(&request)?;
    let correlation_id = frame.id.clone();
    debug!(
        subdomain,
        correlation_id = %correlation_id,
        method = %request.method,
        path = %endpoint,
        "forwarding request through tunnel"
    );

    let started = Instant::now();
    let slot = session.send_request(frame).await?;

    // If the slot completes on the same tick the deadline elapses, the slot
    // wins: `timeout` polls the inner future first.
    let reply = match tokio::time::timeout(deadline, slot).await {
        Ok(Ok(reply)) => reply,
        // Slot sender vanished without completing; treat as a closed tunnel.
        Ok(Err(_)) => return Err(ForwardError::TunnelClosed),
        Err(_) => {
            session.remove_pending(&correlation_id);
            return Err(ForwardError::UpstreamTimeout);
        }
    };

    let frame = reply?;
    let data: ResponseData = serde_json::from_value(frame.data)
        .map_err(|e| ForwardError::Internal(format!("malformed response payload: {e}")))?;
    let response = ForwardResponse {
        status: data.status_code,
        headers: frame.headers,
        body: data.body,
    };

    // Fire-and-forget analytics: never extends the caller's latency, and a
    // lost update is acceptable.
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let status_code = response.status;
    let bytes = bytes_in + response.body.len() as u64;
    tokio::spawn(async move {
        entry.record_request(status_code, &endpoint, bytes, elapsed_ms);
    });

    Ok(response)
}

fn request_frame(request: &ForwardRequest) -> Result<Frame, ForwardError> {
    let data = serde_json::to_value(RequestData {
        method: request.method.clone(),
        path: request.path.clone(),
        query: request.query.clone(),
        body: request.body.clone(),
    })
    .map_err(|e| ForwardError::Internal(format!("failed to encode request frame: {e}")))?;
    let mut frame = Frame::control(FrameType::Request, data);
    frame.headers = request.headers.clone();
    Ok(frame)
}
