//! Per-connection protocol
//!
//! One connection carries one session:
//!
//! ```text
//! client                                   daemon
//!   │ {"content":"...","session_id":"s1"}\n  │
//!   │──────────────────────────────────────▶│ validate + admit
//!   │                                        │
//!   │ {"status":"rejected",...}\n            │ (rejected: close)
//!   │◀──────────────────────────────────────│
//!   │                   or                   │
//!   │ envelope\n envelope\n ... terminal\n   │ (flushed one by one)
//!   │◀──────────────────────────────────────│ close
//! ```
//!
//! While streaming, the read half is watched: EOF or a read error means the
//! client went away and the session is cancelled. Clients must keep their
//! write half open until the terminal frame arrives.
//!
//! Every frame write is bounded by [`ConnectionLimits::write_timeout`]. A
//! client that stops reading is treated as gone, so it cannot pin a session
//! slot. An envelope that fails to encode is replaced by a terminal `error`
//! frame and the session is cancelled behind it.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use relay_core::{
    CancelReason, FrameDecoder, FrameEncoder, Rejection, RejectionCode, RequestError,
    SessionStatus, StreamManager, StreamRequest, TransportError,
};

/// Read buffer size for client input
const READ_BUFFER_SIZE: usize = 8192;

/// How a connection ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The client left before sending a complete request
    NoRequest,
    /// The request was answered with a rejection line
    Rejected(RejectionCode),
    /// A session ran to its terminal envelope
    Streamed(SessionStatus),
}

/// Limits applied to one connection
#[derive(Clone, Copy, Debug)]
pub struct ConnectionLimits {
    /// Largest accepted request line and emitted frame
    pub max_frame_size: usize,
    /// How long a client may take to send its request
    pub request_timeout: Duration,
    /// How long one frame write may stay blocked on a client that is not reading
    pub write_timeout: Duration,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_frame_size: relay_core::frame::MAX_FRAME_SIZE,
            request_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Serve one connection to completion
///
/// # Errors
///
/// Returns an error only for failures writing a rejection line; failures
/// while streaming cancel the session instead.
pub async fn handle_connection<R, W>(
    mut reader: R,
    mut writer: W,
    manager: Arc<StreamManager>,
    limits: ConnectionLimits,
) -> Result<ConnectionOutcome, TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let encoder = FrameEncoder::with_max_frame_size(limits.max_frame_size);

    let request = match tokio::time::timeout(
        limits.request_timeout,
        read_request(&mut reader, limits.max_frame_size),
    )
    .await
    {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => {
            debug!("Client closed before sending a request");
            return Ok(ConnectionOutcome::NoRequest);
        }
        Ok(Err(e)) => {
            return reject(&mut writer, &encoder, &Rejection::from(&e)).await;
        }
        Err(_) => {
            let e = RequestError::Malformed("no request received in time".to_string());
            return reject(&mut writer, &encoder, &Rejection::from(&e)).await;
        }
    };

    let mut session = match manager.start_stream(request).await {
        Ok(session) => session,
        Err(e) => return reject(&mut writer, &encoder, &Rejection::from(&e)).await,
    };
    let cancel = session.cancel_handle();

    let mut read_buf = [0u8; 256];
    let mut client_gone = false;
    // Set once a fallback frame has stood in for the terminal envelope
    let mut ended = false;

    loop {
        tokio::select! {
            biased;

            read = reader.read(&mut read_buf), if !client_gone => {
                match read {
                    Ok(0) => {
                        info!("Client disconnected (EOF)");
                        client_gone = true;
                        cancel.cancel(CancelReason::ClientDisconnected);
                    }
                    Ok(n) => debug!(bytes = n, "Ignoring input after request"),
                    Err(e) => {
                        info!(error = %e, "Client read failed");
                        client_gone = true;
                        cancel.cancel(CancelReason::ClientDisconnected);
                    }
                }
            }

            envelope = session.next_envelope() => {
                let Some(envelope) = envelope else { break };
                if client_gone || ended {
                    continue;
                }
                let frame = encoder.encode_envelope(&envelope);
                let written = tokio::time::timeout(
                    limits.write_timeout,
                    write_frame(&mut writer, frame.as_bytes()),
                )
                .await;
                match written {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(error = %e, "Write failed, cancelling session");
                        client_gone = true;
                        cancel.cancel(CancelReason::ClientDisconnected);
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            timeout_ms = limits.write_timeout.as_millis(),
                            "Client stopped reading, cancelling session"
                        );
                        client_gone = true;
                        cancel.cancel(CancelReason::ClientDisconnected);
                        continue;
                    }
                }
                if frame.is_fallback() {
                    warn!(kind = %envelope.kind(), "Envelope replaced by error frame, ending session");
                    ended = true;
                    cancel.cancel(CancelReason::Requested);
                }
            }
        }
    }

    if !client_gone {
        // Best effort: the terminal frame has already been flushed
        let _ = writer.shutdown().await;
    }
    Ok(ConnectionOutcome::Streamed(session.state().status()))
}

/// Read the single request line
///
/// Returns `Ok(None)` if the client closed before a full line arrived.
async fn read_request<R>(
    reader: &mut R,
    max_frame_size: usize,
) -> Result<Option<StreamRequest>, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::with_max_frame_size(max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match decoder.decode::<StreamRequest>() {
            Ok(Some(request)) => return Ok(Some(request)),
            Ok(None) => {}
            Err(e) => return Err(RequestError::Malformed(e.to_string())),
        }

        match reader.read(&mut buf).await {
            Ok(0) => return Ok(None),
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) => {
                debug!(error = %e, "Read failed before request");
                return Ok(None);
            }
        }
    }
}

async fn reject<W>(
    writer: &mut W,
    encoder: &FrameEncoder,
    rejection: &Rejection,
) -> Result<ConnectionOutcome, TransportError>
where
    W: AsyncWrite + Unpin,
{
    warn!(code = ?rejection.code, message = %rejection.message, "Request rejected");
    let frame = encoder.encode(rejection)?;
    write_frame(writer, &frame).await?;
    let _ = writer.shutdown().await;
    Ok(ConnectionOutcome::Rejected(rejection.code))
}

async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::pipeline::ScriptedPipeline;
    use relay_core::{Envelope, EnvelopeKind, ErrorCode, StreamManagerConfig};
    use tokio::io::{duplex, split, AsyncBufReadExt, BufReader};

    fn manager(pipeline: ScriptedPipeline) -> Arc<StreamManager> {
        Arc::new(StreamManager::new(
            Arc::new(pipeline),
            StreamManagerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_streams_envelopes_until_terminal() {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        let mgr = manager(ScriptedPipeline::staged(&["a", "b"]));

        let task = tokio::spawn(handle_connection(
            server_read,
            server_write,
            Arc::clone(&mgr),
            ConnectionLimits::default(),
        ));

        let (client_read, mut client_write) = split(client);
        client_write
            .write_all(b"{\"content\":\"hi\",\"session_id\":\"s1\"}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let mut envelopes = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            envelopes.push(serde_json::from_str::<Envelope>(&line).unwrap());
        }

        assert_eq!(envelopes.len(), 9);
        assert_eq!(envelopes.last().unwrap().kind(), EnvelopeKind::Done);
        assert_eq!(
            task.await.unwrap().unwrap(),
            ConnectionOutcome::Streamed(SessionStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_invalid_request_gets_rejection_line() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = split(server);
        let mgr = manager(ScriptedPipeline::staged(&["a"]));

        let task = tokio::spawn(handle_connection(
            server_read,
            server_write,
            mgr,
            ConnectionLimits::default(),
        ));

        let (client_read, mut client_write) = split(client);
        client_write
            .write_all(b"{\"content\":\"\",\"session_id\":\"s1\"}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let rejection: Rejection = serde_json::from_str(&line).unwrap();
        assert_eq!(rejection.code, RejectionCode::InvalidRequest);
        assert!(lines.next_line().await.unwrap().is_none());

        assert_eq!(
            task.await.unwrap().unwrap(),
            ConnectionOutcome::Rejected(RejectionCode::InvalidRequest)
        );
    }

    #[tokio::test]
    async fn test_garbage_request_is_malformed() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = split(server);
        let mgr = manager(ScriptedPipeline::staged(&["a"]));

        let task = tokio::spawn(handle_connection(
            server_read,
            server_write,
            mgr,
            ConnectionLimits::default(),
        ));

        let (client_read, mut client_write) = split(client);
        client_write.write_all(b"hello there\n").await.unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("\"status\":\"rejected\""));
        assert!(line.contains("malformed request"));
        assert_eq!(
            task.await.unwrap().unwrap(),
            ConnectionOutcome::Rejected(RejectionCode::InvalidRequest)
        );
    }

    #[tokio::test]
    async fn test_disconnect_cancels_session() {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        let pipeline = ScriptedPipeline::staged(&["a"]).stall_after(6);
        let mgr = manager(pipeline.clone());

        let task = tokio::spawn(handle_connection(
            server_read,
            server_write,
            Arc::clone(&mgr),
            ConnectionLimits::default(),
        ));

        let (client_read, mut client_write) = split(client);
        client_write
            .write_all(b"{\"content\":\"hi\",\"session_id\":\"s1\"}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(client_read).lines();
        for _ in 0..6 {
            lines.next_line().await.unwrap().unwrap();
        }
        // Drop both halves: the daemon sees EOF
        drop(lines);
        drop(client_write);

        assert_eq!(
            task.await.unwrap().unwrap(),
            ConnectionOutcome::Streamed(SessionStatus::Cancelled)
        );
        pipeline.cancellation_observed().await;
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn test_unencodable_token_ends_stream_with_single_error() {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        let long = "x".repeat(200);
        let mgr = manager(ScriptedPipeline::staged(&["a", long.as_str(), "b"]));
        let limits = ConnectionLimits {
            max_frame_size: 150,
            ..ConnectionLimits::default()
        };

        let task = tokio::spawn(handle_connection(
            server_read,
            server_write,
            Arc::clone(&mgr),
            limits,
        ));

        let (client_read, mut client_write) = split(client);
        client_write
            .write_all(b"{\"content\":\"hi\",\"session_id\":\"s1\"}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let mut envelopes = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            envelopes.push(serde_json::from_str::<Envelope>(&line).unwrap());
        }

        assert_eq!(envelopes.iter().filter(|e| e.is_terminal()).count(), 1);
        let last = envelopes.last().unwrap();
        assert_eq!(last.kind(), EnvelopeKind::Error);
        assert_eq!(last.error_code(), Some(ErrorCode::EncodingFailure));
        let tokens: Vec<&str> = envelopes.iter().filter_map(Envelope::token_text).collect();
        assert_eq!(tokens, vec!["a"]);

        assert_eq!(
            task.await.unwrap().unwrap(),
            ConnectionOutcome::Streamed(SessionStatus::Cancelled)
        );
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_that_never_reads_is_cut_off() {
        let (client, server) = duplex(256);
        let (server_read, server_write) = split(server);
        let words: Vec<String> = (0..200).map(|i| format!("token-{i}")).collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();
        let mgr = manager(ScriptedPipeline::staged(&words));
        let limits = ConnectionLimits::default();

        // Both halves stay alive: no EOF, no broken pipe, just no reading
        let (_client_read, mut client_write) = split(client);
        client_write
            .write_all(b"{\"content\":\"hi\",\"session_id\":\"s1\"}\n")
            .await
            .unwrap();

        let outcome = tokio::time::timeout(
            limits.write_timeout * 2,
            handle_connection(server_read, server_write, Arc::clone(&mgr), limits),
        )
        .await
        .expect("handler hung on a client that never reads")
        .unwrap();

        assert_eq!(outcome, ConnectionOutcome::Streamed(SessionStatus::Cancelled));
        assert_eq!(mgr.active_count(), 0);
        assert!(!mgr.has_session("s1"));
    }

    #[tokio::test]
    async fn test_close_before_request() {
        let (client, server) = duplex(4096);
        let (server_read, server_write) = split(server);
        drop(client);

        let outcome = handle_connection(
            server_read,
            server_write,
            manager(ScriptedPipeline::staged(&["a"])),
            ConnectionLimits::default(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, ConnectionOutcome::NoRequest);
    }
}
