//! Read and write pumps shared by client connections and relay sessions.

use courier_protocol::ProtocolError;
use courier_transport::{FrameReader, FrameWriter, WireFrame};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Keep-alive settings for one stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PumpConfig {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

/// Read the next frame under the idle deadline.
///
/// Returns `None` when the stream ended for any reason: peer close, transport
/// error, idle deadline, or cancellation.
pub(crate) async fn next_frame<R: FrameReader>(
    reader: &mut R,
    idle_timeout: Duration,
    cancel: &CancellationToken,
    peer: &str,
) -> Option<WireFrame> {
    let next = tokio::select! {
        _ = cancel.cancelled() => {
            trace!(peer, "Read pump cancelled");
            return None;
        }
        next = timeout(idle_timeout, reader.recv()) => next,
    };

    match next {
        Ok(Ok(Some(frame))) => Some(frame),
        Ok(Ok(None)) => {
            debug!(peer, "Stream closed by peer");
            None
        }
        Ok(Err(e)) => {
            debug!(peer, error = %e, "Read failed");
            None
        }
        Err(_) => {
            debug!(peer, idle_secs = idle_timeout.as_secs(), "Idle deadline exceeded");
            None
        }
    }
}

/// Drain `rx` into `writer`, interleaving keep-alive pings.
///
/// When the queue ends the pump sends a close frame and returns. `done` is
/// cancelled on exit so the paired read pump stops too.
pub(crate) async fn write_pump<T, W, F>(
    mut rx: mpsc::Receiver<T>,
    mut writer: W,
    encode: F,
    config: PumpConfig,
    done: CancellationToken,
    peer: String,
) where
    W: FrameWriter,
    F: Fn(&T) -> Result<String, ProtocolError>,
{
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            next = rx.recv() => match next {
                Some(item) => match encode(&item) {
                    Ok(text) => WireFrame::Text(text),
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "Dropping frame that failed to encode");
                        continue;
                    }
                },
                None => {
                    let _ = timeout(config.write_timeout, writer.send(WireFrame::Close)).await;
                    break;
                }
            },
            _ = ping.tick() => WireFrame::Ping(Vec::new()),
        };

        match timeout(config.write_timeout, writer.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(peer = %peer, error = %e, "Write failed");
                break;
            }
            Err(_) => {
                warn!(peer = %peer, "Write timed out");
                break;
            }
        }
    }

    let _ = timeout(config.write_timeout, writer.close()).await;
    done.cancel();
    trace!(peer = %peer, "Write pump stopped");
}
