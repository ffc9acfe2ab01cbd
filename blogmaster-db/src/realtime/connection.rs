use crate::{
    client::Result,
    realtime::channels::{Channels, Command},
    realtime::message::Frame,
};
use futures::{Sink, SinkExt, StreamExt};
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    time::{Instant, interval_at, sleep, timeout},
};
use tokio_tungstenite::{
    WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

enum Disconnect {
    Shutdown,
    Lost,
}

fn backoff(attempt: usize) -> Duration {
    RECONNECT_BACKOFF[attempt.min(RECONNECT_BACKOFF.len() - 1)]
}

/// Owns the socket for the lifetime of a [`RealtimeClient`], reconnecting
/// until it is cancelled or every handle is gone.
///
/// [`RealtimeClient`]: crate::RealtimeClient
pub(crate) async fn run(
    url: Url,
    mut channels: Channels,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    let mut attempt = 0;

    loop {
        let connecting = tokio::select! {
            () = shutdown.cancelled() => return,
            result = timeout(CONNECT_TIMEOUT, connect_async(url.as_str())) => result,
        };

        match connecting {
            Ok(Ok((socket, _))) => {
                info!("Realtime connected");
                attempt = 0;

                let disconnect = serve(socket, &mut channels, &mut commands, &shutdown).await;
                channels.disconnected();
                match disconnect {
                    Disconnect::Shutdown => {
                        debug!("Realtime connection shut down");
                        return;
                    }
                    Disconnect::Lost => warn!("Realtime connection lost"),
                }
            }
            Ok(Err(err)) => warn!(%err, "Realtime connection failed"),
            Err(_) => warn!(timeout = ?CONNECT_TIMEOUT, "Realtime connection timed out"),
        }

        let delay = backoff(attempt);
        attempt += 1;
        debug!(?delay, attempt, "Reconnecting to realtime");

        // Subscriptions made while offline are joined once the socket is back.
        let reconnect = sleep(delay);
        tokio::pin!(reconnect);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = &mut reconnect => break,
                command = commands.recv() => match command {
                    Some(command) => {
                        channels.command(command);
                    }
                    None => return,
                },
            }
        }
    }
}

async fn serve<S>(
    socket: WebSocketStream<S>,
    channels: &mut Channels,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &CancellationToken,
) -> Disconnect
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();

    if let Err(err) = send_all(&mut sink, channels.connected()).await {
        warn!(%err, "Joining channels failed");
        return Disconnect::Lost;
    }

    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);

    loop {
        let outgoing = tokio::select! {
            () = shutdown.cancelled() => {
                let _ = sink.close().await;
                return Disconnect::Shutdown;
            }
            command = commands.recv() => match command {
                Some(command) => channels.command(command),
                None => {
                    let _ = sink.close().await;
                    return Disconnect::Shutdown;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(frame) => channels.receive(frame),
                    Err(err) => {
                        warn!(%err, "Ignoring malformed realtime frame");
                        Vec::new()
                    }
                },
                Some(Ok(Message::Close(close))) => {
                    info!(?close, "Realtime server closed the connection");
                    return Disconnect::Lost;
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(err)) => {
                    warn!(%err, "Realtime connection error");
                    return Disconnect::Lost;
                }
                None => return Disconnect::Lost,
            },
            _ = heartbeat.tick() => match channels.heartbeat() {
                Ok(frame) => vec![frame],
                Err(err) => {
                    warn!(%err, "Realtime heartbeat failed");
                    return Disconnect::Lost;
                }
            },
        };

        if let Err(err) = send_all(&mut sink, outgoing).await {
            warn!(%err, "Sending to realtime failed");
            return Disconnect::Lost;
        }
    }
}

async fn send_all<S>(sink: &mut S, frames: Vec<Frame>) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for frame in frames {
        let text = serde_json::to_string(&frame)?;
        sink.send(Message::text(text)).await.map_err(Box::new)?;
    }

    Ok(())
}
