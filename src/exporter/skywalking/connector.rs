//! Establishing `collect` streams to the collector.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;

use super::tls::TlsConnect;
use crate::error::ExportError;
use crate::exporter::proto::{Event, EventServiceClient};

/// Records buffered ahead of the gRPC request stream.
const COLLECT_BUFFER: usize = 1;

/// Default delay between two connection attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

// ================================================================================================
// COLLECT STREAM
// ================================================================================================

/// Sending half of an open `collect` call.
///
/// Once the call ends its request stream is dropped, [`closed`](Self::closed)
/// resolves and every further send fails.
#[derive(Debug)]
pub struct CollectStream {
    sender: mpsc::Sender<Event>,
    opened_at: Instant,
}

impl CollectStream {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        CollectStream {
            sender,
            opened_at: Instant::now(),
        }
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub async fn send(&self, event: Event) -> Result<(), ExportError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| ExportError::StreamClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Resolves once the call has ended.
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

// ================================================================================================
// CONNECTOR
// ================================================================================================

#[tonic::async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new `collect` stream.
    async fn connect(&self) -> Result<CollectStream, ExportError>;
}

/// Connects to the collector over plaintext or TLS HTTP/2.
///
/// The `collect` call runs on its own task. A call the collector rejects ends that
/// task and closes the returned stream.
pub struct GrpcConnector {
    endpoint: Endpoint,
    tls: Option<TlsConnect>,
}

impl GrpcConnector {
    pub fn new(endpoint: Endpoint, tls: Option<TlsConnect>) -> Self {
        GrpcConnector { endpoint, tls }
    }
}

#[tonic::async_trait]
impl Connector for GrpcConnector {
    async fn connect(&self) -> Result<CollectStream, ExportError> {
        let channel = match &self.tls {
            None => self.endpoint.connect().await?,
            Some(tls) => {
                let tls = tls.clone();
                self.endpoint
                    .connect_with_connector(tower::service_fn(move |uri| tls.clone().connect(uri)))
                    .await?
            }
        };

        let mut client = EventServiceClient::new(channel);
        let (sender, receiver) = mpsc::channel(COLLECT_BUFFER);
        let uri = self.endpoint.uri().clone();
        tokio::spawn(async move {
            match client.collect(ReceiverStream::new(receiver)).await {
                Ok(response) => {
                    for command in &response.get_ref().commands {
                        debug!("collector command {} ignored", command.command);
                    }
                    debug!("collect stream to {} finished", uri);
                }
                Err(status) => warn!("collect stream to {} failed: {}", uri, status),
            }
        });

        Ok(CollectStream::new(sender))
    }
}

/// Opens a stream, retrying every `retry_interval` until it succeeds.
///
/// Returns `None` as soon as `lifetime` is cancelled.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    retry_interval: Duration,
    lifetime: &CancellationToken,
) -> Option<CollectStream> {
    loop {
        let attempt = tokio::select! {
            _ = lifetime.cancelled() => return None,
            attempt = connector.connect() => attempt,
        };

        match attempt {
            Ok(stream) => {
                info!("collect stream established");
                return Some(stream);
            }
            Err(err) => warn!(
                "failed to open collect stream, retrying in {:?}. {}",
                retry_interval, err
            ),
        }

        tokio::select! {
            _ = lifetime.cancelled() => return None,
            _ = sleep(retry_interval) => {}
        }
    }
}


#[cfg(test)]
mod tests {
    use super::mock::FlakyConnector;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let connector = FlakyConnector::new(2);
        let token = CancellationToken::new();

        let stream = connect_with_retry(&connector, DEFAULT_RETRY_INTERVAL, &token).await;
        assert!(stream.is_some());

        let attempts = connector.attempts.lock();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= DEFAULT_RETRY_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_retry() {
        let connector = FlakyConnector::new(usize::MAX);
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(10)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let stream = connect_with_retry(&connector, DEFAULT_RETRY_INTERVAL, &token).await;
        assert!(stream.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(connector.attempts.lock().len(), 4);
    }

    #[tokio::test]
    async fn test_send_on_dropped_stream_fails() {
        let (tx, rx) = mpsc::channel(1);
        let stream = CollectStream::new(tx);
        drop(rx);
        assert!(stream.is_closed());
        stream.closed().await;
        assert!(matches!(
            stream.send(Event::default()).await,
            Err(ExportError::StreamClosed)
        ));
    }
}
