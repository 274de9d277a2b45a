//! # Event Sources
//!
//! The router consumes a channel of raw events. Two producers ship with the crate:
//! - [`ChannelSource`]: the embedding application pushes events itself
//! - [`JsonLinesFeed`]: newline-delimited JSON records from any async reader
//!
//! A feed line is one of:
//!
//! ```text
//! {"event":   RawEvent}
//! {"added":   {"pod"|"service"|"endpoints": …}}
//! {"updated": {"old": …, "new": …}}
//! {"deleted": {"pod"|"service"|"endpoints": …}}
//! ```
//!
//! Event records go to the router; resource records update the enrichment registry.

use std::sync::Arc;

use log::{debug, error, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::registry::{Registry, WatchNotification};
use crate::types::{RawEvent, Resource};

/// Capacity of the channel between a source and the router.
pub const SOURCE_BUFFER: usize = 128;

#[tonic::async_trait]
pub trait EventSource: Send {
    /// Starts producing events. The returned channel closes when the source ends.
    async fn start(
        &mut self,
        lifetime: &CancellationToken,
    ) -> Result<mpsc::Receiver<RawEvent>, PipelineError>;
}

// ================================================================================================
// CHANNEL SOURCE
// ================================================================================================

pub struct ChannelSource {
    receiver: Option<mpsc::Receiver<RawEvent>>,
}

impl ChannelSource {
    /// Returns the sending half together with the source.
    pub fn new(capacity: usize) -> (mpsc::Sender<RawEvent>, Self) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            sender,
            ChannelSource {
                receiver: Some(receiver),
            },
        )
    }
}

#[tonic::async_trait]
impl EventSource for ChannelSource {
    async fn start(
        &mut self,
        _lifetime: &CancellationToken,
    ) -> Result<mpsc::Receiver<RawEvent>, PipelineError> {
        self.receiver
            .take()
            .ok_or_else(|| PipelineError::Source("channel source already started".to_string()))
    }
}

// ================================================================================================
// JSON LINES FEED
// ================================================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
enum FeedRecord {
    Event(RawEvent),
    Added(Resource),
    Updated { old: Resource, new: Resource },
    Deleted(Resource),
}

pub struct JsonLinesFeed<R> {
    reader: Option<R>,
    registry: Arc<Registry>,
}

impl<R> JsonLinesFeed<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R, registry: Arc<Registry>) -> Self {
        JsonLinesFeed {
            reader: Some(reader),
            registry,
        }
    }
}

#[tonic::async_trait]
impl<R> EventSource for JsonLinesFeed<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn start(
        &mut self,
        lifetime: &CancellationToken,
    ) -> Result<mpsc::Receiver<RawEvent>, PipelineError> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| PipelineError::Source("feed already started".to_string()))?;
        let (sender, receiver) = mpsc::channel(SOURCE_BUFFER);
        tokio::spawn(read_feed(
            reader,
            Arc::clone(&self.registry),
            sender,
            lifetime.clone(),
        ));
        Ok(receiver)
    }
}

async fn read_feed<R>(
    reader: R,
    registry: Arc<Registry>,
    events: mpsc::Sender<RawEvent>,
    lifetime: CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number = 0usize;

    loop {
        let line = tokio::select! {
            _ = lifetime.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    error!("failed to read feed: {}", err);
                    break;
                }
            },
        };
        line_number += 1;

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record: FeedRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                warn!("skipping malformed feed line {}: {}", line_number, err);
                continue;
            }
        };

        match record {
            FeedRecord::Event(event) => {
                let sent = tokio::select! {
                    _ = lifetime.cancelled() => break,
                    sent = events.send(event) => sent,
                };
                if sent.is_err() {
                    debug!("event receiver dropped, stopping feed");
                    break;
                }
            }
            FeedRecord::Added(resource) => registry.apply(WatchNotification::Added(resource)),
            FeedRecord::Updated { old, new } => {
                registry.apply(WatchNotification::Updated { old, new })
            }
            FeedRecord::Deleted(resource) => registry.apply(WatchNotification::Deleted(resource)),
        }
    }
    debug!("feed finished after {} lines", line_number);
}
