//! Uplink payload sources
//!
//! The uplink loop asks a [`PayloadSource`] for the next application payload
//! and ends gracefully once it yields `None`.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::warn;

/// Producer of application payloads
#[async_trait]
pub trait PayloadSource: Send {
    /// Wait for the next payload; `None` ends the uplink loop
    async fn next_payload(&mut self) -> Option<Vec<u8>>;
}

#[async_trait]
impl<S: PayloadSource + ?Sized> PayloadSource for Box<S> {
    async fn next_payload(&mut self) -> Option<Vec<u8>> {
        (**self).next_payload().await
    }
}

/// One payload per input line
///
/// The line terminator is stripped and empty lines are skipped. End of input
/// or a read error ends the source.
pub struct LinePayloads<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> LinePayloads<R> {
    /// Read lines from `reader`
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> PayloadSource for LinePayloads<R> {
    async fn next_payload(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.is_empty() => continue,
                Ok(Some(line)) => return Some(line.into_bytes()),
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "payload: read failed, stopping input");
                    return None;
                }
            }
        }
    }
}

/// A fixed payload at a fixed period
///
/// The first payload is produced immediately.
pub struct IntervalPayloads {
    payload: Vec<u8>,
    interval: Interval,
    remaining: Option<u64>,
}

impl IntervalPayloads {
    /// Produce `payload` every `period`, forever
    pub fn new(payload: Vec<u8>, period: Duration) -> Self {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            payload,
            interval,
            remaining: None,
        }
    }

    /// Stop after `count` payloads
    pub fn with_count(mut self, count: u64) -> Self {
        self.remaining = Some(count);
        self
    }
}

#[async_trait]
impl PayloadSource for IntervalPayloads {
    async fn next_payload(&mut self) -> Option<Vec<u8>> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        self.interval.tick().await;
        Some(self.payload.clone())
    }
}
