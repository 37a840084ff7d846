use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::{sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;

use crate::{
    intent::{DeploymentIntent, IntentPolicy, IntentRejection, intent_from_record},
    queue::CoalescingQueue,
};

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: String,
    pub connect_timeout: Duration,
    /// A subscribed stream that stays silent this long is treated as dropped.
    pub idle_timeout: Duration,
    pub reconnect_backoff: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Streaming,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("no response from {url} within {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("failed to read from stream: {0}")]
    Read(#[source] reqwest::Error),
    #[error("no data received for {0:?}")]
    Idle(Duration),
    #[error("stream closed by server")]
    Closed,
}

/// What became of one framed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Malformed(String),
    /// Valid JSON without the active mode's key.
    Ignored,
    Rejected(IntentRejection),
    Accepted(DeploymentIntent),
}

/// Longest record the framer buffers before dropping it.
pub const MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Splits a chunked byte stream into newline-delimited records.
#[derive(Debug)]
pub struct RecordFramer {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    /// Set while skipping the rest of an oversized record.
    discarding: bool,
    max_record_bytes: usize,
}

impl Default for RecordFramer {
    fn default() -> Self {
        Self::with_max_record_bytes(MAX_RECORD_BYTES)
    }
}

impl RecordFramer {
    pub fn with_max_record_bytes(max_record_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            discarding: false,
            max_record_bytes,
        }
    }

    /// Returns every record completed by `chunk`, cleaned and non-empty.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some(offset) = self.buffer[self.scanned..]
            .iter()
            .position(|byte| *byte == b'\n')
        {
            let idx = self.scanned + offset;
            let line: Vec<u8> = self.buffer.drain(..=idx).collect();
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if line.len() > self.max_record_bytes {
                self.log_oversized(line.len());
                continue;
            }
            if let Some(record) = clean_record(&line) {
                records.push(record);
            }
        }

        self.scanned = self.buffer.len();
        if self.buffer.len() > self.max_record_bytes {
            if !self.discarding {
                self.log_oversized(self.buffer.len());
            }
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        records
    }

    /// Flushes a trailing record that never saw its newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        clean_record(&rest)
    }

    fn log_oversized(&self, len: usize) {
        tracing::warn!(
            target: "stream",
            len,
            max_record_bytes = self.max_record_bytes,
            "record_oversized_discarded"
        );
    }
}

fn clean_record(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw).replace('\0', "");
    let record = text
        .trim()
        .trim_end_matches([',', '\r', '\n'])
        .trim_end();
    (!record.is_empty()).then(|| record.to_string())
}

pub fn parse_record(record: &str, policy: &IntentPolicy) -> RecordOutcome {
    let value: Value = match serde_json::from_str(record) {
        Ok(value) => value,
        Err(err) => return RecordOutcome::Malformed(err.to_string()),
    };

    let Some(payload) = value.get(policy.mode.record_key()) else {
        return RecordOutcome::Ignored;
    };

    match intent_from_record(payload, policy) {
        Ok(intent) => RecordOutcome::Accepted(intent),
        Err(rejection) => RecordOutcome::Rejected(rejection),
    }
}

pub struct StreamConsumer {
    settings: StreamSettings,
    policy: IntentPolicy,
    queue: CoalescingQueue,
    client: reqwest::Client,
    state: watch::Sender<ConsumerState>,
}

impl StreamConsumer {
    pub fn new(
        settings: StreamSettings,
        policy: IntentPolicy,
        queue: CoalescingQueue,
    ) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(StreamError::Client)?;
        let (state, _) = watch::channel(ConsumerState::Disconnected);

        Ok(Self {
            settings,
            policy,
            queue,
            client,
            state,
        })
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Parses one record and enqueues it when it yields a valid intent.
    pub fn handle_record(&self, record: &str) -> RecordOutcome {
        let outcome = parse_record(record, &self.policy);
        match &outcome {
            RecordOutcome::Malformed(err) => {
                tracing::warn!(target: "stream", error = %err, "record_malformed");
            }
            RecordOutcome::Ignored => {
                tracing::trace!(target: "stream", "record_ignored");
            }
            RecordOutcome::Rejected(rejection) => {
                tracing::warn!(target: "stream", reason = %rejection, "intent_rejected");
            }
            RecordOutcome::Accepted(intent) => {
                tracing::info!(
                    target: "stream",
                    target_path = %intent.target_path(),
                    source = %intent.source_url(),
                    branch = %intent.branch(),
                    committer = %intent.committer(),
                    "intent_queued"
                );
                self.queue.put(intent.clone());
            }
        }
        outcome
    }

    /// Keeps the subscription alive until `shutdown` fires. Failed connects
    /// wait out the backoff; a stream that drops after subscribing is reopened
    /// right away.
    #[tracing::instrument(name = "stream_run", target = "stream", skip_all, fields(url = %self.settings.url))]
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            self.transition(ConsumerState::Connecting);
            tracing::info!(target: "stream", url = %self.settings.url, "stream_subscribing");

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = self.connect() => connected,
            };

            let response = match connected {
                Ok(response) => response,
                Err(err) => {
                    self.transition(ConsumerState::Disconnected);
                    tracing::warn!(
                        target: "stream",
                        error = %err,
                        retry_in_secs = self.settings.reconnect_backoff.as_secs(),
                        "stream_connect_failed"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.reconnect_backoff) => continue,
                    }
                }
            };

            self.transition(ConsumerState::Streaming);
            tracing::info!(target: "stream", "stream_subscribed");

            match self.consume(response, &shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    self.transition(ConsumerState::Disconnected);
                    tracing::warn!(target: "stream", error = %err, "stream_disconnected_reconnecting");
                }
            }
        }

        self.transition(ConsumerState::Disconnected);
        tracing::info!(target: "stream", "stream_consumer_stopped");
    }

    async fn connect(&self) -> Result<reqwest::Response, StreamError> {
        let request = self.client.get(&self.settings.url).send();
        let response = timeout(self.settings.connect_timeout, request)
            .await
            .map_err(|_| StreamError::ConnectTimeout {
                url: self.settings.url.clone(),
                timeout: self.settings.connect_timeout,
            })?
            .map_err(|source| StreamError::Connect {
                url: self.settings.url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(StreamError::Status {
                url: self.settings.url.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    /// Returns `Ok` only when stopped by `shutdown`.
    async fn consume(
        &self,
        response: reqwest::Response,
        shutdown: &CancellationToken,
    ) -> Result<(), StreamError> {
        let mut stream = response.bytes_stream();
        let mut framer = RecordFramer::default();

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = timeout(self.settings.idle_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => return Err(StreamError::Idle(self.settings.idle_timeout)),
                Ok(None) => {
                    if let Some(record) = framer.finish() {
                        self.handle_record(&record);
                    }
                    return Err(StreamError::Closed);
                }
                Ok(Some(Err(err))) => return Err(StreamError::Read(err)),
                Ok(Some(Ok(chunk))) => chunk,
            };

            for record in framer.push(&chunk) {
                self.handle_record(&record);
            }
        }
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(
                target: "stream",
                from = ?previous,
                to = ?next,
                "consumer_state_changed"
            );
        }
    }
}
