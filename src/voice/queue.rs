//! Synthesis and serialized playback per voice connection
//!
//! Every connection gets one worker task fed by an unbounded channel. The
//! worker awaits each job's playback before dequeuing the next, so jobs on a
//! connection never overlap and always play in enqueue order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::playback::AudioSink;
use super::tts::Synthesizer;
use crate::{Error, Result};

/// One synthesized reply waiting to be played
#[derive(Debug, Clone)]
pub struct PlaybackJob {
    pub id: Uuid,
    pub channel_id: String,
    pub audio: Vec<u8>,
    pub enqueue_time: Instant,
}

impl PlaybackJob {
    /// Create a job stamped now
    #[must_use]
    pub fn new(channel_id: impl Into<String>, audio: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id: channel_id.into(),
            audio,
            enqueue_time: Instant::now(),
        }
    }
}

struct Worker {
    sender: mpsc::UnboundedSender<PlaybackJob>,
    cancel: CancellationToken,
    current: Arc<Mutex<Option<CancellationToken>>>,
    handle: JoinHandle<()>,
}

/// Process-wide playback state keyed by connection id
#[derive(Clone)]
pub struct PlaybackQueue {
    synthesizer: Arc<dyn Synthesizer>,
    sink: Arc<dyn AudioSink>,
    voice_id: String,
    workers: Arc<Mutex<HashMap<String, Worker>>>,
}

impl PlaybackQueue {
    /// Create a queue that synthesizes with `voice_id` and plays through `sink`
    #[must_use]
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        sink: Arc<dyn AudioSink>,
        voice_id: impl Into<String>,
    ) -> Self {
        Self {
            synthesizer,
            sink,
            voice_id: voice_id.into(),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Configured voice
    #[must_use]
    pub fn voice_id(&self) -> &str {
        &self.voice_id
    }

    /// Synthesize reply text without enqueuing it
    ///
    /// # Errors
    ///
    /// Returns [`Error::Synthesis`] if the service fails
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        self.synthesizer
            .synthesize(text, &self.voice_id)
            .await
            .map_err(|e| match e {
                Error::Synthesis(_) => e,
                other => Error::Synthesis(other.to_string()),
            })
    }

    /// Synthesize reply text and append it to the connection's queue
    ///
    /// # Errors
    ///
    /// Returns [`Error::Synthesis`] if the service fails; nothing is enqueued
    pub async fn enqueue_reply(&self, connection_id: &str, reply_text: &str) -> Result<Uuid> {
        let audio = self.synthesize(reply_text).await?;
        Ok(self.enqueue(connection_id, audio))
    }

    /// Append already-synthesized audio to the connection's queue
    pub fn enqueue(&self, connection_id: &str, audio: Vec<u8>) -> Uuid {
        let job = PlaybackJob::new(connection_id, audio);
        let id = job.id;

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());

        let job = match workers.get(connection_id) {
            Some(worker) => match worker.sender.send(job) {
                Ok(()) => None,
                // Worker exited on its own; replace it below
                Err(mpsc::error::SendError(job)) => Some(job),
            },
            None => Some(job),
        };

        if let Some(job) = job {
            let worker = self.spawn_worker(connection_id);
            let _ = worker.sender.send(job);
            workers.insert(connection_id.to_string(), worker);
        }
        drop(workers);

        tracing::debug!(connection_id, job_id = %id, "playback job enqueued");
        id
    }

    fn spawn_worker(&self, connection_id: &str) -> Worker {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let current = Arc::new(Mutex::new(None));

        let handle = tokio::spawn(run_worker(
            connection_id.to_string(),
            receiver,
            Arc::clone(&self.sink),
            cancel.clone(),
            Arc::clone(&current),
        ));

        Worker {
            sender,
            cancel,
            current,
            handle,
        }
    }

    /// Interrupt the job currently playing on a connection
    ///
    /// Returns true if something was playing. Queued jobs still play.
    pub fn stop_current(&self, connection_id: &str) -> bool {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let Some(worker) = workers.get(connection_id) else {
            return false;
        };

        let current = worker.current.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().is_some_and(|token| {
            token.cancel();
            tracing::info!(connection_id, "playback stopped");
            true
        })
    }

    /// Whether a job is playing on the connection right now
    #[must_use]
    pub fn is_playing(&self, connection_id: &str) -> bool {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.get(connection_id).is_some_and(|worker| {
            worker
                .current
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
        })
    }

    /// Cancel the connection's worker and discard everything pending
    ///
    /// Returns once the worker has exited. Closing an unknown connection is a no-op.
    pub async fn close(&self, connection_id: &str) {
        let worker = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(connection_id);

        if let Some(worker) = worker {
            worker.cancel.cancel();
            drop(worker.sender);
            let _ = worker.handle.await;
            tracing::debug!(connection_id, "playback queue closed");
        }
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();

        for id in ids {
            self.close(&id).await;
        }
    }
}

async fn run_worker(
    connection_id: String,
    mut receiver: mpsc::UnboundedReceiver<PlaybackJob>,
    sink: Arc<dyn AudioSink>,
    cancel: CancellationToken,
    current: Arc<Mutex<Option<CancellationToken>>>,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let job_token = cancel.child_token();
        *current.lock().unwrap_or_else(|e| e.into_inner()) = Some(job_token.clone());

        tracing::debug!(
            connection_id = %connection_id,
            job_id = %job.id,
            waited_ms = job.enqueue_time.elapsed().as_millis(),
            "playback started"
        );

        if let Err(e) = sink.play(&job.audio, &job_token).await {
            tracing::warn!(connection_id = %connection_id, job_id = %job.id, error = %e, "playback failed");
        }

        *current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    receiver.close();
    let mut discarded = 0usize;
    while receiver.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        tracing::debug!(connection_id = %connection_id, discarded, "pending playback discarded");
    }
}
