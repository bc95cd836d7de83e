use std::{collections::HashMap, pin::Pin};

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    pipeline::{Pipeline, PipelineStats},
    segment::ManifestEntry,
};

/// Runs pipelines on blocking threads and reports their progress as events.
///
/// The bus is an actor: every call is a command to a single task that owns
/// the job table. Dropping the bus cancels every job it started.
pub struct Bus {
    id: String,
    cancel: CancellationToken,
    tx: mpsc::Sender<BusCommand>,
    events: broadcast::Sender<BusEvent>,
}

impl Bus {
    /// Must be called from within a tokio runtime.
    pub fn new(id: &str) -> Self {
        let id = id.to_string();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1024);
        let (events, _) = broadcast::channel(1024);

        let state = BusState {
            cancel: cancel.clone(),
            tx: tx.clone(),
            events: events.clone(),
            jobs: HashMap::new(),
        };
        tokio::spawn(async move { Self::inner_loop(state, rx).await });
        Self {
            id,
            cancel,
            tx,
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn inner_loop(mut state: BusState, mut rx: mpsc::Receiver<BusCommand>) {
        let cancel = state.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(cmd) = rx.recv() => {
                    Self::inner_command_handler(&mut state, cmd);
                },
            }
        }
        log::debug!("bus stopped with {} jobs running", state.jobs.len());
    }

    fn inner_command_handler(state: &mut BusState, cmd: BusCommand) {
        match cmd {
            BusCommand::Start {
                id,
                pipeline,
                result,
            } => {
                let handle = Self::start_job(state, id, *pipeline);
                if result.send(handle).is_err() {
                    log::warn!("start result dropped: caller went away");
                }
            }
            BusCommand::Cancel { id, result } => {
                let outcome = match state.jobs.get(&id) {
                    Some(job) => {
                        job.cancel.cancel();
                        Ok(())
                    }
                    None => Err(Error::config(format!("no job named {id}"))),
                };
                let _ = result.send(outcome);
            }
            BusCommand::List { result } => {
                let mut ids: Vec<_> = state.jobs.keys().cloned().collect();
                ids.sort();
                let _ = result.send(ids);
            }
            BusCommand::Finished { id } => {
                state.jobs.remove(&id);
            }
        }
    }

    fn start_job(state: &mut BusState, id: String, mut pipeline: Pipeline) -> Result<JobHandle> {
        if state.jobs.contains_key(&id) {
            return Err(Error::config(format!("job {id} is already running")));
        }

        let cancel = state.cancel.child_token();
        let events = state.events.clone();
        let tx = state.tx.clone();
        let (done_tx, done_rx) = oneshot::channel();

        let segment_events = events.clone();
        let segment_job = id.clone();
        pipeline.set_segment_listener(move |entry| {
            let _ = segment_events.send(BusEvent::Segment {
                job: segment_job.clone(),
                entry: entry.clone(),
            });
        });

        let task_cancel = cancel.clone();
        let job = id.clone();
        tokio::spawn(async move {
            log::info!("job {} started", job);
            let result = tokio::task::spawn_blocking(move || pipeline.run_until_cancelled(&task_cancel))
                .await
                .unwrap_or_else(|err| Err(Error::Io(std::io::Error::other(err))));

            let event = match &result {
                Ok(stats) => {
                    log::info!("job {} finished: {} segments", job, stats.segments);
                    BusEvent::Finished {
                        job: job.clone(),
                        stats: stats.clone(),
                    }
                }
                Err(Error::Cancelled) => {
                    log::info!("job {} cancelled", job);
                    BusEvent::Cancelled { job: job.clone() }
                }
                Err(err) => {
                    log::error!("job {} failed: {}", job, err);
                    BusEvent::Failed {
                        job: job.clone(),
                        error: err.to_string(),
                    }
                }
            };
            let _ = events.send(event);
            let _ = tx.send(BusCommand::Finished { id: job }).await;
            let _ = done_tx.send(result);
        });

        state.jobs.insert(
            id.clone(),
            JobEntry {
                cancel: cancel.clone(),
            },
        );
        Ok(JobHandle {
            id,
            cancel,
            done: done_rx,
        })
    }

    /// Starts `pipeline` under `id`. Ids must be unique among running jobs.
    pub async fn spawn(&self, id: &str, pipeline: Pipeline) -> Result<JobHandle> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BusCommand::Start {
                id: id.to_string(),
                pipeline: Box::new(pipeline),
                result: tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    pub async fn cancel(&self, id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BusCommand::Cancel {
                id: id.to_string(),
                result: tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Ids of the jobs still running, sorted.
    pub async fn jobs(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BusCommand::List { result: tx })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Events from now on. Subscribers that fall behind miss events.
    pub fn subscribe(&self) -> EventStream {
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(|r| async move {
            match r {
                Ok(event) => Some(event),
                Err(e) => {
                    log::warn!("bus event subscriber lagging: {}", e);
                    None
                }
            }
        });
        Box::pin(stream)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        self.stop();
    }
}

struct BusState {
    cancel: CancellationToken,
    tx: mpsc::Sender<BusCommand>,
    events: broadcast::Sender<BusEvent>,
    jobs: HashMap<String, JobEntry>,
}

struct JobEntry {
    cancel: CancellationToken,
}

/// A running job. Dropping the handle does not stop the job.
pub struct JobHandle {
    id: String,
    cancel: CancellationToken,
    done: oneshot::Receiver<Result<PipelineStats>>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the job to end. A cancelled job yields [`Error::Cancelled`].
    pub async fn wait(self) -> Result<PipelineStats> {
        self.done.await.unwrap_or(Err(Error::Cancelled))
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = BusEvent> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    Segment { job: String, entry: ManifestEntry },
    Finished { job: String, stats: PipelineStats },
    Cancelled { job: String },
    Failed { job: String, error: String },
}

impl BusEvent {
    pub fn job(&self) -> &str {
        match self {
            BusEvent::Segment { job, .. }
            | BusEvent::Finished { job, .. }
            | BusEvent::Cancelled { job }
            | BusEvent::Failed { job, .. } => job,
        }
    }

    /// Whether this is the last event of its job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BusEvent::Segment { .. })
    }
}

enum BusCommand {
    Start {
        id: String,
        pipeline: Box<Pipeline>,
        result: oneshot::Sender<Result<JobHandle>>,
    },
    Cancel {
        id: String,
        result: oneshot::Sender<Result<()>>,
    },
    List {
        result: oneshot::Sender<Vec<String>>,
    },
    Finished {
        id: String,
    },
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod bus_test;
