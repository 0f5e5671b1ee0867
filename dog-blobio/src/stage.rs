use std::sync::Arc;

use tokio::sync::oneshot::{self, error::TryRecvError};

use crate::{BlockId, TransferError, TransferResult};

type StageOutcome = Result<BlockId, Arc<TransferError>>;

/// Completion handle for one asynchronously uploaded block.
///
/// Polling never blocks; [`StageTask::wait`] blocks the calling thread and
/// must not be called from inside an async runtime.
#[derive(Debug)]
pub struct StageTask {
    state: StageState,
}

#[derive(Debug)]
enum StageState {
    Pending(oneshot::Receiver<TransferResult<BlockId>>),
    Done(StageOutcome),
}

/// Producer side of a [`StageTask`], held by whoever performs the upload
#[derive(Debug)]
pub struct StageCompleter {
    tx: oneshot::Sender<TransferResult<BlockId>>,
}

impl StageCompleter {
    pub fn complete(self, result: TransferResult<BlockId>) {
        // The task may already be gone if its handle was dropped
        let _ = self.tx.send(result);
    }
}

impl StageTask {
    /// Create a task that is resolved later through the returned completer
    pub fn pending() -> (StageCompleter, StageTask) {
        let (tx, rx) = oneshot::channel();
        (
            StageCompleter { tx },
            StageTask {
                state: StageState::Pending(rx),
            },
        )
    }

    /// Create an already finished task
    pub fn completed(result: TransferResult<BlockId>) -> Self {
        Self {
            state: StageState::Done(result.map_err(Arc::new)),
        }
    }

    /// Non-blocking check for a terminal state
    pub fn is_done(&mut self) -> bool {
        self.poll();
        matches!(self.state, StageState::Done(_))
    }

    /// The failure, if the task has finished with one. Non-blocking.
    pub fn error(&mut self) -> Option<Arc<TransferError>> {
        self.poll();
        match &self.state {
            StageState::Done(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// The produced id, if the task has finished successfully
    pub fn block_id(&self) -> Option<&BlockId> {
        match &self.state {
            StageState::Done(Ok(id)) => Some(id),
            _ => None,
        }
    }

    /// Block until the task reaches a terminal state
    pub fn wait(&mut self) -> Result<&BlockId, Arc<TransferError>> {
        if matches!(self.state, StageState::Pending(_)) {
            // blocking_recv consumes the receiver
            let taken = std::mem::replace(
                &mut self.state,
                StageState::Done(Err(Arc::new(TransferError::Abandoned))),
            );
            if let StageState::Pending(rx) = taken {
                let outcome = match rx.blocking_recv() {
                    Ok(result) => result.map_err(Arc::new),
                    Err(_) => Err(Arc::new(TransferError::Abandoned)),
                };
                self.state = StageState::Done(outcome);
            }
        }
        match &self.state {
            StageState::Done(Ok(id)) => Ok(id),
            StageState::Done(Err(e)) => Err(e.clone()),
            StageState::Pending(_) => Err(Arc::new(TransferError::Abandoned)),
        }
    }

    fn poll(&mut self) {
        if let StageState::Pending(rx) = &mut self.state {
            let outcome = match rx.try_recv() {
                Ok(result) => result.map_err(Arc::new),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Closed) => Err(Arc::new(TransferError::Abandoned)),
            };
            self.state = StageState::Done(outcome);
        }
    }
}

/// Every stage task a write handle has submitted, kept in submission order,
/// plus the subset not yet observed in a terminal state.
#[derive(Debug, Default)]
pub struct StageTasks {
    history: Vec<StageTask>,
    in_flight: Vec<usize>,
}

impl StageTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, tasks: Vec<StageTask>) {
        for task in tasks {
            self.in_flight.push(self.history.len());
            self.history.push(task);
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Retire finished tasks without blocking. Returns the first failure
    /// among them, in submission order.
    pub fn poll(&mut self) -> Option<Arc<TransferError>> {
        let mut first_error = None;
        let history = &mut self.history;
        self.in_flight.retain(|&index| {
            let task = &mut history[index];
            if !task.is_done() {
                return true;
            }
            if first_error.is_none() {
                first_error = task.error();
            }
            false
        });
        first_error
    }

    /// Block until every in-flight task is terminal. Returns the first
    /// failure, in submission order.
    pub fn wait_all(&mut self) -> Option<Arc<TransferError>> {
        let mut first_error = None;
        for index in self.in_flight.drain(..) {
            if let Err(e) = self.history[index].wait() {
                first_error.get_or_insert(e);
            }
        }
        first_error
    }

    /// Ids of all submitted tasks in submission order. Fails if any task
    /// has not finished successfully.
    pub fn block_ids(&mut self) -> Result<Vec<BlockId>, Arc<TransferError>> {
        self.history
            .iter_mut()
            .map(|task| task.wait().cloned())
            .collect()
    }
}
