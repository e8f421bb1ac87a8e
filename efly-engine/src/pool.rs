//! Shard executor pool.
//!
//! One worker thread per shard, each hosting a current-thread Tokio runtime that drains a
//! closure queue. Shard state is owned by its worker and never leaves the thread; callers reach
//! it by submitting closures and, for synchronous calls, waiting on a reply channel.

use std::sync::mpsc as std_mpsc;
use std::thread;

use efly_common::error::{EflyError, EflyResult};
use efly_common::ids::{ShardCount, ShardId};
use tokio::runtime::Builder as TokioBuilder;
use tokio::sync::mpsc;

use crate::shard::EngineShard;

type ShardJob = Box<dyn FnOnce(&mut EngineShard) + Send>;

/// Fixed set of shard executor threads.
pub struct ShardPool {
    shard_count: ShardCount,
    senders: Vec<mpsc::UnboundedSender<ShardJob>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for ShardPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardPool")
            .field("shard_count", &self.shard_count)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl ShardPool {
    /// Spawns one executor thread per shard.
    #[must_use]
    pub fn new(shard_count: ShardCount) -> Self {
        let shard_len = usize::from(shard_count.get());
        let mut senders = Vec::with_capacity(shard_len);
        let mut workers = Vec::with_capacity(shard_len);

        for shard in 0..shard_len {
            let (sender, receiver) = mpsc::unbounded_channel::<ShardJob>();
            senders.push(sender);
            let shard_id = ShardId::try_from(shard).unwrap_or(0);
            let handle = thread::spawn(move || shard_worker_thread_main(shard_id, receiver));
            workers.push(handle);
        }

        Self {
            shard_count,
            senders,
            workers,
        }
    }

    /// Number of shard executors in this pool.
    #[must_use]
    pub fn shard_count(&self) -> ShardCount {
        self.shard_count
    }

    /// Submits a fire-and-forget closure to one shard executor.
    ///
    /// # Errors
    ///
    /// Returns `EflyError::InvalidState` when the shard id is out of range or the executor
    /// queue is closed.
    pub fn submit(
        &self,
        shard: ShardId,
        job: impl FnOnce(&mut EngineShard) + Send + 'static,
    ) -> EflyResult<()> {
        let Some(sender) = self.senders.get(usize::from(shard)) else {
            return Err(EflyError::InvalidState("shard id is out of range"));
        };
        sender
            .send(Box::new(job))
            .map_err(|_| EflyError::InvalidState("shard executor queue is closed"))
    }

    /// Runs a closure on one shard executor and waits for its result.
    ///
    /// The closure is guaranteed to run on the owning shard's thread; the caller suspends until
    /// it completes.
    ///
    /// # Errors
    ///
    /// Returns `EflyError::InvalidState` when the shard id is out of range or the executor is
    /// gone.
    pub fn await_on_shard<R>(
        &self,
        shard: ShardId,
        job: impl FnOnce(&mut EngineShard) -> R + Send + 'static,
    ) -> EflyResult<R>
    where
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = std_mpsc::channel::<R>();
        self.submit(shard, move |state| {
            let _ = reply_tx.send(job(state));
        })?;
        reply_rx
            .recv()
            .map_err(|_| EflyError::InvalidState("shard executor reply channel is closed"))
    }

    /// Fans one closure out to every shard executor and joins all results in shard order.
    ///
    /// # Errors
    ///
    /// Returns `EflyError::InvalidState` when any executor is gone.
    pub fn run_brief_in_parallel<R>(
        &self,
        job: impl Fn(&mut EngineShard) -> R + Send + Sync + Clone + 'static,
    ) -> EflyResult<Vec<R>>
    where
        R: Send + 'static,
    {
        let mut receivers = Vec::with_capacity(self.senders.len());
        for shard in 0..self.senders.len() {
            let shard_id = ShardId::try_from(shard).unwrap_or(0);
            let (reply_tx, reply_rx) = std_mpsc::channel::<R>();
            let job = job.clone();
            self.submit(shard_id, move |state| {
                let _ = reply_tx.send(job(state));
            })?;
            receivers.push(reply_rx);
        }

        let mut results = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            let result = receiver
                .recv()
                .map_err(|_| EflyError::InvalidState("shard executor reply channel is closed"))?;
            results.push(result);
        }
        Ok(results)
    }
}

impl Drop for ShardPool {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn shard_worker_thread_main(shard_id: ShardId, mut receiver: mpsc::UnboundedReceiver<ShardJob>) {
    let Ok(runtime) = TokioBuilder::new_current_thread().enable_time().build() else {
        return;
    };

    runtime.block_on(async move {
        let mut shard = EngineShard::new(shard_id);
        while let Some(job) = receiver.recv().await {
            job(&mut shard);
        }
    });
}
