//! Background work on the [`AsyncComputeTaskPool`].
//!
//! Heavy terrain work (disk reads, decompression, derived data) runs on worker threads,
//! while its results are always applied on the main thread by polling.

use anyhow::{anyhow, Result};
use async_channel::{Receiver, Sender};
use bevy::tasks::{futures_lite::future, AsyncComputeTaskPool, Task, TaskPool};

fn task_pool() -> &'static TaskPool {
    AsyncComputeTaskPool::get_or_init(TaskPool::default)
}

/// A single unit of background work producing a `T`.
///
/// In synchronous mode the work runs inline and the job starts out finished.
pub enum BackgroundJob<T> {
    Running(Task<Result<T>>),
    Finished(Option<Result<T>>),
}

impl<T: Send + 'static> BackgroundJob<T> {
    pub fn spawn<F>(synchronous: bool, work: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if synchronous {
            Self::Finished(Some(work()))
        } else {
            Self::Running(task_pool().spawn(async move { work() }))
        }
    }

    /// Returns the result once the work has finished.
    /// The job must be dropped after it returned `Some`.
    pub fn poll(&mut self) -> Option<Result<T>> {
        match self {
            Self::Running(task) => future::block_on(future::poll_once(task)),
            Self::Finished(result) => result.take(),
        }
    }

    /// Blocks the calling thread until the work has finished.
    pub fn wait(self) -> Result<T> {
        match self {
            Self::Running(task) => future::block_on(task),
            Self::Finished(result) => {
                result.unwrap_or_else(|| Err(anyhow!("background job was already consumed")))
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            Self::Running(task) => task.is_finished(),
            Self::Finished(result) => result.is_some(),
        }
    }
}

/// Collects the responses of detached background requests, which are drained on the main thread.
pub struct ResponseQueue<R> {
    sender: Sender<R>,
    receiver: Receiver<R>,
    in_flight: usize,
}

impl<R: Send + 'static> Default for ResponseQueue<R> {
    fn default() -> Self {
        let (sender, receiver) = async_channel::unbounded();

        Self {
            sender,
            receiver,
            in_flight: 0,
        }
    }
}

impl<R: Send + 'static> ResponseQueue<R> {
    /// Runs `request` on a worker thread and queues its response.
    pub fn add_request<F>(&mut self, request: F)
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let sender = self.sender.clone();
        self.in_flight += 1;

        task_pool()
            .spawn(async move {
                // the receiver lives as long as the queue, a closed channel means nobody waits
                let _ = sender.send(request()).await;
            })
            .detach();
    }

    /// Pops one finished response without blocking.
    pub fn try_next(&mut self) -> Option<R> {
        let response = self.receiver.try_recv().ok()?;
        self.in_flight -= 1;
        Some(response)
    }

    /// Blocks until the next response arrives, returns `None` if nothing is in flight.
    pub fn next_blocking(&mut self) -> Option<R> {
        if self.in_flight == 0 {
            return None;
        }

        let response = self.receiver.recv_blocking().ok()?;
        self.in_flight -= 1;
        Some(response)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synchronous_job_is_finished() {
        let mut job = BackgroundJob::spawn(true, || Ok(42));

        assert!(job.is_finished());
        assert_eq!(job.poll().unwrap().unwrap(), 42);
        assert!(job.poll().is_none());
    }

    #[test]
    fn background_job_wait() {
        let job = BackgroundJob::spawn(false, || Ok(vec![1, 2, 3]));
        assert_eq!(job.wait().unwrap(), vec![1, 2, 3]);

        let failed = BackgroundJob::<()>::spawn(false, || Err(anyhow!("disk on fire")));
        assert!(failed.wait().is_err());
    }

    #[test]
    fn response_queue_drains() {
        let mut queue = ResponseQueue::default();

        for i in 0..4 {
            queue.add_request(move || i * 2);
        }

        let mut responses = Vec::new();
        while let Some(response) = queue.next_blocking() {
            responses.push(response);
        }
        responses.sort();

        assert_eq!(responses, vec![0, 2, 4, 6]);
        assert_eq!(queue.in_flight(), 0);
        assert!(queue.try_next().is_none());
    }
}
