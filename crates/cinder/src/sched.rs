//! Tagged background tasks with an error budget.
//!
//! Actors hand their short-lived work (dials, NAT checks, torrent loops)
//! to a [`Scheduler`] instead of spawning it loose. Tasks can be delayed,
//! every task carries a tag so all work of one owner can be killed at
//! once, and failed tasks are logged. Past [`MAX_TASK_ERRORS`] failures the
//! owner is told to stop.
use std::{fmt::Debug, future::Future, hash::Hash, time::Duration};

use hashbrown::HashMap;
use tokio::{
    task::{AbortHandle, JoinSet},
    time::sleep,
};
use tracing::{error, trace};

use crate::error::Error;

/// Failed tasks tolerated before [`Scheduler::join_next`] gives up.
pub const MAX_TASK_ERRORS: usize = 10;

#[derive(Debug)]
pub struct Scheduler<K> {
    set: JoinSet<Result<(), Error>>,
    tags: HashMap<K, Vec<AbortHandle>>,
    errors: usize,
}

impl<K> Default for Scheduler<K> {
    fn default() -> Self {
        Self { set: JoinSet::new(), tags: HashMap::new(), errors: 0 }
    }
}

impl<K> Scheduler<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` after `delay`, tagged with `tag`.
    pub fn add_task<F>(&mut self, delay: Duration, tag: K, fut: F)
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let handle = self.set.spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            fut.await
        });
        self.tags.entry(tag).or_default().push(handle);
    }

    /// Abort every task with this tag.
    pub fn kill_tasks(&mut self, tag: &K) {
        if let Some(handles) = self.tags.remove(tag) {
            trace!("killing {} tasks of {tag:?}", handles.len());
            for h in handles {
                h.abort();
            }
        }
    }

    /// Tags with tasks still running.
    pub fn tags(&self) -> impl Iterator<Item = &K> {
        self.tags.keys()
    }

    /// Forget finished tasks, and tags left without any.
    fn prune(&mut self) {
        self.tags.retain(|_, handles| {
            handles.retain(|h| !h.is_finished());
            !handles.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    /// Wait for the next task to finish. Never resolves while there are
    /// no tasks, so it can sit in a `select!` arm.
    pub async fn join_next(&mut self) -> Result<(), Error> {
        loop {
            let Some(res) = self.set.join_next().await else {
                return std::future::pending().await;
            };
            self.prune();
            let err = match res {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => Error::from(e),
            };
            self.errors += 1;
            error!("task failed ({}/{MAX_TASK_ERRORS}): {err}", self.errors);
            if self.errors > MAX_TASK_ERRORS {
                return Err(Error::TooManyTaskErrors(self.errors));
            }
        }
    }

    /// Abort everything.
    pub fn shutdown(&mut self) {
        self.tags.clear();
        self.set.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delayed_and_killed_tasks() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut sched = Scheduler::new();

        for (tag, delay) in [("a", 1), ("b", 2), ("a", 3)] {
            let ran = ran.clone();
            sched.add_task(Duration::from_secs(delay), tag, async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        tokio::time::sleep(Duration::from_millis(1500)).await;
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        sched.kill_tasks(&"a");
        tokio::time::sleep(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn finished_tasks_leave_no_tags() {
        let mut sched = Scheduler::new();
        for tag in 0..3u8 {
            sched.add_task(Duration::ZERO, tag, async { Ok(()) });
        }
        assert_eq!(sched.tags().count(), 3);

        let _ = tokio::time::timeout(Duration::from_millis(50), sched.join_next()).await;
        assert!(sched.is_empty());
        assert_eq!(sched.tags().count(), 0);
    }

    #[tokio::test]
    async fn error_budget() {
        let mut sched = Scheduler::new();
        for _ in 0..=MAX_TASK_ERRORS {
            sched.add_task(Duration::ZERO, 0u8, async { Err(Error::Timeout) });
        }
        let res = sched.join_next().await;
        assert!(matches!(res, Err(Error::TooManyTaskErrors(11))));
    }

    #[tokio::test]
    async fn failures_within_budget_keep_going() {
        let mut sched = Scheduler::new();
        sched.add_task(Duration::ZERO, 0u8, async { Err(Error::Timeout) });
        let waited = tokio::time::timeout(Duration::from_millis(50), sched.join_next()).await;
        // pending forever once the set is drained
        assert!(waited.is_err());
        assert_eq!(sched.errors(), 1);
    }
}
