use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::server::{Operation, ServerError, ServerResult, State};

type SharedOperation = Shared<BoxFuture<'static, ServerResult<State>>>;
type Running = Arc<DashMap<(i64, Operation), SharedOperation>>;
type Locks = Arc<DashMap<i64, Arc<Mutex<()>>>>;

/// Per-server serialization and coalescing of lifecycle operations.
///
/// Identical calls (same server, same operation) that overlap share one
/// execution and all observe its result. Different mutating operations on
/// the same server run one after another; `state` refreshes only coalesce.
/// Different servers never contend.
///
/// Each execution runs on its own task, so it finishes even if every caller
/// waiting on it goes away.
#[derive(Default)]
pub struct InFlight {
    running: Running,
    locks: Locks,
}

/// Exclusive access to one server. The server's lock entry is dropped with
/// the last guard nobody else is waiting behind.
pub struct ServerGuard {
    id: i64,
    locks: Locks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Clears an execution's entry when its task ends, including by panic.
struct Finished {
    running: Running,
    key: (i64, Operation),
}

impl Drop for Finished {
    fn drop(&mut self) {
        self.running.remove(&self.key);
    }
}

fn mutex_for(locks: &Locks, id: i64) -> Arc<Mutex<()>> {
    Arc::clone(locks.entry(id).or_default().value())
}

async fn acquire(locks: Locks, id: i64) -> ServerGuard {
    let guard = mutex_for(&locks, id).lock_owned().await;
    ServerGuard {
        id,
        locks,
        guard: Some(guard),
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to server `id`.
    pub async fn lock(&self, id: i64) -> ServerGuard {
        acquire(Arc::clone(&self.locks), id).await
    }

    /// Exclusive access to server `id`, unless a mutation holds it.
    pub fn try_lock(&self, id: i64) -> Option<ServerGuard> {
        let guard = mutex_for(&self.locks, id).try_lock_owned().ok()?;
        Some(ServerGuard {
            id,
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        })
    }

    /// Join the execution of `operation` on `id` if one is running, otherwise
    /// start `execute` (under the server's lock unless it is a refresh).
    pub async fn run<F>(&self, id: i64, operation: Operation, execute: F) -> ServerResult<State>
    where
        F: FnOnce() -> BoxFuture<'static, ServerResult<State>>,
    {
        let shared = match self.running.entry((id, operation)) {
            Entry::Occupied(entry) => {
                debug!(id, operation = %operation, "Joining in-flight operation");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let locks = (operation != Operation::State).then(|| Arc::clone(&self.locks));
                let finished = Finished {
                    running: Arc::clone(&self.running),
                    key: (id, operation),
                };
                let work = execute();
                let handle = tokio::spawn(async move {
                    let _finished = finished;
                    let _guard = match locks {
                        Some(locks) => Some(acquire(locks, id).await),
                        None => None,
                    };
                    work.await
                });
                let shared = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(ServerError::Internal(format!(
                            "{} task for compute server {} failed: {}",
                            operation, id, e
                        )))
                    })
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());
                shared
            }
        };
        shared.await
    }

    /// Number of distinct operations currently executing.
    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    /// Servers with a live lock entry.
    pub fn locked_servers(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn explode() -> BoxFuture<'static, ServerResult<State>> {
        async { panic!("adapter bug") }.boxed()
    }

    #[tokio::test]
    async fn panicking_execution_is_cleared() {
        let inflight = InFlight::new();

        let first = inflight.run(1, Operation::Start, explode).await;
        assert!(matches!(first, Err(ServerError::Internal(_))));
        assert!(inflight.is_empty());
        assert_eq!(inflight.locked_servers(), 0);

        let second = inflight
            .run(1, Operation::Start, || async { Ok(State::Running) }.boxed())
            .await;
        assert_eq!(second, Ok(State::Running));
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn lock_entries_are_evicted() {
        let inflight = InFlight::new();
        for id in 0..10 {
            let state = inflight
                .run(id, Operation::Stop, || async { Ok(State::Off) }.boxed())
                .await;
            assert_eq!(state, Ok(State::Off));
        }
        assert_eq!(inflight.locked_servers(), 0);

        let guard = inflight.lock(7).await;
        assert_eq!(inflight.locked_servers(), 1);
        assert!(inflight.try_lock(7).is_none());
        drop(guard);
        assert_eq!(inflight.locked_servers(), 0);
        assert!(inflight.try_lock(7).is_some());
        assert_eq!(inflight.locked_servers(), 0);
    }

    #[tokio::test]
    async fn waiting_mutation_keeps_the_lock_entry() {
        let inflight = Arc::new(InFlight::new());
        let guard = inflight.lock(3).await;

        let waiter = {
            let inflight = Arc::clone(&inflight);
            tokio::spawn(async move {
                inflight
                    .run(3, Operation::Start, || async { Ok(State::Running) }.boxed())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!inflight.is_empty());

        drop(guard);
        assert_eq!(waiter.await.unwrap(), Ok(State::Running));
        assert!(inflight.is_empty());
        assert_eq!(inflight.locked_servers(), 0);
    }
}
