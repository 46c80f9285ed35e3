//! Reference counted shared loads
//!
//! A load for one position may be wanted by the section at that position
//! and by up to four neighbours. They all share one [`RefCountedLoad`]; the
//! spawned task is aborted when the last interested party lets go before it
//! finishes.

use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::core::error::{Error, Result};
use crate::math::SectionPos;

const RUNNING: u8 = 0;
const COMPLETED: u8 = 1;
const CANCELLED: u8 = 2;

/// Shared handle to an in-flight or finished load
///
/// The reference count starts at 1 for the creator. Every additional user
/// calls [`try_acquire`](Self::try_acquire) and every user calls
/// [`release`](Self::release) exactly once.
pub struct RefCountedLoad<T> {
    pos: SectionPos,
    ref_count: AtomicUsize,
    state: AtomicU8,
    result: watch::Sender<Option<Result<T>>>,
    abort: Mutex<Option<AbortHandle>>,
}

impl<T> RefCountedLoad<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn with_state(pos: SectionPos, state: u8, result: Option<Result<T>>) -> Arc<Self> {
        let (tx, _rx) = watch::channel(result);
        Arc::new(Self {
            pos,
            ref_count: AtomicUsize::new(1),
            state: AtomicU8::new(state),
            result: tx,
            abort: Mutex::new(None),
        })
    }

    /// Spawn `future` on `runtime` and wrap it in a shared load
    pub fn spawn<F>(runtime: &Handle, pos: SectionPos, future: F) -> Arc<Self>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let load = Self::with_state(pos, RUNNING, None);
        let task_load = Arc::clone(&load);
        let handle = runtime.spawn(async move {
            let result = future.await;
            task_load.complete(result);
        });
        *load.abort.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.abort_handle());
        load
    }

    /// A load that is already finished, e.g. served from the cache
    pub fn completed(pos: SectionPos, value: T) -> Arc<Self> {
        Self::with_state(pos, COMPLETED, Some(Ok(value)))
    }

    /// A running load with no task attached; finished through [`complete`](Self::complete)
    pub fn pending(pos: SectionPos) -> Arc<Self> {
        Self::with_state(pos, RUNNING, None)
    }

    pub fn pos(&self) -> SectionPos {
        self.pos
    }

    /// Store the result unless the load was cancelled first
    pub fn complete(&self, result: Result<T>) -> bool {
        if self
            .state
            .compare_exchange(RUNNING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.result.send_replace(Some(result));
        true
    }

    /// Register another user of this load
    ///
    /// Fails once the count has dropped to zero or the load was cancelled;
    /// the caller must then start a new load.
    pub fn try_acquire(&self) -> bool {
        if self.state.load(Ordering::Acquire) == CANCELLED {
            return false;
        }
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n == 0 { None } else { Some(n + 1) }
            })
            .is_ok()
    }

    /// Drop one reference
    ///
    /// Returns true only when this call cancelled the load: the count hit
    /// zero while the load was still running. Releasing a finished load
    /// never cancels it.
    pub fn release(&self) -> bool {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => self.cancel(),
            Ok(_) => false,
            Err(_) => {
                log::warn!("{}: load released more times than acquired", self.pos);
                false
            }
        }
    }

    fn cancel(&self) -> bool {
        if self
            .state
            .compare_exchange(RUNNING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(handle) = self.abort.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
        self.result.send_replace(Some(Err(Error::Cancelled)));
        log::trace!("{}: load cancelled", self.pos);
        true
    }

    /// Wait for the shared result
    pub async fn wait(&self) -> Result<T> {
        let mut rx = self.result.subscribe();
        let ready = rx.wait_for(Option::is_some).await;
        match ready {
            Ok(value) => value.clone().unwrap_or(Err(Error::Cancelled)),
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Result if the load already finished
    pub fn try_result(&self) -> Option<Result<T>> {
        self.result.borrow().clone()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }

    /// Nobody holds a reference any more
    pub fn is_abandoned(&self) -> bool {
        self.ref_count() == 0
    }
}

/// Owned reference to a shared load, released on drop
pub struct LoadLease<T>
where
    T: Clone + Send + Sync + 'static,
{
    load: Arc<RefCountedLoad<T>>,
}

impl<T> LoadLease<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Take ownership of one reference that the caller already holds
    pub fn adopt(load: Arc<RefCountedLoad<T>>) -> Self {
        Self { load }
    }

    /// Acquire a new reference, or `None` if the load can no longer be shared
    pub fn acquire(load: &Arc<RefCountedLoad<T>>) -> Option<Self> {
        load.try_acquire().then(|| Self { load: Arc::clone(load) })
    }

    pub fn pos(&self) -> SectionPos {
        self.load.pos()
    }

    pub async fn wait(&self) -> Result<T> {
        self.load.wait().await
    }

    pub fn load(&self) -> &Arc<RefCountedLoad<T>> {
        &self.load
    }
}

impl<T> Drop for LoadLease<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.load.release();
    }
}
