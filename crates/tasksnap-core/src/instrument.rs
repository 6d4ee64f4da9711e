//! Futures that report their scheduling status to a [`TaskTable`].
//!
//! [`TaskTable`]: crate::task_table::TaskTable

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::task::TaskId;
use crate::task_table::{TaskHandle, TaskSlot};

/// A future registered as a task for as long as it is alive.
///
/// While polled the task is `Running`. A pending poll leaves it `Waiting`
/// until its waker fires, then `Runnable`. Completion or drop exits it.
#[must_use = "futures do nothing unless polled"]
pub struct Instrumented<F> {
    inner: Pin<Box<F>>,
    handle: Option<TaskHandle>,
}

impl<F> std::fmt::Debug for Instrumented<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumented")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl<F: Future> Instrumented<F> {
    pub(crate) fn new(future: F, handle: TaskHandle) -> Self {
        Self {
            inner: Box::pin(future),
            handle: Some(handle),
        }
    }

    /// Id of the task, or `None` once the future has completed.
    #[must_use]
    pub fn task_id(&self) -> Option<TaskId> {
        self.handle.as_ref().map(TaskHandle::id)
    }

    /// Handle of the live task, e.g. to record a stack or change labels.
    #[must_use]
    pub fn handle(&self) -> Option<&TaskHandle> {
        self.handle.as_ref()
    }
}

struct SlotWaker {
    slot: Arc<TaskSlot>,
    inner: Waker,
}

impl Wake for SlotWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.slot.wake();
        self.inner.wake_by_ref();
    }
}

impl<F: Future> Future for Instrumented<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        let Some(slot) = this.handle.as_ref().map(|h| Arc::clone(h.slot())) else {
            return this.inner.as_mut().poll(cx);
        };

        slot.begin_poll();
        let waker = Waker::from(Arc::new(SlotWaker {
            slot: Arc::clone(&slot),
            inner: cx.waker().clone(),
        }));
        let mut task_cx = Context::from_waker(&waker);
        match this.inner.as_mut().poll(&mut task_cx) {
            Poll::Ready(output) => {
                if let Some(handle) = this.handle.take() {
                    handle.exit();
                }
                Poll::Ready(output)
            }
            Poll::Pending => {
                slot.end_poll_pending();
                Poll::Pending
            }
        }
    }
}
