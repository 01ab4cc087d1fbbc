//! Cooperative cancellation primitives used across the judging pipeline.
//!
//! A [`CancellationTokenHandle`] forms a tree: cancelling a handle cancels
//! every handle derived from it via [`CancellationTokenHandle::child_token`],
//! but not its parent. The global abort handle sits at the root; each
//! submission gets a child, and each sandbox invocation races against it.

use std::{
    sync::atomic::AtomicBool,
    sync::atomic::AtomicUsize,
    sync::atomic::Ordering,
    sync::{Arc, Mutex, Weak},
    task::Poll,
    task::Waker,
};

use dashmap::DashMap;
use futures::Future;

/// A handle that can cancel all [`CancellationToken`]s derived from it.
///
/// The default handle is empty: its tokens never fire, which is useful for
/// call sites that do not care about cancellation.
#[derive(Clone)]
pub struct CancellationTokenHandle {
    token_ref: Option<Arc<InnerCToken>>,
}

impl CancellationTokenHandle {
    pub fn new() -> CancellationTokenHandle {
        CancellationTokenHandle {
            token_ref: Some(Arc::new(InnerCToken::new())),
        }
    }

    /// A handle that never gets cancelled.
    pub fn empty() -> CancellationTokenHandle {
        Self::default()
    }

    /// Cancel this handle's subtree: all tokens of this handle and of every
    /// child handle created from it.
    pub fn cancel(&self) {
        if let Some(r) = self.token_ref.as_ref() {
            r.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token_ref
            .as_ref()
            .map_or(false, |r| r.cancelled.load(Ordering::SeqCst))
    }

    /// Derive a handle that is cancelled whenever `self` is cancelled, but
    /// whose own [`cancel`](Self::cancel) does not propagate upwards.
    pub fn child_token(&self) -> CancellationTokenHandle {
        let parent = match self.token_ref.as_ref() {
            Some(r) => r,
            None => return CancellationTokenHandle::empty(),
        };
        let child = Arc::new(InnerCToken::new());
        if parent.cancelled.load(Ordering::SeqCst) {
            child.cancel();
        } else {
            let mut children = parent.children.lock().expect("Poisoned children list");
            // The parent may have been cancelled while we waited on the lock.
            if parent.cancelled.load(Ordering::SeqCst) {
                child.cancel();
            } else {
                children.push(Arc::downgrade(&child));
            }
        }
        CancellationTokenHandle {
            token_ref: Some(child),
        }
    }

    /// A future that resolves once this handle is cancelled. Empty handles
    /// return a future that never resolves.
    pub fn cancelled(&self) -> CancellationToken {
        CancellationToken {
            token_ref: self.token_ref.clone(),
            waker_id: None,
        }
    }
}

impl Default for CancellationTokenHandle {
    fn default() -> Self {
        CancellationTokenHandle { token_ref: None }
    }
}

impl std::fmt::Debug for CancellationTokenHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationTokenHandle")
            .field("live", &self.token_ref.is_some())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct InnerCToken {
    cancelled: AtomicBool,
    counter: AtomicUsize,
    wakers: DashMap<usize, Waker>,
    children: Mutex<Vec<Weak<InnerCToken>>>,
}

impl InnerCToken {
    fn new() -> InnerCToken {
        InnerCToken {
            cancelled: AtomicBool::new(false),
            counter: AtomicUsize::new(0),
            wakers: DashMap::new(),
            children: Mutex::new(Vec::new()),
        }
    }

    fn store_waker(&self, waker: Waker) -> usize {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        self.wakers.insert(id, waker);
        id
    }

    fn drop_waker(&self, id: usize) -> Option<Waker> {
        self.wakers.remove(&id).map(|(_id, waker)| waker)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wakers
            .iter()
            .for_each(|pair| pair.value().wake_by_ref());
        let children = std::mem::take(&mut *self.children.lock().expect("Poisoned children list"));
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

pub struct CancellationToken {
    token_ref: Option<Arc<InnerCToken>>,
    waker_id: Option<usize>,
}

impl Future for CancellationToken {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Self::Output> {
        if let Some(token_ref) = self.token_ref.clone() {
            if token_ref.cancelled.load(Ordering::SeqCst) {
                if let Some(id) = self.waker_id.take() {
                    token_ref.drop_waker(id);
                }
                return Poll::Ready(());
            }
            let id = token_ref.store_waker(cx.waker().clone());
            if let Some(id) = self.waker_id.take() {
                token_ref.drop_waker(id);
            }
            self.waker_id = Some(id);
            Poll::Pending
        } else {
            Poll::Pending
        }
    }
}

impl Drop for CancellationToken {
    fn drop(&mut self) {
        if let Some(token_ref) = self.token_ref.as_ref() {
            if let Some(id) = self.waker_id.take() {
                token_ref.drop_waker(id);
            }
        }
    }
}

/// Race an arbitrary future against a cancellation token.
pub struct WithCancel<F> {
    future: F,
    cancel: CancellationToken,
}

impl<F: Future> Future for WithCancel<F> {
    type Output = Option<F::Output>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Self::Output> {
        // SAFETY: `future` is never moved out of `this` after being pinned;
        // `cancel` is Unpin.
        let this = unsafe { self.get_unchecked_mut() };
        if std::pin::Pin::new(&mut this.cancel).poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        let future = unsafe { std::pin::Pin::new_unchecked(&mut this.future) };
        future.poll(cx).map(Some)
    }
}

/// Extension trait adding [`with_cancel`](WithCancelExt::with_cancel) to all
/// futures. Resolves to `None` if the token fired before the future completed.
pub trait WithCancelExt: Future + Sized {
    fn with_cancel(self, cancel: CancellationToken) -> WithCancel<Self> {
        WithCancel {
            future: self,
            cancel,
        }
    }
}

impl<F: Future + Sized> WithCancelExt for F {}
