//! # async_result
//!
//! why: rpc clients complete on their own threads; the server needs a callback
//!      hook and tests need to block on the outcome
//! relations: returned by RpcClient::send, consumed by the raft server's dispatch
//! what: single-assignment AsyncResult with when_ready callbacks and blocking get

use std::fmt;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

type Handler<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

struct Slot<T, E> {
    result: Option<Result<T, E>>,
    handler: Option<Handler<T, E>>,
}

/// A value (or error) that becomes available exactly once.
///
/// The handler registered with [`AsyncResult::when_ready`] runs on whichever
/// thread supplies the result, or inline when the result is already there. It
/// is never invoked while the internal lock is held.
pub struct AsyncResult<T, E> {
    slot: Mutex<Slot<T, E>>,
    ready: Condvar,
}

impl<T, E> AsyncResult<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                result: None,
                handler: None,
            }),
            ready: Condvar::new(),
        }
    }

    /// Already completed result
    pub fn with_result(result: Result<T, E>) -> Self {
        let this = Self::new();
        this.slot.lock().result = Some(result);
        this
    }

    pub fn has_result(&self) -> bool {
        self.slot.lock().result.is_some()
    }

    /// Register the completion handler, replacing any previous one.
    pub fn when_ready(&self, handler: impl FnOnce(Result<T, E>) + Send + 'static) {
        let completed = {
            let mut slot = self.slot.lock();
            if slot.result.is_none() {
                slot.handler = Some(Box::new(handler));
                return;
            }
            slot.result.clone()
        };
        if let Some(result) = completed {
            handler(result);
        }
    }

    /// Complete the result. Returns false if it was already set.
    pub fn set_result(&self, result: Result<T, E>) -> bool {
        let handler = {
            let mut slot = self.slot.lock();
            if slot.result.is_some() {
                return false;
            }
            slot.result = Some(result.clone());
            self.ready.notify_all();
            slot.handler.take()
        };
        if let Some(handler) = handler {
            handler(result);
        }
        true
    }

    /// Block until the result is available.
    pub fn get(&self) -> Result<T, E> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = &slot.result {
                return result.clone();
            }
            self.ready.wait(&mut slot);
        }
    }

    /// Block for at most `timeout`; `None` if still pending.
    pub fn get_timeout(&self, timeout: Duration) -> Option<Result<T, E>> {
        let mut slot = self.slot.lock();
        if slot.result.is_none() {
            self.ready.wait_for(&mut slot, timeout);
        }
        slot.result.clone()
    }
}

impl<T, E> Default for AsyncResult<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for AsyncResult<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("ready", &self.slot.lock().result.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn handler_runs_when_result_arrives() {
        let res: Arc<AsyncResult<i32, String>> = Arc::new(AsyncResult::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        res.when_ready(move |r| {
            seen2.store(r.unwrap() as usize, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        let res2 = res.clone();
        thread::spawn(move || {
            res2.set_result(Ok(123));
        })
        .join()
        .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 123);
    }

    #[test]
    fn handler_runs_inline_if_already_done() {
        let res: AsyncResult<i32, String> = AsyncResult::with_result(Err("boom".into()));
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        res.when_ready(move |r| *seen2.lock() = Some(r));
        assert_eq!(*seen.lock(), Some(Err("boom".to_string())));
    }

    #[test]
    fn get_blocks_until_set() {
        let res: Arc<AsyncResult<String, ()>> = Arc::new(AsyncResult::new());
        let res2 = res.clone();
        let waiter = thread::spawn(move || res2.get());
        thread::sleep(Duration::from_millis(20));
        res.set_result(Ok("done".into()));
        assert_eq!(waiter.join().unwrap(), Ok("done".to_string()));
    }

    #[test]
    fn second_set_is_ignored() {
        let res: AsyncResult<i32, ()> = AsyncResult::new();
        assert!(res.set_result(Ok(1)));
        assert!(!res.set_result(Ok(2)));
        assert_eq!(res.get(), Ok(1));
    }

    #[test]
    fn get_timeout_returns_none_while_pending() {
        let res: AsyncResult<i32, ()> = AsyncResult::new();
        assert_eq!(res.get_timeout(Duration::from_millis(10)), None);
    }
}
