//! Completion events for asynchronous submissions
//!
//! Every submission returns an [`Event`]. Host events are signalled by the
//! worker lane that ran the kernel. GPU events are *driven*: waiting on them
//! polls the device queue until the submission is known to be finished.
//! A failed submission stores its error in the event; dependents observe the
//! same error instead of running.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Drives a backend-side completion (GPU queue poll, stream sync)
#[cfg(any(feature = "wgpu", feature = "cuda"))]
pub(crate) trait EventDriver: Send + Sync {
    /// Block until the tracked work is finished
    fn drive(&self) -> Result<()>;

    /// Non-blocking completion check
    fn poll(&self) -> bool {
        false
    }
}

enum Source {
    /// Completed explicitly by `signal`
    Signalled,
    /// Completed by driving a backend handle
    #[cfg(any(feature = "wgpu", feature = "cuda"))]
    Driven(Box<dyn EventDriver>),
    /// Completes when all of the contained events complete
    Join(Vec<Event>),
}

struct EventInner {
    state: Mutex<Option<Result<()>>>,
    ready: Condvar,
    source: Source,
}

/// Handle to the completion of a submitted operation
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    fn from_source(state: Option<Result<()>>, source: Source) -> Self {
        Self {
            inner: Arc::new(EventInner {
                state: Mutex::new(state),
                ready: Condvar::new(),
                source,
            }),
        }
    }

    /// An event that has already completed successfully
    pub fn completed() -> Self {
        Self::from_source(Some(Ok(())), Source::Signalled)
    }

    /// An event that has already failed
    pub fn failed(error: Error) -> Self {
        Self::from_source(Some(Err(error)), Source::Signalled)
    }

    /// A pending event completed later through [`Event::signal`]
    pub(crate) fn pending() -> Self {
        Self::from_source(None, Source::Signalled)
    }

    /// A pending event completed by driving a backend handle
    #[cfg(any(feature = "wgpu", feature = "cuda"))]
    pub(crate) fn driven(driver: Box<dyn EventDriver>) -> Self {
        Self::from_source(None, Source::Driven(driver))
    }

    /// An event that completes once every event in `events` has completed
    ///
    /// Fails with the first error among them.
    pub fn join(events: Vec<Event>) -> Self {
        if events.is_empty() {
            return Self::completed();
        }
        Self::from_source(None, Source::Join(events))
    }

    /// Complete a signalled event; later signals are ignored
    pub(crate) fn signal(&self, result: Result<()>) {
        let mut state = self.inner.state.lock();
        if state.is_none() {
            *state = Some(result);
            self.inner.ready.notify_all();
        }
    }

    /// Block until the operation completes, returning its outcome
    pub fn wait(&self) -> Result<()> {
        if let Some(result) = self.inner.state.lock().clone() {
            return result;
        }
        let result = match &self.inner.source {
            Source::Signalled => {
                let mut state = self.inner.state.lock();
                loop {
                    if let Some(result) = state.clone() {
                        return result;
                    }
                    self.inner.ready.wait(&mut state);
                }
            }
            #[cfg(any(feature = "wgpu", feature = "cuda"))]
            Source::Driven(driver) => driver.drive(),
            Source::Join(events) => events.iter().try_for_each(Event::wait),
        };
        let mut state = self.inner.state.lock();
        if state.is_none() {
            *state = Some(result.clone());
        }
        result
    }

    /// Non-blocking check whether the operation has finished
    pub fn is_complete(&self) -> bool {
        if self.inner.state.lock().is_some() {
            return true;
        }
        match &self.inner.source {
            Source::Signalled => false,
            #[cfg(any(feature = "wgpu", feature = "cuda"))]
            Source::Driven(driver) => {
                if driver.poll() {
                    let mut state = self.inner.state.lock();
                    if state.is_none() {
                        *state = Some(Ok(()));
                    }
                    true
                } else {
                    false
                }
            }
            Source::Join(events) => events.iter().all(Event::is_complete),
        }
    }

    /// Whether two handles refer to the same event
    pub fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            None => "pending",
            Some(Ok(())) => "complete",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Event").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_signal_wakes_waiter() {
        let event = Event::pending();
        let signaller = event.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.signal(Ok(()));
        });
        assert!(event.wait().is_ok());
        assert!(event.is_complete());
        handle.join().unwrap();
    }

    #[test]
    fn test_failure_is_shared() {
        let event = Event::pending();
        event.signal(Err(Error::Internal("boom".into())));
        // Second signal is ignored
        event.signal(Ok(()));
        assert!(event.wait().is_err());
        assert!(event.clone().wait().is_err());
    }

    #[test]
    fn test_join() {
        let a = Event::pending();
        let b = Event::completed();
        let joined = Event::join(vec![a.clone(), b]);
        assert!(!joined.is_complete());
        a.signal(Ok(()));
        assert!(joined.is_complete());
        assert!(joined.wait().is_ok());

        let failed = Event::join(vec![Event::completed(), Event::failed(Error::Internal("x".into()))]);
        assert!(failed.wait().is_err());
    }
}
