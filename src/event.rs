use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// A one-shot trigger used for metadata readiness and copy completion.
///
/// `Event::NO_EVENT` (the default) has always triggered.  Waiter callbacks
/// added before the trigger run on the triggering thread; callbacks added
/// after run immediately.
#[derive(Clone, Default)]
pub struct Event {
    inner: Option<Arc<EventInner>>,
}

struct EventInner {
    triggered: AtomicBool,
    waiters: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    cvar: Condvar,
}

impl Event {
    pub const NO_EVENT: Event = Event { inner: None };

    pub fn new() -> Event {
        Event {
            inner: Some(Arc::new(EventInner {
                triggered: AtomicBool::new(false),
                waiters: Mutex::new(Vec::new()),
                cvar: Condvar::new(),
            })),
        }
    }

    pub fn has_triggered(&self) -> bool {
        match &self.inner {
            None => true,
            Some(inner) => inner.triggered.load(Ordering::Acquire),
        }
    }

    pub fn trigger(&self) {
        let inner = self.inner.as_ref().expect("cannot trigger NO_EVENT");
        let waiters = {
            let mut waiters = inner.waiters.lock();
            inner.triggered.store(true, Ordering::Release);
            inner.cvar.notify_all();
            std::mem::take(&mut *waiters)
        };
        for w in waiters {
            w();
        }
    }

    /// Runs `f` once the event triggers (immediately if it already has).
    pub(crate) fn add_waiter<F: FnOnce() + Send + 'static>(&self, f: F) {
        match &self.inner {
            None => f(),
            Some(inner) => {
                {
                    let mut waiters = inner.waiters.lock();
                    if !inner.triggered.load(Ordering::Acquire) {
                        waiters.push(Box::new(f));
                        return;
                    }
                }
                f();
            }
        }
    }

    /// Blocks the calling thread until the event triggers.
    pub fn wait(&self) {
        if let Some(inner) = &self.inner {
            let mut waiters = inner.waiters.lock();
            while !inner.triggered.load(Ordering::Acquire) {
                inner.cvar.wait(&mut waiters);
            }
        }
    }

    /// An event that triggers once every input event has.  Already-triggered
    /// inputs are skipped; with none left the merged event has already
    /// triggered.
    pub fn merge(events: impl IntoIterator<Item = Event>) -> Event {
        let pending: Vec<Event> = events.into_iter().filter(|e| !e.has_triggered()).collect();
        if pending.is_empty() {
            return Event::NO_EVENT;
        }
        let merged = Event::new();
        let count = Arc::new(AtomicUsize::new(pending.len()));
        for e in pending {
            let merged = merged.clone();
            let count = count.clone();
            e.add_waiter(move || {
                if count.fetch_sub(1, Ordering::AcqRel) == 1 {
                    merged.trigger();
                }
            });
        }
        merged
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            None => write!(f, "Event(NO_EVENT)"),
            Some(inner) => write!(f, "Event(triggered: {})", inner.triggered.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_event_is_triggered() {
        assert!(Event::NO_EVENT.has_triggered());
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        Event::NO_EVENT.add_waiter(move || ran2.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn waiters_fire_once_on_trigger() {
        let e = Event::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            e.add_waiter(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        e.trigger();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        // late waiter runs immediately
        let hits2 = hits.clone();
        e.add_waiter(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn merge_waits_for_all() {
        let a = Event::new();
        let b = Event::new();
        let m = Event::merge([a.clone(), b.clone(), Event::NO_EVENT]);
        assert!(!m.has_triggered());
        a.trigger();
        assert!(!m.has_triggered());
        b.trigger();
        assert!(m.has_triggered());
    }
}
