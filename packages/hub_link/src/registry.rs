//! Per-channel listener lists with snapshot dispatch and fault isolation.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::warn;

/// Callback invoked with a borrowed payload.
pub type Listener<P> = Arc<dyn Fn(&P) + Send + Sync>;

struct Slot<P> {
    id: u64,
    listener: Listener<P>,
}

struct RegistryInner<C, P> {
    next_id: u64,
    channels: HashMap<C, Vec<Slot<P>>>,
}

/// Ordered listener lists keyed by channel.
///
/// Cloning yields another handle to the same lists.
pub struct SubscriberRegistry<C, P> {
    inner: Arc<Mutex<RegistryInner<C, P>>>,
}

impl<C, P> Clone for SubscriberRegistry<C, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C, P> Default for SubscriberRegistry<C, P>
where
    C: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    P: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<C, P> SubscriberRegistry<C, P>
where
    C: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    P: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                next_id: 1,
                channels: HashMap::new(),
            })),
        }
    }

    /// Append a listener to `channel`; the returned handle removes exactly it.
    pub fn add<F>(&self, channel: C, listener: F) -> Subscription
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.channels.entry(channel.clone()).or_default().push(Slot {
                id,
                listener: Arc::new(listener),
            });
            id
        };

        let weak: Weak<Mutex<RegistryInner<C, P>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = lock(&inner);
                if let Some(slots) = inner.channels.get_mut(&channel) {
                    slots.retain(|slot| slot.id != id);
                    if slots.is_empty() {
                        inner.channels.remove(&channel);
                    }
                }
            }
        })
    }

    /// Deliver `payload` to every listener registered on `channel` when dispatch starts.
    ///
    /// Listeners run outside the lock, in registration order. A panicking
    /// listener is logged and skipped. Returns how many listeners completed.
    pub fn dispatch(&self, channel: &C, payload: &P) -> usize {
        let snapshot: Vec<Listener<P>> = {
            let inner = lock(&self.inner);
            match inner.channels.get(channel) {
                Some(slots) => slots.iter().map(|s| s.listener.clone()).collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    warn!(
                        channel = ?channel,
                        reason = panic_message(&*panic),
                        "listener panicked during dispatch"
                    );
                }
            }
        }
        delivered
    }

    pub fn listener_count(&self, channel: &C) -> usize {
        lock(&self.inner)
            .channels
            .get(channel)
            .map_or(0, |slots| slots.len())
    }

    pub fn clear(&self) {
        lock(&self.inner).channels.clear();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Handle that removes one listener from one channel.
///
/// Removal is explicit: dropping a `Subscription` leaves the listener
/// registered. `unsubscribe` is idempotent.
pub struct Subscription {
    remove: Box<dyn Fn() + Send + Sync>,
    done: AtomicBool,
}

impl Subscription {
    pub(crate) fn new<F>(remove: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            remove: Box::new(remove),
            done: AtomicBool::new(false),
        }
    }

    pub fn unsubscribe(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.remove)();
        }
    }

    pub fn is_active(&self) -> bool {
        !self.done.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Arc<StdMutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&u32) + Send + Sync>) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |name: &str| {
            let log = log2.clone();
            let name = name.to_string();
            Box::new(move |v: &u32| log.lock().unwrap().push(format!("{name}:{v}")))
                as Box<dyn Fn(&u32) + Send + Sync>
        };
        (log, make)
    }

    #[test]
    fn delivers_in_registration_order() {
        let reg: SubscriberRegistry<&'static str, u32> = SubscriberRegistry::new();
        let (log, make) = recorder();
        let _a = reg.add("msg", make("a"));
        let _b = reg.add("msg", make("b"));
        let _c = reg.add("other", make("c"));

        assert_eq!(reg.dispatch(&"msg", &7), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:7", "b:7"]);
    }

    #[test]
    fn unsubscribe_removes_only_own_listener() {
        let reg: SubscriberRegistry<&'static str, u32> = SubscriberRegistry::new();
        let (log, make) = recorder();
        let a = reg.add("msg", make("a"));
        let _b = reg.add("msg", make("b"));

        a.unsubscribe();
        a.unsubscribe();
        assert!(!a.is_active());

        reg.dispatch(&"msg", &1);
        assert_eq!(*log.lock().unwrap(), vec!["b:1"]);
        assert_eq!(reg.listener_count(&"msg"), 1);
    }

    #[test]
    fn panicking_listener_does_not_starve_siblings() {
        let reg: SubscriberRegistry<&'static str, u32> = SubscriberRegistry::new();
        let (log, make) = recorder();
        let _bad = reg.add("msg", |_: &u32| panic!("listener bug"));
        let _good = reg.add("msg", make("good"));

        assert_eq!(reg.dispatch(&"msg", &3), 1);
        assert_eq!(*log.lock().unwrap(), vec!["good:3"]);
    }

    #[test]
    fn self_removal_mid_dispatch_keeps_snapshot() {
        let reg: SubscriberRegistry<&'static str, u32> = SubscriberRegistry::new();
        let (log, make) = recorder();

        let slot: Arc<StdMutex<Option<Subscription>>> = Arc::new(StdMutex::new(None));
        let slot2 = slot.clone();
        let first = reg.add("msg", move |_: &u32| {
            if let Some(sub) = slot2.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(first);
        let _second = reg.add("msg", make("second"));

        assert_eq!(reg.dispatch(&"msg", &1), 2);
        assert_eq!(reg.dispatch(&"msg", &2), 1);
        assert_eq!(*log.lock().unwrap(), vec!["second:1", "second:2"]);
    }

    #[test]
    fn subscription_outliving_registry_is_harmless() {
        let reg: SubscriberRegistry<&'static str, u32> = SubscriberRegistry::new();
        let sub = reg.add("msg", |_: &u32| {});
        drop(reg);
        sub.unsubscribe();
    }

    #[test]
    fn dispatch_to_empty_channel() {
        let reg: SubscriberRegistry<&'static str, u32> = SubscriberRegistry::new();
        assert_eq!(reg.dispatch(&"nobody", &0), 0);
    }
}
