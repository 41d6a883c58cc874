//! Internal event bus for the compressarr daemon
//!
//! Typed, in-process publish/subscribe connecting the plugin registry, the
//! library manager, and the job scheduler. Dispatch is synchronous: every
//! handler of an event runs to completion before the next event is delivered,
//! which makes the bus the mutual-exclusion protocol for the shared job and
//! media tables.

use crate::actions::ActionRegistration;
use crate::scheduler::{JobConfig, MediaRef};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Discriminant used to route events to their subscriber lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    LaunchComplete,
    Shutdown,
    RegisterAction,
    RegisterJob,
    UnregisterJob,
    PublishJob,
    RegisterMedia,
    UpdateMedia,
    UnregisterMedia,
}

/// An event published on the internal bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// Startup finished: plugins initialized, watchers running.
    LaunchComplete,
    /// The process is going down; subscribers should release work.
    Shutdown,
    /// A plugin contributed an action constructor.
    RegisterAction(ActionRegistration),
    /// A job was admitted from pending into active.
    RegisterJob {
        source: PathBuf,
        config: JobConfig,
    },
    /// An in-flight job must stop (media removed/changed, or teardown).
    UnregisterJob { source: PathBuf },
    /// A job ran its whole pipeline and its artifact is in place.
    PublishJob { source: PathBuf },
    /// A media file appeared under a library root.
    RegisterMedia(MediaRef),
    /// A media file changed under a library root.
    UpdateMedia(MediaRef),
    /// A media file disappeared from a library root.
    UnregisterMedia(MediaRef),
}

impl Event {
    /// The kind used for subscription routing.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::LaunchComplete => EventKind::LaunchComplete,
            Event::Shutdown => EventKind::Shutdown,
            Event::RegisterAction(_) => EventKind::RegisterAction,
            Event::RegisterJob { .. } => EventKind::RegisterJob,
            Event::UnregisterJob { .. } => EventKind::UnregisterJob,
            Event::PublishJob { .. } => EventKind::PublishJob,
            Event::RegisterMedia(_) => EventKind::RegisterMedia,
            Event::UpdateMedia(_) => EventKind::UpdateMedia,
            Event::UnregisterMedia(_) => EventKind::UnregisterMedia,
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Process-local typed publish/subscribe.
///
/// Events are queued and drained by a single dispatcher at a time. A publish
/// issued from inside a handler is appended to the queue and picked up by the
/// active drain loop, so nested publication cannot recurse and publication
/// order is preserved. Handlers must return promptly and push long work onto
/// their own tasks.
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Handler>>>,
    queue: Mutex<VecDeque<Event>>,
    draining: AtomicBool,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Register a handler for one event kind.
    ///
    /// Handlers registered before an event is published observe it; there is
    /// no replay for late subscribers.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("handler table poisoned")
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Publish an event.
    ///
    /// If no dispatch is in progress, this call drains the queue and every
    /// handler runs before it returns. If a dispatch is already running
    /// (including further up this call stack), the event is queued and the
    /// running drain delivers it in order.
    pub fn publish(&self, event: Event) {
        self.queue
            .lock()
            .expect("event queue poisoned")
            .push_back(event);
        self.drain();
    }

    fn drain(&self) {
        while self
            .draining
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_ok()
        {
            loop {
                let event = {
                    let mut queue = self.queue.lock().expect("event queue poisoned");
                    match queue.pop_front() {
                        Some(event) => event,
                        None => break,
                    }
                };

                // Snapshot the subscriber list so handlers may subscribe
                // without holding the table lock across their own call.
                let subscribers: Vec<Handler> = {
                    let handlers = self.handlers.read().expect("handler table poisoned");
                    handlers.get(&event.kind()).cloned().unwrap_or_default()
                };

                for handler in subscribers {
                    handler(&event);
                }
            }

            self.draining.store(false, Ordering::Release);

            // Another thread may have enqueued between our last pop and the
            // flag reset; loop back and try to claim the dispatcher role
            // again rather than strand those events.
            if self.queue.lock().expect("event queue poisoned").is_empty() {
                break;
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn media(root: &str, rel: &str) -> MediaRef {
        MediaRef {
            library_root: PathBuf::from(root),
            relative_path: PathBuf::from(rel),
        }
    }

    #[test]
    fn test_subscribe_and_publish() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = seen.clone();
        bus.subscribe(EventKind::RegisterMedia, move |event| {
            if let Event::RegisterMedia(m) = event {
                seen_clone.lock().unwrap().push(m.relative_path.clone());
            }
        });

        bus.publish(Event::RegisterMedia(media("/lib", "a.mp4")));
        bus.publish(Event::RegisterMedia(media("/lib", "b.mp4")));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[PathBuf::from("a.mp4"), PathBuf::from("b.mp4")]);
    }

    #[test]
    fn test_events_route_by_kind() {
        let bus = EventBus::new();
        let media_count = Arc::new(AtomicUsize::new(0));
        let shutdown_count = Arc::new(AtomicUsize::new(0));

        let m = media_count.clone();
        bus.subscribe(EventKind::RegisterMedia, move |_| {
            m.fetch_add(1, Ordering::SeqCst);
        });
        let s = shutdown_count.clone();
        bus.subscribe(EventKind::Shutdown, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Event::RegisterMedia(media("/lib", "x.mp4")));
        bus.publish(Event::Shutdown);

        assert_eq!(media_count.load(Ordering::SeqCst), 1);
        assert_eq!(shutdown_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_subscriber_gets_no_replay() {
        let bus = EventBus::new();
        bus.publish(Event::LaunchComplete);

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(EventKind::LaunchComplete, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.publish(Event::LaunchComplete);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_publish_preserves_order() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // The RegisterMedia handler publishes UnregisterMedia from inside
        // its own dispatch; the nested event must be delivered after the
        // current one completes, not recursively.
        let bus_clone = bus.clone();
        let order_clone = order.clone();
        bus.subscribe(EventKind::RegisterMedia, move |_| {
            order_clone.lock().unwrap().push("register:start");
            bus_clone.publish(Event::UnregisterMedia(media("/lib", "x.mp4")));
            order_clone.lock().unwrap().push("register:end");
        });

        let order_clone = order.clone();
        bus.subscribe(EventKind::UnregisterMedia, move |_| {
            order_clone.lock().unwrap().push("unregister");
        });

        bus.publish(Event::RegisterMedia(media("/lib", "x.mp4")));

        let order = order.lock().unwrap();
        assert_eq!(
            order.as_slice(),
            &["register:start", "register:end", "unregister"]
        );
    }

    #[test]
    fn test_handlers_never_overlap_across_threads() {
        let bus = Arc::new(EventBus::new());
        let in_handler = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let in_h = in_handler.clone();
        let max = max_seen.clone();
        bus.subscribe(EventKind::PublishJob, move |_| {
            let now = in_h.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_micros(50));
            in_h.fetch_sub(1, Ordering::SeqCst);
        });

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for j in 0..20 {
                        bus.publish(Event::PublishJob {
                            source: PathBuf::from(format!("/lib/{}-{}.mp4", i, j)),
                        });
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1, "dispatch must be serialized");
    }

    #[test]
    fn test_all_subscribers_of_a_kind_run() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let c = count.clone();
            bus.subscribe(EventKind::Shutdown, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish(Event::Shutdown);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
