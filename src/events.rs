//! publish/subscribe plumbing between the engine and its collaborators
use {
    hashbrown::HashMap,
    serde_json::Value,
    std::{
        collections::VecDeque,
        sync::{
            Arc, Mutex, Weak,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
        thread::ThreadId,
        time::{SystemTime, UNIX_EPOCH},
    },
    tracing::{debug, warn},
};

/// maximum recursion depth for publish() per thread
const MAX_PUBLISH_DEPTH: usize = 10;

/// how many events the history ring keeps
const MAX_HISTORY: usize = 1000;

/// canonical event names used by the core
///
/// subscriptions stay stringly typed so wildcard patterns work; this enum
/// exists so core call sites get compile-time coverage of the names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RssUpdated,
    RssFailed,
    ImageReady,
    ImageFailed,
    SettingsChanged,
    MonitorsChanged,
}

impl EventKind {
    /// the wire name of this event
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RssUpdated => "rss.updated",
            EventKind::RssFailed => "rss.failed",
            EventKind::ImageReady => "image.ready",
            EventKind::ImageFailed => "image.failed",
            EventKind::SettingsChanged => "settings.changed",
            EventKind::MonitorsChanged => "monitors.changed",
        }
    }
}

/// a published event
#[derive(Debug, Clone)]
pub struct Event {
    /// the event name, e.g. `rss.updated`
    pub event_type: String,

    /// structured payload
    pub payload: Value,

    /// unix time of publication
    pub timestamp: f64,

    handled: Arc<AtomicBool>,
}

impl Event {
    fn new(event_type: &str, payload: Value) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            event_type: event_type.to_string(),
            payload,
            timestamp,
            handled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// stop delivery to lower-priority subscribers
    pub fn mark_handled(&self) {
        self.handled.store(true, Ordering::SeqCst);
    }

    /// whether a subscriber marked this event handled
    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }
}

/// a history entry; payloads are dropped when redaction is on
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// the event name
    pub event_type: String,

    /// payload, unless redacted
    pub payload: Option<Value>,

    /// unix time of publication
    pub timestamp: f64,
}

type Callback = Box<dyn Fn(&Event) + Send + Sync>;
type Filter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

struct Subscription {
    id: u64,
    pattern: String,
    priority: i32,
    callback: Callback,
    filter: Option<Filter>,
    active: Arc<AtomicBool>,
}

impl Subscription {
    fn invoke(&self, event: &Event) {
        if let Some(filter) = &self.filter
            && !filter(event)
        {
            return;
        }
        (self.callback)(event);
    }
}

/// pattern match: exact name, `*`, or a `prefix.*` wildcard
fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type == prefix || event_type.starts_with(&format!("{prefix}."));
    }
    pattern == event_type
}

#[derive(Default)]
struct BusState {
    subscriptions: Vec<Arc<Subscription>>,
    depth: HashMap<ThreadId, usize>,
}

/// priority pub/sub bus with wildcard subscriptions and bounded history
///
/// subscribers with higher priority run first; priority 0 runs after every
/// non-zero priority. delivery stops once a subscriber marks the event
/// handled. callbacks run without the bus lock held.
pub struct EventBus {
    state: Mutex<BusState>,
    history: Mutex<VecDeque<EventRecord>>,
    history_enabled: AtomicBool,
    redact_payloads: AtomicBool,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// make a new bus with history enabled
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY)),
            history_enabled: AtomicBool::new(true),
            redact_payloads: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// subscribe to an event pattern
    ///
    /// # Arguments
    ///
    /// * `pattern` - exact event name, `*`, or `prefix.*`
    /// * `priority` - higher runs earlier; 0 runs last
    /// * `callback` - invoked for each matching event
    ///
    /// # Returns
    ///
    /// a subscription id for [`EventBus::unsubscribe`]
    pub fn subscribe<F>(&self, pattern: &str, priority: i32, callback: F) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_filtered(pattern, priority, callback, None::<fn(&Event) -> bool>)
    }

    /// subscribe with an additional filter predicate
    pub fn subscribe_filtered<F, P>(
        &self,
        pattern: &str,
        priority: i32,
        callback: F,
        filter: Option<P>,
    ) -> u64
    where
        F: Fn(&Event) + Send + Sync + 'static,
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription {
            id,
            pattern: pattern.to_string(),
            priority,
            callback: Box::new(callback),
            filter: filter.map(|f| Box::new(f) as Filter),
            active: Arc::new(AtomicBool::new(true)),
        });

        let mut state = self.state.lock().expect("event bus lock poisoned");
        state.subscriptions.push(sub);
        // higher priority first, priority 0 after all non-zero entries
        state
            .subscriptions
            .sort_by_key(|s| (s.priority == 0, -(s.priority as i64)));
        debug!("new subscription {} for {} (priority={})", id, pattern, priority);
        id
    }

    /// remove a subscription
    pub fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock().expect("event bus lock poisoned");
        let before = state.subscriptions.len();
        state.subscriptions.retain(|s| {
            if s.id == id {
                s.active.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        if state.subscriptions.len() == before {
            warn!("unsubscribe called with unknown id: {}", id);
        }
    }

    /// publish an event to all matching subscribers
    ///
    /// subscriber callbacks run outside the bus lock, in priority order,
    /// and stop once one marks the event handled. recursive publishes from
    /// inside a callback are bounded at depth 10 per thread.
    pub fn publish(&self, event_type: &str, payload: Value) -> Event {
        let event = Event::new(event_type, payload);
        let thread = std::thread::current().id();

        let matching: Vec<Arc<Subscription>> = {
            let mut state = self.state.lock().expect("event bus lock poisoned");
            let depth = state.depth.get(&thread).copied().unwrap_or(0);
            if depth >= MAX_PUBLISH_DEPTH {
                warn!(
                    "publish recursion limit ({}) reached for {}, dropping event",
                    MAX_PUBLISH_DEPTH, event_type
                );
                return event;
            }
            state.depth.insert(thread, depth + 1);
            state
                .subscriptions
                .iter()
                .filter(|s| pattern_matches(&s.pattern, event_type))
                .cloned()
                .collect()
        };

        for sub in &matching {
            if event.is_handled() {
                break;
            }
            if !sub.active.load(Ordering::SeqCst) {
                continue;
            }
            sub.invoke(&event);
        }

        {
            let mut state = self.state.lock().expect("event bus lock poisoned");
            match state.depth.get(&thread).copied().unwrap_or(1) {
                1 => {
                    state.depth.remove(&thread);
                }
                d => {
                    state.depth.insert(thread, d - 1);
                }
            }
        }

        self.record(&event);
        event
    }

    fn record(&self, event: &Event) {
        if !self.history_enabled.load(Ordering::Relaxed) {
            return;
        }
        let payload = if self.redact_payloads.load(Ordering::Relaxed) {
            None
        } else {
            Some(event.payload.clone())
        };
        let mut history = self.history.lock().expect("event history lock poisoned");
        if history.len() == MAX_HISTORY {
            history.pop_front();
        }
        history.push_back(EventRecord {
            event_type: event.event_type.clone(),
            payload,
            timestamp: event.timestamp,
        });
    }

    /// get up to `limit` most recent history entries (oldest first)
    pub fn history(&self, limit: usize) -> Vec<EventRecord> {
        let history = self.history.lock().expect("event history lock poisoned");
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// enable or disable history storage
    pub fn set_history_enabled(&self, enabled: bool) {
        self.history_enabled.store(enabled, Ordering::Relaxed);
    }

    /// enable or disable payload redaction in history
    pub fn set_redact_payloads(&self, redact: bool) {
        self.redact_payloads.store(redact, Ordering::Relaxed);
    }

    /// total active subscriptions
    pub fn subscription_count(&self) -> usize {
        self.state.lock().expect("event bus lock poisoned").subscriptions.len()
    }

    /// drop every subscription and the history
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("event bus lock poisoned");
        for sub in &state.subscriptions {
            sub.active.store(false, Ordering::SeqCst);
        }
        state.subscriptions.clear();
        drop(state);
        self.history.lock().expect("event history lock poisoned").clear();
    }
}

/// subscription guard that unsubscribes when dropped
pub struct ScopedSubscription {
    bus: Weak<EventBus>,
    id: Option<u64>,
}

impl ScopedSubscription {
    /// subscribe on `bus` and tie the subscription to the guard's lifetime
    pub fn new<F>(bus: &Arc<EventBus>, pattern: &str, priority: i32, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = bus.subscribe(pattern, priority, callback);
        Self {
            bus: Arc::downgrade(bus),
            id: Some(id),
        }
    }

    /// the underlying subscription id while active
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    /// unsubscribe before the guard is dropped
    pub fn unsubscribe(&mut self) {
        if let Some(id) = self.id.take()
            && let Some(bus) = self.bus.upgrade()
        {
            bus.unsubscribe(id);
        }
    }
}

impl Drop for ScopedSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
