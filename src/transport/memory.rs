//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the transport
//! SPI. It is intended primarily for testing, local execution, and as a
//! reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Queues are point-to-point: each message is handed to exactly one of the
//!   consumers competing on the queue. Messages sent before any consumer
//!   exists are retained until one arrives.
//! - Topics are publish/subscribe: each consumer attached at send time gets
//!   its own copy. Nothing is retained for late subscribers.
//! - Per-destination FIFO holds for messages from a single producer.
//! - Closing a connection closes its sessions; closed sessions reject every
//!   operation with [`TransportError::SessionClosed`].
//! - The broker forgets a queue once no producer or consumer holds it and
//!   nothing is waiting in it, and a topic once its last subscriber is gone.
//!
//! ## Fault simulation
//!
//! [`MemoryBroker`] can be made unreachable, can discard sends, and can push
//! faults to the exception listeners of its live connections. No other
//! broker failure modes are emulated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;

use crate::{
    // ---
    log_debug,
    log_info,
    BrokerConfig,
    ConnectionFactory,
    Credentials,
    Destination,
    DestinationKind,
    ExceptionListener,
    Message,
    SessionId,
    TransportConnection,
    TransportConsumer,
    TransportDriver,
    TransportError,
    TransportProducer,
    TransportResult,
    TransportSession,
};

/// URI scheme served by [`MemoryDriver`].
pub const MEMORY_SCHEME: &str = "memory";

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl MemoryQueue {
    fn new() -> Arc<Self> {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    /// True when no message is waiting. A receive in progress counts as busy.
    fn is_drained(&self) -> bool {
        self.rx.try_lock().map(|rx| rx.is_empty()).unwrap_or(false)
    }
}

struct QueueEntry {
    queue: Arc<MemoryQueue>,
    leases: usize,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<Arc<str>, QueueEntry>,
    topics: HashMap<Arc<str>, Vec<Subscriber>>,
    connections: Vec<Weak<ConnectionState>>,
    next_subscriber: u64,
}

/// In-process message broker.
///
/// All connections opened through factories of the same broker share its
/// queues and topics, exactly as clients of a real broker would.
///
/// # Example
///
/// ```
/// use mom_provider::MemoryBroker;
///
/// let broker = MemoryBroker::builder("local")
///     .user("app", "secret")
///     .allow_anonymous(false)
///     .build();
/// assert_eq!(broker.address(), "memory://local");
/// ```
pub struct MemoryBroker {
    // ---
    name: String,
    users: HashMap<String, String>,
    allow_anonymous: bool,
    reachable: AtomicBool,
    discarding: AtomicBool,
    next_session: AtomicU64,
    state: Mutex<BrokerState>,
}

/// Builder for [`MemoryBroker`].
pub struct MemoryBrokerBuilder {
    name: String,
    users: HashMap<String, String>,
    allow_anonymous: bool,
}

impl MemoryBrokerBuilder {
    /// Accept the given user on the authenticated path.
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }

    /// Whether anonymous connections are accepted. Default: true.
    pub fn allow_anonymous(mut self, allow: bool) -> Self {
        self.allow_anonymous = allow;
        self
    }

    pub fn build(self) -> Arc<MemoryBroker> {
        // ---
        Arc::new(MemoryBroker {
            name: self.name,
            users: self.users,
            allow_anonymous: self.allow_anonymous,
            reachable: AtomicBool::new(true),
            discarding: AtomicBool::new(false),
            next_session: AtomicU64::new(1),
            state: Mutex::new(BrokerState::default()),
        })
    }
}

impl MemoryBroker {
    /// Create an open broker that accepts anonymous connections.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::builder(name).build()
    }

    pub fn builder(name: impl Into<String>) -> MemoryBrokerBuilder {
        // ---
        MemoryBrokerBuilder {
            name: name.into(),
            users: HashMap::new(),
            allow_anonymous: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host address that selects this broker (`memory://<name>`).
    pub fn address(&self) -> String {
        format!("{MEMORY_SCHEME}://{}", self.name)
    }

    /// Simulate the broker going down (or coming back).
    ///
    /// While unreachable, new connections fail with
    /// [`TransportError::Network`]. Existing connections are unaffected.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Silently drop every message sent while enabled.
    pub fn set_discarding(&self, discarding: bool) {
        self.discarding.store(discarding, Ordering::SeqCst);
    }

    /// Number of open connections.
    pub fn live_connections(&self) -> usize {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.connections.retain(|weak| weak.strong_count() > 0);
        state
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|conn| !conn.is_closed())
            .count()
    }

    /// Deliver `error` to the exception listener of every open connection.
    ///
    /// Listeners run on the calling thread, standing in for the transport's
    /// dispatch thread. Returns the number of listeners notified.
    pub fn inject_fault(&self, error: TransportError) -> usize {
        // ---
        let connections: Vec<Arc<ConnectionState>> = {
            let state = lock_ignore_poison(&self.state);
            state.connections.iter().filter_map(Weak::upgrade).collect()
        };

        let mut notified = 0;
        for conn in connections.iter().filter(|c| !c.is_closed()) {
            let listener = lock_ignore_poison(&conn.listener).clone();
            if let Some(listener) = listener {
                listener.on_exception(error.clone());
                notified += 1;
            }
        }

        log_info!("{}: injected fault into {notified} connection(s)", self.name);
        notified
    }

    fn connect(
        self: &Arc<Self>,
        principal: Option<String>,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        // ---
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Network(format!(
                "{} is not reachable",
                self.address()
            )));
        }

        let conn = Arc::new(ConnectionState {
            principal,
            closed: AtomicBool::new(false),
            listener: Mutex::new(None),
        });

        {
            let mut state = lock_ignore_poison(&self.state);
            state.connections.retain(|weak| weak.strong_count() > 0);
            state.connections.push(Arc::downgrade(&conn));
        }

        log_debug!(
            "{}: accepted connection for {}",
            self.name,
            conn.principal.as_deref().unwrap_or("anonymous")
        );

        Ok(Box::new(MemoryConnection {
            broker: Arc::clone(self),
            state: conn,
        }))
    }

    /// Forget `conn` along with any connection dropped without closing.
    fn forget(&self, conn: &Arc<ConnectionState>) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state
            .connections
            .retain(|weak| weak.strong_count() > 0 && weak.as_ptr() != Arc::as_ptr(conn));
    }

    fn lease_queue(self: &Arc<Self>, name: &str) -> QueueLease {
        // ---
        let name: Arc<str> = Arc::from(name);
        let mut state = lock_ignore_poison(&self.state);
        let entry = state
            .queues
            .entry(Arc::clone(&name))
            .or_insert_with(|| QueueEntry {
                queue: MemoryQueue::new(),
                leases: 0,
            });
        entry.leases += 1;

        QueueLease {
            broker: Arc::clone(self),
            name,
            queue: Arc::clone(&entry.queue),
        }
    }

    fn release_queue(&self, name: &str) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let forget = match state.queues.get_mut(name) {
            Some(entry) => {
                entry.leases = entry.leases.saturating_sub(1);
                entry.leases == 0 && entry.queue.is_drained()
            }
            None => false,
        };
        if forget {
            state.queues.remove(name);
            log_debug!("{}: forgot idle queue {name}", self.name);
        }
    }

    fn subscribe(self: &Arc<Self>, topic: &str) -> TopicSubscription {
        // ---
        let name: Arc<str> = Arc::from(topic);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = lock_ignore_poison(&self.state);
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state
            .topics
            .entry(Arc::clone(&name))
            .or_default()
            .push(Subscriber { id, tx });

        TopicSubscription {
            broker: Arc::clone(self),
            name,
            id,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn unsubscribe(&self, topic: &str, id: u64) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if let Some(subscribers) = state.topics.get_mut(topic) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                state.topics.remove(topic);
            }
        }
    }

    fn publish(&self, target: &Outbox, message: Message) {
        // ---
        if self.discarding.load(Ordering::SeqCst) {
            log_debug!("{}: discarding message for {}", self.name, message.destination);
            return;
        }

        match target {
            Outbox::Queue(lease) => {
                // The entry keeps both ends of the channel, so the send cannot fail.
                let _ = lease.queue.tx.send(message);
            }
            Outbox::Topic(topic) => {
                let mut state = lock_ignore_poison(&self.state);
                if let Some(subscribers) = state.topics.get_mut(topic) {
                    subscribers.retain(|s| s.tx.send(message.clone()).is_ok());
                    if subscribers.is_empty() {
                        state.topics.remove(topic);
                    }
                }
            }
        }
    }
}

/// A producer's or consumer's hold on a queue.
struct QueueLease {
    broker: Arc<MemoryBroker>,
    name: Arc<str>,
    queue: Arc<MemoryQueue>,
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        self.broker.release_queue(&self.name);
    }
}

/// One consumer's private feed from a topic.
struct TopicSubscription {
    broker: Arc<MemoryBroker>,
    name: Arc<str>,
    id: u64,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.broker.unsubscribe(&self.name, self.id);
    }
}

fn validate_name(name: &str) -> TransportResult<()> {
    // ---
    let invalid = name.is_empty()
        || name
            .chars()
            .any(|c| c.is_whitespace() || c == '*' || c == '>');

    if invalid {
        Err(TransportError::InvalidDestination(name.to_string()))
    } else {
        Ok(())
    }
}

//
// Connections and sessions
//

struct ConnectionState {
    principal: Option<String>,
    closed: AtomicBool,
    listener: Mutex<Option<Arc<dyn ExceptionListener>>>,
}

impl ConnectionState {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct MemoryConnection {
    broker: Arc<MemoryBroker>,
    state: Arc<ConnectionState>,
}

#[async_trait::async_trait]
impl TransportConnection for MemoryConnection {
    // ---
    fn principal(&self) -> Option<&str> {
        self.state.principal.as_deref()
    }

    fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>) {
        *lock_ignore_poison(&self.state.listener) = Some(listener);
    }

    async fn create_session(&self) -> TransportResult<Box<dyn TransportSession>> {
        // ---
        if self.state.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let id = SessionId(self.broker.next_session.fetch_add(1, Ordering::Relaxed));

        Ok(Box::new(MemorySession {
            shared: Arc::new(SessionState {
                id,
                closed: AtomicBool::new(false),
                connection: Arc::clone(&self.state),
            }),
            broker: Arc::clone(&self.broker),
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        // ---
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        lock_ignore_poison(&self.state.listener).take();
        self.broker.forget(&self.state);
        Ok(())
    }
}

struct SessionState {
    id: SessionId,
    closed: AtomicBool,
    connection: Arc<ConnectionState>,
}

impl SessionState {
    fn ensure_open(&self) -> TransportResult<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) || self.connection.is_closed() {
            Err(TransportError::SessionClosed)
        } else {
            Ok(())
        }
    }
}

struct MemorySession {
    shared: Arc<SessionState>,
    broker: Arc<MemoryBroker>,
}

impl MemorySession {
    fn resolve(&self, kind: DestinationKind, name: &str) -> TransportResult<Destination> {
        // ---
        self.shared.ensure_open()?;
        validate_name(name)?;
        Ok(Destination::new(kind, name, self.shared.id))
    }
}

#[async_trait::async_trait]
impl TransportSession for MemorySession {
    // ---
    fn id(&self) -> SessionId {
        self.shared.id
    }

    fn create_queue(&self, name: &str) -> TransportResult<Destination> {
        self.resolve(DestinationKind::Queue, name)
    }

    fn create_topic(&self, name: &str) -> TransportResult<Destination> {
        self.resolve(DestinationKind::Topic, name)
    }

    async fn create_producer(
        &self,
        destination: &Destination,
    ) -> TransportResult<Box<dyn TransportProducer>> {
        // ---
        self.shared.ensure_open()?;

        let target = match destination.kind() {
            DestinationKind::Queue => Outbox::Queue(self.broker.lease_queue(destination.name())),
            DestinationKind::Topic => Outbox::Topic(Arc::from(destination.name())),
        };

        Ok(Box::new(MemoryProducer {
            destination: destination.clone(),
            session: Arc::clone(&self.shared),
            broker: Arc::clone(&self.broker),
            target,
        }))
    }

    async fn create_consumer(
        &self,
        destination: &Destination,
    ) -> TransportResult<Box<dyn TransportConsumer>> {
        // ---
        self.shared.ensure_open()?;

        let source = match destination.kind() {
            DestinationKind::Queue => Inbox::Queue(self.broker.lease_queue(destination.name())),
            DestinationKind::Topic => Inbox::Topic(self.broker.subscribe(destination.name())),
        };

        Ok(Box::new(MemoryConsumer {
            destination: destination.clone(),
            session: Arc::clone(&self.shared),
            source,
        }))
    }

    async fn close(&self) -> TransportResult<()> {
        // ---
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::SessionClosed);
        }
        Ok(())
    }
}

//
// Producers and consumers
//

enum Outbox {
    Queue(QueueLease),
    Topic(Arc<str>),
}

struct MemoryProducer {
    destination: Destination,
    session: Arc<SessionState>,
    broker: Arc<MemoryBroker>,
    target: Outbox,
}

#[async_trait::async_trait]
impl TransportProducer for MemoryProducer {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        // ---
        self.session.ensure_open()?;
        self.broker.publish(&self.target, message);
        Ok(())
    }
}

enum Inbox {
    /// Shared with every other consumer of the queue.
    Queue(QueueLease),
    /// Private subscription.
    Topic(TopicSubscription),
}

struct MemoryConsumer {
    destination: Destination,
    session: Arc<SessionState>,
    source: Inbox,
}

#[async_trait::async_trait]
impl TransportConsumer for MemoryConsumer {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn receive(&self, timeout: Duration) -> TransportResult<Option<Message>> {
        // ---
        self.session.ensure_open()?;

        let next = async {
            match &self.source {
                Inbox::Queue(lease) => lease.queue.rx.lock().await.recv().await,
                Inbox::Topic(subscription) => subscription.rx.lock().await.recv().await,
            }
        };

        match time::timeout(timeout, next).await {
            Ok(Some(message)) => Ok(Some(message)),
            // Sender side gone: the broker dropped this subscription.
            Ok(None) => Err(TransportError::SessionClosed),
            Err(_elapsed) => Ok(None),
        }
    }
}

//
// Driver and factory
//

/// Transport driver for `memory://<name>` addresses.
///
/// Serves every broker registered with it, selected by name.
pub struct MemoryDriver {
    brokers: HashMap<String, Arc<MemoryBroker>>,
}

impl MemoryDriver {
    /// Create a driver serving the given brokers.
    pub fn new<I>(brokers: I) -> Arc<Self>
    where
        I: IntoIterator<Item = Arc<MemoryBroker>>,
    {
        // ---
        let brokers = brokers
            .into_iter()
            .map(|broker| (broker.name().to_string(), broker))
            .collect();
        Arc::new(Self { brokers })
    }
}

impl TransportDriver for MemoryDriver {
    fn scheme(&self) -> &str {
        MEMORY_SCHEME
    }

    fn create_factory(&self, config: &BrokerConfig) -> TransportResult<Arc<dyn ConnectionFactory>> {
        // ---
        let host = config
            .host()
            .ok_or_else(|| TransportError::FactoryInit("no host address configured".into()))?;

        let name = host
            .strip_prefix(MEMORY_SCHEME)
            .and_then(|rest| rest.strip_prefix("://"))
            .ok_or_else(|| TransportError::FactoryInit(format!("not a memory address: {host}")))?;

        let broker = self.brokers.get(name).cloned().ok_or_else(|| {
            TransportError::FactoryInit(format!("unknown memory broker '{name}'"))
        })?;

        log_debug!("created connection factory for {host}");

        Ok(Arc::new(MemoryConnectionFactory { broker }))
    }
}

struct MemoryConnectionFactory {
    broker: Arc<MemoryBroker>,
}

#[async_trait::async_trait]
impl ConnectionFactory for MemoryConnectionFactory {
    async fn create_connection(&self) -> TransportResult<Box<dyn TransportConnection>> {
        // ---
        if !self.broker.allow_anonymous {
            return Err(TransportError::Authentication("anonymous access".into()));
        }
        self.broker.connect(None)
    }

    async fn create_connection_with(
        &self,
        credentials: &Credentials,
    ) -> TransportResult<Box<dyn TransportConnection>> {
        // ---
        match self.broker.users.get(&credentials.username) {
            Some(password) if *password == credentials.password => {
                self.broker.connect(Some(credentials.username.clone()))
            }
            _ => Err(TransportError::Authentication(format!(
                "user '{}'",
                credentials.username
            ))),
        }
    }
}
