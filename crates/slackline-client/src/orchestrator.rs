//! Sequences handshake and session establishment per connection and reports
//! every step as a lifecycle event.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use slackline_core::{
    ConnectError, Connection, ConnectionId, ConnectionState, Connections, LifecycleEvent, Logger,
    WriteHandle,
};
use slackline_telemetry::TracingLogger;

use crate::config::ClientConfig;
use crate::dns::NameserverResolver;
use crate::error::ClientError;
use crate::handshake::{Handshake, HandshakeClient};
use crate::observer::{EventHub, LifecycleObserver};
use crate::resolver::{CachingResolver, Resolver};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::session::{Session, SessionFactory, WebSocketSessionFactory};
use crate::slot::Slot;

/// Connects tokens to sessions and reports progress through lifecycle events.
///
/// Cloning is cheap; clones share collaborators, observers and sessions.
#[derive(Clone)]
pub struct ConnectionOrchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    config: RwLock<ClientConfig>,
    scheduler: Mutex<Slot<Scheduler>>,
    resolver: Mutex<Slot<dyn Resolver>>,
    logger: Mutex<Slot<dyn Logger>>,
    handshake: Mutex<Slot<dyn Handshake>>,
    session_factory: Mutex<Slot<dyn SessionFactory>>,
    registry: Arc<Registry>,
}

/// State reachable from spawned connection tasks. Holds no scheduler.
#[derive(Default)]
struct Registry {
    hub: EventHub,
    sessions: DashMap<ConnectionId, Session>,
    states: DashMap<ConnectionId, ConnectionState>,
    cancel: Mutex<CancellationToken>,
}

/// Collaborators bound to one connection attempt when it starts.
#[derive(Clone)]
struct Pipeline {
    scheduler: SchedulerHandle,
    logger: Arc<dyn Logger>,
    handshake: Arc<dyn Handshake>,
    session_factory: Arc<dyn SessionFactory>,
    handshake_timeout: Option<Duration>,
    session_timeout: Option<Duration>,
}

impl ConnectionOrchestrator {
    pub fn new(config: ClientConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    // ── Collaborators ──

    /// The scheduler, started on first access unless one was injected.
    pub fn scheduler(&self) -> Result<Arc<Scheduler>, ClientError> {
        self.shared
            .scheduler
            .lock()
            .get_or_try_init(|| Scheduler::new().map(Arc::new))
    }

    /// Replace the scheduler.
    ///
    /// Refused while the current one is running or still holds connections
    /// queued by [`add_connection`](Self::add_connection), since nothing
    /// would drive those to `connect.after.each` any more.
    pub fn set_scheduler(&self, scheduler: Arc<Scheduler>) -> Result<(), ClientError> {
        let mut slot = self.shared.scheduler.lock();
        if let Some(current) = slot.current() {
            if current.is_running() {
                return Err(ClientError::SchedulerBusy);
            }
            let pending = current.pending();
            if pending > 0 {
                return Err(ClientError::PendingWork(pending));
            }
        }
        slot.inject(scheduler);
        Ok(())
    }

    /// The resolver; defaults to a cached nameserver lookup against
    /// [`dns_server`](Self::dns_server).
    pub fn resolver(&self) -> Arc<dyn Resolver> {
        self.shared.resolver.lock().get_or_init(|| {
            let config = self.shared.config.read();
            let nameserver = NameserverResolver::new(config.dns_server);
            Arc::new(CachingResolver::new(
                Arc::new(nameserver),
                config.resolver_cache_ttl,
            )) as Arc<dyn Resolver>
        })
    }

    pub fn set_resolver(&self, resolver: Arc<dyn Resolver>) {
        self.shared.resolver.lock().inject(resolver);
        self.reset_network_defaults();
    }

    pub fn logger(&self) -> Arc<dyn Logger> {
        self.shared
            .logger
            .lock()
            .get_or_init(|| Arc::new(TracingLogger::new()) as Arc<dyn Logger>)
    }

    pub fn set_logger(&self, logger: Arc<dyn Logger>) {
        self.shared.logger.lock().inject(logger);
    }

    pub fn handshake(&self) -> Result<Arc<dyn Handshake>, ClientError> {
        self.shared.handshake.lock().get_or_try_init(|| {
            let config = self.shared.config.read().clone();
            let client = HandshakeClient::new(
                &config.handshake_url,
                self.resolver(),
                config.connect_timeout,
                config.max_handshake_body,
            )?;
            Ok(Arc::new(client) as Arc<dyn Handshake>)
        })
    }

    pub fn set_handshake(&self, handshake: Arc<dyn Handshake>) {
        self.shared.handshake.lock().inject(handshake);
    }

    pub fn session_factory(&self) -> Arc<dyn SessionFactory> {
        self.shared
            .session_factory
            .lock()
            .get_or_init(|| {
                Arc::new(WebSocketSessionFactory::new(self.resolver())) as Arc<dyn SessionFactory>
            })
    }

    pub fn set_session_factory(&self, factory: Arc<dyn SessionFactory>) {
        self.shared.session_factory.lock().inject(factory);
    }

    pub fn dns_server(&self) -> IpAddr {
        self.shared.config.read().dns_server
    }

    /// Change the nameserver. Default collaborators built on the old one are
    /// rebuilt on next use; injected ones are kept.
    pub fn set_dns_server(&self, server: IpAddr) {
        self.shared.config.write().dns_server = server;
        self.shared.resolver.lock().reset_default();
        self.reset_network_defaults();
    }

    pub fn tick_interval(&self) -> Duration {
        self.shared.config.read().tick_interval
    }

    pub fn set_tick_interval(&self, tick: Duration) {
        self.shared.config.write().tick_interval = tick;
    }

    pub fn config(&self) -> ClientConfig {
        self.shared.config.read().clone()
    }

    fn reset_network_defaults(&self) {
        self.shared.handshake.lock().reset_default();
        self.shared.session_factory.lock().reset_default();
    }

    fn pipeline(&self) -> Result<Pipeline, ClientError> {
        let scheduler = self.scheduler()?.handle();
        let handshake = self.handshake()?;
        let (handshake_timeout, session_timeout) = {
            let config = self.shared.config.read();
            (config.handshake_timeout, config.session_timeout)
        };
        Ok(Pipeline {
            scheduler,
            logger: self.logger(),
            handshake,
            session_factory: self.session_factory(),
            handshake_timeout,
            session_timeout,
        })
    }

    // ── Events ──

    pub fn subscribe(&self, observer: Arc<dyn LifecycleObserver>) {
        self.shared.registry.hub.subscribe(observer);
    }

    // ── Connecting ──

    /// Start connecting one connection.
    ///
    /// Emits `connect.before.each` before returning and registers the
    /// handshake on the scheduler; it makes progress once [`run`](Self::run)
    /// drives the scheduler. Network failures never surface here, only as
    /// `connect.error` followed by `connect.after.each`.
    pub fn add_connection(&self, connection: impl Into<Arc<Connection>>) -> Result<(), ClientError> {
        let pipeline = self.pipeline()?;
        self.start(connection.into(), pipeline);
        Ok(())
    }

    /// Connect every connection and block until the scheduler is idle.
    ///
    /// Emits `connect.before.all`, starts each connection in order, emits
    /// `connect.after.all` with each connection's `write` option, then runs
    /// the scheduler until every handshake has settled and every session
    /// has closed.
    pub fn run(&self, connections: impl Into<Connections>) -> Result<(), ClientError> {
        let connections = connections.into().into_vec();
        let scheduler = self.scheduler()?;
        scheduler.ensure_runnable()?;
        let pipeline = self.pipeline()?;

        let hub = &self.shared.registry.hub;
        hub.install_default_error_handler();
        hub.emit(&LifecycleEvent::BeforeAll {
            connections: connections.clone(),
        });
        for connection in &connections {
            self.start(Arc::clone(connection), pipeline.clone());
        }
        let writes = connections.iter().map(|c| c.write_option()).collect();
        hub.emit(&LifecycleEvent::AfterAll {
            connections,
            writes,
        });

        scheduler.run(self.tick_interval())
    }

    fn start(&self, connection: Arc<Connection>, pipeline: Pipeline) {
        let registry = Arc::clone(&self.shared.registry);
        let _ = registry
            .states
            .insert(connection.id().clone(), ConnectionState::Initiated);
        registry.hub.emit(&LifecycleEvent::BeforeEach {
            connection: Arc::clone(&connection),
        });

        let cancel = registry.cancel.lock().child_token();
        let scheduler = pipeline.scheduler.clone();
        scheduler.spawn(async move {
            registry.connect(connection, pipeline, cancel).await;
        });
    }

    /// Cancel every attempt still in flight and close every session.
    ///
    /// Cancelled attempts report `connect.error` with
    /// [`ConnectError::Cancelled`]. Connections added afterwards start fresh.
    pub fn shutdown(&self) {
        let registry = &self.shared.registry;
        let previous = std::mem::replace(&mut *registry.cancel.lock(), CancellationToken::new());
        previous.cancel();
        for session in registry.sessions.iter() {
            session.close();
        }
        info!(sessions = registry.sessions.len(), "orchestrator shut down");
    }

    // ── Inspection ──

    pub fn state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.shared.registry.states.get(id).map(|s| *s)
    }

    /// Endpoint of the session established for `id`, open or since closed.
    pub fn session_endpoint(&self, id: &ConnectionId) -> Option<String> {
        self.shared
            .registry
            .sessions
            .get(id)
            .map(|s| s.endpoint().to_string())
    }

    pub fn writer(&self, id: &ConnectionId) -> Option<WriteHandle> {
        self.shared.registry.sessions.get(id).map(|s| s.writer())
    }

    /// Ids of sessions that are still open.
    ///
    /// Closed sessions are forgotten, along with the state of every settled
    /// connection that no longer has an open session.
    pub fn active_sessions(&self) -> Vec<ConnectionId> {
        let registry = &self.shared.registry;
        registry.sessions.retain(|_, session| !session.is_closed());
        registry
            .states
            .retain(|id, state| !state.is_terminal() || registry.sessions.contains_key(id));
        registry
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for ConnectionOrchestrator {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl std::fmt::Debug for ConnectionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = &self.shared.registry;
        f.debug_struct("ConnectionOrchestrator")
            .field("config", &*self.shared.config.read())
            .field("hub", &registry.hub)
            .field("sessions", &registry.sessions.len())
            .finish()
    }
}

impl Registry {
    #[instrument(skip_all, fields(connection_id = %connection.id()))]
    async fn connect(
        self: Arc<Self>,
        connection: Arc<Connection>,
        pipeline: Pipeline,
        cancel: CancellationToken,
    ) {
        let id = connection.id().clone();
        match self.establish(&connection, &pipeline, &cancel).await {
            Ok(session) => {
                let writer = session.writer();
                info!(endpoint = session.endpoint(), "session established");
                if let Some(previous) = self.sessions.insert(id, session) {
                    previous.close();
                }
                self.hub.emit(&LifecycleEvent::AfterEach {
                    connection,
                    write: Some(writer),
                });
            }
            Err(error) => {
                warn!(error_kind = error.error_kind(), %error, "connection failed");
                self.hub.emit(&LifecycleEvent::Error {
                    error,
                    connection: Arc::clone(&connection),
                    logger: Arc::clone(&pipeline.logger),
                });
                self.hub.emit(&LifecycleEvent::AfterEach {
                    connection,
                    write: None,
                });
            }
        }
    }

    async fn establish(
        &self,
        connection: &Connection,
        pipeline: &Pipeline,
        cancel: &CancellationToken,
    ) -> Result<Session, ConnectError> {
        let id = connection.id();

        self.advance(id, ConnectionState::HandshakeInFlight);
        let handshake = within(
            pipeline.handshake_timeout,
            "handshake",
            ConnectError::ConnectionAttemptFailed,
            pipeline
                .handshake
                .request_session_endpoint(connection.token(), cancel),
        )
        .await;
        let endpoint = match handshake {
            Ok(result) => result.url,
            Err(error) => {
                self.fail(id, ConnectionState::HandshakeFailed, &error);
                return Err(error);
            }
        };
        self.advance(id, ConnectionState::HandshakeSucceeded);
        debug!(%endpoint, "handshake succeeded");

        let session = within(
            pipeline.session_timeout,
            "session upgrade",
            ConnectError::SessionEstablishmentFailed,
            pipeline.session_factory.create_session(
                &endpoint,
                &pipeline.scheduler,
                Arc::clone(&pipeline.logger),
                cancel,
            ),
        )
        .await;
        match session {
            Ok(session) => {
                self.advance(id, ConnectionState::SessionEstablished);
                Ok(session)
            }
            Err(error) => {
                self.fail(id, ConnectionState::SessionFailed, &error);
                Err(error)
            }
        }
    }

    fn fail(&self, id: &ConnectionId, phase_failure: ConnectionState, error: &ConnectError) {
        let state = match error {
            ConnectError::Cancelled => ConnectionState::Cancelled,
            _ => phase_failure,
        };
        self.advance(id, state);
    }

    fn advance(&self, id: &ConnectionId, next: ConnectionState) {
        let mut state = self
            .states
            .entry(id.clone())
            .or_insert(ConnectionState::Initiated);
        if !state.can_advance_to(next) {
            warn!(connection_id = %id, from = %*state, to = %next, "unexpected state transition");
        }
        *state = next;
    }
}

/// Bound `fut` by `limit`, reporting expiry through `timed_out`.
async fn within<T>(
    limit: Option<Duration>,
    phase: &str,
    timed_out: fn(String) -> ConnectError,
    fut: impl Future<Output = Result<T, ConnectError>>,
) -> Result<T, ConnectError> {
    let Some(limit) = limit else {
        return fut.await;
    };
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(timed_out(format!("{phase} timed out after {limit:?}"))),
    }
}

/// Builder for [`ConnectionOrchestrator`]; anything left unset is defaulted
/// lazily on first use.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: ClientConfig,
    scheduler: Option<Arc<Scheduler>>,
    resolver: Option<Arc<dyn Resolver>>,
    logger: Option<Arc<dyn Logger>>,
    handshake: Option<Arc<dyn Handshake>>,
    session_factory: Option<Arc<dyn SessionFactory>>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
}

impl OrchestratorBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.handshake = Some(handshake);
        self
    }

    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factory = Some(factory);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> ConnectionOrchestrator {
        fn slot<T: ?Sized>(value: Option<Arc<T>>) -> Mutex<Slot<T>> {
            Mutex::new(value.map_or(Slot::Unconfigured, Slot::Injected))
        }

        let registry = Arc::new(Registry::default());
        for observer in self.observers {
            registry.hub.subscribe(observer);
        }
        ConnectionOrchestrator {
            shared: Arc::new(Shared {
                config: RwLock::new(self.config),
                scheduler: slot(self.scheduler),
                resolver: slot(self.resolver),
                logger: slot(self.logger),
                handshake: slot(self.handshake),
                session_factory: slot(self.session_factory),
                registry,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::SystemResolver;
    use std::net::Ipv4Addr;

    #[test]
    fn defaults_are_built_once() {
        let orchestrator = ConnectionOrchestrator::default();
        assert!(Arc::ptr_eq(&orchestrator.resolver(), &orchestrator.resolver()));
        assert!(Arc::ptr_eq(&orchestrator.logger(), &orchestrator.logger()));
        assert!(Arc::ptr_eq(
            &orchestrator.scheduler().unwrap(),
            &orchestrator.scheduler().unwrap()
        ));
        assert_eq!(orchestrator.dns_server().to_string(), "8.8.8.8");
        assert_eq!(orchestrator.tick_interval(), Duration::from_millis(200));
    }

    #[test]
    fn changing_dns_server_rebuilds_default_resolver() {
        let orchestrator = ConnectionOrchestrator::default();
        let before = orchestrator.resolver();
        let handshake = orchestrator.handshake().unwrap();

        orchestrator.set_dns_server(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(orchestrator.dns_server().to_string(), "1.1.1.1");
        assert!(!Arc::ptr_eq(&before, &orchestrator.resolver()));
        assert!(!Arc::ptr_eq(&handshake, &orchestrator.handshake().unwrap()));
    }

    #[test]
    fn changing_dns_server_keeps_injected_resolver() {
        let injected: Arc<dyn Resolver> = Arc::new(SystemResolver);
        let orchestrator = ConnectionOrchestrator::builder()
            .resolver(Arc::clone(&injected))
            .build();
        orchestrator.set_dns_server(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        assert!(Arc::ptr_eq(&injected, &orchestrator.resolver()));
    }

    #[test]
    fn invalid_handshake_url_is_a_client_error() {
        let orchestrator = ConnectionOrchestrator::new(ClientConfig {
            handshake_url: "not a url".into(),
            ..ClientConfig::default()
        });
        let result = orchestrator.add_connection(Connection::new("t"));
        assert!(matches!(result, Err(ClientError::InvalidEndpoint { .. })));
    }

    #[tokio::test]
    async fn within_reports_timeout() {
        let result: Result<(), _> = within(
            Some(Duration::from_millis(5)),
            "handshake",
            ConnectError::ConnectionAttemptFailed,
            std::future::pending(),
        )
        .await;
        assert_eq!(
            result,
            Err(ConnectError::ConnectionAttemptFailed(
                "handshake timed out after 5ms".into()
            ))
        );
    }

    #[tokio::test]
    async fn within_without_limit_passes_through() {
        let result = within(None, "handshake", ConnectError::ConnectionAttemptFailed, async {
            Ok::<_, ConnectError>(7)
        })
        .await;
        assert_eq!(result, Ok(7));
    }
}
