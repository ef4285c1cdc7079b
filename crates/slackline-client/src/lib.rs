pub mod config;
pub mod dns;
pub mod error;
pub mod handshake;
pub mod observer;
pub mod orchestrator;
pub mod resolver;
pub mod scheduler;
pub mod session;
mod slot;

pub mod mock;

pub use config::ClientConfig;
pub use dns::NameserverResolver;
pub use error::ClientError;
pub use handshake::{Handshake, HandshakeClient, HandshakeResult, ResponseAccumulator};
pub use observer::{EventHub, LifecycleObserver};
pub use orchestrator::{ConnectionOrchestrator, OrchestratorBuilder};
pub use resolver::{CachingResolver, Resolver, SystemResolver};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use session::{Session, SessionFactory, WebSocketSessionFactory};
