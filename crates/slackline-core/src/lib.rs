pub mod connection;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logger;
pub mod write;

pub use connection::{Connection, ConnectionState, Connections};
pub use errors::{ConnectError, ConnectErrorKind, ResolveError};
pub use events::LifecycleEvent;
pub use ids::ConnectionId;
pub use logger::Logger;
pub use write::{SessionClosed, WriteHandle};
