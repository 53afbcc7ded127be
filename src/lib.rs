/*!
 * VRPC - asynchronous remote procedure calls over publish/subscribe
 *
 * Client runtime for agents speaking VRPC protocol v3:
 * - Discovery of agents and their classes from retained announcements
 * - Static, member and generic calls with many calls in flight at once
 * - Proxies bound to remote instances, with per-proxy result bindings
 * - Back-reference arguments to earlier results (`$name`)
 * - Transport abstraction with MQTT and in-process implementations
 *
 * Author: Shane Wall <shaneawall@gmail.com>
 */

pub mod client;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logging;
pub mod proxy;
pub mod registry;
pub mod store;
pub mod value;

mod session;

// Re-export commonly used types
pub use client::VrpcRemote;
pub use config::{BrokerAddress, LogConfig, LogLevel, RemoteConfig};
pub use dispatcher::{GenericCall, StaticCall};
pub use error::{Result, VrpcError};
pub use events::{AgentEvent, ClassEvent, DiscoveryEvent, DiscoveryStream, EventKind, EventSubscription};
pub use proxy::{CreateOptions, Proxy, RemoteMethod};
pub use registry::{AgentRecord, ClassInfo};
pub use value::{Arg, Map, Value};

pub use vrpc_transport as transport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
