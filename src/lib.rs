//! dohrelay: a stateless DNS-over-HTTPS forwarding proxy.
//!
//! Queries arrive over HTTP(S) as GET (`?dns=`) or POST (raw DNS message) and
//! are relayed to one of several upstream DoH resolvers chosen by weight. When
//! the chosen upstream cannot be reached the request fails over, in registry
//! order, to the remaining providers. DNS payloads are treated as opaque bytes.

pub mod config;
pub mod metrics;
pub mod provider;
pub mod router;
pub mod selector;
pub mod server;
pub mod telemetry;
pub mod translate;
pub mod transport;

pub use config::RelaySettings;
pub use provider::{Provider, ProviderRegistry, RegistryError};
pub use router::{DispatchError, DohRouter, RelayResponse};
pub use server::{RelayDaemon, build_app};
pub use translate::{DnsMethod, InboundRequest, UpstreamAttempt};
pub use transport::{ReqwestTransport, TransportError, UpstreamResponse, UpstreamTransport};
