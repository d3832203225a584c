//! # multiaddr-listener
//!
//! Serve HTTP over libp2p by treating a multiaddr as a listen address.
//!
//! A server that resolves listen addresses by network name hands addresses of
//! the `multiaddr` network to [`listen`]. Each call builds its own libp2p
//! host bound to the given multiaddr and returns a [`Listener`] whose
//! [`accept`](Listener::accept) yields inbound `/http/1.1` streams that read
//! and write like TCP connections.
//!
//! ```text
//! listen multiaddr//ip4/0.0.0.0/tcp/4001:4001
//! listen multiaddr//ip4/0.0.0.0/udp/4001/quic-v1:
//! listen multiaddr//ip4/0.0.0.0/udp/4002/webrtc-direct:
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let app = std::sync::Arc::new(multiaddr_listener::App::new(Default::default()));
//! let mut ctx = multiaddr_listener::Context::new();
//! ctx.register_app(multiaddr_listener::APP_NAME, app.clone());
//!
//! let listener =
//!     multiaddr_listener::listen(&ctx, "multiaddr", "/ip4/0.0.0.0/tcp/4001:4001").await?;
//! println!("serving as {}", listener.host().peer_id());
//!
//! let stream = listener.accept().await?;
//! // hand `stream` to an HTTP/1.1 connection driver
//! # drop(stream);
//!
//! listener.close();
//! app.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Identity
//!
//! Without a `private_key` every host gets a fresh Ed25519 identity. With one,
//! the key is read from a PEM `PRIVATE KEY` block (PKCS#8), see [`identity`].
//!
//! ## Discovery
//!
//! [`WellKnownHandler`] answers `GET /.well-known/libp2p/protocols` with the
//! protocols the server offers. Every host carries its own
//! [`WellKnownResponder`], shared by all handlers provisioned against it.
//!
//! ## Teardown
//!
//! [`Listener::close`] only stops accepting. Hosts stay up until
//! [`App::stop`] shuts down every host the app built.

pub mod address;
mod app;
pub mod config;
mod error;
pub mod host;
pub mod identity;
mod listener;
mod well_known;

pub use address::ListenAddress;
pub use app::{APP_NAME, App, Context, NETWORK, listen, split_network_address};
pub use config::AppConfig;
pub use error::{
    AddressError, ConfigError, ContextError, HostError, IdentityError, ListenerError,
    RegistrationError,
};
pub use host::{DEFAULT_BOOTSTRAP_PEERS, Host, HostConfig, RoutingConfig};
pub use listener::{HTTP_PROTOCOL, Listener, ListenerAddr, P2pStream, StreamListener};
pub use well_known::{
    ProtocolMap, ProtocolMeta, WELL_KNOWN_PATH, WellKnownHandler, WellKnownResponder,
};
