//! Error types for multiaddr-listener

/// Errors splitting and parsing a `<multiaddr>:<port>` listen address
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("invalid port {port:?}: {source}")]
    MalformedPort {
        port: String,
        source: std::num::ParseIntError,
    },

    #[error("could not parse multiaddr {addr:?}: {source}")]
    MalformedAddress {
        addr: String,
        source: libp2p::multiaddr::Error,
    },

    #[error("empty multiaddr in listen address {raw:?}")]
    EmptyAddress { raw: String },
}

/// Errors loading the host identity from a PEM key file
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("reading key file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("PEM block not found in input data:\n{rest}")]
    EnvelopeFormat { rest: String },

    #[error("expected PRIVATE KEY type in PEM block but got: {label}")]
    UnexpectedKeyType { label: String },

    #[error("parsing PKCS8 format: {0}")]
    KeyDecode(String),

    #[error("converting PKCS8 key to libp2p key: {0}")]
    KeyConversion(String),
}

/// Errors constructing or driving a libp2p host
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("building transports: {source}")]
    Transport { source: eyre::Error },

    #[error("listening on {addr}: {source}")]
    Listen {
        addr: libp2p::Multiaddr,
        source: eyre::Error,
    },

    #[error("setting up routing: {0}")]
    Routing(String),

    #[error("dialing {addr}: {message}")]
    Dial {
        addr: libp2p::Multiaddr,
        message: String,
    },

    #[error("host has shut down")]
    Closed,
}

/// Errors returned by [`crate::Listener`]
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("listener closed")]
    Closed,

    #[error("protocol {protocol} already has a listener on this host")]
    AlreadyRegistered { protocol: libp2p::StreamProtocol },
}

/// Configuration syntax errors, always tied to the offending line
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

impl ConfigError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        ConfigError::Syntax {
            line,
            message: message.into(),
        }
    }
}

/// Errors looking up a registered app by name
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("app {name:?} is not registered")]
    NotFound { name: String },

    #[error("app {name:?} is not a {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
    },
}

/// Errors from [`crate::listen`], one variant per failing stage
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("multiaddr URI network only handles multiaddr URIs, got {network:?}")]
    SchemeMismatch { network: String },

    #[error("looking up libp2p app: {source}")]
    Context {
        #[from]
        source: ContextError,
    },

    #[error("parsing listen address: {source}")]
    Address {
        #[from]
        source: AddressError,
    },

    #[error("loading identity: {source}")]
    Identity {
        #[from]
        source: IdentityError,
    },

    #[error("constructing host: {source}")]
    Host {
        #[from]
        source: HostError,
    },

    #[error("wrapping host listener: {source}")]
    Listener {
        #[from]
        source: ListenerError,
    },
}
