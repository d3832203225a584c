//! Protocol discovery over HTTP
//!
//! Peers speaking HTTP over libp2p learn which protocols a server offers, and
//! under which path prefix, by fetching [`WELL_KNOWN_PATH`]. The answer is a
//! JSON object keyed by protocol id:
//!
//! ```json
//! {"/kubo/1.0.0": {"path": "/kubo/"}}
//! ```

pub const WELL_KNOWN_PATH: &str = "/.well-known/libp2p/protocols";

/// Where a protocol is mounted on the HTTP server
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProtocolMeta {
    pub path: String,
}

impl ProtocolMeta {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// Protocol id to mount point, ordered so responses are stable
pub type ProtocolMap = std::collections::BTreeMap<String, ProtocolMeta>;

/// Shared protocol registry that answers discovery requests
#[derive(Debug, Default)]
pub struct WellKnownResponder {
    protocols: std::sync::RwLock<ProtocolMap>,
}

impl WellKnownResponder {
    pub fn add_protocol_meta(&self, protocol: impl Into<String>, meta: ProtocolMeta) {
        self.write().insert(protocol.into(), meta);
    }

    pub fn remove_protocol_meta(&self, protocol: &str) -> Option<ProtocolMeta> {
        self.write().remove(protocol)
    }

    /// Add every entry of `protocols`, replacing existing entries for the same id
    pub fn merge(&self, protocols: &ProtocolMap) {
        let mut current = self.write();
        for (protocol, meta) in protocols {
            current.insert(protocol.clone(), meta.clone());
        }
    }

    pub fn protocols(&self) -> ProtocolMap {
        self.protocols
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Answer a discovery request: 406 when the client cannot take JSON, 405
    /// for anything but GET, otherwise the registry as JSON.
    pub fn respond<B>(
        &self,
        req: &http::Request<B>,
    ) -> http::Response<http_body_util::Full<bytes::Bytes>> {
        if !accepts_json(req.headers()) {
            return status_response(http::StatusCode::NOT_ACCEPTABLE);
        }
        if req.method() != http::Method::GET {
            return status_response(http::StatusCode::METHOD_NOT_ALLOWED);
        }

        let body = match serde_json::to_vec(&self.protocols()) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to encode protocol list: {e}");
                return status_response(http::StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        let content_length = http::HeaderValue::from(body.len());
        let mut response = http::Response::new(http_body_util::Full::new(bytes::Bytes::from(body)));
        let headers = response.headers_mut();
        headers.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        headers.insert(http::header::CONTENT_LENGTH, content_length);
        response
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ProtocolMap> {
        self.protocols
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn accepts_json(headers: &http::HeaderMap) -> bool {
    let Some(accept) = headers.get(http::header::ACCEPT) else {
        return true;
    };
    let accept = String::from_utf8_lossy(accept.as_bytes());
    accept.is_empty() || accept.contains("application/json") || accept.contains("*/*")
}

fn status_response(status: http::StatusCode) -> http::Response<http_body_util::Full<bytes::Bytes>> {
    let mut response = http::Response::new(http_body_util::Full::new(bytes::Bytes::new()));
    *response.status_mut() = status;
    response
}

/// HTTP middleware serving [`WELL_KNOWN_PATH`] and passing everything else on
#[derive(Debug, Clone)]
pub struct WellKnownHandler {
    configured: ProtocolMap,
    responder: std::sync::Arc<WellKnownResponder>,
}

impl WellKnownHandler {
    /// A handler answering from a private registry holding `protocols`
    pub fn new(protocols: ProtocolMap) -> Self {
        let responder = std::sync::Arc::new(WellKnownResponder::default());
        responder.merge(&protocols);
        Self {
            configured: protocols,
            responder,
        }
    }

    /// Read a `well_known { <protocol> => <path> }` block
    pub fn from_directive(
        directive: &crate::config::Directive,
    ) -> Result<Self, crate::ConfigError> {
        if !directive.args.is_empty() {
            return Err(directive.arg_error());
        }

        let mut protocols = ProtocolMap::new();
        for entry in directive.children() {
            match entry.args.as_slice() {
                [arrow, path] if arrow == "=>" => {
                    protocols.insert(entry.name.clone(), ProtocolMeta::new(path.as_str()));
                }
                [arrow] if arrow == "=>" => {
                    return Err(crate::ConfigError::syntax(
                        entry.line,
                        format!("missing path for protocol {}", entry.name),
                    ));
                }
                _ => {
                    return Err(crate::ConfigError::syntax(
                        entry.line,
                        format!("expected '{} => <path>'", entry.name),
                    ));
                }
            }
        }

        Ok(Self::new(protocols))
    }

    /// Publish the configured protocols on `host` and answer from its registry
    pub fn provision(&mut self, host: &crate::Host) {
        self.provision_into(host.well_known().clone());
    }

    /// Publish the configured protocols into `responder` and answer from it
    pub fn provision_into(&mut self, responder: std::sync::Arc<WellKnownResponder>) {
        responder.merge(&self.configured);
        tracing::debug!(
            "Provisioned {} well-known protocol(s)",
            self.configured.len()
        );
        self.responder = responder;
    }

    pub fn responder(&self) -> &std::sync::Arc<WellKnownResponder> {
        &self.responder
    }

    /// Serve the discovery document for an exact path match, otherwise call `next`
    pub async fn handle<B, F, Fut>(
        &self,
        req: http::Request<B>,
        next: F,
    ) -> http::Response<http_body_util::Full<bytes::Bytes>>
    where
        F: FnOnce(http::Request<B>) -> Fut,
        Fut: std::future::Future<Output = http::Response<http_body_util::Full<bytes::Bytes>>>,
    {
        if req.uri().path() == WELL_KNOWN_PATH {
            tracing::trace!("{} {}", req.method(), WELL_KNOWN_PATH);
            return self.responder.respond(&req);
        }
        next(req).await
    }
}
