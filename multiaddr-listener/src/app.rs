//! The `libp2p` app and the `multiaddr` listen network
//!
//! Servers resolve listen addresses of the form `multiaddr/<multiaddr>:<port>`
//! through [`listen`], which builds a fresh libp2p host for the address using
//! the settings of the [`App`] registered in the [`Context`].

/// Name the [`App`] is registered under
pub const APP_NAME: &str = "libp2p";

/// Network name of listen addresses handled by [`listen`]
pub const NETWORK: &str = "multiaddr";

/// Owns the settings shared by every host and the hosts built from them
#[derive(Debug, Default)]
pub struct App {
    config: crate::AppConfig,
    hosts: std::sync::Mutex<Vec<crate::Host>>,
}

impl App {
    pub fn new(config: crate::AppConfig) -> Self {
        Self {
            config,
            hosts: Default::default(),
        }
    }

    pub fn config(&self) -> &crate::AppConfig {
        &self.config
    }

    /// Hosts built through this app that have not been stopped yet
    pub fn hosts(&self) -> Vec<crate::Host> {
        self.lock_hosts().clone()
    }

    /// Shut down every host this app built
    pub fn stop(&self) {
        let hosts = std::mem::take(&mut *self.lock_hosts());
        for host in &hosts {
            host.shutdown();
        }
        tracing::info!("Stopped {} libp2p host(s)", hosts.len());
    }

    /// Settings for a host listening on `listen`, identity excluded
    pub fn host_config(&self, listen: libp2p::Multiaddr) -> crate::HostConfig {
        let config = crate::HostConfig::new(listen);
        match self.config.routing() {
            Some(routing) => config.with_routing(routing),
            None => config,
        }
    }

    fn track(&self, host: crate::Host) {
        self.lock_hosts().push(host);
    }

    fn lock_hosts(&self) -> std::sync::MutexGuard<'_, Vec<crate::Host>> {
        self.hosts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Registry of named apps a listen request can look its settings up in
#[derive(Default)]
pub struct Context {
    apps: std::collections::HashMap<String, std::sync::Arc<dyn std::any::Any + Send + Sync>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("apps", &self.apps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_app<T>(&mut self, name: impl Into<String>, app: std::sync::Arc<T>)
    where
        T: std::any::Any + Send + Sync,
    {
        self.apps.insert(name.into(), app);
    }

    pub fn app<T>(&self, name: &str) -> Result<std::sync::Arc<T>, crate::ContextError>
    where
        T: std::any::Any + Send + Sync,
    {
        let app = self
            .apps
            .get(name)
            .ok_or_else(|| crate::ContextError::NotFound {
                name: name.to_string(),
            })?;

        app.clone()
            .downcast::<T>()
            .map_err(|_| crate::ContextError::TypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }
}

/// Split `network/address` into its two halves; a bare address is `tcp`
pub fn split_network_address(full: &str) -> (&str, &str) {
    match full.split_once('/') {
        Some((network, address)) if !network.is_empty() => (network, address),
        _ => ("tcp", full),
    }
}

/// Build a libp2p host for `addr` and return a listener for HTTP streams on it.
///
/// `addr` is `<multiaddr>:<port>`. Every failing stage is reported as its own
/// [`crate::RegistrationError`] variant, and nothing is left running when any
/// stage before host construction fails.
pub async fn listen(
    ctx: &Context,
    network: &str,
    addr: &str,
) -> Result<crate::Listener, crate::RegistrationError> {
    if network != NETWORK {
        return Err(crate::RegistrationError::SchemeMismatch {
            network: network.to_string(),
        });
    }

    let listen_addr = crate::address::parse(addr)?;
    if let Some((explicit, embedded)) = listen_addr.port_mismatch() {
        tracing::warn!(
            "Listen address {listen_addr} names port {explicit} but the multiaddr binds \
             {embedded}; using {embedded}"
        );
    }

    let app = ctx.app::<App>(APP_NAME)?;

    let mut config = app.host_config(listen_addr.multiaddr);
    if let Some(path) = &app.config().private_key {
        config = config.with_identity(crate::identity::load(path)?);
    }

    let host = crate::host::build(config).await?;
    tracing::info!("libp2p host {} listening on {:?}", host.peer_id(), host.addrs());

    let listener = match crate::Listener::new(&host, crate::HTTP_PROTOCOL) {
        Ok(listener) => listener,
        Err(e) => {
            host.shutdown();
            return Err(e.into());
        }
    };
    app.track(host);

    Ok(listener)
}
