//! Listen address parsing
//!
//! The server framework hands us addresses in its usual `host:port` shape, so a
//! multiaddr listen address arrives as `<multiaddr>:<port>`, e.g.
//! `/ip4/0.0.0.0/tcp/4001:4001`. The port after the last colon may be empty.

/// A listen address split into its multiaddr and the optional trailing port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    pub multiaddr: libp2p::Multiaddr,
    pub port: Option<u16>,
}

impl ListenAddress {
    /// Port of the first TCP or UDP component of the multiaddr, if any
    pub fn embedded_port(&self) -> Option<u16> {
        self.multiaddr.iter().find_map(|protocol| match protocol {
            libp2p::multiaddr::Protocol::Tcp(port) | libp2p::multiaddr::Protocol::Udp(port) => {
                Some(port)
            }
            _ => None,
        })
    }

    /// `(explicit, embedded)` when both ports are present and disagree.
    ///
    /// The multiaddr is what gets bound, so the embedded port always wins.
    pub fn port_mismatch(&self) -> Option<(u16, u16)> {
        match (self.port, self.embedded_port()) {
            (Some(explicit), Some(embedded)) if explicit != embedded => Some((explicit, embedded)),
            _ => None,
        }
    }
}

impl std::fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{port}", self.multiaddr),
            None => write!(f, "{}:", self.multiaddr),
        }
    }
}

impl std::str::FromStr for ListenAddress {
    type Err = crate::AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse `<multiaddr>:<port>` where the port may be left empty.
///
/// The port must be a decimal integer in `0..=65535`; negative or larger
/// values fail with [`crate::AddressError::MalformedPort`], since TCP and UDP
/// ports are 16 bits and a wider value could never be bound.
///
/// Without any colon the whole input is taken as the port, which fails for
/// anything that looks like a multiaddr.
pub fn parse(raw: &str) -> Result<ListenAddress, crate::AddressError> {
    let (addr, port) = match raw.rfind(':') {
        Some(idx) => (&raw[..idx], &raw[idx + 1..]),
        None => ("", raw),
    };

    let port = if port.is_empty() {
        None
    } else {
        let parsed = port
            .parse::<u16>()
            .map_err(|source| crate::AddressError::MalformedPort {
                port: port.to_string(),
                source,
            })?;
        Some(parsed)
    };

    if addr.is_empty() {
        return Err(crate::AddressError::EmptyAddress {
            raw: raw.to_string(),
        });
    }

    let multiaddr = addr
        .parse::<libp2p::Multiaddr>()
        .map_err(|source| crate::AddressError::MalformedAddress {
            addr: addr.to_string(),
            source,
        })?;

    Ok(ListenAddress { multiaddr, port })
}
