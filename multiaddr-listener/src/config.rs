//! Configuration
//!
//! Configuration files are a list of directives, one per line. A directive may
//! open a block with a trailing `{`; block bodies hold one directive per line
//! and end at a line containing only `}`. `#` starts a comment.
//!
//! ```text
//! libp2p {
//!     private_key /etc/p2p/identity.pem
//!     advertise_amino
//! }
//!
//! well_known {
//!     /kubo/1.0.0 => /kubo/
//! }
//!
//! listen multiaddr//ip4/0.0.0.0/tcp/4001:4001
//! ```

/// One configuration line, with its block body if it opened one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// 1-based line number, used in error messages
    pub line: usize,
    pub name: String,
    pub args: Vec<String>,
    pub body: Option<Vec<Directive>>,
}

impl Directive {
    /// Body directives, empty for directives without a block
    pub fn children(&self) -> &[Directive] {
        self.body.as_deref().unwrap_or_default()
    }

    pub(crate) fn arg_error(&self) -> crate::ConfigError {
        crate::ConfigError::syntax(
            self.line,
            format!("wrong argument count or unexpected line ending after '{}'", self.name),
        )
    }
}

/// Split configuration text into top-level directives
pub fn parse(input: &str) -> Result<Vec<Directive>, crate::ConfigError> {
    let mut directives = Vec::new();
    let mut open: Option<Directive> = None;

    for (idx, raw_line) in input.lines().enumerate() {
        let line = idx + 1;
        let mut tokens: Vec<String> = raw_line
            .split_whitespace()
            .take_while(|token| !token.starts_with('#'))
            .map(str::to_string)
            .collect();

        if tokens.is_empty() {
            continue;
        }

        if tokens.len() == 1 && tokens[0] == "}" {
            match open.take() {
                Some(block) => directives.push(block),
                None => return Err(crate::ConfigError::syntax(line, "unexpected '}'")),
            }
            continue;
        }

        let opens_block = tokens.last().is_some_and(|token| token == "{");
        if opens_block {
            tokens.pop();
        }
        if tokens.iter().any(|token| token == "{" || token == "}") {
            return Err(crate::ConfigError::syntax(
                line,
                "braces must be alone at the end of a line",
            ));
        }
        if tokens.is_empty() {
            return Err(crate::ConfigError::syntax(line, "block without a name"));
        }

        let name = tokens.remove(0);
        let directive = Directive {
            line,
            name,
            args: tokens,
            body: opens_block.then(Vec::new),
        };

        if let Some(block) = open.as_mut() {
            if opens_block {
                return Err(crate::ConfigError::syntax(
                    line,
                    "nested blocks are not supported",
                ));
            }
            block.body.get_or_insert_with(Vec::new).push(directive);
        } else if opens_block {
            open = Some(directive);
        } else {
            directives.push(directive);
        }
    }

    if let Some(block) = open {
        return Err(crate::ConfigError::syntax(
            block.line,
            format!("block '{}' is never closed", block.name),
        ));
    }

    Ok(directives)
}

/// Settings of the `libp2p` app
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AppConfig {
    /// PEM file holding a PKCS#8 private key; a fresh identity is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<std::path::PathBuf>,

    /// Join the Amino DHT as a client so peers can look this host up.
    ///
    /// Mostly useful for WebRTC and WebTransport, whose certificate hashes
    /// rotate while the peer id stays the same.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub advertise_amino: bool,

    /// Overrides [`crate::DEFAULT_BOOTSTRAP_PEERS`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_peers: Option<Vec<String>>,
}

impl AppConfig {
    /// Routing settings when advertising is enabled
    pub fn routing(&self) -> Option<crate::RoutingConfig> {
        if !self.advertise_amino {
            return None;
        }
        Some(match &self.bootstrap_peers {
            Some(peers) => crate::RoutingConfig {
                bootstrap_peers: peers.clone(),
            },
            None => crate::RoutingConfig::default(),
        })
    }

    /// Read the `libp2p { ... }` block
    pub fn from_directive(directive: &Directive) -> Result<Self, crate::ConfigError> {
        if !directive.args.is_empty() {
            return Err(directive.arg_error());
        }

        let mut config = AppConfig::default();
        for child in directive.children() {
            match child.name.as_str() {
                "advertise_amino" => {
                    config.advertise_amino = match child.args.as_slice() {
                        [] => true,
                        [value] => parse_bool(value).ok_or_else(|| {
                            crate::ConfigError::syntax(
                                child.line,
                                format!("invalid boolean {value:?}"),
                            )
                        })?,
                        _ => return Err(child.arg_error()),
                    };
                }
                "private_key" => match child.args.as_slice() {
                    [path] => config.private_key = Some(path.into()),
                    _ => return Err(child.arg_error()),
                },
                "bootstrap_peer" => {
                    if child.args.is_empty() {
                        return Err(child.arg_error());
                    }
                    config
                        .bootstrap_peers
                        .get_or_insert_with(Vec::new)
                        .extend(child.args.iter().cloned());
                }
                other => {
                    return Err(crate::ConfigError::syntax(
                        child.line,
                        format!("unrecognized directive: {other}"),
                    ));
                }
            }
        }

        Ok(config)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
