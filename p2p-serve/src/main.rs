//! p2p-serve: HTTP server reachable over libp2p
//!
//! Reads a configuration file, registers the libp2p app, opens one libp2p host
//! per `listen multiaddr/...` line and serves HTTP/1.1 on each of them until
//! interrupted.
//!
//! Usage: p2p-serve --config <path>

use colored::Colorize;

#[derive(clap::Parser)]
#[command(name = "p2p-serve")]
#[command(about = "Serve HTTP over libp2p multiaddr listeners")]
struct Cli {
    /// Configuration file with libp2p, well_known and listen directives
    #[arg(long, short, env = "P2P_SERVE_CONFIG")]
    config: std::path::PathBuf,
}

#[derive(Debug)]
struct ServeConfig {
    app: multiaddr_listener::AppConfig,
    well_known: multiaddr_listener::WellKnownHandler,
    listen: Vec<String>,
}

fn load_config(text: &str) -> eyre::Result<ServeConfig> {
    let mut app = multiaddr_listener::AppConfig::default();
    let mut well_known = None;
    let mut listen = Vec::new();

    for directive in multiaddr_listener::config::parse(text)? {
        match directive.name.as_str() {
            "libp2p" => app = multiaddr_listener::AppConfig::from_directive(&directive)?,
            "well_known" => {
                if well_known.is_some() {
                    eyre::bail!("line {}: duplicate well_known block", directive.line);
                }
                well_known = Some(multiaddr_listener::WellKnownHandler::from_directive(
                    &directive,
                )?);
            }
            "listen" => {
                if directive.args.is_empty() || directive.body.is_some() {
                    eyre::bail!(
                        "line {}: expected 'listen <network>/<address>'",
                        directive.line
                    );
                }
                listen.extend(directive.args.iter().cloned());
            }
            other => eyre::bail!("line {}: unrecognized directive: {other}", directive.line),
        }
    }

    Ok(ServeConfig {
        app,
        well_known: well_known.unwrap_or_else(|| {
            multiaddr_listener::WellKnownHandler::new(multiaddr_listener::ProtocolMap::new())
        }),
        listen,
    })
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = <Cli as clap::Parser>::parse();
    let text = tokio::fs::read_to_string(&cli.config)
        .await
        .map_err(|e| eyre::eyre!("reading {}: {e}", cli.config.display()))?;
    let config = load_config(&text)?;
    if config.listen.is_empty() {
        eyre::bail!("{}: no listen addresses configured", cli.config.display());
    }

    let app = std::sync::Arc::new(multiaddr_listener::App::new(config.app));
    let mut ctx = multiaddr_listener::Context::new();
    ctx.register_app(multiaddr_listener::APP_NAME, app.clone());

    let mut listeners = Vec::new();
    let mut tasks = tokio::task::JoinSet::new();

    for full in &config.listen {
        let (network, addr) = multiaddr_listener::split_network_address(full);
        let listener = match multiaddr_listener::listen(&ctx, network, addr).await {
            // Peers that vanish mid-response end the connection quietly
            Ok(listener) => std::sync::Arc::new(listener.with_ignore_eof(true)),
            Err(e) => {
                app.stop();
                return Err(eyre::eyre!("listen {full}: {e}"));
            }
        };

        let mut handler = config.well_known.clone();
        handler.provision(listener.host());

        let peer_id = listener.host().peer_id();
        println!("🌐 Serving {full} as {}", peer_id.to_string().green());
        for addr in listener.host().addrs() {
            println!("   {addr}/p2p/{peer_id}");
        }

        tasks.spawn(serve(listener.clone(), std::sync::Arc::new(handler)));
        listeners.push(listener);
    }

    tokio::signal::ctrl_c().await?;
    println!("🛑 Shutting down");

    for listener in &listeners {
        listener.close();
    }
    while tasks.join_next().await.is_some() {}
    app.stop();

    Ok(())
}

async fn serve(
    listener: std::sync::Arc<multiaddr_listener::Listener>,
    handler: std::sync::Arc<multiaddr_listener::WellKnownHandler>,
) {
    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(multiaddr_listener::ListenerError::Closed) => break,
            Err(e) => {
                tracing::error!("Failed to accept stream: {e}");
                continue;
            }
        };

        let handler = handler.clone();
        tokio::spawn(async move {
            let remote = stream.remote_peer();
            tracing::debug!("HTTP connection from {remote}");

            let service = hyper::service::service_fn(move |req| {
                let handler = handler.clone();
                async move {
                    Ok::<_, std::convert::Infallible>(handler.handle(req, not_found).await)
                }
            });

            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(hyper_util::rt::TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("HTTP connection from {remote} ended: {e}");
            }
        });
    }
}

async fn not_found<B>(
    req: http::Request<B>,
) -> http::Response<http_body_util::Full<bytes::Bytes>> {
    tracing::debug!("No route for {} {}", req.method(), req.uri().path());
    let mut response =
        http::Response::new(http_body_util::Full::new(bytes::Bytes::from_static(b"not found\n")));
    *response.status_mut() = http::StatusCode::NOT_FOUND;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config() {
        let config = load_config(indoc::indoc! {"
            libp2p {
                advertise_amino false
            }

            well_known {
                /kubo/1.0.0 => /kubo/
            }

            listen multiaddr//ip4/0.0.0.0/tcp/4001:4001
            listen multiaddr//ip4/0.0.0.0/udp/4001/quic-v1:
        "})
        .unwrap();

        assert!(!config.app.advertise_amino);
        assert_eq!(config.listen.len(), 2);
        assert_eq!(
            multiaddr_listener::split_network_address(&config.listen[1]),
            ("multiaddr", "/ip4/0.0.0.0/udp/4001/quic-v1:")
        );
        assert!(config.well_known.responder().protocols().contains_key("/kubo/1.0.0"));
    }

    #[test]
    fn test_unknown_top_level_directive() {
        let err = load_config("reverse_proxy localhost:8080\n").unwrap_err();
        assert_eq!(err.to_string(), "line 1: unrecognized directive: reverse_proxy");
    }

    #[test]
    fn test_listen_needs_address() {
        assert!(load_config("listen\n").is_err());
    }

    async fn get(
        client: &multiaddr_listener::Host,
        server: libp2p::PeerId,
        path: &str,
    ) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let stream = client
            .stream_control()
            .open_stream(server, multiaddr_listener::HTTP_PROTOCOL)
            .await
            .unwrap();
        let mut stream = tokio_util::compat::FuturesAsyncReadCompatExt::compat(stream);
        let request = format!("GET {path} HTTP/1.1\r\nHost: p2p\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        stream.flush().await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serve_over_libp2p() {
        let config = load_config(indoc::indoc! {"
            well_known {
                /kubo/1.0.0 => /kubo/
            }
        "})
        .unwrap();

        let app = std::sync::Arc::new(multiaddr_listener::App::new(config.app));
        let mut ctx = multiaddr_listener::Context::new();
        ctx.register_app(multiaddr_listener::APP_NAME, app.clone());

        let listener = multiaddr_listener::listen(
            &ctx,
            multiaddr_listener::NETWORK,
            "/ip4/127.0.0.1/tcp/0:",
        )
        .await
        .unwrap();
        let listener = std::sync::Arc::new(listener.with_ignore_eof(true));
        let mut handler = config.well_known.clone();
        handler.provision(listener.host());
        let server = tokio::spawn(serve(listener.clone(), std::sync::Arc::new(handler)));

        let client = multiaddr_listener::host::build(multiaddr_listener::HostConfig::new(
            "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
        ))
        .await
        .unwrap();
        let server_peer = client
            .dial(listener.host().addrs()[0].clone())
            .await
            .unwrap();

        let path = multiaddr_listener::WELL_KNOWN_PATH;
        let response = get(&client, server_peer, path).await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("content-type: application/json"), "{response}");
        assert!(
            response.contains(r#""/kubo/1.0.0":{"path":"/kubo/"}"#),
            "{response}"
        );

        let response = get(&client, server_peer, "/index.html").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
        assert!(response.ends_with("not found\n"), "{response}");

        listener.close();
        server.await.unwrap();
        client.shutdown();
        app.stop();
    }

    #[tokio::test]
    async fn test_not_found() {
        let response = not_found(http::Request::new(())).await;
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
    }
}
