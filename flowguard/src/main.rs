use std::{net::SocketAddr, sync::Arc};

use ahash::RandomState;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use dashmap::DashMap;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    signal,
    sync::oneshot,
};
use tokio_flowguard::{
    config::{Timeout, TransferOptions, parse_rate_limit},
    error::{is_timeout, timed_out_direction},
    io::FlowGuardExt,
    rate_limiter::RateLimiter,
};

use tracing::{Instrument, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Config {
    /// Address to listen on, e.g. 0.0.0.0:8080
    #[arg(short = 'l', long)]
    listen: SocketAddr,

    /// Address to connect upstream to, e.g. 127.0.0.1:8181
    #[arg(short = 'c', long)]
    upstream: SocketAddr,

    /// Address to listen for API, e.g. 127.0.0.1:8888
    #[arg(short = 'a', long)]
    api: SocketAddr,

    /// Fail a read that makes no progress for this long
    #[arg(long, value_name = "ms|infinite", default_value = "infinite")]
    read_timeout: Timeout,

    /// Fail a write that makes no progress for this long
    #[arg(long, value_name = "ms|infinite", default_value = "infinite")]
    write_timeout: Timeout,

    /// Grace period for the first byte of each connection
    #[arg(long, value_name = "ms|infinite", default_value = "infinite")]
    start_timeout: Timeout,

    /// Bandwidth cap shared by all connections, 0 = unlimited
    #[arg(long, value_name = "bytes/s", default_value = "0", value_parser = parse_rate_limit)]
    rate_limit: u64,
}

type ConnId = String;

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.listen == self.upstream {
            anyhow::bail!(
                "--listen and --upstream must differ (both are {})",
                self.listen
            );
        }

        if self.listen == self.api {
            anyhow::bail!("--listen and --api must differ (both are {})", self.listen);
        }

        Ok(())
    }

    fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            start_timeout: self.start_timeout,
            rate_limit: self.rate_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionInfo {
    id: ConnId,
    downstream: SocketAddr,
    upstream: SocketAddr,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionStatus {
    conn_info: ConnectionInfo,
    read_timeout: String,
    write_timeout: String,
    start_timeout: String,
}

#[derive(Debug)]
struct ConnectionState {
    conn_info: ConnectionInfo,
    options: TransferOptions,
    tx: oneshot::Sender<String>,
}

#[derive(Clone)]
struct ApiState {
    connections: Arc<DashMap<ConnId, ConnectionState, RandomState>>,
    limiter: Arc<RateLimiter>,
}

impl ApiState {
    fn all(&self) -> Vec<ConnectionStatus> {
        self.connections
            .iter()
            .map(|c| ConnectionStatus {
                conn_info: c.conn_info.clone(),
                read_timeout: c.options.read_timeout.to_string(),
                write_timeout: c.options.write_timeout.to_string(),
                start_timeout: c.options.start_timeout.to_string(),
            })
            .collect()
    }

    fn remove_connection(&self, id: &str) -> Result<ConnectionState, ApiError> {
        self.connections
            .remove(id)
            .ok_or(ApiError::NotFound)
            .map(|c| c.1)
    }
}

#[derive(Debug, ThisError)]
pub enum ApiError {
    #[error("connection not found")]
    NotFound,
    #[error("internal error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn list_connections(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ConnectionStatus>>, ApiError> {
    Ok(Json(state.all()))
}

async fn get_rate_limit(State(state): State<ApiState>) -> Json<RateLimitBody> {
    Json(RateLimitBody {
        rate_bytes: state.limiter.limit(),
    })
}

async fn set_rate_limit(
    State(state): State<ApiState>,
    Json(req): Json<RateLimitBody>,
) -> Result<StatusCode, ApiError> {
    state.limiter.set_limit(req.rate_bytes);
    Ok(StatusCode::ACCEPTED)
}

async fn shutdown_connection(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ShutdownReq>,
) -> Result<StatusCode, ApiError> {
    let conn = state.remove_connection(&id)?;
    conn.tx.send(req.reason).map_err(|_| ApiError::Internal)?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownReq {
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitBody {
    pub rate_bytes: u64,
}

async fn handle_connection(
    downstream: TcpStream,
    addr: SocketAddr,
    config: Arc<Config>,
    limiter: Arc<RateLimiter>,
    connections: Arc<DashMap<ConnId, ConnectionState, RandomState>>,
) {
    let upstream = match TcpStream::connect(config.upstream).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to connect upstream {}", config.upstream);
            return;
        }
    };

    // best effort
    _ = downstream.set_nodelay(true);
    _ = upstream.set_nodelay(true);

    info!("connected {addr} → {}", config.upstream);

    let options = config.transfer_options();
    let (tx, mut rx) = oneshot::channel();

    // The client side carries the shared cap and the meter; both sides watch for stalls.
    let mut downstream = options.build_shared(downstream, limiter);
    let mut upstream = upstream.observe_timeouts_with(&options);

    let id = nanoid!();

    connections.insert(
        id.clone(),
        ConnectionState {
            conn_info: ConnectionInfo {
                id: id.clone(),
                downstream: addr,
                upstream: config.upstream,
            },
            options,
            tx,
        },
    );

    let span = tracing::info_span!("conn", %id, client=%addr, upstream=%config.upstream);
    async move {
        let res = tokio::select! {
            res = copy_bidirectional(&mut downstream, &mut upstream) => res.map(Some),
            reason = &mut rx => {
                info!(reason = reason.as_deref().unwrap_or("unknown"), "shutdown requested");
                Ok(None)
            }
        };

        // clean up
        connections.remove(&id);

        match res {
            Ok(Some((to_upstream, to_client))) => {
                info!(to_upstream, to_client, "proxy finished");
            }
            Ok(None) => {}
            Err(err) if is_timeout(&err) => {
                let direction = timed_out_direction(&err);
                warn!(error = %err, ?direction, "connection stalled");
            }
            Err(err) => {
                error!(error = %err, "proxy error {} -> {}", addr, config.upstream);
            }
        }

        let snapshot = downstream.get_ref().snapshot();
        info!(
            bytes = snapshot.bytes,
            total_bytes_per_second = snapshot.total_bytes_per_second,
            recent_bytes_per_second = snapshot.recent_bytes_per_second,
            "connection closed"
        );
    }
    .instrument(span)
    .await
}

fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/connections", get(list_connections))
        .route("/connections/{id}/shutdown", post(shutdown_connection))
        .route("/rate-limit", get(get_rate_limit).patch(set_rate_limit))
        .with_state(state)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::parse();
    cfg.validate()?;
    let config = Arc::new(cfg);

    let connections = Arc::new(DashMap::with_hasher(RandomState::new()));
    let limiter = RateLimiter::new(config.rate_limit);

    let api_state = ApiState {
        connections: connections.clone(),
        limiter: limiter.clone(),
    };

    let api_addr = config.api;
    let api_listener = TcpListener::bind(api_addr).await?;

    tokio::spawn(async move {
        if let Err(err) = axum::serve(api_listener, api_router(api_state)).await {
            error!(%err, "api server error");
        }
    });

    // Proxy
    let listener = TcpListener::bind(config.listen).await?;
    info!(
        listen = %config.listen,
        connect = %config.upstream,
        api = %api_addr,
        read_timeout = %config.read_timeout,
        write_timeout = %config.write_timeout,
        start_timeout = %config.start_timeout,
        rate_limit = config.rate_limit,
        "Listening"
    );

    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        addr,
                        config.clone(),
                        limiter.clone(),
                        connections.clone(),
                    ));
                }
                Err(e) => {
                    error!(%e, "accept failed");
                }
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> Result<Config, clap::Error> {
        let base = ["flowguard", "-l", "127.0.0.1:1", "-c", "127.0.0.1:2", "-a", "127.0.0.1:3"];
        Config::try_parse_from(base.iter().chain(args))
    }

    #[test]
    fn config_defaults_to_no_limits() {
        let cfg = config(&[]).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.transfer_options(), TransferOptions::default());
    }

    #[test]
    fn config_parses_timeouts_and_rate() {
        let cfg = config(&[
            "--read-timeout",
            "1500",
            "--write-timeout",
            "infinite",
            "--start-timeout",
            "30000",
            "--rate-limit",
            "1048576",
        ])
        .unwrap();

        let options = cfg.transfer_options();
        assert_eq!(options.read_timeout.to_string(), "1500ms");
        assert!(options.write_timeout.is_infinite());
        assert_eq!(options.start_timeout.to_string(), "30000ms");
        assert_eq!(options.rate_limit, 1024 * 1024);
    }

    #[test]
    fn config_rejects_bad_values() {
        assert!(config(&["--read-timeout", "0"]).is_err());
        assert!(config(&["--start-timeout", "-3"]).is_err());
        assert!(config(&["--rate-limit", "-1"]).is_err());

        let cfg = Config::try_parse_from([
            "flowguard", "-l", "127.0.0.1:1", "-c", "127.0.0.1:1", "-a", "127.0.0.1:3",
        ])
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn api_state_rate_limit_and_missing_connection() {
        let state = ApiState {
            connections: Arc::new(DashMap::with_hasher(RandomState::new())),
            limiter: RateLimiter::new(0),
        };

        state.limiter.set_limit(4096);
        assert_eq!(state.limiter.limit(), 4096);
        assert!(state.all().is_empty());
        assert!(matches!(
            state.remove_connection("nope"),
            Err(ApiError::NotFound)
        ));
    }
}
