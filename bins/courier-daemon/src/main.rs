mod config;

use bytes::Bytes;
use config::CourierConfig;
use courier_core::config::CoreConfig;
use courier_core::directory::InMemoryDirectory;
use courier_core::messaging::MockEndpoint;
use courier_core::transfer::MockTransferService;
use courier_core::Core;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::LevelFilter;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config")]
    Config,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    let mut path = PathBuf::from("courier.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path).map_err(|_| DaemonError::Config)?;
    init_logging(&cfg);
    let core = init_core(&cfg).await;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = start_control_server(core, shutdown_rx).await;
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let _ = ctrl_c.as_mut().await;
    let _ = shutdown_tx.send(());
    let _ = server.await;
    Ok(())
}

fn init_logging(cfg: &CourierConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

async fn init_core(cfg: &CourierConfig) -> Arc<Core> {
    let directory = InMemoryDirectory::new();
    for account in &cfg.accounts {
        directory
            .register(account, Arc::new(MockEndpoint::new()))
            .await;
    }
    let transfers = MockTransferService::new();
    transfers.register().await;
    let core_cfg = CoreConfig {
        client_name: cfg.channel.client_name.clone(),
        ..CoreConfig::default()
    };
    Arc::new(Core::init(
        core_cfg,
        cfg.policy.clone(),
        Arc::new(directory),
        Arc::new(transfers),
    ))
}

async fn start_control_server(core: Arc<Core>, shutdown: oneshot::Receiver<()>) -> JoinHandle<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(_) => {
            return tokio::spawn(async move {
                let _ = shutdown.await;
            });
        }
    };
    tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let core_clone = core.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let core = core_clone.clone();
                                    async move { handle_request(core, req).await }
                                });
                                let _ = http1::Builder::new().serve_connection(io, service).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    })
}

#[derive(Deserialize)]
struct SendRequest {
    local_uid: String,
    remote_uid: String,
    text: String,
    event_id: Option<i64>,
}

async fn handle_request(
    core: Arc<Core>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match (req.method().as_str(), req.uri().path()) {
        ("GET", "/health") => Ok(Response::new(Full::from(
            serde_json::json!({"status":"ok"}).to_string(),
        ))),
        ("GET", "/stats") => {
            let body = serde_json::json!({
                "conversations": core.conversation_count().await,
            });
            Ok(Response::new(Full::from(body.to_string())))
        }
        ("POST", "/send") => {
            let bytes = req.into_body().collect().await?.to_bytes();
            match serde_json::from_slice::<SendRequest>(&bytes) {
                Ok(send) => {
                    let channel = core
                        .send_text(&send.local_uid, &send.remote_uid, &send.text, send.event_id)
                        .await;
                    let body = serde_json::json!({
                        "state": channel.state().await,
                        "sequence": channel.sequence().await,
                    });
                    Ok(Response::new(Full::from(body.to_string())))
                }
                Err(_) => Ok(Response::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .body(Full::from(Bytes::from_static(b"bad request")))
                    .unwrap()),
            }
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::from(Bytes::from_static(b"not found")))
            .unwrap()),
    }
}
