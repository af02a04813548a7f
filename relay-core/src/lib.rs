//! Client-side transfer engine.
//!
//! The frontend talks to the engine over two channels: commands in, events
//! out. Every event carries the session id it belongs to, so one stream
//! serves the whole UI. The engine runs one transfer at a time; starting a
//! second while one is live is refused.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

pub mod code;
pub mod crypto;
pub mod error;
pub mod progress;
pub mod quic;
pub mod receiver;
pub mod relay;
pub mod sender;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod wire;

pub use code::TransferCode;
pub use error::{CoreError, CoreResult};
pub use progress::{ConnectionType, EngineEvent, EventSink, ProgressEvent};
pub use quic::{DirectEndpoint, DirectOptions};
pub use session::{PipelineConfig, SessionPhase, TransferRole, TransferSession, DEFAULT_SERVER_URL};

/// Reply to a successful `StartSend`.
#[derive(Debug, Clone)]
pub struct SendStarted {
    pub code: String,
    pub session_id: String,
    /// Local QUIC listen port, for diagnostics.
    pub port: u16,
}

/// Commands from the frontend to the engine.
#[derive(Debug)]
pub enum EngineCommand {
    StartSend {
        file_paths: Vec<PathBuf>,
        signal_server_url: Option<String>,
        reply: oneshot::Sender<CoreResult<SendStarted>>,
    },
    StartReceive {
        code: String,
        save_dir: PathBuf,
        signal_server_url: Option<String>,
        reply: oneshot::Sender<CoreResult<String>>,
    },
    /// Answer a pending `FileOffer` event.
    AcceptTransfer { session_id: String, accept: bool },
    CancelTransfer { session_id: String },
}

/// Run the engine until the command channel closes.
pub async fn run_engine(
    cmd_rx: mpsc::Receiver<EngineCommand>,
    event_tx: mpsc::Sender<EngineEvent>,
) {
    run_engine_with(cmd_rx, event_tx, PipelineConfig::default()).await;
}

/// Like [`run_engine`] but with explicit pipeline defaults, so embedders
/// and tests can shrink timeouts or disable the direct path.
pub async fn run_engine_with(
    mut cmd_rx: mpsc::Receiver<EngineCommand>,
    event_tx: mpsc::Sender<EngineEvent>,
    defaults: PipelineConfig,
) {
    let mut active: Option<Arc<TransferSession>> = None;
    let mut accept_channels: HashMap<String, oneshot::Sender<bool>> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::channel::<String>(4);

    loop {
        tokio::select! {
            finished = done_rx.recv() => {
                if let Some(session_id) = finished {
                    if active.as_ref().is_some_and(|s| s.id == session_id) {
                        active = None;
                    }
                    accept_channels.remove(&session_id);
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { return };
                handle_command(
                    cmd,
                    &mut active,
                    &mut accept_channels,
                    &event_tx,
                    &done_tx,
                    &defaults,
                )
                .await;
            }
        }
    }
}

async fn handle_command(
    cmd: EngineCommand,
    active: &mut Option<Arc<TransferSession>>,
    accept_channels: &mut HashMap<String, oneshot::Sender<bool>>,
    event_tx: &mpsc::Sender<EngineEvent>,
    done_tx: &mpsc::Sender<String>,
    defaults: &PipelineConfig,
) {
    match cmd {
        EngineCommand::StartSend {
            file_paths,
            signal_server_url,
            reply,
        } => {
            let started = start_send(
                file_paths,
                signal_server_url,
                active,
                event_tx,
                done_tx,
                defaults,
            )
            .await;
            let _ = reply.send(started);
        }

        EngineCommand::StartReceive {
            code,
            save_dir,
            signal_server_url,
            reply,
        } => {
            let started = start_receive(
                code,
                save_dir,
                signal_server_url,
                active,
                accept_channels,
                event_tx,
                done_tx,
                defaults,
            )
            .await;
            let _ = reply.send(started);
        }

        EngineCommand::AcceptTransfer { session_id, accept } => {
            if let Some(tx) = accept_channels.remove(&session_id) {
                let _ = tx.send(accept);
            } else {
                error!("no pending offer for session {session_id}");
            }
        }

        EngineCommand::CancelTransfer { session_id } => {
            match active.as_ref() {
                Some(session) if session.id == session_id => {
                    info!("cancelling transfer {session_id}");
                    session.request_cancel();
                }
                _ => error!("session not found: {session_id}"),
            }
        }
    }
}

async fn start_send(
    file_paths: Vec<PathBuf>,
    signal_server_url: Option<String>,
    active: &mut Option<Arc<TransferSession>>,
    event_tx: &mpsc::Sender<EngineEvent>,
    done_tx: &mpsc::Sender<String>,
    defaults: &PipelineConfig,
) -> CoreResult<SendStarted> {
    if active.is_some() {
        return Err(CoreError::Transfer("a transfer is already in progress".into()));
    }
    if file_paths.is_empty() {
        return Err(CoreError::Transfer("no files selected".into()));
    }
    for path in &file_paths {
        if tokio::fs::metadata(path).await.is_err() {
            return Err(CoreError::Transfer(format!(
                "path not found: {}",
                path.display()
            )));
        }
    }

    let code = TransferCode::generate();
    let session = Arc::new(TransferSession::new(TransferRole::Sender, code.clone()));
    let quic = DirectEndpoint::bind(0)?;
    let port = quic.local_addr()?.port();

    let started = SendStarted {
        code: code.to_string(),
        session_id: session.id.clone(),
        port,
    };
    info!("send: session {} with code '{}'", session.id, started.code);

    let mut config = defaults.clone();
    if let Some(url) = signal_server_url {
        config.server_url = url;
    }

    *active = Some(session.clone());
    let events = EventSink::new(session.id.clone(), event_tx.clone());
    let done = done_tx.clone();
    tokio::spawn(async move {
        let result = sender::run_send(file_paths, session.clone(), quic, config, events.clone()).await;
        finish_session(&session, result, &events).await;
        let _ = done.send(session.id.clone()).await;
    });

    Ok(started)
}

#[allow(clippy::too_many_arguments)]
async fn start_receive(
    code: String,
    save_dir: PathBuf,
    signal_server_url: Option<String>,
    active: &mut Option<Arc<TransferSession>>,
    accept_channels: &mut HashMap<String, oneshot::Sender<bool>>,
    event_tx: &mpsc::Sender<EngineEvent>,
    done_tx: &mpsc::Sender<String>,
    defaults: &PipelineConfig,
) -> CoreResult<String> {
    if active.is_some() {
        return Err(CoreError::Transfer("a transfer is already in progress".into()));
    }

    let parsed = TransferCode::parse(&code)?;
    if !save_dir.is_dir() {
        tokio::fs::create_dir_all(&save_dir)
            .await
            .map_err(|e| CoreError::Transfer(format!("cannot create save directory: {e}")))?;
    }

    let session = Arc::new(TransferSession::new(TransferRole::Receiver, parsed));
    let session_id = session.id.clone();
    info!("receive: session {session_id} with code '{code}'");

    let (accept_tx, accept_rx) = oneshot::channel();
    accept_channels.insert(session_id.clone(), accept_tx);

    let mut config = defaults.clone();
    if let Some(url) = signal_server_url {
        config.server_url = url;
    }

    *active = Some(session.clone());
    let events = EventSink::new(session_id.clone(), event_tx.clone());
    let done = done_tx.clone();
    tokio::spawn(async move {
        let result =
            receiver::run_receive(save_dir, session.clone(), config, accept_rx, events.clone())
                .await;
        finish_session(&session, result, &events).await;
        let _ = done.send(session.id.clone()).await;
    });

    Ok(session_id)
}

/// Fold a pipeline result into the terminal phase and event. Resources are
/// already released by the time the pipeline returns.
async fn finish_session(session: &TransferSession, result: CoreResult<()>, events: &EventSink) {
    match result {
        Ok(()) => {}
        Err(CoreError::Cancelled) => {
            session.set_phase(SessionPhase::Cancelled).await;
            events.state("cancelled").await;
        }
        Err(e) => {
            error!("session {} failed: {e}", session.id);
            session.set_phase(SessionPhase::Errored).await;
            events
                .emit(ProgressEvent::Error {
                    message: e.to_string(),
                })
                .await;
        }
    }
}
