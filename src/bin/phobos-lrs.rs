//! LRS daemon binary: the per-host local resource scheduler. Accepts
//! client connections on a UNIX socket, dispatches each request through
//! [`phobos::LrsState::handle`], and drains cleanly on SIGTERM/SIGINT.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use futures::{SinkExt, StreamExt};
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};

use phobos::logging::{self, init_daemon_logger};
use phobos::lrs::daemon::{handle_format_concurrent, load_all_media, load_local_devices};
use phobos::{LrsConfig, LrsState};
use phobos_proto::{check_version, Envelope, JsonFrameCodec, LrsRequest, LrsResponse, WireError};

fn main() -> Result<(), Error> {
    let main_config = phobos_config::main_config::load()?;
    init_daemon_logger("phobos-lrs", logging::resolve_level(main_config.raw_get("global", "log_level")));

    tokio::runtime::Builder::new_multi_thread().enable_all().build()?.block_on(run(main_config))
}

async fn run(main_config: phobos_config::main_config::PhobosConfig) -> Result<(), Error> {
    let server_socket = main_config.get_or("lrs", "server_socket", phobos_buildcfg::LRS_SOCKET_PATH);
    let tlc_addr = main_config.raw_get("lrs", "tlc_addr").map(str::to_string);
    let tlc_required = main_config.get_bool("lrs", "tlc_required", false)?;
    let request_timeout = Duration::from_secs(main_config.get_u64("lrs", "request_timeout", 120)?);
    let shutdown_grace_period = Duration::from_secs(main_config.get_u64("lrs", "shutdown_grace_period", 30)?);
    // 0 (the default) means "unbounded": every FORMAT in flight is admitted
    // at once, per nb_streams' documented semantics.
    let nb_streams = main_config.get_u64("lrs", "nb_streams", 0)? as u32;

    let lock_path = main_config.get_or("lrs", "lock_file", phobos_buildcfg::LRS_LOCK_FILE);
    if let Some(parent) = std::path::Path::new(&lock_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    // Exclusive, short-timeout flock: a second LRS on this host must fail
    // fast rather than wait for the first to exit.
    let _lock_guard = phobos_config::open_phobos_lockfile(&lock_path, Some(Duration::from_secs(2)), true)
        .map_err(|err| anyhow::format_err!("another phobos-lrs is already running on this host: {err}"))?;

    let hostname = proxmox_sys::nodename().to_string();
    let catalog = load_local_devices(&hostname)?;
    let media = load_all_media()?;

    let state_dir = phobos_buildcfg::PHOBOS_STATE_DIR_M!();
    let config = LrsConfig { request_timeout, shutdown_grace_period, nb_streams };
    let state = LrsState::startup(std::path::Path::new(state_dir), &catalog, media, tlc_addr.as_deref(), tlc_required, config).await?;
    let state = Arc::new(Mutex::new(state));

    if let Some(parent) = std::path::Path::new(&server_socket).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    std::fs::remove_file(&server_socket).ok();
    let listener = UnixListener::bind(&server_socket)?;
    log::info!("LRS listening on {server_socket}");

    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(err) = serve_client(stream, state).await {
                        log::warn!("client connection ended with error: {err}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("received SIGINT, shutting down");
                break;
            }
            _ = terminate.recv() => {
                log::info!("received SIGTERM, shutting down");
                break;
            }
        }
    }

    state.lock().await.stop_accepting();
    drop(listener);
    std::fs::remove_file(&server_socket).ok();
    state.lock().await.shutdown().await?;
    drop(_lock_guard);
    std::fs::remove_file(&lock_path).ok();
    Ok(())
}

/// Drains one client connection. Every request type except FORMAT is
/// handled to completion before the next frame is even read -- that's the
/// ordering the wire protocol promises for a non-pipelining client. FORMAT
/// is the one request kind a client may legitimately pipeline (`nb_streams`
/// outstanding at once), so it is dispatched onto its own task against a
/// shared, mutex-guarded writer: several formats make real concurrent
/// progress, gated by `LrsState::stream_gate`, while their responses are
/// still correlated back to the right request by `Envelope.id`.
async fn serve_client(stream: tokio::net::UnixStream, state: Arc<Mutex<LrsState>>) -> Result<(), Error> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonFrameCodec::<Envelope<LrsRequest>>::default());
    let writer = Arc::new(Mutex::new(FramedWrite::new(write_half, JsonFrameCodec::<Envelope<LrsResponse>>::default())));

    let mut formats_in_flight = Vec::new();

    while let Some(frame) = reader.next().await {
        let envelope = frame?;
        if let Err(err) = check_version(envelope.version) {
            writer.lock().await.send(Envelope::new(envelope.id, LrsResponse::Error(WireError::from_phobos("envelope", &err)))).await?;
            break;
        }
        if !state.lock().await.is_accepting() {
            break;
        }

        match envelope.body {
            LrsRequest::Format { medium_id, fs_type: _, unlock, force } => {
                let state = Arc::clone(&state);
                let writer = Arc::clone(&writer);
                let id = envelope.id;
                formats_in_flight.push(tokio::spawn(async move {
                    let response = handle_format_concurrent(state, medium_id, unlock.unwrap_or(false), force.unwrap_or(false)).await;
                    if let Err(err) = writer.lock().await.send(Envelope::new(id, response)).await {
                        log::warn!("sending FORMAT response failed: {err}");
                    }
                }));
            }
            req => {
                let response = state.lock().await.handle(req).await;
                if let Err(err) = writer.lock().await.send(Envelope::new(envelope.id, response)).await {
                    log::warn!("sending response failed: {err}");
                    break;
                }
            }
        }
    }

    for handle in formats_in_flight {
        handle.await.ok();
    }
    Ok(())
}
