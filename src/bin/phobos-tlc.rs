//! TLC daemon binary: one instance per tape library, serving
//! the TLC wire protocol over a TCP listener bound to `lrs.server_addr`'s
//! host and the library's configured port.

use std::time::Duration;

use anyhow::{format_err, Error};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};

use phobos_dss::DssStore;
use phobos_proto::tlc::{TlcRequest, TlcResponse};
use phobos_proto::{check_version, Envelope, JsonFrameCodec, WireError};
use phobos_scsi::RetryPolicy;
use phobos::logging::{self, init_daemon_logger};
use phobos::TlcState;

fn usage() -> ! {
    eprintln!("usage: phobos-tlc <library-name>");
    eprintln!("       phobos-tlc --help | --version");
    std::process::exit(1);
}

fn usage_ok() -> ! {
    println!("usage: phobos-tlc <library-name>");
    println!("       phobos-tlc --help | --version");
    std::process::exit(0);
}

fn main() -> Result<(), Error> {
    let arg = std::env::args().nth(1).unwrap_or_else(|| usage());
    if arg == "--help" {
        usage_ok();
    }
    if arg == "--version" {
        println!("phobos-tlc {}", phobos_buildcfg::PHOBOS_PKG_VERSION);
        return Ok(());
    }

    let main_config = phobos_config::main_config::load()?;
    init_daemon_logger("phobos-tlc", logging::resolve_level(main_config.raw_get("global", "log_level")));

    let library_name = arg;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(library_name, main_config))
}

async fn run(library_name: String, main_config: phobos_config::main_config::PhobosConfig) -> Result<(), Error> {
    let section = phobos_config::main_config::PhobosConfig::library_section(&library_name);

    let device_path = main_config
        .raw_get(&section, "lib_device")
        .ok_or_else(|| format_err!("[{section}] lib_device is not configured"))?
        .to_string();
    let bind_addr = main_config.get_or(&section, "bind_addr", "127.0.0.1:0");

    let retry_policy = RetryPolicy {
        retry_count: main_config.get_u64(&section, "retry_count", 5)? as u32,
        retry_short: Duration::from_secs(main_config.get_u64(&section, "retry_short", 1)?),
        retry_long: Duration::from_secs(main_config.get_u64(&section, "retry_long", 5)?),
    };

    // 0 (the default) means "unlimited": try the whole window first and
    // only halve on failure, as `query_elements` already does.
    let max_element_status = main_config.get_u64(&section, "max_element_status", 0)?;
    let max_chunk = if max_element_status == 0 { None } else { Some(max_element_status as u16) };
    let sep_sn_query = main_config.get_bool(&section, "sep_sn_query", false)?;

    let dss = DssStore::new(phobos_buildcfg::PHOBOS_STATE_DIR_M!());

    let state = TlcState::open(&library_name, &device_path, retry_policy, max_chunk, sep_sn_query, dss)?;
    let state = tokio::sync::Mutex::new(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    log::info!("TLC for library '{library_name}' listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        log::debug!("accepted TLC connection from {peer}");
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, JsonFrameCodec::<Envelope<TlcRequest>>::default());
        let mut writer = FramedWrite::new(write_half, JsonFrameCodec::<Envelope<TlcResponse>>::default());

        // TLC is strictly single-threaded cooperative: each connection
        // is drained to completion before the next is accepted.
        while let Some(frame) = reader.next().await {
            let envelope = match frame {
                Ok(env) => env,
                Err(err) => {
                    log::warn!("decoding request from {peer} failed: {err}");
                    break;
                }
            };

            if let Err(err) = check_version(envelope.version) {
                writer.send(Envelope::new(envelope.id, TlcResponse::Error(WireError::from_phobos("envelope", &err)))).await.ok();
                break;
            }

            let response = state.lock().await.handle(envelope.body);
            if let Err(err) = writer.send(Envelope::new(envelope.id, response)).await {
                log::warn!("sending response to {peer} failed: {err}");
                break;
            }
        }
    }
}
