//! Admin CLI: talks to a running LRS over its UNIX socket, to a TLC
//! over TCP, or directly to the device/medium catalog and the DSS lock
//! store for operations no daemon needs to be up for.
//!
//! Exit code is 0 on success, otherwise the first failure's negated POSIX
//! errno (already capped to 125, per `phobos_api_types::PhobosError::rc`)
//! -- generic (non-protocol) errors exit 1.

use std::time::Duration;

use anyhow::{bail, format_err, Error};
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use proxmox_router::cli::*;
use proxmox_schema::api;

use phobos_api_types::{AdminStatus, DeviceConfig, MediumConfig, MediumStats, ResourceFamily};
use phobos_dss::DssStore;
use phobos_proto::lrs::NotifyOp;
use phobos_proto::tlc::{TlcRequest, TlcResponse};
use phobos_proto::{Envelope, JsonFrameCodec, LrsRequest, LrsResponse};
use phobos::lrs::tlc_client::TlcClient;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn main_config() -> Result<phobos_config::main_config::PhobosConfig, Error> {
    phobos_config::main_config::load()
}

fn lrs_socket_path() -> Result<String, Error> {
    Ok(main_config()?.get_or("lrs", "server_socket", phobos_buildcfg::LRS_SOCKET_PATH))
}

fn dss_store() -> Result<DssStore, Error> {
    Ok(DssStore::new(phobos_buildcfg::PHOBOS_STATE_DIR_M!()))
}

/// One-shot request/response against the running LRS. There's no benefit
/// in keeping the connection open past a single CLI invocation, unlike the
/// daemon-internal [`phobos::lrs::tlc_client::TlcClient`].
async fn lrs_call(req: LrsRequest) -> Result<LrsResponse, Error> {
    let socket = lrs_socket_path()?;
    let stream = UnixStream::connect(&socket)
        .await
        .map_err(|err| format_err!("connecting to LRS at {socket} failed: {err}"))?;
    let (read_half, write_half) = stream.into_split();
    let mut writer = FramedWrite::new(write_half, JsonFrameCodec::<Envelope<LrsRequest>>::default());
    let mut reader = FramedRead::new(read_half, JsonFrameCodec::<Envelope<LrsResponse>>::default());

    writer.send(Envelope::new(1, req)).await?;
    let envelope = reader
        .next()
        .await
        .ok_or_else(|| format_err!("LRS closed the connection without replying"))??;
    Ok(envelope.body)
}

/// Resolve a library's TLC address from `[tlc_<library>] bind_addr` and
/// connect, exactly as `phobos-lrs` does at startup.
async fn tlc_call(library: &str, req: TlcRequest) -> Result<TlcResponse, Error> {
    let config = main_config()?;
    let section = phobos_config::main_config::PhobosConfig::library_section(library);
    let addr = config
        .raw_get(&section, "bind_addr")
        .ok_or_else(|| format_err!("[{section}] bind_addr is not configured"))?;
    let mut client = TlcClient::connect(addr, DEFAULT_REQUEST_TIMEOUT).await?;
    client.call(req).await
}

/// Turn a wire-level `LrsResponse::Error`/`TlcResponse::Error` into a
/// process exit: one-line message to stderr, rc as the exit code.
fn exit_with_rc(message: &str, rc: i32) -> ! {
    eprintln!("{message}");
    std::process::exit(rc.min(125));
}

fn device_for_serial(serial: &str) -> Result<DeviceConfig, Error> {
    let data = phobos_config::device::config()?;
    data.lookup("device", serial)
}

// ---------------------------------------------------------------- ping

#[api(input: { properties: {} })]
/// Ping the local LRS daemon.
async fn ping_lrs() -> Result<(), Error> {
    match lrs_call(LrsRequest::Ping).await? {
        LrsResponse::PingResp => {
            println!("lrs: up");
            Ok(())
        }
        LrsResponse::Error(err) => exit_with_rc(&err.message, err.rc),
        other => bail!("unexpected LRS response: {other:?}"),
    }
}

#[api(
    input: {
        properties: {
            library: {
                description: "Tape library name (its TLC section in phobos.conf).",
            },
        },
    },
)]
/// Ping a library's TLC daemon.
async fn ping_tlc(library: String) -> Result<(), Error> {
    match tlc_call(&library, TlcRequest::Ping).await? {
        TlcResponse::PingResp { library_is_up } => {
            println!("tlc '{library}': up, library_is_up={library_is_up}");
            Ok(())
        }
        TlcResponse::Error(err) => exit_with_rc(&err.message, err.rc),
        other => bail!("unexpected TLC response: {other:?}"),
    }
}

fn ping_commands() -> CliCommandMap {
    CliCommandMap::new()
        .insert("lrs", CliCommand::new(&API_METHOD_PING_LRS))
        .insert("tlc", CliCommand::new(&API_METHOD_PING_TLC).arg_param(&["library"]))
}

// -------------------------------------------------------------- device

#[api(
    input: {
        properties: {
            serial: { description: "Drive serial number." },
            path: { description: "Device node path (e.g. /dev/sgN or the rados pool name)." },
            family: { description: "Resource family: tape, directory or rados_pool." },
            model: { description: "Drive model string.", optional: true },
            library: { description: "Owning tape library, for the tape family.", optional: true },
        },
    },
)]
/// Add a drive to the device catalog.
fn device_add(
    serial: String,
    path: String,
    family: String,
    model: Option<String>,
    library: Option<String>,
) -> Result<(), Error> {
    let family: ResourceFamily = family.parse()?;
    let _lock = phobos_config::device::lock()?;
    let mut data = phobos_config::device::config()?;

    if data.sections.contains_key(&serial) {
        bail!("drive '{serial}' already exists");
    }

    let config = DeviceConfig {
        family,
        serial: serial.clone(),
        model: model.unwrap_or_else(|| "unknown".to_string()),
        path,
        adm_status: AdminStatus::Unlocked,
        host: None,
        library,
        changer_drivenum: None,
    };
    data.set_data(&serial, "device", &config)?;
    phobos_config::device::save_config(&data)?;
    println!("added drive '{serial}'");
    Ok(())
}

#[api(input: { properties: { serial: { description: "Drive serial number." } } })]
/// Remove a drive from the device catalog.
fn device_delete(serial: String) -> Result<(), Error> {
    let _lock = phobos_config::device::lock()?;
    let mut data = phobos_config::device::config()?;
    if data.sections.remove(&serial).is_none() {
        bail!("no such drive '{serial}'");
    }
    phobos_config::device::save_config(&data)?;
    println!("removed drive '{serial}'");
    Ok(())
}

async fn device_set_adm_status(serial: String, status: AdminStatus, op: NotifyOp) -> Result<(), Error> {
    {
        let _lock = phobos_config::device::lock()?;
        let mut data = phobos_config::device::config()?;
        let mut config: DeviceConfig = data.lookup("device", &serial)?;
        config.adm_status = status;
        data.set_data(&serial, "device", &config)?;
        phobos_config::device::save_config(&data)?;
    }

    match lrs_call(LrsRequest::Notify { op, rsrc_id: serial, wait: None }).await {
        Ok(LrsResponse::NotifyResp) => {}
        Ok(LrsResponse::Error(err)) => exit_with_rc(&err.message, err.rc),
        Ok(other) => bail!("unexpected LRS response: {other:?}"),
        // The catalog update above is authoritative; a down LRS just means
        // it will pick up the new status on its next startup.
        Err(err) => log::warn!("catalog updated, but notifying the running LRS failed: {err}"),
    }
    Ok(())
}

#[api(input: { properties: { serial: { description: "Drive serial number." } } })]
/// Administratively lock a drive (refuse new work on it).
async fn device_lock(serial: String) -> Result<(), Error> {
    device_set_adm_status(serial, AdminStatus::Locked, NotifyOp::DeviceLock).await
}

#[api(input: { properties: { serial: { description: "Drive serial number." } } })]
/// Administratively unlock a drive.
async fn device_unlock(serial: String) -> Result<(), Error> {
    device_set_adm_status(serial, AdminStatus::Unlocked, NotifyOp::DeviceUnlock).await
}

#[api(
    input: {
        properties: {
            serial: { description: "Drive serial number." },
            host: { description: "New owning host." },
        },
    },
)]
/// Reassign a drive's owning host in the catalog (no live drive handoff:
/// the old host's LRS must have released it first).
fn device_migrate(serial: String, host: String) -> Result<(), Error> {
    let _lock = phobos_config::device::lock()?;
    let mut data = phobos_config::device::config()?;
    let mut config: DeviceConfig = data.lookup("device", &serial)?;
    config.host = Some(host.clone());
    data.set_data(&serial, "device", &config)?;
    phobos_config::device::save_config(&data)?;
    println!("drive '{serial}' now owned by '{host}'");
    Ok(())
}

#[api(
    input: {
        properties: {
            family: { description: "Resource family to report on: tape, directory or rados_pool." },
        },
    },
)]
/// Show live per-drive state as tracked by the local LRS.
async fn device_status(family: String) -> Result<(), Error> {
    let family: ResourceFamily = family.parse()?;
    match lrs_call(LrsRequest::Monitor { family }).await? {
        LrsResponse::MonitorResp { status } => {
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        LrsResponse::Error(err) => exit_with_rc(&err.message, err.rc),
        other => bail!("unexpected LRS response: {other:?}"),
    }
}

fn device_commands() -> CliCommandMap {
    CliCommandMap::new()
        .insert("add", CliCommand::new(&API_METHOD_DEVICE_ADD).arg_param(&["serial", "path", "family"]))
        .insert("delete", CliCommand::new(&API_METHOD_DEVICE_DELETE).arg_param(&["serial"]))
        .insert("lock", CliCommand::new(&API_METHOD_DEVICE_LOCK).arg_param(&["serial"]))
        .insert("unlock", CliCommand::new(&API_METHOD_DEVICE_UNLOCK).arg_param(&["serial"]))
        .insert("migrate", CliCommand::new(&API_METHOD_DEVICE_MIGRATE).arg_param(&["serial", "host"]))
        .insert("status", CliCommand::new(&API_METHOD_DEVICE_STATUS).arg_param(&["family"]))
}

// --------------------------------------------------------------- drive
//
// These talk directly to a TLC; they act on the physical changer, not on
// the LRS's notion of the drive.

#[api(input: { properties: { serial: { description: "Drive serial number." } } })]
/// Resolve a drive's element address and loaded-medium status via its TLC.
async fn drive_lookup(serial: String) -> Result<(), Error> {
    let device = device_for_serial(&serial)?;
    let library = device.library.ok_or_else(|| format_err!("drive '{serial}' has no owning library"))?;
    match tlc_call(&library, TlcRequest::DriveLookup { serial }).await? {
        TlcResponse::DriveLookupResp { drive_address, first_drive_address, loaded, loaded_medium_label } => {
            println!("drive_address={drive_address} first_drive_address={first_drive_address} loaded={loaded} medium={loaded_medium_label:?}");
            Ok(())
        }
        TlcResponse::Error(err) => exit_with_rc(&err.message, err.rc),
        other => bail!("unexpected TLC response: {other:?}"),
    }
}

#[api(
    input: {
        properties: {
            serial: { description: "Drive serial number." },
            label: { description: "Tape label to load." },
        },
    },
)]
/// Load a tape into a drive via the changer, bypassing the LRS scheduler.
async fn drive_load(serial: String, label: String) -> Result<(), Error> {
    let device = device_for_serial(&serial)?;
    let library = device.library.ok_or_else(|| format_err!("drive '{serial}' has no owning library"))?;
    match tlc_call(&library, TlcRequest::Load { drive_serial: serial, tape_label: label }).await? {
        TlcResponse::LoadResp { drive_address, slot_address } => {
            println!("loaded: drive_address={drive_address} slot_address={slot_address}");
            Ok(())
        }
        TlcResponse::Error(err) => exit_with_rc(&err.message, err.rc),
        other => bail!("unexpected TLC response: {other:?}"),
    }
}

#[api(input: { properties: { serial: { description: "Drive serial number." } } })]
/// Unload whatever tape a drive currently holds, via the changer.
async fn drive_unload(serial: String) -> Result<(), Error> {
    let device = device_for_serial(&serial)?;
    let library = device.library.ok_or_else(|| format_err!("drive '{serial}' has no owning library"))?;
    match tlc_call(&library, TlcRequest::Unload { drive_serial: serial, expected_label: None }).await? {
        TlcResponse::UnloadResp { label, destination_address } => {
            println!("unloaded '{label}' to slot address {destination_address}");
            Ok(())
        }
        TlcResponse::Error(err) => exit_with_rc(&err.message, err.rc),
        other => bail!("unexpected TLC response: {other:?}"),
    }
}

fn drive_commands() -> CliCommandMap {
    CliCommandMap::new()
        .insert("lookup", CliCommand::new(&API_METHOD_DRIVE_LOOKUP).arg_param(&["serial"]))
        .insert("load", CliCommand::new(&API_METHOD_DRIVE_LOAD).arg_param(&["serial", "label"]))
        .insert("unload", CliCommand::new(&API_METHOD_DRIVE_UNLOAD).arg_param(&["serial"]))
}

// ---------------------------------------------------------------- tape

#[api(
    input: {
        properties: {
            label: { description: "Medium label/barcode." },
            family: { description: "Resource family: tape, directory or rados_pool." },
            library: { description: "Owning tape library, for the tape family.", optional: true },
        },
    },
)]
/// Add a medium to the catalog, blank and unlocked.
fn tape_add(label: String, family: String, library: Option<String>) -> Result<(), Error> {
    let family: ResourceFamily = family.parse()?;
    let _lock = phobos_config::medium::lock()?;
    let mut data = phobos_config::medium::config()?;

    if data.sections.contains_key(&label) {
        bail!("medium '{label}' already exists");
    }

    let fs_type = match family {
        ResourceFamily::Tape => phobos_api_types::FsType::Ltfs,
        ResourceFamily::Directory => phobos_api_types::FsType::Posix,
        ResourceFamily::RadosPool => phobos_api_types::FsType::Rados,
    };
    let addressing = match family {
        ResourceFamily::Tape => phobos_api_types::AddressingScheme::Hash1,
        ResourceFamily::Directory => phobos_api_types::AddressingScheme::Path,
        ResourceFamily::RadosPool => phobos_api_types::AddressingScheme::Opaque,
    };

    let config = MediumConfig {
        family,
        label: label.clone(),
        library,
        adm_status: AdminStatus::Unlocked,
        fs_status: phobos_api_types::FsStatus::Blank,
        fs_type,
        addressing,
        stats: MediumStats::default(),
        tags: Vec::new(),
        host: None,
    };
    data.set_data(&label, "medium", &config)?;
    phobos_config::medium::save_config(&data)?;
    println!("added medium '{label}'");
    Ok(())
}

fn parse_fs_type(s: &str) -> Result<phobos_api_types::FsType, Error> {
    match s {
        "ltfs" => Ok(phobos_api_types::FsType::Ltfs),
        "posix" => Ok(phobos_api_types::FsType::Posix),
        "rados" => Ok(phobos_api_types::FsType::Rados),
        other => bail!("unknown filesystem type '{other}'"),
    }
}

#[api(
    input: {
        properties: {
            label: { description: "Medium label to format." },
            "fs-type": { description: "Filesystem to write: ltfs, posix or rados." },
            unlock: { description: "Unlock the medium after a successful format.", optional: true, default: false },
            force: { description: "Format even if the medium already holds data.", optional: true, default: false },
        },
    },
)]
/// Format a medium through the LRS's FORMAT flow.
async fn tape_format(label: String, fs_type: String, unlock: bool, force: bool) -> Result<(), Error> {
    let fs_type = parse_fs_type(&fs_type)?;
    match lrs_call(LrsRequest::Format { medium_id: label, fs_type, unlock: Some(unlock), force: Some(force) }).await? {
        LrsResponse::FormatResp { medium_id } => {
            println!("formatted '{medium_id}'");
            Ok(())
        }
        LrsResponse::Error(err) => exit_with_rc(&err.message, err.rc),
        other => bail!("unexpected LRS response: {other:?}"),
    }
}

fn medium_set_adm_status(label: String, status: AdminStatus) -> Result<(), Error> {
    let _lock = phobos_config::medium::lock()?;
    let mut data = phobos_config::medium::config()?;
    let mut config: MediumConfig = data.lookup("medium", &label)?;
    config.adm_status = status;
    data.set_data(&label, "medium", &config)?;
    phobos_config::medium::save_config(&data)?;
    Ok(())
}

#[api(input: { properties: { label: { description: "Medium label." } } })]
/// Administratively lock a medium (refuse new write/format admission).
fn tape_lock(label: String) -> Result<(), Error> {
    medium_set_adm_status(label.clone(), AdminStatus::Locked)?;
    println!("locked medium '{label}'");
    Ok(())
}

#[api(input: { properties: { label: { description: "Medium label." } } })]
/// Administratively unlock a medium.
fn tape_unlock(label: String) -> Result<(), Error> {
    medium_set_adm_status(label.clone(), AdminStatus::Unlocked)?;
    println!("unlocked medium '{label}'");
    Ok(())
}

#[api(input: { properties: {} })]
/// List every medium in the catalog with its status.
fn tape_list() -> Result<(), Error> {
    let data = phobos_config::medium::config()?;
    for label in phobos_config::medium::list_labels(&data) {
        let config: MediumConfig = data.lookup("medium", &label)?;
        println!(
            "{:<20} family={:<10} adm={:?} fs={:?} host={}",
            config.label,
            config.family,
            config.adm_status,
            config.fs_status,
            config.host.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn tape_commands() -> CliCommandMap {
    CliCommandMap::new()
        .insert("add", CliCommand::new(&API_METHOD_TAPE_ADD).arg_param(&["label", "family"]))
        .insert("format", CliCommand::new(&API_METHOD_TAPE_FORMAT).arg_param(&["label", "fs-type"]))
        .insert("lock", CliCommand::new(&API_METHOD_TAPE_LOCK).arg_param(&["label"]))
        .insert("unlock", CliCommand::new(&API_METHOD_TAPE_UNLOCK).arg_param(&["label"]))
        .insert("list", CliCommand::new(&API_METHOD_TAPE_LIST))
}

// ---------------------------------------------------------------- lock

#[api(
    input: {
        properties: {
            global: { description: "Confirm this wipes locks for every host, not just this one.", optional: true, default: false },
            force: { description: "Confirm the wipe even though no liveness check is performed.", optional: true, default: false },
        },
    },
)]
/// Wipe every DSS lock. Both flags exist so an operator can't trigger this
/// by a bare `phobos lock clean` fat-fingered onto a live cluster.
fn lock_clean(global: bool, force: bool) -> Result<(), Error> {
    let removed = dss_store()?.clean_all(global, force)?;
    println!("removed {removed} lock(s)");
    Ok(())
}

fn lock_commands() -> CliCommandMap {
    CliCommandMap::new().insert("clean", CliCommand::new(&API_METHOD_LOCK_CLEAN))
}

// ---------------------------------------------------------------- logs

#[api(input: { properties: {} })]
/// Dump the DSS out-of-band event log (changer and adapter operation records).
fn logs_dump() -> Result<(), Error> {
    let path = std::path::Path::new(phobos_buildcfg::PHOBOS_STATE_DIR_M!()).join(phobos_dss::DSS_EVENT_LOG_FILENAME);
    match proxmox_sys::fs::file_read_optional_string(&path)? {
        Some(content) => print!("{content}"),
        None => println!("(event log is empty)"),
    }
    Ok(())
}

#[api(input: { properties: {} })]
/// Truncate the DSS event log.
fn logs_clear() -> Result<(), Error> {
    let path = std::path::Path::new(phobos_buildcfg::PHOBOS_STATE_DIR_M!()).join(phobos_dss::DSS_EVENT_LOG_FILENAME);
    std::fs::File::create(&path)?;
    println!("event log cleared");
    Ok(())
}

fn logs_commands() -> CliCommandMap {
    CliCommandMap::new()
        .insert("dump", CliCommand::new(&API_METHOD_LOGS_DUMP))
        .insert("clear", CliCommand::new(&API_METHOD_LOGS_CLEAR))
}

// ------------------------------------------------------------------ lib

#[api(input: { properties: { library: { description: "Tape library name." } } })]
/// Ask a TLC to rescan its changer and refresh the in-memory library model.
async fn lib_scan(library: String) -> Result<(), Error> {
    match tlc_call(&library, TlcRequest::Refresh).await? {
        TlcResponse::RefreshResp => {
            println!("library '{library}' rescanned");
            Ok(())
        }
        TlcResponse::Error(err) => exit_with_rc(&err.message, err.rc),
        other => bail!("unexpected TLC response: {other:?}"),
    }
}

fn lib_commands() -> CliCommandMap {
    CliCommandMap::new().insert("scan", CliCommand::new(&API_METHOD_LIB_SCAN).arg_param(&["library"]))
}

// --------------------------------------------------------------- object
//
// The object/extent metadata catalog and its SQL schema live outside this
// tree entirely -- there's no catalog module here for these verbs to read
// or write. They stay in the command tree so `phobos --help` lists the
// full admin surface, but each one reports the gap rather than faking a
// catalog that doesn't exist.

fn object_gap() -> Result<(), Error> {
    bail!("object/extent metadata catalog is not available: no catalog backend is configured in this build")
}

#[api(input: { properties: {} })]
fn object_put() -> Result<(), Error> { object_gap() }
#[api(input: { properties: {} })]
fn object_get() -> Result<(), Error> { object_gap() }
#[api(input: { properties: {} })]
fn object_getmd() -> Result<(), Error> { object_gap() }
#[api(input: { properties: {} })]
fn object_delete() -> Result<(), Error> { object_gap() }
#[api(input: { properties: {} })]
fn object_list() -> Result<(), Error> { object_gap() }
#[api(input: { properties: {} })]
fn extent_list() -> Result<(), Error> { object_gap() }
#[api(input: { properties: {} })]
fn dir_status() -> Result<(), Error> { object_gap() }

fn object_commands() -> CliCommandMap {
    CliCommandMap::new()
        .insert("put", CliCommand::new(&API_METHOD_OBJECT_PUT))
        .insert("get", CliCommand::new(&API_METHOD_OBJECT_GET))
        .insert("getmd", CliCommand::new(&API_METHOD_OBJECT_GETMD))
        .insert("delete", CliCommand::new(&API_METHOD_OBJECT_DELETE))
        .insert("list", CliCommand::new(&API_METHOD_OBJECT_LIST))
}

fn extent_commands() -> CliCommandMap {
    CliCommandMap::new().insert("list", CliCommand::new(&API_METHOD_EXTENT_LIST))
}

fn dir_commands() -> CliCommandMap {
    CliCommandMap::new().insert("status", CliCommand::new(&API_METHOD_DIR_STATUS))
}

// ------------------------------------------------------------------ main

fn main() {
    init_cli_logger("PHOBOS_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert("ping", ping_commands())
        .insert("device", device_commands())
        .insert("drive", drive_commands())
        .insert("tape", tape_commands())
        .insert("dir", dir_commands())
        .insert("object", object_commands())
        .insert("extent", extent_commands())
        .insert("lock", lock_commands())
        .insert("logs", logs_commands())
        .insert("lib", lib_commands());

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| tokio::runtime::Runtime::new().unwrap().block_on(future)),
    );
}
