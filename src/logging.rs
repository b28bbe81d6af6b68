//! Daemon logging setup.
//!
//! Daemons log to syslog the same way long-running server
//! binaries in this stack do (`syslog::init` at facility `LOG_DAEMON`). CLI tools use
//! `proxmox_router::cli::init_cli_logger` instead (env_logger against
//! stderr), since there is no syslog worth writing to from an interactive
//! shell.

/// Resolves the daemon log level: `PHOBOS_LOG` wins if set, otherwise the
/// main config's `log_level` key, otherwise `info`. Unrecognized values
/// fall back to `info` rather than failing startup over a typo.
pub fn resolve_level(config_log_level: Option<&str>) -> log::LevelFilter {
    std::env::var("PHOBOS_LOG")
        .ok()
        .as_deref()
        .or(config_log_level)
        .and_then(|s| s.parse().ok())
        .unwrap_or(log::LevelFilter::Info)
}

pub fn init_daemon_logger(ident: &'static str, level: log::LevelFilter) {
    if let Err(err) = syslog::init(syslog::Facility::LOG_DAEMON, level, Some(ident)) {
        eprintln!("unable to initialize syslog: {err}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_info_on_an_unset_or_unparseable_level() {
        assert_eq!(resolve_level(None), log::LevelFilter::Info);
        assert_eq!(resolve_level(Some("not-a-level")), log::LevelFilter::Info);
    }

    #[test]
    fn config_log_level_is_honored_when_present() {
        assert_eq!(resolve_level(Some("debug")), log::LevelFilter::Debug);
    }
}
