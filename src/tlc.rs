//! TLC daemon core: a single cooperative loop owning one library
//! device. Builds the in-memory model at startup and serves PING,
//! DRIVE_LOOKUP, LOAD, UNLOAD, STATUS and REFRESH over its TCP listener.
//!
//! Request handling itself never touches the network -- [`TlcState::handle`]
//! is a plain function of request to response, so it can be driven by the
//! daemon's accept loop or exercised directly in tests.

use std::fs::OpenOptions;

use anyhow::{format_err, Error};
use serde_json::json;

use phobos_api_types::{ElementKind, PhobosError};
use phobos_dss::DssStore;
use phobos_library::LibraryModel;
use phobos_proto::tlc::{TlcRequest, TlcResponse};
use phobos_proto::WireError;
use phobos_scsi::{ChangerError, ChangerErrorKind, ElementStatusFlags, RetryPolicy};

const ALL_KINDS: [ElementKind; 4] = [ElementKind::Arm, ElementKind::Slot, ElementKind::Impexp, ElementKind::Drive];

/// Owns the changer device handle and the library model built from it.
/// Library name is used purely as a configuration namespace (`tlc_<library>`);
/// it carries no runtime behaviour of its own.
pub struct TlcState {
    pub library_name: String,
    device_path: String,
    device: std::fs::File,
    retry_policy: RetryPolicy,
    /// Initial READ ELEMENT STATUS window size (`max_element_status`);
    /// `None` means "unlimited", i.e. try the whole kind's count first.
    max_chunk: Option<u16>,
    /// Whether this library refuses `{voltag, dvcid}` in one drive query
    /// and needs the extra drive-id-only pass (`sep_sn_query`).
    sep_sn_query: bool,
    model: LibraryModel,
    dss: DssStore,
}

impl TlcState {
    pub fn open(library_name: &str, device_path: &str, retry_policy: RetryPolicy, max_chunk: Option<u16>, sep_sn_query: bool, dss: DssStore) -> Result<Self, Error> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|err| format_err!("opening changer device '{device_path}' failed: {err}"))?;

        let mut state = TlcState {
            library_name: library_name.to_string(),
            device_path: device_path.to_string(),
            device,
            retry_policy,
            max_chunk,
            sep_sn_query,
            model: LibraryModel::new(),
            dss,
        };
        state.reload()?;
        Ok(state)
    }

    /// Re-opens the device and rebuilds the full model from SCSI. A failure
    /// here is fatal for the whole process -- the caller exits.
    pub fn reload(&mut self) -> Result<(), Error> {
        self.device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.device_path)
            .map_err(|err| format_err!("re-opening changer device failed: {err}"))?;

        let assignment = phobos_scsi::mode_sense(&mut self.device, &self.retry_policy)?;
        self.model.set_addresses(assignment);

        for kind in ALL_KINDS {
            let (first_address, count) = self.model.address_window(kind)?;
            let flags = ElementStatusFlags {
                get_label: true,
                get_drive_id: kind == ElementKind::Drive,
                allow_motion: false,
                sep_sn_query: kind == ElementKind::Drive && self.sep_sn_query,
            };
            let elements = phobos_scsi::element_status(&mut self.device, kind, first_address, count, flags, self.max_chunk, &self.retry_policy)?;
            self.model.set_elements(kind, elements)?;
        }

        log::info!("{}", json!({"channel": "tlc", "op": "reload", "library": self.library_name, "ok": true}));
        Ok(())
    }

    /// Refreshes the model, or terminates the process. A refresh failure
    /// leaves the in-memory model untrustworthy, and rather than keep
    /// serving stale element state the whole process exits so a supervisor
    /// can restart it against a consistent device.
    fn reload_or_exit(&mut self) {
        if let Err(err) = self.reload() {
            log::error!("TLC for library '{}' is exiting: refresh failed, model is no longer trustworthy: {err}", self.library_name);
            std::process::exit(1);
        }
    }

    pub fn handle(&mut self, req: TlcRequest) -> TlcResponse {
        match req {
            TlcRequest::Ping => self.ping(),
            TlcRequest::DriveLookup { serial } => self.drive_lookup(&serial),
            TlcRequest::Load { drive_serial, tape_label } => self.load(&drive_serial, &tape_label),
            TlcRequest::Unload { drive_serial, expected_label } => self.unload(&drive_serial, expected_label.as_deref()),
            TlcRequest::Status { refresh } => self.status(refresh),
            TlcRequest::Refresh => self.refresh(),
        }
    }

    fn ping(&mut self) -> TlcResponse {
        let library_is_up = phobos_scsi::inquiry(&mut self.device).is_ok();
        TlcResponse::PingResp { library_is_up }
    }

    fn drive_lookup(&mut self, serial: &str) -> TlcResponse {
        let arm_address = self.model.arm_address().ok();
        match self.model.drive_by_serial(serial) {
            Some(drive) => TlcResponse::DriveLookupResp {
                drive_address: drive.address,
                first_drive_address: arm_address.unwrap_or(drive.address),
                loaded: drive.full,
                loaded_medium_label: drive.volume_label.clone(),
            },
            None => error_response("drive_lookup", &PhobosError::DriveSerialUnknown(serial.to_string())),
        }
    }

    fn load(&mut self, drive_serial: &str, tape_label: &str) -> TlcResponse {
        let drive_address = match self.model.drive_by_serial(drive_serial) {
            Some(drive) => drive.address,
            None => return error_response("load", &PhobosError::DriveSerialUnknown(drive_serial.to_string())),
        };
        let slot_address = match self.model.medium_by_label(tape_label) {
            Some(element) => element.address,
            None => return error_response("load", &PhobosError::MediaLabelUnknown(tape_label.to_string())),
        };
        let arm_address = match self.model.arm_address() {
            Ok(a) => a,
            Err(err) => return error_response("load", &self.classify(&err)),
        };

        if let Err(err) = phobos_scsi::move_medium(&mut self.device, arm_address, slot_address, drive_address, &self.retry_policy) {
            return error_response("load", &self.classify_changer(&err));
        }

        self.log_scsi_op("load", drive_serial, tape_label);

        if let Err(err) = self.model.apply_move(slot_address, drive_address) {
            // TLC reports inconsistencies by refreshing before answering.
            log::warn!("model update after LOAD failed ({err}), forcing refresh");
            if let Err(err) = self.reload() {
                return error_response("load", &self.classify(&err));
            }
        }

        TlcResponse::LoadResp { drive_address, slot_address }
    }

    fn unload(&mut self, drive_serial: &str, expected_label: Option<&str>) -> TlcResponse {
        let (drive_address, loaded_label) = match self.model.drive_by_serial(drive_serial) {
            Some(drive) => (drive.address, drive.volume_label.clone()),
            None => return error_response("unload", &PhobosError::DriveSerialUnknown(drive_serial.to_string())),
        };

        let loaded_label = match loaded_label {
            None => {
                return match expected_label {
                    None => TlcResponse::UnloadResp {
                        label: String::new(),
                        destination_address: drive_address,
                    },
                    Some(expected) => error_response("unload", &PhobosError::EmptyDriveDoesNotContain(expected.to_string())),
                };
            }
            Some(label) => label,
        };

        if let Some(expected) = expected_label {
            if expected != loaded_label {
                return error_response(
                    "unload",
                    &PhobosError::UnexpectedTape {
                        expected: expected.to_string(),
                        loaded: loaded_label.clone(),
                    },
                );
            }
        }

        let destination = self.choose_unload_destination(drive_address);
        let arm_address = match self.model.arm_address() {
            Ok(a) => a,
            Err(err) => return error_response("unload", &self.classify(&err)),
        };

        if let Err(err) = phobos_scsi::move_medium(&mut self.device, arm_address, drive_address, destination, &self.retry_policy) {
            return error_response("unload", &self.classify_changer(&err));
        }

        self.log_scsi_op("unload", drive_serial, &loaded_label);

        if let Err(err) = self.model.apply_move(drive_address, destination) {
            log::warn!("model update after UNLOAD failed ({err}), forcing refresh");
            if let Err(err) = self.reload() {
                return error_response("unload", &self.classify(&err));
            }
        }

        TlcResponse::UnloadResp {
            label: loaded_label,
            destination_address: destination,
        }
    }

    /// Target slot selection order: the drive's recorded source slot
    /// if still empty, else any empty slot.
    fn choose_unload_destination(&self, drive_address: u16) -> u16 {
        if let Some(drive) = self.model.elements(ElementKind::Drive).iter().find(|e| e.address == drive_address) {
            if let Some(source) = drive.source_address {
                if self.model.is_empty_slot(source) {
                    return source;
                }
            }
        }
        self.model.first_empty_slot().unwrap_or(drive_address)
    }

    fn status(&mut self, refresh: bool) -> TlcResponse {
        if refresh {
            self.reload_or_exit();
        }
        TlcResponse::StatusResp {
            elements: self.model.all_elements().cloned().collect(),
        }
    }

    fn refresh(&mut self) -> TlcResponse {
        self.reload_or_exit();
        TlcResponse::RefreshResp
    }

    fn log_scsi_op(&self, op: &str, drive_serial: &str, label: &str) {
        let record = json!({
            "channel": "dss",
            "op": op,
            "library": self.library_name,
            "drive_serial": drive_serial,
            "label": label,
        });
        if let Err(err) = self.dss.log_event(&record) {
            log::warn!("failed to log SCSI operation to DSS: {err}");
        }
        log::info!("{record}");
    }

    /// Classify a generic failure (model invariant violation, re-open
    /// failure, or a wrapped [`ChangerError`]) into the shared taxonomy.
    fn classify(&self, err: &Error) -> PhobosError {
        match err.downcast_ref::<ChangerError>() {
            Some(changer_err) => self.classify_changer(changer_err),
            None => PhobosError::Internal(err.to_string()),
        }
    }

    /// Not-ready/IO conditions have already exhausted `retry_count` inside
    /// the SCSI driver by the time they reach here, so they are reported as
    /// transient rather than retried again; illegal-request/invalid-response
    /// means the changer itself is in a bad state.
    fn classify_changer(&self, err: &ChangerError) -> PhobosError {
        match err.kind {
            ChangerErrorKind::NotReady | ChangerErrorKind::Io | ChangerErrorKind::Timeout => PhobosError::Transient(err.message.clone()),
            ChangerErrorKind::IllegalRequest | ChangerErrorKind::InvalidResponse => PhobosError::DeviceFailed(self.library_name.clone()),
        }
    }
}

fn error_response(req_kind: &str, err: &PhobosError) -> TlcResponse {
    TlcResponse::Error(WireError::from_phobos(req_kind, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use phobos_scsi::ElementAddressAssignment;

    fn test_dss() -> DssStore {
        let dir = std::env::temp_dir().join(format!("phobos-tlc-test-{}-{}", std::process::id(), line!()));
        std::fs::create_dir_all(&dir).unwrap();
        DssStore::new(&dir)
    }

    fn elem(kind: ElementKind, address: u16, full: bool, volume_label: Option<&str>) -> phobos_api_types::LibraryElement {
        phobos_api_types::LibraryElement {
            kind,
            address,
            full,
            volume_label: volume_label.map(str::to_string),
            source_address: None,
            drive_id: None,
            exception: None,
            flags: 0,
        }
    }

    /// D1 (serial "HU0001") holds T1, whose recorded `source_address` is
    /// slot 0x1004.
    fn state_with_loaded_drive() -> TlcState {
        let device = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null").unwrap();
        let mut model = LibraryModel::new();
        model.set_addresses(ElementAddressAssignment { arms: (0, 1), slots: (0x1004, 2), impexp: (0x2000, 1), drives: (0x3000, 1) });
        model.set_elements(ElementKind::Arm, vec![elem(ElementKind::Arm, 0, false, None)]).unwrap();
        model
            .set_elements(
                ElementKind::Slot,
                vec![elem(ElementKind::Slot, 0x1004, false, None), elem(ElementKind::Slot, 0x1005, false, None)],
            )
            .unwrap();
        model.set_elements(ElementKind::Impexp, vec![elem(ElementKind::Impexp, 0x2000, false, None)]).unwrap();
        let mut drive = elem(ElementKind::Drive, 0x3000, true, Some("T1"));
        drive.drive_id = Some("HU0001".to_string());
        drive.source_address = Some(0x1004);
        model.set_elements(ElementKind::Drive, vec![drive]).unwrap();

        TlcState {
            library_name: "lib1".to_string(),
            device_path: "/dev/null".to_string(),
            device,
            retry_policy: RetryPolicy::default(),
            max_chunk: None,
            sep_sn_query: false,
            model,
            dss: test_dss(),
        }
    }

    /// Scenario: LOAD against a drive serial the library model has never
    /// seen. The response must name the unknown serial and the model must
    /// be left untouched (no element mutated).
    #[test]
    fn load_unknown_drive_serial_leaves_model_unchanged() {
        let mut state = state_with_loaded_drive();
        let before = state.model.all_elements().cloned().collect::<Vec<_>>();

        let response = state.handle(TlcRequest::Load { drive_serial: "BOGUS".to_string(), tape_label: "T1".to_string() });
        match response {
            TlcResponse::Error(err) => assert_eq!(err.message, "drive serial 'BOGUS' unknown"),
            other => panic!("expected an error response, got {other:?}"),
        }

        let after = state.model.all_elements().cloned().collect::<Vec<_>>();
        assert_eq!(before, after);
    }

    /// Scenario: unloading T1 from D1 while its recorded source slot
    /// (0x1004) is still empty picks that slot back.
    #[test]
    fn unload_destination_prefers_recorded_source_slot() {
        let state = state_with_loaded_drive();
        assert_eq!(state.choose_unload_destination(0x3000), 0x1004);
    }

    /// Same setup, but slot 0x1004 has since been filled externally: the
    /// destination must be some *other* empty slot, never 0x1004.
    #[test]
    fn unload_destination_falls_back_once_source_slot_is_full() {
        let mut state = state_with_loaded_drive();
        state.model.set_elements(ElementKind::Slot, vec![elem(ElementKind::Slot, 0x1004, true, Some("OTHER")), elem(ElementKind::Slot, 0x1005, false, None)]).unwrap();

        assert_eq!(state.choose_unload_destination(0x3000), 0x1005);
    }
}
