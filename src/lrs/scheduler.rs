//! Scheduler: admission rules plus the write placement policy.
//!
//! Pure functions over borrowed state -- no I/O, no locking -- so scheduling
//! outcomes are deterministic and unit-testable given a fixed snapshot of
//! drives and media.

use phobos_api_types::{AdminStatus, DriveState, FsStatus, MediumConfig, MediumId, PhobosError, ResourceFamily};

use super::state::Drive;

/// Where a write request should land.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// A compatible medium is already mounted on this drive; just use it.
    UseMounted { drive_index: usize },
    /// Load `medium` onto the empty drive at `drive_index`, then mount it.
    LoadThenMount { drive_index: usize, medium: MediumId },
}

/// A read request must name a medium the catalog knows about, and that
/// medium must not be locked by a different host -- the scheduler rejects
/// locally rather than waiting.
pub fn admit_read(media: &[MediumConfig], medium_id: &MediumId, local_hostname: &str) -> Result<(), PhobosError> {
    let medium = media
        .iter()
        .find(|m| &m.id() == medium_id)
        .ok_or_else(|| PhobosError::MediaLabelUnknown(medium_id.label.clone()))?;

    match &medium.host {
        Some(host) if host != local_hostname => Err(PhobosError::MediumOnHost(host.clone())),
        _ => Ok(()),
    }
}

/// A format request is only admitted for `family == Tape` and `force == true`
/// every other family rejects outright regardless of `force`.
pub fn admit_format(family: ResourceFamily, force: bool) -> Result<(), PhobosError> {
    if family != ResourceFamily::Tape {
        return Err(PhobosError::UnsupportedFamily(family.to_string()));
    }
    if !force {
        return Err(PhobosError::UnsupportedFamily("tape format requires force=true".to_string()));
    }
    Ok(())
}

/// Gates concurrent format throughput: the client may have at most
/// `nb_streams` format requests outstanding at once (`0` means unbounded).
#[derive(Debug, Clone, Copy)]
pub struct StreamGate {
    limit: u32,
    in_flight: u32,
}

impl StreamGate {
    pub fn new(nb_streams: u32) -> Self {
        Self { limit: nb_streams, in_flight: 0 }
    }

    pub fn try_admit(&mut self) -> Result<(), PhobosError> {
        if self.limit != 0 && self.in_flight >= self.limit {
            return Err(PhobosError::DriveInUse);
        }
        self.in_flight += 1;
        Ok(())
    }

    pub fn complete_one(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

fn family_matches(drive: &Drive, family: ResourceFamily) -> bool {
    drive.config.family == family
}

fn medium_usable_for_write(medium: &MediumConfig, family: ResourceFamily, tags: &[String], size: u64) -> bool {
    medium.family == family
        && medium.adm_status == AdminStatus::Unlocked
        && !matches!(medium.fs_status, FsStatus::Full)
        && medium.host.is_none()
        && medium.accepts_tags(tags)
        && medium.stats.bytes_free >= size
}

/// Write placement policy: prefer a mounted, compatible
/// medium with enough free space; otherwise an empty drive plus a
/// compatible medium to load onto it. Ties broken by least-recently-used
/// medium (`stats.last_load` ascending, `None` sorting first) to spread
/// wear, then by drive/medium identity for full determinism.
pub fn select_for_write(drives: &[Drive], media: &[MediumConfig], family: ResourceFamily, tags: &[String], size: u64) -> Result<Placement, PhobosError> {
    if !drives.iter().any(|d| family_matches(d, family)) {
        return Err(PhobosError::UnsupportedFamily(family.to_string()));
    }

    let mut mounted_candidates: Vec<(usize, &MediumConfig)> = drives
        .iter()
        .enumerate()
        .filter(|(_, d)| family_matches(d, family) && d.runtime.state == DriveState::Mounted)
        .filter_map(|(idx, d)| {
            let medium_id = d.runtime.current_medium.as_ref()?;
            let medium = media.iter().find(|m| &m.id() == medium_id)?;
            medium_usable_for_write(medium, family, tags, size).then_some((idx, medium))
        })
        .collect();

    mounted_candidates.sort_by_key(|(idx, m)| (m.stats.last_load, m.label.clone(), *idx));
    if let Some((idx, _)) = mounted_candidates.into_iter().next() {
        return Ok(Placement::UseMounted { drive_index: idx });
    }

    let empty_drive = drives
        .iter()
        .enumerate()
        .filter(|(_, d)| family_matches(d, family) && d.eligible_for(None))
        .min_by_key(|(idx, d)| (d.config.serial.clone(), *idx))
        .map(|(idx, _)| idx)
        .ok_or(PhobosError::NoFreeSlot)?;

    let mut medium_candidates: Vec<&MediumConfig> = media.iter().filter(|m| medium_usable_for_write(m, family, tags, size)).collect();
    medium_candidates.sort_by_key(|m| (m.stats.last_load, m.label.clone()));

    let medium = medium_candidates.into_iter().next().ok_or(PhobosError::NoCompatibleMedium)?;

    Ok(Placement::LoadThenMount {
        drive_index: empty_drive,
        medium: medium.id(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use phobos_api_types::{DeviceConfig, FsType, AddressingScheme, MediumStats};

    fn tape_drive(serial: &str, state: DriveState, current: Option<MediumId>) -> Drive {
        let mut d = Drive::new(DeviceConfig {
            family: ResourceFamily::Tape,
            serial: serial.to_string(),
            model: "ULT3580-TD4".to_string(),
            path: format!("/dev/{serial}"),
            adm_status: AdminStatus::Unlocked,
            host: None,
            library: Some("lib1".to_string()),
            changer_drivenum: None,
        });
        d.runtime.state = state;
        d.runtime.current_medium = current;
        d
    }

    fn tape_medium(label: &str, bytes_free: u64, last_load: Option<i64>) -> MediumConfig {
        MediumConfig {
            family: ResourceFamily::Tape,
            label: label.to_string(),
            library: Some("lib1".to_string()),
            adm_status: AdminStatus::Unlocked,
            fs_status: FsStatus::Used,
            fs_type: FsType::Ltfs,
            addressing: AddressingScheme::Hash1,
            stats: MediumStats { bytes_free, last_load, ..Default::default() },
            tags: vec![],
            host: None,
        }
    }

    #[test]
    fn admit_read_rejects_medium_locked_on_another_host() {
        let mut medium = tape_medium("VOL0001", 100, None);
        medium.host = Some("other-host".to_string());
        let media = vec![medium];
        let err = admit_read(&media, &MediumId::new(ResourceFamily::Tape, "VOL0001", Some("lib1".to_string())), "this-host").unwrap_err();
        assert!(matches!(err, PhobosError::MediumOnHost(h) if h == "other-host"));
    }

    #[test]
    fn admit_format_requires_tape_and_force() {
        assert!(admit_format(ResourceFamily::Tape, true).is_ok());
        assert!(admit_format(ResourceFamily::Tape, false).is_err());
        assert!(admit_format(ResourceFamily::Directory, true).is_err());
    }

    #[test]
    fn stream_gate_bounds_concurrency() {
        let mut gate = StreamGate::new(2);
        gate.try_admit().unwrap();
        gate.try_admit().unwrap();
        assert!(gate.try_admit().is_err());
        gate.complete_one();
        assert!(gate.try_admit().is_ok());
    }

    #[test]
    fn unbounded_stream_gate_never_rejects() {
        let mut gate = StreamGate::new(0);
        for _ in 0..1000 {
            gate.try_admit().unwrap();
        }
    }

    /// Five format requests against one drive, pipelined at `nb_streams=2`:
    /// never more than two admitted at once, every one eventually completes,
    /// and the completion order is just some permutation of the five ids.
    #[tokio::test]
    async fn bounded_stream_gate_admits_all_five_without_exceeding_the_limit() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let gate = Arc::new(std::sync::Mutex::new(StreamGate::new(2)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 0..5u32 {
            let gate = Arc::clone(&gate);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let completed = Arc::clone(&completed);
            handles.push(tokio::spawn(async move {
                loop {
                    if gate.lock().unwrap().try_admit().is_ok() {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                tokio::time::sleep(std::time::Duration::from_millis(5)).await;

                in_flight.fetch_sub(1, Ordering::SeqCst);
                gate.lock().unwrap().complete_one();
                completed.lock().unwrap().push(id);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "at most nb_streams=2 requests may be in flight at once");
        let mut ids = completed.lock().unwrap().clone();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn prefers_mounted_compatible_medium_over_loading_a_new_one() {
        let mounted_medium = MediumId::new(ResourceFamily::Tape, "VOL0001", Some("lib1".to_string()));
        let drives = vec![
            tape_drive("D1", DriveState::Mounted, Some(mounted_medium.clone())),
            tape_drive("D2", DriveState::Empty, None),
        ];
        let media = vec![tape_medium("VOL0001", 1_000_000, Some(10)), tape_medium("VOL0002", 1_000_000, Some(20))];

        let placement = select_for_write(&drives, &media, ResourceFamily::Tape, &[], 1000).unwrap();
        assert_eq!(placement, Placement::UseMounted { drive_index: 0 });
    }

    #[test]
    fn falls_back_to_empty_drive_when_no_mounted_medium_fits() {
        let drives = vec![tape_drive("D1", DriveState::Empty, None)];
        let media = vec![tape_medium("VOL0001", 1_000_000, Some(5)), tape_medium("VOL0002", 1_000_000, Some(1))];

        let placement = select_for_write(&drives, &media, ResourceFamily::Tape, &[], 1000).unwrap();
        assert_eq!(
            placement,
            Placement::LoadThenMount {
                drive_index: 0,
                medium: MediumId::new(ResourceFamily::Tape, "VOL0002", Some("lib1".to_string())),
            }
        );
    }

    #[test]
    fn rejects_when_no_drive_of_the_requested_family_exists() {
        let drives = vec![tape_drive("D1", DriveState::Empty, None)];
        let media = vec![tape_medium("VOL0001", 1_000_000, None)];
        let err = select_for_write(&drives, &media, ResourceFamily::Directory, &[], 100).unwrap_err();
        assert!(matches!(err, PhobosError::UnsupportedFamily(_)));
    }

    #[test]
    fn rejects_when_no_medium_has_enough_free_space() {
        let drives = vec![tape_drive("D1", DriveState::Empty, None)];
        let media = vec![tape_medium("VOL0001", 10, None)];
        let err = select_for_write(&drives, &media, ResourceFamily::Tape, &[], 1000).unwrap_err();
        assert!(matches!(err, PhobosError::NoCompatibleMedium));
    }
}
