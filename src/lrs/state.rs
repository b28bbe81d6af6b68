//! Per-drive device state machine.
//!
//! A [`Drive`] bundles the catalog-resident [`DeviceConfig`] with its
//! LRS-local [`DeviceRuntime`]. All mutation goes through the `schedule_*`/
//! `*_succeeded`/`*_failed` methods below; nothing else may poke `runtime`
//! directly, so the table below is the only place state transitions happen.

use anyhow::Error;

use phobos_api_types::{AdminStatus, DeviceConfig, DeviceRuntime, DriveState, MediumId, PhobosError};

/// One drive and its current runtime state, as tracked by the LRS.
pub struct Drive {
    pub config: DeviceConfig,
    pub runtime: DeviceRuntime,
}

impl Drive {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            runtime: DeviceRuntime::new(),
        }
    }

    /// A drive is eligible for a new request only from `mounted` (if
    /// the medium matches) or `empty` (otherwise).
    pub fn eligible_for(&self, medium: Option<&MediumId>) -> bool {
        if self.config.adm_status != AdminStatus::Unlocked {
            return false;
        }
        match self.runtime.state {
            DriveState::Mounted => match medium {
                Some(m) => self.runtime.current_medium.as_ref() == Some(m),
                None => true,
            },
            DriveState::Empty => true,
            _ => false,
        }
    }

    fn expect(&self, want: DriveState) -> Result<(), Error> {
        if self.runtime.state != want {
            anyhow::bail!(
                "drive '{}' not in expected state {:?} (is {:?})",
                self.config.serial,
                want,
                self.runtime.state
            );
        }
        Ok(())
    }

    /// `empty -> loading`. Caller has already taken the medium's DSS lock.
    /// `current_medium` stays `None` until the load actually succeeds --
    /// `loading` is not one of the states `DriveState::implies_medium_present`
    /// names.
    pub fn schedule_load(&mut self, medium: MediumId) -> Result<(), Error> {
        self.expect(DriveState::Empty)?;
        self.runtime.pending_medium = Some(medium);
        self.runtime.state = DriveState::Loading;
        Ok(())
    }

    /// `loading -(TLC success)-> loaded`.
    pub fn load_succeeded(&mut self) -> Result<(), Error> {
        self.expect(DriveState::Loading)?;
        self.runtime.current_medium = self.runtime.pending_medium.take();
        self.runtime.state = DriveState::Loaded;
        Ok(())
    }

    /// `loading -(TLC error)-> empty`. Caller releases the medium lock it
    /// took in `schedule_load`.
    pub fn load_failed(&mut self) -> Result<MediumId, Error> {
        self.expect(DriveState::Loading)?;
        self.runtime.state = DriveState::Empty;
        self.runtime.pending_medium.take().ok_or_else(|| anyhow::format_err!("loading drive had no pending medium"))
    }

    /// `loaded -> mounting`.
    pub fn schedule_mount(&mut self) -> Result<(), Error> {
        self.expect(DriveState::Loaded)?;
        self.runtime.state = DriveState::Mounting;
        Ok(())
    }

    /// `mounting -(success)-> mounted`.
    pub fn mount_succeeded(&mut self, root_path: String) -> Result<(), Error> {
        self.expect(DriveState::Mounting)?;
        self.runtime.current_root_path = Some(root_path);
        self.runtime.state = DriveState::Mounted;
        Ok(())
    }

    /// `mounted -(client read/write)-> busy`.
    pub fn acquire_busy(&mut self) -> Result<(), Error> {
        self.expect(DriveState::Mounted)?;
        self.runtime.state = DriveState::Busy;
        self.runtime.refcount += 1;
        Ok(())
    }

    /// `busy -(RELEASE)-> flushing` once `refcount` drains to zero; returns
    /// `true` when this release was the one that drained it (the caller
    /// must then run `fs_release` and call [`Drive::flush_succeeded`]).
    /// While other clients still hold the drive busy, only the refcount
    /// moves.
    pub fn release_busy(&mut self) -> Result<bool, Error> {
        self.expect(DriveState::Busy)?;
        self.runtime.refcount = self.runtime.refcount.saturating_sub(1);
        if self.runtime.refcount == 0 {
            self.runtime.state = DriveState::Flushing;
            return Ok(true);
        }
        Ok(false)
    }

    /// `flushing -(fs_release succeeded)-> mounted`.
    pub fn flush_succeeded(&mut self) -> Result<(), Error> {
        self.expect(DriveState::Flushing)?;
        self.runtime.state = DriveState::Mounted;
        Ok(())
    }

    /// `mounted -> unmounting`.
    pub fn schedule_unmount(&mut self) -> Result<(), Error> {
        self.expect(DriveState::Mounted)?;
        self.runtime.state = DriveState::Unmounting;
        Ok(())
    }

    /// `unmounting -(success)-> loaded`.
    pub fn unmount_succeeded(&mut self) -> Result<(), Error> {
        self.expect(DriveState::Unmounting)?;
        self.runtime.current_root_path = None;
        self.runtime.state = DriveState::Loaded;
        Ok(())
    }

    /// `loaded -> unloading`. `current_medium` moves to `pending_medium`
    /// immediately: `unloading` is not one of the states
    /// `DriveState::implies_medium_present` names either.
    pub fn schedule_unload(&mut self) -> Result<(), Error> {
        self.expect(DriveState::Loaded)?;
        self.runtime.pending_medium =
            Some(self.runtime.current_medium.take().ok_or_else(|| anyhow::format_err!("loaded drive had no medium on record"))?);
        self.runtime.state = DriveState::Unloading;
        Ok(())
    }

    /// `unloading -(success)-> empty`. Caller releases the medium lock.
    pub fn unload_succeeded(&mut self) -> Result<MediumId, Error> {
        self.expect(DriveState::Unloading)?;
        self.runtime.state = DriveState::Empty;
        self.runtime.pending_medium.take().ok_or_else(|| anyhow::format_err!("unloading drive had no medium on record"))
    }

    /// `any -(hard io error)-> failed`. Never fails itself: a drive can
    /// always be marked failed regardless of its current state.
    pub fn fail(&mut self, reason: &str) {
        log::error!("drive '{}' marked failed: {}", self.config.serial, reason);
        self.runtime.state = DriveState::Failed;
        self.config.adm_status = AdminStatus::Failed;
    }

    pub fn to_phobos_error_if_unusable(&self) -> Option<PhobosError> {
        match self.runtime.state {
            DriveState::Failed => Some(PhobosError::DeviceFailed(self.config.serial.clone())),
            DriveState::Uninit => Some(PhobosError::DeviceFailed(self.config.serial.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use phobos_api_types::ResourceFamily;

    fn drive() -> Drive {
        Drive::new(DeviceConfig {
            family: ResourceFamily::Tape,
            serial: "HU12345678".to_string(),
            model: "ULT3580-TD4".to_string(),
            path: "/dev/nst0".to_string(),
            adm_status: AdminStatus::Unlocked,
            host: None,
            library: Some("lib1".to_string()),
            changer_drivenum: Some(0),
        })
    }

    fn medium() -> MediumId {
        MediumId::new(ResourceFamily::Tape, "VOL0001", Some("lib1".to_string()))
    }

    #[test]
    fn full_happy_path_round_trip() {
        let mut d = drive();
        assert!(d.eligible_for(None));

        d.schedule_load(medium()).unwrap();
        assert_eq!(d.runtime.state, DriveState::Loading);
        d.load_succeeded().unwrap();
        assert_eq!(d.runtime.state, DriveState::Loaded);

        d.schedule_mount().unwrap();
        d.mount_succeeded("/mnt/phobos/HU12345678".to_string()).unwrap();
        assert_eq!(d.runtime.state, DriveState::Mounted);
        assert!(d.eligible_for(Some(&medium())));
        assert!(!d.eligible_for(Some(&MediumId::new(ResourceFamily::Tape, "VOL0002", Some("lib1".to_string())))));

        d.acquire_busy().unwrap();
        assert_eq!(d.runtime.refcount, 1);
        let draining = d.release_busy().unwrap();
        assert!(draining);
        assert_eq!(d.runtime.state, DriveState::Flushing);
        d.flush_succeeded().unwrap();
        assert_eq!(d.runtime.state, DriveState::Mounted);

        d.schedule_unmount().unwrap();
        d.unmount_succeeded().unwrap();
        assert_eq!(d.runtime.state, DriveState::Loaded);
        assert!(d.runtime.current_root_path.is_none());

        d.schedule_unload().unwrap();
        let released = d.unload_succeeded().unwrap();
        assert_eq!(released, medium());
        assert_eq!(d.runtime.state, DriveState::Empty);
        assert!(d.runtime.current_medium.is_none());
    }

    #[test]
    fn load_failure_releases_pending_medium_and_returns_to_empty() {
        let mut d = drive();
        d.schedule_load(medium()).unwrap();
        let released = d.load_failed().unwrap();
        assert_eq!(released, medium());
        assert_eq!(d.runtime.state, DriveState::Empty);
    }

    #[test]
    fn transition_from_wrong_state_is_rejected() {
        let mut d = drive();
        assert!(d.schedule_mount().is_err());
        assert_eq!(d.runtime.state, DriveState::Empty);
    }

    #[test]
    fn failed_drive_is_never_eligible() {
        let mut d = drive();
        d.fail("hard io error during move_medium");
        assert!(!d.eligible_for(None));
        assert!(matches!(d.to_phobos_error_if_unusable(), Some(PhobosError::DeviceFailed(_))));
    }

    #[test]
    fn locked_drive_is_not_eligible() {
        let mut d = drive();
        d.config.adm_status = AdminStatus::Locked;
        assert!(!d.eligible_for(None));
    }

    #[test]
    fn release_busy_only_drains_on_the_last_of_several_holders() {
        let mut d = drive();
        d.schedule_load(medium()).unwrap();
        d.load_succeeded().unwrap();
        d.schedule_mount().unwrap();
        d.mount_succeeded("/mnt/phobos/HU12345678".to_string()).unwrap();

        d.acquire_busy().unwrap();
        d.acquire_busy().unwrap();
        assert_eq!(d.runtime.refcount, 2);

        assert!(!d.release_busy().unwrap());
        assert_eq!(d.runtime.state, DriveState::Busy);
        assert!(d.release_busy().unwrap());
        assert_eq!(d.runtime.state, DriveState::Flushing);
    }

    #[test]
    fn current_medium_is_present_in_exactly_the_states_the_invariant_names() {
        let mut d = drive();
        let has_medium_states = |d: &Drive| d.runtime.current_medium.is_some();

        assert!(!has_medium_states(&d)); // empty
        d.schedule_load(medium()).unwrap();
        assert!(!has_medium_states(&d)); // loading: not yet in {loaded, mounting, mounted, busy, flushing, unmounting}
        d.load_succeeded().unwrap();
        assert!(has_medium_states(&d)); // loaded
        d.schedule_mount().unwrap();
        assert!(has_medium_states(&d)); // mounting
        d.mount_succeeded("/mnt/phobos/HU12345678".to_string()).unwrap();
        assert!(has_medium_states(&d)); // mounted
        d.acquire_busy().unwrap();
        assert!(has_medium_states(&d)); // busy
        d.release_busy().unwrap();
        assert!(has_medium_states(&d)); // flushing
        d.flush_succeeded().unwrap();
        assert!(has_medium_states(&d)); // mounted again
        d.schedule_unmount().unwrap();
        assert!(has_medium_states(&d)); // unmounting
        d.unmount_succeeded().unwrap();
        assert!(has_medium_states(&d)); // loaded again
        d.schedule_unload().unwrap();
        d.unload_succeeded().unwrap();
        assert!(!has_medium_states(&d)); // empty again
    }
}
