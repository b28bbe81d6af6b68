//! In-memory tape library model.
//!
//! Holds four vectors of [`LibraryElement`], one per [`ElementKind`]. The
//! model is lazily populated per-kind from [`phobos_scsi::element_status`];
//! [`phobos_scsi::mode_sense`] must have succeeded first so the address
//! ranges are known. The TLC daemon owns one instance and runs single
//! threaded, so mutation on a successful `move_medium` call (see
//! [`LibraryModel::apply_move`]) is trivially atomic with respect to lookups.

use anyhow::{bail, Error};

use phobos_api_types::{ElementKind, LibraryElement};
use phobos_scsi::ElementAddressAssignment;

/// One element-kind's address window and current contents.
#[derive(Debug, Default)]
struct Bucket {
    first_address: u16,
    count: u16,
    elements: Vec<LibraryElement>,
}

impl Bucket {
    fn populated(&self) -> bool {
        self.count != 0 && self.elements.len() == self.count as usize
    }
}

/// The full library model for one TLC daemon instance.
#[derive(Debug, Default)]
pub struct LibraryModel {
    arms: Bucket,
    slots: Bucket,
    impexp: Bucket,
    drives: Bucket,
    addresses_known: bool,
}

impl LibraryModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the address ranges from a successful `mode_sense`. Resets any
    /// previously populated element data -- the windows may have moved.
    pub fn set_addresses(&mut self, assignment: ElementAddressAssignment) {
        self.arms = Bucket { first_address: assignment.arms.0, count: assignment.arms.1, elements: Vec::new() };
        self.slots = Bucket { first_address: assignment.slots.0, count: assignment.slots.1, elements: Vec::new() };
        self.impexp = Bucket { first_address: assignment.impexp.0, count: assignment.impexp.1, elements: Vec::new() };
        self.drives = Bucket { first_address: assignment.drives.0, count: assignment.drives.1, elements: Vec::new() };
        self.addresses_known = true;
    }

    fn bucket(&self, kind: ElementKind) -> &Bucket {
        match kind {
            ElementKind::Arm => &self.arms,
            ElementKind::Slot => &self.slots,
            ElementKind::Impexp => &self.impexp,
            ElementKind::Drive => &self.drives,
        }
    }

    fn bucket_mut(&mut self, kind: ElementKind) -> &mut Bucket {
        match kind {
            ElementKind::Arm => &mut self.arms,
            ElementKind::Slot => &mut self.slots,
            ElementKind::Impexp => &mut self.impexp,
            ElementKind::Drive => &mut self.drives,
        }
    }

    /// The address window for `kind`, as reported by `mode_sense`. Needed by
    /// callers issuing `element_status` themselves.
    pub fn address_window(&self, kind: ElementKind) -> Result<(u16, u16), Error> {
        if !self.addresses_known {
            bail!("mode_sense has not been run yet");
        }
        let bucket = self.bucket(kind);
        Ok((bucket.first_address, bucket.count))
    }

    /// Store a freshly queried element_status reply for `kind`.
    pub fn set_elements(&mut self, kind: ElementKind, elements: Vec<LibraryElement>) -> Result<(), Error> {
        if !self.addresses_known {
            bail!("mode_sense has not been run yet");
        }
        let bucket = self.bucket_mut(kind);
        if elements.len() != bucket.count as usize {
            bail!("expected {} {:?} elements, got {}", bucket.count, kind, elements.len());
        }
        bucket.elements = elements;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.addresses_known && [ElementKind::Arm, ElementKind::Slot, ElementKind::Impexp, ElementKind::Drive].iter().all(|k| self.bucket(*k).populated())
    }

    pub fn elements(&self, kind: ElementKind) -> &[LibraryElement] {
        &self.bucket(kind).elements
    }

    pub fn all_elements(&self) -> impl Iterator<Item = &LibraryElement> {
        self.arms.elements.iter().chain(self.slots.elements.iter()).chain(self.impexp.elements.iter()).chain(self.drives.elements.iter())
    }

    /// The transport/arm address to use as `arm_address` in `move_medium`.
    /// Libraries with more than one arm always use the first.
    pub fn arm_address(&self) -> Result<u16, Error> {
        self.arms.elements.first().map(|e| e.address).ok_or_else(|| anyhow::format_err!("no transport element reported"))
    }

    /// Find a drive whose `device_id` ends with `serial`, ignoring
    /// surrounding whitespace -- some changers report `VENDOR  MODEL
    /// SERIAL`, others only `SERIAL`.
    pub fn drive_by_serial(&self, serial: &str) -> Option<&LibraryElement> {
        self.drives.elements.iter().find(|drive| {
            drive
                .drive_id
                .as_deref()
                .map(|id| id.trim().rsplit(char::is_whitespace).next().unwrap_or(id.trim()) == serial)
                .unwrap_or(false)
        })
    }

    fn drive_by_serial_mut(&mut self, serial: &str) -> Option<&mut LibraryElement> {
        self.drives.elements.iter_mut().find(|drive| {
            drive
                .drive_id
                .as_deref()
                .map(|id| id.trim().rsplit(char::is_whitespace).next().unwrap_or(id.trim()) == serial)
                .unwrap_or(false)
        })
    }

    /// Search order: drives, then slots, then arms, then import/export.
    pub fn medium_by_label(&self, label: &str) -> Option<&LibraryElement> {
        [&self.drives, &self.slots, &self.arms, &self.impexp]
            .into_iter()
            .find_map(|bucket| bucket.elements.iter().find(|e| e.full && e.volume_label.as_deref() == Some(label)))
    }

    fn element_mut_by_address(&mut self, address: u16) -> Option<&mut LibraryElement> {
        for bucket in [&mut self.arms, &mut self.slots, &mut self.impexp, &mut self.drives] {
            if let Some(elem) = bucket.elements.iter_mut().find(|e| e.address == address) {
                return Some(elem);
            }
        }
        None
    }

    /// Apply the effect of a successful `move_medium(source, destination)`:
    /// the source element empties (losing `source_address`), the
    /// destination fills, inherits the label, and records `source_address`
    /// as the element it came from.
    pub fn apply_move(&mut self, source_address: u16, destination_address: u16) -> Result<(), Error> {
        let label = {
            let source = self
                .element_mut_by_address(source_address)
                .ok_or_else(|| anyhow::format_err!("no element at source address {}", source_address))?;
            if !source.full {
                bail!("source element {} is empty", source_address);
            }
            let label = source.volume_label.take();
            source.full = false;
            source.source_address = None;
            label
        };

        let destination = self
            .element_mut_by_address(destination_address)
            .ok_or_else(|| anyhow::format_err!("no element at destination address {}", destination_address))?;
        if destination.full {
            bail!("destination element {} is already full", destination_address);
        }
        destination.full = true;
        destination.volume_label = label;
        destination.source_address = Some(source_address);

        Ok(())
    }

    /// Record that `serial`'s drive now holds `label`, loaded from `source`
    /// (mirrors `apply_move` but addressed by drive serial, for the TLC
    /// LOAD handler which already resolved addresses before calling SCSI).
    pub fn mark_drive_loaded(&mut self, serial: &str, label: &str, source_address: u16) -> Result<(), Error> {
        let drive = self.drive_by_serial_mut(serial).ok_or_else(|| anyhow::format_err!("unknown drive serial '{}'", serial))?;
        drive.full = true;
        drive.volume_label = Some(label.to_string());
        drive.source_address = Some(source_address);
        Ok(())
    }

    pub fn mark_drive_unloaded(&mut self, serial: &str, destination_address: u16) -> Result<Option<String>, Error> {
        let drive = self.drive_by_serial_mut(serial).ok_or_else(|| anyhow::format_err!("unknown drive serial '{}'", serial))?;
        let label = drive.volume_label.take();
        drive.full = false;
        drive.source_address = None;

        if let Some(dest) = self.element_mut_by_address(destination_address) {
            dest.full = true;
            dest.volume_label = label.clone();
            dest.source_address = None;
        }

        Ok(label)
    }

    /// The first empty slot address, used by UNLOAD's slot-selection rule
    /// when the drive's recorded `source_address` is unusable.
    pub fn first_empty_slot(&self) -> Option<u16> {
        self.slots.elements.iter().find(|e| !e.full).map(|e| e.address)
    }

    pub fn is_empty_slot(&self, address: u16) -> bool {
        self.slots.elements.iter().any(|e| e.address == address && !e.full)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn elem(kind: ElementKind, address: u16, full: bool, label: Option<&str>) -> LibraryElement {
        LibraryElement {
            kind,
            address,
            full,
            volume_label: label.map(String::from),
            source_address: None,
            drive_id: None,
            exception: None,
            flags: 0,
        }
    }

    fn sample_model() -> LibraryModel {
        let mut model = LibraryModel::new();
        model.set_addresses(ElementAddressAssignment { arms: (0, 1), slots: (100, 2), impexp: (200, 1), drives: (300, 1) });
        model.set_elements(ElementKind::Arm, vec![elem(ElementKind::Arm, 0, false, None)]).unwrap();
        model
            .set_elements(
                ElementKind::Slot,
                vec![elem(ElementKind::Slot, 100, true, Some("VOL0001")), elem(ElementKind::Slot, 101, false, None)],
            )
            .unwrap();
        model.set_elements(ElementKind::Impexp, vec![elem(ElementKind::Impexp, 200, false, None)]).unwrap();
        let mut drive = elem(ElementKind::Drive, 300, false, None);
        drive.drive_id = Some("IBM     ULT3580-TD4     HU12345678".to_string());
        model.set_elements(ElementKind::Drive, vec![drive]).unwrap();
        model
    }

    #[test]
    fn drive_by_serial_matches_trailing_token() {
        let model = sample_model();
        assert!(model.drive_by_serial("HU12345678").is_some());
        assert!(model.drive_by_serial("no-such-serial").is_none());
    }

    #[test]
    fn medium_by_label_searches_slots() {
        let model = sample_model();
        let found = model.medium_by_label("VOL0001").unwrap();
        assert_eq!(found.kind, ElementKind::Slot);
        assert_eq!(found.address, 100);
    }

    #[test]
    fn apply_move_mutates_both_endpoints() {
        let mut model = sample_model();
        model.apply_move(100, 300).unwrap();

        assert!(!model.elements(ElementKind::Slot)[0].full);
        assert!(model.elements(ElementKind::Slot)[0].source_address.is_none());

        let drive = &model.elements(ElementKind::Drive)[0];
        assert!(drive.full);
        assert_eq!(drive.volume_label.as_deref(), Some("VOL0001"));
        assert_eq!(drive.source_address, Some(100));
    }

    #[test]
    fn apply_move_from_empty_source_fails() {
        let mut model = sample_model();
        assert!(model.apply_move(101, 300).is_err());
    }

    #[test]
    fn first_empty_slot_skips_full_ones() {
        let model = sample_model();
        assert_eq!(model.first_empty_slot(), Some(101));
    }
}
