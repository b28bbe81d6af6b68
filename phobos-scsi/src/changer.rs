//! SCSI media-changer driver: MODE SENSE, READ ELEMENT STATUS, MOVE MEDIUM.
//!
//! Generalized from a `MtxStatus`/`DriveStatus`/... style model to the
//! flatter [`LibraryElement`] shape the library model (phobos-library)
//! expects.

use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use serde_json::json;

use proxmox_io::ReadExt;

use phobos_api_types::{ElementKind, LibraryElement};

use crate::sgutils::{scsi_ascii_to_string, scsi_inquiry, InquiryInfo, ScsiError, SgRaw, SENSE_KEY_NOT_READY};

const SCSI_VOLUME_TAG_LEN: usize = 36;

/// Retry parameters for [`execute_scsi_command`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_short: Duration,
    pub retry_long: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 5,
            retry_short: Duration::from_secs(1),
            retry_long: Duration::from_secs(5),
        }
    }
}

/// What to request from READ ELEMENT STATUS.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElementStatusFlags {
    pub get_label: bool,
    pub get_drive_id: bool,
    pub allow_motion: bool,
    /// The changer refuses to return both PVolTag and DVCID in one
    /// request; issue a second, drive-id-only request and merge by address.
    pub sep_sn_query: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangerErrorKind {
    Io,
    InvalidResponse,
    Timeout,
    IllegalRequest,
    NotReady,
}

#[derive(thiserror::Error, Debug)]
#[error("{kind:?}: {message}")]
pub struct ChangerError {
    pub kind: ChangerErrorKind,
    pub message: String,
    pub scsi_sense_key: Option<u8>,
    pub retried: bool,
}

impl ChangerError {
    fn from_scsi(err: ScsiError, retried: bool) -> Self {
        let (kind, scsi_sense_key) = match &err {
            ScsiError::Sense(s) if s.sense_key == SENSE_KEY_NOT_READY => (ChangerErrorKind::NotReady, Some(s.sense_key)),
            ScsiError::Sense(s) => (ChangerErrorKind::IllegalRequest, Some(s.sense_key)),
            ScsiError::Error(_) => (ChangerErrorKind::Io, None),
        };
        ChangerError {
            kind,
            message: err.to_string(),
            scsi_sense_key,
            retried,
        }
    }

    fn other(kind: ChangerErrorKind, err: Error) -> Self {
        ChangerError {
            kind,
            message: err.to_string(),
            scsi_sense_key: None,
            retried: false,
        }
    }

    /// A JSON diagnostic blob suitable for logging.
    pub fn diagnostic(&self) -> serde_json::Value {
        json!({
            "kind": format!("{:?}", self.kind),
            "message": self.message,
            "scsi_sense_key": self.scsi_sense_key,
            "retried": self.retried,
        })
    }
}

/// Run `cmd`, retrying transient failures per `policy`. Illegal-request and
/// invalid-argument sense breaks the loop immediately; not-ready gets the
/// long delay (the changer is still finishing a prior inventory/move).
fn execute_scsi_command<F: AsRawFd>(sg_raw: &mut SgRaw<F>, cmd: &[u8], policy: &RetryPolicy) -> Result<Vec<u8>, ChangerError> {
    let mut attempt = 0u32;
    let mut retried = false;

    loop {
        match sg_raw.do_command(cmd) {
            Ok(data) => return Ok(data.to_vec()),
            Err(err) => {
                let non_retriable = matches!(&err, ScsiError::Sense(s) if s.sense_key != SENSE_KEY_NOT_READY);
                if non_retriable || attempt >= policy.retry_count {
                    log::warn!("scsi command failed permanently after {} attempt(s): {}", attempt + 1, err);
                    return Err(ChangerError::from_scsi(err, retried));
                }

                retried = true;
                let delay = if err.is_becoming_ready() { policy.retry_long } else { policy.retry_short };
                log::warn!("scsi command failed (attempt {}/{}): {}", attempt + 1, policy.retry_count, err);
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Element Address Assignment page, as reported by MODE SENSE6 (page 0x1D).
#[derive(Debug, Clone, Copy)]
pub struct ElementAddressAssignment {
    pub arms: (u16, u16),
    pub slots: (u16, u16),
    pub impexp: (u16, u16),
    pub drives: (u16, u16),
}

#[repr(C, packed)]
#[derive(endian_trait::Endian)]
struct AddressAssignmentPage {
    data_len: u8,
    reserved1: u8,
    reserved2: u8,
    block_descriptor_len: u8,
    page_code: u8,
    additional_page_len: u8,
    first_transport_element_address: u16,
    transport_element_count: u16,
    first_storage_element_address: u16,
    storage_element_count: u16,
    first_import_export_element_address: u16,
    import_export_element_count: u16,
    first_transfer_element_address: u16,
    transfer_element_count: u16,
    reserved22: u8,
    reserved23: u8,
}

const ELEMENT_ADDRESS_ASSIGNMENT_PAGE_CODE: u8 = 0x1D;

/// MODE SENSE6, element address assignment page.
pub fn mode_sense<F: AsRawFd>(file: &mut F, policy: &RetryPolicy) -> Result<ElementAddressAssignment, ChangerError> {
    let allocation_len: u8 = u8::MAX;
    let mut sg_raw = SgRaw::new(file, allocation_len as usize).map_err(|err| ChangerError::other(ChangerErrorKind::Io, err))?;
    sg_raw.set_timeout(60);

    let cmd = [
        0x1A, // MODE SENSE(6)
        0x08, // DBD=1
        ELEMENT_ADDRESS_ASSIGNMENT_PAGE_CODE,
        0,
        allocation_len,
        0,
    ];

    let data = execute_scsi_command(&mut sg_raw, &cmd, policy)?;

    let mut reader = &data[..];
    let page: AddressAssignmentPage = unsafe {
        reader
            .read_be_value()
            .map_err(|err| ChangerError::other(ChangerErrorKind::InvalidResponse, err.into()))?
    };

    if page.data_len != 23 {
        return Err(ChangerError::other(
            ChangerErrorKind::InvalidResponse,
            format_err!("unexpected address assignment page len ({} != 23)", page.data_len),
        ));
    }
    if page.page_code & 0x3f != ELEMENT_ADDRESS_ASSIGNMENT_PAGE_CODE {
        return Err(ChangerError::other(
            ChangerErrorKind::InvalidResponse,
            format_err!("unexpected page code 0x{:02x}", page.page_code),
        ));
    }

    Ok(ElementAddressAssignment {
        arms: (page.first_transport_element_address, page.transport_element_count),
        slots: (page.first_storage_element_address, page.storage_element_count),
        impexp: (page.first_import_export_element_address, page.import_export_element_count),
        drives: (page.first_transfer_element_address, page.transfer_element_count),
    })
}

fn element_type_byte1(kind: ElementKind, want_voltag: bool) -> u8 {
    let voltag_bit = if want_voltag { 1u8 << 4 } else { 0 };
    let type_code = match kind {
        ElementKind::Arm => 1,
        ElementKind::Slot => 2,
        ElementKind::Impexp => 3,
        ElementKind::Drive => 4,
    };
    voltag_bit | type_code
}

fn scsi_read_element_status_cdb(start: u16, count: u16, kind: ElementKind, want_voltag: bool, want_dvcid: bool, allocation_len: u32) -> Vec<u8> {
    let mut cmd = Vec::with_capacity(12);
    cmd.push(0xB8); // READ ELEMENT STATUS
    cmd.push(element_type_byte1(kind, want_voltag));
    cmd.extend(start.to_be_bytes());
    cmd.extend(count.to_be_bytes());
    cmd.push(if want_dvcid { 0b001 } else { 0b000 }); // CurData=0, DVCID
    cmd.extend(&allocation_len.to_be_bytes()[1..4]);
    cmd.push(0);
    cmd.push(0);
    cmd
}

#[repr(C, packed)]
#[derive(endian_trait::Endian)]
struct ElementStatusHeader {
    first_element_address_reported: u16,
    number_of_elements_available: u16,
    reserved: u8,
    byte_count_of_report_available: [u8; 3],
}

#[repr(C, packed)]
#[derive(endian_trait::Endian)]
struct SubHeader {
    element_type_code: u8,
    flags: u8,
    descriptor_length: u16,
    reserved: u8,
    byte_count_of_descriptor_data_available: [u8; 3],
}

#[repr(C, packed)]
#[derive(endian_trait::Endian)]
struct ElementDescriptor {
    element_address: u16,
    flags1: u8,
    reserved_3: u8,
    additional_sense_code: u8,
    additional_sense_code_qualifier: u8,
    id_valid_or_reserved: u8,
    scsi_bus_address_or_reserved: u8,
    reserved_8: u8,
    flags2: u8,
    source_storage_element_address: u16,
}

#[repr(C, packed)]
#[derive(endian_trait::Endian)]
struct DvcidHead {
    code_set: u8,
    identifier_type: u8,
    reserved: u8,
    identifier_len: u8,
}

fn read_optional_volume_tag<R: Read>(reader: &mut R, flags: u8, full: bool) -> Result<Option<String>, Error> {
    if (flags & 128) != 0 {
        let tmp = reader.read_exact_allocated(SCSI_VOLUME_TAG_LEN)?;
        if full {
            return Ok(Some(scsi_ascii_to_string(&tmp)));
        }
    }
    Ok(None)
}

fn skip_alternate_volume_tag<R: Read>(reader: &mut R, flags: u8) -> Result<(), Error> {
    if (flags & 64) != 0 {
        reader.read_exact_allocated(SCSI_VOLUME_TAG_LEN)?;
    }
    Ok(())
}

fn decode_drive_id<R: Read>(reader: &mut R) -> Option<String> {
    let dvcid: DvcidHead = unsafe { reader.read_be_value().ok()? };
    match (dvcid.code_set, dvcid.identifier_type) {
        (2, 0) => {
            let serial = reader.read_exact_allocated(dvcid.identifier_len as usize).ok()?;
            Some(scsi_ascii_to_string(&serial))
        }
        (2, 1) if dvcid.identifier_len == 34 => {
            let _vendor = reader.read_exact_allocated(8).ok()?;
            let _model = reader.read_exact_allocated(16).ok()?;
            let serial = reader.read_exact_allocated(10).ok()?;
            Some(scsi_ascii_to_string(&serial))
        }
        _ => None,
    }
}

struct DecodedPage {
    last_element_address: Option<u16>,
    elements: Vec<LibraryElement>,
}

fn decode_element_status_page(data: &[u8], kind: ElementKind, start_element_address: u16, want_dvcid: bool) -> Result<DecodedPage, Error> {
    let mut elements = Vec::new();
    let mut last_element_address = None;

    let mut reader = data;
    let head: ElementStatusHeader = unsafe { reader.read_be_value()? };

    if head.number_of_elements_available == 0 {
        return Ok(DecodedPage { last_element_address, elements });
    }
    if head.first_element_address_reported < start_element_address {
        bail!("got wrong first_element_address_reported");
    }

    let len = head.byte_count_of_report_available;
    let len = ((len[0] as usize) << 16) + ((len[1] as usize) << 8) + (len[2] as usize);

    use std::cmp::Ordering;
    match len.cmp(&reader.len()) {
        Ordering::Less => reader = &reader[..len],
        Ordering::Greater => bail!("wrong amount of data: expected {}, got {}", len, reader.len()),
        Ordering::Equal => (),
    }

    while !reader.is_empty() {
        let subhead: SubHeader = unsafe { reader.read_be_value()? };

        let len = subhead.byte_count_of_descriptor_data_available;
        let mut len = ((len[0] as usize) << 16) + ((len[1] as usize) << 8) + (len[2] as usize);
        if len > reader.len() {
            len = reader.len();
        }
        let descr_data = reader.read_exact_allocated(len)?;

        let descr_len = subhead.descriptor_length as usize;
        if descr_len == 0 {
            bail!("got elements, but descriptor length 0");
        }

        for descriptor in descr_data.chunks_exact(descr_len) {
            let mut reader = descriptor;
            let desc: ElementDescriptor = unsafe { reader.read_be_value()? };

            let full = (desc.flags1 & 1) != 0;
            let volume_tag = read_optional_volume_tag(&mut reader, desc.flags1, full)?;
            skip_alternate_volume_tag(&mut reader, desc.flags1)?;

            let source_address = if kind == ElementKind::Drive && (desc.flags2 & 128) != 0 {
                Some(desc.source_storage_element_address)
            } else {
                None
            };

            let drive_id = if kind == ElementKind::Drive && want_dvcid {
                decode_drive_id(&mut reader)
            } else {
                None
            };

            last_element_address = Some(desc.element_address);

            elements.push(LibraryElement {
                kind,
                address: desc.element_address,
                full,
                volume_label: volume_tag,
                source_address,
                drive_id,
                exception: None,
                flags: 0,
            });
        }
    }

    Ok(DecodedPage { last_element_address, elements })
}

/// READ ELEMENT STATUS for a single element kind, chunked and with retry.
///
/// The request window (`chunk`) starts at `max_chunk` (or `count`, if
/// `max_chunk` is `None` or larger) and halves on failure down to a floor
/// of 1, so libraries that refuse large windows still complete the query.
pub fn element_status<F: AsRawFd>(
    file: &mut F,
    kind: ElementKind,
    first_address: u16,
    count: u16,
    flags: ElementStatusFlags,
    max_chunk: Option<u16>,
    policy: &RetryPolicy,
) -> Result<Vec<LibraryElement>, ChangerError> {
    let allocation_len: u32 = 0xFFFF;
    let mut sg_raw = SgRaw::new(file, allocation_len as usize).map_err(|err| ChangerError::other(ChangerErrorKind::Io, err))?;
    sg_raw.set_timeout(5 * 60);

    let mut elements = query_elements(&mut sg_raw, kind, first_address, count, flags.get_label, flags.get_drive_id && !flags.sep_sn_query, max_chunk, policy)?;

    if kind == ElementKind::Drive && flags.get_drive_id && flags.sep_sn_query {
        // The changer refuses {voltag, dvcid} in one request: issue a
        // drive-id-only pass and merge it into the first reply by address.
        let by_id = query_elements(&mut sg_raw, kind, first_address, count, false, true, max_chunk, policy)?;
        for elem in elements.iter_mut() {
            if let Some(other) = by_id.iter().find(|e| e.address == elem.address) {
                elem.drive_id = other.drive_id.clone();
            }
        }
    }

    if elements.len() != count as usize {
        return Err(ChangerError::other(
            ChangerErrorKind::InvalidResponse,
            format_err!("expected {} elements, got {}", count, elements.len()),
        ));
    }

    Ok(elements)
}

fn query_elements<F: AsRawFd>(
    sg_raw: &mut SgRaw<F>,
    kind: ElementKind,
    first_address: u16,
    count: u16,
    want_voltag: bool,
    want_dvcid: bool,
    max_chunk: Option<u16>,
    policy: &RetryPolicy,
) -> Result<Vec<LibraryElement>, ChangerError> {
    let allocation_len: u32 = 0xFFFF;
    let mut start = first_address;
    let mut chunk = max_chunk.map(|m| m.min(count)).unwrap_or(count).max(1);
    let mut collected = Vec::new();

    while collected.len() < count as usize {
        let remaining = count - collected.len() as u16;
        let want = chunk.min(remaining).max(1);

        let cmd = scsi_read_element_status_cdb(start, want, kind, want_voltag, want_dvcid, allocation_len);

        match execute_scsi_command(sg_raw, &cmd, policy) {
            Ok(data) => {
                let page = decode_element_status_page(&data, kind, start, want_dvcid)
                    .map_err(|err| ChangerError::other(ChangerErrorKind::InvalidResponse, err))?;

                if page.elements.is_empty() {
                    return Err(ChangerError::other(
                        ChangerErrorKind::InvalidResponse,
                        format_err!("changer returned no elements for window starting at {}", start),
                    ));
                }

                start = page.last_element_address.map(|a| a + 1).unwrap_or(start + page.elements.len() as u16);
                collected.extend(page.elements);
            }
            Err(err) if chunk > 1 => {
                log::info!("read element status window of {} failed ({}), halving chunk size", chunk, err.message);
                chunk /= 2;
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Ok(collected)
}

const CHANGER_MOVE_TIMEOUT: usize = 60 * 5;

/// MOVE MEDIUM (A5h): move a unit of media from `source` to `destination`
/// via the robot arm at `arm_address`. Returns only on completion or a
/// definitive error.
pub fn move_medium<F: AsRawFd>(file: &mut F, arm_address: u16, source_address: u16, destination_address: u16, policy: &RetryPolicy) -> Result<(), ChangerError> {
    let mut cmd = Vec::with_capacity(12);
    cmd.push(0xA5); // MOVE MEDIUM
    cmd.push(0);
    cmd.extend(arm_address.to_be_bytes());
    cmd.extend(source_address.to_be_bytes());
    cmd.extend(destination_address.to_be_bytes());
    cmd.push(0);
    cmd.push(0);
    cmd.push(0); // Invert=0
    cmd.push(0);

    let mut sg_raw = SgRaw::new(file, 64).map_err(|err| ChangerError::other(ChangerErrorKind::Io, err))?;
    sg_raw.set_timeout(CHANGER_MOVE_TIMEOUT);

    execute_scsi_command(&mut sg_raw, &cmd, policy)?;
    Ok(())
}

/// INQUIRY: cheap liveness probe, also used by the TLC PING handler.
pub fn inquiry<F: AsRawFd>(file: &mut F) -> Result<InquiryInfo, ChangerError> {
    scsi_inquiry(file).map_err(|err| ChangerError::other(ChangerErrorKind::Io, err))
}

#[cfg(test)]
mod test {
    use super::*;

    struct Desc {
        address: u16,
        voltag: Option<String>,
    }

    fn build_page(descs: &[Desc], element_type: u8) -> Vec<u8> {
        let mut descriptor_bytes = Vec::new();
        for d in descs {
            descriptor_bytes.push(build_descriptor(d));
        }
        let desc_len = descriptor_bytes.first().map(|d| d.len()).unwrap_or(0) as u16;
        let descriptor_byte_count = desc_len * descriptor_bytes.len() as u16;
        let byte_count = 8 + descriptor_byte_count;

        let mut res = Vec::new();
        let first_addr = descs.first().map(|d| d.address).unwrap_or(0);
        res.extend_from_slice(&first_addr.to_be_bytes());
        res.extend_from_slice(&(descriptor_bytes.len() as u16).to_be_bytes());
        res.push(0);
        res.extend_from_slice(&(byte_count as u32).to_be_bytes()[1..]);

        res.push(element_type);
        res.push(0x80);
        res.extend_from_slice(&desc_len.to_be_bytes());
        res.push(0);
        res.extend_from_slice(&(descriptor_byte_count as u32).to_be_bytes()[1..]);

        for d in descriptor_bytes {
            res.extend_from_slice(&d);
        }
        res
    }

    fn build_descriptor(d: &Desc) -> Vec<u8> {
        let mut res = Vec::new();
        res.extend_from_slice(&d.address.to_be_bytes());
        res.push(if d.voltag.is_some() { 0x01 } else { 0x00 });
        res.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0x80]);
        res.extend_from_slice(&d.address.to_be_bytes());

        if let Some(tag) = &d.voltag {
            res.extend_from_slice(tag.as_bytes());
            let rem = SCSI_VOLUME_TAG_LEN - tag.as_bytes().len();
            res.resize(res.len() + rem, 0);
        }
        res
    }

    #[test]
    fn decodes_two_slots() {
        let descs = vec![
            Desc { address: 10, voltag: Some("VOL0001".into()) },
            Desc { address: 11, voltag: Some("VOL0002".into()) },
        ];
        let page = build_page(&descs, 2);
        let decoded = decode_element_status_page(&page, ElementKind::Slot, 10, false).unwrap();
        assert_eq!(decoded.elements.len(), 2);
        assert_eq!(decoded.elements[0].volume_label.as_deref(), Some("VOL0001"));
        assert_eq!(decoded.elements[1].address, 11);
    }

    #[test]
    fn empty_slot_has_no_label() {
        let descs = vec![Desc { address: 5, voltag: None }];
        let page = build_page(&descs, 2);
        let decoded = decode_element_status_page(&page, ElementKind::Slot, 5, false).unwrap();
        assert_eq!(decoded.elements.len(), 1);
        assert!(!decoded.elements[0].full);
        assert!(decoded.elements[0].volume_label.is_none());
    }

    #[test]
    fn truncated_page_is_rejected() {
        let descs = vec![Desc { address: 0, voltag: Some("0123456789".into()) }];
        let page = build_page(&descs, 2);
        let truncated = &page[..page.len() - 10];
        assert!(decode_element_status_page(truncated, ElementKind::Slot, 0, false).is_err());
    }
}
