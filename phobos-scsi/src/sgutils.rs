//! Raw SCSI pass-through bindings for `libsgutils2`.
//!
//! Incomplete: only what the changer driver needs (INQUIRY, MODE SENSE,
//! READ ELEMENT STATUS, MOVE MEDIUM all build their CDBs by hand and push
//! them through [`SgRaw::do_command`] / [`SgRaw::do_in_command`]).
//!
//! See `/usr/include/scsi/sg_pt.h`.

use std::ffi::CStr;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use anyhow::{bail, format_err, Error};
use libc::{c_char, c_int};
use serde::{Deserialize, Serialize};

use proxmox_io::ReadExt;

#[derive(thiserror::Error, Debug)]
pub struct SenseInfo {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl std::fmt::Display for SenseInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sense_text = SENSE_KEY_DESCRIPTIONS
            .get(self.sense_key as usize)
            .map(|s| String::from(*s))
            .unwrap_or_else(|| format!("Invalid sense {:02X}", self.sense_key));

        if self.asc == 0 && self.ascq == 0 {
            write!(f, "{}", sense_text)
        } else {
            write!(f, "{}, {}", sense_text, get_asc_ascq_string(self.asc, self.ascq))
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ScsiError {
    #[error("{0}")]
    Error(#[from] Error),
    #[error("{0}")]
    Sense(#[from] SenseInfo),
}

impl From<std::io::Error> for ScsiError {
    fn from(error: std::io::Error) -> Self {
        Self::Error(error.into())
    }
}

impl ScsiError {
    /// True for the sense that says "not ready, becoming ready" -- the
    /// changer is still finishing an inventory or a prior move.
    pub fn is_becoming_ready(&self) -> bool {
        matches!(self, ScsiError::Sense(s) if s.sense_key == SENSE_KEY_NOT_READY && s.asc == 0x04 && s.ascq == 1)
    }
}

#[repr(C)]
struct SgPtBase {
    _private: [u8; 0],
}

#[repr(transparent)]
struct SgPt {
    raw: NonNull<SgPtBase>,
}

impl Drop for SgPt {
    fn drop(&mut self) {
        unsafe { destruct_scsi_pt_obj(self.as_mut_ptr()) };
    }
}

impl SgPt {
    fn new() -> Result<Self, Error> {
        Ok(Self {
            raw: NonNull::new(unsafe { construct_scsi_pt_obj() })
                .ok_or_else(|| format_err!("construct_scsi_pt_obj failed"))?,
        })
    }

    fn as_ptr(&self) -> *const SgPtBase {
        self.raw.as_ptr()
    }

    fn as_mut_ptr(&mut self) -> *mut SgPtBase {
        self.raw.as_ptr()
    }
}

/// Peripheral device type text, see INQUIRY.
pub const PERIPHERAL_DEVICE_TYPE_TEXT: [&str; 32] = [
    "Disk Drive",
    "Tape Drive",
    "Printer",
    "Processor",
    "Write-once",
    "CD-ROM",
    "Scanner",
    "Optical",
    "Medium Changer",
    "Communications",
    "ASC IT8",
    "ASC IT8",
    "RAID Array",
    "Enclosure Services",
    "Simplified direct-access",
    "Optical card reader/writer",
    "Bridging Expander",
    "Object-based Storage",
    "Automation/Drive Interface",
    "Security manager",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Unknown",
];

pub const SENSE_KEY_NO_SENSE: u8 = 0x00;
pub const SENSE_KEY_RECOVERED_ERROR: u8 = 0x01;
pub const SENSE_KEY_NOT_READY: u8 = 0x02;
pub const SENSE_KEY_MEDIUM_ERROR: u8 = 0x03;
pub const SENSE_KEY_HARDWARE_ERROR: u8 = 0x04;
pub const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub const SENSE_KEY_UNIT_ATTENTION: u8 = 0x06;
pub const SENSE_KEY_DATA_PROTECT: u8 = 0x07;
pub const SENSE_KEY_BLANK_CHECK: u8 = 0x08;
pub const SENSE_KEY_ABORTED_COMMAND: u8 = 0x0b;

const SAM_STAT_CHECK_CONDITION: i32 = 0x02;

pub const SENSE_KEY_DESCRIPTIONS: [&str; 16] = [
    "No Sense",
    "Recovered Error",
    "Not Ready",
    "Medium Error",
    "Hardware Error",
    "Illegal Request",
    "Unit Attention",
    "Data Protect",
    "Blank Check",
    "Vendor specific",
    "Copy Aborted",
    "Aborted Command",
    "Equal",
    "Volume Overflow",
    "Miscompare",
    "Completed",
];

#[repr(C, packed)]
#[derive(endian_trait::Endian)]
struct InquiryPage {
    peripheral_type: u8,
    rmb: u8,
    version: u8,
    flags3: u8,
    additional_length: u8,
    flags5: u8,
    flags6: u8,
    flags7: u8,
    vendor: [u8; 8],
    product: [u8; 16],
    revision: [u8; 4],
}

#[repr(C, packed)]
#[derive(endian_trait::Endian, Debug)]
pub struct RequestSenseFixed {
    pub response_code: u8,
    obsolete: u8,
    pub flags2: u8,
    pub information: [u8; 4],
    pub additional_sense_len: u8,
    pub command_specific_information: [u8; 4],
    pub additional_sense_code: u8,
    pub additional_sense_code_qualifier: u8,
    pub field_replaceable_unit_code: u8,
    pub sense_key_specific: [u8; 3],
}

#[repr(C, packed)]
#[derive(endian_trait::Endian, Debug)]
struct RequestSenseDescriptor {
    response_code: u8,
    sense_key: u8,
    additional_sense_code: u8,
    additional_sense_code_qualifier: u8,
    reserved: [u8; 4],
    additional_sense_len: u8,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InquiryInfo {
    pub peripheral_type: u8,
    pub peripheral_type_text: String,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

const SCSI_PT_DO_START_OK: c_int = 0;
const SCSI_PT_DO_BAD_PARAMS: c_int = 1;
const SCSI_PT_DO_TIMEOUT: c_int = 2;

const SCSI_PT_RESULT_GOOD: c_int = 0;
const SCSI_PT_RESULT_STATUS: c_int = 1;
const SCSI_PT_RESULT_SENSE: c_int = 2;
const SCSI_PT_RESULT_TRANSPORT_ERR: c_int = 3;
const SCSI_PT_RESULT_OS_ERR: c_int = 4;

#[link(name = "sgutils2")]
extern "C" {
    fn sg_is_scsi_cdb(cdbp: *const u8, clen: c_int) -> bool;

    fn construct_scsi_pt_obj() -> *mut SgPtBase;
    fn destruct_scsi_pt_obj(objp: *mut SgPtBase);

    fn set_scsi_pt_data_in(objp: *mut SgPtBase, dxferp: *mut u8, dxfer_ilen: c_int);
    fn set_scsi_pt_cdb(objp: *mut SgPtBase, cdb: *const u8, cdb_len: c_int);
    fn set_scsi_pt_sense(objp: *mut SgPtBase, sense: *mut u8, max_sense_len: c_int);

    fn do_scsi_pt(objp: *mut SgPtBase, fd: c_int, timeout_secs: c_int, verbose: c_int) -> c_int;

    fn get_scsi_pt_resid(objp: *const SgPtBase) -> c_int;
    fn get_scsi_pt_sense_len(objp: *const SgPtBase) -> c_int;
    fn get_scsi_pt_status_response(objp: *const SgPtBase) -> c_int;
    fn get_scsi_pt_result_category(objp: *const SgPtBase) -> c_int;
    fn get_scsi_pt_os_err(objp: *const SgPtBase) -> c_int;

    fn sg_get_asc_ascq_str(asc: c_int, ascq: c_int, buff_len: c_int, buffer: *mut c_char) -> *const c_char;
}

/// Safe interface to run raw SCSI commands against an open device file.
pub struct SgRaw<'a, F> {
    file: &'a mut F,
    buffer: Box<[u8]>,
    sense_buffer: [u8; 32],
    timeout: i32,
}

pub fn get_asc_ascq_string(asc: u8, ascq: u8) -> String {
    let mut buffer = [0u8; 1024];
    let res = unsafe { sg_get_asc_ascq_str(asc as c_int, ascq as c_int, buffer.len() as c_int, buffer.as_mut_ptr() as *mut c_char) };

    if res.is_null() {
        return format!("ASC={:02x}h, ASCQ={:02x}h", asc, ascq);
    }
    unsafe { CStr::from_ptr(res) }
        .to_str()
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| format!("ASC={:02x}h, ASCQ={:02x}h", asc, ascq))
}

/// Allocate a page-aligned buffer, required by SG RAWIO transfers.
pub fn alloc_page_aligned_buffer(buffer_size: usize) -> Result<Box<[u8]>, Error> {
    if buffer_size == 0 {
        return Ok(Box::new([]));
    }
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let layout = std::alloc::Layout::from_size_align(buffer_size, page_size)?;
    let dinp = unsafe { std::alloc::alloc_zeroed(layout) };
    if dinp.is_null() {
        bail!("alloc SCSI output buffer failed");
    }
    let buffer_slice = unsafe { std::slice::from_raw_parts_mut(dinp, buffer_size) };
    Ok(unsafe { Box::from_raw(buffer_slice) })
}

impl<'a, F: AsRawFd> SgRaw<'a, F> {
    pub fn new(file: &'a mut F, buffer_size: usize) -> Result<Self, Error> {
        Ok(Self {
            file,
            buffer: alloc_page_aligned_buffer(buffer_size)?,
            sense_buffer: [0u8; 32],
            timeout: 0,
        })
    }

    /// Command timeout in seconds, 0 means the library default (60s).
    pub fn set_timeout(&mut self, seconds: usize) {
        self.timeout = seconds.min(i32::MAX as usize) as i32;
    }

    fn create_scsi_pt_obj(&mut self) -> Result<SgPt, Error> {
        let mut ptvp = SgPt::new()?;

        if !self.buffer.is_empty() {
            unsafe { set_scsi_pt_data_in(ptvp.as_mut_ptr(), self.buffer.as_mut_ptr(), self.buffer.len() as c_int) };
        }

        unsafe { set_scsi_pt_sense(ptvp.as_mut_ptr(), self.sense_buffer.as_mut_ptr(), self.sense_buffer.len() as c_int) };

        Ok(ptvp)
    }

    fn do_scsi_pt_checked(&mut self, ptvp: &mut SgPt) -> Result<(), ScsiError> {
        let res = unsafe { do_scsi_pt(ptvp.as_mut_ptr(), self.file.as_raw_fd(), self.timeout, 0) };
        match res {
            SCSI_PT_DO_START_OK => {}
            SCSI_PT_DO_BAD_PARAMS => return Err(format_err!("do_scsi_pt failed - bad pass through setup").into()),
            SCSI_PT_DO_TIMEOUT => return Err(format_err!("do_scsi_pt failed - timeout").into()),
            code if code < 0 => {
                let errno = unsafe { get_scsi_pt_os_err(ptvp.as_ptr()) };
                let err = nix::errno::Errno::from_i32(errno);
                return Err(format_err!("do_scsi_pt failed with err {}", err).into());
            }
            unknown => return Err(format_err!("do_scsi_pt failed: unknown error {}", unknown).into()),
        }

        let sense_len = unsafe { get_scsi_pt_sense_len(ptvp.as_ptr()) };
        let mut res_cat = unsafe { get_scsi_pt_result_category(ptvp.as_ptr()) };
        let status = unsafe { get_scsi_pt_status_response(ptvp.as_ptr()) };

        if res_cat == SCSI_PT_RESULT_TRANSPORT_ERR && status == SAM_STAT_CHECK_CONDITION {
            res_cat = SCSI_PT_RESULT_SENSE;
        }

        match res_cat {
            SCSI_PT_RESULT_GOOD => Ok(()),
            SCSI_PT_RESULT_STATUS => {
                if status != 0 {
                    return Err(format_err!("unknown scsi error - status response {}", status).into());
                }
                Ok(())
            }
            SCSI_PT_RESULT_SENSE => {
                if sense_len == 0 {
                    return Err(format_err!("scsi command failed, but got no sense data").into());
                }

                let code = self.sense_buffer[0] & 0x7f;
                let mut reader = &self.sense_buffer[..(sense_len as usize)];

                let sense = match code {
                    0x70 => {
                        let sense: RequestSenseFixed = unsafe { reader.read_be_value()? };
                        SenseInfo {
                            sense_key: sense.flags2 & 0xf,
                            asc: sense.additional_sense_code,
                            ascq: sense.additional_sense_code_qualifier,
                        }
                    }
                    0x72 => {
                        let sense: RequestSenseDescriptor = unsafe { reader.read_be_value()? };
                        SenseInfo {
                            sense_key: sense.sense_key & 0xf,
                            asc: sense.additional_sense_code,
                            ascq: sense.additional_sense_code_qualifier,
                        }
                    }
                    0x71 | 0x73 => return Err(format_err!("scsi command failed: received deferred sense").into()),
                    unknown => return Err(format_err!("scsi command failed: invalid sense response code {:x}", unknown).into()),
                };

                Err(ScsiError::Sense(sense))
            }
            SCSI_PT_RESULT_TRANSPORT_ERR => Err(format_err!("scsi command failed: transport error").into()),
            SCSI_PT_RESULT_OS_ERR => {
                let errno = unsafe { get_scsi_pt_os_err(ptvp.as_ptr()) };
                let err = nix::errno::Errno::from_i32(errno);
                Err(format_err!("scsi command failed with err {}", err).into())
            }
            unknown => Err(format_err!("scsi command failed: unknown result category {}", unknown).into()),
        }
    }

    /// Run `cmd`, returning the data actually transferred into the internal buffer.
    pub fn do_command(&mut self, cmd: &[u8]) -> Result<&[u8], ScsiError> {
        if !unsafe { sg_is_scsi_cdb(cmd.as_ptr(), cmd.len() as c_int) } {
            return Err(format_err!("no valid SCSI command").into());
        }
        if self.buffer.len() < 16 {
            return Err(format_err!("input buffer too small").into());
        }

        let mut ptvp = self.create_scsi_pt_obj()?;
        unsafe { set_scsi_pt_cdb(ptvp.as_mut_ptr(), cmd.as_ptr(), cmd.len() as c_int) };

        self.do_scsi_pt_checked(&mut ptvp)?;

        let resid = unsafe { get_scsi_pt_resid(ptvp.as_ptr()) } as usize;
        if resid > self.buffer.len() {
            return Err(format_err!("do_scsi_pt failed - got strange resid (value too big)").into());
        }
        let data_len = self.buffer.len() - resid;
        Ok(&self.buffer[..data_len])
    }
}

/// Converts SCSI ASCII text into a String, trimming NUL and spaces.
pub fn scsi_ascii_to_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data).trim_matches(char::from(0)).trim().to_string()
}

/// INQUIRY (12h). Returns vendor/product/revision and peripheral type.
pub fn scsi_inquiry<F: AsRawFd>(file: &mut F) -> Result<InquiryInfo, Error> {
    let allocation_len: u8 = std::mem::size_of::<InquiryPage>() as u8;

    let mut sg_raw = SgRaw::new(file, allocation_len as usize)?;
    sg_raw.set_timeout(30);

    let cmd = [0x12, 0, 0, 0, allocation_len, 0];

    let data = sg_raw.do_command(&cmd).map_err(|err| format_err!("SCSI inquiry failed - {}", err))?;

    let mut reader = data;
    let page: InquiryPage = unsafe { reader.read_be_value()? };
    let peripheral_type = page.peripheral_type & 31;

    Ok(InquiryInfo {
        peripheral_type,
        peripheral_type_text: PERIPHERAL_DEVICE_TYPE_TEXT[peripheral_type as usize].to_string(),
        vendor: scsi_ascii_to_string(&page.vendor),
        product: scsi_ascii_to_string(&page.product),
        revision: scsi_ascii_to_string(&page.revision),
    })
}

/// True if the sense is "INVALID COMMAND OPERATION CODE" -- device does not
/// support the command at all (distinct from a transient failure).
pub fn sense_err_is_invalid_command(err: &SenseInfo) -> bool {
    err.sense_key == SENSE_KEY_ILLEGAL_REQUEST && err.asc == 0x20 && err.ascq == 0x00
}

/// INQUIRY, EVPD=1, page 0x80 (Unit Serial Number). Used by the device
/// adapters (phobos-adapters) to identify the physical drive behind a path.
pub fn scsi_inquiry_unit_serial<F: AsRawFd>(file: &mut F) -> Result<String, Error> {
    let allocation_len: u8 = 0xff;
    let mut sg_raw = SgRaw::new(file, allocation_len as usize)?;
    sg_raw.set_timeout(30);

    let cmd = [0x12, 0x01, 0x80, 0, allocation_len, 0]; // INQUIRY, EVPD=1, page 0x80

    let data = sg_raw.do_command(&cmd).map_err(|err| format_err!("SCSI unit serial inquiry failed - {}", err))?;

    if data.len() < 4 {
        bail!("unit serial number page too short");
    }
    let page_len = data[3] as usize;
    if data.len() < 4 + page_len {
        bail!("unit serial number page truncated");
    }
    Ok(scsi_ascii_to_string(&data[4..4 + page_len]))
}
