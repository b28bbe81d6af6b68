//! SCSI media-changer driver: MODE SENSE, READ ELEMENT STATUS,
//! MOVE MEDIUM and INQUIRY against a tape library's `/dev/sg*` changer
//! device, built on the raw pass-through bindings in [`sgutils`].

pub mod changer;
pub mod sgutils;

pub use changer::{
    element_status, inquiry, mode_sense, move_medium, ChangerError, ChangerErrorKind, ElementAddressAssignment, ElementStatusFlags, RetryPolicy,
};
pub use sgutils::{scsi_inquiry_unit_serial, InquiryInfo};
