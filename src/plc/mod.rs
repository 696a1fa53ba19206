//! The PLC operation log: wire types, DID documents, validation, the tailing
//! mirror and the offline annotation pass.

mod annotate;
mod doc;
mod mirror;
mod types;
mod validate;

pub use self::{
    annotate::{annotate_log, AnnotateReport},
    doc::{make_doc, DidDocument, DocError, DocumentService, VerificationMethod},
    mirror::{desired_rate, PassReport, PlcMirror},
    types::*,
    validate::{is_valid_did, is_valid_handle, Rejection, Validator, MAX_HANDLE_LEN},
};
