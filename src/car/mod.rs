//! Implementation of the [car](https://ipld.io/specs/transport/car/) format.
//!
//! Account repositories are exported by hosting servers as CARv1 archives and
//! stored locally in the same format.

mod error;
mod header;
mod reader;
mod util;
mod writer;

pub use self::{
    error::Error,
    header::{CarHeader, CarHeaderV1},
    reader::CarReader,
    writer::CarWriter,
};

/// Multicodec code for DAG-CBOR.
pub const DAG_CBOR: u64 = 0x71;

/// Multicodec code for raw bytes.
pub const RAW: u64 = 0x55;
