//! Community-edition delta stubs.
//!
//! Delta compression between revisions is an enterprise feature; the
//! community build keeps the call sites (the revision cache's delta slot)
//! but every computation answers [`Error::DeltasNotSupported`].

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Computes a delta that transforms `old` into `new`.
pub fn diff(_old: &Map<String, Value>, _new: &Map<String, Value>) -> Result<Vec<u8>> {
    Err(Error::DeltasNotSupported)
}

/// Applies `delta` to `old` in place.
pub fn patch(_old: &mut Map<String, Value>, _delta: &Map<String, Value>) -> Result<()> {
    Err(Error::DeltasNotSupported)
}
