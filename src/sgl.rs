use bytes::Bytes;

use crate::error::{Error, Result};

/// Scatter-gather list describing one logically contiguous payload.
///
/// Entries are reference-counted byte slices, so cloning an `Sgl` at
/// submission transfers ownership into the pipeline without copying the
/// payload; the application gets its entries back in the completion
/// callback.
///
/// `total_data_size` is caller-declared and cached; `validate` checks it
/// against the entries before the pipeline trusts it.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Sgl {
    entries: Vec<Bytes>,
    total_data_size: usize,
}

impl Sgl {
    pub fn new() -> Self {
        Sgl::default()
    }

    /// Builds an SGL whose cached total is computed from the entries.
    pub fn from_entries(entries: Vec<Bytes>) -> Self {
        let total_data_size = entries.iter().map(Bytes::len).sum();
        Sgl {
            entries,
            total_data_size,
        }
    }

    /// Builds an SGL with a caller-declared total, to be checked later by
    /// `validate`.
    pub fn with_total(entries: Vec<Bytes>, total_data_size: usize) -> Self {
        Sgl {
            entries,
            total_data_size,
        }
    }

    pub fn push(&mut self, data: Bytes) {
        self.total_data_size += data.len();
        self.entries.push(data);
    }

    pub fn entries(&self) -> &[Bytes] {
        &self.entries
    }

    pub fn total_data_size(&self) -> usize {
        self.total_data_size
    }

    pub fn is_empty(&self) -> bool {
        self.total_data_size == 0
    }

    pub fn validate(&self) -> Result<()> {
        let sum: usize = self.entries.iter().map(Bytes::len).sum();
        if sum != self.total_data_size {
            return Err(Error::ErrSglSizeMismatch);
        }
        Ok(())
    }
}
