//! Export of sampled chains to formats other than the JSON chain record.

#[cfg(feature = "csv")]
pub mod csv;
