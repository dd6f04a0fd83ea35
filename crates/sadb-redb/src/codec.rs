//! CBOR encoding of stored records.

use sadb_core::SecurityAssociation;

use crate::error::RedbStoreError;

/// Encode a record for storage.
pub(crate) fn encode(sa: &SecurityAssociation) -> Result<Vec<u8>, RedbStoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(sa, &mut buf)?;
    Ok(buf)
}

/// Decode a stored record.
pub(crate) fn decode(bytes: &[u8]) -> Result<SecurityAssociation, RedbStoreError> {
    Ok(ciborium::from_reader(bytes)?)
}
