//! SPI allocation.
//!
//! New SPIs are taken as one past the largest SPI already in use for the
//! spacecraft. Gaps left by deleted SAs are not reused, which keeps SPIs
//! monotonic per spacecraft while the largest one survives.

use crate::{
    error::{ConflictError, SadbError},
    sa::FrameType,
    store::Session,
};

/// First SPI handed out for a spacecraft. SPI 0 is reserved.
pub const FIRST_SPI: u16 = 1;

/// Next free SPI for `scid` in the `frame_type` partition.
///
/// Must run inside the write transaction that inserts the new record: the
/// store's writer serialization is what keeps two creators from being handed
/// the same SPI.
///
/// # Errors
/// - `ConflictError::SpiExhausted` when `u16::MAX` is already taken
/// - `SadbError::Backend` when the store cannot be read
pub fn next_available_spi<S: Session>(
    session: &S,
    frame_type: FrameType,
    scid: u16,
) -> Result<u16, SadbError> {
    let max = session
        .max_spi(frame_type, scid)
        .map_err(|e| SadbError::backend("allocate spi", e).for_sa(frame_type, None))?;

    match max {
        None => Ok(FIRST_SPI),
        Some(spi) => spi
            .checked_add(1)
            .ok_or_else(|| ConflictError::SpiExhausted { frame_type, scid }.into()),
    }
}
