//! Passive lock state from manufacturer advertisements.
//!
//! Locks broadcast their bolt and door state either under the Yale
//! manufacturer id, where the data is the lock body directly, or wrapped in
//! an Apple HomeKit envelope (`[type, stl, body…]`, body length in the low
//! five STL bits). The first byte selects the encoding:
//!
//! - `0x06`: `body[0]` packs the lock code (low nibble) and door code (high
//!   nibble)
//! - `0x11`: `body` is a 4-byte little-endian broadcast counter followed by
//!   one sealed 16-byte block carrying the same packed byte at offset 0
//!
//! Decoding is pure and never fails: data that is not a lock advertisement
//! yields `None`, and an encrypted broadcast that cannot be opened yields
//! [`AdvertisementState::DecodeAmbiguous`] rather than a guessed state.

use std::collections::HashMap;
use tracing::debug;

use crate::{
    crypto::{Cipher, Direction, Key, Nonce},
    error::{LockError, Result},
    protocol::{open_block, BLOCK_SIZE},
    types::{DoorStatus, LockState, LockStatus},
    ADVERTISEMENT_ENCRYPTED, ADVERTISEMENT_UNENCRYPTED, APPLE_MANUFACTURER_ID,
    YALE_MANUFACTURER_ID,
};

const HAP_LENGTH_MASK: u8 = 0x1F;
const COUNTER_SIZE: usize = 4;

/// Result of decoding a lock advertisement
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdvertisementState {
    /// Lock and door state (never battery or auth)
    Decoded(LockState),
    /// Encrypted lock broadcast that could not be opened
    DecodeAmbiguous,
}

impl AdvertisementState {
    /// The decoded state
    ///
    /// # Errors
    ///
    /// Returns [`LockError::DecodeAmbiguous`] for a broadcast that could not
    /// be opened.
    pub const fn state(self) -> Result<LockState> {
        match self {
            Self::Decoded(state) => Ok(state),
            Self::DecodeAmbiguous => Err(LockError::DecodeAmbiguous),
        }
    }
}

/// Offline key material used to open encrypted broadcasts
#[derive(Clone, Copy)]
pub struct OfflineKey<'a> {
    /// Cipher the lock sealed the broadcast with
    pub cipher: &'a dyn Cipher,
    /// The lock's offline key
    pub key: &'a Key,
}

/// Decode the packed lock/door byte
#[must_use]
pub const fn unpack_state(packed: u8) -> LockState {
    LockState::new(
        LockStatus::from_nibble(packed),
        DoorStatus::from_nibble(packed >> 4),
        None,
        None,
    )
}

/// Split manufacturer data into the advertisement type and lock body
fn lock_body(manufacturer_id: u16, data: &[u8]) -> Option<(u8, &[u8])> {
    match manufacturer_id {
        YALE_MANUFACTURER_ID => {
            let (&kind, body) = data.split_first()?;
            Some((kind, body))
        }
        APPLE_MANUFACTURER_ID => {
            let (&kind, rest) = data.split_first()?;
            let (&stl, rest) = rest.split_first()?;
            let body = rest.get(..usize::from(stl & HAP_LENGTH_MASK))?;
            Some((kind, body))
        }
        _ => None,
    }
}

fn decode_encrypted(body: &[u8], key: Option<OfflineKey<'_>>) -> AdvertisementState {
    let Some(key) = key else {
        debug!("Encrypted advertisement and no offline key");
        return AdvertisementState::DecodeAmbiguous;
    };
    let (Some(counter), Some(block)) = (
        body.get(..COUNTER_SIZE),
        body.get(COUNTER_SIZE..COUNTER_SIZE + BLOCK_SIZE),
    ) else {
        debug!("Encrypted advertisement truncated to {} bytes", body.len());
        return AdvertisementState::DecodeAmbiguous;
    };

    let counter = u32::from_le_bytes([counter[0], counter[1], counter[2], counter[3]]);
    let nonce = Nonce::new(counter, Direction::Broadcast);
    match open_block(key.cipher, key.key, &nonce, block) {
        Ok(plain) => AdvertisementState::Decoded(unpack_state(plain[0])),
        Err(e) => {
            debug!("Encrypted advertisement rejected: {e}");
            AdvertisementState::DecodeAmbiguous
        }
    }
}

/// Decode one manufacturer data entry
#[must_use]
pub fn decode_advertisement(
    manufacturer_id: u16,
    data: &[u8],
    key: Option<OfflineKey<'_>>,
) -> Option<AdvertisementState> {
    let (kind, body) = lock_body(manufacturer_id, data)?;
    match kind {
        ADVERTISEMENT_UNENCRYPTED => body
            .first()
            .map(|&packed| AdvertisementState::Decoded(unpack_state(packed))),
        ADVERTISEMENT_ENCRYPTED => Some(decode_encrypted(body, key)),
        _ => None,
    }
}

/// Decode a full manufacturer data map, preferring Yale over Apple data
#[must_use]
pub fn decode_manufacturer_data(
    manufacturer_data: &HashMap<u16, Vec<u8>>,
    key: Option<OfflineKey<'_>>,
) -> Option<AdvertisementState> {
    [YALE_MANUFACTURER_ID, APPLE_MANUFACTURER_ID]
        .iter()
        .filter_map(|id| {
            manufacturer_data
                .get(id)
                .and_then(|data| decode_advertisement(*id, data, key))
        })
        .next()
}
