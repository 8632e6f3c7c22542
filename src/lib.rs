#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # yalers
//!
//! A Rust library for operating Yale/August "Access" smart locks over
//! Bluetooth Low Energy.
//!
//! The crate speaks the lock's proprietary GATT protocol directly: it opens
//! an authenticated session, sends lock/unlock/status commands, decodes the
//! replies and unsolicited notifications, and reads lock state passively
//! from manufacturer advertisements.
//!
//! ## Protocol Overview
//!
//! - **GATT service**: `0000fe24-…` with a plaintext characteristic pair
//!   (checksummed frames) and a secure pair (sealed frames)
//! - **Frames**: 18 bytes on both pairs, see [`protocol`]
//! - **Authentication**: a two-step handshake under the lock's offline key
//!   negotiates a session key; lock and unlock only travel sealed with it
//! - **Advertisements**: Apple (HAP) and Yale manufacturer data carry the
//!   bolt and door state, optionally sealed with the offline key
//!
//! The symmetric cipher is not part of this crate. Callers plug it in through
//! the [`Cipher`] trait.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use yalers::{BtleplugTransport, Cipher, Discovery, Lock, LockConfig};
//!
//! # async fn run(cipher: Arc<dyn Cipher>) -> Result<(), Box<dyn std::error::Error>> {
//! let discovery = Discovery::new(
//!     "Front Door",
//!     "AA:BB:CC:DD:EE:FF",
//!     "L2FGH12345",
//!     "000102030405060708090a0b0c0d0e0f",
//!     1,
//! )?;
//!
//! let transport = BtleplugTransport::new().await?;
//! let lock = Lock::new(transport, cipher, discovery, LockConfig::default());
//!
//! let (state, _) = lock.unlock().await?;
//! println!("Lock is now {}", state.lock());
//!
//! lock.disconnect().await;
//! # Ok(())
//! # }
//! ```

/// Manufacturer advertisement decoding
pub mod advertisement;
/// Bluetooth Low Energy transport
pub mod ble;
/// Keys, nonces and the cipher capability
pub mod crypto;
/// Error types and handling
pub mod error;
/// Lock control interface
pub mod lock;
/// Frame codec and status parsing
pub mod protocol;
/// Session state machine
pub mod session;
/// Type definitions and data structures
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use advertisement::{decode_advertisement, decode_manufacturer_data, AdvertisementState};
pub use ble::{Advertisement, BtleplugTransport, Transport};
pub use crypto::{Cipher, Direction, Key, Nonce};
pub use error::{ErrorClass, LockError, Result};
pub use lock::{Lock, Subscription};
pub use protocol::LockEvent;
pub use session::{Session, SessionState};
pub use types::{
    parse_operation_source, AuthState, BatteryState, BusyPolicy, Command, ConnectionInfo,
    Discovery, DoorStatus, LockConfig, LockInfo, LockOperation, LockState, LockStatus,
    LockUpdate, OperationRemoteType, OperationSource, StatusKind, TimeoutConfig, UpdateOrigin,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lock GATT service
pub const SERVICE_UUID: uuid::Uuid = uuid::Uuid::from_u128(0x0000_fe24_0000_1000_8000_0080_5f9b_34fb);

/// Plaintext write characteristic
pub const WRITE_CHARACTERISTIC: uuid::Uuid =
    uuid::Uuid::from_u128(0xbd4a_c611_0b45_11e3_8ffd_0800_200c_9a66);

/// Plaintext read/notify characteristic
pub const READ_CHARACTERISTIC: uuid::Uuid =
    uuid::Uuid::from_u128(0xbd4a_c612_0b45_11e3_8ffd_0800_200c_9a66);

/// Secure write characteristic
pub const SECURE_WRITE_CHARACTERISTIC: uuid::Uuid =
    uuid::Uuid::from_u128(0xbd4a_c613_0b45_11e3_8ffd_0800_200c_9a66);

/// Secure read/notify characteristic
pub const SECURE_READ_CHARACTERISTIC: uuid::Uuid =
    uuid::Uuid::from_u128(0xbd4a_c614_0b45_11e3_8ffd_0800_200c_9a66);

/// Device information: manufacturer name string
pub const MANUFACTURER_NAME_CHARACTERISTIC: uuid::Uuid =
    uuid::Uuid::from_u128(0x0000_2a29_0000_1000_8000_0080_5f9b_34fb);

/// Device information: model number string
pub const MODEL_NUMBER_CHARACTERISTIC: uuid::Uuid =
    uuid::Uuid::from_u128(0x0000_2a24_0000_1000_8000_0080_5f9b_34fb);

/// Device information: serial number string
pub const SERIAL_NUMBER_CHARACTERISTIC: uuid::Uuid =
    uuid::Uuid::from_u128(0x0000_2a25_0000_1000_8000_0080_5f9b_34fb);

/// Device information: firmware revision string
pub const FIRMWARE_REVISION_CHARACTERISTIC: uuid::Uuid =
    uuid::Uuid::from_u128(0x0000_2a26_0000_1000_8000_0080_5f9b_34fb);

/// Apple manufacturer id; HomeKit locks advertise through it
pub const APPLE_MANUFACTURER_ID: u16 = 76;

/// Yale manufacturer id
pub const YALE_MANUFACTURER_ID: u16 = 465;

/// First byte of an unencrypted lock advertisement
pub const ADVERTISEMENT_UNENCRYPTED: u8 = 0x06;

/// First byte of an encrypted lock advertisement
pub const ADVERTISEMENT_ENCRYPTED: u8 = 0x11;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_constants() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "0000fe24-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            SECURE_READ_CHARACTERISTIC.to_string(),
            "bd4ac614-0b45-11e3-8ffd-0800200c9a66"
        );
        assert_eq!(
            MODEL_NUMBER_CHARACTERISTIC.to_string(),
            "00002a24-0000-1000-8000-00805f9b34fb"
        );
    }
}
