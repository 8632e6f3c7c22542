use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

use crate::{
    crypto::Key,
    error::{LockError, Result},
};

/// Model prefixes of locks that have no door sensor
pub const NO_DOOR_SENSE_MODELS: [&str; 2] = ["ASL-02", "ASL-01"];

/// Commands understood by the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    /// Read one status value (see [`StatusKind`])
    GetStatus = 0x02,
    /// Retract the bolt
    Unlock = 0x0A,
    /// Throw the bolt
    Lock = 0x0B,
    /// No-op, keeps the connection alive
    Nop = 0x22,
}

impl Command {
    /// Wire opcode
    #[must_use]
    pub const fn opcode(self) -> u8 {
        self as u8
    }

    /// Whether the command must travel sealed with the session key
    #[must_use]
    pub const fn requires_confidentiality(self) -> bool {
        matches!(self, Self::Lock | Self::Unlock)
    }
}

impl TryFrom<u8> for Command {
    type Error = LockError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x02 => Ok(Self::GetStatus),
            0x0A => Ok(Self::Unlock),
            0x0B => Ok(Self::Lock),
            0x22 => Ok(Self::Nop),
            _ => Err(LockError::Protocol(format!("Unknown command opcode {value:#04x}"))),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetStatus => write!(f, "GETSTATUS"),
            Self::Unlock => write!(f, "UNLOCK"),
            Self::Lock => write!(f, "LOCK"),
            Self::Nop => write!(f, "NOP"),
        }
    }
}

/// Which value a `GetStatus` request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusKind {
    /// Bolt position
    Lock = 0x02,
    /// Door sensor
    Door = 0x2E,
    /// Battery voltage
    Battery = 0x0F,
}

impl TryFrom<u8> for StatusKind {
    type Error = LockError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x02 => Ok(Self::Lock),
            0x2E => Ok(Self::Door),
            0x0F => Ok(Self::Battery),
            _ => Err(LockError::Protocol(format!("Unknown status kind {value:#04x}"))),
        }
    }
}

/// Bolt status, total over the 4-bit code space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockStatus {
    /// Lock reports no status
    Unknown = 0x00,
    /// Reserved code 0x01
    Unknown01 = 0x01,
    /// Bolt is retracting
    Unlocking = 0x02,
    /// Bolt retracted
    Unlocked = 0x03,
    /// Bolt is extending
    Locking = 0x04,
    /// Bolt extended
    Locked = 0x05,
    /// Reserved code 0x06
    Unknown06 = 0x06,
    /// Reserved code 0x07
    Unknown07 = 0x07,
    /// Reserved code 0x08
    Unknown08 = 0x08,
    /// Latch is retracting
    Unlatching = 0x09,
    /// Latch retracted
    Unlatched = 0x0A,
    /// Reserved code 0x0B
    Unknown0B = 0x0B,
    /// Lock is in secure (deadlocked) mode
    SecureMode = 0x0C,
    /// Reserved code 0x0D
    Unknown0D = 0x0D,
    /// Reserved code 0x0E
    Unknown0E = 0x0E,
    /// Reserved code 0x0F
    Unknown0F = 0x0F,
}

impl LockStatus {
    /// Every status, indexed by its code
    pub const ALL: [Self; 16] = [
        Self::Unknown,
        Self::Unknown01,
        Self::Unlocking,
        Self::Unlocked,
        Self::Locking,
        Self::Locked,
        Self::Unknown06,
        Self::Unknown07,
        Self::Unknown08,
        Self::Unlatching,
        Self::Unlatched,
        Self::Unknown0B,
        Self::SecureMode,
        Self::Unknown0D,
        Self::Unknown0E,
        Self::Unknown0F,
    ];

    /// Decode the low nibble of `value`; never fails
    #[must_use]
    pub const fn from_nibble(value: u8) -> Self {
        Self::ALL[(value & 0x0F) as usize]
    }

    /// Wire code
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether this is a named status rather than a reserved code
    #[must_use]
    pub const fn is_known(self) -> bool {
        matches!(
            self,
            Self::Unlocking
                | Self::Unlocked
                | Self::Locking
                | Self::Locked
                | Self::Unlatching
                | Self::Unlatched
                | Self::SecureMode
        )
    }
}

impl TryFrom<u8> for LockStatus {
    type Error = LockError;

    fn try_from(value: u8) -> Result<Self> {
        if value > 0x0F {
            return Err(LockError::StatusOutOfRange { kind: "lock", value });
        }
        Ok(Self::from_nibble(value))
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlocking => write!(f, "Unlocking"),
            Self::Unlocked => write!(f, "Unlocked"),
            Self::Locking => write!(f, "Locking"),
            Self::Locked => write!(f, "Locked"),
            Self::Unlatching => write!(f, "Unlatching"),
            Self::Unlatched => write!(f, "Unlatched"),
            Self::SecureMode => write!(f, "Secure Mode"),
            other => write!(f, "Unknown ({:#04x})", other.code()),
        }
    }
}

/// Door sensor status, total over the 4-bit code space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DoorStatus {
    /// Sensor reports no status, or the lock has no sensor
    Unknown = 0x00,
    /// Door closed
    Closed = 0x01,
    /// Door ajar
    Ajar = 0x02,
    /// Door open
    Opened = 0x03,
    /// Reserved code 0x04
    Unknown04 = 0x04,
    /// Reserved code 0x05
    Unknown05 = 0x05,
    /// Reserved code 0x06
    Unknown06 = 0x06,
    /// Reserved code 0x07
    Unknown07 = 0x07,
    /// Reserved code 0x08
    Unknown08 = 0x08,
    /// Reserved code 0x09
    Unknown09 = 0x09,
    /// Reserved code 0x0A
    Unknown0A = 0x0A,
    /// Reserved code 0x0B
    Unknown0B = 0x0B,
    /// Reserved code 0x0C
    Unknown0C = 0x0C,
    /// Reserved code 0x0D
    Unknown0D = 0x0D,
    /// Reserved code 0x0E
    Unknown0E = 0x0E,
    /// Reserved code 0x0F
    Unknown0F = 0x0F,
}

impl DoorStatus {
    /// Every status, indexed by its code
    pub const ALL: [Self; 16] = [
        Self::Unknown,
        Self::Closed,
        Self::Ajar,
        Self::Opened,
        Self::Unknown04,
        Self::Unknown05,
        Self::Unknown06,
        Self::Unknown07,
        Self::Unknown08,
        Self::Unknown09,
        Self::Unknown0A,
        Self::Unknown0B,
        Self::Unknown0C,
        Self::Unknown0D,
        Self::Unknown0E,
        Self::Unknown0F,
    ];

    /// Decode the low nibble of `value`; never fails
    #[must_use]
    pub const fn from_nibble(value: u8) -> Self {
        Self::ALL[(value & 0x0F) as usize]
    }

    /// Wire code
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Whether this is a named status rather than a reserved code
    #[must_use]
    pub const fn is_known(self) -> bool {
        matches!(self, Self::Closed | Self::Ajar | Self::Opened)
    }
}

impl TryFrom<u8> for DoorStatus {
    type Error = LockError;

    fn try_from(value: u8) -> Result<Self> {
        if value > 0x0F {
            return Err(LockError::StatusOutOfRange { kind: "door", value });
        }
        Ok(Self::from_nibble(value))
    }
}

impl fmt::Display for DoorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Ajar => write!(f, "Ajar"),
            Self::Opened => write!(f, "Open"),
            other => write!(f, "Unknown ({:#04x})", other.code()),
        }
    }
}

/// Voltage/percentage pairs of a 4xAA alkaline pack, ascending
const DISCHARGE_CURVE: [(f32, f32); 6] = [
    (4.60, 0.0),
    (4.80, 10.0),
    (5.10, 30.0),
    (5.40, 60.0),
    (5.70, 85.0),
    (6.00, 100.0),
];

/// Battery level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryState {
    /// Pack voltage in volts
    pub voltage: f32,
    /// Estimated charge, 0-100
    pub percentage: u8,
}

impl BatteryState {
    /// Scale a raw millivolt reading along the discharge curve
    #[must_use]
    pub fn from_millivolts(millivolts: u16) -> Self {
        let voltage = f32::from(millivolts) / 1000.0;
        Self {
            voltage,
            percentage: percentage_for(voltage),
        }
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percentage_for(voltage: f32) -> u8 {
    let (min_v, _) = DISCHARGE_CURVE[0];
    let (max_v, _) = DISCHARGE_CURVE[DISCHARGE_CURVE.len() - 1];
    if voltage <= min_v {
        return 0;
    }
    if voltage >= max_v {
        return 100;
    }

    DISCHARGE_CURVE
        .windows(2)
        .find(|w| voltage <= w[1].0)
        .map_or(100, |w| {
            let ((v0, p0), (v1, p1)) = (w[0], w[1]);
            (p0 + (voltage - v0) / (v1 - v0) * (p1 - p0)).round() as u8
        })
}

/// Outcome of an authenticated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    /// Whether the lock accepted the operation
    pub successful: bool,
}

/// Decoded lock snapshot, produced by both the connected and the
/// advertisement paths
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LockState {
    lock: LockStatus,
    door: DoorStatus,
    battery: Option<BatteryState>,
    auth: Option<AuthState>,
}

impl LockState {
    /// Create a snapshot
    #[must_use]
    pub const fn new(
        lock: LockStatus,
        door: DoorStatus,
        battery: Option<BatteryState>,
        auth: Option<AuthState>,
    ) -> Self {
        Self {
            lock,
            door,
            battery,
            auth,
        }
    }

    /// Bolt status
    #[must_use]
    pub const fn lock(&self) -> LockStatus {
        self.lock
    }

    /// Door status
    #[must_use]
    pub const fn door(&self) -> DoorStatus {
        self.door
    }

    /// Battery level, when the source carried one
    #[must_use]
    pub const fn battery(&self) -> Option<BatteryState> {
        self.battery
    }

    /// Outcome of the operation that produced this snapshot, if any
    #[must_use]
    pub const fn auth(&self) -> Option<AuthState> {
        self.auth
    }
}

impl Default for LockState {
    fn default() -> Self {
        Self::new(LockStatus::Unknown, DoorStatus::Unknown, None, None)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock={} door={}", self.lock, self.door)?;
        if let Some(battery) = self.battery {
            write!(f, " battery={}% ({:.2}V)", battery.percentage, battery.voltage)?;
        }
        if let Some(auth) = self.auth {
            write!(f, " auth={}", if auth.successful { "ok" } else { "rejected" })?;
        }
        Ok(())
    }
}

/// Device information read once per connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Manufacturer name
    pub manufacturer: String,
    /// Model number
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Firmware revision
    pub firmware: String,
}

impl LockInfo {
    /// Whether the door status reported by this model can be trusted
    #[must_use]
    pub fn door_sense(&self) -> bool {
        !self.model.is_empty()
            && !NO_DOOR_SENSE_MODELS
                .iter()
                .any(|prefix| self.model.starts_with(prefix))
    }
}

/// Signal quality at the time of a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Received signal strength in dBm
    pub rssi: i16,
}

/// Who operated the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationSource {
    /// Remote command (app, bridge, BLE client)
    Remote,
    /// Thumb turn or key
    Manual,
    /// Auto-lock timer
    AutoLock,
    /// Keypad PIN
    Pin,
    /// Any other source code
    Unknown,
}

impl From<u8> for OperationSource {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Remote,
            0x01 => Self::Manual,
            0x05 => Self::AutoLock,
            0x0B => Self::Pin,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for OperationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => write!(f, "Remote"),
            Self::Manual => write!(f, "Manual"),
            Self::AutoLock => write!(f, "Auto Lock"),
            Self::Pin => write!(f, "PIN"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Transport of a remote operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationRemoteType {
    /// Direct Bluetooth client
    Ble,
    /// Unrecognized or unset
    Unknown,
}

impl From<u8> for OperationRemoteType {
    fn from(value: u8) -> Self {
        match value {
            0x03 => Self::Ble,
            _ => Self::Unknown,
        }
    }
}

/// Classify the actor of a lock operation.
///
/// The remote-type byte is only meaningful when the source is remote.
#[must_use]
pub fn parse_operation_source(
    source: u8,
    remote_type: u8,
) -> (OperationSource, Option<OperationRemoteType>) {
    let source = OperationSource::from(source);
    let remote_type =
        (source == OperationSource::Remote).then(|| OperationRemoteType::from(remote_type));
    (source, remote_type)
}

/// Actor of an operation reported by the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOperation {
    /// Who operated the lock
    pub source: OperationSource,
    /// Transport used, for remote operations
    pub remote_type: Option<OperationRemoteType>,
}

impl LockOperation {
    /// Decode from raw source and remote-type bytes
    #[must_use]
    pub fn from_bytes(source: u8, remote_type: u8) -> Self {
        let (source, remote_type) = parse_operation_source(source, remote_type);
        Self {
            source,
            remote_type,
        }
    }
}

/// Validated identity and credentials of one physical lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discovery {
    /// Advertised name
    pub name: String,
    /// Bluetooth address, `AA:BB:CC:DD:EE:FF`
    pub address: String,
    /// Serial number
    pub serial: String,
    /// Offline key, serialized as 32 hex characters
    pub key: Key,
    /// Key slot the offline key is registered in
    pub slot: u8,
}

impl Discovery {
    /// Validate and build a discovery record
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidParameters`] if the key is not 16 bytes of
    /// hex or the address is empty.
    pub fn new(name: &str, address: &str, serial: &str, key: &str, slot: u8) -> Result<Self> {
        if address.trim().is_empty() {
            return Err(LockError::InvalidParameters(
                "Lock address must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name: name.to_string(),
            address: address.trim().to_string(),
            serial: serial.to_string(),
            key: Key::from_hex(key)?,
            slot,
        })
    }
}

/// Where a [`LockUpdate`] came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Passive advertisement
    Advertisement,
    /// Unsolicited notification on a live session
    Notification,
    /// Reply to a lock/unlock command
    Command,
    /// Explicit status read
    StatusRead,
}

/// State change delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockUpdate {
    /// New snapshot
    pub state: LockState,
    /// Producer of the snapshot
    pub origin: UpdateOrigin,
    /// Actor, when the lock reported one
    pub operation: Option<LockOperation>,
    /// Signal quality, when known
    pub connection: Option<ConnectionInfo>,
}

/// What to do with a command submitted while another is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BusyPolicy {
    /// Wait in FIFO order
    #[default]
    Queue,
    /// Fail with [`LockError::Busy`]
    Reject,
}

/// Bounds for each transport operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// GATT connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-step handshake timeout in milliseconds
    pub auth_timeout_ms: u64,
    /// Command response timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Teardown and release timeout in milliseconds
    pub disconnect_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            auth_timeout_ms: 10_000,
            command_timeout_ms: 5_000,
            disconnect_timeout_ms: 3_000,
        }
    }
}

/// Lock and session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Operation timeouts
    pub timeouts: TimeoutConfig,
    /// Concurrent submission policy
    pub busy_policy: BusyPolicy,
    /// How long an advertisement-derived state counts as fresh
    pub advertisement_ttl_ms: u64,
    /// Run the key handshake after connecting
    pub require_authentication: bool,
    /// Send the teardown opcode before releasing the connection
    pub graceful_teardown: bool,
}

impl LockConfig {
    /// Advertisement freshness window
    #[must_use]
    pub const fn advertisement_ttl(&self) -> Duration {
        Duration::from_millis(self.advertisement_ttl_ms)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            busy_policy: BusyPolicy::Queue,
            advertisement_ttl_ms: 30_000,
            require_authentication: true,
            graceful_teardown: true,
        }
    }
}
