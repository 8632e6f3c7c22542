use crate::{
    crypto::{Cipher, Direction, Key, Nonce},
    error::{LockError, Result},
    types::{BatteryState, Command, DoorStatus, LockOperation, LockStatus, StatusKind},
    READ_CHARACTERISTIC, SECURE_READ_CHARACTERISTIC, SECURE_WRITE_CHARACTERISTIC,
    WRITE_CHARACTERISTIC,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Frame size in bytes, on both characteristic pairs
pub const FRAME_SIZE: usize = 18;

/// Payload size of a plaintext frame
pub const PLAINTEXT_PAYLOAD_SIZE: usize = 12;

/// Payload size of a secure frame
pub const SECURE_PAYLOAD_SIZE: usize = 8;

/// Cipher block size; the sealed part of a secure frame
pub const BLOCK_SIZE: usize = 16;

/// Truncated authentication tag size
pub const TAG_SIZE: usize = 4;

/// Byte 16 of every plaintext frame
pub const PLAINTEXT_CHANNEL_MARKER: u8 = 0x02;

const TAG_OFFSET: usize = BLOCK_SIZE - TAG_SIZE;
const PAYLOAD_OFFSET: usize = 4;

/// Characteristic pair a frame travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Checksummed, unencrypted frames
    Plaintext,
    /// Sealed frames
    Secure,
}

impl Channel {
    /// Channel used by `command`
    #[must_use]
    pub const fn for_command(command: Command) -> Self {
        if command.requires_confidentiality() {
            Self::Secure
        } else {
            Self::Plaintext
        }
    }

    /// Characteristic written to
    #[must_use]
    pub const fn write_characteristic(self) -> Uuid {
        match self {
            Self::Plaintext => WRITE_CHARACTERISTIC,
            Self::Secure => SECURE_WRITE_CHARACTERISTIC,
        }
    }

    /// Characteristic notifications arrive on
    #[must_use]
    pub const fn read_characteristic(self) -> Uuid {
        match self {
            Self::Plaintext => READ_CHARACTERISTIC,
            Self::Secure => SECURE_READ_CHARACTERISTIC,
        }
    }
}

/// Leading byte of a plaintext frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Header {
    /// Host request
    Request = 0xEE,
    /// Lock reply to the outstanding request
    Response = 0xBB,
    /// Unsolicited lock notification
    Event = 0xAA,
}

impl TryFrom<u8> for Header {
    type Error = LockError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0xEE => Ok(Self::Request),
            0xBB => Ok(Self::Response),
            0xAA => Ok(Self::Event),
            _ => Err(LockError::Protocol(format!(
                "Unknown frame header {value:#04x}"
            ))),
        }
    }
}

/// Key a secure frame is sealed with, carried in byte 16
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeySelector {
    /// Long-lived offline key (handshake and teardown)
    Offline = 0x0F,
    /// Key negotiated by the handshake
    Session = 0x0E,
}

/// Opcodes that only exist on the secure channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecureOpcode {
    /// Send the host's key half
    KeyExchange = 0x01,
    /// Lock's key half
    KeyExchangeReply = 0x02,
    /// Confirm the session
    Initialize = 0x03,
    /// Session confirmed
    InitializeReply = 0x04,
    /// Close the session
    Teardown = 0x05,
    /// Session closed
    TeardownReply = 0x8B,
}

impl SecureOpcode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::KeyExchange),
            0x02 => Some(Self::KeyExchangeReply),
            0x03 => Some(Self::Initialize),
            0x04 => Some(Self::InitializeReply),
            0x05 => Some(Self::Teardown),
            0x8B => Some(Self::TeardownReply),
            _ => None,
        }
    }

    /// Opcode the lock answers a request with
    #[must_use]
    pub const fn reply(self) -> Option<Self> {
        match self {
            Self::KeyExchange => Some(Self::KeyExchangeReply),
            Self::Initialize => Some(Self::InitializeReply),
            Self::Teardown => Some(Self::TeardownReply),
            _ => None,
        }
    }
}

/// What a decoded frame is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Plaintext request
    Request,
    /// Plaintext reply
    Response,
    /// Plaintext unsolicited notification
    Event,
    /// Secure frame, tag already verified
    Sealed,
}

impl From<Header> for FrameKind {
    fn from(header: Header) -> Self {
        match header {
            Header::Request => Self::Request,
            Header::Response => Self::Response,
            Header::Event => Self::Event,
        }
    }
}

/// A decoded frame from either channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub kind: FrameKind,
    /// Opcode (command or secure opcode)
    pub opcode: u8,
    /// Payload bytes (12 plaintext, 8 secure)
    pub payload: Bytes,
    /// Checksum result; always true for sealed frames
    pub integrity_ok: bool,
}

impl Frame {
    /// Command this frame carries, if the opcode is one
    #[must_use]
    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.opcode).ok()
    }
}

/// Byte chosen so that the whole frame sums to zero
fn checksum(frame: &[u8]) -> u8 {
    frame
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

/// Build a plaintext frame
///
/// # Errors
///
/// Returns [`LockError::InvalidParameters`] if `payload` exceeds 12 bytes.
pub fn encode_plaintext(header: Header, opcode: u8, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > PLAINTEXT_PAYLOAD_SIZE {
        return Err(LockError::InvalidParameters(format!(
            "Plaintext payload is {} bytes, maximum {PLAINTEXT_PAYLOAD_SIZE}",
            payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(FRAME_SIZE);
    buf.put_u8(header as u8);
    buf.put_u8(opcode);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_slice(payload);
    buf.put_bytes(0, PLAINTEXT_PAYLOAD_SIZE - payload.len());
    buf.put_u8(PLAINTEXT_CHANNEL_MARKER);
    buf.put_u8(0);

    let sum = checksum(&buf);
    buf[3] = sum;
    Ok(buf.freeze())
}

/// Build a plaintext request for `command`
///
/// # Errors
///
/// Returns [`LockError::InvalidParameters`] if `payload` exceeds 12 bytes.
pub fn encode_request(command: Command, payload: &[u8]) -> Result<Bytes> {
    encode_plaintext(Header::Request, command.opcode(), payload)
}

/// Parse a plaintext frame; checksum failures are reported, not rejected
///
/// # Errors
///
/// Returns [`LockError::Protocol`] if the frame has the wrong length or an
/// unknown header.
pub fn decode_plaintext(data: &[u8]) -> Result<Frame> {
    if data.len() != FRAME_SIZE {
        return Err(LockError::Protocol(format!(
            "Frame is {} bytes, expected {FRAME_SIZE}",
            data.len()
        )));
    }

    let mut buf = data;
    let header = Header::try_from(buf.get_u8())?;
    let opcode = buf.get_u8();
    buf.advance(2);
    let payload = Bytes::copy_from_slice(&buf[..PLAINTEXT_PAYLOAD_SIZE]);

    Ok(Frame {
        kind: header.into(),
        opcode,
        payload,
        integrity_ok: checksum(data) == 0,
    })
}

fn truncated_tag(cipher: &dyn Cipher, key: &Key, data: &[u8]) -> Result<[u8; TAG_SIZE]> {
    let mac = cipher.mac(key, data);
    mac.get(..TAG_SIZE)
        .and_then(|tag| tag.try_into().ok())
        .ok_or_else(|| LockError::Protocol(format!("MAC output too short: {} bytes", mac.len())))
}

/// Fill the tag of `block` and encrypt it
///
/// # Errors
///
/// Returns [`LockError::Protocol`] if the cipher is not length preserving or
/// its MAC is shorter than the tag.
pub fn seal_block(
    cipher: &dyn Cipher,
    key: &Key,
    nonce: &Nonce,
    mut block: [u8; BLOCK_SIZE],
) -> Result<[u8; BLOCK_SIZE]> {
    let tag = truncated_tag(cipher, key, &block[..TAG_OFFSET])?;
    block[TAG_OFFSET..].copy_from_slice(&tag);

    cipher
        .encrypt(key, nonce, &block)
        .try_into()
        .map_err(|_| LockError::Protocol("Cipher changed the block length".to_string()))
}

/// Decrypt a sealed block and verify its tag
///
/// # Errors
///
/// Returns [`LockError::Protocol`] on a length or tag mismatch.
pub fn open_block(
    cipher: &dyn Cipher,
    key: &Key,
    nonce: &Nonce,
    sealed: &[u8],
) -> Result<[u8; BLOCK_SIZE]> {
    if sealed.len() != BLOCK_SIZE {
        return Err(LockError::Protocol(format!(
            "Sealed block is {} bytes, expected {BLOCK_SIZE}",
            sealed.len()
        )));
    }

    let block: [u8; BLOCK_SIZE] = cipher
        .decrypt(key, nonce, sealed)
        .try_into()
        .map_err(|_| LockError::Protocol("Cipher changed the block length".to_string()))?;

    let expected = truncated_tag(cipher, key, &block[..TAG_OFFSET])?;
    if expected != block[TAG_OFFSET..] {
        return Err(LockError::Protocol(
            "Authentication tag mismatch".to_string(),
        ));
    }
    Ok(block)
}

/// One direction-aware secure channel bound to a key.
///
/// Each side counts the frames it sealed and opened; the counters feed the
/// nonces, so both ends must see every frame in order.
#[derive(Debug, Clone)]
pub struct SecureChannel {
    key: Key,
    selector: KeySelector,
    slot: u8,
    outbound: Direction,
    inbound: Direction,
    sealed: u32,
    opened: u32,
}

impl SecureChannel {
    /// Host side of a channel
    #[must_use]
    pub const fn host(key: Key, selector: KeySelector, slot: u8) -> Self {
        Self {
            key,
            selector,
            slot,
            outbound: Direction::ToLock,
            inbound: Direction::FromLock,
            sealed: 0,
            opened: 0,
        }
    }

    /// Lock side of a channel, for simulators
    #[must_use]
    pub const fn device(key: Key, selector: KeySelector, slot: u8) -> Self {
        Self {
            key,
            selector,
            slot,
            outbound: Direction::FromLock,
            inbound: Direction::ToLock,
            sealed: 0,
            opened: 0,
        }
    }

    /// Seal `opcode` and `payload` into a secure frame
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidParameters`] if `payload` exceeds 8 bytes,
    /// or [`LockError::Protocol`] if the cipher misbehaves.
    pub fn seal(&mut self, cipher: &dyn Cipher, opcode: u8, payload: &[u8]) -> Result<Bytes> {
        if payload.len() > SECURE_PAYLOAD_SIZE {
            return Err(LockError::InvalidParameters(format!(
                "Secure payload is {} bytes, maximum {SECURE_PAYLOAD_SIZE}",
                payload.len()
            )));
        }

        let mut block = [0u8; BLOCK_SIZE];
        block[0] = opcode;
        block[PAYLOAD_OFFSET..PAYLOAD_OFFSET + payload.len()].copy_from_slice(payload);

        let nonce = Nonce::new(self.sealed, self.outbound);
        let sealed = seal_block(cipher, &self.key, &nonce, block)?;
        self.sealed = self.sealed.wrapping_add(1);

        let mut buf = BytesMut::with_capacity(FRAME_SIZE);
        buf.put_slice(&sealed);
        buf.put_u8(self.selector as u8);
        buf.put_u8(self.slot);
        Ok(buf.freeze())
    }

    /// Open a secure frame, verifying its tag before exposing the payload
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Protocol`] on a length, key-selector or tag
    /// mismatch.
    pub fn open(&mut self, cipher: &dyn Cipher, data: &[u8]) -> Result<Frame> {
        if data.len() != FRAME_SIZE {
            return Err(LockError::Protocol(format!(
                "Frame is {} bytes, expected {FRAME_SIZE}",
                data.len()
            )));
        }
        if data[BLOCK_SIZE] != self.selector as u8 {
            return Err(LockError::Protocol(format!(
                "Frame sealed with key selector {:#04x}, expected {:#04x}",
                data[BLOCK_SIZE], self.selector as u8
            )));
        }

        let nonce = Nonce::new(self.opened, self.inbound);
        self.opened = self.opened.wrapping_add(1);
        let block = open_block(cipher, &self.key, &nonce, &data[..BLOCK_SIZE])?;

        Ok(Frame {
            kind: FrameKind::Sealed,
            opcode: block[0],
            payload: Bytes::copy_from_slice(&block[PAYLOAD_OFFSET..TAG_OFFSET]),
            integrity_ok: true,
        })
    }
}

/// Offset of the status value in status replies and events
const STATUS_VALUE_OFFSET: usize = 4;

fn require_payload(frame: &Frame, len: usize) -> Result<()> {
    if frame.payload.len() < len {
        return Err(LockError::Protocol(format!(
            "{:?} payload has {} bytes, need {len}",
            frame.kind,
            frame.payload.len()
        )));
    }
    Ok(())
}

/// Payload of a `GetStatus` request
#[must_use]
pub fn status_request(kind: StatusKind) -> [u8; 1] {
    [kind as u8]
}

/// A single value read with `GetStatus`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusValue {
    /// Bolt status
    Lock(LockStatus),
    /// Door status
    Door(DoorStatus),
    /// Battery level
    Battery(BatteryState),
}

/// Parse a `GetStatus` reply
///
/// Layout: byte 0 status kind, bytes 4.. value (one status code, or
/// battery millivolts little-endian).
///
/// # Errors
///
/// Returns [`LockError::Protocol`] if the frame is not a status reply, or
/// [`LockError::StatusOutOfRange`] if the status code exceeds 0x0F.
pub fn parse_status(frame: &Frame) -> Result<StatusValue> {
    if frame.kind != FrameKind::Response || frame.opcode != Command::GetStatus.opcode() {
        return Err(LockError::Protocol(format!(
            "Expected status response, got {:?} opcode {:#04x}",
            frame.kind, frame.opcode
        )));
    }

    require_payload(frame, 1)?;
    let mut buf = &frame.payload[..];
    let kind = StatusKind::try_from(buf.get_u8())?;
    let value_size = match kind {
        StatusKind::Battery => 2,
        StatusKind::Lock | StatusKind::Door => 1,
    };
    require_payload(frame, STATUS_VALUE_OFFSET + value_size)?;
    buf.advance(STATUS_VALUE_OFFSET - 1);

    Ok(match kind {
        StatusKind::Lock => StatusValue::Lock(LockStatus::try_from(buf.get_u8())?),
        StatusKind::Door => StatusValue::Door(DoorStatus::try_from(buf.get_u8())?),
        StatusKind::Battery => StatusValue::Battery(BatteryState::from_millivolts(buf.get_u16_le())),
    })
}

/// Unsolicited state change pushed by the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEvent {
    /// New bolt status, for lock events
    pub lock: Option<LockStatus>,
    /// New door status, for door events
    pub door: Option<DoorStatus>,
    /// Actor, for lock events
    pub operation: Option<LockOperation>,
}

/// Parse an unsolicited event frame
///
/// Layout: byte 0 status kind, byte 4 status code, byte 5 operation source,
/// byte 6 remote type.
///
/// # Errors
///
/// Returns [`LockError::Protocol`] if the frame is not a status event, or
/// [`LockError::StatusOutOfRange`] if the status code exceeds 0x0F.
pub fn parse_event(frame: &Frame) -> Result<LockEvent> {
    if frame.kind != FrameKind::Event || frame.opcode != Command::GetStatus.opcode() {
        return Err(LockError::Protocol(format!(
            "Expected status event, got {:?} opcode {:#04x}",
            frame.kind, frame.opcode
        )));
    }

    require_payload(frame, STATUS_VALUE_OFFSET + 3)?;
    let mut buf = &frame.payload[..];
    let kind = StatusKind::try_from(buf.get_u8())?;
    buf.advance(STATUS_VALUE_OFFSET - 1);
    let code = buf.get_u8();
    let source = buf.get_u8();
    let remote_type = buf.get_u8();

    match kind {
        StatusKind::Lock => Ok(LockEvent {
            lock: Some(LockStatus::try_from(code)?),
            door: None,
            operation: Some(LockOperation::from_bytes(source, remote_type)),
        }),
        StatusKind::Door => Ok(LockEvent {
            lock: None,
            door: Some(DoorStatus::try_from(code)?),
            operation: None,
        }),
        StatusKind::Battery => Err(LockError::Protocol(
            "Battery events are not pushed by the lock".to_string(),
        )),
    }
}

/// Result of a lock/unlock command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Whether the lock accepted the command
    pub accepted: bool,
    /// Bolt status after the command
    pub lock: LockStatus,
    /// Actor as recorded by the lock
    pub operation: LockOperation,
}

/// Parse the sealed reply to a lock/unlock command
///
/// Layout: byte 0 result (0 = accepted), byte 1 status code, byte 2
/// operation source, byte 3 remote type.
///
/// # Errors
///
/// Returns [`LockError::Protocol`] if the reply does not echo `command`, or
/// [`LockError::StatusOutOfRange`] if the status code exceeds 0x0F.
pub fn parse_command_outcome(command: Command, frame: &Frame) -> Result<CommandOutcome> {
    if frame.kind != FrameKind::Sealed || frame.opcode != command.opcode() {
        return Err(LockError::Protocol(format!(
            "Expected sealed {command} reply, got {:?} opcode {:#04x}",
            frame.kind, frame.opcode
        )));
    }

    require_payload(frame, 4)?;
    let mut buf = &frame.payload[..];
    let result = buf.get_u8();
    let lock = LockStatus::try_from(buf.get_u8())?;
    let source = buf.get_u8();
    let remote_type = buf.get_u8();

    Ok(CommandOutcome {
        accepted: result == 0,
        lock,
        operation: LockOperation::from_bytes(source, remote_type),
    })
}
