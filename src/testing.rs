//! Test doubles: a toy cipher and an in-memory lock behind [`Transport`].

use async_trait::async_trait;
use futures::{
    channel::mpsc,
    stream::{BoxStream, StreamExt},
};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use uuid::Uuid;

use crate::{
    ble::Transport,
    crypto::{Cipher, Key, Nonce},
    error::{LockError, Result},
    protocol::{
        decode_plaintext, encode_plaintext, Header, KeySelector, SecureChannel, SecureOpcode,
    },
    types::{Command, Discovery, DoorStatus, LockStatus, StatusKind},
    FIRMWARE_REVISION_CHARACTERISTIC, MANUFACTURER_NAME_CHARACTERISTIC,
    MODEL_NUMBER_CHARACTERISTIC, READ_CHARACTERISTIC, SECURE_READ_CHARACTERISTIC,
    SECURE_WRITE_CHARACTERISTIC, SERIAL_NUMBER_CHARACTERISTIC, WRITE_CHARACTERISTIC,
};

pub(crate) const TEST_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";
pub(crate) const TEST_KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f";
pub(crate) const TEST_SLOT: u8 = 1;
const LOCK_HALF: [u8; 8] = [0xA5, 0x5A, 0x0F, 0xF0, 0x11, 0x22, 0x33, 0x44];

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub(crate) fn test_key() -> Key {
    Key::from_hex(TEST_KEY_HEX).unwrap()
}

pub(crate) fn discovery() -> Discovery {
    Discovery::new("Front Door", TEST_ADDRESS, "L2FGH12345", TEST_KEY_HEX, TEST_SLOT).unwrap()
}

/// XOR keystream plus FNV-1a MAC. Deterministic, not secure.
pub(crate) struct TestCipher;

impl TestCipher {
    fn apply(key: &Key, nonce: &Nonce, data: &[u8]) -> Vec<u8> {
        let key = key.as_bytes();
        let nonce = nonce.as_bytes();
        data.iter()
            .enumerate()
            .map(|(i, b)| {
                let stream = key[i % key.len()]
                    ^ nonce[i % nonce.len()].rotate_left(3)
                    ^ (i as u8).wrapping_mul(0x9D);
                b ^ stream
            })
            .collect()
    }
}

impl Cipher for TestCipher {
    fn encrypt(&self, key: &Key, nonce: &Nonce, data: &[u8]) -> Vec<u8> {
        Self::apply(key, nonce, data)
    }

    fn decrypt(&self, key: &Key, nonce: &Nonce, data: &[u8]) -> Vec<u8> {
        Self::apply(key, nonce, data)
    }

    fn mac(&self, key: &Key, data: &[u8]) -> Vec<u8> {
        let hash = key
            .as_bytes()
            .iter()
            .chain(data)
            .fold(0xcbf2_9ce4_8422_2325u64, |acc, &b| {
                (acc ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
            });
        hash.to_be_bytes().to_vec()
    }
}

pub(crate) struct FakeConnection {
    id: u64,
}

struct FakeLink {
    id: u64,
    plaintext: Option<mpsc::UnboundedSender<Vec<u8>>>,
    secure: Option<mpsc::UnboundedSender<Vec<u8>>>,
    offline: SecureChannel,
    session: Option<SecureChannel>,
}

struct Device {
    offline_key: Key,
    lock: LockStatus,
    door: DoorStatus,
    battery_mv: u16,
    model: String,
    silent: bool,
    reject_commands: bool,
    fail_connect: bool,
    connect_delay: Duration,
    reply_delay: Duration,
    next_id: u64,
    link: Option<FakeLink>,
    connects: usize,
    disconnects: usize,
    stale_releases: usize,
    commands: Vec<Command>,
    secure_opcodes: Vec<u8>,
}

type Reply = (mpsc::UnboundedSender<Vec<u8>>, Vec<u8>);

impl Device {
    fn link(&mut self, id: u64) -> Result<&mut FakeLink> {
        self.link
            .as_mut()
            .filter(|link| link.id == id)
            .ok_or(LockError::Disconnected)
    }

    fn handle_plaintext(&mut self, id: u64, data: &[u8]) -> Result<Vec<Reply>> {
        let frame = decode_plaintext(data)?;
        let command = Command::try_from(frame.opcode)?;
        self.commands.push(command);

        let payload = match command {
            Command::GetStatus => match StatusKind::try_from(frame.payload[0])? {
                StatusKind::Lock => vec![StatusKind::Lock as u8, 0, 0, 0, self.lock.code()],
                StatusKind::Door => vec![StatusKind::Door as u8, 0, 0, 0, self.door.code()],
                StatusKind::Battery => {
                    let mv = self.battery_mv.to_le_bytes();
                    vec![StatusKind::Battery as u8, 0, 0, 0, mv[0], mv[1]]
                }
            },
            Command::Nop => Vec::new(),
            other => {
                return Err(LockError::Protocol(format!("{other} sent in plaintext")));
            }
        };
        if self.silent {
            return Ok(Vec::new());
        }

        let reply = encode_plaintext(Header::Response, frame.opcode, &payload)?;
        let link = self.link(id)?;
        Ok(link
            .plaintext
            .clone()
            .map(|tx| vec![(tx, reply.to_vec())])
            .unwrap_or_default())
    }

    fn handle_secure(&mut self, id: u64, data: &[u8]) -> Result<Vec<Reply>> {
        let silent = self.silent;
        let reject = self.reject_commands;
        let current = self.lock;

        let link = self.link(id)?;
        let mut opcodes = Vec::new();
        let mut new_lock = None;

        let reply = if data.get(16) == Some(&(KeySelector::Offline as u8)) {
            let (opcode, payload) = match link.offline.open(&TestCipher, data) {
                Ok(frame) => {
                    opcodes.push(frame.opcode);
                    match SecureOpcode::from_u8(frame.opcode) {
                        Some(SecureOpcode::KeyExchange) => {
                            let mut host_half = [0u8; 8];
                            host_half.copy_from_slice(&frame.payload[..8]);
                            link.session = Some(SecureChannel::device(
                                Key::from_halves(&host_half, &LOCK_HALF),
                                KeySelector::Session,
                                TEST_SLOT,
                            ));
                            (SecureOpcode::KeyExchangeReply, LOCK_HALF.to_vec())
                        }
                        Some(SecureOpcode::Initialize) => (SecureOpcode::InitializeReply, vec![]),
                        Some(SecureOpcode::Teardown) => (SecureOpcode::TeardownReply, vec![]),
                        _ => return Err(LockError::Protocol("unexpected handshake".into())),
                    }
                }
                // Wrong offline key: answer anyway, the host fails the tag
                Err(_) => (SecureOpcode::KeyExchangeReply, LOCK_HALF.to_vec()),
            };
            link.offline.seal(&TestCipher, opcode as u8, &payload)?
        } else {
            let session = link
                .session
                .as_mut()
                .ok_or_else(|| LockError::Protocol("no session key".into()))?;
            let frame = session.open(&TestCipher, data)?;
            opcodes.push(frame.opcode);

            let command = Command::try_from(frame.opcode)?;
            let lock = match command {
                Command::Lock if !reject => LockStatus::Locked,
                Command::Unlock if !reject => LockStatus::Unlocked,
                _ => current,
            };
            new_lock = Some(lock);
            let result = u8::from(reject);
            session.seal(&TestCipher, frame.opcode, &[result, lock.code(), 0x00, 0x03])?
        };

        let tx = link.secure.clone();
        self.secure_opcodes.extend(opcodes);
        if let Some(lock) = new_lock {
            self.lock = lock;
        }
        if silent {
            return Ok(Vec::new());
        }
        Ok(tx.map(|tx| vec![(tx, reply.to_vec())]).unwrap_or_default())
    }
}

/// In-memory lock speaking the real frame formats
#[derive(Clone)]
pub(crate) struct FakeTransport {
    device: Arc<Mutex<Device>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self {
            device: Arc::new(Mutex::new(Device {
                offline_key: test_key(),
                lock: LockStatus::Locked,
                door: DoorStatus::Closed,
                battery_mv: 5_400,
                model: "ASL-03".to_string(),
                silent: false,
                reject_commands: false,
                fail_connect: false,
                connect_delay: Duration::ZERO,
                reply_delay: Duration::ZERO,
                next_id: 0,
                link: None,
                connects: 0,
                disconnects: 0,
                stale_releases: 0,
                commands: Vec::new(),
                secure_opcodes: Vec::new(),
            })),
        }
    }

    fn device(&self) -> MutexGuard<'_, Device> {
        self.device.lock().unwrap()
    }

    pub(crate) fn with_offline_key(self, key: Key) -> Self {
        self.device().offline_key = key;
        self
    }

    pub(crate) fn with_model(self, model: &str) -> Self {
        self.device().model = model.to_string();
        self
    }

    pub(crate) fn with_state(self, lock: LockStatus, door: DoorStatus) -> Self {
        {
            let mut device = self.device();
            device.lock = lock;
            device.door = door;
        }
        self
    }

    pub(crate) fn with_connect_delay(self, delay: Duration) -> Self {
        self.device().connect_delay = delay;
        self
    }

    pub(crate) fn with_reply_delay(self, delay: Duration) -> Self {
        self.device().reply_delay = delay;
        self
    }

    pub(crate) fn rejecting_commands(self) -> Self {
        self.device().reject_commands = true;
        self
    }

    pub(crate) fn failing_connect(self) -> Self {
        self.device().fail_connect = true;
        self
    }

    pub(crate) fn set_silent(&self, silent: bool) {
        self.device().silent = silent;
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        self.device().connect_delay = delay;
    }

    /// Push an unsolicited status event on the plaintext characteristic
    pub(crate) fn push_event(&self, kind: StatusKind, code: u8, source: u8, remote_type: u8) {
        let frame = encode_plaintext(
            Header::Event,
            Command::GetStatus.opcode(),
            &[kind as u8, 0, 0, 0, code, source, remote_type],
        )
        .unwrap();
        self.inject_plaintext(&frame);
    }

    /// Deliver raw bytes on the plaintext characteristic
    pub(crate) fn inject_plaintext(&self, frame: &[u8]) {
        let device = self.device();
        if let Some(tx) = device.link.as_ref().and_then(|l| l.plaintext.as_ref()) {
            let _ = tx.unbounded_send(frame.to_vec());
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.device().link.is_some()
    }

    pub(crate) fn connects(&self) -> usize {
        self.device().connects
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.device().disconnects
    }

    /// Disconnects of a handle that was not the live one
    pub(crate) fn stale_releases(&self) -> usize {
        self.device().stale_releases
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.device().commands.clone()
    }

    pub(crate) fn secure_opcodes(&self) -> Vec<u8> {
        self.device().secure_opcodes.clone()
    }

    pub(crate) fn lock_status(&self) -> LockStatus {
        self.device().lock
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Connection = FakeConnection;

    async fn connect(&self, _address: &str) -> Result<FakeConnection> {
        let delay = self.device().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut device = self.device();
        if device.fail_connect {
            return Err(LockError::ConnectionFailed("lock refused connection".into()));
        }
        device.next_id += 1;
        let id = device.next_id;
        let offline = SecureChannel::device(device.offline_key, KeySelector::Offline, TEST_SLOT);
        device.link = Some(FakeLink {
            id,
            plaintext: None,
            secure: None,
            offline,
            session: None,
        });
        device.connects += 1;
        Ok(FakeConnection { id })
    }

    async fn write(&self, conn: &FakeConnection, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let (replies, delay) = {
            let mut device = self.device();
            let replies = if characteristic == WRITE_CHARACTERISTIC {
                device.handle_plaintext(conn.id, data)?
            } else if characteristic == SECURE_WRITE_CHARACTERISTIC {
                device.handle_secure(conn.id, data)?
            } else {
                return Err(LockError::Protocol(format!("{characteristic} is not writable")));
            };
            (replies, device.reply_delay)
        };

        if delay.is_zero() {
            for (tx, reply) in replies {
                let _ = tx.unbounded_send(reply);
            }
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                for (tx, reply) in replies {
                    let _ = tx.unbounded_send(reply);
                }
            });
        }
        Ok(())
    }

    async fn read(&self, conn: &FakeConnection, characteristic: Uuid) -> Result<Vec<u8>> {
        let mut device = self.device();
        device.link(conn.id)?;
        let value = match characteristic {
            c if c == MANUFACTURER_NAME_CHARACTERISTIC => "August Home Inc.".to_string(),
            c if c == MODEL_NUMBER_CHARACTERISTIC => format!("{}\0", device.model),
            c if c == SERIAL_NUMBER_CHARACTERISTIC => "L2FGH12345".to_string(),
            c if c == FIRMWARE_REVISION_CHARACTERISTIC => "2.0.2".to_string(),
            other => return Err(LockError::Protocol(format!("{other} is not readable"))),
        };
        Ok(value.into_bytes())
    }

    async fn subscribe_notifications(
        &self,
        conn: &FakeConnection,
        characteristic: Uuid,
    ) -> Result<BoxStream<'static, Vec<u8>>> {
        let mut device = self.device();
        let link = device.link(conn.id)?;
        let (tx, rx) = mpsc::unbounded();
        if characteristic == READ_CHARACTERISTIC {
            link.plaintext = Some(tx);
        } else if characteristic == SECURE_READ_CHARACTERISTIC {
            link.secure = Some(tx);
        } else {
            return Err(LockError::Protocol(format!("{characteristic} does not notify")));
        }
        Ok(rx.boxed())
    }

    async fn rssi(&self, _conn: &FakeConnection) -> Result<Option<i16>> {
        Ok(Some(-58))
    }

    async fn disconnect(&self, conn: FakeConnection) -> Result<()> {
        let mut device = self.device();
        if device.link.as_ref().is_some_and(|l| l.id == conn.id) {
            device.link = None;
            device.disconnects += 1;
        } else {
            device.stale_releases += 1;
        }
        Ok(())
    }
}
