//! Connection lifecycle for one lock.
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Ready <-> Busy
//!        ^                                          |
//!        +-------------- Disconnecting <------------+
//! ```
//!
//! The transport handle and everything tied to one connection (notification
//! pump, secure channels, cached device information) live in a single
//! `Link` behind a `tokio::sync::Mutex`. Holding that mutex is holding the
//! session: only one exchange is ever outstanding, so response N always
//! answers request N.
//!
//! Every operation wraps its mutex guard in an `Operation`. If the
//! operation's future is dropped mid-flight, the guard hands the link to a
//! spawned task that disconnects the transport and publishes
//! [`SessionState::Disconnected`] before the mutex is released, so the next
//! caller never sees a half-open link.

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc, watch, Mutex, OwnedMutexGuard},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    ble::Transport,
    crypto::{Cipher, Key},
    error::{LockError, Result},
    protocol::{
        decode_plaintext, encode_request, parse_event, Channel, Frame, FrameKind, KeySelector,
        LockEvent, SecureChannel, SecureOpcode,
    },
    types::{BusyPolicy, Command, ConnectionInfo, Discovery, LockConfig, LockInfo},
    FIRMWARE_REVISION_CHARACTERISTIC, MANUFACTURER_NAME_CHARACTERISTIC,
    MODEL_NUMBER_CHARACTERISTIC, SERIAL_NUMBER_CHARACTERISTIC,
};

const EVENT_CAPACITY: usize = 32;

/// Lifecycle state of a [`Session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No transport handle
    Disconnected,
    /// Opening the GATT connection, or connected and not yet authenticated
    Connecting,
    /// Running the key handshake
    Authenticating,
    /// Idle and usable
    Ready,
    /// One exchange in flight
    Busy,
    /// Releasing the transport handle
    Disconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Ready => write!(f, "Ready"),
            Self::Busy => write!(f, "Busy"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Response queues fed by the notification pump
struct Pump {
    plaintext: mpsc::UnboundedReceiver<Vec<u8>>,
    secure: mpsc::UnboundedReceiver<Vec<u8>>,
    tasks: [JoinHandle<()>; 2],
}

impl Pump {
    fn start(
        plaintext: BoxStream<'static, Vec<u8>>,
        secure: BoxStream<'static, Vec<u8>>,
        events: broadcast::Sender<LockEvent>,
    ) -> Self {
        let (plaintext_tx, plaintext_rx) = mpsc::unbounded_channel();
        let (secure_tx, secure_rx) = mpsc::unbounded_channel();
        Self {
            plaintext: plaintext_rx,
            secure: secure_rx,
            tasks: [
                tokio::spawn(pump_plaintext(plaintext, plaintext_tx, events)),
                tokio::spawn(pump_secure(secure, secure_tx)),
            ],
        }
    }

    fn responses(&mut self, channel: Channel) -> &mut mpsc::UnboundedReceiver<Vec<u8>> {
        match channel {
            Channel::Plaintext => &mut self.plaintext,
            Channel::Secure => &mut self.secure,
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Split unsolicited events off the plaintext notifications
async fn pump_plaintext(
    mut notifications: BoxStream<'static, Vec<u8>>,
    responses: mpsc::UnboundedSender<Vec<u8>>,
    events: broadcast::Sender<LockEvent>,
) {
    while let Some(data) = notifications.next().await {
        debug!("RX plaintext: {:02X?}", data);
        match decode_plaintext(&data) {
            Ok(frame) if frame.kind == FrameKind::Event => {
                if !frame.integrity_ok {
                    warn!("Dropping event with bad checksum");
                    continue;
                }
                match parse_event(&frame) {
                    Ok(event) => {
                        debug!("Lock event: {event:?}");
                        // No receivers is fine
                        let _ = events.send(event);
                    }
                    Err(e) => warn!("Undecodable lock event: {e}"),
                }
            }
            _ => {
                if responses.send(data).is_err() {
                    break;
                }
            }
        }
    }
    debug!("Plaintext notification stream ended");
}

async fn pump_secure(
    mut notifications: BoxStream<'static, Vec<u8>>,
    responses: mpsc::UnboundedSender<Vec<u8>>,
) {
    while let Some(data) = notifications.next().await {
        debug!("RX secure: {:02X?}", data);
        if responses.send(data).is_err() {
            break;
        }
    }
    debug!("Secure notification stream ended");
}

/// Everything tied to one live connection
struct Link<C> {
    conn: Option<C>,
    pump: Option<Pump>,
    offline: Option<SecureChannel>,
    session: Option<SecureChannel>,
    info: Option<LockInfo>,
}

impl<C> Link<C> {
    const fn empty() -> Self {
        Self {
            conn: None,
            pump: None,
            offline: None,
            session: None,
            info: None,
        }
    }

    /// Forget per-connection state, handing back the transport handle
    fn reset(&mut self) -> Option<C> {
        self.pump = None;
        self.offline = None;
        self.session = None;
        self.info = None;
        self.conn.take()
    }
}

struct Inner<T: Transport> {
    transport: T,
    cipher: Arc<dyn Cipher>,
    address: String,
    key: Key,
    slot: u8,
    config: LockConfig,
    state: watch::Sender<SessionState>,
    abort: watch::Sender<u64>,
    events: broadcast::Sender<LockEvent>,
}

impl<T: Transport> Inner<T> {
    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Session {}: {previous} -> {state}", self.address);
        }
    }

    /// Disconnect the handle (at most once) and end in `Disconnected`
    async fn release(&self, link: &mut Link<T::Connection>) {
        self.set_state(SessionState::Disconnecting);
        if let Some(conn) = link.reset() {
            let timeout_ms = self.config.timeouts.disconnect_timeout_ms;
            match timeout(
                Duration::from_millis(timeout_ms),
                self.transport.disconnect(conn),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Transport disconnect failed: {e}"),
                Err(_) => warn!("Transport disconnect timed out after {timeout_ms}ms"),
            }
            info!("Disconnected from {}", self.address);
        }
        self.set_state(SessionState::Disconnected);
    }
}

/// Scope guard over the session mutex
struct Operation<T: Transport> {
    guard: Option<OwnedMutexGuard<Link<T::Connection>>>,
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Operation<T> {
    fn link(&mut self) -> Result<&mut Link<T::Connection>> {
        self.guard.as_deref_mut().ok_or(LockError::Cancelled)
    }

    /// Release the mutex normally
    fn finish(mut self) {
        self.guard.take();
    }
}

impl<T: Transport> Drop for Operation<T> {
    fn drop(&mut self) {
        let Some(mut link) = self.guard.take() else {
            return;
        };

        warn!(
            "Operation on {} dropped mid-flight, releasing connection",
            self.inner.address
        );
        self.inner.set_state(SessionState::Disconnecting);
        let inner = Arc::clone(&self.inner);
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(async move {
                inner.release(&mut link).await;
                drop(link);
            });
        } else {
            // No runtime left to disconnect on; dropping the handle closes it
            drop(link.reset());
            inner.set_state(SessionState::Disconnected);
        }
    }
}

/// Authenticated session with one lock.
///
/// Cloning is cheap; clones share the same connection and state.
pub struct Session<T: Transport> {
    inner: Arc<Inner<T>>,
    link: Arc<Mutex<Link<T::Connection>>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            link: Arc::clone(&self.link),
        }
    }
}

impl<T: Transport> Session<T> {
    /// Create a disconnected session
    #[must_use]
    pub fn new(
        transport: T,
        cipher: Arc<dyn Cipher>,
        discovery: &Discovery,
        config: LockConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (abort, _) = watch::channel(0);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                cipher,
                address: discovery.address.clone(),
                key: discovery.key,
                slot: discovery.slot,
                config,
                state,
                abort,
                events,
            }),
            link: Arc::new(Mutex::new(Link::empty())),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Receive unsolicited lock events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<LockEvent> {
        self.inner.events.subscribe()
    }

    /// Acquire the session according to the busy policy
    async fn begin(&self, abort: &watch::Receiver<u64>) -> Result<Operation<T>> {
        let guard = match self.inner.config.busy_policy {
            BusyPolicy::Queue => Arc::clone(&self.link).lock_owned().await,
            BusyPolicy::Reject => Arc::clone(&self.link)
                .try_lock_owned()
                .map_err(|_| LockError::Busy)?,
        };
        let op = Operation {
            guard: Some(guard),
            inner: Arc::clone(&self.inner),
        };

        // A disconnect was requested while we queued
        if abort.has_changed().unwrap_or(true) {
            op.finish();
            return Err(LockError::Cancelled);
        }
        Ok(op)
    }

    /// Run `fut` under `timeout_ms`, aborting early on a disconnect request
    async fn bounded<F, R>(
        timeout_ms: u64,
        abort: &mut watch::Receiver<u64>,
        fut: F,
    ) -> Result<R>
    where
        F: Future<Output = Result<R>>,
    {
        tokio::select! {
            result = timeout(Duration::from_millis(timeout_ms), fut) => {
                result.map_err(|_| LockError::Timeout { timeout_ms })?
            }
            _ = abort.changed() => Err(LockError::Cancelled),
        }
    }

    /// Open the GATT connection and start the notification pump.
    ///
    /// No-op if already connected.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if the connection is not up within the
    /// connect timeout, [`LockError::Busy`] under [`BusyPolicy::Reject`], or
    /// the transport's error. On failure the session is `Disconnected`.
    pub async fn connect(&self) -> Result<()> {
        let mut abort = self.inner.abort.subscribe();
        let mut op = self.begin(&abort).await?;
        let link = op.link()?;
        if link.conn.is_some() {
            op.finish();
            return Ok(());
        }

        self.inner.set_state(SessionState::Connecting);
        info!("Connecting to {}", self.inner.address);

        let timeout_ms = self.inner.config.timeouts.connect_timeout_ms;
        let result = Self::bounded(timeout_ms, &mut abort, self.open_link(link)).await;

        if let Err(e) = result {
            warn!("Connecting to {} failed: {e}", self.inner.address);
            self.inner.release(link).await;
            op.finish();
            return Err(e);
        }

        op.finish();
        Ok(())
    }

    async fn open_link(&self, link: &mut Link<T::Connection>) -> Result<()> {
        let transport = &self.inner.transport;
        let conn = transport.connect(&self.inner.address).await?;
        let conn = link.conn.insert(conn);

        let plaintext = transport
            .subscribe_notifications(conn, Channel::Plaintext.read_characteristic())
            .await?;
        let secure = transport
            .subscribe_notifications(conn, Channel::Secure.read_characteristic())
            .await?;
        link.pump = Some(Pump::start(plaintext, secure, self.inner.events.clone()));
        Ok(())
    }

    /// Run the key handshake and move to `Ready`.
    ///
    /// With `require_authentication` off the session goes straight to
    /// `Ready`. Already `Ready` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotReady`] if not connected, or
    /// [`LockError::Authentication`] if the lock rejects the key, answers
    /// with the wrong opcode or not at all. Any failure disconnects.
    pub async fn authenticate(&self) -> Result<()> {
        let mut abort = self.inner.abort.subscribe();
        let mut op = self.begin(&abort).await?;
        let link = op.link()?;

        match self.state() {
            SessionState::Ready => {
                op.finish();
                return Ok(());
            }
            SessionState::Connecting if link.conn.is_some() => {}
            other => {
                op.finish();
                return Err(LockError::NotReady {
                    reason: format!("cannot authenticate while {other}"),
                });
            }
        }

        if !self.inner.config.require_authentication {
            self.inner.set_state(SessionState::Ready);
            op.finish();
            return Ok(());
        }

        self.inner.set_state(SessionState::Authenticating);
        match self.handshake(link, &mut abort).await {
            Ok(()) => {
                self.inner.set_state(SessionState::Ready);
                info!("Session with {} authenticated", self.inner.address);
                op.finish();
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    LockError::Protocol(reason) => LockError::Authentication(reason),
                    LockError::Timeout { timeout_ms } => LockError::Authentication(format!(
                        "no handshake reply within {timeout_ms}ms"
                    )),
                    other => other,
                };
                warn!("Authentication with {} failed: {e}", self.inner.address);
                self.inner.release(link).await;
                op.finish();
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        link: &mut Link<T::Connection>,
        abort: &mut watch::Receiver<u64>,
    ) -> Result<()> {
        let (ours_first, ours_last): ([u8; 8], [u8; 8]) = {
            let mut rng = rand::thread_rng();
            (rng.gen(), rng.gen())
        };
        let timeout_ms = self.inner.config.timeouts.auth_timeout_ms;
        let mut offline = SecureChannel::host(self.inner.key, KeySelector::Offline, self.inner.slot);

        let reply = self
            .secure_round_trip(
                link,
                &mut offline,
                SecureOpcode::KeyExchange as u8,
                &ours_first,
                timeout_ms,
                abort,
            )
            .await?;
        expect_reply(&reply, SecureOpcode::KeyExchange)?;

        let theirs: [u8; 8] = reply
            .payload
            .get(..8)
            .and_then(|half| half.try_into().ok())
            .ok_or_else(|| LockError::Authentication("short key exchange reply".to_string()))?;
        let session_key = Key::from_halves(&ours_first, &theirs);

        let reply = self
            .secure_round_trip(
                link,
                &mut offline,
                SecureOpcode::Initialize as u8,
                &ours_last,
                timeout_ms,
                abort,
            )
            .await?;
        expect_reply(&reply, SecureOpcode::Initialize)?;

        link.offline = Some(offline);
        link.session = Some(SecureChannel::host(
            session_key,
            KeySelector::Session,
            self.inner.slot,
        ));
        Ok(())
    }

    /// Write one frame and wait for the next response on its channel
    async fn round_trip(
        &self,
        link: &mut Link<T::Connection>,
        channel: Channel,
        request: Bytes,
        timeout_ms: u64,
        abort: &mut watch::Receiver<u64>,
    ) -> Result<Vec<u8>> {
        let conn = link.conn.as_ref().ok_or(LockError::Disconnected)?;
        let responses = link
            .pump
            .as_mut()
            .ok_or(LockError::Disconnected)?
            .responses(channel);

        while let Ok(stale) = responses.try_recv() {
            debug!("Dropping stale response: {:02X?}", stale);
        }

        debug!("TX {channel:?}: {:02X?}", request.as_ref());
        let transport = &self.inner.transport;
        let exchange = async {
            transport
                .write(conn, channel.write_characteristic(), &request)
                .await?;
            responses.recv().await.ok_or(LockError::Disconnected)
        };
        Self::bounded(timeout_ms, abort, exchange).await
    }

    async fn secure_round_trip(
        &self,
        link: &mut Link<T::Connection>,
        channel: &mut SecureChannel,
        opcode: u8,
        payload: &[u8],
        timeout_ms: u64,
        abort: &mut watch::Receiver<u64>,
    ) -> Result<Frame> {
        let cipher = self.inner.cipher.as_ref();
        let request = channel.seal(cipher, opcode, payload)?;
        let raw = self
            .round_trip(link, Channel::Secure, request, timeout_ms, abort)
            .await?;
        channel.open(cipher, &raw)
    }

    async fn exchange(
        &self,
        link: &mut Link<T::Connection>,
        command: Command,
        payload: &[u8],
        abort: &mut watch::Receiver<u64>,
    ) -> Result<Frame> {
        let timeout_ms = self.inner.config.timeouts.command_timeout_ms;

        let frame = match Channel::for_command(command) {
            Channel::Plaintext => {
                let request = encode_request(command, payload)?;
                let raw = self
                    .round_trip(link, Channel::Plaintext, request, timeout_ms, abort)
                    .await?;
                let frame = decode_plaintext(&raw)?;
                if !frame.integrity_ok {
                    return Err(LockError::Protocol(format!(
                        "Checksum mismatch in {command} response"
                    )));
                }
                if frame.kind != FrameKind::Response {
                    return Err(LockError::Protocol(format!(
                        "Expected response to {command}, got {:?}",
                        frame.kind
                    )));
                }
                frame
            }
            Channel::Secure => {
                let mut channel = link.session.take().ok_or_else(|| LockError::NotReady {
                    reason: format!("{command} needs an authenticated session"),
                })?;
                let result = self
                    .secure_round_trip(
                        link,
                        &mut channel,
                        command.opcode(),
                        payload,
                        timeout_ms,
                        abort,
                    )
                    .await;
                link.session = Some(channel);
                result?
            }
        };

        if frame.opcode != command.opcode() {
            return Err(LockError::Protocol(format!(
                "Response opcode {:#04x} does not echo {command}",
                frame.opcode
            )));
        }
        Ok(frame)
    }

    /// Send one command and return the validated response frame.
    ///
    /// Lock and unlock travel sealed with the session key; everything else
    /// on the plaintext characteristics.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotReady`] unless `Ready`,
    /// [`LockError::InvalidParameters`] for an oversized payload,
    /// [`LockError::Busy`] under [`BusyPolicy::Reject`], or
    /// [`LockError::Timeout`], [`LockError::Protocol`],
    /// [`LockError::Cancelled`] and transport errors, all of which disconnect.
    pub async fn send(&self, command: Command, payload: &[u8]) -> Result<Frame> {
        let mut abort = self.inner.abort.subscribe();
        let mut op = self.begin(&abort).await?;
        let link = op.link()?;

        let state = self.state();
        if state != SessionState::Ready {
            op.finish();
            return Err(LockError::NotReady {
                reason: format!("cannot send {command} while {state}"),
            });
        }

        self.inner.set_state(SessionState::Busy);
        let result = self.exchange(link, command, payload, &mut abort).await;
        match &result {
            Err(e) if e.poisons_session() => {
                warn!("{command} to {} failed: {e}", self.inner.address);
                self.inner.release(link).await;
            }
            _ => self.inner.set_state(SessionState::Ready),
        }
        op.finish();
        result
    }

    /// Read the device information characteristics, once per connection
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotReady`] if not connected, or the transport's
    /// error, which disconnects.
    pub async fn read_lock_info(&self) -> Result<LockInfo> {
        let mut abort = self.inner.abort.subscribe();
        let mut op = self.begin(&abort).await?;
        let link = op.link()?;

        if let Some(info) = &link.info {
            let info = info.clone();
            op.finish();
            return Ok(info);
        }
        let Some(conn) = link.conn.as_ref() else {
            op.finish();
            return Err(LockError::NotReady {
                reason: "not connected".to_string(),
            });
        };

        let timeout_ms = self.inner.config.timeouts.command_timeout_ms;
        let transport = &self.inner.transport;
        let read_all = async {
            let read = |uuid| async move {
                let value = transport.read(conn, uuid).await?;
                Ok::<_, LockError>(
                    String::from_utf8_lossy(&value)
                        .trim_end_matches('\0')
                        .trim()
                        .to_string(),
                )
            };
            Ok::<_, LockError>(LockInfo {
                manufacturer: read(MANUFACTURER_NAME_CHARACTERISTIC).await?,
                model: read(MODEL_NUMBER_CHARACTERISTIC).await?,
                serial: read(SERIAL_NUMBER_CHARACTERISTIC).await?,
                firmware: read(FIRMWARE_REVISION_CHARACTERISTIC).await?,
            })
        };

        match Self::bounded(timeout_ms, &mut abort, read_all).await {
            Ok(info) => {
                debug!("Lock info for {}: {info:?}", self.inner.address);
                link.info = Some(info.clone());
                op.finish();
                Ok(info)
            }
            Err(e) => {
                warn!("Reading lock info from {} failed: {e}", self.inner.address);
                self.inner.release(link).await;
                op.finish();
                Err(e)
            }
        }
    }

    /// Signal strength of the live connection, if any
    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        let link = self.link.lock().await;
        let conn = link.conn.as_ref()?;
        match self.inner.transport.rssi(conn).await {
            Ok(rssi) => rssi.map(|rssi| ConnectionInfo { rssi }),
            Err(e) => {
                debug!("RSSI unavailable: {e}");
                None
            }
        }
    }

    /// Close the session from any state.
    ///
    /// In-flight operations are aborted with [`LockError::Cancelled`]. The
    /// teardown opcode is sent best effort when enabled.
    pub async fn disconnect(&self) {
        self.inner.abort.send_modify(|epoch| *epoch = epoch.wrapping_add(1));

        let mut op = Operation {
            guard: Some(Arc::clone(&self.link).lock_owned().await),
            inner: Arc::clone(&self.inner),
        };
        let Ok(link) = op.link() else {
            return;
        };
        if link.conn.is_none() {
            self.inner.set_state(SessionState::Disconnected);
            op.finish();
            return;
        }

        self.inner.set_state(SessionState::Disconnecting);
        if self.inner.config.graceful_teardown {
            if let Some(mut offline) = link.offline.take() {
                let mut abort = self.inner.abort.subscribe();
                let timeout_ms = self.inner.config.timeouts.disconnect_timeout_ms;
                let reply = self
                    .secure_round_trip(
                        link,
                        &mut offline,
                        SecureOpcode::Teardown as u8,
                        &[],
                        timeout_ms,
                        &mut abort,
                    )
                    .await
                    .and_then(|reply| expect_reply(&reply, SecureOpcode::Teardown));
                if let Err(e) = reply {
                    warn!("Teardown with {} failed: {e}", self.inner.address);
                }
            }
        }

        self.inner.release(link).await;
        op.finish();
    }
}

/// Check that `frame` answers the handshake `request`
fn expect_reply(frame: &Frame, request: SecureOpcode) -> Result<()> {
    match request.reply() {
        Some(expected) if frame.opcode == expected as u8 => Ok(()),
        expected => Err(LockError::Authentication(format!(
            "expected {expected:?} in reply to {request:?}, got opcode {:#04x}",
            frame.opcode
        ))),
    }
}
