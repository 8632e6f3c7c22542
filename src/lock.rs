use futures::stream::{BoxStream, StreamExt};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};
use tokio::{
    runtime::Handle,
    sync::broadcast::error::RecvError,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    advertisement::{decode_manufacturer_data, AdvertisementState, OfflineKey},
    ble::{Advertisement, Transport},
    crypto::{Cipher, Key},
    error::{LockError, Result},
    protocol::{parse_command_outcome, parse_status, status_request, LockEvent, StatusValue},
    session::{Session, SessionState},
    types::{
        self, AuthState, BatteryState, Command, ConnectionInfo, Discovery, DoorStatus,
        LockConfig, LockInfo, LockState, LockStatus, LockUpdate, OperationRemoteType,
        OperationSource, StatusKind, UpdateOrigin,
    },
};

type Callback = Arc<dyn Fn(&LockUpdate) + Send + Sync>;

#[derive(Default)]
struct Cache {
    state: LockState,
    advertised: Option<(LockState, Instant)>,
    info: Option<LockInfo>,
}

impl Cache {
    /// Door status as callers may see it; models without a sensor report
    /// `Unknown`
    fn trusted_door(&self, door: DoorStatus) -> DoorStatus {
        match &self.info {
            Some(info) if !info.door_sense() => DoorStatus::Unknown,
            _ => door,
        }
    }
}

/// State shared with background tasks and subscriptions
struct Shared {
    cipher: Arc<dyn Cipher>,
    key: Key,
    address: String,
    subscribers: Mutex<HashMap<u64, Callback>>,
    next_id: AtomicU64,
    cache: Mutex<Cache>,
}

impl Shared {
    fn remember_info(&self, info: &LockInfo) {
        self.cache().info = Some(info.clone());
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, Callback>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cache(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, update: &LockUpdate) {
        {
            let mut cache = self.cache();
            cache.state = update.state;
            // Anything newer than the broadcast supersedes it
            if update.origin != UpdateOrigin::Advertisement {
                cache.advertised = None;
            }
        }
        let callbacks: Vec<Callback> = self.subscribers().values().cloned().collect();
        for callback in callbacks {
            callback(update);
        }
    }

    fn handle_advertisement(
        &self,
        manufacturer_data: &HashMap<u16, Vec<u8>>,
        rssi: Option<i16>,
    ) -> Option<AdvertisementState> {
        let key = OfflineKey {
            cipher: self.cipher.as_ref(),
            key: &self.key,
        };
        let decoded = decode_manufacturer_data(manufacturer_data, Some(key));

        match decoded {
            Some(AdvertisementState::Decoded(advertised)) => {
                let state = {
                    let mut cache = self.cache();
                    let door = cache.trusted_door(advertised.door());
                    let state =
                        LockState::new(advertised.lock(), door, cache.state.battery(), None);
                    cache.advertised = Some((
                        LockState::new(advertised.lock(), door, None, None),
                        Instant::now(),
                    ));
                    state
                };
                debug!("Advertisement from {}: {advertised}", self.address);
                self.publish(&LockUpdate {
                    state,
                    origin: UpdateOrigin::Advertisement,
                    operation: None,
                    connection: rssi.map(|rssi| ConnectionInfo { rssi }),
                });
            }
            Some(AdvertisementState::DecodeAmbiguous) => {
                debug!("Advertisement from {} could not be opened", self.address);
            }
            None => {}
        }
        decoded
    }

    fn apply_event(&self, event: LockEvent) {
        let state = {
            let cache = self.cache();
            let previous = cache.state;
            LockState::new(
                event.lock.unwrap_or(previous.lock()),
                event
                    .door
                    .map_or(previous.door(), |door| cache.trusted_door(door)),
                previous.battery(),
                None,
            )
        };
        info!("Lock {} reported {state}", self.address);
        self.publish(&LockUpdate {
            state,
            origin: UpdateOrigin::Notification,
            operation: event.operation,
            connection: None,
        });
    }
}

/// Handle returned by [`Lock::subscribe`].
///
/// Dropping it keeps the callback registered; call
/// [`unsubscribe`](Subscription::unsubscribe) to remove it.
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Remove the callback
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers().remove(&self.id);
        }
    }
}

/// Main interface for operating a Yale/August lock
///
/// `Lock` combines the active path (an authenticated [`Session`] for
/// commands and status reads) with the passive path (advertisement
/// decoding) and delivers state changes from both to subscribers.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use yalers::{BtleplugTransport, Cipher, Discovery, Lock, LockConfig, LockUpdate};
///
/// # async fn run(cipher: Arc<dyn Cipher>, discovery: Discovery) -> yalers::Result<()> {
/// let transport = BtleplugTransport::new().await?;
/// let advertisements = transport.advertisements().await?;
///
/// let lock = Lock::new(transport, cipher, discovery, LockConfig::default());
/// let _subscription = lock.subscribe(|update: &LockUpdate| {
///     println!("{:?}: {}", update.origin, update.state);
/// });
/// lock.watch_advertisements(advertisements);
///
/// let (state, connection) = lock.get_status().await?;
/// println!("{state} (rssi {:?})", connection.map(|c| c.rssi));
/// # Ok(())
/// # }
/// ```
pub struct Lock<T: Transport> {
    session: Session<T>,
    discovery: Discovery,
    config: LockConfig,
    shared: Arc<Shared>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Lock<T> {
    /// Create a lock handle; nothing is connected until the first command
    #[must_use]
    pub fn new(
        transport: T,
        cipher: Arc<dyn Cipher>,
        discovery: Discovery,
        config: LockConfig,
    ) -> Self {
        let session = Session::new(transport, Arc::clone(&cipher), &discovery, config.clone());
        let shared = Arc::new(Shared {
            cipher,
            key: discovery.key,
            address: discovery.address.clone(),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            cache: Mutex::new(Cache::default()),
        });

        Self {
            session,
            discovery,
            config,
            shared,
            event_task: Mutex::new(None),
        }
    }

    /// Identity and credentials this handle was built from
    #[must_use]
    pub const fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Underlying session
    #[must_use]
    pub const fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Current session state
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Latest known state from any source
    #[must_use]
    pub fn last_state(&self) -> LockState {
        self.shared.cache().state
    }

    /// Classify the actor of a lock operation
    #[must_use]
    pub fn parse_operation_source(
        source: u8,
        remote_type: u8,
    ) -> (OperationSource, Option<OperationRemoteType>) {
        types::parse_operation_source(source, remote_type)
    }

    /// Register a callback for state changes from advertisements,
    /// notifications, commands and status reads
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LockUpdate) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.subscribers().insert(id, Arc::new(callback));
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Feed one advertisement's manufacturer data into the passive path
    pub fn handle_advertisement(
        &self,
        manufacturer_data: &HashMap<u16, Vec<u8>>,
        rssi: Option<i16>,
    ) -> Option<AdvertisementState> {
        self.shared.handle_advertisement(manufacturer_data, rssi)
    }

    /// Consume an advertisement stream, keeping those from this lock
    pub fn watch_advertisements(
        &self,
        mut advertisements: BoxStream<'static, Advertisement>,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(advertisement) = advertisements.next().await {
                if advertisement.address.eq_ignore_ascii_case(&shared.address) {
                    shared.handle_advertisement(
                        &advertisement.manufacturer_data,
                        advertisement.rssi,
                    );
                }
            }
            debug!("Advertisement stream for {} ended", shared.address);
        })
    }

    fn start_event_forwarding(&self) {
        let mut task = self
            .event_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let mut events = self.session.events();
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => shared.apply_event(event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Missed {missed} lock events from {}", shared.address);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));
    }

    async fn ensure_ready(&self) -> Result<()> {
        self.start_event_forwarding();
        self.session.connect().await?;
        self.session.authenticate().await
    }

    async fn read_status(&self, kind: StatusKind) -> Result<StatusValue> {
        let frame = self
            .session
            .send(Command::GetStatus, &status_request(kind))
            .await?;
        let value = parse_status(&frame)?;

        let matches = matches!(
            (kind, value),
            (StatusKind::Lock, StatusValue::Lock(_))
                | (StatusKind::Door, StatusValue::Door(_))
                | (StatusKind::Battery, StatusValue::Battery(_))
        );
        if matches {
            Ok(value)
        } else {
            Err(LockError::Protocol(format!(
                "Asked for {kind:?} status, got {value:?}"
            )))
        }
    }

    async fn read_lock_status(&self) -> Result<LockStatus> {
        match self.read_status(StatusKind::Lock).await? {
            StatusValue::Lock(status) => Ok(status),
            other => Err(LockError::Protocol(format!("Unexpected {other:?}"))),
        }
    }

    async fn read_door_status(&self) -> Result<DoorStatus> {
        match self.read_status(StatusKind::Door).await? {
            StatusValue::Door(status) => Ok(status),
            other => Err(LockError::Protocol(format!("Unexpected {other:?}"))),
        }
    }

    async fn read_battery(&self) -> Result<BatteryState> {
        match self.read_status(StatusKind::Battery).await? {
            StatusValue::Battery(battery) => Ok(battery),
            other => Err(LockError::Protocol(format!("Unexpected {other:?}"))),
        }
    }

    /// Current lock, door and battery state.
    ///
    /// An advertisement younger than the configured TTL answers without
    /// connecting. Otherwise the state is read over the session; locks
    /// without a door sensor report [`DoorStatus::Unknown`].
    ///
    /// # Errors
    ///
    /// Returns any connection, authentication or protocol error from the
    /// session.
    pub async fn get_status(&self) -> Result<(LockState, Option<ConnectionInfo>)> {
        let fresh = self
            .shared
            .cache()
            .advertised
            .filter(|(_, seen)| seen.elapsed() < self.config.advertisement_ttl());
        if let Some((state, _)) = fresh {
            debug!("Answering status for {} from advertisement", self.discovery.name);
            return Ok((state, None));
        }

        self.ensure_ready().await?;
        let lock = self.read_lock_status().await?;
        let info = self.session.read_lock_info().await?;
        self.shared.remember_info(&info);
        let door = if info.door_sense() {
            self.read_door_status().await?
        } else {
            DoorStatus::Unknown
        };
        let battery = self.read_battery().await?;

        let state = LockState::new(lock, door, Some(battery), None);
        let connection = self.session.connection_info().await;
        self.shared.publish(&LockUpdate {
            state,
            origin: UpdateOrigin::StatusRead,
            operation: None,
            connection,
        });
        Ok((state, connection))
    }

    async fn operate(&self, command: Command) -> Result<(LockState, Option<ConnectionInfo>)> {
        self.ensure_ready().await?;
        let frame = self.session.send(command, &[]).await?;
        let outcome = parse_command_outcome(command, &frame)?;

        if outcome.accepted {
            info!("{} {command} accepted: {}", self.discovery.name, outcome.lock);
        } else {
            warn!("{} rejected {command}", self.discovery.name);
        }

        let previous = self.shared.cache().state;
        let state = LockState::new(
            outcome.lock,
            previous.door(),
            previous.battery(),
            Some(AuthState {
                successful: outcome.accepted,
            }),
        );
        let connection = self.session.connection_info().await;
        self.shared.publish(&LockUpdate {
            state,
            origin: UpdateOrigin::Command,
            operation: Some(outcome.operation),
            connection,
        });
        Ok((state, connection))
    }

    /// Throw the bolt
    ///
    /// # Errors
    ///
    /// Returns any connection, authentication or protocol error from the
    /// session. A lock that refuses the command is not an error; see
    /// [`LockState::auth`].
    pub async fn lock(&self) -> Result<(LockState, Option<ConnectionInfo>)> {
        self.operate(Command::Lock).await
    }

    /// Retract the bolt
    ///
    /// # Errors
    ///
    /// Same as [`Lock::lock`].
    pub async fn unlock(&self) -> Result<(LockState, Option<ConnectionInfo>)> {
        self.operate(Command::Unlock).await
    }

    /// Device information, read once per connection
    ///
    /// # Errors
    ///
    /// Returns any connection or authentication error from the session.
    pub async fn lock_info(&self) -> Result<LockInfo> {
        self.ensure_ready().await?;
        let info = self.session.read_lock_info().await?;
        self.shared.remember_info(&info);
        Ok(info)
    }

    /// Send a no-op to keep the connection open
    ///
    /// # Errors
    ///
    /// Returns any connection or protocol error from the session.
    pub async fn keep_alive(&self) -> Result<()> {
        self.ensure_ready().await?;
        self.session.send(Command::Nop, &[]).await.map(|_| ())
    }

    /// Close the session; the next command reconnects
    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }
}

impl<T: Transport> Drop for Lock<T> {
    fn drop(&mut self) {
        if let Some(task) = self
            .event_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }

        if self.session.state() != SessionState::Disconnected {
            if let Ok(handle) = Handle::try_current() {
                let session = self.session.clone();
                handle.spawn(async move {
                    session.disconnect().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{discovery, init_tracing, FakeTransport, TestCipher, TEST_ADDRESS},
        YALE_MANUFACTURER_ID,
    };
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    fn lock(transport: FakeTransport) -> Lock<FakeTransport> {
        init_tracing();
        Lock::new(
            transport,
            Arc::new(TestCipher),
            discovery(),
            LockConfig::default(),
        )
    }

    fn updates(lock: &Lock<FakeTransport>) -> mpsc::UnboundedReceiver<LockUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Kept registered for the lifetime of the lock
        let _subscription = lock.subscribe(move |update| {
            let _ = tx.send(update.clone());
        });
        rx
    }

    fn yale_advertisement(packed: u8) -> HashMap<u16, Vec<u8>> {
        HashMap::from([(YALE_MANUFACTURER_ID, vec![0x06, packed])])
    }

    #[tokio::test]
    async fn test_get_status_reads_lock() {
        let transport = FakeTransport::new().with_state(LockStatus::Unlocked, DoorStatus::Opened);
        let lock = lock(transport.clone());

        let (state, connection) = assert_ok!(lock.get_status().await);
        assert_eq!(state.lock(), LockStatus::Unlocked);
        assert_eq!(state.door(), DoorStatus::Opened);
        assert_eq!(state.battery().map(|b| b.percentage), Some(60));
        assert_eq!(state.auth(), None);
        assert_eq!(connection, Some(ConnectionInfo { rssi: -58 }));
        assert_eq!(lock.session_state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_no_door_sense_model() {
        let transport = FakeTransport::new()
            .with_model("ASL-02")
            .with_state(LockStatus::Locked, DoorStatus::Opened);
        let lock = lock(transport.clone());

        let (state, _) = assert_ok!(lock.get_status().await);
        assert_eq!(state.door(), DoorStatus::Unknown);

        let status_reads = transport
            .commands()
            .iter()
            .filter(|c| **c == Command::GetStatus)
            .count();
        assert_eq!(status_reads, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_advertisement_answers_status() {
        let transport = FakeTransport::new().with_state(LockStatus::Locked, DoorStatus::Closed);
        let lock = lock(transport.clone());

        let decoded = lock.handle_advertisement(&yale_advertisement(0x33), Some(-70));
        assert!(matches!(decoded, Some(AdvertisementState::Decoded(_))));

        let (state, _) = assert_ok!(lock.get_status().await);
        assert_eq!(state.lock(), LockStatus::Unlocked);
        assert_eq!(state.door(), DoorStatus::Opened);
        assert_eq!(transport.connects(), 0);

        // Stale after the TTL
        tokio::time::advance(Duration::from_secs(31)).await;
        let (state, _) = assert_ok!(lock.get_status().await);
        assert_eq!(state.lock(), LockStatus::Locked);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_unlock_and_lock() {
        let transport = FakeTransport::new();
        let lock = lock(transport.clone());
        let mut updates = updates(&lock);

        let (state, connection) = assert_ok!(lock.unlock().await);
        assert_eq!(state.lock(), LockStatus::Unlocked);
        assert_eq!(state.auth(), Some(AuthState { successful: true }));
        assert!(connection.is_some());

        let update = assert_ok!(updates.try_recv());
        assert_eq!(update.origin, UpdateOrigin::Command);
        let operation = update.operation.unwrap();
        assert_eq!(operation.source, OperationSource::Remote);
        assert_eq!(operation.remote_type, Some(OperationRemoteType::Ble));

        let (state, _) = assert_ok!(lock.lock().await);
        assert_eq!(state.lock(), LockStatus::Locked);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let transport = FakeTransport::new()
            .with_state(LockStatus::Locked, DoorStatus::Closed)
            .rejecting_commands();
        let lock = lock(transport);

        let (state, _) = assert_ok!(lock.unlock().await);
        assert_eq!(state.lock(), LockStatus::Locked);
        assert_eq!(state.auth(), Some(AuthState { successful: false }));
    }

    #[tokio::test]
    async fn test_advertisement_updates() {
        let lock = lock(FakeTransport::new());
        let mut updates = updates(&lock);

        assert_ok!(lock.unlock().await);
        let update = assert_ok!(updates.try_recv());
        assert_eq!(update.state.auth(), Some(AuthState { successful: true }));

        lock.handle_advertisement(&yale_advertisement(0x15), Some(-61));
        let update = assert_ok!(updates.try_recv());
        assert_eq!(update.origin, UpdateOrigin::Advertisement);
        assert_eq!(update.state.lock(), LockStatus::Locked);
        assert_eq!(update.state.auth(), None);
        assert_eq!(update.connection, Some(ConnectionInfo { rssi: -61 }));

        // Encrypted with a key we do not hold
        let mut sealed = vec![0x11];
        sealed.extend_from_slice(&[0u8; 20]);
        let ambiguous = HashMap::from([(YALE_MANUFACTURER_ID, sealed)]);
        assert_eq!(
            lock.handle_advertisement(&ambiguous, None),
            Some(AdvertisementState::DecodeAmbiguous)
        );
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_command_supersedes_advertisement() {
        let transport = FakeTransport::new().with_state(LockStatus::Locked, DoorStatus::Closed);
        let lock = lock(transport.clone());

        lock.handle_advertisement(&yale_advertisement(0x15), None);
        let (state, _) = assert_ok!(lock.unlock().await);
        assert_eq!(state.lock(), LockStatus::Unlocked);

        let (state, connection) = assert_ok!(lock.get_status().await);
        assert_eq!(state.lock(), LockStatus::Unlocked);
        assert!(connection.is_some());
        assert_eq!(lock.last_state().lock(), LockStatus::Unlocked);
    }

    #[tokio::test]
    async fn test_notification_supersedes_advertisement() {
        let transport = FakeTransport::new().with_state(LockStatus::Locked, DoorStatus::Closed);
        let lock = lock(transport.clone());
        let mut updates = updates(&lock);

        assert_ok!(lock.keep_alive().await);
        lock.handle_advertisement(&yale_advertisement(0x15), None);
        assert_ok!(updates.try_recv());

        transport.push_event(StatusKind::Door, DoorStatus::Opened.code(), 0, 0);
        let update = updates.recv().await.unwrap();
        assert_eq!(update.origin, UpdateOrigin::Notification);

        // Answered by a connected read, not the older broadcast
        let (_, connection) = assert_ok!(lock.get_status().await);
        assert!(connection.is_some());
    }

    #[tokio::test]
    async fn test_no_door_sense_hides_passive_door() {
        let transport = FakeTransport::new()
            .with_model("ASL-02")
            .with_state(LockStatus::Locked, DoorStatus::Closed);
        let lock = lock(transport.clone());
        let mut updates = updates(&lock);

        assert!(!assert_ok!(lock.lock_info().await).door_sense());

        lock.handle_advertisement(&yale_advertisement(0x35), None);
        let update = assert_ok!(updates.try_recv());
        assert_eq!(update.state.lock(), LockStatus::Locked);
        assert_eq!(update.state.door(), DoorStatus::Unknown);

        let (state, connection) = assert_ok!(lock.get_status().await);
        assert_eq!(connection, None);
        assert_eq!(state.door(), DoorStatus::Unknown);

        transport.push_event(StatusKind::Door, DoorStatus::Ajar.code(), 0, 0);
        let update = updates.recv().await.unwrap();
        assert_eq!(update.origin, UpdateOrigin::Notification);
        assert_eq!(update.state.door(), DoorStatus::Unknown);

        // Survives a reconnect
        lock.disconnect().await;
        lock.handle_advertisement(&yale_advertisement(0x35), None);
        let update = assert_ok!(updates.try_recv());
        assert_eq!(update.state.door(), DoorStatus::Unknown);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let lock = lock(FakeTransport::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = lock.subscribe(move |update: &LockUpdate| {
            let _ = tx.send(update.origin);
        });

        lock.handle_advertisement(&yale_advertisement(0x15), None);
        assert_eq!(rx.try_recv().ok(), Some(UpdateOrigin::Advertisement));

        subscription.unsubscribe();
        lock.handle_advertisement(&yale_advertisement(0x13), None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_notifications_reach_subscribers() {
        let transport = FakeTransport::new();
        let lock = lock(transport.clone());
        let mut updates = updates(&lock);

        assert_ok!(lock.keep_alive().await);
        transport.push_event(StatusKind::Door, DoorStatus::Ajar.code(), 0, 0);

        let update = updates.recv().await.unwrap();
        assert_eq!(update.origin, UpdateOrigin::Notification);
        assert_eq!(update.state.door(), DoorStatus::Ajar);
        assert_eq!(lock.last_state().door(), DoorStatus::Ajar);
    }

    #[tokio::test]
    async fn test_watch_advertisements_filters_address() {
        let lock = lock(FakeTransport::new());
        let mut updates = updates(&lock);

        let other = Advertisement {
            address: "11:22:33:44:55:66".to_string(),
            manufacturer_data: yale_advertisement(0x13),
            rssi: None,
        };
        let ours = Advertisement {
            address: TEST_ADDRESS.to_lowercase(),
            manufacturer_data: yale_advertisement(0x15),
            rssi: Some(-50),
        };
        let task = lock.watch_advertisements(futures::stream::iter([other, ours]).boxed());
        assert_ok!(task.await);

        let update = assert_ok!(updates.try_recv());
        assert_eq!(update.state.lock(), LockStatus::Locked);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_lock_info_and_disconnect() {
        let transport = FakeTransport::new();
        let lock = lock(transport.clone());

        let info = assert_ok!(lock.lock_info().await);
        assert!(info.door_sense());
        assert_eq!(info.firmware, "2.0.2");

        lock.disconnect().await;
        assert_eq!(lock.session_state(), SessionState::Disconnected);
        assert!(!transport.is_connected());

        // Reconnects on demand
        assert_ok!(lock.keep_alive().await);
        assert_eq!(transport.connects(), 2);
    }

    #[test]
    fn test_parse_operation_source() {
        assert_eq!(
            Lock::<FakeTransport>::parse_operation_source(0x0B, 0x03),
            (OperationSource::Pin, None)
        );
    }
}
