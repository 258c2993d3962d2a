use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use wxmind_report::{decode_push, ReportStore};

use crate::address::UnitAddress;
use crate::transport::PullTransport;

/// How long the push channel may stay quiet before the watchdog
/// re-requests a lease; also the per-read socket deadline.
pub(crate) const RECEIVE_DEADLINE: Duration = Duration::from_secs(15);
/// Watchdog tick, half the receive deadline.
pub(crate) const WATCHDOG_INTERVAL: Duration = Duration::from_millis(7_500);
/// Lease duration requested from the unit (4 hours).
pub(crate) const LEASE_DURATION_SECS: u64 = 14_400;

const RECV_BUFFER_SIZE: usize = 2048;

/// Push-channel lease bookkeeping shared by the receiver and the
/// watchdog. Port 0 means no lease has been granted yet.
#[derive(Debug, Default)]
pub struct LeaseState {
    port: AtomicU16,
    last_rx_ms: AtomicU64,
}

impl LeaseState {
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Relaxed)
    }

    pub fn set_port(&self, port: u16) {
        self.port.store(port, Ordering::Relaxed);
    }

    /// Records receipt of a broadcast.
    pub fn mark_received(&self) {
        let now_ms = Utc::now().timestamp_millis() as u64;
        self.last_rx_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Time since the last received broadcast. A state that has never
    /// seen one reads as quiet since the epoch, so the first watchdog
    /// tick always provisions a lease.
    pub fn elapsed_since_rx(&self) -> Duration {
        let now_ms = Utc::now().timestamp_millis() as u64;
        let last_ms = self.last_rx_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last_ms))
    }
}

/// Monitors push-channel liveness. When the channel has been quiet past
/// the receive deadline, requests a fresh broadcast lease over the pull
/// transport; the first successful grant unparks the receiver.
pub struct LeaseWatchdog {
    transport: Arc<dyn PullTransport>,
    lease: Arc<LeaseState>,
    address_rx: watch::Receiver<Option<UnitAddress>>,
    port_resolved: CancellationToken,
    verbose: bool,
}

impl LeaseWatchdog {
    pub fn new(
        transport: Arc<dyn PullTransport>,
        lease: Arc<LeaseState>,
        address_rx: watch::Receiver<Option<UnitAddress>>,
        port_resolved: CancellationToken,
        verbose: bool,
    ) -> Self {
        Self {
            transport,
            lease,
            address_rx,
            port_resolved,
            verbose,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        if self.verbose {
            log::info!("Starting broadcast lease watchdog");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Lease watchdog exiting");
                    return;
                }
                _ = self.tick() => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Lease watchdog exiting");
                    return;
                }
                _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
            }
        }
    }

    /// One liveness check. A failed lease request leaves the previous
    /// lease state untouched; the next tick retries.
    async fn tick(&self) {
        if self.lease.elapsed_since_rx() <= RECEIVE_DEADLINE {
            return;
        }
        let unit = match self.address_rx.borrow().clone() {
            Some(unit) => unit,
            None => return,
        };
        match self.transport.request_lease(&unit, LEASE_DURATION_SECS).await {
            Ok(grant) => {
                let previous = self.lease.port();
                self.lease.set_port(grant.port);
                if previous == 0 {
                    self.port_resolved.cancel();
                }
                if self.verbose {
                    log::info!(
                        "Broadcasts enabled on port {:} for {:}s",
                        grant.port,
                        grant.duration_secs
                    );
                }
            }
            Err(e) => {
                log::warn!("Failed to enable broadcasts {e:}");
            }
        }
    }
}

/// Listens for push-channel broadcasts and merges them into the store.
/// Parked until the watchdog obtains a lease port; any socket error or
/// read-deadline expiry drops the socket and re-enters the outer
/// wait/reopen loop, leaving the watchdog to decide whether a new lease
/// is needed.
pub struct BroadcastReceiver {
    store: Arc<ReportStore>,
    lease: Arc<LeaseState>,
    port_resolved: CancellationToken,
    verbose: bool,
}

impl BroadcastReceiver {
    pub fn new(
        store: Arc<ReportStore>,
        lease: Arc<LeaseState>,
        port_resolved: CancellationToken,
        verbose: bool,
    ) -> Self {
        Self {
            store,
            lease,
            port_resolved,
            verbose,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            if self.lease.port() == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        log::debug!("Broadcast receiver exiting");
                        return;
                    }
                    _ = self.port_resolved.cancelled() => {}
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Broadcast receiver exiting");
                    return;
                }
                _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
            }

            let port = self.lease.port();
            let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => socket,
                Err(e) => {
                    log::warn!("Failed to open broadcast socket on port {port:} {e:}");
                    continue;
                }
            };
            if self.verbose {
                log::info!("Listening for broadcasts on port {port:}");
            }

            self.read_loop(&socket, cancel.child_token()).await;
            if cancel.is_cancelled() {
                log::debug!("Broadcast receiver exiting");
                return;
            }
            // socket error or deadline expiry: drop the socket and fall
            // back to the wait/reopen path
        }
    }

    async fn read_loop(&self, socket: &UdpSocket, session: CancellationToken) {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                _ = session.cancelled() => return,
                read = tokio::time::timeout(RECEIVE_DEADLINE, socket.recv_from(&mut buffer)) => read,
            };
            let len = match read {
                Ok(Ok((len, _from))) => len,
                Ok(Err(e)) => {
                    log::warn!("Broadcast socket read failed {e:}, reprovisioning");
                    return;
                }
                Err(_) => {
                    log::warn!("No broadcasts within {RECEIVE_DEADLINE:?}, reprovisioning");
                    return;
                }
            };

            let conditions = match decode_push(&buffer[..len]) {
                Ok(conditions) => conditions,
                Err(e) => {
                    log::warn!("Dropping malformed broadcast {e:}");
                    continue;
                }
            };
            if let Err(e) = self.store.merge_from_push(&conditions) {
                log::warn!("Failed to merge broadcast {e:}");
                continue;
            }
            self.lease.mark_received();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use wxmind_report::{LeaseGrant, PullResponse};

    #[derive(Default)]
    struct LeaseCountingTransport {
        leases: AtomicUsize,
    }

    #[async_trait]
    impl PullTransport for LeaseCountingTransport {
        async fn fetch_conditions(
            &self,
            _unit: &UnitAddress,
        ) -> Result<PullResponse, TransportError> {
            Err(TransportError::EmptyResponse)
        }

        async fn request_lease(
            &self,
            _unit: &UnitAddress,
            _duration_secs: u64,
        ) -> Result<LeaseGrant, TransportError> {
            self.leases.fetch_add(1, Ordering::SeqCst);
            Ok(LeaseGrant {
                port: 22222,
                duration_secs: LEASE_DURATION_SECS,
            })
        }
    }

    #[derive(Default)]
    struct RefusingTransport {
        leases: AtomicUsize,
    }

    #[async_trait]
    impl PullTransport for RefusingTransport {
        async fn fetch_conditions(
            &self,
            _unit: &UnitAddress,
        ) -> Result<PullResponse, TransportError> {
            Err(TransportError::EmptyResponse)
        }

        async fn request_lease(
            &self,
            _unit: &UnitAddress,
            _duration_secs: u64,
        ) -> Result<LeaseGrant, TransportError> {
            self.leases.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::EmptyResponse)
        }
    }

    fn watchdog_with(
        transport: Arc<dyn PullTransport>,
        lease: Arc<LeaseState>,
        port_resolved: CancellationToken,
    ) -> LeaseWatchdog {
        let (_tx, address_rx) =
            watch::channel(Some(UnitAddress::fixed("192.168.1.40", 80).unwrap()));
        LeaseWatchdog::new(transport, lease, address_rx, port_resolved, false)
    }

    #[tokio::test]
    async fn stale_channel_provisions_lease_and_unparks_receiver() {
        let transport = Arc::new(LeaseCountingTransport::default());
        let lease = Arc::new(LeaseState::default());
        let port_resolved = CancellationToken::new();
        let watchdog = watchdog_with(transport.clone(), lease.clone(), port_resolved.clone());

        // last_rx has never been set, so the channel reads as stale
        watchdog.tick().await;

        assert_eq!(transport.leases.load(Ordering::SeqCst), 1);
        assert_eq!(lease.port(), 22222);
        assert!(port_resolved.is_cancelled());
    }

    #[tokio::test]
    async fn live_channel_skips_lease_request() {
        let transport = Arc::new(LeaseCountingTransport::default());
        let lease = Arc::new(LeaseState::default());
        lease.mark_received();
        let watchdog = watchdog_with(transport.clone(), lease.clone(), CancellationToken::new());

        watchdog.tick().await;

        assert_eq!(transport.leases.load(Ordering::SeqCst), 0);
        assert_eq!(lease.port(), 0);
    }

    #[tokio::test]
    async fn failed_lease_request_preserves_state() {
        let transport = Arc::new(RefusingTransport::default());
        let lease = Arc::new(LeaseState::default());
        lease.set_port(22222);
        let port_resolved = CancellationToken::new();
        let watchdog = watchdog_with(transport.clone(), lease.clone(), port_resolved.clone());

        watchdog.tick().await;

        assert_eq!(transport.leases.load(Ordering::SeqCst), 1);
        assert_eq!(lease.port(), 22222);
        assert!(!port_resolved.is_cancelled());
    }

    #[tokio::test]
    async fn parked_receiver_exits_on_cancellation() {
        let (store, _notify) = ReportStore::new(false);
        let receiver = BroadcastReceiver::new(
            Arc::new(store),
            Arc::new(LeaseState::default()),
            CancellationToken::new(),
            false,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), receiver.run(cancel))
            .await
            .expect("receiver should observe cancellation while parked");
    }
}
