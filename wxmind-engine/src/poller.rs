use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use wxmind_report::{ReportError, ReportStore};

use crate::address::UnitAddress;
use crate::transport::{PullTransport, TransportError};

/// Fixed pull-channel poll period.
pub(crate) const POLL_PERIOD: Duration = Duration::from_millis(10_300);
/// One-time delay before the first poll. The unit cannot service the
/// conditions fetch and a lease request concurrently, so a pending
/// lease request from the watchdog gets to go first.
pub(crate) const POLL_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub(crate) enum PollError {
    #[error("Transport error")]
    Transport(#[from] TransportError),
    #[error("Report error")]
    Report(#[from] ReportError),
}

/// Fixed-interval fetch loop against the pull channel. Failures are
/// logged and retried on the next scheduled tick; only cancellation
/// stops the loop.
pub struct ConditionsPoller {
    transport: Arc<dyn PullTransport>,
    store: Arc<ReportStore>,
    address_rx: watch::Receiver<Option<UnitAddress>>,
    verbose: bool,
}

impl ConditionsPoller {
    pub fn new(
        transport: Arc<dyn PullTransport>,
        store: Arc<ReportStore>,
        address_rx: watch::Receiver<Option<UnitAddress>>,
        verbose: bool,
    ) -> Self {
        Self {
            transport,
            store,
            address_rx,
            verbose,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_GRACE) => {}
        }
        if self.verbose {
            log::info!("Fetching conditions every {POLL_PERIOD:?}");
        }
        loop {
            if let Err(e) = self.poll_once(&cancel).await {
                log::warn!("Failed to update conditions {e:}");
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Poller exiting");
                    return;
                }
                _ = tokio::time::sleep(POLL_PERIOD) => {}
            }
        }
    }

    /// One fetch/decode/merge cycle. The in-flight request races the
    /// cancellation token; a timed-out or failed request is left to the
    /// next tick.
    async fn poll_once(&self, cancel: &CancellationToken) -> Result<(), PollError> {
        let unit = match self.address_rx.borrow().clone() {
            Some(unit) => unit,
            None => return Ok(()),
        };
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = self.transport.fetch_conditions(&unit) => response?,
        };
        self.store.merge_from_pull(&response)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wxmind_report::{decode_pull, LeaseGrant, PullResponse};

    struct CannedTransport {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl PullTransport for CannedTransport {
        async fn fetch_conditions(
            &self,
            _unit: &UnitAddress,
        ) -> Result<PullResponse, TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let payload = br#"{
                "data": {
                    "did": "X",
                    "ts": 1724000000,
                    "conditions": [
                        {"lsid": 1, "data_structure_type": 1, "temp": 72.0,
                         "rx_state": 0, "trans_battery_flag": 0}
                    ]
                },
                "error": null
            }"#;
            Ok(decode_pull(payload)?)
        }

        async fn request_lease(
            &self,
            _unit: &UnitAddress,
            _duration_secs: u64,
        ) -> Result<LeaseGrant, TransportError> {
            Err(TransportError::EmptyResponse)
        }
    }

    #[tokio::test]
    async fn poll_cycle_merges_into_store() {
        let transport = Arc::new(CannedTransport {
            fetches: AtomicUsize::new(0),
        });
        let (store, mut notify) = ReportStore::new(false);
        let store = Arc::new(store);
        let (_tx, rx) = watch::channel(Some(UnitAddress::fixed("192.168.1.40", 80).unwrap()));

        let poller = ConditionsPoller::new(transport.clone(), store.clone(), rx, false);
        poller.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(store.snapshot().unwrap().temperature, Some(72.0));
        assert!(notify.try_recv().is_ok());
    }

    #[tokio::test]
    async fn poll_without_address_is_a_noop() {
        let transport = Arc::new(CannedTransport {
            fetches: AtomicUsize::new(0),
        });
        let (store, _notify) = ReportStore::new(false);
        let (_tx, rx) = watch::channel(None);

        let poller = ConditionsPoller::new(transport.clone(), Arc::new(store), rx, false);
        poller.poll_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(transport.fetches.load(Ordering::SeqCst), 0);
    }
}
