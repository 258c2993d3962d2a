use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc::unbounded_channel, watch};
use tokio::time::Duration;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::address::{Locator, LocatorError, LookupQuery, ServiceRecord, UnitAddress};

/// Upper bound on a single discovery attempt.
pub(crate) const DISCOVERY_DEADLINE: Duration = Duration::from_secs(15);
/// Interval between discovery attempts until a record TTL is learned.
pub(crate) const DISCOVERY_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically resolves the station unit's address via the [`Locator`]
/// and publishes it on the address watch channel. The first publication
/// unblocks the engine; later ones simply update the address, so a unit
/// that roams or renumbers is picked up on the next discovery round.
pub struct AddressResolver {
    locator: Arc<dyn Locator>,
    query: LookupQuery,
    address_tx: watch::Sender<Option<UnitAddress>>,
    verbose: bool,
}

impl AddressResolver {
    pub fn new(
        locator: Arc<dyn Locator>,
        address_tx: watch::Sender<Option<UnitAddress>>,
        verbose: bool,
    ) -> Self {
        Self {
            locator,
            query: LookupQuery::default(),
            address_tx,
            verbose,
        }
    }

    /// Discovery loop. The re-discovery interval is local to this loop:
    /// it starts at [`DISCOVERY_INTERVAL`] and tracks the advertised
    /// record lifetime once the unit has been found. Failures retry
    /// after half the current interval.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = DISCOVERY_INTERVAL;
        loop {
            if self.verbose {
                log::info!("Performing autodiscovery of the station unit");
            }
            match self.discover(&cancel).await {
                Ok(Some(ttl_secs)) => {
                    interval = Duration::from_secs(ttl_secs.max(1) as u64);
                    if self.verbose {
                        log::info!("Re-performing autodiscovery in {interval:?}");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    let recover = interval / 2;
                    log::warn!("Autodiscovery failed {e:}, retrying in {recover:?}");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            log::debug!("Resolver exiting");
                            return;
                        }
                        _ = tokio::time::sleep(recover) => {}
                    }
                    continue;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Resolver exiting");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One bounded discovery attempt. The locator streams records into a
    /// channel while this end looks for the first instance-name match;
    /// on a match the address is published and the advertised TTL
    /// returned.
    async fn discover(&self, cancel: &CancellationToken) -> Result<Option<u32>, LocatorError> {
        let (tx, rx) = unbounded_channel();
        let locator = self.locator.clone();
        let query = self.query.clone();
        let lookup = tokio::spawn(async move { locator.lookup(&query, tx).await });

        let mut records = UnboundedReceiverStream::new(rx);
        let matched = tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(DISCOVERY_DEADLINE) => None,
            found = self.first_match(&mut records) => found,
        };

        match matched {
            Some(record) => {
                lookup.abort();
                self.publish(&record);
                Ok(Some(record.ttl))
            }
            None => {
                lookup.abort();
                // surface a lookup failure so the caller backs off
                match lookup.await {
                    Ok(Err(e)) => Err(e),
                    _ => Ok(None),
                }
            }
        }
    }

    async fn first_match(
        &self,
        records: &mut UnboundedReceiverStream<ServiceRecord>,
    ) -> Option<ServiceRecord> {
        while let Some(record) = records.next().await {
            if record.instance.contains(&self.query.instance) {
                return Some(record);
            }
        }
        None
    }

    fn publish(&self, record: &ServiceRecord) {
        let unit = UnitAddress::from(record);
        if self.verbose {
            log::info!("Found station unit at {}", unit.base_url());
        }
        self.address_tx.send_replace(Some(unit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc::UnboundedSender;

    struct StaticLocator {
        records: Vec<ServiceRecord>,
    }

    #[async_trait]
    impl Locator for StaticLocator {
        async fn lookup(
            &self,
            _query: &LookupQuery,
            results: UnboundedSender<ServiceRecord>,
        ) -> Result<(), LocatorError> {
            for record in &self.records {
                results.send(record.clone()).ok();
            }
            Ok(())
        }
    }

    struct FailingLocator;

    #[async_trait]
    impl Locator for FailingLocator {
        async fn lookup(
            &self,
            _query: &LookupQuery,
            _results: UnboundedSender<ServiceRecord>,
        ) -> Result<(), LocatorError> {
            Err(LocatorError::Lookup("no responders".to_string()))
        }
    }

    fn unit_record(instance: &str) -> ServiceRecord {
        ServiceRecord {
            instance: instance.to_string(),
            host_name: "station.local.".to_string(),
            port: 80,
            addr_v4: vec![Ipv4Addr::new(192, 168, 1, 40)],
            addr_v6: vec![],
            ttl: 120,
        }
    }

    #[tokio::test]
    async fn discovery_publishes_first_matching_record() {
        let locator = Arc::new(StaticLocator {
            records: vec![
                unit_record("_printer-3f"),
                unit_record("_weatherlinklive-4a"),
            ],
        });
        let (tx, rx) = watch::channel(None);
        let resolver = AddressResolver::new(locator, tx, false);

        let ttl = resolver
            .discover(&CancellationToken::new())
            .await
            .unwrap()
            .expect("expected a match");
        assert_eq!(ttl, 120);
        let unit = rx.borrow().clone().expect("address published");
        assert_eq!(unit.base_url(), "http://192.168.1.40:80");
    }

    #[tokio::test]
    async fn discovery_surfaces_lookup_failure() {
        let (tx, rx) = watch::channel(None);
        let resolver = AddressResolver::new(Arc::new(FailingLocator), tx, false);

        assert!(resolver.discover(&CancellationToken::new()).await.is_err());
        assert!(rx.borrow().is_none());
    }

    #[tokio::test]
    async fn non_matching_records_leave_address_unset() {
        let locator = Arc::new(StaticLocator {
            records: vec![unit_record("_printer-3f")],
        });
        let (tx, rx) = watch::channel(None);
        let resolver = AddressResolver::new(locator, tx, false);

        let found = resolver.discover(&CancellationToken::new()).await.unwrap();
        assert!(found.is_none());
        assert!(rx.borrow().is_none());
    }
}
