use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use wxmind_report::{Report, ReportError, ReportStore};

use crate::address::{AddressError, Locator, UnitAddress};
use crate::poller::ConditionsPoller;
use crate::receiver::{BroadcastReceiver, LeaseState, LeaseWatchdog};
use crate::resolver::AddressResolver;
use crate::transport::{HttpTransport, PullTransport, TransportError};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Address error")]
    Address(#[from] AddressError),
    #[error("Transport error")]
    Transport(#[from] TransportError),
    #[error("Report error")]
    Report(#[from] ReportError),
}

/// Lifecycle states of the acquisition engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    WaitingForAddress,
    Running,
    Terminating,
    Terminated,
}

/// Facade over the acquisition engine for a single station unit. Owns
/// the cancellation tree and the completion barrier: every engine task
/// is a child of the token handed to the constructor, and
/// [`Client::closed`] blocks until all of them have observed
/// cancellation and exited.
///
/// # Examples
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let cancel = tokio_util::sync::CancellationToken::new();
/// let mut client = wxmind_engine::Client::unmanaged(cancel.clone(), true, "192.168.1.40", 0)?;
///
/// while client.notify.recv().await.is_some() {
///     let report = client.report()?;
///     println!("{:?} {:?}", report.device_id, report.temperature);
/// }
///
/// cancel.cancel();
/// client.closed().await;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    /// Emits once per coalesced report change. Consumers re-read the
    /// current snapshot via [`Client::report`] on every wake-up.
    pub notify: mpsc::Receiver<()>,
    store: Arc<ReportStore>,
    state_tx: Arc<watch::Sender<EngineState>>,
    tasks: JoinSet<()>,
}

impl Client {
    /// Managed client: discovers the station unit on the local network
    /// via the supplied locator, re-verifying the address on the
    /// advertised record lifetime. Use the unmanaged client on networks
    /// without multicast service discovery.
    pub fn managed(
        cancel: CancellationToken,
        verbose: bool,
        locator: Arc<dyn Locator>,
    ) -> Result<Self, ClientError> {
        let (address_tx, address_rx) = watch::channel(None);
        let mut client = Self::assemble(cancel.clone(), verbose, true, address_rx)?;

        let resolver = AddressResolver::new(locator, address_tx, verbose);
        client.tasks.spawn(resolver.run(cancel.child_token()));

        if verbose {
            log::info!("Managed client initialized");
        }
        Ok(client)
    }

    /// Unmanaged client with a fixed unit hostname or IP. Port 0 selects
    /// the unit's default port; an empty hostname is a construction
    /// error.
    pub fn unmanaged(
        cancel: CancellationToken,
        verbose: bool,
        host: &str,
        port: u16,
    ) -> Result<Self, ClientError> {
        let unit = UnitAddress::fixed(host, port)?;
        if verbose {
            log::info!("Unmanaged client using unit at {}", unit.base_url());
        }
        let (_address_tx, address_rx) = watch::channel(Some(unit));
        Self::assemble(cancel, verbose, false, address_rx)
    }

    fn assemble(
        cancel: CancellationToken,
        verbose: bool,
        managed: bool,
        address_rx: watch::Receiver<Option<UnitAddress>>,
    ) -> Result<Self, ClientError> {
        let (store, notify) = ReportStore::new(verbose);
        let store = Arc::new(store);
        let transport: Arc<dyn PullTransport> = Arc::new(HttpTransport::new()?);
        let (state_tx, _) = watch::channel(EngineState::Created);
        let state_tx = Arc::new(state_tx);

        let mut tasks = JoinSet::new();
        tasks.spawn(Self::engine(
            cancel.child_token(),
            managed,
            verbose,
            store.clone(),
            transport,
            address_rx,
            state_tx.clone(),
        ));

        Ok(Self {
            notify,
            store,
            state_tx,
            tasks,
        })
    }

    /// Supervises the channel loops. In managed mode the engine parks
    /// until the resolver publishes the first address; it then runs the
    /// poller, receiver, and lease watchdog as children of one token and
    /// drains them after cancellation.
    async fn engine(
        cancel: CancellationToken,
        managed: bool,
        verbose: bool,
        store: Arc<ReportStore>,
        transport: Arc<dyn PullTransport>,
        mut address_rx: watch::Receiver<Option<UnitAddress>>,
        state_tx: Arc<watch::Sender<EngineState>>,
    ) {
        if managed {
            state_tx.send_replace(EngineState::WaitingForAddress);
            if verbose {
                log::info!("Waiting for unit autodiscovery");
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    state_tx.send_replace(EngineState::Terminating);
                    return;
                }
                resolved = address_rx.wait_for(|unit| unit.is_some()) => {
                    if resolved.is_err() {
                        // resolver dropped its sender; nothing to run against
                        state_tx.send_replace(EngineState::Terminating);
                        return;
                    }
                }
            }
        }

        state_tx.send_replace(EngineState::Running);
        if verbose {
            log::info!("Starting pull and push event loops");
        }

        let lease = Arc::new(LeaseState::default());
        let port_resolved = CancellationToken::new();

        let mut children = JoinSet::new();
        children.spawn(
            ConditionsPoller::new(
                transport.clone(),
                store.clone(),
                address_rx.clone(),
                verbose,
            )
            .run(cancel.child_token()),
        );
        children.spawn(
            LeaseWatchdog::new(
                transport,
                lease.clone(),
                address_rx,
                port_resolved.clone(),
                verbose,
            )
            .run(cancel.child_token()),
        );
        children.spawn(BroadcastReceiver::new(store, lease, port_resolved, verbose).run(cancel.child_token()));

        cancel.cancelled().await;
        state_tx.send_replace(EngineState::Terminating);
        while children.join_next().await.is_some() {}
    }

    /// Deep copy of the latest consolidated report. Fails until the
    /// engine has produced at least one notifiable report.
    pub fn report(&self) -> Result<Report, ClientError> {
        Ok(self.store.snapshot()?)
    }

    /// Shared report store, for the snapshot transfer surface
    /// ([`ReportStore::encode`] / [`ReportStore::replace_from_serialized`]).
    pub fn store(&self) -> Arc<ReportStore> {
        self.store.clone()
    }

    /// Current engine lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    /// Watch channel tracking engine state transitions.
    pub fn state_watch(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Blocks until every engine task has observed cancellation and
    /// exited.
    pub async fn closed(&mut self) {
        while self.tasks.join_next().await.is_some() {}
        self.state_tx.send_replace(EngineState::Terminated);
    }
}
