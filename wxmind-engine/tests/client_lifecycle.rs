use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use wxmind_engine::{Client, EngineState};

#[tokio::test]
async fn unmanaged_client_requires_hostname() {
    let cancel = CancellationToken::new();
    assert!(Client::unmanaged(cancel, false, "", 0).is_err());
}

#[tokio::test]
async fn cancellation_drains_the_engine() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cancel = CancellationToken::new();
    let mut client =
        Client::unmanaged(cancel.clone(), false, "127.0.0.1", 0).expect("client construction");

    let mut state = client.state_watch();
    tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| *s == EngineState::Running))
        .await
        .expect("engine should start")
        .expect("state channel open");

    // nothing has been fetched yet
    assert!(client.report().is_err());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("all tasks should observe cancellation");
    assert_eq!(client.state(), EngineState::Terminated);
}

#[tokio::test]
async fn managed_client_waits_for_discovery() {
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedSender;
    use wxmind_engine::{Locator, LocatorError, LookupQuery, ServiceRecord};

    /// Locator that never finds anything, parking the engine.
    struct SilentLocator;

    #[async_trait]
    impl Locator for SilentLocator {
        async fn lookup(
            &self,
            _query: &LookupQuery,
            _results: UnboundedSender<ServiceRecord>,
        ) -> Result<(), LocatorError> {
            Ok(())
        }
    }

    let cancel = CancellationToken::new();
    let mut client = Client::managed(cancel.clone(), false, Arc::new(SilentLocator))
        .expect("client construction");

    let mut state = client.state_watch();
    tokio::time::timeout(
        Duration::from_secs(2),
        state.wait_for(|s| *s == EngineState::WaitingForAddress),
    )
    .await
    .expect("engine should park on discovery")
    .expect("state channel open");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("all tasks should observe cancellation");
    assert_eq!(client.state(), EngineState::Terminated);
}
