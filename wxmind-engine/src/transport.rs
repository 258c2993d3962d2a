use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Duration;

use wxmind_report::{decode_lease_response, decode_pull, DecodeError, LeaseGrant, PullResponse};

use crate::address::UnitAddress;

pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(3);

const ROUTE_CONDITIONS: &str = "/v1/current_conditions";
const ROUTE_LEASE: &str = "/v1/real_time";

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request failed")]
    Http(#[from] reqwest::Error),
    #[error("Decode error")]
    Decode(#[from] DecodeError),
    #[error("Unit error {code}: {message}")]
    Unit { code: i64, message: String },
    #[error("Response carried no payload")]
    EmptyResponse,
}

/// Request/response client for the unit's pull channel, used for both
/// the periodic conditions fetch and broadcast lease requests.
#[async_trait]
pub trait PullTransport: Send + Sync {
    async fn fetch_conditions(&self, unit: &UnitAddress) -> Result<PullResponse, TransportError>;

    /// Asks the unit to enable push-channel broadcasts for
    /// `duration_secs` and returns the granted port.
    async fn request_lease(
        &self,
        unit: &UnitAddress,
        duration_secs: u64,
    ) -> Result<LeaseGrant, TransportError>;
}

/// HTTP implementation of [`PullTransport`].
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        // The unit cannot hold connections open between polls
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>, TransportError> {
        let response = self.client.get(url).timeout(HTTP_TIMEOUT).send().await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl PullTransport for HttpTransport {
    async fn fetch_conditions(&self, unit: &UnitAddress) -> Result<PullResponse, TransportError> {
        let url = format!("{}{ROUTE_CONDITIONS}", unit.base_url());
        let body = self.get(&url).await?;
        let response = decode_pull(&body)?;
        if let Some(err) = &response.error {
            return Err(TransportError::Unit {
                code: err.code,
                message: err.message.clone(),
            });
        }
        Ok(response)
    }

    async fn request_lease(
        &self,
        unit: &UnitAddress,
        duration_secs: u64,
    ) -> Result<LeaseGrant, TransportError> {
        let url = format!("{}{ROUTE_LEASE}?duration={duration_secs}", unit.base_url());
        let body = self.get(&url).await?;
        let response = decode_lease_response(&body)?;
        if let Some(err) = response.error {
            return Err(TransportError::Unit {
                code: err.code,
                message: err.message,
            });
        }
        response.data.ok_or(TransportError::EmptyResponse)
    }
}
