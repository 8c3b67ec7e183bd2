//! REST client for the persistence service.
//!
//! `POST <base>` with `{"to","amount","tokenAddress","chainId"}` creates,
//! `GET <base>/<id>` reads and `PATCH <base>/<id>` with
//! `{"status":"PAID","txHash":...}` settles. The service parses `amount` as a
//! six-decimal ("micros") quantity and returns it as the `amountMicros`
//! decimal string.

use crate::amount::{to_decimal, USDC_DECIMALS};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::request::{NewPaymentRequest, PaymentRequest, RequestId, RequestStatus};
use crate::store::RequestStore;
use alloy::primitives::{Address, TxHash};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// Longest server error body echoed into an error message.
const MAX_ERROR_BODY: usize = 160;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateBody {
    to: Address,
    amount: String,
    token_address: Address,
    chain_id: u64,
}

impl From<&NewPaymentRequest> for CreateBody {
    fn from(request: &NewPaymentRequest) -> Self {
        Self {
            to: request.recipient,
            amount: to_decimal(request.amount, USDC_DECIMALS),
            token_address: request.token_address,
            chain_id: request.chain_id,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkPaidBody {
    status: RequestStatus,
    tx_hash: TxHash,
}

/// [`RequestStore`] backed by the pay-link REST service.
///
/// The service is expected to make the `PATCH` a no-op for records that are
/// already paid; this client additionally reads before writing so a paid
/// record is returned without issuing the update.
#[derive(Clone)]
pub struct HttpRequestStore {
    client: Client,
    base_url: Url,
}

impl HttpRequestStore {
    /// Create a client for the configured service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL cannot carry a path, or
    /// [`Error::Store`] if the HTTP client cannot be built.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid store URL {}: {e}", config.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "store URL {} cannot carry a path",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Store(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    fn record_url(&self, id: &RequestId) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::Config(format!("store URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push(id.as_str());
        Ok(url)
    }

    async fn decode(response: Response, id: Option<&RequestId>) -> Result<PaymentRequest> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            let subject = id.map_or_else(|| "create".to_string(), ToString::to_string);
            return Err(match status {
                StatusCode::NOT_FOUND => Error::NotFound(subject),
                StatusCode::CONFLICT => Error::StoreWriteConflict(format!("{subject}: {body}")),
                _ => Error::Store(format!("{subject}: HTTP {status}: {body}")),
            });
        }

        let record: PaymentRequest = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("invalid store response: {e}")))?;
        record.validate()?;
        Ok(record)
    }
}

fn transport_error(e: &reqwest::Error) -> Error {
    Error::Store(format!("request failed: {e}"))
}

#[async_trait]
impl RequestStore for HttpRequestStore {
    async fn create(&self, request: NewPaymentRequest) -> Result<PaymentRequest> {
        debug!("POST {}", self.base_url);
        let response = self
            .client
            .post(self.base_url.clone())
            .json(&CreateBody::from(&request))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        Self::decode(response, None).await
    }

    async fn get(&self, id: &RequestId) -> Result<PaymentRequest> {
        let url = self.record_url(id)?;
        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        Self::decode(response, Some(id)).await
    }

    async fn mark_paid(&self, id: &RequestId, tx_hash: TxHash) -> Result<PaymentRequest> {
        let current = self.get(id).await?;
        if current.is_paid() {
            debug!(
                "Request {id} already paid by {:?}, not patching {tx_hash}",
                current.settlement_tx_hash()
            );
            return Ok(current);
        }

        let url = self.record_url(id)?;
        debug!("PATCH {url}");
        let response = self
            .client
            .patch(url)
            .json(&MarkPaidBody {
                status: RequestStatus::Paid,
                tx_hash,
            })
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let record = Self::decode(response, Some(id)).await?;

        if !record.is_paid() {
            return Err(Error::StoreWriteConflict(format!(
                "{id}: update accepted but record is still {}",
                record.status()
            )));
        }
        info!(
            "Request {id} paid by {:?}",
            record.settlement_tx_hash()
        );
        Ok(record)
    }
}
