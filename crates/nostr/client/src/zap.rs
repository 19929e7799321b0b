//! LNURL side of the zap flow.
//!
//! The pool builds and signs the zap request; this module talks to the
//! recipient's LNURL pay endpoint to turn it into a Lightning invoice.

use crate::error::{ClientError, Result};
use async_trait::async_trait;
use nostr::{Event, LnurlInvoiceResponse, LnurlPayResponse, ZapEndpoint};
use serde_json::Value;
use tracing::debug;

/// Result of a zap: the signed request and the invoice paying for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapResult {
    pub zap_request_event: Event,
    pub invoice: String,
}

/// HTTP GET returning JSON, as LNURL needs it.
#[async_trait]
pub trait LnurlClient: Send + Sync {
    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value>;
}

/// [`LnurlClient`] over `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpLnurlClient {
    client: reqwest::Client,
}

impl HttpLnurlClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LnurlClient for HttpLnurlClient {
    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let response = self.client.get(url).query(query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Http(format!("{url} returned {status}")));
        }
        Ok(response.json().await?)
    }
}

/// Ask `endpoint` for an invoice paying `amount_msats` with `zap_request` attached.
pub async fn fetch_zap_invoice(
    client: &dyn LnurlClient,
    endpoint: &ZapEndpoint,
    zap_request: &Event,
    amount_msats: u64,
) -> Result<String> {
    let pay: LnurlPayResponse = serde_json::from_value(client.get_json(&endpoint.url, &[]).await?)?;
    let callback = pay.zap_callback()?;

    if let Some(min) = pay.min_sendable
        && amount_msats < min
    {
        return Err(ClientError::Zap(format!(
            "amount {amount_msats} msats is below the minimum of {min}"
        )));
    }
    if let Some(max) = pay.max_sendable
        && amount_msats > max
    {
        return Err(ClientError::Zap(format!(
            "amount {amount_msats} msats is above the maximum of {max}"
        )));
    }

    let mut query = vec![
        ("amount", amount_msats.to_string()),
        ("nostr", serde_json::to_string(zap_request)?),
    ];
    if let Some(lnurl) = &endpoint.lnurl {
        query.push(("lnurl", lnurl.clone()));
    }

    debug!("Requesting zap invoice from {}", callback);
    let response: LnurlInvoiceResponse =
        serde_json::from_value(client.get_json(callback, &query).await?)?;
    match response.pr {
        Some(invoice) if !invoice.is_empty() => Ok(invoice),
        _ => Err(ClientError::Zap(response.reason.unwrap_or_else(|| {
            format!(
                "callback returned no invoice (status {})",
                response.status.as_deref().unwrap_or("unknown")
            )
        }))),
    }
}
