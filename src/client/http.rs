//! Reqwest-based HTTP client for the payment gateway.
//!
//! Handles invoice creation and payment checks. Every request carries a
//! bearer token from the shared [`TokenCache`]. Nothing is retried here;
//! callers poll `check_payment` at their own cadence.

use crate::client::token::{TokenCache, TokenEndpoint};
use crate::client::{sender_invoice_no, CreatedInvoice, PaymentGateway};
use crate::clock::Clock;
use crate::config::PaygrantConfig;
use crate::protocol::models::{
    parse_payment_check, parse_success, upstream_failure, InvoiceRequest, InvoiceResponse,
    PageOffset, PaymentCheckRequest, PaymentCheckResult, INVOICE_OBJECT_TYPE,
};
use crate::PaygrantError;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;

/// Raw gateway response: status and body text.
#[derive(Debug)]
struct GatewayResponse {
    status: u16,
    body: String,
}

impl GatewayResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Payment gateway HTTP client.
pub struct GatewayClient {
    client: Client,
    base_url: String,
    invoice_code: Option<String>,
    invoice_receiver_code: String,
    callback_url: Option<String>,
    page_limit: u32,
    tokens: Arc<TokenCache>,
    clock: Arc<dyn Clock>,
}

impl GatewayClient {
    /// Create a gateway client from config, with its own token cache.
    pub fn new(config: &PaygrantConfig, clock: Arc<dyn Clock>) -> Result<Self, PaygrantError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| PaygrantError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        let endpoint = TokenEndpoint::new(client.clone(), &config.base_url, config.credentials());
        let tokens = Arc::new(TokenCache::new(Arc::new(endpoint), clock.clone()));

        Ok(Self::with_token_cache(client, config, tokens, clock))
    }

    /// Create a client sharing an existing token cache.
    pub fn with_token_cache(
        client: Client,
        config: &PaygrantConfig,
        tokens: Arc<TokenCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            invoice_code: config.invoice_code.clone().filter(|c| !c.is_empty()),
            invoice_receiver_code: config.invoice_receiver_code.clone(),
            callback_url: config.callback_url.clone(),
            page_limit: config.payment_page_limit.max(1),
            tokens,
            clock,
        }
    }

    /// The token cache this client draws from.
    pub fn token_cache(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    /// POST a JSON body with a bearer token.
    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<GatewayResponse, PaygrantError> {
        let token = self.tokens.get().await?;
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| PaygrantError::GatewayTransport(format!("Request to {} failed: {}", path, e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| PaygrantError::GatewayTransport(format!("Failed to read body: {}", e)))?;

        tracing::debug!(path, status, body = %body, "Gateway response");
        Ok(GatewayResponse { status, body })
    }
}

#[async_trait]
impl PaymentGateway for GatewayClient {
    async fn create_invoice(
        &self,
        amount: u64,
        description: &str,
    ) -> Result<CreatedInvoice, PaygrantError> {
        let invoice_code = self.invoice_code.as_deref().ok_or_else(|| {
            PaygrantError::ConfigError("invoice_code is not configured".to_string())
        })?;

        let sender_invoice_no = sender_invoice_no(self.clock.now_utc());
        let request = InvoiceRequest {
            invoice_code,
            sender_invoice_no: &sender_invoice_no,
            invoice_receiver_code: &self.invoice_receiver_code,
            invoice_description: description,
            amount,
            callback_url: self.callback_url.as_deref(),
        };

        let response = self.post_json("/v2/invoice", &request).await?;
        if !response.is_success() {
            let err = upstream_failure(response.status, &response.body);
            tracing::warn!(
                status = response.status,
                sender_invoice_no = %sender_invoice_no,
                error = %err,
                "Gateway invoice creation failed"
            );
            return Err(err);
        }

        let parsed: InvoiceResponse = parse_success(response.status, &response.body)?;
        if parsed.invoice_id.is_empty() {
            return Err(PaygrantError::upstream(
                Some(response.status),
                "Invoice response carried an empty invoice_id",
                response.body,
            ));
        }

        tracing::info!(
            invoice_id = %parsed.invoice_id,
            sender_invoice_no = %sender_invoice_no,
            amount,
            "Gateway invoice created"
        );

        Ok(CreatedInvoice {
            invoice_id: parsed.invoice_id,
            qr_text: parsed.qr_text,
            qr_image: parsed.qr_image,
            urls: parsed.urls,
            sender_invoice_no,
            amount,
        })
    }

    async fn check_payment(&self, invoice_id: &str) -> Result<PaymentCheckResult, PaygrantError> {
        let request = PaymentCheckRequest {
            object_type: INVOICE_OBJECT_TYPE,
            object_id: invoice_id,
            offset: PageOffset {
                page_number: 1,
                page_limit: self.page_limit,
            },
        };

        let response = self.post_json("/v2/payment/check", &request).await?;
        if !response.is_success() {
            let err = upstream_failure(response.status, &response.body);
            tracing::warn!(status = response.status, invoice_id, error = %err, "Gateway payment check failed");
            return Err(err);
        }

        let result = parse_payment_check(response.status, &response.body)?;
        tracing::debug!(invoice_id, paid = result.paid, "Gateway payment check");
        Ok(result)
    }
}
