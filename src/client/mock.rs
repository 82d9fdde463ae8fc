//! Offline gateway for mock mode.
//!
//! Fabricates invoices locally and reports payments from an in-memory set.
//! With `auto_confirm` on, every invoice it created reports as paid, which
//! lets the whole flow run without gateway credentials.

use crate::client::{sender_invoice_no, CreatedInvoice, PaymentGateway};
use crate::clock::Clock;
use crate::protocol::models::{InvoiceLink, PaymentCheckResult, PAID_STATUS};
use crate::PaygrantError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct MockLedger {
    invoices: HashMap<String, u64>,
    paid: HashSet<String>,
    counter: u64,
}

/// In-process stand-in for the payment gateway.
///
/// Its ledger lives only in memory and only grows; nothing is evicted.
/// Payment state is lost on restart, so invoices that already hold a grant
/// are answered from the store instead (see [`crate::GrantBroker::check`]).
pub struct MockGateway {
    clock: Arc<dyn Clock>,
    auto_confirm: bool,
    ledger: Mutex<MockLedger>,
}

impl MockGateway {
    /// Create a mock gateway. With `auto_confirm`, created invoices read as paid.
    pub fn new(clock: Arc<dyn Clock>, auto_confirm: bool) -> Self {
        Self {
            clock,
            auto_confirm,
            ledger: Mutex::new(MockLedger::default()),
        }
    }

    /// Record a payment against an invoice.
    pub async fn mark_paid(&self, invoice_id: &str) {
        self.ledger.lock().await.paid.insert(invoice_id.to_string());
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_invoice(
        &self,
        amount: u64,
        description: &str,
    ) -> Result<CreatedInvoice, PaygrantError> {
        let now = self.clock.now_utc();
        let sender_invoice_no = sender_invoice_no(now);

        let mut ledger = self.ledger.lock().await;
        ledger.counter += 1;
        let invoice_id = format!("mock-{}-{}", now.timestamp_millis(), ledger.counter);
        ledger.invoices.insert(invoice_id.clone(), amount);
        if self.auto_confirm {
            ledger.paid.insert(invoice_id.clone());
        }
        drop(ledger);

        tracing::info!(invoice_id = %invoice_id, amount, description, "Mock invoice created");

        Ok(CreatedInvoice {
            qr_text: format!("mock://pay/{}?amount={}", invoice_id, amount),
            qr_image: String::new(),
            urls: vec![InvoiceLink {
                name: "mock".to_string(),
                description: Some("Mock payment".to_string()),
                logo: None,
                link: format!("mock://pay/{}", invoice_id),
            }],
            invoice_id,
            sender_invoice_no,
            amount,
        })
    }

    async fn check_payment(&self, invoice_id: &str) -> Result<PaymentCheckResult, PaygrantError> {
        let ledger = self.ledger.lock().await;
        let paid = ledger.paid.contains(invoice_id);
        let rows = if paid {
            vec![serde_json::json!({
                "payment_id": format!("mock-payment-{}", invoice_id),
                "payment_status": PAID_STATUS,
                "payment_amount": ledger.invoices.get(invoice_id).copied().unwrap_or(0),
            })]
        } else {
            Vec::new()
        };

        Ok(PaymentCheckResult {
            paid,
            raw: serde_json::json!({ "count": rows.len(), "rows": rows }),
        })
    }
}
