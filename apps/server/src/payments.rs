use async_trait::async_trait;

use crate::error::BookingError;

#[derive(Debug, Clone)]
pub struct Invoice {
    pub invoice_ref: String,
    pub external_url: String,
}

/// Provider-side view of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentState {
    Paid,
    Pending,
    Failed,
    Cancelled,
}

/// Minimal payment port. The booking core never talks to a provider
/// directly; it opens an invoice at finalize time and verifies it from the
/// reconciler or the webhook.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_invoice(
        &self,
        booking_id: i64,
        amount_minor: i64,
        currency: &str,
    ) -> Result<Invoice, BookingError>;

    async fn verify_payment(&self, invoice_ref: &str) -> Result<PaymentState, BookingError>;
}

/// HTTP provider speaking a YooKassa-shaped API: basic auth, an
/// `Idempotence-Key` header, redirect confirmation URLs.
pub struct HttpPaymentProvider {
    api_url: String,
    shop_id: String,
    secret_key: String,
    http: reqwest::Client,
}

impl HttpPaymentProvider {
    pub fn new(api_url: String, shop_id: String, secret_key: String) -> Self {
        Self {
            api_url,
            shop_id,
            secret_key,
            http: reqwest::Client::new(),
        }
    }

    fn major_units(amount_minor: i64) -> String {
        format!("{}.{:02}", amount_minor / 100, amount_minor % 100)
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_invoice(
        &self,
        booking_id: i64,
        amount_minor: i64,
        currency: &str,
    ) -> Result<Invoice, BookingError> {
        let body = serde_json::json!({
            "amount": {
                "value": Self::major_units(amount_minor),
                "currency": currency,
            },
            "capture": true,
            "metadata": {
                "booking_id": booking_id.to_string(),
            },
        });

        let resp = self
            .http
            .post(format!("{}/payments", self.api_url))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            // Stable per booking so provider-side retries collapse.
            .header("Idempotence-Key", format!("booking-{booking_id}"))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                tracing::error!(booking_id, error = %err, "invoice creation request failed");
                BookingError::PaymentInitFailed
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(booking_id, %status, body = %text, "invoice creation rejected");
            return Err(BookingError::PaymentInitFailed);
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|_| BookingError::PaymentInitFailed)?;

        let invoice_ref = json["id"]
            .as_str()
            .ok_or(BookingError::PaymentInitFailed)?
            .to_string();
        let external_url = json["confirmation"]["confirmation_url"]
            .as_str()
            .ok_or(BookingError::PaymentInitFailed)?
            .to_string();

        tracing::info!(booking_id, invoice_ref = %invoice_ref, "invoice created");
        Ok(Invoice {
            invoice_ref,
            external_url,
        })
    }

    async fn verify_payment(&self, invoice_ref: &str) -> Result<PaymentState, BookingError> {
        let resp = self
            .http
            .get(format!("{}/payments/{invoice_ref}", self.api_url))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(invoice_ref, error = %err, "payment verification request failed");
                BookingError::PaymentVerificationFailed
            })?;

        if !resp.status().is_success() {
            return Err(BookingError::PaymentVerificationFailed);
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|_| BookingError::PaymentVerificationFailed)?;

        match json["status"].as_str() {
            Some("succeeded") => Ok(PaymentState::Paid),
            Some("pending") | Some("waiting_for_capture") => Ok(PaymentState::Pending),
            Some("canceled") => Ok(PaymentState::Cancelled),
            Some(_) => Ok(PaymentState::Failed),
            None => Err(BookingError::PaymentVerificationFailed),
        }
    }
}

/// Fallback when no provider is configured: online finalization fails fast
/// and cash flows stay fully functional.
pub struct DisabledPayments;

#[async_trait]
impl PaymentProvider for DisabledPayments {
    async fn create_invoice(
        &self,
        booking_id: i64,
        _amount_minor: i64,
        _currency: &str,
    ) -> Result<Invoice, BookingError> {
        tracing::warn!(booking_id, "online payment requested but no provider configured");
        Err(BookingError::PaymentInitFailed)
    }

    async fn verify_payment(&self, _invoice_ref: &str) -> Result<PaymentState, BookingError> {
        Err(BookingError::PaymentVerificationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minor_units_render_as_decimal() {
        assert_eq!(HttpPaymentProvider::major_units(10000), "100.00");
        assert_eq!(HttpPaymentProvider::major_units(2919), "29.19");
        assert_eq!(HttpPaymentProvider::major_units(5), "0.05");
    }
}
