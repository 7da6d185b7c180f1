//! Signed billing completion notices.
//!
//! When a job reaches `Completed` the engine emits a signed event
//! `{job_id, user_id, billed_minutes, billing_period}` to the billing
//! sink. The sink is expected to be idempotent; the usage record in the
//! ledger remains the source of truth.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::info;

use recap_gate::CallError;
use recap_models::BillingNotice;

use crate::error::{EngineError, EngineResult};

type HmacSha256 = Hmac<Sha256>;

/// Sign a notice as `base64(json).base64(hmac_sha256(json))`.
pub fn sign_notice(notice: &BillingNotice, secret: &str) -> EngineResult<String> {
    let json = serde_json::to_vec(notice)
        .map_err(|e| EngineError::internal(format!("Failed to serialize billing notice: {e}")))?;
    let payload = URL_SAFE_NO_PAD.encode(json);

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| EngineError::internal(format!("Invalid billing HMAC key: {e}")))?;
    mac.update(payload.as_bytes());
    let signature = mac.finalize().into_bytes();

    Ok(format!("{}.{}", payload, URL_SAFE_NO_PAD.encode(signature)))
}

/// Verify a signed notice. Returns `None` on any mismatch.
pub fn verify_notice(signed: &str, secret: &str) -> Option<BillingNotice> {
    let (payload, sig_encoded) = signed.split_once('.')?;
    let sig_bytes = URL_SAFE_NO_PAD.decode(sig_encoded).ok()?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload.as_bytes());
    if mac.verify_slice(&sig_bytes).is_err() {
        return None;
    }

    let json = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&json).ok()
}

/// Destination for completion notices.
#[async_trait]
pub trait BillingSink: Send + Sync {
    async fn deliver(&self, notice: &BillingNotice, signed: &str) -> Result<(), CallError>;
}

/// Sink that only logs; the default for deployments where the payment
/// system polls usage records instead.
pub struct LogBillingSink;

#[async_trait]
impl BillingSink for LogBillingSink {
    async fn deliver(&self, notice: &BillingNotice, _signed: &str) -> Result<(), CallError> {
        info!(
            job_id = %notice.job_id,
            user_id = %notice.user_id,
            billed_minutes = notice.billed_minutes,
            billing_period = %notice.billing_period,
            "Billing completion notice"
        );
        Ok(())
    }
}
