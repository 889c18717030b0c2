//! SMS side effects and their log
use super::collaborators::{NotificationGateway, bounded};
use super::error::Result;
use super::request::TimeStamp;
use super::store::{Store, encode};
use super::utils::{SMS_HRP, new_uuid_to_bech32};
use std::sync::Arc;
use std::time::Duration;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmsType {
    #[n(0)]
    LetterIssued,
    #[n(1)]
    LoanPaid,
    #[n(2)]
    Manual,
}

impl SmsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SmsType::LetterIssued => "letter_issued",
            SmsType::LoanPaid => "loan_paid",
            SmsType::Manual => "manual",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsStatus {
    #[n(0)]
    Sent,
    #[n(1)]
    Failed,
    #[n(2)]
    Pending,
}

/// What the gateway reports back for one send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub status: DeliveryStatus,
    pub sent_at: TimeStamp,
    pub error: Option<String>,
}

impl Delivery {
    pub fn sent() -> Self {
        Self {
            status: DeliveryStatus::Sent,
            sent_at: TimeStamp::now(),
            error: None,
        }
    }
    pub fn failed(error: &str) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            sent_at: TimeStamp::now(),
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsPayload {
    pub request_number: String,
    pub message: String,
}

/// One send attempt. Written once; a resend is a new entry.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct SmsLog {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub request_id: String,
    #[n(2)]
    pub sequence: u64,
    #[n(3)]
    pub sms_type: SmsType,
    #[n(4)]
    pub status: SmsStatus,
    #[n(5)]
    pub sent_at: TimeStamp,
    #[n(6)]
    pub mobile: String,
    #[n(7)]
    pub message: Option<String>,
    #[n(8)]
    pub error_message: Option<String>,
    #[n(9)]
    pub resent_from: Option<String>,
}

/// Who and what a send is about.
#[derive(Debug, Clone)]
pub struct Recipient<'a> {
    pub request_id: &'a str,
    pub request_number: &'a str,
    pub mobile: &'a str,
}

#[derive(Clone)]
pub struct Notifier {
    store: Store,
    gateway: Arc<dyn NotificationGateway>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(store: Store, gateway: Arc<dyn NotificationGateway>, timeout: Duration) -> Self {
        Self {
            store,
            gateway,
            timeout,
        }
    }

    /// Send once and record the outcome. A gateway failure is recorded as a
    /// `Failed` entry, not returned as an error.
    pub async fn dispatch(
        &self,
        to: Recipient<'_>,
        sms_type: SmsType,
        message: &str,
        resent_from: Option<&str>,
    ) -> Result<SmsLog> {
        let payload = SmsPayload {
            request_number: to.request_number.to_string(),
            message: message.to_string(),
        };
        let delivery = bounded(
            "notification gateway",
            self.timeout,
            self.gateway.send(to.mobile, sms_type, &payload),
        )
        .await
        .unwrap_or_else(|err| Delivery::failed(&err.to_string()));

        let status = match delivery.status {
            DeliveryStatus::Sent => SmsStatus::Sent,
            DeliveryStatus::Failed => SmsStatus::Failed,
        };
        let log = SmsLog {
            id: new_uuid_to_bech32(SMS_HRP)?,
            request_id: to.request_id.to_string(),
            sequence: self.store.next_sequence()?,
            sms_type,
            status,
            sent_at: delivery.sent_at,
            mobile: to.mobile.to_string(),
            message: Some(payload.message),
            error_message: delivery.error,
            resent_from: resent_from.map(str::to_string),
        };
        self.store.sms_logs.insert(log.id.as_bytes(), encode(&log)?)?;

        match log.status {
            SmsStatus::Sent => tracing::info!(
                request_id = %log.request_id, sms_id = %log.id, kind = log.sms_type.as_str(), "sms sent"
            ),
            _ => tracing::warn!(
                request_id = %log.request_id,
                sms_id = %log.id,
                kind = log.sms_type.as_str(),
                error = log.error_message.as_deref().unwrap_or("unknown"),
                "sms not delivered"
            ),
        }

        Ok(log)
    }

    pub fn get(&self, sms_id: &str) -> Result<SmsLog> {
        self.store.get(&self.store.sms_logs, sms_id.as_bytes(), "sms log")
    }

    /// Logs for one request, oldest first.
    pub fn for_request(&self, request_id: &str) -> Result<Vec<SmsLog>> {
        let mut logs: Vec<SmsLog> = self
            .store
            .scan::<SmsLog>(&self.store.sms_logs)?
            .into_iter()
            .filter(|log| log.request_id == request_id)
            .collect();
        logs.sort_by_key(|log| log.sequence);
        Ok(logs)
    }
}

pub(crate) fn letter_issued_message(request_number: &str, letter_number: &str) -> String {
    format!(
        "Your bank introduction letter {letter_number} for request {request_number} has been issued."
    )
}

pub(crate) fn loan_paid_message(request_number: &str, amount_toman: u64) -> String {
    format!("Your loan of {amount_toman} Toman for request {request_number} has been paid.")
}
