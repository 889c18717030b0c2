//! External services the engine calls into
//!
//! The console owns none of these checks. Implementations are supplied by the
//! embedding application; calls are bounded by the configured timeout and
//! never made while a request record is being written.
use super::error::{LoanError, Result};
use super::notify::{Delivery, SmsPayload, SmsType};
use super::request::{RegistrationStatus, ShahkarResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Shahkar: does this national id own this mobile number?
#[async_trait]
pub trait IdentityChecker: Send + Sync {
    async fn check(&self, national_id: &str, mobile: &str) -> anyhow::Result<ShahkarResult>;
}

/// TTShahr registration lookup for a user or request id.
#[async_trait]
pub trait RegistrationChecker: Send + Sync {
    async fn check(&self, subject_id: &str) -> anyhow::Result<RegistrationStatus>;
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(
        &self,
        mobile: &str,
        template: SmsType,
        payload: &SmsPayload,
    ) -> anyhow::Result<Delivery>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityChecker>,
    pub registration: Arc<dyn RegistrationChecker>,
    pub gateway: Arc<dyn NotificationGateway>,
}

impl Collaborators {
    pub fn new(
        identity: Arc<dyn IdentityChecker>,
        registration: Arc<dyn RegistrationChecker>,
        gateway: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self {
            identity,
            registration,
            gateway,
        }
    }
}

/// Await a collaborator call, turning both its error and a timeout into
/// [`LoanError::Dependency`].
pub(crate) async fn bounded<T, F>(name: &str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            tracing::error!(collaborator = name, error = %err, "collaborator call failed");
            Err(LoanError::Dependency(format!("{name} failed: {err:#}")))
        }
        Err(_) => {
            tracing::error!(collaborator = name, ?timeout, "collaborator call timed out");
            Err(LoanError::Dependency(format!(
                "{name} did not answer within {timeout:?}"
            )))
        }
    }
}
