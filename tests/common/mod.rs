//! Shared fixtures: a throwaway console on a temp sled db with scriptable
//! collaborators.
#![allow(dead_code)]

use async_trait::async_trait;
use loan_approval::{
    collaborators::{Collaborators, IdentityChecker, NotificationGateway, RegistrationChecker},
    notify::{Delivery, SmsPayload, SmsType},
    policy::{ActingUser, Role},
    request::{LetterDraft, LoanApplication, RegistrationStatus, RequestDetail, ShahkarResult, ShahkarStatus, TimeStamp},
    service::{LoanService, Settings},
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{TempDir, tempdir};

/// Answers with whatever status it was last told to, or errors while down.
pub struct ScriptedIdentity {
    answer: Mutex<ShahkarStatus>,
    down: AtomicBool,
}

impl ScriptedIdentity {
    pub fn answer(&self, status: ShahkarStatus) {
        *self.answer.lock().unwrap() = status;
    }
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl IdentityChecker for ScriptedIdentity {
    async fn check(&self, _national_id: &str, _mobile: &str) -> anyhow::Result<ShahkarResult> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("shahkar unreachable");
        }
        Ok(ShahkarResult::new(*self.answer.lock().unwrap()))
    }
}

pub struct FixedRegistration {
    registered: AtomicBool,
}

impl FixedRegistration {
    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }
}

#[async_trait]
impl RegistrationChecker for FixedRegistration {
    async fn check(&self, _subject_id: &str) -> anyhow::Result<RegistrationStatus> {
        Ok(RegistrationStatus {
            is_registered: self.registered.load(Ordering::SeqCst),
            last_checked_at: Some(TimeStamp::now()),
        })
    }
}

/// Keeps every message it was asked to send.
pub struct RecordingGateway {
    pub sent: Mutex<Vec<(String, SmsType, String)>>,
    failing: AtomicBool,
}

impl RecordingGateway {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn send(
        &self,
        mobile: &str,
        template: SmsType,
        payload: &SmsPayload,
    ) -> anyhow::Result<Delivery> {
        if self.failing.load(Ordering::SeqCst) {
            return Ok(Delivery::failed("provider rejected the message"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((mobile.to_string(), template, payload.message.clone()));
        Ok(Delivery::sent())
    }
}

pub struct Console {
    pub service: LoanService,
    pub identity: Arc<ScriptedIdentity>,
    pub registration: Arc<FixedRegistration>,
    pub gateway: Arc<RecordingGateway>,
    pub db: Arc<sled::Db>,
    _dir: TempDir,
}

pub const BRANCH: &str = "101";

/// A console with one active branch, `101`.
pub fn console() -> anyhow::Result<Console> {
    let dir = tempdir()?;
    let db = Arc::new(sled::open(dir.path().join("console.db"))?);

    let identity = Arc::new(ScriptedIdentity {
        answer: Mutex::new(ShahkarStatus::Ok),
        down: AtomicBool::new(false),
    });
    let registration = Arc::new(FixedRegistration {
        registered: AtomicBool::new(true),
    });
    let gateway = Arc::new(RecordingGateway {
        sent: Mutex::new(vec![]),
        failing: AtomicBool::new(false),
    });
    let collaborators = Collaborators::new(identity.clone(), registration.clone(), gateway.clone());
    let settings = Settings {
        poll_interval: Duration::from_millis(20),
        collaborator_timeout: Duration::from_millis(500),
        ..Settings::default()
    };

    let service = LoanService::with_settings(db.clone(), collaborators, settings)?;
    service.branches().create(BRANCH, "Central", Some("Tehran"), true)?;

    Ok(Console {
        service,
        identity,
        registration,
        gateway,
        db,
        _dir: dir,
    })
}

pub fn staff(role: Role) -> ActingUser {
    ActingUser::new(&format!("{}-1", role.as_str()), role.as_str(), role)
}

pub fn application() -> LoanApplication {
    LoanApplication::new()
        .set_full_name("Reza Karimi")
        .set_mobile("09121234567")
        .set_national_id("0012345678")
        .set_amount_toman(150_000_000)
        .set_tenor_months(36)
        .set_branch_code(BRANCH)
}

pub fn letter() -> LetterDraft {
    LetterDraft::new("LTR-1403-0001", "1403/02/20")
}

impl Console {
    pub fn submit(&self) -> anyhow::Result<RequestDetail> {
        Ok(self.service.submit(application(), &staff(Role::Borrower))?)
    }

    pub async fn waiting_for_letter(&self) -> anyhow::Result<RequestDetail> {
        let detail = self.submit()?;
        Ok(self
            .service
            .verify_identity(&detail.request.id, &ActingUser::system())
            .await?)
    }

    pub async fn waiting_for_bank(&self) -> anyhow::Result<RequestDetail> {
        let detail = self.waiting_for_letter().await?;
        Ok(self
            .service
            .issue_letter(&detail.request.id, &staff(Role::Admin), letter())
            .await?)
    }
}
