//! Service layer API for the loan request lifecycle
//!
//! Every transition follows the same path: load the record, refuse closed
//! requests, check the caller's role, check the source status, validate the
//! payload, compute the next stages, then write the record and its new
//! ledger entries in one sled transaction that re-checks the record has not
//! moved since it was loaded. Notifications go out after the write and never
//! undo it. Collaborator calls are awaited outside any transaction.
use super::branches::{Branch, BranchRegistry};
use super::collaborators::{Collaborators, bounded};
use super::config::Config;
use super::error::{LoanError, Result, abort};
use super::ledger::{self, PendingEntries};
use super::notes::NoteStore;
use super::notify::{
    Notifier, Recipient, SmsLog, SmsType, letter_issued_message, loan_paid_message,
};
use super::policy::{self, ActingUser, Operation};
use super::poll::StatusPoller;
use super::query::Projections;
use super::request::{
    BankDecision, BranchRef, LetterDraft, LoanApplication, LoanRequest, RequestDetail,
    ShahkarResult, ShahkarStatus, TimeStamp,
};
use super::status::{self, Command, Stage, Status};
use super::store::{Store, counter_value, decode, encode};
use super::users::{User, UserRegistry};
use super::utils::{self, REQUEST_HRP, new_uuid_to_bech32};
use sled::transaction::{ConflictableTransactionResult, Transactional};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    pub request_prefix: String,
    pub collaborator_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for Settings {
    fn from(config: &Config) -> Self {
        Self {
            request_prefix: config.request_prefix.clone(),
            collaborator_timeout: config.collaborator_timeout,
            poll_interval: config.poll_interval,
        }
    }
}

/// What a committed transition changes on the stored record.
struct Advance {
    stage: Stage,
    history_len: u32,
    head_hash: String,
    changed_at: TimeStamp,
    shahkar: Option<ShahkarResult>,
}

#[derive(Clone)]
pub struct LoanService {
    store: Store,
    collaborators: Collaborators,
    notifier: Notifier,
    settings: Settings,
}

impl LoanService {
    pub fn new(instance: Arc<sled::Db>, collaborators: Collaborators) -> Result<Self> {
        Self::with_settings(instance, collaborators, Settings::default())
    }

    pub fn with_settings(
        instance: Arc<sled::Db>,
        collaborators: Collaborators,
        settings: Settings,
    ) -> Result<Self> {
        let store = Store::open(instance)?;
        let notifier = Notifier::new(
            store.clone(),
            collaborators.gateway.clone(),
            settings.collaborator_timeout,
        );

        Ok(Self {
            store,
            collaborators,
            notifier,
            settings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
    pub fn branches(&self) -> BranchRegistry {
        BranchRegistry::new(self.store.clone())
    }
    pub fn users(&self) -> UserRegistry {
        UserRegistry::new(self.store.clone())
    }
    pub fn notes(&self) -> NoteStore {
        NoteStore::new(self.store.clone())
    }
    pub fn projections(&self) -> Projections {
        Projections::new(self.store.clone())
    }
    pub fn poller(&self) -> StatusPoller {
        StatusPoller::new(self.projections(), self.settings.poll_interval)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<usize> {
        self.store.flush()
    }

    /// A request with its full history.
    pub fn request(&self, id: &str) -> Result<RequestDetail> {
        self.projections().request(id)
    }

    /// Branches offered when filing a request.
    pub fn active_branches(&self) -> Result<Vec<Branch>> {
        self.branches().active()
    }

    pub fn sms_logs(&self, request_id: &str) -> Result<Vec<SmsLog>> {
        self.notifier.for_request(request_id)
    }

    /// Recompute the ledger hash chain of a request against its record.
    pub fn verify_history(&self, id: &str) -> Result<()> {
        let detail = self.request(id)?;
        ledger::verify(&detail.history, &detail.request.head_hash)
    }

    pub fn can(&self, actor: &ActingUser, operation: Operation) -> bool {
        actor.can(operation)
    }

    /// Transitions `actor` may trigger on the request right now.
    pub fn permitted_operations(&self, id: &str, actor: &ActingUser) -> Result<Vec<Operation>> {
        let request = self.load(id)?;
        Ok(policy::permitted_operations(request.status(), actor.role))
    }

    /// File a new request in `Submitted`, seeding its ledger.
    pub fn submit(&self, application: LoanApplication, actor: &ActingUser) -> Result<RequestDetail> {
        actor.authorize(Operation::Submit)?;
        let checked = application.validate()?;

        let registered = match &checked.user_id {
            Some(user_id) => match self.users().get(user_id) {
                Ok(user) => user.ttshahr.is_registered,
                Err(LoanError::NotFound { .. }) => {
                    return Err(LoanError::validation(format!("unknown user {user_id}")));
                }
                Err(err) => return Err(err),
            },
            None => false,
        };

        let id = new_uuid_to_bech32(REQUEST_HRP)?;
        let sequence = self.store.next_sequence()?;
        let request_number = utils::request_number(&self.settings.request_prefix, sequence + 1);
        let now = TimeStamp::now();
        let pending = ledger::chain(&id, 0, "", &[Status::Submitted], actor, now, None)?;
        let code = checked.branch_code.as_bytes();

        let trees = (
            &self.store.requests,
            &self.store.history,
            &self.store.request_numbers,
            &self.store.branch_codes,
            &self.store.branches,
            &self.store.branch_usage,
        );
        let request = trees.transaction(
            |(requests, history, numbers, codes, branches, usage)| -> ConflictableTransactionResult<LoanRequest, LoanError> {
                let unknown = || {
                    abort(LoanError::validation(format!(
                        "branch {} does not exist or is inactive",
                        checked.branch_code
                    )))
                };
                let Some(branch_id) = codes.get(code)? else {
                    return Err(unknown());
                };
                let Some(bytes) = branches.get(branch_id)? else {
                    return Err(unknown());
                };
                let branch: Branch = decode(&bytes).map_err(abort)?;
                if !branch.is_active {
                    return Err(unknown());
                }
                if numbers.get(request_number.as_bytes())?.is_some() {
                    return Err(abort(LoanError::conflict(format!(
                        "request number {request_number} is taken"
                    ))));
                }

                let request = LoanRequest {
                    id: id.clone(),
                    request_number: request_number.clone(),
                    sequence,
                    full_name: checked.full_name.clone(),
                    mobile: checked.mobile.clone(),
                    national_id: checked.national_id.clone(),
                    user_id: checked.user_id.clone(),
                    amount_toman: checked.amount_toman,
                    tenor_months: checked.tenor_months,
                    branch: BranchRef {
                        code: branch.code,
                        name: branch.name,
                    },
                    stage: Stage::Submitted,
                    shahkar: None,
                    ttshahr_status: registered,
                    created_at: now,
                    updated_at: now,
                    history_len: 1,
                    head_hash: pending.head_hash.clone(),
                };

                let uses = counter_value(usage.get(code)?) + 1;
                usage.insert(code, &uses.to_be_bytes()[..])?;
                numbers.insert(request_number.as_bytes(), id.as_bytes())?;
                for (key, value) in &pending.rows {
                    history.insert(key.as_slice(), value.as_slice())?;
                }
                requests.insert(id.as_bytes(), encode(&request).map_err(abort)?)?;
                Ok(request)
            },
        )?;

        tracing::info!(
            request_id = %request.id,
            request_number = %request.request_number,
            branch = %request.branch.code,
            actor = %actor.id,
            "request submitted"
        );
        self.request(&request.id)
    }

    /// Submitted -> IdentityCheck.
    pub fn start_identity_check(&self, id: &str, actor: &ActingUser) -> Result<RequestDetail> {
        let request = self.load(id)?;
        self.guard(&request, actor, Operation::StartIdentityCheck)?;
        self.apply(&request, actor, Command::StartIdentityCheck, None, None)
    }

    /// Apply a Shahkar result: `ok` leads to WaitingForLetter, `fail` to
    /// RejectedByShahkar. Repeating the result that already decided the
    /// request changes nothing.
    pub fn record_identity_check(
        &self,
        id: &str,
        actor: &ActingUser,
        result: ShahkarResult,
    ) -> Result<RequestDetail> {
        let request = self.load(id)?;
        self.guard(&request, actor, Operation::RecordIdentityCheck)?;
        if result.status == ShahkarStatus::Unavailable {
            tracing::error!(request_id = %id, "identity checker unavailable; status left unchanged");
            return Err(LoanError::Dependency(
                "identity checker reported unavailable".to_string(),
            ));
        }
        let command = Command::RecordIdentityCheck(result.status);
        self.apply(&request, actor, command, None, Some(result))
    }

    /// Run the identity check end to end. The checker is asked first; only a
    /// usable answer is written, together with the start of the check when
    /// the request was still `Submitted`.
    pub async fn verify_identity(&self, id: &str, actor: &ActingUser) -> Result<RequestDetail> {
        let request = self.load(id)?;
        let starting = request.status() == Status::Submitted;
        if starting {
            self.guard(&request, actor, Operation::StartIdentityCheck)?;
        }
        self.guard(&request, actor, Operation::RecordIdentityCheck)?;

        let result = self.check_identity(&request).await?;
        let mut stages = vec![];
        let mut stage = request.stage.clone();
        if starting {
            stages = status::transition(&stage, &Command::StartIdentityCheck)?;
            if let Some(last) = stages.last() {
                stage = last.clone();
            }
        }
        stages.extend(status::transition(
            &stage,
            &Command::RecordIdentityCheck(result.status),
        )?);
        self.write(&request, actor, stages, None, Some(result))
    }

    /// Re-run Shahkar for a rejected request. Leaves the request untouched if
    /// the checker cannot be reached or the request moved while waiting.
    pub async fn retry_identity_check(
        &self,
        id: &str,
        actor: &ActingUser,
    ) -> Result<RequestDetail> {
        let request = self.load(id)?;
        self.guard(&request, actor, Operation::RetryIdentityCheck)?;

        let result = self.check_identity(&request).await?;
        let command = Command::RetryIdentityCheck(result.status);
        self.apply(
            &request,
            actor,
            command,
            Some("identity check retried"),
            Some(result),
        )
    }

    /// WaitingForLetter -> LetterIssued -> WaitingForBankApproval, then a
    /// best-effort `letter_issued` SMS.
    pub async fn issue_letter(
        &self,
        id: &str,
        actor: &ActingUser,
        draft: LetterDraft,
    ) -> Result<RequestDetail> {
        let request = self.load(id)?;
        self.guard(&request, actor, Operation::IssueLetter)?;
        let letter = draft.validate(TimeStamp::now())?;

        let note = format!("letter {}", letter.letter_number);
        let message = letter_issued_message(&request.request_number, &letter.letter_number);
        let detail = self.apply(&request, actor, Command::IssueLetter(letter), Some(&note), None)?;

        self.notify(&detail.request, SmsType::LetterIssued, &message).await;
        Ok(detail)
    }

    /// WaitingForBankApproval -> LoanPaid or BankRejected. A payout sends a
    /// best-effort `loan_paid` SMS.
    pub async fn record_bank_result(
        &self,
        id: &str,
        actor: &ActingUser,
        decision: BankDecision,
    ) -> Result<RequestDetail> {
        let request = self.load(id)?;
        self.guard(&request, actor, Operation::RecordBankResult)?;
        let result = decision.validate(request.tenor_months, TimeStamp::now())?;

        let paid = result.paid_amount_toman;
        let note = result.reason.clone();
        let detail = self.apply(
            &request,
            actor,
            Command::RecordBankResult(result),
            note.as_deref(),
            None,
        )?;

        if let Some(amount) = paid {
            let message = loan_paid_message(&detail.request.request_number, amount);
            self.notify(&detail.request, SmsType::LoanPaid, &message).await;
        }
        Ok(detail)
    }

    /// Close from any status but LoanPaid. Closed accepts nothing further.
    pub fn close_request(
        &self,
        id: &str,
        actor: &ActingUser,
        note: Option<&str>,
    ) -> Result<RequestDetail> {
        let request = self.load(id)?;
        self.guard(&request, actor, Operation::CloseRequest)?;
        let note = note.map(str::trim).filter(|n| !n.is_empty());
        self.apply(&request, actor, Command::Close, note, None)
    }

    /// Send a logged SMS again. The old entry is left as it was.
    pub async fn resend_sms(&self, sms_id: &str, actor: &ActingUser) -> Result<SmsLog> {
        actor.authorize(Operation::ResendSms)?;
        let original = self.notifier.get(sms_id)?;
        let request = self.load(&original.request_id)?;

        let to = Recipient {
            request_id: &request.id,
            request_number: &request.request_number,
            mobile: &original.mobile,
        };
        let message = original.message.clone().unwrap_or_default();
        self.notifier
            .dispatch(to, original.sms_type, &message, Some(&original.id))
            .await
    }

    /// Free-text SMS to the borrower of a request.
    pub async fn send_manual_sms(
        &self,
        id: &str,
        actor: &ActingUser,
        message: &str,
    ) -> Result<SmsLog> {
        actor.authorize(Operation::SendManualSms)?;
        let message = message.trim();
        if message.is_empty() {
            return Err(LoanError::validation("message is empty"));
        }
        let request = self.load(id)?;

        let to = Recipient {
            request_id: &request.id,
            request_number: &request.request_number,
            mobile: &request.mobile,
        };
        self.notifier.dispatch(to, SmsType::Manual, message, None).await
    }

    /// Refresh the TTShahr flag kept on a request. Not a status change.
    pub async fn refresh_request_registration(
        &self,
        id: &str,
        actor: &ActingUser,
    ) -> Result<LoanRequest> {
        actor.authorize(Operation::RefreshRegistration)?;
        let request = self.load(id)?;
        let subject = request.user_id.clone().unwrap_or_else(|| request.id.clone());
        let registration = bounded(
            "registration checker",
            self.settings.collaborator_timeout,
            self.collaborators.registration.check(&subject),
        )
        .await?;

        let updated = self.store.requests.transaction(
            |requests| -> ConflictableTransactionResult<LoanRequest, LoanError> {
                let Some(bytes) = requests.get(id.as_bytes())? else {
                    return Err(abort(not_found(id)));
                };
                let mut current: LoanRequest = decode(&bytes).map_err(abort)?;
                current.ttshahr_status = registration.is_registered;
                current.updated_at = TimeStamp::now_after(current.updated_at);
                requests.insert(id.as_bytes(), encode(&current).map_err(abort)?)?;
                Ok(current)
            },
        )?;

        tracing::info!(request_id = %id, registered = updated.ttshahr_status, "request registration refreshed");
        Ok(updated)
    }

    /// Refresh a user's TTShahr registration snapshot.
    pub async fn refresh_user_registration(
        &self,
        user_id: &str,
        actor: &ActingUser,
    ) -> Result<User> {
        actor.authorize(Operation::RefreshRegistration)?;
        let users = self.users();
        users.get(user_id)?;

        let mut registration = bounded(
            "registration checker",
            self.settings.collaborator_timeout,
            self.collaborators.registration.check(user_id),
        )
        .await?;
        registration.last_checked_at.get_or_insert_with(TimeStamp::now);

        let user = users.set_registration(user_id, registration)?;
        tracing::info!(user_id = %user_id, registered = user.ttshahr.is_registered, "user registration refreshed");
        Ok(user)
    }

    fn load(&self, id: &str) -> Result<LoanRequest> {
        self.store.get(&self.store.requests, id.as_bytes(), "request")
    }

    /// Closed first, then role, then source status.
    fn guard(&self, request: &LoanRequest, actor: &ActingUser, operation: Operation) -> Result<()> {
        let status = request.status();
        let sources = operation.sources().unwrap_or_default();

        if status == Status::Closed {
            tracing::warn!(request_id = %request.id, %operation, "request is closed");
            return Err(LoanError::invalid_state(status, sources));
        }
        actor.authorize(operation)?;
        if !sources.contains(&status) {
            tracing::warn!(request_id = %request.id, %status, %operation, "operation not legal from status");
            return Err(LoanError::invalid_state(status, sources));
        }
        Ok(())
    }

    fn apply(
        &self,
        observed: &LoanRequest,
        actor: &ActingUser,
        command: Command,
        note: Option<&str>,
        shahkar: Option<ShahkarResult>,
    ) -> Result<RequestDetail> {
        let stages = status::transition(&observed.stage, &command)?;
        self.write(observed, actor, stages, note, shahkar)
    }

    /// Chain `stages` onto the ledger and commit them against `observed`.
    fn write(
        &self,
        observed: &LoanRequest,
        actor: &ActingUser,
        stages: Vec<Stage>,
        note: Option<&str>,
        shahkar: Option<ShahkarResult>,
    ) -> Result<RequestDetail> {
        let Some(last) = stages.last().cloned() else {
            tracing::debug!(request_id = %observed.id, status = %observed.status(), "repeated transition; nothing written");
            return self.request(&observed.id);
        };

        let statuses: Vec<Status> = stages.iter().map(Stage::status).collect();
        let changed_at = TimeStamp::now_after(observed.updated_at);
        let pending = ledger::chain(
            &observed.id,
            observed.history_len,
            &observed.head_hash,
            &statuses,
            actor,
            changed_at,
            note,
        )?;
        let advance = Advance {
            stage: last,
            history_len: observed.history_len + statuses.len() as u32,
            head_hash: pending.head_hash.clone(),
            changed_at,
            shahkar,
        };

        let committed = self.commit(observed, &advance, &pending)?;
        tracing::info!(
            request_id = %committed.id,
            from = %observed.status(),
            to = %committed.status(),
            actor = %actor.id,
            entries = statuses.len(),
            "request transitioned"
        );
        self.request(&committed.id)
    }

    /// Write `advance` if the record still matches `observed`; the loser of
    /// a race gets `InvalidState`.
    fn commit(
        &self,
        observed: &LoanRequest,
        advance: &Advance,
        pending: &PendingEntries,
    ) -> Result<LoanRequest> {
        let key = observed.id.as_bytes();

        let committed = (&self.store.requests, &self.store.history).transaction(
            |(requests, history)| -> ConflictableTransactionResult<LoanRequest, LoanError> {
                let Some(bytes) = requests.get(key)? else {
                    return Err(abort(not_found(&observed.id)));
                };
                let mut current: LoanRequest = decode(&bytes).map_err(abort)?;
                if current.history_len != observed.history_len
                    || current.status() != observed.status()
                {
                    return Err(abort(LoanError::invalid_state(
                        current.status(),
                        &[observed.status()],
                    )));
                }

                current.stage = advance.stage.clone();
                current.history_len = advance.history_len;
                current.head_hash = advance.head_hash.clone();
                current.updated_at = advance.changed_at.max(current.updated_at);
                if let Some(result) = &advance.shahkar {
                    current.shahkar = Some(result.clone());
                }

                for (key, value) in &pending.rows {
                    history.insert(key.as_slice(), value.as_slice())?;
                }
                requests.insert(key, encode(&current).map_err(abort)?)?;
                Ok(current)
            },
        );

        committed.map_err(|err| {
            let err = LoanError::from(err);
            if let LoanError::InvalidState { current, .. } = &err {
                tracing::warn!(request_id = %observed.id, %current, "request moved underneath a transition");
            }
            err
        })
    }

    async fn check_identity(&self, request: &LoanRequest) -> Result<ShahkarResult> {
        let result = bounded(
            "identity checker",
            self.settings.collaborator_timeout,
            self.collaborators
                .identity
                .check(&request.national_id, &request.mobile),
        )
        .await?;

        if result.status == ShahkarStatus::Unavailable {
            tracing::error!(request_id = %request.id, "identity checker unavailable");
            return Err(LoanError::Dependency(
                "identity checker reported unavailable".to_string(),
            ));
        }
        Ok(result)
    }

    async fn notify(&self, request: &LoanRequest, sms_type: SmsType, message: &str) {
        let to = Recipient {
            request_id: &request.id,
            request_number: &request.request_number,
            mobile: &request.mobile,
        };
        if let Err(err) = self.notifier.dispatch(to, sms_type, message, None).await {
            tracing::error!(request_id = %request.id, kind = sms_type.as_str(), error = %err, "could not record sms log");
        }
    }
}

fn not_found(id: &str) -> LoanError {
    LoanError::NotFound {
        entity: "request",
        id: id.to_string(),
    }
}
