//! Loan request records and the payloads that drive them
use super::error::{LoanError, Result};
use super::ledger::HistoryEntry;
use super::status::{Stage, Status};
use super::utils::is_digits;
use chrono::{DateTime, TimeZone, Utc};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// The current time, never earlier than `floor`. Keeps ledger timestamps monotonic.
    pub fn now_after(floor: TimeStamp) -> Self {
        Self::now().max(floor)
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Branch as it looked when the request was filed.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct BranchRef {
    #[n(0)]
    pub code: String,
    #[n(1)]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum ShahkarStatus {
    #[n(0)]
    Ok,
    #[n(1)]
    Fail,
    #[n(2)]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ShahkarResult {
    #[n(0)]
    pub status: ShahkarStatus,
    #[n(1)]
    pub checked_at: TimeStamp,
}

impl ShahkarResult {
    pub fn new(status: ShahkarStatus) -> Self {
        Self {
            status,
            checked_at: TimeStamp::now(),
        }
    }
}

/// TTShahr registration snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct RegistrationStatus {
    #[n(0)]
    pub is_registered: bool,
    #[n(1)]
    pub last_checked_at: Option<TimeStamp>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LetterInfo {
    #[n(0)]
    pub letter_number: String,
    #[n(1)]
    pub letter_date: String, // date printed on the letter, as entered by staff
    #[n(2)]
    pub file_id: Option<String>,
    #[n(3)]
    pub issued_at: TimeStamp,
}

/// Staff input for `issue_letter`.
#[derive(Debug, Clone, Default)]
pub struct LetterDraft {
    pub letter_number: String,
    pub letter_date: String,
    pub file_id: Option<String>,
}

impl LetterDraft {
    pub fn new(letter_number: &str, letter_date: &str) -> Self {
        Self {
            letter_number: letter_number.to_string(),
            letter_date: letter_date.to_string(),
            file_id: None,
        }
    }
    pub fn with_file(mut self, file_id: &str) -> Self {
        self.file_id = Some(file_id.to_string());
        self
    }
    pub fn validate(&self, issued_at: TimeStamp) -> Result<LetterInfo> {
        let letter_number = self.letter_number.trim();
        let letter_date = self.letter_date.trim();
        if letter_number.is_empty() {
            return Err(LoanError::validation("letter number is required"));
        }
        if letter_date.is_empty() {
            return Err(LoanError::validation("letter date is required"));
        }

        Ok(LetterInfo {
            letter_number: letter_number.to_string(),
            letter_date: letter_date.to_string(),
            file_id: self.file_id.clone().filter(|f| !f.trim().is_empty()),
            issued_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct BankResult {
    #[n(0)]
    pub approved: bool,
    #[n(1)]
    pub paid_amount_toman: Option<u64>,
    #[n(2)]
    pub tenor_months: Option<u32>,
    #[n(3)]
    pub paid_at: Option<TimeStamp>,
    #[n(4)]
    pub reason: Option<String>,
    #[n(5)]
    pub decided_at: TimeStamp,
}

/// Finance staff input for `record_bank_result`.
#[derive(Debug, Clone, Default)]
pub struct BankDecision {
    pub approved: bool,
    pub amount_toman: Option<u64>,
    pub tenor_months: Option<u32>,
    pub paid_at: Option<TimeStamp>,
    pub reason: Option<String>,
}

impl BankDecision {
    pub fn approved(amount_toman: u64) -> Self {
        Self {
            approved: true,
            amount_toman: Some(amount_toman),
            ..Self::default()
        }
    }
    pub fn rejected(reason: &str) -> Self {
        Self {
            approved: false,
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
    pub fn with_paid_at(mut self, paid_at: TimeStamp) -> Self {
        self.paid_at = Some(paid_at);
        self
    }
    pub fn with_tenor(mut self, tenor_months: u32) -> Self {
        self.tenor_months = Some(tenor_months);
        self
    }

    /// Checks the sub-fields required by the chosen outcome. Approvals fall
    /// back to the requested tenor and to `now` for the payment date.
    pub fn validate(&self, requested_tenor: u32, now: TimeStamp) -> Result<BankResult> {
        if self.approved {
            let amount = match self.amount_toman {
                Some(amount) if amount > 0 => amount,
                _ => return Err(LoanError::validation("approved result needs a positive paid amount")),
            };
            if self.tenor_months == Some(0) {
                return Err(LoanError::validation("tenor must be positive"));
            }

            return Ok(BankResult {
                approved: true,
                paid_amount_toman: Some(amount),
                tenor_months: Some(self.tenor_months.unwrap_or(requested_tenor)),
                paid_at: Some(self.paid_at.unwrap_or(now)),
                reason: None,
                decided_at: now,
            });
        }

        match self.reason.as_deref().map(str::trim) {
            Some(reason) if !reason.is_empty() => Ok(BankResult {
                approved: false,
                paid_amount_toman: None,
                tenor_months: None,
                paid_at: None,
                reason: Some(reason.to_string()),
                decided_at: now,
            }),
            _ => Err(LoanError::validation("rejected result needs a reason")),
        }
    }
}

// Used for constructing a submission
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoanApplication {
    full_name: Option<String>,
    mobile: Option<String>,
    national_id: Option<String>,
    user_id: Option<String>,
    amount_toman: u64,
    tenor_months: u32,
    branch_code: Option<String>,
}

/// A submission whose fields passed [`LoanApplication::validate`].
#[derive(Debug, Clone)]
pub struct CheckedApplication {
    pub full_name: String,
    pub mobile: String,
    pub national_id: String,
    pub user_id: Option<String>,
    pub amount_toman: u64,
    pub tenor_months: u32,
    pub branch_code: String,
}

impl LoanApplication {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_full_name(mut self, name: &str) -> Self {
        self.full_name = Some(name.trim().to_string());
        self
    }
    pub fn set_mobile(mut self, mobile: &str) -> Self {
        self.mobile = Some(mobile.trim().to_string());
        self
    }
    pub fn set_national_id(mut self, national_id: &str) -> Self {
        self.national_id = Some(national_id.trim().to_string());
        self
    }
    pub fn set_user_id(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }
    pub fn set_amount_toman(mut self, amount: u64) -> Self {
        self.amount_toman = amount;
        self
    }
    pub fn set_tenor_months(mut self, months: u32) -> Self {
        self.tenor_months = months;
        self
    }
    pub fn set_branch_code(mut self, code: &str) -> Self {
        self.branch_code = Some(code.trim().to_string());
        self
    }

    pub fn validate(&self) -> Result<CheckedApplication> {
        let full_name = required(&self.full_name, "full name")?;
        let mobile = required(&self.mobile, "mobile")?;
        let national_id = required(&self.national_id, "national id")?;
        let branch_code = required(&self.branch_code, "branch code")?;

        // 11-digit mobile numbers starting with 09
        if !(is_digits(&mobile) && mobile.len() == 11 && mobile.starts_with("09")) {
            return Err(LoanError::validation(format!("malformed mobile number {mobile}")));
        }
        if !(is_digits(&national_id) && national_id.len() == 10) {
            return Err(LoanError::validation(format!("malformed national id {national_id}")));
        }
        if self.amount_toman == 0 {
            return Err(LoanError::validation("amount must be positive"));
        }
        if self.tenor_months == 0 {
            return Err(LoanError::validation("tenor must be positive"));
        }

        Ok(CheckedApplication {
            full_name,
            mobile,
            national_id,
            user_id: self.user_id.clone(),
            amount_toman: self.amount_toman,
            tenor_months: self.tenor_months,
            branch_code,
        })
    }
}

fn required(field: &Option<String>, name: &str) -> Result<String> {
    match field.as_deref() {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(LoanError::validation(format!("{name} is required"))),
    }
}

/// Stored form of a request. The history lives in its own tree, keyed by
/// `(id, sequence)`; `history_len` and `head_hash` pin the ledger prefix
/// this record agrees with.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct LoanRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub request_number: String,
    #[n(2)]
    pub sequence: u64,
    #[n(3)]
    pub full_name: String,
    #[n(4)]
    pub mobile: String,
    #[n(5)]
    pub national_id: String,
    #[n(6)]
    pub user_id: Option<String>,
    #[n(7)]
    pub amount_toman: u64,
    #[n(8)]
    pub tenor_months: u32,
    #[n(9)]
    pub branch: BranchRef,
    #[n(10)]
    pub stage: Stage,
    #[n(11)]
    pub shahkar: Option<ShahkarResult>,
    #[n(12)]
    pub ttshahr_status: bool,
    #[n(13)]
    pub created_at: TimeStamp,
    #[n(14)]
    pub updated_at: TimeStamp,
    #[n(15)]
    pub history_len: u32,
    #[n(16)]
    pub head_hash: String,
}

impl LoanRequest {
    pub fn status(&self) -> Status {
        self.stage.status()
    }
    pub fn letter(&self) -> Option<&LetterInfo> {
        self.stage.letter()
    }
    pub fn bank_result(&self) -> Option<&BankResult> {
        self.stage.bank_result()
    }
}

/// A request together with its ledger, as served to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDetail {
    pub request: LoanRequest,
    pub history: Vec<HistoryEntry>,
}

impl RequestDetail {
    pub fn status(&self) -> Status {
        self.request.status()
    }
    /// Status of the most recent ledger entry.
    pub fn ledger_status(&self) -> Option<Status> {
        self.history.last().map(|entry| entry.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn application() -> LoanApplication {
        LoanApplication::new()
            .set_full_name("Reza Mohammadi")
            .set_mobile("09123456789")
            .set_national_id("0012345678")
            .set_amount_toman(50_000_000)
            .set_tenor_months(12)
            .set_branch_code("101")
    }

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::now();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: TimeStamp = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn complete_application_validates() {
        let checked = application().validate().unwrap();
        assert_eq!(checked.branch_code, "101");
        assert_eq!(checked.amount_toman, 50_000_000);
    }

    #[test]
    fn non_positive_terms_are_rejected() {
        assert!(application().set_amount_toman(0).validate().is_err());
        assert!(application().set_tenor_months(0).validate().is_err());
    }

    #[test]
    fn malformed_identity_fields_are_rejected() {
        assert!(application().set_mobile("9123").validate().is_err());
        assert!(application().set_national_id("12ab").validate().is_err());
        assert!(LoanApplication::new().validate().is_err());
    }

    #[test]
    fn letter_draft_requires_number_and_date() {
        let now = TimeStamp::now();
        assert!(LetterDraft::new("", "1403/02/20").validate(now).is_err());
        assert!(LetterDraft::new("LTR-1", "  ").validate(now).is_err());

        let letter = LetterDraft::new("LTR-1", "1403/02/20")
            .with_file("file-9")
            .validate(now)
            .unwrap();
        assert_eq!(letter.file_id.as_deref(), Some("file-9"));
    }

    #[test]
    fn bank_decision_branches() {
        let now = TimeStamp::now();

        let paid = BankDecision::approved(30_000_000).validate(6, now).unwrap();
        assert_eq!(paid.paid_amount_toman, Some(30_000_000));
        assert_eq!(paid.tenor_months, Some(6));
        assert!(paid.reason.is_none());

        let rejected = BankDecision::rejected("insufficient income")
            .validate(6, now)
            .unwrap();
        assert_eq!(rejected.reason.as_deref(), Some("insufficient income"));
        assert!(rejected.paid_amount_toman.is_none());
        assert!(rejected.paid_at.is_none());

        assert!(BankDecision::approved(0).validate(6, now).is_err());
        assert!(BankDecision::rejected(" ").validate(6, now).is_err());
    }
}
