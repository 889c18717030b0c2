//! Request status machine
//!
//! [`Stage`] is the stored state of a request: a status plus whatever data
//! that status implies (a request awaiting the bank always carries its
//! letter). [`transition`] is the only place a stage changes.
use super::error::{LoanError, Result};
use super::policy::Operation;
use super::request::{BankResult, LetterInfo, ShahkarStatus};
use std::fmt;

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum Status {
    #[n(0)]
    Submitted,
    #[n(1)]
    IdentityCheck,
    #[n(2)]
    RejectedByShahkar,
    #[n(3)]
    WaitingForLetter,
    #[n(4)]
    LetterIssued,
    #[n(5)]
    WaitingForBankApproval,
    #[n(6)]
    LoanPaid,
    #[n(7)]
    BankRejected,
    #[n(8)]
    Closed,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::Submitted,
        Status::IdentityCheck,
        Status::RejectedByShahkar,
        Status::WaitingForLetter,
        Status::LetterIssued,
        Status::WaitingForBankApproval,
        Status::LoanPaid,
        Status::BankRejected,
        Status::Closed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Submitted => "Submitted",
            Status::IdentityCheck => "IdentityCheck",
            Status::RejectedByShahkar => "RejectedByShahkar",
            Status::WaitingForLetter => "WaitingForLetter",
            Status::LetterIssued => "LetterIssued",
            Status::WaitingForBankApproval => "WaitingForBankApproval",
            Status::LoanPaid => "LoanPaid",
            Status::BankRejected => "BankRejected",
            Status::Closed => "Closed",
        }
    }

    /// Staff are waiting on someone else: the letter desk or the bank.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Status::WaitingForLetter | Status::WaitingForBankApproval)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum Stage {
    #[n(0)]
    Submitted,
    #[n(1)]
    IdentityCheck,
    #[n(2)]
    RejectedByShahkar,
    #[n(3)]
    WaitingForLetter,
    #[n(4)]
    LetterIssued {
        #[n(0)]
        letter: LetterInfo,
    },
    #[n(5)]
    WaitingForBankApproval {
        #[n(0)]
        letter: LetterInfo,
    },
    #[n(6)]
    LoanPaid {
        #[n(0)]
        letter: LetterInfo,
        #[n(1)]
        result: BankResult,
    },
    #[n(7)]
    BankRejected {
        #[n(0)]
        letter: LetterInfo,
        #[n(1)]
        result: BankResult,
    },
    #[n(8)]
    Closed {
        #[n(0)]
        from: Status,
        #[n(1)]
        letter: Option<LetterInfo>,
        #[n(2)]
        result: Option<BankResult>,
    },
}

impl Stage {
    pub fn status(&self) -> Status {
        match self {
            Stage::Submitted => Status::Submitted,
            Stage::IdentityCheck => Status::IdentityCheck,
            Stage::RejectedByShahkar => Status::RejectedByShahkar,
            Stage::WaitingForLetter => Status::WaitingForLetter,
            Stage::LetterIssued { .. } => Status::LetterIssued,
            Stage::WaitingForBankApproval { .. } => Status::WaitingForBankApproval,
            Stage::LoanPaid { .. } => Status::LoanPaid,
            Stage::BankRejected { .. } => Status::BankRejected,
            Stage::Closed { .. } => Status::Closed,
        }
    }

    pub fn letter(&self) -> Option<&LetterInfo> {
        match self {
            Stage::Submitted
            | Stage::IdentityCheck
            | Stage::RejectedByShahkar
            | Stage::WaitingForLetter => None,
            Stage::LetterIssued { letter }
            | Stage::WaitingForBankApproval { letter }
            | Stage::LoanPaid { letter, .. }
            | Stage::BankRejected { letter, .. } => Some(letter),
            Stage::Closed { letter, .. } => letter.as_ref(),
        }
    }

    pub fn bank_result(&self) -> Option<&BankResult> {
        match self {
            Stage::LoanPaid { result, .. } | Stage::BankRejected { result, .. } => Some(result),
            Stage::Closed { result, .. } => result.as_ref(),
            _ => None,
        }
    }
}

/// A validated request to move a stage forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartIdentityCheck,
    RecordIdentityCheck(ShahkarStatus),
    RetryIdentityCheck(ShahkarStatus),
    IssueLetter(LetterInfo),
    RecordBankResult(BankResult),
    Close,
}

impl Command {
    pub fn operation(&self) -> Operation {
        match self {
            Command::StartIdentityCheck => Operation::StartIdentityCheck,
            Command::RecordIdentityCheck(_) => Operation::RecordIdentityCheck,
            Command::RetryIdentityCheck(_) => Operation::RetryIdentityCheck,
            Command::IssueLetter(_) => Operation::IssueLetter,
            Command::RecordBankResult(_) => Operation::RecordBankResult,
            Command::Close => Operation::CloseRequest,
        }
    }
}

/// Stages a request passes through when `command` is applied to `current`,
/// in order. Each one becomes a history entry. An empty result means the
/// command is a repeat of what already happened and nothing changes.
pub fn transition(current: &Stage, command: &Command) -> Result<Vec<Stage>> {
    let rejected = || {
        LoanError::invalid_state(
            current.status(),
            command.operation().sources().unwrap_or_default(),
        )
    };

    match (current, command) {
        (Stage::Closed { .. }, _) => Err(rejected()),

        (Stage::Submitted, Command::StartIdentityCheck) => Ok(vec![Stage::IdentityCheck]),
        (Stage::IdentityCheck, Command::StartIdentityCheck) => Ok(vec![]),

        (Stage::Submitted | Stage::IdentityCheck, Command::RecordIdentityCheck(outcome)) => {
            Ok(vec![identity_outcome(*outcome)?])
        }
        (Stage::WaitingForLetter, Command::RecordIdentityCheck(ShahkarStatus::Ok))
        | (Stage::RejectedByShahkar, Command::RecordIdentityCheck(ShahkarStatus::Fail)) => {
            Ok(vec![])
        }
        (Stage::RejectedByShahkar, Command::RetryIdentityCheck(outcome)) => {
            Ok(vec![identity_outcome(*outcome)?])
        }

        (Stage::WaitingForLetter, Command::IssueLetter(letter)) => Ok(vec![
            Stage::LetterIssued {
                letter: letter.clone(),
            },
            Stage::WaitingForBankApproval {
                letter: letter.clone(),
            },
        ]),

        (Stage::WaitingForBankApproval { letter }, Command::RecordBankResult(result)) => {
            let letter = letter.clone();
            let result = result.clone();
            if result.approved {
                Ok(vec![Stage::LoanPaid { letter, result }])
            } else {
                Ok(vec![Stage::BankRejected { letter, result }])
            }
        }

        (Stage::LoanPaid { .. }, Command::Close) => Err(rejected()),
        (stage, Command::Close) => Ok(vec![Stage::Closed {
            from: stage.status(),
            letter: stage.letter().cloned(),
            result: stage.bank_result().cloned(),
        }]),

        _ => Err(rejected()),
    }
}

fn identity_outcome(outcome: ShahkarStatus) -> Result<Stage> {
    match outcome {
        ShahkarStatus::Ok => Ok(Stage::WaitingForLetter),
        ShahkarStatus::Fail => Ok(Stage::RejectedByShahkar),
        ShahkarStatus::Unavailable => Err(LoanError::Dependency(
            "identity checker reported unavailable".to_string(),
        )),
    }
}
