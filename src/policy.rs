//! Who may do what
//!
//! Every capability check in the crate goes through [`allowed_roles`].
//! Roles are not a hierarchy: each operation names its own set.
use super::error::{LoanError, Result};
use super::status::Status;
use std::fmt;

#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum Role {
    #[n(0)]
    Borrower,
    #[n(1)]
    ReadOnly,
    #[n(2)]
    SupportAgent,
    #[n(3)]
    Admin,
    #[n(4)]
    SeniorAdmin,
    #[n(5)]
    FinanceAdmin,
    #[n(6)]
    SuperAdmin,
}

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Borrower,
        Role::ReadOnly,
        Role::SupportAgent,
        Role::Admin,
        Role::SeniorAdmin,
        Role::FinanceAdmin,
        Role::SuperAdmin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Borrower => "Borrower",
            Role::ReadOnly => "ReadOnly",
            Role::SupportAgent => "SupportAgent",
            Role::Admin => "Admin",
            Role::SeniorAdmin => "SeniorAdmin",
            Role::FinanceAdmin => "FinanceAdmin",
            Role::SuperAdmin => "SuperAdmin",
        }
    }

    pub fn can(&self, operation: Operation) -> bool {
        allowed_roles(operation).contains(self)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Submit,
    StartIdentityCheck,
    RecordIdentityCheck,
    RetryIdentityCheck,
    IssueLetter,
    RecordBankResult,
    CloseRequest,
    ResendSms,
    SendManualSms,
    AddNote,
    ChangeRole,
    RefreshRegistration,
}

impl Operation {
    /// Operations that move a request's status.
    pub const TRANSITIONS: [Operation; 6] = [
        Operation::StartIdentityCheck,
        Operation::RecordIdentityCheck,
        Operation::RetryIdentityCheck,
        Operation::IssueLetter,
        Operation::RecordBankResult,
        Operation::CloseRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Submit => "submit a request",
            Operation::StartIdentityCheck => "start an identity check",
            Operation::RecordIdentityCheck => "record an identity check",
            Operation::RetryIdentityCheck => "retry an identity check",
            Operation::IssueLetter => "issue a letter",
            Operation::RecordBankResult => "record a bank result",
            Operation::CloseRequest => "close a request",
            Operation::ResendSms => "resend an sms",
            Operation::SendManualSms => "send a manual sms",
            Operation::AddNote => "add a note",
            Operation::ChangeRole => "change a user's role",
            Operation::RefreshRegistration => "refresh a registration status",
        }
    }

    /// Statuses a request must be in for this operation, `None` for
    /// operations that do not move a request.
    pub fn sources(&self) -> Option<&'static [Status]> {
        use Status::*;
        match self {
            Operation::StartIdentityCheck => Some(&[Submitted, IdentityCheck]),
            Operation::RecordIdentityCheck => Some(&[
                Submitted,
                IdentityCheck,
                WaitingForLetter,
                RejectedByShahkar,
            ]),
            Operation::RetryIdentityCheck => Some(&[RejectedByShahkar]),
            Operation::IssueLetter => Some(&[WaitingForLetter]),
            Operation::RecordBankResult => Some(&[WaitingForBankApproval]),
            Operation::CloseRequest => Some(&[
                Submitted,
                IdentityCheck,
                RejectedByShahkar,
                WaitingForLetter,
                LetterIssued,
                WaitingForBankApproval,
                BankRejected,
            ]),
            Operation::Submit
            | Operation::ResendSms
            | Operation::SendManualSms
            | Operation::AddNote
            | Operation::ChangeRole
            | Operation::RefreshRegistration => None,
        }
    }

    pub fn is_legal_from(&self, status: Status) -> bool {
        self.sources().is_some_and(|sources| sources.contains(&status))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const STAFF: &[Role] = &[
    Role::SupportAgent,
    Role::Admin,
    Role::SeniorAdmin,
    Role::FinanceAdmin,
    Role::SuperAdmin,
];
const ADMINISTRATIVE: &[Role] = &[
    Role::Admin,
    Role::SeniorAdmin,
    Role::FinanceAdmin,
    Role::SuperAdmin,
];

pub fn allowed_roles(operation: Operation) -> &'static [Role] {
    match operation {
        Operation::Submit => &Role::ALL,
        Operation::StartIdentityCheck
        | Operation::RecordIdentityCheck
        | Operation::RetryIdentityCheck => ADMINISTRATIVE,
        Operation::IssueLetter => &[Role::Admin, Role::SeniorAdmin, Role::SuperAdmin],
        Operation::RecordBankResult => &[Role::FinanceAdmin, Role::SuperAdmin],
        Operation::CloseRequest => &[Role::SeniorAdmin, Role::SuperAdmin],
        Operation::ResendSms | Operation::SendManualSms | Operation::ChangeRole => {
            &[Role::SuperAdmin]
        }
        Operation::AddNote | Operation::RefreshRegistration => STAFF,
    }
}

/// Transition operations `role` could trigger on a request in `status`.
pub fn permitted_operations(status: Status, role: Role) -> Vec<Operation> {
    if status == Status::Closed {
        return vec![];
    }
    Operation::TRANSITIONS
        .into_iter()
        .filter(|op| role.can(*op) && op.is_legal_from(status))
        .collect()
}

/// The already-authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActingUser {
    pub id: String,
    pub name: String,
    pub role: Role,
}

impl ActingUser {
    pub fn new(id: &str, name: &str, role: Role) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            role,
        }
    }

    /// The actor recorded for automatic transitions.
    pub fn system() -> Self {
        Self::new("system", "System", Role::SuperAdmin)
    }

    pub fn can(&self, operation: Operation) -> bool {
        self.role.can(operation)
    }

    pub fn authorize(&self, operation: Operation) -> Result<()> {
        if self.can(operation) {
            return Ok(());
        }
        tracing::warn!(actor = %self.id, role = %self.role, %operation, "operation denied");
        Err(LoanError::Permission {
            role: self.role.to_string(),
            operation: operation.to_string(),
        })
    }
}
