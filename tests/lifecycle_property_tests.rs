//! Property-based tests for the request lifecycle
//!
//! Random operation sequences, from random roles, are driven through the
//! engine on a real database. Whatever succeeds or fails, the record and its
//! ledger must keep agreeing with each other and with the transition table.
//!
//! The pure transition function gets a cheaper, wider run of its own.
mod common;

use common::{console, letter, staff};
use loan_approval::{
    error::ErrorKind,
    policy::{Operation, Role},
    request::{BankDecision, BankResult, LetterInfo, ShahkarResult, ShahkarStatus, TimeStamp},
    status::{Command, Stage, Status, transition},
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Step {
    Start(Role),
    Record(Role, ShahkarStatus),
    Retry(Role, ShahkarStatus),
    Issue(Role),
    Bank(Role, bool),
    Close(Role),
}

impl Step {
    fn operation(&self) -> Operation {
        match self {
            Step::Start(_) => Operation::StartIdentityCheck,
            Step::Record(..) => Operation::RecordIdentityCheck,
            Step::Retry(..) => Operation::RetryIdentityCheck,
            Step::Issue(_) => Operation::IssueLetter,
            Step::Bank(..) => Operation::RecordBankResult,
            Step::Close(_) => Operation::CloseRequest,
        }
    }
    fn role(&self) -> Role {
        match self {
            Step::Start(role)
            | Step::Record(role, _)
            | Step::Retry(role, _)
            | Step::Issue(role)
            | Step::Bank(role, _)
            | Step::Close(role) => *role,
        }
    }
}

fn role_strategy() -> impl Strategy<Value = Role> {
    prop::sample::select(Role::ALL.to_vec())
}

fn outcome_strategy() -> impl Strategy<Value = ShahkarStatus> {
    prop_oneof![
        4 => Just(ShahkarStatus::Ok),
        3 => Just(ShahkarStatus::Fail),
        1 => Just(ShahkarStatus::Unavailable),
    ]
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        role_strategy().prop_map(Step::Start),
        (role_strategy(), outcome_strategy()).prop_map(|(r, o)| Step::Record(r, o)),
        (role_strategy(), outcome_strategy()).prop_map(|(r, o)| Step::Retry(r, o)),
        role_strategy().prop_map(Step::Issue),
        (role_strategy(), any::<bool>()).prop_map(|(r, ok)| Step::Bank(r, ok)),
        role_strategy().prop_map(Step::Close),
    ]
}

/// Every status pair that may appear next to each other in a ledger.
fn is_edge(from: Status, to: Status) -> bool {
    use Status::*;
    matches!(
        (from, to),
        (Submitted, IdentityCheck)
            | (Submitted | IdentityCheck | RejectedByShahkar, WaitingForLetter)
            | (Submitted | IdentityCheck | RejectedByShahkar, RejectedByShahkar)
            | (WaitingForLetter, LetterIssued)
            | (LetterIssued, WaitingForBankApproval)
            | (WaitingForBankApproval, LoanPaid | BankRejected)
    ) || (to == Closed && !matches!(from, LoanPaid | Closed))
}

fn stage_strategy() -> impl Strategy<Value = Stage> {
    let letter = LetterInfo {
        letter_number: "LTR-1".into(),
        letter_date: "1403/01/01".into(),
        file_id: None,
        issued_at: TimeStamp::now(),
    };
    let result = BankResult {
        approved: true,
        paid_amount_toman: Some(10),
        tenor_months: Some(12),
        paid_at: Some(TimeStamp::now()),
        reason: None,
        decided_at: TimeStamp::now(),
    };
    prop_oneof![
        Just(Stage::Submitted),
        Just(Stage::IdentityCheck),
        Just(Stage::RejectedByShahkar),
        Just(Stage::WaitingForLetter),
        Just(Stage::LetterIssued { letter: letter.clone() }),
        Just(Stage::WaitingForBankApproval { letter: letter.clone() }),
        Just(Stage::LoanPaid { letter: letter.clone(), result: result.clone() }),
        Just(Stage::BankRejected { letter: letter.clone(), result: result.clone() }),
        Just(Stage::Closed { from: Status::Submitted, letter: None, result: None }),
    ]
}

fn command_strategy() -> impl Strategy<Value = Command> {
    let letter = LetterInfo {
        letter_number: "LTR-2".into(),
        letter_date: "1403/01/02".into(),
        file_id: None,
        issued_at: TimeStamp::now(),
    };
    let rejected = BankResult {
        approved: false,
        paid_amount_toman: None,
        tenor_months: None,
        paid_at: None,
        reason: Some("no collateral".into()),
        decided_at: TimeStamp::now(),
    };
    prop_oneof![
        Just(Command::StartIdentityCheck),
        outcome_strategy().prop_map(Command::RecordIdentityCheck),
        outcome_strategy().prop_map(Command::RetryIdentityCheck),
        Just(Command::IssueLetter(letter)),
        Just(Command::RecordBankResult(rejected)),
        Just(Command::Close),
    ]
}

proptest! {
    /// Property: the transition function only moves along table edges, and
    /// only from statuses the operation declares as sources
    #[test]
    fn prop_transitions_follow_the_table(stage in stage_strategy(), command in command_strategy()) {
        let from = stage.status();
        match transition(&stage, &command) {
            Ok(next) => {
                prop_assert!(command.operation().is_legal_from(from), "{from} accepted {command:?}");
                let mut previous = from;
                for stage in &next {
                    prop_assert!(is_edge(previous, stage.status()), "{previous} -> {}", stage.status());
                    previous = stage.status();
                }
            }
            Err(err) => {
                prop_assert!(matches!(err.kind(), ErrorKind::InvalidState | ErrorKind::Dependency));
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: after any sequence of operations the record's status equals
    /// the last ledger entry, the ledger verifies, and consecutive entries are
    /// table edges. Refused operations leave the request untouched.
    #[test]
    fn prop_ledger_always_matches_record(steps in prop::collection::vec(step_strategy(), 1..=12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let console = console().unwrap();
            let id = console.submit().unwrap().request.id;

            for step in steps {
                let before = console.service.request(&id).unwrap();
                let actor = staff(step.role());

                let outcome = match &step {
                    Step::Start(_) => console.service.start_identity_check(&id, &actor),
                    Step::Record(_, status) => console
                        .service
                        .record_identity_check(&id, &actor, ShahkarResult::new(*status)),
                    Step::Retry(_, status) => {
                        console.identity.answer(*status);
                        console.service.retry_identity_check(&id, &actor).await
                    }
                    Step::Issue(_) => console.service.issue_letter(&id, &actor, letter()).await,
                    Step::Bank(_, approved) => {
                        let decision = if *approved {
                            BankDecision::approved(1_000_000)
                        } else {
                            BankDecision::rejected("insufficient income")
                        };
                        console.service.record_bank_result(&id, &actor, decision).await
                    }
                    Step::Close(_) => console.service.close_request(&id, &actor, None),
                };

                let after = console.service.request(&id).unwrap();
                prop_assert_eq!(Some(after.status()), after.ledger_status());
                prop_assert!(console.service.verify_history(&id).is_ok());
                prop_assert!(after.history.starts_with(&before.history));
                for pair in after.history.windows(2) {
                    prop_assert!(is_edge(pair[0].status, pair[1].status));
                }

                match outcome {
                    Ok(detail) => prop_assert_eq!(&detail, &after),
                    Err(err) => {
                        prop_assert_eq!(&after, &before);
                        let closed = before.status() == Status::Closed;
                        if closed {
                            prop_assert_eq!(err.kind(), ErrorKind::InvalidState);
                        } else if !step.role().can(step.operation()) {
                            prop_assert_eq!(err.kind(), ErrorKind::Permission);
                        }
                    }
                }
                if matches!(before.status(), Status::Closed | Status::LoanPaid) {
                    prop_assert_eq!(after.status(), before.status());
                }
            }
            Ok(())
        })?;
    }
}
