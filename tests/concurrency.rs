//! Racing writers on one request: one wins, the rest see InvalidState.
mod common;

use common::{console, staff};
use loan_approval::{
    error::ErrorKind, policy::Role, request::BankDecision, status::Status,
};
use std::collections::HashSet;
use std::sync::Barrier;

/// Two simultaneous closes produce one Closed entry.
#[test]
fn concurrent_closes_have_one_winner() -> anyhow::Result<()> {
    for _ in 0..10 {
        let console = console()?;
        let id = console.submit()?.request.id;
        let barrier = Barrier::new(2);

        let outcomes: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let service = console.service.clone();
                    let (id, barrier) = (&id, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        service.close_request(id, &staff(Role::SeniorAdmin), Some("duplicate"))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("close thread panicked"))
                .collect()
        });

        let won = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(won, 1);
        for outcome in outcomes.iter().filter_map(|o| o.as_ref().err()) {
            assert_eq!(outcome.kind(), ErrorKind::InvalidState);
        }

        let detail = console.service.request(&id)?;
        let closed = detail
            .history
            .iter()
            .filter(|e| e.status == Status::Closed)
            .count();
        assert_eq!(closed, 1);
        console.service.verify_history(&id)?;
    }
    Ok(())
}

/// A bank result racing a close: exactly one of them lands.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bank_result_and_close_are_exclusive() -> anyhow::Result<()> {
    let console = console()?;
    let id = console.waiting_for_bank().await?.request.id;

    let bank = {
        let service = console.service.clone();
        let id = id.clone();
        tokio::spawn(async move {
            service
                .record_bank_result(&id, &staff(Role::FinanceAdmin), BankDecision::approved(500))
                .await
        })
    };
    let close = {
        let service = console.service.clone();
        let id = id.clone();
        tokio::task::spawn_blocking(move || {
            service.close_request(&id, &staff(Role::SuperAdmin), None)
        })
    };

    let (bank, close) = (bank.await?, close.await?);
    assert!(bank.is_ok() ^ close.is_ok());

    let detail = console.service.request(&id)?;
    let last = detail.history.last().map(|e| e.status);
    if bank.is_ok() {
        assert_eq!(last, Some(Status::LoanPaid));
        assert_eq!(close.unwrap_err().kind(), ErrorKind::InvalidState);
    } else {
        assert_eq!(last, Some(Status::Closed));
        assert_eq!(bank.unwrap_err().kind(), ErrorKind::InvalidState);
    }
    console.service.verify_history(&id)?;
    Ok(())
}

/// Parallel submissions never share a request number.
#[test]
fn parallel_submissions_get_distinct_numbers() -> anyhow::Result<()> {
    let console = console()?;

    let numbers: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let console = &console;
                scope.spawn(move || console.submit().map(|d| d.request.request_number))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("submit thread panicked"))
            .collect::<anyhow::Result<_>>()
    })?;

    let unique: HashSet<_> = numbers.iter().collect();
    assert_eq!(unique.len(), 8);
    assert_eq!(console.service.branches().usage(common::BRANCH)?, 8);
    Ok(())
}
