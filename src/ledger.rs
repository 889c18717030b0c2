//! Append-only status history
//!
//! Entries are stored under `(request id, sequence)` and never rewritten.
//! Each entry carries the hash of the one before it, so a reordered or
//! edited ledger no longer verifies against the head hash kept on the
//! request record.
use super::error::{LoanError, Result, abort};
use super::policy::ActingUser;
use super::request::TimeStamp;
use super::status::Status;
use super::store::{decode, encode};
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};

#[derive(Debug, PartialEq, Eq, minicbor::Encode, minicbor::Decode, Clone)]
pub struct HistoryEntry {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub sequence: u32,
    #[n(2)]
    pub status: Status,
    #[n(3)]
    pub changed_by: String,
    #[n(4)]
    pub changed_by_id: String,
    #[n(5)]
    pub changed_at: TimeStamp,
    #[n(6)]
    pub note: Option<String>,
    #[n(7)]
    pub prev_hash: Option<String>,
}

impl HistoryEntry {
    pub fn new(
        request_id: &str,
        sequence: u32,
        status: Status,
        actor: &ActingUser,
        changed_at: TimeStamp,
        note: Option<String>,
        prev_hash: Option<String>,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            sequence,
            status,
            changed_by: actor.name.clone(),
            changed_by_id: actor.id.clone(),
            changed_at,
            note,
            prev_hash,
        }
    }

    /// CBOR encoding of the entry and the sha256 of that encoding.
    pub fn build(&self) -> Result<(String, Vec<u8>)> {
        let cbor = encode(self)?;
        let hash = sha256::digest(&cbor);

        Ok((hash, cbor))
    }
}

pub fn history_prefix(request_id: &str) -> Vec<u8> {
    let mut key = request_id.as_bytes().to_vec();
    key.push(0);
    key
}

pub fn history_key(request_id: &str, sequence: u32) -> Vec<u8> {
    let mut key = history_prefix(request_id);
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

/// Entries ready to be written, plus the new head of the chain.
#[derive(Debug, Default)]
pub struct PendingEntries {
    pub rows: Vec<(Vec<u8>, Vec<u8>)>,
    pub head_hash: String,
    pub last_changed_at: Option<TimeStamp>,
}

/// Chain one entry per status onto a ledger currently `len` entries long
/// whose last hash is `head_hash`.
pub fn chain(
    request_id: &str,
    len: u32,
    head_hash: &str,
    statuses: &[Status],
    actor: &ActingUser,
    changed_at: TimeStamp,
    note: Option<&str>,
) -> Result<PendingEntries> {
    let mut pending = PendingEntries {
        head_hash: head_hash.to_string(),
        ..PendingEntries::default()
    };

    for (offset, status) in statuses.iter().enumerate() {
        let sequence = len + offset as u32;
        let prev_hash = (sequence > 0).then(|| pending.head_hash.clone());
        // the note belongs to the entry the caller asked for, the last one
        let note = (offset + 1 == statuses.len())
            .then(|| note.map(str::to_string))
            .flatten();
        let entry = HistoryEntry::new(
            request_id, sequence, *status, actor, changed_at, note, prev_hash,
        );
        let (hash, cbor) = entry.build()?;

        pending.rows.push((history_key(request_id, sequence), cbor));
        pending.head_hash = hash;
        pending.last_changed_at = Some(changed_at);
    }

    Ok(pending)
}

/// Read the first `len` entries of a request's ledger inside a transaction,
/// so they come from the same snapshot as the record that counted them.
pub fn read(
    tree: &TransactionalTree,
    request_id: &str,
    len: u32,
) -> ConflictableTransactionResult<Vec<HistoryEntry>, LoanError> {
    let mut entries = Vec::with_capacity(len as usize);
    for sequence in 0..len {
        let Some(bytes) = tree.get(history_key(request_id, sequence))? else {
            return Err(abort(LoanError::Corrupt(format!(
                "request {request_id} is missing history entry {sequence}"
            ))));
        };
        entries.push(decode(&bytes).map_err(abort)?);
    }
    Ok(entries)
}

/// Check sequence numbers, hash links, time order and the head hash.
pub fn verify(entries: &[HistoryEntry], head_hash: &str) -> Result<()> {
    let mut expected_prev: Option<String> = None;
    let mut last_time: Option<TimeStamp> = None;

    for (index, entry) in entries.iter().enumerate() {
        if entry.sequence as usize != index {
            return Err(LoanError::Corrupt(format!(
                "ledger entry {index} carries sequence {}",
                entry.sequence
            )));
        }
        if entry.prev_hash != expected_prev {
            return Err(LoanError::Corrupt(format!(
                "ledger entry {index} does not link to its predecessor"
            )));
        }
        if last_time.is_some_and(|t| entry.changed_at < t) {
            return Err(LoanError::Corrupt(format!(
                "ledger entry {index} is older than its predecessor"
            )));
        }
        let (hash, _) = entry.build()?;
        expected_prev = Some(hash);
        last_time = Some(entry.changed_at);
    }

    match expected_prev {
        Some(hash) if hash == head_hash => Ok(()),
        None if head_hash.is_empty() => Ok(()),
        _ => Err(LoanError::Corrupt("ledger head does not match the request record".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Role;

    fn entries(statuses: &[Status]) -> (Vec<HistoryEntry>, String) {
        let actor = ActingUser::new("admin-1", "Ali", Role::SuperAdmin);
        let pending = chain("req_1", 0, "", statuses, &actor, TimeStamp::now(), None).unwrap();
        let decoded = pending
            .rows
            .iter()
            .map(|(_, cbor)| decode(cbor).unwrap())
            .collect();
        (decoded, pending.head_hash)
    }

    #[test]
    fn history_keys_sort_by_sequence() {
        assert!(history_key("req_1", 2) < history_key("req_1", 10));
        assert!(history_key("req_1", 0).starts_with(&history_prefix("req_1")));
    }

    #[test]
    fn chained_entries_verify() {
        let (ledger, head) = entries(&[
            Status::Submitted,
            Status::IdentityCheck,
            Status::WaitingForLetter,
        ]);
        assert_eq!(ledger.len(), 3);
        assert!(ledger[0].prev_hash.is_none());
        assert!(verify(&ledger, &head).is_ok());
    }

    #[test]
    fn reordering_breaks_the_chain() {
        let (mut ledger, head) = entries(&[Status::Submitted, Status::IdentityCheck]);
        ledger.swap(0, 1);
        assert!(verify(&ledger, &head).is_err());
    }

    #[test]
    fn editing_an_entry_breaks_the_head() {
        let (mut ledger, head) = entries(&[Status::Submitted, Status::WaitingForLetter]);
        ledger[1].changed_by = "someone else".into();
        assert!(verify(&ledger, &head).is_err());
    }

    #[test]
    fn note_lands_on_last_entry() {
        let actor = ActingUser::system();
        let pending = chain(
            "req_1",
            3,
            "abc",
            &[Status::LetterIssued, Status::WaitingForBankApproval],
            &actor,
            TimeStamp::now(),
            Some("letter LTR-1"),
        )
        .unwrap();
        let first: HistoryEntry = decode(&pending.rows[0].1).unwrap();
        let second: HistoryEntry = decode(&pending.rows[1].1).unwrap();

        assert_eq!(first.sequence, 3);
        assert_eq!(first.prev_hash.as_deref(), Some("abc"));
        assert!(first.note.is_none());
        assert_eq!(second.note.as_deref(), Some("letter LTR-1"));
    }
}
