//! Free-text annotations on requests and users
use super::error::{LoanError, Result};
use super::policy::{ActingUser, Operation};
use super::request::TimeStamp;
use super::store::{Store, decode, encode};
use super::utils::{NOTE_HRP, new_uuid_to_bech32};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum NoteOwner {
    #[n(0)]
    Request(#[n(0)] String),
    #[n(1)]
    User(#[n(0)] String),
}

impl NoteOwner {
    fn key_prefix(&self) -> Vec<u8> {
        let (tag, id) = match self {
            NoteOwner::Request(id) => (b'r', id),
            NoteOwner::User(id) => (b'u', id),
        };
        let mut key = vec![tag, b':'];
        key.extend_from_slice(id.as_bytes());
        key.push(0);
        key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum NotePriority {
    #[n(0)]
    Low,
    #[n(1)]
    Normal,
    #[n(2)]
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Note {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub owner: NoteOwner,
    #[n(2)]
    pub text: String,
    #[n(3)]
    pub author_name: String,
    #[n(4)]
    pub author_id: String,
    #[n(5)]
    pub created_at: TimeStamp,
    #[n(6)]
    pub priority: Option<NotePriority>,
}

#[derive(Clone)]
pub struct NoteStore {
    store: Store,
}

impl NoteStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn add(
        &self,
        owner: NoteOwner,
        actor: &ActingUser,
        text: &str,
        priority: Option<NotePriority>,
    ) -> Result<Note> {
        actor.authorize(Operation::AddNote)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(LoanError::validation("note text is empty"));
        }
        self.ensure_owner(&owner)?;

        let note = Note {
            id: new_uuid_to_bech32(NOTE_HRP)?,
            owner,
            text: text.to_string(),
            author_name: actor.name.clone(),
            author_id: actor.id.clone(),
            created_at: TimeStamp::now(),
            priority,
        };
        let mut key = note.owner.key_prefix();
        key.extend_from_slice(&self.store.next_sequence()?.to_be_bytes());
        self.store.notes.insert(key, encode(&note)?)?;

        tracing::debug!(note_id = %note.id, author = %note.author_id, "note added");
        Ok(note)
    }

    /// Notes for `owner`, oldest first.
    pub fn list(&self, owner: &NoteOwner) -> Result<Vec<Note>> {
        self.store
            .notes
            .scan_prefix(owner.key_prefix())
            .values()
            .map(|value| decode(&value?))
            .collect()
    }

    fn ensure_owner(&self, owner: &NoteOwner) -> Result<()> {
        let (tree, id, entity) = match owner {
            NoteOwner::Request(id) => (&self.store.requests, id, "request"),
            NoteOwner::User(id) => (&self.store.users, id, "user"),
        };
        if tree.contains_key(id.as_bytes())? {
            Ok(())
        } else {
            Err(LoanError::NotFound {
                entity,
                id: id.clone(),
            })
        }
    }
}
