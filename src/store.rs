//! sled trees backing the console, and CBOR helpers for their values
use super::error::{LoanError, Result};
use sled::{IVec, Tree};
use std::sync::Arc;

#[derive(Clone)]
pub struct Store {
    instance: Arc<sled::Db>,
    pub(crate) requests: Tree,
    pub(crate) history: Tree,
    pub(crate) request_numbers: Tree,
    pub(crate) branches: Tree,
    pub(crate) branch_codes: Tree,
    pub(crate) branch_usage: Tree,
    pub(crate) users: Tree,
    pub(crate) usernames: Tree,
    pub(crate) notes: Tree,
    pub(crate) sms_logs: Tree,
}

impl Store {
    pub fn open(instance: Arc<sled::Db>) -> Result<Self> {
        Ok(Self {
            requests: instance.open_tree("requests")?,
            history: instance.open_tree("history")?,
            request_numbers: instance.open_tree("request_numbers")?,
            branches: instance.open_tree("branches")?,
            branch_codes: instance.open_tree("branch_codes")?,
            branch_usage: instance.open_tree("branch_usage")?,
            users: instance.open_tree("users")?,
            usernames: instance.open_tree("usernames")?,
            notes: instance.open_tree("notes")?,
            sms_logs: instance.open_tree("sms_logs")?,
            instance,
        })
    }

    /// Monotonic, never reused across restarts.
    pub fn next_sequence(&self) -> Result<u64> {
        Ok(self.instance.generate_id()?)
    }

    pub fn get<T>(&self, tree: &Tree, key: &[u8], entity: &'static str) -> Result<T>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match tree.get(key)? {
            Some(bytes) => decode(&bytes),
            None => Err(LoanError::NotFound {
                entity,
                id: String::from_utf8_lossy(key).into_owned(),
            }),
        }
    }

    /// Every value in `tree`, in key order.
    pub fn scan<T>(&self, tree: &Tree) -> Result<Vec<T>>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        tree.iter().values().map(|value| decode(&value?)).collect()
    }

    pub fn flush(&self) -> Result<usize> {
        Ok(self.instance.flush()?)
    }
}

pub fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    Ok(minicbor::to_vec(value)?)
}

pub fn decode<T>(bytes: &[u8]) -> Result<T>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

pub(crate) fn counter_value(bytes: Option<IVec>) -> u64 {
    bytes
        .and_then(|b| <[u8; 8]>::try_from(b.as_ref()).ok())
        .map(u64::from_be_bytes)
        .unwrap_or(0)
}
