//! Branch reference data
//!
//! Codes are unique. A branch that any request points at keeps its code and
//! cannot be deleted, only deactivated; the per-code counter in
//! `branch_usage` is bumped in the same transaction that files a request.
use super::error::{LoanError, Result, abort};
use super::request::TimeStamp;
use super::store::{Store, counter_value, decode, encode};
use super::utils::{BRANCH_HRP, new_uuid_to_bech32};
use sled::transaction::{ConflictableTransactionResult, Transactional};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Branch {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub sequence: u64,
    #[n(2)]
    pub code: String,
    #[n(3)]
    pub name: String,
    #[n(4)]
    pub city: Option<String>,
    #[n(5)]
    pub is_active: bool,
    #[n(6)]
    pub created_at: TimeStamp,
    #[n(7)]
    pub updated_at: TimeStamp,
}

/// Fields to change; `None` leaves a field as it is.
#[derive(Debug, Clone, Default)]
pub struct BranchPatch {
    pub code: Option<String>,
    pub name: Option<String>,
    pub city: Option<Option<String>>,
    pub is_active: Option<bool>,
}

impl BranchPatch {
    pub fn code(mut self, code: &str) -> Self {
        self.code = Some(code.trim().to_string());
        self
    }
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.trim().to_string());
        self
    }
    pub fn city(mut self, city: Option<&str>) -> Self {
        self.city = Some(city.map(str::to_string));
        self
    }
    pub fn active(mut self, is_active: bool) -> Self {
        self.is_active = Some(is_active);
        self
    }
}

#[derive(Clone)]
pub struct BranchRegistry {
    store: Store,
}

impl BranchRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn create(&self, code: &str, name: &str, city: Option<&str>, is_active: bool) -> Result<Branch> {
        let code = code.trim();
        let name = name.trim();
        if code.is_empty() || name.is_empty() {
            return Err(LoanError::validation("branch code and name are required"));
        }

        let now = TimeStamp::now();
        let branch = Branch {
            id: new_uuid_to_bech32(BRANCH_HRP)?,
            sequence: self.store.next_sequence()?,
            code: code.to_string(),
            name: name.to_string(),
            city: city.map(str::trim).filter(|c| !c.is_empty()).map(str::to_string),
            is_active,
            created_at: now,
            updated_at: now,
        };
        let record = encode(&branch)?;

        (&self.store.branches, &self.store.branch_codes).transaction(
            |(branches, codes)| -> ConflictableTransactionResult<(), LoanError> {
                if codes.get(branch.code.as_bytes())?.is_some() {
                    return Err(abort(LoanError::conflict(format!(
                        "branch code {} already exists",
                        branch.code
                    ))));
                }
                codes.insert(branch.code.as_bytes(), branch.id.as_bytes())?;
                branches.insert(branch.id.as_bytes(), record.as_slice())?;
                Ok(())
            },
        )?;

        tracing::info!(branch_id = %branch.id, code = %branch.code, "branch created");
        Ok(branch)
    }

    pub fn update(&self, id: &str, patch: BranchPatch) -> Result<Branch> {
        if patch.code.as_deref().is_some_and(str::is_empty)
            || patch.name.as_deref().is_some_and(str::is_empty)
        {
            return Err(LoanError::validation("branch code and name cannot be blank"));
        }

        let branch = (
            &self.store.branches,
            &self.store.branch_codes,
            &self.store.branch_usage,
        )
            .transaction(
                |(branches, codes, usage)| -> ConflictableTransactionResult<Branch, LoanError> {
                    let Some(bytes) = branches.get(id.as_bytes())? else {
                        return Err(abort(not_found(id)));
                    };
                    let mut branch: Branch = decode(&bytes).map_err(abort)?;

                    if let Some(code) = patch.code.as_ref().filter(|c| **c != branch.code) {
                        if let Some(owner) = codes.get(code.as_bytes())? {
                            if &owner[..] != id.as_bytes() {
                                return Err(abort(LoanError::conflict(format!(
                                    "branch code {code} already exists"
                                ))));
                            }
                        }
                        if counter_value(usage.get(branch.code.as_bytes())?) > 0 {
                            return Err(abort(LoanError::conflict(format!(
                                "branch code {} is referenced by requests and cannot change",
                                branch.code
                            ))));
                        }
                        codes.remove(branch.code.as_bytes())?;
                        codes.insert(code.as_bytes(), id.as_bytes())?;
                        branch.code = code.clone();
                    }
                    if let Some(name) = &patch.name {
                        branch.name = name.clone();
                    }
                    if let Some(city) = &patch.city {
                        branch.city = city.clone();
                    }
                    if let Some(is_active) = patch.is_active {
                        branch.is_active = is_active;
                    }
                    branch.updated_at = TimeStamp::now_after(branch.updated_at);

                    branches.insert(id.as_bytes(), encode(&branch).map_err(abort)?)?;
                    Ok(branch)
                },
            )?;

        tracing::info!(branch_id = %branch.id, code = %branch.code, active = branch.is_active, "branch updated");
        Ok(branch)
    }

    /// Fails with `Conflict` when any request references the branch.
    pub fn delete(&self, id: &str) -> Result<()> {
        (
            &self.store.branches,
            &self.store.branch_codes,
            &self.store.branch_usage,
        )
            .transaction(
                |(branches, codes, usage)| -> ConflictableTransactionResult<(), LoanError> {
                    let Some(bytes) = branches.get(id.as_bytes())? else {
                        return Err(abort(not_found(id)));
                    };
                    let branch: Branch = decode(&bytes).map_err(abort)?;
                    if counter_value(usage.get(branch.code.as_bytes())?) > 0 {
                        return Err(abort(LoanError::conflict(format!(
                            "branch {} is in use; deactivate it instead",
                            branch.code
                        ))));
                    }
                    codes.remove(branch.code.as_bytes())?;
                    branches.remove(id.as_bytes())?;
                    Ok(())
                },
            )?;

        tracing::info!(branch_id = %id, "branch deleted");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Branch> {
        self.store.get(&self.store.branches, id.as_bytes(), "branch")
    }

    pub fn by_code(&self, code: &str) -> Result<Branch> {
        match self.store.branch_codes.get(code.as_bytes())? {
            Some(id) => self.store.get(&self.store.branches, &id, "branch"),
            None => Err(LoanError::NotFound {
                entity: "branch",
                id: code.to_string(),
            }),
        }
    }

    /// All branches in creation order.
    pub fn get_all(&self) -> Result<Vec<Branch>> {
        let mut branches: Vec<Branch> = self.store.scan(&self.store.branches)?;
        branches.sort_by_key(|b| b.sequence);
        Ok(branches)
    }

    /// Branches offered when filing a new request.
    pub fn active(&self) -> Result<Vec<Branch>> {
        Ok(self
            .get_all()?
            .into_iter()
            .filter(|b| b.is_active)
            .collect())
    }

    /// Number of requests filed against `code`.
    pub fn usage(&self, code: &str) -> Result<u64> {
        Ok(counter_value(self.store.branch_usage.get(code.as_bytes())?))
    }
}

fn not_found(id: &str) -> LoanError {
    LoanError::NotFound {
        entity: "branch",
        id: id.to_string(),
    }
}
