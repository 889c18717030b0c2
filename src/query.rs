//! Read-side projections: request detail, filtered pages, dashboard counts
use super::branches::Branch;
use super::error::{LoanError, Result, abort};
use super::ledger;
use super::policy::Role;
use super::request::{LoanRequest, RequestDetail};
use super::status::Status;
use super::store::{Store, decode};
use super::users::User;
use sled::transaction::{ConflictableTransactionResult, Transactional};
use std::collections::BTreeMap;

/// Paging and filter knobs shared by every list.
///
/// `status` matches any of the listed statuses. `role` applies to users only
/// and `registered` to requests and users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListFilter {
    pub page: usize,
    pub page_size: usize,
    pub search: Option<String>,
    pub status: Vec<Status>,
    pub branch_code: Option<String>,
    pub role: Option<Role>,
    pub registered: Option<bool>,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self::page(1, 10)
    }
}

impl ListFilter {
    pub fn page(page: usize, page_size: usize) -> Self {
        Self {
            page,
            page_size,
            search: None,
            status: vec![],
            branch_code: None,
            role: None,
            registered: None,
        }
    }
    pub fn with_search(mut self, search: &str) -> Self {
        self.search = Some(search.to_string());
        self
    }
    pub fn with_status(mut self, statuses: impl IntoIterator<Item = Status>) -> Self {
        self.status.extend(statuses);
        self
    }
    pub fn with_branch(mut self, code: &str) -> Self {
        self.branch_code = Some(code.to_string());
        self
    }
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }
    pub fn with_registered(mut self, registered: bool) -> Self {
        self.registered = Some(registered);
        self
    }

    fn needle(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    fn check(&self) -> Result<()> {
        if self.page < 1 || self.page_size < 1 {
            return Err(LoanError::validation("page and page size start at 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> usize {
        self.total.div_ceil(self.page_size)
    }
}

fn paginate<T>(items: Vec<T>, filter: &ListFilter) -> Page<T> {
    let total = items.len();
    let data = items
        .into_iter()
        .skip((filter.page - 1).saturating_mul(filter.page_size))
        .take(filter.page_size)
        .collect();

    Page {
        data,
        total,
        page: filter.page,
        page_size: filter.page_size,
    }
}

fn matches(needle: &Option<String>, fields: &[&str]) -> bool {
    match needle {
        None => true,
        Some(needle) => fields
            .iter()
            .any(|field| field.to_lowercase().contains(needle.as_str())),
    }
}

#[derive(Clone)]
pub struct Projections {
    store: Store,
}

impl Projections {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// The record and exactly the ledger entries it accounts for, read from
    /// one snapshot.
    pub fn request(&self, id: &str) -> Result<RequestDetail> {
        let trees = (&self.store.requests, &self.store.history);
        let detail = trees.transaction(
            |(requests, history)| -> ConflictableTransactionResult<RequestDetail, LoanError> {
                let Some(bytes) = requests.get(id.as_bytes())? else {
                    return Err(abort(LoanError::NotFound {
                        entity: "request",
                        id: id.to_string(),
                    }));
                };
                let request: LoanRequest = decode(&bytes).map_err(abort)?;
                let history = ledger::read(history, id, request.history_len)?;
                Ok(RequestDetail { request, history })
            },
        )?;
        Ok(detail)
    }

    /// Requests in filing order. Search covers mobile, national id, request
    /// number and applicant name.
    pub fn list_requests(&self, filter: &ListFilter) -> Result<Page<LoanRequest>> {
        filter.check()?;
        let needle = filter.needle();

        let mut requests: Vec<LoanRequest> = self
            .store
            .scan::<LoanRequest>(&self.store.requests)?
            .into_iter()
            .filter(|r| filter.status.is_empty() || filter.status.contains(&r.status()))
            .filter(|r| {
                filter
                    .branch_code
                    .as_ref()
                    .is_none_or(|code| *code == r.branch.code)
            })
            .filter(|r| filter.registered.is_none_or(|flag| flag == r.ttshahr_status))
            .filter(|r| {
                matches(
                    &needle,
                    &[
                        r.mobile.as_str(),
                        r.national_id.as_str(),
                        r.request_number.as_str(),
                        r.full_name.as_str(),
                    ],
                )
            })
            .collect();
        requests.sort_by_key(|r| r.sequence);

        Ok(paginate(requests, filter))
    }

    /// Users in creation order. Search covers mobile, name and national id.
    pub fn list_users(&self, filter: &ListFilter) -> Result<Page<User>> {
        filter.check()?;
        let needle = filter.needle();

        let mut users: Vec<User> = self
            .store
            .scan::<User>(&self.store.users)?
            .into_iter()
            .filter(|u| filter.role.is_none_or(|role| role == u.role))
            .filter(|u| {
                filter
                    .registered
                    .is_none_or(|flag| flag == u.ttshahr.is_registered)
            })
            .filter(|u| {
                matches(
                    &needle,
                    &[
                        u.mobile.as_str(),
                        u.name.as_str(),
                        u.national_id.as_deref().unwrap_or(""),
                    ],
                )
            })
            .collect();
        users.sort_by_key(|u| u.sequence);

        Ok(paginate(users, filter))
    }

    /// Branches in creation order. Search covers code, name and city.
    pub fn list_branches(&self, filter: &ListFilter) -> Result<Page<Branch>> {
        filter.check()?;
        let needle = filter.needle();

        let mut branches: Vec<Branch> = self
            .store
            .scan::<Branch>(&self.store.branches)?
            .into_iter()
            .filter(|b| {
                matches(
                    &needle,
                    &[
                        b.code.as_str(),
                        b.name.as_str(),
                        b.city.as_deref().unwrap_or(""),
                    ],
                )
            })
            .collect();
        branches.sort_by_key(|b| b.sequence);

        Ok(paginate(branches, filter))
    }

    /// Number of requests per status; every status is present.
    pub fn status_counts(&self) -> Result<BTreeMap<Status, usize>> {
        let mut counts: BTreeMap<Status, usize> =
            Status::ALL.into_iter().map(|status| (status, 0)).collect();
        for request in self.store.scan::<LoanRequest>(&self.store.requests)? {
            *counts.entry(request.status()).or_default() += 1;
        }
        Ok(counts)
    }
}
