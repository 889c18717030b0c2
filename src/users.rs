//! System principals: staff and borrowers
use super::error::{LoanError, Result, abort};
use super::policy::{ActingUser, Operation, Role};
use super::request::{RegistrationStatus, TimeStamp};
use super::store::{Store, decode, encode};
use super::utils::{USER_HRP, new_uuid_to_bech32};
use sled::transaction::{ConflictableTransactionResult, Transactional};

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct User {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub sequence: u64,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub username: String,
    #[n(4)]
    pub mobile: String,
    #[n(5)]
    pub national_id: Option<String>,
    #[n(6)]
    pub role: Role,
    #[n(7)]
    pub avatar: Option<String>,
    #[n(8)]
    pub ttshahr: RegistrationStatus,
    #[n(9)]
    pub created_at: TimeStamp,
}

impl User {
    pub fn acting(&self) -> ActingUser {
        ActingUser::new(&self.id, &self.name, self.role)
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub username: String,
    pub mobile: String,
    pub national_id: Option<String>,
    pub role: Role,
    pub avatar: Option<String>,
}

impl NewUser {
    pub fn new(name: &str, username: &str, mobile: &str, role: Role) -> Self {
        Self {
            name: name.trim().to_string(),
            username: username.trim().to_string(),
            mobile: mobile.trim().to_string(),
            national_id: None,
            role,
            avatar: None,
        }
    }
    pub fn with_national_id(mut self, national_id: &str) -> Self {
        self.national_id = Some(national_id.trim().to_string());
        self
    }
    pub fn with_avatar(mut self, avatar: &str) -> Self {
        self.avatar = Some(avatar.to_string());
        self
    }
}

#[derive(Clone)]
pub struct UserRegistry {
    store: Store,
}

impl UserRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Fails with `Conflict` when the username is taken.
    pub fn create(&self, new: NewUser) -> Result<User> {
        if new.name.is_empty() || new.username.is_empty() || new.mobile.is_empty() {
            return Err(LoanError::validation("name, username and mobile are required"));
        }

        let user = User {
            id: new_uuid_to_bech32(USER_HRP)?,
            sequence: self.store.next_sequence()?,
            name: new.name,
            username: new.username,
            mobile: new.mobile,
            national_id: new.national_id.filter(|n| !n.is_empty()),
            role: new.role,
            avatar: new.avatar,
            ttshahr: RegistrationStatus::default(),
            created_at: TimeStamp::now(),
        };
        let record = encode(&user)?;

        (&self.store.users, &self.store.usernames).transaction(
            |(users, usernames)| -> ConflictableTransactionResult<(), LoanError> {
                if usernames.get(user.username.as_bytes())?.is_some() {
                    return Err(abort(LoanError::conflict(format!(
                        "username {} is taken",
                        user.username
                    ))));
                }
                usernames.insert(user.username.as_bytes(), user.id.as_bytes())?;
                users.insert(user.id.as_bytes(), record.as_slice())?;
                Ok(())
            },
        )?;

        tracing::info!(user_id = %user.id, role = %user.role, "user created");
        Ok(user)
    }

    pub fn get(&self, id: &str) -> Result<User> {
        self.store.get(&self.store.users, id.as_bytes(), "user")
    }

    pub fn by_username(&self, username: &str) -> Result<User> {
        match self.store.usernames.get(username.as_bytes())? {
            Some(id) => self.store.get(&self.store.users, &id, "user"),
            None => Err(LoanError::NotFound {
                entity: "user",
                id: username.to_string(),
            }),
        }
    }

    pub fn all(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.store.scan(&self.store.users)?;
        users.sort_by_key(|u| u.sequence);
        Ok(users)
    }

    /// Only a SuperAdmin may change roles.
    pub fn change_role(&self, id: &str, role: Role, actor: &ActingUser) -> Result<User> {
        actor.authorize(Operation::ChangeRole)?;
        let user = self.update(id, |user| user.role = role)?;
        tracing::info!(user_id = %id, %role, actor = %actor.id, "role changed");
        Ok(user)
    }

    pub(crate) fn set_registration(&self, id: &str, status: RegistrationStatus) -> Result<User> {
        self.update(id, |user| user.ttshahr = status.clone())
    }

    fn update(&self, id: &str, patch: impl Fn(&mut User)) -> Result<User> {
        let user = self.store.users.transaction(
            |users| -> ConflictableTransactionResult<User, LoanError> {
                let Some(bytes) = users.get(id.as_bytes())? else {
                    return Err(abort(LoanError::NotFound {
                        entity: "user",
                        id: id.to_string(),
                    }));
                };
                let mut user: User = decode(&bytes).map_err(abort)?;
                patch(&mut user);
                users.insert(id.as_bytes(), encode(&user).map_err(abort)?)?;
                Ok(user)
            },
        )?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;

    fn registry() -> UserRegistry {
        let db = sled::Config::new().temporary(true).open().unwrap();
        UserRegistry::new(Store::open(Arc::new(db)).unwrap())
    }

    #[test]
    fn usernames_are_unique() {
        let users = registry();
        users
            .create(NewUser::new("Ali", "admin", "09120000000", Role::SuperAdmin))
            .unwrap();
        let err = users
            .create(NewUser::new("Other", "admin", "09120000001", Role::Admin))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(users.all().unwrap().len(), 1);
    }

    #[test]
    fn only_super_admin_changes_roles() {
        let users = registry();
        let boss = users
            .create(NewUser::new("Ali", "admin", "09120000000", Role::SuperAdmin))
            .unwrap();
        let clerk = users
            .create(NewUser::new("Sara", "sara", "09120000001", Role::Admin))
            .unwrap();

        let denied = users.change_role(&boss.id, Role::ReadOnly, &clerk.acting());
        assert_eq!(denied.unwrap_err().kind(), ErrorKind::Permission);

        let promoted = users
            .change_role(&clerk.id, Role::SeniorAdmin, &boss.acting())
            .unwrap();
        assert_eq!(promoted.role, Role::SeniorAdmin);
        assert_eq!(users.by_username("sara").unwrap().role, Role::SeniorAdmin);
    }

    #[test]
    fn missing_fields_are_rejected() {
        let users = registry();
        assert!(users.create(NewUser::new("", "x", "0912", Role::Borrower)).is_err());
    }
}
