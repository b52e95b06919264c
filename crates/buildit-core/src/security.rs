//! Permission checks.
//!
//! Authentication happens outside this crate; callers hand over the user
//! name (or `None` for anonymous requests) and ask a yes/no question.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use crate::{Error, FullName, Result};

/// Name used for grants that apply to anonymous requests.
pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Build,
    Configure,
    Delete,
    Wipeout,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::Read => "Item/Read",
            Permission::Build => "Item/Build",
            Permission::Configure => "Item/Configure",
            Permission::Delete => "Item/Delete",
            Permission::Wipeout => "Item/WipeOut",
        };
        f.write_str(name)
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Permission::Read),
            "build" => Ok(Permission::Build),
            "configure" => Ok(Permission::Configure),
            "delete" => Ok(Permission::Delete),
            "wipeout" => Ok(Permission::Wipeout),
            _ => Err(Error::InvalidInput(format!("unknown permission '{s}'"))),
        }
    }
}

pub trait Authorizer: Send + Sync {
    fn has_permission(&self, user: Option<&str>, permission: Permission, item: &FullName) -> bool;
}

/// Check a permission, returning [`Error::Forbidden`] when it is missing.
pub fn require(
    authorizer: &dyn Authorizer,
    user: Option<&str>,
    permission: Permission,
    item: &FullName,
) -> Result<()> {
    if authorizer.has_permission(user, permission, item) {
        return Ok(());
    }
    Err(Error::Forbidden(format!(
        "{} is missing the {permission} permission on {item}",
        user.unwrap_or(ANONYMOUS)
    )))
}

/// Grants everything to everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn has_permission(&self, _user: Option<&str>, _permission: Permission, _item: &FullName) -> bool {
        true
    }
}

/// Per-user grants, globally or on an item and everything below it.
#[derive(Debug, Default, Clone)]
pub struct MatrixAuthorizer {
    global: HashMap<String, BTreeSet<Permission>>,
    scoped: HashMap<String, Vec<(FullName, Permission)>>,
}

impl MatrixAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, user: &str, permissions: &[Permission]) -> Self {
        self.global
            .entry(user.to_string())
            .or_default()
            .extend(permissions.iter().copied());
        self
    }

    pub fn grant_on(mut self, user: &str, item: FullName, permissions: &[Permission]) -> Self {
        let grants = self.scoped.entry(user.to_string()).or_default();
        grants.extend(permissions.iter().map(|p| (item.clone(), *p)));
        self
    }
}

impl Authorizer for MatrixAuthorizer {
    fn has_permission(&self, user: Option<&str>, permission: Permission, item: &FullName) -> bool {
        let user = user.unwrap_or(ANONYMOUS);
        if self
            .global
            .get(user)
            .is_some_and(|perms| perms.contains(&permission))
        {
            return true;
        }
        self.scoped.get(user).is_some_and(|grants| {
            grants
                .iter()
                .any(|(scope, p)| *p == permission && item.is_within(scope))
        })
    }
}
