//! Caller identity and the authorization check guarding mutations.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{ManagerError, Result};

/// Access level of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full access.
    Admin,
    /// May deploy, restart and edit descriptors.
    Operator,
    /// Read-only.
    Viewer,
}

/// The identity a request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Name recorded in audit entries.
    pub name: String,
    /// Access level.
    pub role: Role,
}

impl Caller {
    /// A named caller.
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }

    /// The viewer used for requests without a known token.
    pub fn anonymous() -> Self {
        Self::new("anonymous", Role::Viewer)
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Decides whether a caller may change deployment state.
pub trait Authorizer: fmt::Debug + Send + Sync {
    /// True when `caller` may deploy, restart or edit descriptors.
    fn can_operate(&self, caller: &Caller) -> bool;
}

/// Admins and operators may mutate; viewers may only read.
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePolicy;

impl Authorizer for RolePolicy {
    fn can_operate(&self, caller: &Caller) -> bool {
        matches!(caller.role, Role::Admin | Role::Operator)
    }
}

/// Fails with `PermissionDenied` unless `authorizer` lets `caller` perform
/// `action`.
pub fn require_operator(
    authorizer: &dyn Authorizer,
    caller: &Caller,
    action: &'static str,
) -> Result<()> {
    if authorizer.can_operate(caller) {
        Ok(())
    } else {
        Err(ManagerError::PermissionDenied {
            actor: caller.name.clone(),
            action,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserEntry {
    token: String,
    role: Role,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: BTreeMap<String, UserEntry>,
}

/// Bearer tokens mapped to named callers, loaded from a TOML file:
///
/// ```toml
/// [users.alice]
/// token = "s3cret"
/// role = "admin"
/// ```
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    users: BTreeMap<String, UserEntry>,
}

impl UserDirectory {
    /// Reads a users file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|err| ManagerError::io(path, err))?;
        let file: UsersFile = toml::from_str(&contents).map_err(|err| {
            ManagerError::Config(format!("Failed to parse users file {}: {err}", path.display()))
        })?;
        Ok(Self { users: file.users })
    }

    /// Reads `path` if given; otherwise every caller is anonymous.
    pub fn load_optional(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Adds or replaces a user.
    pub fn insert(&mut self, name: impl Into<String>, token: impl Into<String>, role: Role) {
        self.users.insert(
            name.into(),
            UserEntry {
                token: token.into(),
                role,
            },
        );
    }

    /// The caller owning `token`, or the anonymous viewer.
    pub fn resolve(&self, token: Option<&str>) -> Caller {
        token
            .filter(|token| !token.is_empty())
            .and_then(|token| {
                self.users
                    .iter()
                    .find(|(_, entry)| entry.token == token)
                    .map(|(name, entry)| Caller::new(name.clone(), entry.role))
            })
            .unwrap_or_else(Caller::anonymous)
    }
}
