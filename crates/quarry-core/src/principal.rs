//! Principals and permission names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The actor on whose behalf permission and ACL checks are evaluated.
///
/// Passed explicitly into every call; there is no ambient "current user".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Groups the principal belongs to. ACL rules and grants may target a group.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Superadmins bypass permission checks and ACL rules.
    #[serde(default)]
    pub superadmin: bool,
    #[serde(default)]
    pub anonymous: bool,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: None,
            groups: Vec::new(),
            superadmin: false,
            anonymous: false,
        }
    }

    /// Built-in anonymous principal used when the store has no anonymous user.
    pub fn anonymous(username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            id: username.clone(),
            username: Some(username),
            groups: Vec::new(),
            superadmin: false,
            anonymous: true,
        }
    }

    pub fn superadmin(id: impl Into<String>) -> Self {
        Self {
            superadmin: true,
            ..Self::new(id)
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// The CRUD operation a permission grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    List,
    Show,
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::List => "list",
            Operation::Show => "show",
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

impl FromStr for Operation {
    type Err = PermissionNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "list" => Ok(Operation::List),
            "show" => Ok(Operation::Show),
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(PermissionNameError(format!("unknown operation '{}'", other))),
        }
    }
}

/// `{connection}.{table}.{operation}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionName {
    pub connection: String,
    pub table: String,
    pub operation: Operation,
}

impl PermissionName {
    pub fn new(connection: impl Into<String>, table: impl Into<String>, operation: Operation) -> Self {
        Self {
            connection: connection.into(),
            table: table.into(),
            operation,
        }
    }
}

impl fmt::Display for PermissionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.connection, self.table, self.operation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid permission name: {0}")]
pub struct PermissionNameError(String);

impl FromStr for PermissionName {
    type Err = PermissionNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(connection), Some(table), Some(operation))
                if !connection.is_empty() && !table.is_empty() =>
            {
                Ok(Self::new(connection, table, operation.parse()?))
            }
            _ => Err(PermissionNameError(format!(
                "expected '{{connection}}.{{table}}.{{operation}}', got '{}'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for PermissionName {
    type Error = PermissionNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PermissionName> for String {
    fn from(name: PermissionName) -> Self {
        name.to_string()
    }
}

/// Read-only view of what a principal is allowed to do.
///
/// Resolved once per request so that query compilation stays free of I/O.
pub trait PermissionCheck {
    fn allows(&self, permission: &PermissionName) -> bool;
}

/// Grants nothing. Useful for compiling system queries and in tests.
pub struct DenyAll;

impl PermissionCheck for DenyAll {
    fn allows(&self, _permission: &PermissionName) -> bool {
        false
    }
}

/// Grants everything.
pub struct AllowAll;

impl PermissionCheck for AllowAll {
    fn allows(&self, _permission: &PermissionName) -> bool {
        true
    }
}
