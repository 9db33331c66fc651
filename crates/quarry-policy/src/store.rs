//! Permission store contract and an in-memory implementation.
//!
//! The in-memory store can be loaded from YAML:
//!
//! ```yaml
//! permissions:
//!   - name: default.orders.list
//! grants:
//!   - permission: default.orders.list
//!     to: { group: sales }
//! rules:
//!   - id: own-region
//!     permission: default.orders.list
//!     scope: { group: sales }
//!     filters: [{ property: region, operator: "=", value: emea }]
//! principals:
//!   - id: "0"
//!     username: anonymous
//!     anonymous: true
//! ```

use async_trait::async_trait;
use quarry_core::{FilterInput, FiltersGroup, PermissionName, Principal, Sort};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

// =============================================================================
// RECORDS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub name: PermissionName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Who an ACL rule or grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Principal(String),
    Group(String),
}

impl Scope {
    pub fn applies_to(&self, principal: &Principal) -> bool {
        match self {
            Scope::Principal(id) => *id == principal.id,
            Scope::Group(group) => principal.in_group(group),
        }
    }
}

/// A permission granted to a principal or group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub permission: PermissionName,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub to: Scope,
}

/// A stored filter (and optional sort) restricting which rows a scope may
/// access under a permission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AclRule {
    pub id: String,
    pub permission: PermissionName,
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub scope: Scope,
    pub filters: FilterInput,
    #[serde(default)]
    pub sort: Vec<Sort>,
}

impl AclRule {
    pub fn filters_group(&self) -> FiltersGroup {
        self.filters.clone().into()
    }
}

// =============================================================================
// STORE CONTRACT
// =============================================================================

#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn find_by_name(&self, name: &PermissionName) -> anyhow::Result<Option<Permission>>;

    /// Permissions granted to the principal directly or through its groups.
    async fn granted_permissions(&self, principal: &Principal)
    -> anyhow::Result<Vec<PermissionName>>;

    /// Every ACL rule attached to a permission, whatever its scope.
    async fn acl_rules(&self, name: &PermissionName) -> anyhow::Result<Vec<AclRule>>;

    async fn find_principal(&self, username: &str) -> anyhow::Result<Option<Principal>>;

    async fn save_rule(&self, rule: AclRule) -> anyhow::Result<()>;

    async fn delete_rule(&self, id: &str) -> anyhow::Result<Option<AclRule>>;

    async fn grant(&self, grant: Grant) -> anyhow::Result<()>;

    async fn revoke(&self, grant: &Grant) -> anyhow::Result<bool>;
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionData {
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub grants: Vec<Grant>,
    #[serde(default)]
    pub rules: Vec<AclRule>,
    #[serde(default)]
    pub principals: Vec<Principal>,
}

#[derive(Debug, Default)]
pub struct MemoryPermissionStore {
    data: RwLock<PermissionData>,
}

impl MemoryPermissionStore {
    pub fn new(data: PermissionData) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content).map(Self::new)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Ok(Self::from_yaml(&content)?)
    }

    pub fn add_permission(&self, name: PermissionName) {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if !data.permissions.iter().any(|p| p.name == name) {
            data.permissions.push(Permission {
                name,
                description: None,
            });
        }
    }

    pub fn add_principal(&self, principal: Principal) {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .principals
            .push(principal);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PermissionData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PermissionData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PermissionStore for MemoryPermissionStore {
    async fn find_by_name(&self, name: &PermissionName) -> anyhow::Result<Option<Permission>> {
        Ok(self.read().permissions.iter().find(|p| p.name == *name).cloned())
    }

    async fn granted_permissions(
        &self,
        principal: &Principal,
    ) -> anyhow::Result<Vec<PermissionName>> {
        let data = self.read();
        let mut names: Vec<PermissionName> = Vec::new();
        for grant in data.grants.iter().filter(|g| g.to.applies_to(principal)) {
            if !names.contains(&grant.permission) {
                names.push(grant.permission.clone());
            }
        }
        Ok(names)
    }

    async fn acl_rules(&self, name: &PermissionName) -> anyhow::Result<Vec<AclRule>> {
        Ok(self
            .read()
            .rules
            .iter()
            .filter(|r| r.permission == *name)
            .cloned()
            .collect())
    }

    async fn find_principal(&self, username: &str) -> anyhow::Result<Option<Principal>> {
        Ok(self
            .read()
            .principals
            .iter()
            .find(|p| p.username.as_deref() == Some(username))
            .cloned())
    }

    async fn save_rule(&self, rule: AclRule) -> anyhow::Result<()> {
        let mut data = self.write();
        match data.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => data.rules.push(rule),
        }
        Ok(())
    }

    async fn delete_rule(&self, id: &str) -> anyhow::Result<Option<AclRule>> {
        let mut data = self.write();
        let removed = data
            .rules
            .iter()
            .position(|r| r.id == id)
            .map(|idx| data.rules.remove(idx));
        Ok(removed)
    }

    async fn grant(&self, grant: Grant) -> anyhow::Result<()> {
        let mut data = self.write();
        if !data.permissions.iter().any(|p| p.name == grant.permission) {
            anyhow::bail!("unknown permission '{}'", grant.permission);
        }
        if !data.grants.contains(&grant) {
            data.grants.push(grant);
        }
        Ok(())
    }

    async fn revoke(&self, grant: &Grant) -> anyhow::Result<bool> {
        let mut data = self.write();
        let before = data.grants.len();
        data.grants.retain(|g| g != grant);
        Ok(data.grants.len() != before)
    }
}
