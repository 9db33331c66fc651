//! Row-level ACL resolution and injection.
//!
//! ACL filters always become the outermost AND operand around caller
//! filters, so caller input can only narrow the row set a rule allows.

use quarry_core::{
    AclConfig, Filter, FilterInput, FiltersGroup, PermissionCheck, PermissionName, Principal,
    QueryRequest, SchemaError, Sort,
};
use quarry_planner::{FilterCompiler, Query};
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{TtlCache, ttl_from_seconds};
use crate::error::AclError;
use crate::store::{AclRule, Grant, Permission, PermissionStore, Scope};

/// Combined ACL constraint for one principal under one permission.
#[derive(Debug, Clone, PartialEq)]
pub struct AclConstraint {
    pub filters: FiltersGroup,
    pub sort: Vec<Sort>,
}

/// Snapshot of a principal's permissions, taken once per request.
#[derive(Debug, Clone, Default)]
pub struct Grants {
    superadmin: bool,
    permissions: Arc<HashSet<PermissionName>>,
}

impl Grants {
    pub fn superadmin() -> Self {
        Self {
            superadmin: true,
            permissions: Arc::default(),
        }
    }

    pub fn new(permissions: impl IntoIterator<Item = PermissionName>) -> Self {
        Self {
            superadmin: false,
            permissions: Arc::new(permissions.into_iter().collect()),
        }
    }
}

impl PermissionCheck for Grants {
    fn allows(&self, permission: &PermissionName) -> bool {
        self.superadmin || self.permissions.contains(permission)
    }
}

/// Principal id plus sorted group names. Grants and ACL rules depend on both.
type PrincipalKey = (String, Vec<String>);

fn principal_key(principal: &Principal) -> PrincipalKey {
    let mut groups = principal.groups.clone();
    groups.sort();
    groups.dedup();
    (principal.id.clone(), groups)
}

/// Resolves permissions and ACL rules through a TTL cache.
pub struct AclResolver {
    store: Arc<dyn PermissionStore>,
    permissions: TtlCache<PermissionName, Option<Permission>>,
    constraints: TtlCache<(PermissionName, PrincipalKey), Option<AclConstraint>>,
    grants: TtlCache<PrincipalKey, Grants>,
}

impl AclResolver {
    pub fn new(store: Arc<dyn PermissionStore>, config: &AclConfig) -> Self {
        let ttl = ttl_from_seconds(config.cache_ttl_seconds);
        Self {
            store,
            permissions: TtlCache::new(ttl),
            constraints: TtlCache::new(ttl),
            grants: TtlCache::new(ttl),
        }
    }

    pub fn store(&self) -> &Arc<dyn PermissionStore> {
        &self.store
    }

    async fn find_permission(&self, name: &PermissionName) -> Result<Option<Permission>, AclError> {
        if let Some(cached) = self.permissions.get(name) {
            return Ok(cached);
        }
        let found = self.store.find_by_name(name).await?;
        self.permissions.insert(name.clone(), found.clone());
        Ok(found)
    }

    /// The combined ACL constraint for `principal`, or `None` when access is
    /// unrestricted: superadmins, unknown permissions and permissions with no
    /// rule applying to the principal or its groups.
    pub async fn resolve_acl_filters(
        &self,
        permission: &PermissionName,
        principal: &Principal,
    ) -> Result<Option<AclConstraint>, AclError> {
        if principal.superadmin {
            return Ok(None);
        }

        let key = (permission.clone(), principal_key(principal));
        if let Some(cached) = self.constraints.get(&key) {
            return Ok(cached);
        }

        let constraint = match self.find_permission(permission).await? {
            None => None,
            Some(_) => {
                let rules = self.store.acl_rules(permission).await?;
                combine_rules(rules.iter().filter(|r| r.scope.applies_to(principal)))
            }
        };

        tracing::debug!(
            permission = %permission,
            principal = %principal.id,
            restricted = constraint.is_some(),
            "resolved ACL"
        );
        self.constraints.insert(key, constraint.clone());
        Ok(constraint)
    }

    /// Check that `principal` holds `permission` and return its grants.
    pub async fn authorize(
        &self,
        permission: &PermissionName,
        principal: &Principal,
    ) -> Result<Grants, AclError> {
        let grants = self.grants_for(principal).await?;
        if !grants.allows(permission) {
            tracing::warn!(
                permission = %permission,
                principal = %principal.id,
                "permission denied"
            );
            return Err(AclError::Unauthorized {
                principal: principal.id.clone(),
                permission: permission.clone(),
            });
        }
        Ok(grants)
    }

    pub async fn grants_for(&self, principal: &Principal) -> Result<Grants, AclError> {
        if principal.superadmin {
            return Ok(Grants::superadmin());
        }
        let key = principal_key(principal);
        if let Some(cached) = self.grants.get(&key) {
            return Ok(cached);
        }
        let grants = Grants::new(self.store.granted_permissions(principal).await?);
        self.grants.insert(key, grants.clone());
        Ok(grants)
    }

    // =========================================================================
    // WRITES AND INVALIDATION
    // =========================================================================

    pub fn invalidate_permission(&self, permission: &PermissionName) {
        self.permissions.invalidate(permission);
        self.constraints.invalidate_where(|(name, _)| name == permission);
    }

    pub fn invalidate_principal(&self, principal_id: &str) {
        self.grants.invalidate_where(|(id, _)| id == principal_id);
        self.constraints
            .invalidate_where(|(_, (id, _))| id == principal_id);
    }

    pub async fn save_rule(&self, rule: AclRule) -> Result<(), AclError> {
        let permission = rule.permission.clone();
        self.store.save_rule(rule).await?;
        self.invalidate_permission(&permission);
        Ok(())
    }

    pub async fn delete_rule(&self, id: &str) -> Result<Option<AclRule>, AclError> {
        let removed = self.store.delete_rule(id).await?;
        if let Some(rule) = &removed {
            self.invalidate_permission(&rule.permission);
        }
        Ok(removed)
    }

    pub async fn grant(&self, grant: Grant) -> Result<(), AclError> {
        let scope = grant.to.clone();
        self.store.grant(grant).await?;
        self.invalidate_scope(&scope);
        Ok(())
    }

    pub async fn revoke(&self, grant: &Grant) -> Result<bool, AclError> {
        let revoked = self.store.revoke(grant).await?;
        if revoked {
            self.invalidate_scope(&grant.to);
        }
        Ok(revoked)
    }

    fn invalidate_scope(&self, scope: &Scope) {
        match scope {
            Scope::Principal(id) => self.invalidate_principal(id),
            // group membership is not known here
            Scope::Group(_) => self.grants.clear(),
        }
    }
}

/// OR together the filters of every applicable rule. Sorts are concatenated
/// in rule order.
fn combine_rules<'r>(rules: impl Iterator<Item = &'r AclRule>) -> Option<AclConstraint> {
    let mut groups = Vec::new();
    let mut sort = Vec::new();
    for rule in rules {
        groups.push(rule.filters_group());
        sort.extend(rule.sort.iter().cloned());
    }

    let filters = match groups.len() {
        0 => return None,
        1 => groups.remove(0),
        _ => FiltersGroup::or(groups.into_iter().map(Filter::Group).collect()),
    };
    Some(AclConstraint { filters, sort })
}

/// `AND(acl, request)`. Without ACL filters the request passes through.
pub fn inject_acl_filters(
    request: Option<FiltersGroup>,
    acl: Option<&FiltersGroup>,
) -> Option<FiltersGroup> {
    let Some(acl) = acl else {
        return request;
    };

    let mut filters = vec![Filter::Group(acl.clone())];
    if let Some(request) = request.filter(|r| !r.is_empty()) {
        filters.push(Filter::Group(request));
    }
    Some(FiltersGroup::and(filters))
}

/// Apply an ACL constraint to a list request: filters are wrapped around the
/// caller's and rule sorts are appended after caller sorts.
pub fn constrain_request(mut request: QueryRequest, acl: Option<&AclConstraint>) -> QueryRequest {
    let Some(acl) = acl else {
        return request;
    };
    request.filters =
        inject_acl_filters(request.filters(), Some(&acl.filters)).map(FilterInput::Group);
    request.sort.extend(acl.sort.iter().cloned());
    request
}

/// Apply ACL filters directly to a query as one isolated AND operand. Used
/// for lookups whose caller filters are already compiled into `query`.
pub fn scope_query(
    query: &mut Query,
    acl: Option<&FiltersGroup>,
    compiler: &FilterCompiler<'_>,
) -> Result<(), SchemaError> {
    let Some(acl) = acl else {
        return Ok(());
    };
    let entity = compiler.registry().entity(&query.entity)?;
    let clauses = compiler.compile_group(entity, acl)?;
    query.push_wheres(clauses);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPermissionStore;
    use pretty_assertions::assert_eq;
    use quarry_core::{Connective, FilterLeaf, Operator};
    use serde_json::{Value, json};

    const DATA: &str = r#"
permissions:
  - name: default.orders.list
  - name: default.orders.show
grants:
  - permission: default.orders.list
    to: { group: sales }
rules:
  - id: region
    permission: default.orders.list
    scope: { group: sales }
    filters: [{ property: region, operator: "=", value: emea }]
    sort: [{ property: created_at, direction: desc }]
  - id: own
    permission: default.orders.list
    scope: { principal: "7" }
    filters: [{ property: owner_id, operator: "=", value: 7 }]
"#;

    fn resolver() -> AclResolver {
        let store = Arc::new(MemoryPermissionStore::from_yaml(DATA).unwrap());
        AclResolver::new(store, &AclConfig::default())
    }

    fn list() -> PermissionName {
        "default.orders.list".parse().unwrap()
    }

    /// Minimal evaluator for flat-property filter trees over JSON rows.
    fn matches(group: &FiltersGroup, row: &Value) -> bool {
        let eval = |filter: &Filter| match filter {
            Filter::Group(inner) => matches(inner, row),
            Filter::Leaf(leaf) => {
                let actual = &row[leaf.property.as_str()];
                match leaf.operator {
                    Operator::Equals => *actual == leaf.value,
                    Operator::NotEquals => *actual != leaf.value,
                    Operator::GreaterThan => actual.as_f64() > leaf.value.as_f64(),
                    Operator::In => leaf
                        .value
                        .as_array()
                        .is_some_and(|values| values.contains(actual)),
                    other => panic!("operator {other:?} not supported by the test evaluator"),
                }
            }
        };
        match group.operator {
            Connective::And => group.filters.iter().all(eval),
            Connective::Or => group.filters.iter().any(eval),
        }
    }

    #[tokio::test]
    async fn test_superadmin_is_unrestricted() {
        let acl = resolver()
            .resolve_acl_filters(&list(), &Principal::superadmin("1"))
            .await
            .unwrap();
        assert!(acl.is_none());
    }

    #[tokio::test]
    async fn test_unknown_permission_or_no_rule_is_unrestricted() {
        let resolver = resolver();
        let seller = Principal::new("3").with_groups(["sales"]);
        let unknown: PermissionName = "default.invoices.list".parse().unwrap();
        let show: PermissionName = "default.orders.show".parse().unwrap();

        assert!(resolver.resolve_acl_filters(&unknown, &seller).await.unwrap().is_none());
        assert!(resolver.resolve_acl_filters(&show, &seller).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_multiple_rules_combine_with_or() {
        let principal = Principal::new("7").with_groups(["sales"]);
        let acl = resolver()
            .resolve_acl_filters(&list(), &principal)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(acl.filters.operator, Connective::Or);
        assert_eq!(acl.filters.filters.len(), 2);
        assert_eq!(acl.sort, vec![Sort::desc("created_at")]);
    }

    #[test]
    fn test_inject_without_acl_passes_request_through() {
        let request = FiltersGroup::from_leaves([FilterLeaf::new("status", Operator::Equals, "paid")]);
        assert_eq!(inject_acl_filters(Some(request.clone()), None), Some(request));
        assert_eq!(inject_acl_filters(None, None), None);
    }

    #[test]
    fn test_caller_filters_can_only_narrow_acl() {
        let acl = FiltersGroup::from_leaves([FilterLeaf::new("region", Operator::Equals, "emea")]);
        let callers = [
            FiltersGroup::or(vec![
                FilterLeaf::new("region", Operator::Equals, "apac").into(),
                FilterLeaf::new("region", Operator::NotEquals, "apac").into(),
            ]),
            FiltersGroup::from_leaves([FilterLeaf::new("region", Operator::In, json!(["apac", "emea"]))]),
            FiltersGroup::default(),
        ];
        let rows = [
            json!({ "region": "emea", "total": 5 }),
            json!({ "region": "apac", "total": 50 }),
            json!({ "region": null, "total": 500 }),
        ];

        for caller in callers {
            let combined = inject_acl_filters(Some(caller), Some(&acl)).unwrap();
            assert_eq!(combined.operator, Connective::And);
            for row in &rows {
                if matches(&combined, row) {
                    assert!(matches(&acl, row), "row {row} escaped the ACL");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_constrain_request_wraps_filters_and_appends_sorts() {
        let principal = Principal::new("3").with_groups(["sales"]);
        let acl = resolver().resolve_acl_filters(&list(), &principal).await.unwrap();

        let request: QueryRequest = serde_json::from_value(json!({
            "filters": [{ "property": "status", "operator": "=", "value": "paid" }],
            "sort": [{ "property": "total", "direction": "asc" }]
        }))
        .unwrap();
        let constrained = constrain_request(request, acl.as_ref());

        let filters = constrained.filters().unwrap();
        assert_eq!(filters.operator, Connective::And);
        assert_eq!(filters.filters.len(), 2);
        assert!(matches!(&filters.filters[0], Filter::Group(g) if g.leaves()[0].property == "region"));
        assert_eq!(constrained.sort, vec![Sort::asc("total"), Sort::desc("created_at")]);
    }

    #[tokio::test]
    async fn test_authorize_through_group_grant() {
        let resolver = resolver();
        let seller = Principal::new("3").with_groups(["sales"]);
        let grants = resolver.authorize(&list(), &seller).await.unwrap();
        assert!(grants.allows(&list()));

        let err = resolver
            .authorize(&list(), &Principal::new("4"))
            .await
            .unwrap_err();
        assert!(err.is_unauthorized());
    }

    #[tokio::test]
    async fn test_rule_writes_invalidate_cached_constraints() {
        let resolver = resolver();
        let principal = Principal::new("3").with_groups(["sales"]);
        let before = resolver.resolve_acl_filters(&list(), &principal).await.unwrap();
        assert!(before.is_some());

        resolver.delete_rule("region").await.unwrap();
        let after = resolver.resolve_acl_filters(&list(), &principal).await.unwrap();
        assert!(after.is_none());
    }

    #[tokio::test]
    async fn test_grant_invalidates_principal_grants() {
        let resolver = resolver();
        let principal = Principal::new("4");
        let show: PermissionName = "default.orders.show".parse().unwrap();
        assert!(resolver.authorize(&show, &principal).await.is_err());

        resolver
            .grant(Grant {
                permission: show.clone(),
                to: Scope::Principal("4".into()),
            })
            .await
            .unwrap();
        assert!(resolver.authorize(&show, &principal).await.is_ok());
    }

    #[tokio::test]
    async fn test_constraints_are_cached_per_group_set() {
        let resolver = resolver();
        let outsider = Principal::new("3");
        let seller = Principal::new("3").with_groups(["sales"]);

        let first = resolver.resolve_acl_filters(&list(), &outsider).await.unwrap();
        let second = resolver.resolve_acl_filters(&list(), &seller).await.unwrap();
        assert!(first.is_none());
        assert_eq!(second.unwrap().filters.leaves()[0].property, "region");

        assert!(resolver.authorize(&list(), &outsider).await.is_err());
        assert!(resolver.authorize(&list(), &seller).await.is_ok());
    }

    #[tokio::test]
    async fn test_unbounded_cache_ttl_does_not_overflow() {
        let store = Arc::new(MemoryPermissionStore::from_yaml(DATA).unwrap());
        let config = AclConfig {
            cache_ttl_seconds: u64::MAX,
            ..AclConfig::default()
        };
        let resolver = AclResolver::new(store, &config);
        let seller = Principal::new("3").with_groups(["sales"]);
        assert!(resolver.resolve_acl_filters(&list(), &seller).await.unwrap().is_some());
        assert!(resolver.resolve_acl_filters(&list(), &seller).await.unwrap().is_some());
    }
}
