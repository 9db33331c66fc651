//! Per-request authentication context.

use quarry_core::{AclConfig, Principal};
use std::sync::Arc;

use crate::cache::{TtlCache, ttl_from_seconds};
use crate::error::AclError;
use crate::store::PermissionStore;

/// Resolves the principal a request runs as.
///
/// Requests without a principal run as the configured anonymous user. The
/// lookup is cached; a store without that user yields a built-in anonymous
/// principal with no groups.
pub struct PrincipalResolver {
    store: Arc<dyn PermissionStore>,
    anonymous_username: String,
    cache: TtlCache<String, Principal>,
}

impl PrincipalResolver {
    pub fn new(store: Arc<dyn PermissionStore>, config: &AclConfig) -> Self {
        let ttl = ttl_from_seconds(config.cache_ttl_seconds);
        Self {
            store,
            anonymous_username: config.anonymous_username.clone(),
            cache: TtlCache::new(ttl),
        }
    }

    pub async fn anonymous(&self) -> Result<Principal, AclError> {
        if let Some(principal) = self.cache.get(&self.anonymous_username) {
            return Ok(principal);
        }

        let principal = match self.store.find_principal(&self.anonymous_username).await? {
            Some(mut principal) => {
                principal.anonymous = true;
                principal
            }
            None => Principal::anonymous(&self.anonymous_username),
        };
        self.cache
            .insert(self.anonymous_username.clone(), principal.clone());
        Ok(principal)
    }

    /// Establish the context for one request.
    pub async fn establish(&self, principal: Option<Principal>) -> Result<RequestContext, AclError> {
        match principal {
            Some(principal) => Ok(RequestContext { principal }),
            None => {
                let principal = self.anonymous().await?;
                tracing::info!(
                    principal = %principal.id,
                    username = principal.username.as_deref().unwrap_or_default(),
                    "no principal on request, continuing as anonymous"
                );
                Ok(RequestContext { principal })
            }
        }
    }
}

/// The principal a request runs as. Built once per request and passed
/// explicitly to every authorization call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    principal: Principal,
}

impl RequestContext {
    pub fn new(principal: Principal) -> Self {
        Self { principal }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn is_anonymous(&self) -> bool {
        self.principal.anonymous
    }
}
