//! Authorization requirements declared by handlers.
//!
//! A handler declares an [`AuthRequirement`] by name. At registration time
//! it is resolved against a [`PolicySet`] into a [`ResolvedAuth`], so
//! dispatch only runs a field check against the principal carried in the
//! payload's transaction context.
//!
//! Rules:
//! - an empty requirement lets anonymous messages through
//! - otherwise a principal must be present
//! - holding any one of the listed roles satisfies the role part
//! - every listed policy must pass

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::context::{Principal, TransactionContext};
use crate::errors::HandlerError;

/// A named predicate over the principal.
pub trait AuthorizationPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// `Err` carries the human-readable denial reason.
    fn evaluate(&self, principal: &Principal) -> Result<(), String>;
}

/// Requires claim `claim` to hold at least one of `allowed`.
#[derive(Debug, Clone)]
pub struct ClaimPolicy {
    name: String,
    claim: String,
    allowed: Vec<String>,
}

impl ClaimPolicy {
    pub fn new<I, S>(name: impl Into<String>, claim: impl Into<String>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            claim: claim.into(),
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

impl AuthorizationPolicy for ClaimPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, principal: &Principal) -> Result<(), String> {
        let held = principal.claim_values(&self.claim);
        if held.iter().any(|v| self.allowed.iter().any(|a| a == v)) {
            Ok(())
        } else {
            Err(format!(
                "policy '{}' requires claim '{}' in {:?}",
                self.name, self.claim, self.allowed
            ))
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unknown authorization policy '{0}'")]
pub struct UnknownPolicy(pub String);

/// Named policies available to handler declarations.
#[derive(Clone, Default)]
pub struct PolicySet {
    policies: HashMap<String, Arc<dyn AuthorizationPolicy>>,
}

impl fmt::Debug for PolicySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.policies.keys().collect();
        names.sort();
        f.debug_struct("PolicySet").field("policies", &names).finish()
    }
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy under its own name. A later policy with the same
    /// name replaces the earlier one.
    pub fn insert<P>(&mut self, policy: P) -> &mut Self
    where
        P: AuthorizationPolicy + 'static,
    {
        self.policies
            .insert(policy.name().to_string(), Arc::new(policy));
        self
    }

    pub fn with<P>(mut self, policy: P) -> Self
    where
        P: AuthorizationPolicy + 'static,
    {
        self.insert(policy);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AuthorizationPolicy>> {
        self.policies.get(name).cloned()
    }
}

/// What a handler declares: role names and policy names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthRequirement {
    pub roles: Vec<String>,
    pub policies: Vec<String>,
}

impl AuthRequirement {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn role(role: impl Into<String>) -> Self {
        Self {
            roles: vec![role.into()],
            policies: Vec::new(),
        }
    }

    pub fn policy(policy: impl Into<String>) -> Self {
        Self {
            roles: Vec::new(),
            policies: vec![policy.into()],
        }
    }

    pub fn and_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn and_policy(mut self, policy: impl Into<String>) -> Self {
        self.policies.push(policy.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.policies.is_empty()
    }

    pub fn resolve(&self, set: &PolicySet) -> Result<ResolvedAuth, UnknownPolicy> {
        let policies = self
            .policies
            .iter()
            .map(|name| set.get(name).ok_or_else(|| UnknownPolicy(name.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResolvedAuth {
            roles: self.roles.clone(),
            policies,
        })
    }
}

/// A requirement with its policies already looked up.
#[derive(Clone, Default)]
pub struct ResolvedAuth {
    roles: Vec<String>,
    policies: Vec<Arc<dyn AuthorizationPolicy>>,
}

impl fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.policies.iter().map(|p| p.name()).collect();
        f.debug_struct("ResolvedAuth")
            .field("roles", &self.roles)
            .field("policies", &names)
            .finish()
    }
}

impl ResolvedAuth {
    pub fn is_required(&self) -> bool {
        !self.roles.is_empty() || !self.policies.is_empty()
    }

    pub fn authorize(&self, ctx: Option<&TransactionContext>) -> Result<(), HandlerError> {
        if !self.is_required() {
            return Ok(());
        }

        let principal = ctx
            .and_then(TransactionContext::principal)
            .ok_or_else(|| HandlerError::unauthorized("no authenticated principal"))?;

        if !self.roles.is_empty() && !self.roles.iter().any(|r| principal.has_role(r)) {
            return Err(HandlerError::unauthorized(format!(
                "principal '{}' lacks any of roles {:?}",
                principal.subject, self.roles
            )));
        }

        for policy in &self.policies {
            policy.evaluate(principal).map_err(HandlerError::unauthorized)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;

    fn ctx_with(principal: Principal) -> TransactionContext {
        TransactionContext::new().with_principal(principal)
    }

    #[test]
    fn empty_requirement_allows_anonymous() {
        let auth = AuthRequirement::none().resolve(&PolicySet::new()).unwrap();
        assert!(auth.authorize(None).is_ok());
        assert!(auth.authorize(Some(&TransactionContext::new())).is_ok());
    }

    #[test]
    fn missing_principal_is_denied() {
        let auth = AuthRequirement::role("admin").resolve(&PolicySet::new()).unwrap();
        let err = auth.authorize(Some(&TransactionContext::new())).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Authorization);
    }

    #[test]
    fn any_listed_role_is_enough() {
        let auth = AuthRequirement::role("admin")
            .and_role("ops")
            .resolve(&PolicySet::new())
            .unwrap();

        let ops = ctx_with(Principal::new("a").with_role("ops"));
        let user = ctx_with(Principal::new("b").with_role("user"));

        assert!(auth.authorize(Some(&ops)).is_ok());
        assert!(auth.authorize(Some(&user)).is_err());
    }

    #[test]
    fn policies_must_all_pass() {
        let set = PolicySet::new()
            .with(ClaimPolicy::new("acme-only", "tenant", ["acme"]))
            .with(ClaimPolicy::new("writer", "scope", ["write"]));
        let auth = AuthRequirement::policy("acme-only")
            .and_policy("writer")
            .resolve(&set)
            .unwrap();

        let both = ctx_with(
            Principal::new("a")
                .with_claim("tenant", "acme")
                .with_claim("scope", serde_json::json!(["read", "write"])),
        );
        let one = ctx_with(Principal::new("b").with_claim("tenant", "acme"));

        assert!(auth.authorize(Some(&both)).is_ok());
        let err = auth.authorize(Some(&one)).unwrap_err();
        assert!(err.to_string().contains("writer"));
    }

    #[test]
    fn unknown_policy_fails_resolution() {
        let err = AuthRequirement::policy("ghost")
            .resolve(&PolicySet::new())
            .unwrap_err();
        assert_eq!(err, UnknownPolicy("ghost".to_string()));
    }
}
