//! Authorization gate
//!
//! Evaluates a resource's `SecurityRequirement` set against the caller's
//! identity context. Requirements form a disjunction; each requirement's
//! values form a conjunction under its scheme. Two schemes are special:
//! `authenticated` (any identity) and `bearer` (identity obtained from a
//! verified bearer JWT).

use serde_json::Value;

use crate::decl::SecurityRequirement;
use crate::error::{Error, Result};
use crate::identity::Identity;

/// Kind of resource being gated, for logging and error texts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Page,
    Function,
    Navigation,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Page => write!(f, "page"),
            ResourceKind::Function => write!(f, "function"),
            ResourceKind::Navigation => write!(f, "navigation"),
        }
    }
}

/// Scheme name granted to any present identity
pub const SCHEME_AUTHENTICATED: &str = "authenticated";
/// Scheme name granted to identities backed by a verified bearer JWT
pub const SCHEME_BEARER: &str = "bearer";

/// Evaluate access for a caller against a requirement set
///
/// Returns `Ok(true)` iff at least one requirement is fully satisfied. An
/// empty requirement set means the resource carries no security and is
/// always granted. Malformed claim values surface as errors (the caller
/// responds 500, never 401).
pub fn check_access(
    identity: Option<&Identity>,
    kind: ResourceKind,
    name: &str,
    requirements: &[SecurityRequirement],
    anonymous_entitlements: &[SecurityRequirement],
) -> Result<bool> {
    if requirements.is_empty() {
        return Ok(true);
    }

    for requirement in requirements {
        let satisfied = match identity {
            Some(identity) => satisfies(identity, requirement)?,
            None => anonymous_satisfies(anonymous_entitlements, requirement),
        };
        if satisfied {
            return Ok(true);
        }
    }

    tracing::debug!(
        resource = %kind,
        name = %name,
        anonymous = identity.is_none(),
        "access denied"
    );
    Ok(false)
}

fn satisfies(identity: &Identity, requirement: &SecurityRequirement) -> Result<bool> {
    match requirement.scheme.as_str() {
        SCHEME_AUTHENTICATED => Ok(true),
        SCHEME_BEARER => Ok(identity.is_bearer()),
        scheme => {
            let Some(claim) = identity.claims.get(scheme) else {
                // scopes are also addressable as a scheme
                if scheme == "scope" {
                    return Ok(requirement
                        .values
                        .iter()
                        .all(|v| identity.scopes.iter().any(|s| s == v)));
                }
                return Ok(false);
            };
            let granted = claim_values(claim).map_err(|_| {
                Error::Internal(format!(
                    "claim '{scheme}' has unsupported shape for subject '{}'",
                    identity.subject
                ))
            })?;
            Ok(requirement
                .values
                .iter()
                .all(|v| granted.iter().any(|g| g == v)))
        }
    }
}

fn anonymous_satisfies(
    entitlements: &[SecurityRequirement],
    requirement: &SecurityRequirement,
) -> bool {
    if requirement.scheme == SCHEME_AUTHENTICATED || requirement.scheme == SCHEME_BEARER {
        return false;
    }
    entitlements.iter().any(|granted| {
        granted.scheme == requirement.scheme
            && requirement
                .values
                .iter()
                .all(|v| granted.values.iter().any(|g| g == v))
    })
}

/// Normalize a claim value into a set of strings
///
/// Strings split on whitespace (scope-style), arrays take their string
/// elements; anything else is malformed.
fn claim_values(claim: &Value) -> std::result::Result<Vec<String>, ()> {
    match claim {
        Value::String(s) => Ok(s.split_whitespace().map(str::to_string).collect()),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or(()))
            .collect(),
        Value::Bool(b) => Ok(if *b { vec!["true".to_string()] } else { vec![] }),
        _ => Err(()),
    }
}
