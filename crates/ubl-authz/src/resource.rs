// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resource references and glob permission matching.

use globset::Glob;

use ubl_core::scope::Scope;
use ubl_domain::Permission;

/// A parsed resource string.
///
/// Resources are written `"Type:id"` (`"Realm:internal"`,
/// `"Asset:asset-1"`) or as bare verbs-on-nouns (`"intent:create_entity"`)
/// where the type carries no scope of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    /// The original string.
    pub raw: String,
    /// Text before the first `:`, or the whole string.
    pub resource_type: String,
    /// Text after the first `:`, if any.
    pub resource_id: Option<String>,
}

impl ResourceRef {
    /// Parse a resource string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((t, id)) => Self {
                raw: raw.to_string(),
                resource_type: t.to_string(),
                resource_id: Some(id.to_string()),
            },
            None => Self {
                raw: raw.to_string(),
                resource_type: raw.to_string(),
                resource_id: None,
            },
        }
    }

    /// The scope this resource lives in, when the type is scope-bearing.
    ///
    /// Unscoped resources (intents, ad-hoc verbs) fall back to the
    /// requesting context's realm, or `Global` when no realm is in play.
    #[must_use]
    pub fn to_scope(&self, context_realm: Option<&str>) -> Scope {
        match (self.resource_type.as_str(), &self.resource_id) {
            ("Realm", Some(id)) => Scope::Realm {
                realm_id: id.clone(),
            },
            ("Entity", Some(id)) => Scope::Entity {
                entity_id: id.clone(),
            },
            ("Agreement", Some(id)) => Scope::Agreement {
                agreement_id: id.clone(),
            },
            ("Asset", Some(id)) => Scope::Asset {
                asset_id: id.clone(),
            },
            _ => match context_realm {
                Some(realm_id) => Scope::Realm {
                    realm_id: realm_id.to_string(),
                },
                None => Scope::Global,
            },
        }
    }
}

/// Whether a permission pattern pair grants `action` on `resource`.
///
/// Both sides are glob patterns: `*` matches anything, otherwise the match
/// is exact. A malformed pattern matches nothing.
#[must_use]
pub fn permission_matches(permission: &Permission, action: &str, resource: &str) -> bool {
    glob_matches(&permission.action, action) && glob_matches(&permission.resource, resource)
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(['*', '?', '[']) {
        return pattern == value;
    }
    Glob::new(pattern).is_ok_and(|g| g.compile_matcher().is_match(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_typed_resource() {
        let r = ResourceRef::parse("Realm:internal");
        assert_eq!(r.resource_type, "Realm");
        assert_eq!(r.resource_id.as_deref(), Some("internal"));
    }

    #[test]
    fn parse_bare_resource() {
        let r = ResourceRef::parse("dashboard");
        assert_eq!(r.resource_type, "dashboard");
        assert!(r.resource_id.is_none());
    }

    #[test]
    fn scope_for_typed_resources() {
        assert_eq!(
            ResourceRef::parse("Realm:r-1").to_scope(None),
            Scope::Realm {
                realm_id: "r-1".into()
            }
        );
        assert_eq!(
            ResourceRef::parse("Entity:e-1").to_scope(None),
            Scope::Entity {
                entity_id: "e-1".into()
            }
        );
    }

    #[test]
    fn unscoped_resource_falls_back_to_context_realm() {
        assert_eq!(
            ResourceRef::parse("intent:create_entity").to_scope(Some("r-1")),
            Scope::Realm {
                realm_id: "r-1".into()
            }
        );
        assert_eq!(
            ResourceRef::parse("intent:create_entity").to_scope(None),
            Scope::Global
        );
    }

    #[test]
    fn exact_and_wildcard_permission_matching() {
        let exact = Permission::new("read", "Realm:internal");
        assert!(permission_matches(&exact, "read", "Realm:internal"));
        assert!(!permission_matches(&exact, "write", "Realm:internal"));
        assert!(!permission_matches(&exact, "read", "Realm:other"));

        let wide = Permission::new("*", "Asset:*");
        assert!(permission_matches(&wide, "transfer", "Asset:asset-1"));
        assert!(!permission_matches(&wide, "transfer", "Realm:internal"));
    }

    #[test]
    fn malformed_pattern_matches_nothing() {
        let bad = Permission::new("[", "Realm:internal");
        assert!(!permission_matches(&bad, "[", "Realm:internal"));
    }
}
