// SPDX-License-Identifier: MIT OR Apache-2.0

//! Declarative policy engine.
//!
//! Policies are data: condition lists plus optional composed rules, an
//! effect, and a priority. Evaluation walks enabled policies in descending
//! priority; a matching `Deny` short-circuits, a matching `Allow` is
//! recorded but can still be overridden by a later `Deny`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Datelike, Timelike, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use ubl_core::scope::Scope;
use ubl_domain::RoleState;

use crate::resource::ResourceRef;
use crate::AccessRequest;

/// What a matching policy does to the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Grant, unless a deny also matches.
    Allow,
    /// Refuse, overriding any allow.
    Deny,
    /// Match without affecting the decision (observability policies).
    Neutral,
}

/// Condition on the requesting actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActorCondition {
    /// Matches every actor.
    Any,
    /// Matches a specific party id.
    ActorId {
        /// The entity id to match.
        actor_id: String,
    },
    /// Matches the actor reference kind (`"party"`, `"system"`, …).
    ActorType {
        /// The kind to match.
        actor_type: String,
    },
    /// Actor holds an active role of this type.
    HasRole {
        /// Role type to look for.
        role_type: String,
    },
    /// Actor holds no active role of this type.
    NotHasRole {
        /// Role type that must be absent.
        role_type: String,
    },
    /// Actor owns the resource (owner supplied by the caller).
    IsResourceOwner,
    /// Actor is a party to the agreement resource.
    IsAgreementParty,
}

/// Condition on the resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceCondition {
    /// Matches every resource.
    Any,
    /// Matches the parsed resource type.
    ResourceType {
        /// Type to match (e.g. `"Asset"`).
        resource_type: String,
    },
    /// Matches the full resource string.
    ResourceId {
        /// Resource string to match.
        resource: String,
    },
    /// Matches a context attribute describing the resource.
    ResourceAttribute {
        /// Attribute key.
        key: String,
        /// Required value.
        value: serde_json::Value,
    },
    /// Resource belongs to the given realm (per request context).
    ResourceInRealm {
        /// Realm id.
        realm_id: String,
    },
}

/// Condition on the request context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextCondition {
    /// Request is scoped to the given realm.
    InRealm {
        /// Realm id.
        realm_id: String,
    },
    /// Context carries the attribute with the value.
    HasAttribute {
        /// Attribute key.
        key: String,
        /// Required value.
        value: serde_json::Value,
    },
    /// Deployment environment tag (from the `environment` attribute).
    Environment {
        /// Environment name (e.g. `"production"`).
        name: String,
    },
}

/// Condition on the request time (all UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemporalCondition {
    /// Minutes since midnight, `[start, end)`.
    TimeOfDay {
        /// Window start.
        start_minute: u32,
        /// Window end (exclusive).
        end_minute: u32,
    },
    /// Days of week, 1 = Monday … 7 = Sunday.
    DayOfWeek {
        /// Allowed days.
        days: Vec<u8>,
    },
    /// Calendar window.
    DateRange {
        /// Inclusive start.
        #[serde(with = "chrono::serde::ts_milliseconds")]
        #[schemars(with = "i64")]
        from: DateTime<Utc>,
        /// Exclusive end; absent means open.
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "chrono::serde::ts_milliseconds_option"
        )]
        #[schemars(with = "Option<i64>")]
        to: Option<DateTime<Utc>>,
    },
    /// Monday–Friday, 09:00–17:00.
    BusinessHours,
}

/// Condition on the actor's active roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoleCondition {
    /// At least one of these role types is active.
    HasAnyRole {
        /// Candidate role types.
        role_types: Vec<String>,
    },
    /// All of these role types are active.
    HasAllRoles {
        /// Required role types.
        role_types: Vec<String>,
    },
    /// An active role's scope equals the given scope.
    RoleInScope {
        /// Scope to match.
        scope: Scope,
    },
}

/// A single policy condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "on", rename_all = "snake_case")]
pub enum Condition {
    /// See [`ActorCondition`].
    Actor(ActorCondition),
    /// See [`ResourceCondition`].
    Resource(ResourceCondition),
    /// See [`ContextCondition`].
    Context(ContextCondition),
    /// See [`TemporalCondition`].
    Temporal(TemporalCondition),
    /// See [`RoleCondition`].
    Role(RoleCondition),
}

/// Boolean composition over conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Rule {
    /// All sub-rules hold.
    And {
        /// Sub-rules.
        rules: Vec<Rule>,
    },
    /// At least one sub-rule holds.
    Or {
        /// Sub-rules.
        rules: Vec<Rule>,
    },
    /// The sub-rule does not hold.
    Not {
        /// Sub-rule.
        rule: Box<Rule>,
    },
    /// A single condition.
    Cond {
        /// The condition.
        condition: Condition,
    },
    /// Named evaluator registered on the engine.
    Custom {
        /// Evaluator name.
        evaluator_id: String,
        /// Evaluator parameters.
        #[serde(default)]
        params: serde_json::Value,
    },
}

/// A declarative policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Policy {
    /// Stable identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Higher evaluates first.
    pub priority: i32,
    /// Disabled policies are skipped entirely.
    pub enabled: bool,
    /// All conditions must hold for the policy to match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// The matched policy's contribution.
    pub effect: Effect,
    /// Additional composed rules; all must hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,
}

/// Everything a condition can look at.
pub struct EvalContext<'a> {
    /// The request under evaluation.
    pub request: &'a AccessRequest,
    /// Parsed resource.
    pub resource: &'a ResourceRef,
    /// The actor's active roles at the request timestamp.
    pub active_roles: &'a [RoleState],
    /// Owner of the resource, when the caller resolved one.
    pub resource_owner: Option<&'a str>,
    /// Parties of the agreement resource, when the caller resolved them.
    pub agreement_parties: &'a [String],
}

/// Outcome of a policy evaluation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// A `Deny` policy matched (short-circuit).
    Deny {
        /// The denying policy's id.
        policy_id: String,
    },
    /// At least one `Allow` policy matched and no `Deny` did.
    Allow {
        /// The first matching allow policy's id.
        policy_id: String,
    },
    /// No effectful policy matched.
    Neutral,
}

type EvaluatorFn = Arc<dyn Fn(&EvalContext<'_>, &serde_json::Value) -> bool + Send + Sync>;

/// Evaluates registered policies against requests.
#[derive(Default)]
pub struct PolicyEngine {
    policies: RwLock<Vec<Policy>>,
    evaluators: RwLock<HashMap<String, EvaluatorFn>>,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let policies = self.policies.read().expect("policy registry poisoned");
        f.debug_struct("PolicyEngine")
            .field("policies", &policies.len())
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    /// Create an engine with no policies.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace, by id) a policy.
    pub fn upsert(&self, policy: Policy) {
        let mut policies = self.policies.write().expect("policy registry poisoned");
        policies.retain(|p| p.id != policy.id);
        policies.push(policy);
        // Kept sorted so evaluation is a straight walk.
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
    }

    /// Remove a policy by id.
    pub fn remove(&self, policy_id: &str) {
        self.policies
            .write()
            .expect("policy registry poisoned")
            .retain(|p| p.id != policy_id);
    }

    /// Number of registered policies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.read().expect("policy registry poisoned").len()
    }

    /// Whether no policies are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a custom rule evaluator.
    pub fn register_evaluator<F>(&self, id: impl Into<String>, f: F)
    where
        F: Fn(&EvalContext<'_>, &serde_json::Value) -> bool + Send + Sync + 'static,
    {
        self.evaluators
            .write()
            .expect("evaluator registry poisoned")
            .insert(id.into(), Arc::new(f));
    }

    /// Evaluate all enabled policies in descending priority.
    #[must_use]
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> PolicyOutcome {
        let policies = self.policies.read().expect("policy registry poisoned");
        let mut allow: Option<String> = None;
        for policy in policies.iter().filter(|p| p.enabled) {
            if !self.policy_matches(policy, ctx) {
                continue;
            }
            match policy.effect {
                Effect::Deny => {
                    tracing::debug!(
                        target: "ubl.authz",
                        policy = %policy.id,
                        "policy deny matched"
                    );
                    return PolicyOutcome::Deny {
                        policy_id: policy.id.clone(),
                    };
                }
                Effect::Allow => {
                    allow.get_or_insert_with(|| policy.id.clone());
                }
                Effect::Neutral => {}
            }
        }
        match allow {
            Some(policy_id) => PolicyOutcome::Allow { policy_id },
            None => PolicyOutcome::Neutral,
        }
    }

    fn policy_matches(&self, policy: &Policy, ctx: &EvalContext<'_>) -> bool {
        policy.conditions.iter().all(|c| eval_condition(c, ctx))
            && policy.rules.iter().all(|r| self.eval_rule(r, ctx))
    }

    fn eval_rule(&self, rule: &Rule, ctx: &EvalContext<'_>) -> bool {
        match rule {
            Rule::And { rules } => rules.iter().all(|r| self.eval_rule(r, ctx)),
            Rule::Or { rules } => rules.iter().any(|r| self.eval_rule(r, ctx)),
            Rule::Not { rule } => !self.eval_rule(rule, ctx),
            Rule::Cond { condition } => eval_condition(condition, ctx),
            Rule::Custom {
                evaluator_id,
                params,
            } => {
                let evaluators = self.evaluators.read().expect("evaluator registry poisoned");
                match evaluators.get(evaluator_id) {
                    Some(f) => f(ctx, params),
                    // An unknown evaluator never matches; failing open here
                    // would turn a typo into a grant.
                    None => {
                        tracing::warn!(
                            target: "ubl.authz",
                            evaluator = %evaluator_id,
                            "unknown custom evaluator in policy rule"
                        );
                        false
                    }
                }
            }
        }
    }
}

fn eval_condition(condition: &Condition, ctx: &EvalContext<'_>) -> bool {
    match condition {
        Condition::Actor(c) => eval_actor(c, ctx),
        Condition::Resource(c) => eval_resource(c, ctx),
        Condition::Context(c) => eval_context(c, ctx),
        Condition::Temporal(c) => eval_temporal(c, ctx.request.context.timestamp),
        Condition::Role(c) => eval_role(c, ctx),
    }
}

fn actor_type_name(actor: &ubl_core::ActorRef) -> &'static str {
    match actor {
        ubl_core::ActorRef::System { .. } => "system",
        ubl_core::ActorRef::Party { .. } => "party",
        ubl_core::ActorRef::Workflow { .. } => "workflow",
        ubl_core::ActorRef::Anonymous { .. } => "anonymous",
    }
}

fn eval_actor(c: &ActorCondition, ctx: &EvalContext<'_>) -> bool {
    let actor = &ctx.request.actor;
    match c {
        ActorCondition::Any => true,
        ActorCondition::ActorId { actor_id } => actor.party_id() == Some(actor_id.as_str()),
        ActorCondition::ActorType { actor_type } => actor_type_name(actor) == actor_type,
        ActorCondition::HasRole { role_type } => {
            ctx.active_roles.iter().any(|r| &r.role_type == role_type)
        }
        ActorCondition::NotHasRole { role_type } => {
            !ctx.active_roles.iter().any(|r| &r.role_type == role_type)
        }
        ActorCondition::IsResourceOwner => match (actor.party_id(), ctx.resource_owner) {
            (Some(a), Some(o)) => a == o,
            _ => false,
        },
        ActorCondition::IsAgreementParty => actor
            .party_id()
            .is_some_and(|a| ctx.agreement_parties.iter().any(|p| p == a)),
    }
}

fn eval_resource(c: &ResourceCondition, ctx: &EvalContext<'_>) -> bool {
    match c {
        ResourceCondition::Any => true,
        ResourceCondition::ResourceType { resource_type } => {
            &ctx.resource.resource_type == resource_type
        }
        ResourceCondition::ResourceId { resource } => &ctx.resource.raw == resource,
        ResourceCondition::ResourceAttribute { key, value } => {
            ctx.request.context.attributes.get(key) == Some(value)
        }
        ResourceCondition::ResourceInRealm { realm_id } => {
            ctx.request.context.realm_id.as_deref() == Some(realm_id.as_str())
        }
    }
}

fn eval_context(c: &ContextCondition, ctx: &EvalContext<'_>) -> bool {
    match c {
        ContextCondition::InRealm { realm_id } => {
            ctx.request.context.realm_id.as_deref() == Some(realm_id.as_str())
        }
        ContextCondition::HasAttribute { key, value } => {
            ctx.request.context.attributes.get(key) == Some(value)
        }
        ContextCondition::Environment { name } => ctx
            .request
            .context
            .attributes
            .get("environment")
            .and_then(|v| v.as_str())
            .is_some_and(|env| env == name),
    }
}

fn eval_temporal(c: &TemporalCondition, at: DateTime<Utc>) -> bool {
    match c {
        TemporalCondition::TimeOfDay {
            start_minute,
            end_minute,
        } => {
            let minute = at.hour() * 60 + at.minute();
            minute >= *start_minute && minute < *end_minute
        }
        TemporalCondition::DayOfWeek { days } => {
            let day = at.weekday().number_from_monday() as u8;
            days.contains(&day)
        }
        TemporalCondition::DateRange { from, to } => {
            at >= *from && to.is_none_or(|until| at < until)
        }
        TemporalCondition::BusinessHours => {
            let day = at.weekday().number_from_monday();
            let minute = at.hour() * 60 + at.minute();
            (1..=5).contains(&day) && (540..1020).contains(&minute)
        }
    }
}

fn eval_role(c: &RoleCondition, ctx: &EvalContext<'_>) -> bool {
    match c {
        RoleCondition::HasAnyRole { role_types } => ctx
            .active_roles
            .iter()
            .any(|r| role_types.iter().any(|t| t == &r.role_type)),
        RoleCondition::HasAllRoles { role_types } => role_types
            .iter()
            .all(|t| ctx.active_roles.iter().any(|r| &r.role_type == t)),
        RoleCondition::RoleInScope { scope } => ctx
            .active_roles
            .iter()
            .any(|r| r.scope.as_ref() == Some(scope)),
    }
}
