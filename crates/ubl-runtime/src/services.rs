// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ledger-backed implementations of the seams the engines consume.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use ubl_aggregate::Repository;
use ubl_authz::RoleSource;
use ubl_core::LedgerResult;
use ubl_domain::{
    aggregate_types, AgreementRehydrator, AgreementState, AssetRehydrator, InvariantContext,
    RealmRehydrator, RealmState, RoleRehydrator, RoleState,
};
use ubl_realm::RealmManager;
use ubl_saga::CrossRealmGate;
use ubl_store::EventStore;
use ubl_workflow::{WorkflowInstance, WorkflowServices};

use crate::adapters::Notifier;

/// Role and agreement lookups over the aggregate repositories.
pub struct LedgerRoleSource {
    store: Arc<dyn EventStore>,
    roles: Arc<Repository<RoleRehydrator>>,
    agreements: Arc<Repository<AgreementRehydrator>>,
}

impl LedgerRoleSource {
    /// Wire the source.
    pub fn new(
        store: Arc<dyn EventStore>,
        roles: Arc<Repository<RoleRehydrator>>,
        agreements: Arc<Repository<AgreementRehydrator>>,
    ) -> Self {
        Self {
            store,
            roles,
            agreements,
        }
    }
}

impl LedgerRoleSource {
    /// The holder's roles that are active at `at`, resolved against their
    /// establishing agreements.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn active_roles(
        &self,
        holder: &str,
        at: chrono::DateTime<Utc>,
    ) -> LedgerResult<Vec<RoleState>> {
        let mut active = Vec::new();
        for role in self.roles_for(holder).await? {
            let agreement = self.agreement(&role.established_by).await?;
            if role.is_active(at, agreement.as_ref()) {
                active.push(role);
            }
        }
        Ok(active)
    }
}

#[async_trait]
impl RoleSource for LedgerRoleSource {
    async fn roles_for(&self, holder: &str) -> LedgerResult<Vec<RoleState>> {
        let mut out = Vec::new();
        for role_id in self.store.list_aggregate_ids(aggregate_types::ROLE).await? {
            if let Some(loaded) = self.roles.load(&role_id).await? {
                if loaded.state.holder == holder {
                    out.push(loaded.state);
                }
            }
        }
        Ok(out)
    }

    async fn agreement(&self, agreement_id: &str) -> LedgerResult<Option<AgreementState>> {
        Ok(self.agreements.load(agreement_id).await?.map(|l| l.state))
    }
}

/// Invariant-gate lookups over the aggregate repositories.
pub struct LedgerInvariantContext {
    agreements: Arc<Repository<AgreementRehydrator>>,
    realms: Arc<Repository<RealmRehydrator>>,
}

impl LedgerInvariantContext {
    /// Wire the context.
    pub fn new(
        agreements: Arc<Repository<AgreementRehydrator>>,
        realms: Arc<Repository<RealmRehydrator>>,
    ) -> Self {
        Self { agreements, realms }
    }
}

#[async_trait]
impl InvariantContext for LedgerInvariantContext {
    async fn agreement(&self, agreement_id: &str) -> LedgerResult<Option<AgreementState>> {
        Ok(self.agreements.load(agreement_id).await?.map(|l| l.state))
    }

    async fn realm(&self, realm_id: &str) -> LedgerResult<Option<RealmState>> {
        Ok(self.realms.load(realm_id).await?.map(|l| l.state))
    }
}

/// Custom workflow guard validators, registered by name.
pub type GuardValidator =
    Arc<dyn Fn(&serde_json::Value, &WorkflowInstance) -> bool + Send + Sync>;

/// Workflow services over the aggregate repositories and adapters.
pub struct LedgerWorkflowServices {
    roles: Arc<LedgerRoleSource>,
    agreements: Arc<Repository<AgreementRehydrator>>,
    assets: Arc<Repository<AssetRehydrator>>,
    notifier: Arc<dyn Notifier>,
    validators: RwLock<HashMap<String, GuardValidator>>,
}

impl LedgerWorkflowServices {
    /// Wire the services.
    pub fn new(
        roles: Arc<LedgerRoleSource>,
        agreements: Arc<Repository<AgreementRehydrator>>,
        assets: Arc<Repository<AssetRehydrator>>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            roles,
            agreements,
            assets,
            notifier,
            validators: RwLock::new(HashMap::new()),
        }
    }

    /// Register a custom guard validator.
    pub fn register_validator(&self, id: impl Into<String>, validator: GuardValidator) {
        self.validators
            .write()
            .expect("validator registry poisoned")
            .insert(id.into(), validator);
    }
}

#[async_trait]
impl WorkflowServices for LedgerWorkflowServices {
    async fn agreement_status(&self, agreement_id: &str) -> LedgerResult<Option<String>> {
        Ok(self
            .agreements
            .load(agreement_id)
            .await?
            .and_then(|l| serde_json::to_value(l.state.status).ok())
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    async fn asset_status(&self, asset_id: &str) -> LedgerResult<Option<String>> {
        Ok(self.assets.load(asset_id).await?.map(|l| l.state.status))
    }

    async fn consent_given(&self, agreement_id: &str, from_all: bool) -> LedgerResult<bool> {
        let Some(loaded) = self.agreements.load(agreement_id).await? else {
            return Ok(false);
        };
        let agreement = loaded.state;
        Ok(if from_all {
            agreement.all_principals_consented()
        } else {
            agreement.principals().any(|p| p.consent.is_some())
        })
    }

    async fn has_active_role(&self, holder: &str, role_type: &str) -> LedgerResult<bool> {
        let now = Utc::now();
        for role in self.roles.roles_for(holder).await? {
            if role.role_type != role_type {
                continue;
            }
            let agreement = self.roles.agreement(&role.established_by).await?;
            if role.is_active(now, agreement.as_ref()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn is_agreement_party(
        &self,
        agreement_id: &str,
        entity_id: &str,
        role: Option<&str>,
    ) -> LedgerResult<bool> {
        let Some(loaded) = self.agreements.load(agreement_id).await? else {
            return Ok(false);
        };
        Ok(loaded.state.parties.iter().any(|p| {
            p.entity_id == entity_id && role.is_none_or(|r| p.role == r)
        }))
    }

    async fn custom_guard(
        &self,
        validator_id: &str,
        params: &serde_json::Value,
        instance: &WorkflowInstance,
    ) -> LedgerResult<bool> {
        let validator = self
            .validators
            .read()
            .expect("validator registry poisoned")
            .get(validator_id)
            .cloned();
        match validator {
            Some(v) => Ok(v(params, instance)),
            None => {
                // An unknown validator fails closed.
                tracing::warn!(
                    target: "ubl.runtime",
                    validator = %validator_id,
                    "unknown custom guard validator"
                );
                Ok(false)
            }
        }
    }

    async fn notify(&self, recipient: &str, message: &str) -> LedgerResult<()> {
        self.notifier.send(recipient, message).await
    }
}

/// The realm manager as a saga cross-realm gate.
pub struct RealmGateAdapter {
    realms: Arc<RealmManager>,
}

impl RealmGateAdapter {
    /// Wire the adapter.
    pub fn new(realms: Arc<RealmManager>) -> Self {
        Self { realms }
    }
}

#[async_trait]
impl CrossRealmGate for RealmGateAdapter {
    async fn validate(&self, source_realm: &str, target_realm: &str) -> LedgerResult<()> {
        self.realms
            .validate_cross_realm_operation(source_realm, target_realm, "saga")
            .await
    }
}
