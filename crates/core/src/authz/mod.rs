//! Role-based authorization gate.
//!
//! Permission checks are a pure function of (role, permission). Tenant and
//! ownership restrictions are layered on top by the lifecycle engine.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::actor::Actor;

pub mod roles {
    pub const ADMIN: &str = "admin";
    pub const TRAVEL_AGENT: &str = "travel_agent";
    pub const CORPORATE_CLIENT: &str = "corporate_client";
    pub const EMPLOYEE: &str = "employee";
    pub const TRAVELER: &str = "traveler";
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ApproveRequests,
    ManageServiceRequests,
    ViewAuditLogs,
    ExportAuditLogs,
    ManageAllTenants,
}

impl Permission {
    pub const ALL: [Self; 5] = [
        Self::ApproveRequests,
        Self::ManageServiceRequests,
        Self::ViewAuditLogs,
        Self::ExportAuditLogs,
        Self::ManageAllTenants,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApproveRequests => "approve_requests",
            Self::ManageServiceRequests => "manage_service_requests",
            Self::ViewAuditLogs => "view_audit_logs",
            Self::ExportAuditLogs => "export_audit_logs",
            Self::ManageAllTenants => "manage_all_tenants",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match normalize_key(value).as_str() {
            "approve_requests" => Some(Self::ApproveRequests),
            "manage_service_requests" => Some(Self::ManageServiceRequests),
            "view_audit_logs" => Some(Self::ViewAuditLogs),
            "export_audit_logs" => Some(Self::ExportAuditLogs),
            "manage_all_tenants" => Some(Self::ManageAllTenants),
            _ => None,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("an authenticated actor is required")]
    Unauthenticated,
    #[error("role `{role}` lacks permission `{permission}`")]
    MissingPermission { role: String, permission: Permission },
    #[error("actor `{actor_id}` is not permitted to act for tenant `{tenant_id}`")]
    TenantMismatch { actor_id: String, tenant_id: String },
    #[error("actor `{actor_id}` may only act on requests they own")]
    NotOwner { actor_id: String },
}

/// Role name → permission set. Lookups are case-insensitive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoleRegistry {
    roles: HashMap<String, BTreeSet<Permission>>,
}

impl RoleRegistry {
    pub fn new<R, P>(roles: R) -> Self
    where
        R: IntoIterator<Item = (String, P)>,
        P: IntoIterator<Item = Permission>,
    {
        let roles = roles
            .into_iter()
            .map(|(role, permissions)| (normalize_key(&role), permissions.into_iter().collect()))
            .collect();
        Self { roles }
    }

    /// Replaces (or adds) the permission sets for the given roles.
    pub fn with_overrides<R, P>(mut self, overrides: R) -> Self
    where
        R: IntoIterator<Item = (String, P)>,
        P: IntoIterator<Item = Permission>,
    {
        for (role, permissions) in overrides {
            self.roles.insert(normalize_key(&role), permissions.into_iter().collect());
        }
        self
    }

    pub fn is_known(&self, role: &str) -> bool {
        self.roles.contains_key(&normalize_key(role))
    }

    /// Unrecognized roles resolve to the empty set.
    pub fn permissions_for(&self, role: &str) -> BTreeSet<Permission> {
        self.roles.get(&normalize_key(role)).cloned().unwrap_or_default()
    }

    pub fn grants(&self, role: &str, permission: Permission) -> bool {
        self.roles
            .get(&normalize_key(role))
            .is_some_and(|permissions| permissions.contains(&permission))
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        use Permission::{ApproveRequests, ExportAuditLogs, ManageServiceRequests, ViewAuditLogs};

        Self::new([
            (roles::ADMIN.to_string(), Permission::ALL.to_vec()),
            (
                roles::TRAVEL_AGENT.to_string(),
                vec![ApproveRequests, ManageServiceRequests, ViewAuditLogs],
            ),
            (
                roles::CORPORATE_CLIENT.to_string(),
                vec![ApproveRequests, ViewAuditLogs, ExportAuditLogs],
            ),
            (roles::EMPLOYEE.to_string(), Vec::new()),
            (roles::TRAVELER.to_string(), Vec::new()),
        ])
    }
}

#[derive(Clone, Debug, Default)]
pub struct AuthorizationGate {
    registry: RoleRegistry,
}

impl AuthorizationGate {
    pub fn new(registry: RoleRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RoleRegistry {
        &self.registry
    }

    pub fn has_permission(&self, role: &str, permission: Permission) -> bool {
        self.registry.grants(role, permission)
    }

    /// Fails closed: no actor, or an actor whose role lacks `permission`,
    /// is rejected.
    pub fn require_permission<'a>(
        &self,
        actor: Option<&'a Actor>,
        permission: Permission,
    ) -> Result<&'a Actor, AuthorizationError> {
        let actor = require_actor(actor)?;
        if self.has_permission(&actor.role, permission) {
            return Ok(actor);
        }
        Err(AuthorizationError::MissingPermission { role: actor.role.clone(), permission })
    }
}

/// Rejects missing or blank identities.
pub fn require_actor(actor: Option<&Actor>) -> Result<&Actor, AuthorizationError> {
    match actor {
        Some(actor) if !actor.id.0.trim().is_empty() => Ok(actor),
        _ => Err(AuthorizationError::Unauthenticated),
    }
}

pub fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['-', ' '], "_")
}
