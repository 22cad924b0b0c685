//! Correlation Context: identity threaded through every call of a tracked operation
use crate::error::{Result, WaypointError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Identity and trace bundle for one tracked operation.
///
/// Passed by value: downstream code receives its own copy, so nothing a
/// subsystem does to its copy leaks into another call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_correlation_id: Option<String>,
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl CorrelationContext {
    pub fn is_child(&self) -> bool {
        self.parent_correlation_id.is_some()
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

/// Attributes supplied when creating a context. Anything left `None`
/// is inherited from the parent, if there is one.
#[derive(Debug, Clone, Default)]
pub struct ContextAttrs {
    pub tenant_id: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub attributes: HashMap<String, Value>,
}

impl ContextAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// Which identity attributes must be present on every context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextPolicy {
    pub require_tenant: bool,
    pub require_user: bool,
    pub require_session: bool,
}

impl ContextPolicy {
    /// Multi-tenant default: every operation must name its tenant.
    pub fn tenant_scoped() -> Self {
        Self {
            require_tenant: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorrelationContextFactory {
    policy: ContextPolicy,
}

impl CorrelationContextFactory {
    pub fn new(policy: ContextPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ContextPolicy {
        &self.policy
    }

    /// Create a root context, or a child of `parent` when one is given.
    pub fn create(
        &self,
        parent: Option<&CorrelationContext>,
        attrs: ContextAttrs,
    ) -> Result<CorrelationContext> {
        let tenant_id = attrs
            .tenant_id
            .or_else(|| parent.and_then(|p| p.tenant_id.clone()));
        let user_id = attrs
            .user_id
            .or_else(|| parent.and_then(|p| p.user_id.clone()));
        let session_id = attrs
            .session_id
            .or_else(|| parent.and_then(|p| p.session_id.clone()));

        self.enforce("tenant_id", self.policy.require_tenant, &tenant_id)?;
        self.enforce("user_id", self.policy.require_user, &user_id)?;
        self.enforce("session_id", self.policy.require_session, &session_id)?;

        let mut attributes = parent.map(|p| p.attributes.clone()).unwrap_or_default();
        attributes.extend(attrs.attributes);

        Ok(CorrelationContext {
            correlation_id: new_correlation_id(),
            parent_correlation_id: parent.map(|p| p.correlation_id.clone()),
            tenant_id,
            user_id,
            session_id,
            created_at: Utc::now(),
            attributes,
        })
    }

    /// Shorthand for deriving a sub-operation context.
    pub fn child(&self, parent: &CorrelationContext, attrs: ContextAttrs) -> Result<CorrelationContext> {
        self.create(Some(parent), attrs)
    }

    fn enforce(&self, field: &str, required: bool, value: &Option<String>) -> Result<()> {
        let present = value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false);
        if required && !present {
            return Err(WaypointError::config(format!(
                "context policy requires {} but none was supplied",
                field
            )));
        }
        Ok(())
    }
}

fn new_correlation_id() -> String {
    format!("corr_{}", uuid::Uuid::new_v4().simple())
}
