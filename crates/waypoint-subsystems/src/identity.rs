//! Identity: session validation, the one mandatory subsystem
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::RwLock;
use waypoint_core::{CorrelationContext, HookError, PreOutcome, Subsystem};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionGrant {
    pub tenant_id: String,
    pub user_id: String,
}

/// In-process session directory. A context passes when its session is
/// known and its tenant and user, if set, match the grant.
#[derive(Default)]
pub struct IdentitySubsystem {
    sessions: RwLock<HashMap<String, SessionGrant>>,
}

impl IdentitySubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(
        &self,
        session_id: impl Into<String>,
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
    ) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(
                session_id.into(),
                SessionGrant {
                    tenant_id: tenant_id.into(),
                    user_id: user_id.into(),
                },
            );
        }
    }

    /// Returns whether the session existed.
    pub fn revoke(&self, session_id: &str) -> bool {
        self.sessions
            .write()
            .map(|mut sessions| sessions.remove(session_id).is_some())
            .unwrap_or(false)
    }

    fn check(&self, ctx: &CorrelationContext) -> Result<SessionGrant, HookError> {
        let session_id = ctx
            .session_id
            .as_deref()
            .ok_or_else(|| HookError::Rejected("no session on context".to_string()))?;
        let sessions = self
            .sessions
            .read()
            .map_err(|_| HookError::Unavailable("session directory poisoned".to_string()))?;
        let grant = sessions
            .get(session_id)
            .ok_or_else(|| HookError::Rejected(format!("unknown session {}", session_id)))?;

        if ctx.tenant_id.as_deref().is_some_and(|t| t != grant.tenant_id) {
            return Err(HookError::Rejected(format!(
                "session {} does not belong to tenant {}",
                session_id,
                ctx.tenant_id.as_deref().unwrap_or_default()
            )));
        }
        if ctx.user_id.as_deref().is_some_and(|u| u != grant.user_id) {
            return Err(HookError::Rejected(format!(
                "session {} does not belong to user {}",
                session_id,
                ctx.user_id.as_deref().unwrap_or_default()
            )));
        }
        Ok(grant.clone())
    }
}

#[async_trait]
impl Subsystem for IdentitySubsystem {
    async fn pre(&self, ctx: CorrelationContext) -> Result<PreOutcome, HookError> {
        let grant = self.check(&ctx).inspect_err(|e| {
            tracing::warn!(correlation_id = %ctx.correlation_id, error = %e, "identity rejected context");
        })?;
        Ok(PreOutcome::with_data(json!({
            "tenant_id": grant.tenant_id,
            "user_id": grant.user_id,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_core::{ContextAttrs, CorrelationContextFactory};

    fn ctx(attrs: ContextAttrs) -> CorrelationContext {
        CorrelationContextFactory::default().create(None, attrs).unwrap()
    }

    #[tokio::test]
    async fn test_known_session_passes() {
        let identity = IdentitySubsystem::new();
        identity.grant("s1", "acme", "u1");

        let outcome = identity
            .pre(ctx(ContextAttrs::new().tenant("acme").user("u1").session("s1")))
            .await
            .unwrap();
        assert_eq!(outcome.data.unwrap()["user_id"], "u1");

        // tenant and user are optional on the context
        assert!(identity.pre(ctx(ContextAttrs::new().session("s1"))).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejections() {
        let identity = IdentitySubsystem::new();
        identity.grant("s1", "acme", "u1");

        let missing = identity.pre(ctx(ContextAttrs::new().tenant("acme"))).await;
        assert!(matches!(missing, Err(HookError::Rejected(_))));

        let unknown = identity.pre(ctx(ContextAttrs::new().session("s2"))).await;
        assert!(matches!(unknown, Err(HookError::Rejected(_))));

        let foreign = identity
            .pre(ctx(ContextAttrs::new().tenant("globex").session("s1")))
            .await;
        assert!(matches!(foreign, Err(HookError::Rejected(_))));

        let impostor = identity
            .pre(ctx(ContextAttrs::new().user("u9").session("s1")))
            .await;
        assert!(matches!(impostor, Err(HookError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_revoke() {
        let identity = IdentitySubsystem::new();
        identity.grant("s1", "acme", "u1");
        assert!(identity.revoke("s1"));
        assert!(!identity.revoke("s1"));
        assert!(identity.pre(ctx(ContextAttrs::new().session("s1"))).await.is_err());
    }
}
