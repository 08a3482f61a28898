//! Credential broker: account context in, scoped provider clients out.

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use super::{ComputeServiceRef, JobServiceRef, ProviderResult};
use crate::model::AccountContext;

/// Whose credentials a set of clients carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialScope {
    /// Scoped to the execution's account context.
    Account { account_id: String },
    /// The caller's own credentials, used for records without an account
    /// context.
    CallerFallback,
}

impl CredentialScope {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::CallerFallback)
    }
}

/// Provider clients bound to one credential scope.
#[derive(Clone)]
pub struct ProviderClients {
    pub jobs: JobServiceRef,
    pub compute: ComputeServiceRef,
    pub scope: CredentialScope,
}

impl std::fmt::Debug for ProviderClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClients")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Resolves account contexts to scoped clients.
///
/// Resolution is idempotent and has no side effects beyond issuing
/// credentials.
#[async_trait]
pub trait CredentialBroker: Send + Sync {
    async fn resolve(&self, context: &AccountContext) -> ProviderResult<ProviderClients>;

    /// Clients carrying the orchestrator's own credentials.
    fn caller_clients(&self) -> ProviderClients;
}

/// Resolves clients for an optional account context.
///
/// A missing context falls back to the caller's credentials; the returned
/// scope records the fallback.
pub async fn resolve_clients(
    broker: &dyn CredentialBroker,
    context: Option<&AccountContext>,
) -> ProviderResult<ProviderClients> {
    match context {
        Some(context) => broker.resolve(context).await,
        None => {
            warn!("No account context on record, using caller credentials");
            Ok(broker.caller_clients())
        }
    }
}

/// Broker that hands out one fixed set of clients for every context.
///
/// Suitable for single-account deployments where the gateway itself is
/// already scoped.
pub struct StaticBroker {
    jobs: JobServiceRef,
    compute: ComputeServiceRef,
}

impl StaticBroker {
    pub fn new(jobs: JobServiceRef, compute: ComputeServiceRef) -> Self {
        Self { jobs, compute }
    }
}

#[async_trait]
impl CredentialBroker for StaticBroker {
    async fn resolve(&self, context: &AccountContext) -> ProviderResult<ProviderClients> {
        Ok(ProviderClients {
            jobs: self.jobs.clone(),
            compute: self.compute.clone(),
            scope: CredentialScope::Account {
                account_id: context.account_id.clone(),
            },
        })
    }

    fn caller_clients(&self) -> ProviderClients {
        ProviderClients {
            jobs: self.jobs.clone(),
            compute: self.compute.clone(),
            scope: CredentialScope::CallerFallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::providers::MockProvider;

    #[tokio::test]
    async fn test_missing_context_falls_back_to_caller() {
        let provider = Arc::new(MockProvider::new());
        let broker = StaticBroker::new(provider.clone(), provider);

        let clients = resolve_clients(&broker, None).await.unwrap();
        assert!(clients.scope.is_fallback());

        let ctx = AccountContext::current("111122223333");
        let clients = resolve_clients(&broker, Some(&ctx)).await.unwrap();
        assert_eq!(
            clients.scope,
            CredentialScope::Account {
                account_id: "111122223333".to_string()
            }
        );
    }
}
