//! Capabilities shared by the controller, the scheduler and the reconciler.

use std::sync::Arc;

use crate::db::ExecutionStore;
use crate::notify::Notifier;
use crate::providers::CredentialBroker;
use crate::quota::QuotaGuard;
use crate::scheduler::SchedulerSettings;

/// Everything the core needs from the outside world, built once at
/// startup and handed to each component.
#[derive(Clone)]
pub struct Capabilities {
    inner: Arc<CapabilitiesInner>,
}

struct CapabilitiesInner {
    store: Arc<dyn ExecutionStore>,
    broker: Arc<dyn CredentialBroker>,
    notifier: Arc<dyn Notifier>,
    quota: QuotaGuard,
    scheduler: SchedulerSettings,
}

impl Capabilities {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        broker: Arc<dyn CredentialBroker>,
        notifier: Arc<dyn Notifier>,
        quota: QuotaGuard,
        scheduler: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CapabilitiesInner {
                store,
                broker,
                notifier,
                quota,
                scheduler,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.inner.store
    }

    pub fn broker(&self) -> &Arc<dyn CredentialBroker> {
        &self.inner.broker
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.inner.notifier
    }

    pub fn quota(&self) -> &QuotaGuard {
        &self.inner.quota
    }

    pub fn scheduler_settings(&self) -> &SchedulerSettings {
        &self.inner.scheduler
    }
}
