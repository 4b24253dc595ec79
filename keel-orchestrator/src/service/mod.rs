//! Service Module
//!
//! Business logic layer of the progression engine.
//! Services orchestrate between repositories and collaborators and contain
//! the deployment domain logic.

pub mod composer;
pub mod ingress;
pub mod journal;
pub mod metrics;
pub mod notify;
pub mod publisher;
pub mod status;
pub mod sweeper;
pub mod timeline;
pub mod trigger;
pub mod variables;

use std::sync::Arc;

use keel_core::collab::{ChartRegistry, ClusterClient, GitOpsClient, Notifier};

use crate::config::EngineConfig;
use crate::repository::Stores;

use self::composer::Composer;
use self::ingress::ReconcilerIngress;
use self::journal::ReleaseJournal;
use self::metrics::CdMetrics;
use self::notify::CdEventDispatcher;
use self::publisher::ManifestPublisher;
use self::status::StatusProjector;
use self::sweeper::TimeoutSweeper;
use self::timeline::TimelineEngine;
use self::trigger::TriggerService;

/// External systems the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub gitops: Arc<dyn GitOpsClient>,
    pub registry: Arc<dyn ChartRegistry>,
    pub cluster: Arc<dyn ClusterClient>,
    pub notifier: Arc<dyn Notifier>,
}

/// Every service, wired over one store and one set of collaborators
#[derive(Clone)]
pub struct Engine {
    pub composer: Composer,
    pub journal: ReleaseJournal,
    pub publisher: ManifestPublisher,
    pub timeline: TimelineEngine,
    pub trigger: TriggerService,
    pub ingress: ReconcilerIngress,
    pub status: StatusProjector,
    pub sweeper: TimeoutSweeper,
}

impl Engine {
    pub fn new(stores: Stores, collab: Collaborators, config: EngineConfig) -> Self {
        let metrics = CdMetrics::new(config.expose_cd_metrics);
        let events = CdEventDispatcher::new(stores.clone(), collab.notifier);

        let composer = Composer::new(
            stores.clone(),
            collab.cluster,
            config.scoped_variables_enabled,
        );
        let journal = ReleaseJournal::new(&stores);
        let timeline = TimelineEngine::new(stores.clone(), events.clone(), metrics);
        let publisher = ManifestPublisher::new(
            collab.gitops,
            collab.registry,
            stores.users.clone(),
            journal.clone(),
            timeline.clone(),
            config.clone(),
            metrics,
        );
        let trigger = TriggerService::new(
            stores.clone(),
            composer.clone(),
            journal.clone(),
            publisher.clone(),
            timeline.clone(),
            events,
            metrics,
        );
        let ingress =
            ReconcilerIngress::new(stores.clone(), timeline.clone(), config.clone(), metrics);
        let status = StatusProjector::new(stores.clone());
        let sweeper = TimeoutSweeper::new(stores, timeline.clone(), config);

        Self {
            composer,
            journal,
            publisher,
            timeline,
            trigger,
            ingress,
            status,
            sweeper,
        }
    }
}
