//! Explicitly constructed application context.
//!
//! Repositories, buses, engines, and registries are built once here and
//! threaded through; nothing in the crate owns hidden global state. This
//! is also what lets several runs share one process and lets tests swap
//! the LLM client and the browser factory.

use std::sync::Arc;

use tracing::info;

use crate::beliefs::BeliefEngine;
use crate::browser::{SessionFactory, SessionRegistry, WebDriverSessionFactory};
use crate::config::NoemaConfig;
use crate::decision::TestCredentials;
use crate::identity::IdentityService;
use crate::llm::LlmClient;
use crate::narration::{CredentialMasker, NarrationBus};
use crate::optimizer::ExperienceOptimizer;
use crate::planner::PlanGenerator;
use crate::runner::{ImprovementAnalyzer, RunRegistry};
use crate::semantic::CogneeClient;
use crate::sensing::{ObservationBus, Sensing};
use crate::sequences::SequenceCache;
use crate::store::StoreContext;

pub struct NoemaContext {
    pub config: NoemaConfig,
    pub store: Arc<StoreContext>,
    pub narration: Arc<NarrationBus>,
    pub observation_bus: Arc<ObservationBus>,
    pub sensing: Arc<Sensing>,
    pub beliefs: Arc<BeliefEngine>,
    pub sequences: Arc<SequenceCache>,
    pub planner: Arc<PlanGenerator>,
    pub optimizer: Arc<ExperienceOptimizer>,
    pub improvement: Arc<ImprovementAnalyzer>,
    pub identity: Arc<IdentityService>,
    pub llm: Arc<LlmClient>,
    pub credentials: Arc<TestCredentials>,
    pub sessions: Arc<dyn SessionFactory>,
    pub browsers: Arc<SessionRegistry>,
    pub runs: Arc<RunRegistry>,
}

impl NoemaContext {
    /// Production wiring: provider from config, WebDriver browser factory.
    pub async fn initialize(config: NoemaConfig) -> anyhow::Result<Arc<Self>> {
        let llm = Arc::new(LlmClient::from_config(&config));
        let sessions: Arc<dyn SessionFactory> = Arc::new(WebDriverSessionFactory::new(
            config.webdriver_url.clone(),
            config.data_dir.clone(),
        ));
        Self::initialize_with(config, llm, sessions).await
    }

    /// Wiring with injected seams (tests use a mock provider and scripted
    /// browser sessions).
    pub async fn initialize_with(
        config: NoemaConfig,
        llm: Arc<LlmClient>,
        sessions: Arc<dyn SessionFactory>,
    ) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(StoreContext::open(&config.data_dir)?);
        let narration = Arc::new(NarrationBus::new(CredentialMasker::new(
            config.secret_values(),
        )));
        let semantic = CogneeClient::from_config(&config).map(Arc::new);
        let observation_bus = Arc::new(ObservationBus::new());
        let sensing = Arc::new(Sensing::new(
            store.clone(),
            observation_bus.clone(),
            semantic.clone(),
        ));
        let beliefs = Arc::new(BeliefEngine::new(
            store.clone(),
            llm.clone(),
            narration.clone(),
            semantic,
        ));

        // the belief engine consumes every published observation; its own
        // salience gate decides what actually reaches the LLM
        {
            let beliefs = beliefs.clone();
            observation_bus
                .subscribe(
                    "belief_engine",
                    Arc::new(move |observation| {
                        let beliefs = beliefs.clone();
                        tokio::spawn(async move {
                            if let Err(err) = beliefs.process_observation(&observation).await {
                                tracing::warn!(error = %err, "belief processing failed");
                            }
                        })
                    }),
                )
                .await;
        }

        let credentials = Arc::new(TestCredentials::from_config(&config));
        let context = Arc::new(Self {
            sequences: Arc::new(SequenceCache::new(store.clone())),
            planner: Arc::new(PlanGenerator::new(store.clone(), llm.clone())),
            optimizer: Arc::new(ExperienceOptimizer::new(
                store.clone(),
                llm.clone(),
                narration.clone(),
            )),
            improvement: Arc::new(ImprovementAnalyzer::new(store.clone())),
            identity: Arc::new(IdentityService::new(store.clone())),
            store,
            narration,
            observation_bus,
            sensing,
            beliefs,
            llm,
            credentials,
            sessions,
            browsers: Arc::new(SessionRegistry::new()),
            runs: Arc::new(RunRegistry::new()),
            config,
        });

        info!(
            provider = context.llm.provider_name(),
            data_dir = %context.config.data_dir.display(),
            "context initialised"
        );
        Ok(context)
    }
}
