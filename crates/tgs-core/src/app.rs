use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use crate::{
    command::StatsRecorder,
    config::{RelevanceConfig, ScannerConfig},
    filter::RelevanceFilter,
    ports::{OcrEngine, ResponseGenerator, TelegramClient},
    processor::MessageProcessor,
    resilience::{ErrorHandler, HealthMonitor, RateLimiter},
    responder::AiResponder,
    scanner::{GroupScanner, ScannerParts},
    storage::StorageManager,
    Result,
};

/// External services the application is wired to.
pub struct Ports {
    pub telegram: Arc<dyn TelegramClient>,
    pub ocr: Option<Arc<dyn OcrEngine>>,
    pub generator: Option<Arc<dyn ResponseGenerator>>,
}

/// Components built on first `start`.
#[derive(Clone)]
pub struct Components {
    pub storage: Arc<StorageManager>,
    pub processor: Arc<MessageProcessor>,
    pub scanner: GroupScanner,
    pub responder: Option<Arc<AiResponder>>,
}

/// Owns the process-wide shared instances and builds the rest lazily.
pub struct ScannerApp {
    cfg: ScannerConfig,
    ports: Ports,
    errors: Arc<ErrorHandler>,
    rate_limiter: Arc<RateLimiter>,
    health: Arc<HealthMonitor>,
    stats: Arc<StatsRecorder>,
    filter: Arc<RelevanceFilter>,
    components: OnceCell<Components>,
}

impl ScannerApp {
    pub fn new(cfg: ScannerConfig, ports: Ports) -> Self {
        let errors = Arc::new(ErrorHandler::new(cfg.rate_limiting.retry_policy()));
        Self::with_error_handler(cfg, ports, errors)
    }

    /// Use when an adapter was built against the same handler before the app.
    pub fn with_error_handler(
        cfg: ScannerConfig,
        ports: Ports,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::per_minute(
            cfg.rate_limiting.requests_per_minute,
        ));
        let filter = Arc::new(RelevanceFilter::new(&cfg.relevance));
        Self {
            cfg,
            ports,
            errors,
            rate_limiter,
            health: Arc::new(HealthMonitor::new()),
            stats: Arc::new(StatsRecorder::default()),
            filter,
            components: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.cfg
    }

    pub fn telegram(&self) -> &Arc<dyn TelegramClient> {
        &self.ports.telegram
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn stats(&self) -> &Arc<StatsRecorder> {
        &self.stats
    }

    pub fn filter(&self) -> &Arc<RelevanceFilter> {
        &self.filter
    }

    /// `None` until the first successful `initialize`.
    pub fn components(&self) -> Option<&Components> {
        self.components.get()
    }

    pub async fn initialize(&self) -> Result<&Components> {
        self.components
            .get_or_try_init(|| self.build())
            .await
    }

    async fn build(&self) -> Result<Components> {
        let storage = Arc::new(StorageManager::new(
            self.cfg.scanning.storage_file.clone(),
            self.health.clone(),
        ));
        storage.initialize().await;

        let processor = Arc::new(MessageProcessor::new(
            self.ports.ocr.clone(),
            self.rate_limiter.clone(),
            self.health.clone(),
            self.errors.clone(),
        ));

        let responder = match (&self.ports.generator, self.cfg.ai_responder.enabled) {
            (Some(generator), true) => Some(Arc::new(AiResponder::new(
                self.cfg.ai_responder.clone(),
                generator.clone(),
                self.ports.telegram.clone(),
                self.health.clone(),
            ))),
            _ => None,
        };

        let scanner = GroupScanner::new(ScannerParts {
            cfg: self.cfg.scanning.clone(),
            client: self.ports.telegram.clone(),
            processor: processor.clone(),
            filter: self.filter.clone(),
            storage: storage.clone(),
            responder: responder.clone(),
            stats: self.stats.clone(),
            errors: self.errors.clone(),
            health: self.health.clone(),
        });

        info!(
            ocr = self.ports.ocr.is_some(),
            ai = responder.is_some(),
            "scanner components initialized"
        );
        Ok(Components {
            storage,
            processor,
            scanner,
            responder,
        })
    }

    /// Hot-swap the relevance criteria; running workers pick them up on
    /// their next message.
    pub fn reload_filter(&self, relevance: &RelevanceConfig) {
        self.filter.update_config(relevance);
    }
}
