/**
 * CONTEXTE PARTAGÉ - Tout ce que le moniteur et l'orchestrateur partagent
 *
 * RÔLE :
 * Un seul objet, cloné par Arc, qui porte la config, l'exécuteur driver,
 * les stores et le flag "récupération en cours". Pas d'état global statique.
 *
 * FONCTIONNEMENT :
 * - `WatchdogContext::new` câble les implémentations réelles
 *   (Alpaca, ping système, sysinfo)
 * - `with_*` remplace une dépendance (tests, diagnostics)
 */

use anyhow::{Context, Result};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::WatchdogConfig;
use crate::driver::{AlpacaDriverFactory, DriverFactory};
use crate::encoder_cache::EncoderCache;
use crate::executor::DriverExecutor;
use crate::history::RestartHistoryStore;
use crate::metrics::HealthMetricsTracker;
use crate::probe::{PingProbe, Probe};
use crate::process::{ProcessControl, SystemProcessControl};
use crate::restart_log::RestartLog;
use crate::signals::ConsumerSignals;
use crate::switch_cache::AuxiliarySwitchCache;

#[derive(Clone)]
pub struct WatchdogContext {
    pub config: Arc<WatchdogConfig>,
    pub executor: Arc<DriverExecutor>,
    pub drivers: Arc<dyn DriverFactory>,
    pub processes: Arc<dyn ProcessControl>,
    pub probe: Arc<dyn Probe>,
    pub switch_cache: Arc<AuxiliarySwitchCache>,
    pub metrics: Arc<HealthMetricsTracker>,
    pub history: Arc<RestartHistoryStore>,
    pub signals: Arc<ConsumerSignals>,
    pub encoder: Arc<EncoderCache>,
    pub restart_log: Arc<RestartLog>,
    /// Set by the monitor for the whole duration of a recovery
    pub recovering: Arc<AtomicBool>,
}

impl WatchdogContext {
    pub fn new(config: WatchdogConfig) -> Result<Self> {
        let executor = Arc::new(DriverExecutor::new().context("starting driver executor thread")?);
        let drivers: Arc<dyn DriverFactory> =
            Arc::new(AlpacaDriverFactory::new(config.recovery.http_timeout()));
        let switch_cache = Arc::new(AuxiliarySwitchCache::new(executor.clone(), drivers.clone()));
        let signals = ConsumerSignals::open(&config.signals)
            .with_context(|| format!("opening signal directory {}", config.signals.dir.display()))?;

        Ok(Self {
            executor,
            drivers,
            processes: Arc::new(SystemProcessControl),
            probe: Arc::new(PingProbe),
            switch_cache,
            metrics: Arc::new(HealthMetricsTracker::new(config.probe.metrics_capacity)),
            history: Arc::new(RestartHistoryStore::new(&config.storage.data_dir)),
            signals: Arc::new(signals),
            encoder: Arc::new(EncoderCache::new(&config.storage.data_dir)),
            restart_log: Arc::new(RestartLog::new(config.storage.log_dir())),
            recovering: Arc::new(AtomicBool::new(false)),
            config: Arc::new(config),
        })
    }

    /// Swap the driver factory; the switch cache is rebuilt on top of it.
    pub fn with_drivers(mut self, drivers: Arc<dyn DriverFactory>) -> Self {
        self.switch_cache = Arc::new(AuxiliarySwitchCache::new(self.executor.clone(), drivers.clone()));
        self.drivers = drivers;
        self
    }

    pub fn with_processes(mut self, processes: Arc<dyn ProcessControl>) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(std::sync::atomic::Ordering::SeqCst)
    }
}
