/**
 * RESTART HISTORY - Journal persistant des tentatives de récupération
 *
 * RÔLE :
 * Garde une trace append-only de chaque récupération (début, fin, succès,
 * raison, erreur) pour les statistiques opérateur.
 *
 * FONCTIONNEMENT :
 * - Fichier JSON `restart_history.json`, réécrit atomiquement (tmp + rename)
 * - Une seule entrée "ouverte" (sans end time) à la fois
 * - Cache mémoire de la dernière liste valide si le disque flanche
 * - Les erreurs disque sont loggées, jamais propagées
 */

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

pub const HISTORY_FILE: &str = "restart_history.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartHistoryEntry {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub success: bool,
    pub trigger_reason: Option<String>,
    pub error_message: Option<String>,
}

impl RestartHistoryEntry {
    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

pub struct RestartHistoryStore {
    path: PathBuf,
    cache: Mutex<Vec<RestartHistoryEntry>>,
    /// Cleared after a failed read: the cache is served until the next good write
    disk_ok: AtomicBool,
}

impl RestartHistoryStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        let path = data_dir.as_ref().join(HISTORY_FILE);
        let store = Self {
            path,
            cache: Mutex::new(Vec::new()),
            disk_ok: AtomicBool::new(true),
        };
        let count = store.load(&mut store.cache.lock()).len();
        debug!("restart history at {:?} ({} entries)", store.path, count);
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Relit le disque; après un échec, retourne le cache sans relire
    fn load(&self, cache: &mut Vec<RestartHistoryEntry>) -> Vec<RestartHistoryEntry> {
        if !self.disk_ok.load(Ordering::SeqCst) {
            return cache.clone();
        }
        if !self.path.exists() {
            cache.clear();
            return Vec::new();
        }
        let read = fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<Vec<RestartHistoryEntry>>(&raw).map_err(|e| e.to_string()));
        match read {
            Ok(entries) => {
                *cache = entries.clone();
                entries
            }
            Err(e) => {
                warn!("restart history unreadable ({}), using cached list until next write", e);
                self.disk_ok.store(false, Ordering::SeqCst);
                cache.clone()
            }
        }
    }

    fn save(&self, cache: &mut Vec<RestartHistoryEntry>, entries: Vec<RestartHistoryEntry>) {
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(&entries)?;
            let tmp = self.path.with_extension("json.tmp");
            fs::write(&tmp, json)?;
            fs::rename(&tmp, &self.path)
        })();
        match result {
            Ok(()) => self.disk_ok.store(true, Ordering::SeqCst),
            Err(e) => warn!("failed to persist restart history: {}", e),
        }
        *cache = entries;
    }

    /// Open a new entry. A dangling open entry (crashed run) is closed first.
    pub fn begin_attempt(&self, reason: Option<&str>) {
        let mut cache = self.cache.lock();
        let mut entries = self.load(&mut cache);

        if let Some(last) = entries.last_mut().filter(|e| e.is_open()) {
            last.end_time = Some(Utc::now());
            last.success = false;
            last.error_message = Some("interrupted".to_string());
        }

        entries.push(RestartHistoryEntry {
            start_time: Utc::now(),
            end_time: None,
            success: false,
            trigger_reason: reason.map(str::to_string),
            error_message: None,
        });
        self.save(&mut cache, entries);
    }

    /// Close the open entry; no-op when the latest entry is already closed
    pub fn end_attempt(&self, success: bool, error_message: Option<&str>) {
        let mut cache = self.cache.lock();
        let mut entries = self.load(&mut cache);

        let Some(last) = entries.last_mut().filter(|e| e.is_open()) else {
            return;
        };
        last.end_time = Some(Utc::now());
        last.success = success;
        last.error_message = error_message.map(str::to_string);
        self.save(&mut cache, entries);
    }

    /// Up to `n` entries, newest first
    pub fn recent(&self, n: usize) -> Vec<RestartHistoryEntry> {
        let mut cache = self.cache.lock();
        let mut entries = self.load(&mut cache);
        // tri stable : à égalité, la dernière ajoutée passe devant
        entries.reverse();
        entries.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        entries.truncate(n);
        entries
    }

    pub fn total_count(&self) -> usize {
        let mut cache = self.cache.lock();
        self.load(&mut cache).len()
    }

    pub fn success_count(&self) -> usize {
        let mut cache = self.cache.lock();
        self.load(&mut cache)
            .iter()
            .filter(|e| !e.is_open() && e.success)
            .count()
    }

    /// Over closed entries only; 0.0 when none is closed
    pub fn success_rate(&self) -> f64 {
        let mut cache = self.cache.lock();
        let entries = self.load(&mut cache);
        let closed: Vec<_> = entries.iter().filter(|e| !e.is_open()).collect();
        if closed.is_empty() {
            return 0.0;
        }
        closed.iter().filter(|e| e.success).count() as f64 / closed.len() as f64
    }

    pub fn clear(&self) {
        let mut cache = self.cache.lock();
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to delete restart history: {}", e);
            }
        }
        cache.clear();
        self.disk_ok.store(true, Ordering::SeqCst);
    }
}
