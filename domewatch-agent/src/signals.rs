/**
 * SIGNAUX INTER-PROCESSUS - Flags nommés et verrou système
 *
 * RÔLE :
 * Prévenir le consommateur externe (automate d'imagerie) du cycle de vie
 * d'une récupération, recevoir le déclenchement manuel, et garantir qu'une
 * seule récupération tourne sur la machine.
 *
 * FONCTIONNEMENT :
 * - Un flag nommé = un fichier `<nom>.flag` dans le répertoire de signaux
 *   (présent = signalé, absent = non signalé, y compris s'il n'a jamais existé)
 * - Pas d'expiration implicite : set/clear explicites uniquement
 * - Verrou système = fichier `<nom>.lock` tenu par flock() exclusif (unix)
 *   ou ouvert sans partage (windows), relâché à la fermeture
 * - La raison d'un échec est écrite à côté du flag "complete"
 */

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SignalsConfig;

const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Noms de fichiers sûrs sur toutes les plateformes (`Global\X` → `Global_X`)
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

/// Named, settable/clearable boolean visible to every process on the machine.
#[derive(Debug, Clone)]
pub struct NamedFlag {
    name: String,
    path: PathBuf,
}

impl NamedFlag {
    /// Open (or create) the flag `name` under `dir`, creating `dir` if needed.
    pub fn open(dir: &Path, name: &str) -> Result<Self, SignalError> {
        fs::create_dir_all(dir)?;
        Ok(Self::at(dir, name))
    }

    /// Reader-side handle; the flag need not exist.
    pub fn at(dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(format!("{}.flag", file_stem(name))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self) -> Result<(), SignalError> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), SignalError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Blocks the calling thread until set or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_set() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(POLL.min(deadline - now));
        }
    }

    pub async fn wait_async(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_set() {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(POLL.min(deadline - now)).await;
        }
    }
}

/// System-wide mutual exclusion, acquired without blocking.
#[derive(Debug, Clone)]
pub struct NamedLock {
    path: PathBuf,
}

/// Lock held until dropped.
#[derive(Debug)]
pub struct NamedLockGuard {
    _file: File,
    path: PathBuf,
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        debug!("released lock {:?}", self.path);
    }
}

impl NamedLock {
    pub fn open(dir: &Path, name: &str) -> Result<Self, SignalError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(format!("{}.lock", file_stem(name))),
        })
    }

    /// `Ok(None)` when another holder (any process) has it.
    pub fn try_acquire(&self) -> Result<Option<NamedLockGuard>, SignalError> {
        Ok(try_lock_file(&self.path)?.map(|file| NamedLockGuard {
            _file: file,
            path: self.path.clone(),
        }))
    }
}

#[cfg(unix)]
fn try_lock_file(path: &Path) -> io::Result<Option<File>> {
    use nix::errno::Errno;
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new().create(true).write(true).truncate(false).open(path)?;
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(Some(file)),
        Err(e) if e == Errno::EWOULDBLOCK => Ok(None),
        Err(e) => Err(io::Error::from(e)),
    }
}

#[cfg(windows)]
fn try_lock_file(path: &Path) -> io::Result<Option<File>> {
    use std::os::windows::fs::OpenOptionsExt;

    const ERROR_SHARING_VIOLATION: i32 = 32;
    match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .share_mode(0)
        .open(path)
    {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.raw_os_error() == Some(ERROR_SHARING_VIOLATION) => Ok(None),
        Err(e) => Err(e),
    }
}

/// What a consumer process sees from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryState {
    /// Neither flag exists
    Idle,
    /// "started" set, "complete" absent
    InProgress,
    Finished { failure: Option<String> },
}

/// Recovery lifecycle flags shared with the external consumer.
pub struct ConsumerSignals {
    started: NamedFlag,
    complete: NamedFlag,
    pause_requested: NamedFlag,
    resume_requested: NamedFlag,
    reason_path: PathBuf,
    recovering: AtomicBool,
    last_reason: Mutex<Option<String>>,
}

fn reason_path(dir: &Path, complete: &str) -> PathBuf {
    dir.join(format!("{}.reason", file_stem(complete)))
}

impl ConsumerSignals {
    /// Open all four flags. Their current state is left as is: another
    /// process may be in the middle of a recovery.
    pub fn open(config: &SignalsConfig) -> Result<Self, SignalError> {
        let dir = config.dir.as_path();
        Ok(Self {
            started: NamedFlag::open(dir, &config.started)?,
            complete: NamedFlag::open(dir, &config.complete)?,
            pause_requested: NamedFlag::open(dir, &config.pause_requested)?,
            resume_requested: NamedFlag::open(dir, &config.resume_requested)?,
            reason_path: reason_path(dir, &config.complete),
            recovering: AtomicBool::new(false),
            last_reason: Mutex::new(None),
        })
    }

    /// Reset every flag to "not signaled". Only the long-running service
    /// calls this, once, before its monitor starts.
    pub fn reset_stale(&self) -> Result<(), SignalError> {
        self.started.clear()?;
        self.complete.clear()?;
        self.pause_requested.clear()?;
        self.resume_requested.clear()?;
        remove_quietly(&self.reason_path);
        debug!("consumer flags reset");
        Ok(())
    }

    pub fn signal_start(&self) -> Result<(), SignalError> {
        self.recovering.store(true, Ordering::SeqCst);
        *self.last_reason.lock() = None;
        remove_quietly(&self.reason_path);
        self.complete.clear()?;
        self.started.set()?;
        info!("📣 consumer notified: recovery started");
        Ok(())
    }

    pub fn signal_complete(&self) -> Result<(), SignalError> {
        self.finish()?;
        info!("📣 consumer notified: recovery complete");
        Ok(())
    }

    pub fn signal_failed(&self, reason: &str) -> Result<(), SignalError> {
        *self.last_reason.lock() = Some(reason.to_string());
        if let Err(e) = fs::write(&self.reason_path, reason) {
            warn!("could not write failure reason: {}", e);
        }
        self.finish()?;
        warn!("📣 consumer notified: recovery failed ({})", reason);
        Ok(())
    }

    // "complete" avant de retirer "started" : un lecteur ne voit jamais Idle au milieu
    fn finish(&self) -> Result<(), SignalError> {
        self.recovering.store(false, Ordering::SeqCst);
        self.complete.set()?;
        self.started.clear()?;
        Ok(())
    }

    /// Blocks up to `timeout` for the consumer's pause request.
    pub fn wait_for_consumer_pause(&self, timeout: Duration) -> bool {
        self.pause_requested.wait(timeout)
    }

    pub fn signal_consumer_resume(&self) -> Result<(), SignalError> {
        self.resume_requested.set()?;
        self.pause_requested.clear()?;
        Ok(())
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    pub fn last_failure_reason(&self) -> Option<String> {
        self.last_reason.lock().clone()
    }

    /// Consumer side: classify the recovery state from the flags alone.
    pub fn observe(config: &SignalsConfig) -> RecoveryState {
        let dir = config.dir.as_path();
        let started = NamedFlag::at(dir, &config.started);
        let complete = NamedFlag::at(dir, &config.complete);

        if complete.is_set() {
            let failure = fs::read_to_string(reason_path(dir, &config.complete)).ok();
            RecoveryState::Finished { failure }
        } else if started.is_set() {
            RecoveryState::InProgress
        } else {
            RecoveryState::Idle
        }
    }

    /// Consumer side: ask the watchdog side to consider us paused-on-request.
    pub fn request_pause(config: &SignalsConfig) -> Result<(), SignalError> {
        let dir = config.dir.as_path();
        NamedFlag::open(dir, &config.resume_requested)?.clear()?;
        NamedFlag::open(dir, &config.pause_requested)?.set()
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("could not remove {:?}: {}", path, e);
        }
    }
}
