//! Cross-process startup synchronization (C8): the first participant for a
//! given key observes `Create`, every participant observes `Use`, and the
//! last one out observes `Destroy` (best-effort).
//!
//! The original implementation pairs a named shared-memory segment with a
//! named semaphore; this crate has no OS-specific shared-memory dependency
//! in its stack, so [`StartupSynchronizer`] is grounded the same way
//! `spec.md` §4.8 allows -- "the specification does not mandate the
//! underlying primitive" -- on a `File`-based advisory lock under the
//! runtime root from [`crate::config::Config`], holding an OS file lock for
//! mutual exclusion and a small refcount file for the first/last detection.
//! See `DESIGN.md` for the Open Question resolution.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::PathBuf,
};

use fs2::FileExt;

use crate::config::Config;

/// The three lifecycle callbacks a participant implements.
pub trait Synchronized {
    /// Called on exactly one participant: the one that finds the shared
    /// resource does not yet exist.
    fn create(&mut self);
    /// Called on every participant, including the one that just ran
    /// `create`.
    fn use_resource(&mut self);
    /// Called, best-effort, on the last participant to release the key.
    fn destroy(&mut self);
}

/// Cross-process `Create`/`Use`/`Destroy` gate keyed by a string, scoped to
/// the configured runtime root and instance so that multiple instances on
/// one host do not interfere with each other.
pub struct StartupSynchronizer {
    lock_path: PathBuf,
    refcount_path: PathBuf,
}

impl StartupSynchronizer {
    pub fn new(config: &Config, key: &str) -> Self {
        if let Some(parent) = config.shared_resource_path(key).parent() {
            let _ = fs::create_dir_all(parent);
        }
        StartupSynchronizer {
            lock_path: config.shared_resource_path(&format!("{key}.lock")),
            refcount_path: config.shared_resource_path(&format!("{key}.refcount")),
        }
    }

    /// Runs the `Create`/`Use` protocol for `participant`, returning a
    /// [`StartupGuard`] that runs `Destroy` (best-effort) when dropped if
    /// this participant turns out to be the last one holding the key.
    ///
    /// Exactly one participant observes `create` -- the one whose advisory
    /// lock acquisition finds the refcount file absent or at zero. Every
    /// participant observes `use_resource` while holding the lock.
    pub fn start(&self, participant: &mut impl Synchronized) -> io::Result<StartupGuard> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;
        lock_file.lock_exclusive()?;

        let count = self.read_refcount().unwrap_or(0);
        if count == 0 {
            participant.create();
        }
        participant.use_resource();
        self.write_refcount(count + 1)?;

        lock_file.unlock()?;
        Ok(StartupGuard {
            lock_path: self.lock_path.clone(),
            refcount_path: self.refcount_path.clone(),
        })
    }

    fn read_refcount(&self) -> io::Result<u64> {
        let mut contents = String::new();
        File::open(&self.refcount_path)?.read_to_string(&mut contents)?;
        contents
            .trim()
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "corrupt refcount file"))
    }

    fn write_refcount(&self, count: u64) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.refcount_path)?;
        write!(file, "{count}")
    }
}

/// Released with [`StartupGuard::release`]. Dropping without releasing
/// leaks the refcount entry, matching the original's behaviour when a
/// participant crashes without an orderly shutdown: the next participant's
/// `Use` still succeeds (the protocol gives no stronger guarantee than
/// best-effort `Destroy`, per `spec.md` §4.8).
pub struct StartupGuard {
    lock_path: PathBuf,
    refcount_path: PathBuf,
}

impl StartupGuard {
    /// Decrements the refcount under the lock; if this was the last
    /// participant, invokes `destroy` on `participant` before removing the
    /// refcount file.
    pub fn release(self, participant: &mut impl Synchronized) -> io::Result<()> {
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;
        lock_file.lock_exclusive()?;

        let mut contents = String::new();
        let count = File::open(&self.refcount_path)
            .and_then(|mut f| f.read_to_string(&mut contents).map(|_| ()))
            .ok()
            .and_then(|_| contents.trim().parse::<u64>().ok())
            .unwrap_or(1);

        if count <= 1 {
            let _ = fs::remove_file(&self.refcount_path);
            participant.destroy();
        } else {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.refcount_path)?;
            write!(file, "{}", count - 1)?;
        }

        lock_file.unlock()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Events(Vec<&'static str>);

    struct Recorder(Arc<Mutex<Events>>);

    impl Synchronized for Recorder {
        fn create(&mut self) {
            self.0.lock().unwrap().0.push("create");
        }
        fn use_resource(&mut self) {
            self.0.lock().unwrap().0.push("use");
        }
        fn destroy(&mut self) {
            self.0.lock().unwrap().0.push("destroy");
        }
    }

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            runtime_root: dir.to_path_buf(),
            instance: "test".into(),
            log_level: 0,
        }
    }

    #[test]
    fn first_participant_creates_every_participant_uses_last_destroys() {
        let dir = tempfile_dir();
        let config = test_config(&dir);
        let sync = StartupSynchronizer::new(&config, "kernel");

        let events = Arc::new(Mutex::new(Events::default()));

        let mut first = Recorder(Arc::clone(&events));
        let guard1 = sync.start(&mut first).unwrap();
        assert_eq!(events.lock().unwrap().0, vec!["create", "use"]);

        let mut second = Recorder(Arc::clone(&events));
        let guard2 = sync.start(&mut second).unwrap();
        assert_eq!(events.lock().unwrap().0, vec!["create", "use", "use"]);

        let mut releasing_first = Recorder(Arc::clone(&events));
        guard1.release(&mut releasing_first).unwrap();
        // Still one participant holding the key: no destroy yet.
        assert_eq!(events.lock().unwrap().0, vec!["create", "use", "use"]);

        let mut releasing_second = Recorder(Arc::clone(&events));
        guard2.release(&mut releasing_second).unwrap();
        assert_eq!(
            events.lock().unwrap().0,
            vec!["create", "use", "use", "destroy"]
        );

        let _ = fs::remove_dir_all(&dir);
    }

    fn tempfile_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "dob-kernel-startup-sync-test-{}-{}",
            std::process::id(),
            next_test_id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn next_test_id() -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    #[test]
    fn rejoining_after_every_participant_released_creates_again() -> anyhow::Result<()> {
        let dir = tempfile_dir();
        let config = test_config(&dir);
        let sync = StartupSynchronizer::new(&config, "kernel");
        let events = Arc::new(Mutex::new(Events::default()));

        let mut first = Recorder(Arc::clone(&events));
        let guard = sync.start(&mut first)?;
        guard.release(&mut Recorder(Arc::clone(&events)))?;
        assert_eq!(events.lock().unwrap().0, vec!["create", "use", "destroy"]);

        let mut rejoining = Recorder(Arc::clone(&events));
        sync.start(&mut rejoining)?;
        assert_eq!(
            events.lock().unwrap().0,
            vec!["create", "use", "destroy", "create", "use"]
        );

        let _ = fs::remove_dir_all(&dir);
        Ok(())
    }
}
