//! Idle-instance garbage collection ("stamps").
//!
//! A stamp says "this backend instance has had nothing open since `time`".
//! Stamps are removed when a handle opens on the instance and created again
//! when its last handle closes. An external periodic timer calls
//! [`Gc::expire`], which frees instances whose stamp is older than the
//! configured timeout.
//!
//! The registry only talks to classes through `nothingisopen` and `free`. It
//! never looks inside an instance.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::class::VfsClass;
use crate::types::{ClassId, VfsId};

/// How often the timer should fire while anything is stamped.
pub const EXPIRE_INTERVAL: Duration = Duration::from_secs(10);

/// Clears the reentrancy flag when an expiry pass ends, even by panic.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One idle instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub class: ClassId,
    pub id: VfsId,
    pub time: Instant,
}

#[derive(Debug, Default)]
struct GcState {
    /// In insertion order.
    stamps: Vec<Stamp>,
    /// The instance holding the current directory. It is never stamped.
    current: Option<(ClassId, VfsId)>,
}

/// The stamp registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct Gc {
    state: Arc<Mutex<GcState>>,
    expiring: Arc<AtomicBool>,
}

impl std::fmt::Debug for Gc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gc")
            .field("stamps", &self.state.lock().stamps.len())
            .finish()
    }
}

impl Gc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the current directory now lives in `current`.
    pub fn set_current(&self, current: Option<(ClassId, VfsId)>) {
        self.state.lock().current = current;
    }

    pub fn current(&self) -> Option<(ClassId, VfsId)> {
        self.state.lock().current
    }

    /// An instance just became unused: stamp it if it really is idle.
    ///
    /// The current directory's instance is unstamped first and never gets a
    /// stamp of its own. `class` must not be holding any lock that its
    /// `nothingisopen` needs.
    pub fn stamp_create(&self, cid: ClassId, class: &dyn VfsClass, id: VfsId) {
        {
            let mut state = self.state.lock();
            if let Some((ccid, cvid)) = state.current {
                state.stamps.retain(|s| !(s.class == ccid && s.id == cvid));
                if (ccid, cvid) == (cid, id) {
                    return;
                }
            }
        }
        if class.nothingisopen(id) {
            self.add(cid, class, id);
        }
    }

    /// Add a stamp, or refresh it if one exists. Local classes are ignored.
    pub fn add(&self, cid: ClassId, class: &dyn VfsClass, id: VfsId) {
        if class.info().is_local() {
            return;
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.stamps.iter_mut().find(|s| s.class == cid && s.id == id) {
            Some(stamp) => stamp.time = now,
            None => state.stamps.push(Stamp {
                class: cid,
                id,
                time: now,
            }),
        }
    }

    /// Touch an existing stamp. Returns whether there was one.
    pub fn stamp(&self, cid: ClassId, id: VfsId) -> bool {
        let mut state = self.state.lock();
        match state.stamps.iter_mut().find(|s| s.class == cid && s.id == id) {
            Some(stamp) => {
                stamp.time = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Remove the stamp for an instance, if any.
    pub fn rmstamp(&self, cid: ClassId, id: VfsId) {
        self.state
            .lock()
            .stamps
            .retain(|s| !(s.class == cid && s.id == id));
    }

    pub fn is_stamped(&self, cid: ClassId, id: VfsId) -> bool {
        self.state
            .lock()
            .stamps
            .iter()
            .any(|s| s.class == cid && s.id == id)
    }

    /// Snapshot of all stamps in insertion order.
    pub fn stamps(&self) -> Vec<Stamp> {
        self.state.lock().stamps.clone()
    }

    /// Free instances that have been idle for at least `timeout`.
    ///
    /// An instance that reports something open is refreshed instead of
    /// freed. With `force` the age and open handles are ignored and stamps
    /// are processed newest first, so an archive opened from inside another
    /// archive goes before its container. Handles left on a freed instance
    /// fail with `BadHandle`.
    ///
    /// Calls made while an expiry is already running return immediately.
    pub fn expire(&self, classes: &[Arc<dyn VfsClass>], force: bool, timeout: Duration) {
        if self.expiring.swap(true, Ordering::Acquire) {
            return;
        }
        let _running = Running(&self.expiring);

        let now = Instant::now();
        let mut due: Vec<Stamp> = self
            .state
            .lock()
            .stamps
            .iter()
            .filter(|s| force || now.saturating_duration_since(s.time) >= timeout)
            .copied()
            .collect();
        if force {
            due.reverse();
        }

        for stamp in due {
            let Some(class) = classes.get(stamp.class.0) else {
                self.rmstamp(stamp.class, stamp.id);
                continue;
            };
            if !force && !class.nothingisopen(stamp.id) {
                tracing::debug!("{}: instance {:?} busy, keeping", class.info().name, stamp.id);
                self.stamp(stamp.class, stamp.id);
                continue;
            }
            tracing::debug!("{}: freeing idle instance {:?}", class.info().name, stamp.id);
            self.rmstamp(stamp.class, stamp.id);
            class.free(stamp.id);
        }
    }

    /// When the periodic timer should fire next, or `None` if nothing waits.
    pub fn next_timeout(&self) -> Option<Duration> {
        if self.state.lock().stamps.is_empty() {
            None
        } else {
            Some(EXPIRE_INTERVAL)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassFlags, ClassInfo};
    use std::sync::atomic::AtomicUsize;

    struct Probe {
        info: ClassInfo,
        busy: AtomicBool,
        freed: AtomicUsize,
        order: Mutex<Vec<VfsId>>,
    }

    impl Probe {
        fn new(flags: ClassFlags) -> Arc<Self> {
            Arc::new(Self {
                info: ClassInfo::new("probe", "probe", flags),
                busy: AtomicBool::new(false),
                freed: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            })
        }
    }

    impl VfsClass for Probe {
        fn info(&self) -> &ClassInfo {
            &self.info
        }

        fn nothingisopen(&self, _id: VfsId) -> bool {
            !self.busy.load(Ordering::SeqCst)
        }

        fn free(&self, id: VfsId) {
            self.freed.fetch_add(1, Ordering::SeqCst);
            self.order.lock().push(id);
        }
    }

    const C: ClassId = ClassId(0);

    #[test]
    fn test_stamp_create_only_when_idle() {
        let gc = Gc::new();
        let probe = Probe::new(ClassFlags::empty());

        probe.busy.store(true, Ordering::SeqCst);
        gc.stamp_create(C, probe.as_ref(), VfsId(1));
        assert!(!gc.is_stamped(C, VfsId(1)));

        probe.busy.store(false, Ordering::SeqCst);
        gc.stamp_create(C, probe.as_ref(), VfsId(1));
        gc.stamp_create(C, probe.as_ref(), VfsId(1));
        assert_eq!(gc.stamps().len(), 1);

        gc.rmstamp(C, VfsId(1));
        assert!(gc.stamps().is_empty());
    }

    #[test]
    fn test_current_location_is_never_stamped() {
        let gc = Gc::new();
        let probe = Probe::new(ClassFlags::empty());

        gc.stamp_create(C, probe.as_ref(), VfsId(7));
        assert!(gc.is_stamped(C, VfsId(7)));

        gc.set_current(Some((C, VfsId(7))));
        gc.stamp_create(C, probe.as_ref(), VfsId(7));
        assert!(!gc.is_stamped(C, VfsId(7)));

        // Leaving another instance still unstamps the current one.
        gc.add(C, probe.as_ref(), VfsId(7));
        gc.stamp_create(C, probe.as_ref(), VfsId(8));
        assert!(!gc.is_stamped(C, VfsId(7)));
        assert!(gc.is_stamped(C, VfsId(8)));
    }

    #[test]
    fn test_local_classes_are_ignored() {
        let gc = Gc::new();
        let probe = Probe::new(ClassFlags::LOCAL);
        gc.stamp_create(C, probe.as_ref(), VfsId(1));
        assert!(gc.stamps().is_empty());
        assert_eq!(gc.next_timeout(), None);
    }

    #[test]
    fn test_expire_frees_idle_and_refreshes_busy() {
        let gc = Gc::new();
        let probe = Probe::new(ClassFlags::empty());
        let classes: Vec<Arc<dyn VfsClass>> = vec![probe.clone()];

        gc.stamp_create(C, probe.as_ref(), VfsId(1));
        assert_eq!(gc.next_timeout(), Some(EXPIRE_INTERVAL));

        // Long timeout: nothing is old enough yet.
        gc.expire(&classes, false, Duration::from_secs(3600));
        assert!(gc.is_stamped(C, VfsId(1)));

        probe.busy.store(true, Ordering::SeqCst);
        let before = gc.stamps()[0].time;
        gc.expire(&classes, false, Duration::ZERO);
        assert_eq!(probe.freed.load(Ordering::SeqCst), 0);
        assert!(gc.stamps()[0].time >= before);

        probe.busy.store(false, Ordering::SeqCst);
        gc.expire(&classes, false, Duration::ZERO);
        assert_eq!(probe.freed.load(Ordering::SeqCst), 1);
        assert!(gc.stamps().is_empty());
    }

    #[test]
    fn test_force_frees_newest_first() {
        let gc = Gc::new();
        let probe = Probe::new(ClassFlags::empty());
        let classes: Vec<Arc<dyn VfsClass>> = vec![probe.clone()];

        // 2 was opened from inside 1.
        gc.stamp_create(C, probe.as_ref(), VfsId(1));
        gc.stamp_create(C, probe.as_ref(), VfsId(2));
        gc.expire(&classes, true, Duration::from_secs(3600));
        assert_eq!(*probe.order.lock(), vec![VfsId(2), VfsId(1)]);
        assert!(gc.stamps().is_empty());
    }

    #[test]
    fn test_force_frees_busy_instances() {
        let gc = Gc::new();
        let probe = Probe::new(ClassFlags::empty());
        let classes: Vec<Arc<dyn VfsClass>> = vec![probe.clone()];

        gc.add(C, probe.as_ref(), VfsId(1));
        probe.busy.store(true, Ordering::SeqCst);
        gc.expire(&classes, true, Duration::from_secs(3600));
        assert_eq!(probe.freed.load(Ordering::SeqCst), 1);
        assert!(gc.stamps().is_empty());
    }

    struct Exploding {
        info: ClassInfo,
    }

    impl VfsClass for Exploding {
        fn info(&self) -> &ClassInfo {
            &self.info
        }

        fn free(&self, _id: VfsId) {
            panic!("free failed");
        }
    }

    #[test]
    fn test_panicking_free_does_not_disable_expiry() {
        let gc = Gc::new();
        let bad: Arc<dyn VfsClass> = Arc::new(Exploding {
            info: ClassInfo::new("bad", "bad", ClassFlags::empty()),
        });
        gc.add(C, bad.as_ref(), VfsId(1));
        let classes = vec![bad];
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            gc.expire(&classes, true, Duration::ZERO);
        }));
        assert!(caught.is_err());

        let probe = Probe::new(ClassFlags::empty());
        let classes: Vec<Arc<dyn VfsClass>> = vec![probe.clone()];
        gc.add(C, probe.as_ref(), VfsId(2));
        gc.expire(&classes, false, Duration::ZERO);
        assert_eq!(*probe.order.lock(), vec![VfsId(2)]);
    }
}
