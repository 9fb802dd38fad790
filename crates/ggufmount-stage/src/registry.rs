//! The mount registry: live mounts keyed by id, one lock per mount.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use ggufmount_codec::ArchiveModel;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{MountError, Result};
use crate::materializer;
use crate::mount::{MountId, MountState, VirtualMount};

#[derive(Debug)]
struct MountSlot {
    mount: Mutex<VirtualMount>,
}

impl MountSlot {
    fn new(mount: VirtualMount) -> Arc<Self> {
        Arc::new(Self { mount: Mutex::new(mount) })
    }

    /// Non-blocking lock. A poisoned lock is recovered: documents are
    /// re-read from disk before every use.
    fn try_lock(&self) -> Option<MutexGuard<'_, VirtualMount>> {
        match self.mount.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VirtualMount> {
        self.mount.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Listing row for one mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountInfo {
    pub id: MountId,
    pub root: PathBuf,
    pub source_path: PathBuf,
    /// `None` while another operation holds the mount.
    pub state: Option<MountState>,
}

/// Owns every live mount. `Send + Sync`; share it behind an `Arc` to work on
/// distinct mounts from several threads.
#[derive(Debug, Default)]
pub struct MountRegistry {
    slots: Mutex<BTreeMap<MountId, Arc<MountSlot>>>,
    /// Destinations being staged. Staging writes files, so it runs without
    /// the `slots` lock held.
    staging: Mutex<BTreeSet<MountId>>,
}

/// Claim on a destination while it is staged; released on drop.
struct Reservation<'a> {
    registry: &'a MountRegistry,
    id: MountId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.registry.staging().remove(&self.id);
    }
}

impl MountRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<MountId, Arc<MountSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn staging(&self) -> MutexGuard<'_, BTreeSet<MountId>> {
        self.staging.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, id: &MountId) -> Result<Arc<MountSlot>> {
        self.slots().get(id).cloned().ok_or_else(|| MountError::MountNotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    pub fn contains(&self, id: &MountId) -> bool {
        self.slots().contains_key(id)
    }

    /// Stage `source` at `destination` and register the mount.
    ///
    /// Fails with [`MountError::DestinationConflict`] if the destination is
    /// already registered and not discarded, or is being staged by another
    /// caller. Other mounts stay usable while this one is staged.
    pub fn mount(
        &self,
        source: Arc<ArchiveModel>,
        source_path: &Path,
        destination: &Path,
    ) -> Result<MountId> {
        fs::create_dir_all(destination).map_err(|e| MountError::io(destination, e))?;
        let id = MountId::for_destination(destination).map_err(|e| MountError::io(destination, e))?;

        let reservation = self.reserve(&id, destination)?;
        let mount = materializer::stage(source, source_path, destination)?;

        // lock order: slots, then staging
        let mut slots = self.slots();
        slots.insert(id.clone(), MountSlot::new(mount));
        drop(reservation);
        drop(slots);
        info!(mount = %id, "registered mount");
        Ok(id)
    }

    /// Claim `id` for staging unless a live mount or another stager holds it.
    fn reserve(&self, id: &MountId, destination: &Path) -> Result<Reservation<'_>> {
        let slots = self.slots();
        if let Some(existing) = slots.get(id) {
            let live = existing.try_lock().is_none_or(|m| m.state() != MountState::Discarded);
            if live {
                return Err(MountError::DestinationConflict(destination.to_path_buf()));
            }
        }
        if !self.staging().insert(id.clone()) {
            return Err(MountError::DestinationConflict(destination.to_path_buf()));
        }
        debug!(mount = %id, "reserved destination");
        Ok(Reservation { registry: self, id: id.clone() })
    }

    /// Register an already staged mount (used when restoring a session).
    pub fn insert(&self, mount: VirtualMount) -> Result<MountId> {
        let id = mount.id().clone();
        let mut slots = self.slots();
        if slots.contains_key(&id) || self.staging().contains(&id) {
            return Err(MountError::DestinationConflict(mount.root().to_path_buf()));
        }
        slots.insert(id.clone(), MountSlot::new(mount));
        Ok(id)
    }

    /// Resolve a user-supplied mount reference: a registered id, or a path
    /// that canonicalises to one.
    pub fn resolve(&self, reference: &str) -> Result<MountId> {
        let raw = MountId::from_raw(reference);
        if self.contains(&raw) {
            return Ok(raw);
        }
        match MountId::for_destination(Path::new(reference)) {
            Ok(id) if self.contains(&id) => Ok(id),
            _ => Err(MountError::MountNotFound(reference.to_owned())),
        }
    }

    /// Run `f` with exclusive access to one mount.
    ///
    /// Fails with [`MountError::MountBusy`] instead of waiting if the mount
    /// is already held.
    pub fn with_mount<R, E>(
        &self,
        id: &MountId,
        f: impl FnOnce(&mut VirtualMount) -> std::result::Result<R, E>,
    ) -> std::result::Result<R, E>
    where
        E: From<MountError>,
    {
        let slot = self.slot(id)?;
        let Some(mut guard) = slot.try_lock() else {
            return Err(MountError::MountBusy(id.clone()).into());
        };
        f(&mut guard)
    }

    pub fn list(&self) -> Vec<MountInfo> {
        let slots: Vec<_> = self.slots().iter().map(|(id, s)| (id.clone(), s.clone())).collect();
        slots
            .into_iter()
            .map(|(id, slot)| match slot.try_lock() {
                Some(m) => MountInfo {
                    id,
                    root: m.root().to_path_buf(),
                    source_path: m.source_path().to_path_buf(),
                    state: Some(m.state()),
                },
                None => MountInfo {
                    root: PathBuf::from(id.as_str()),
                    id,
                    source_path: PathBuf::new(),
                    state: None,
                },
            })
            .collect()
    }

    /// Visit every mount with a blocking lock, in id order.
    pub fn for_each(&self, mut f: impl FnMut(&VirtualMount)) {
        let slots: Vec<_> = self.slots().values().cloned().collect();
        for slot in slots {
            f(&slot.lock());
        }
    }

    /// Remove one mount's staged files and mark it `Discarded`. The entry
    /// stays listed until [`cleanup`](Self::cleanup).
    pub fn discard(&self, id: &MountId) -> Result<()> {
        self.with_mount(id, |m| {
            if m.state() == MountState::Discarded {
                return Ok(());
            }
            m.remove_artifacts()?;
            m.transition(MountState::Discarded)?;
            info!(mount = %id, "discarded mount");
            Ok(())
        })
    }

    /// Remove artifacts and registry entries of mounts not in use.
    ///
    /// `Saved` and `Discarded` mounts are always cleaned; `Staged` and
    /// `Modified` ones only with `force`. Busy mounts are skipped.
    pub fn cleanup(&self, force: bool) -> Vec<MountId> {
        let slots: Vec<_> = self.slots().iter().map(|(id, s)| (id.clone(), s.clone())).collect();
        let mut removed = Vec::new();
        for (id, slot) in slots {
            let Some(mut mount) = slot.try_lock() else {
                debug!(mount = %id, "cleanup skipped busy mount");
                continue;
            };
            if !force && !mount.state().is_terminal() {
                debug!(mount = %id, state = %mount.state(), "cleanup kept live mount");
                continue;
            }
            if let Err(e) = mount.remove_artifacts() {
                warn!(mount = %id, error = %e, "cleanup could not remove artifacts");
                continue;
            }
            if mount.state() != MountState::Discarded {
                // Only fails for an already-discarded mount, excluded above.
                let _ = mount.transition(MountState::Discarded);
            }
            drop(mount);
            removed.push(id);
        }

        let mut slots = self.slots();
        for id in &removed {
            slots.remove(id);
        }
        info!(removed = removed.len(), force, "cleanup finished");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<MountRegistry>();
    }

    #[test]
    fn unknown_id_is_not_found() {
        let reg = MountRegistry::new();
        let err = reg.with_mount(&MountId::from_raw("/nope"), |_| Ok::<_, MountError>(())).unwrap_err();
        assert!(matches!(err, MountError::MountNotFound(_)));
        assert!(matches!(reg.resolve("/nope"), Err(MountError::MountNotFound(_))));
    }
}
