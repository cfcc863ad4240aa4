//! In-memory registry of containers, images and exec instances.
//!
//! The registry itself sits behind one read-write lock. Each container lives
//! in a [`ContainerCell`] with its own mutex; callers never hold two cell
//! mutexes at once.

use crate::error::{CoreError, ObjectKind, Result};
use crate::event::{Event, EventBus};
use crate::exec::ExecInstance;
use crate::filter::ContainerFilter;
use crate::id::{canonical_name, is_hex, short_id, MIN_PREFIX_LEN};
use crate::image::{normalize_reference, Image};
use crate::logs::LogRing;
use crate::process::ContainerProcess;
use crate::state::{Container, ContainerState};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// Lifecycle event published on every container state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEvent {
    /// New state.
    pub state: ContainerState,
    /// Exit code, set for terminal states.
    pub exit_code: Option<i64>,
    /// Incremented on every start.
    pub generation: u64,
    /// The container has been deleted from the store.
    pub removed: bool,
}

/// Mutable per-container state guarded by the cell mutex.
pub(crate) struct CellState {
    pub(crate) record: Container,
    pub(crate) process: Option<Arc<dyn ContainerProcess>>,
    pub(crate) logs: Option<Arc<LogRing>>,
    pub(crate) generation: u64,
    pub(crate) starting: bool,
    /// The current run was stopped or killed on request.
    pub(crate) stop_requested: bool,
}

/// One container: its record, runtime handles and status channel.
pub struct ContainerCell {
    id: String,
    state: Mutex<CellState>,
    status: watch::Sender<StatusEvent>,
}

impl ContainerCell {
    fn new(record: Container) -> Self {
        let (status, _) = watch::channel(StatusEvent {
            state: record.state,
            exit_code: record.exit_code,
            generation: 0,
            removed: false,
        });
        Self {
            id: record.id.clone(),
            state: Mutex::new(CellState {
                record,
                process: None,
                logs: None,
                generation: 0,
                starting: false,
                stop_requested: false,
            }),
            status,
        }
    }

    /// Container id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CellState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current record.
    #[must_use]
    pub fn snapshot(&self) -> Container {
        self.lock().record.clone()
    }

    /// Current state.
    #[must_use]
    pub fn current_state(&self) -> ContainerState {
        self.lock().record.state
    }

    /// The live process handle, if any.
    #[must_use]
    pub fn process(&self) -> Option<Arc<dyn ContainerProcess>> {
        self.lock().process.clone()
    }

    /// The log ring of the most recent run, if the container ever started.
    #[must_use]
    pub fn logs(&self) -> Option<Arc<LogRing>> {
        self.lock().logs.clone()
    }

    /// Receiver for lifecycle events.
    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Publishes the state held in `state`. Call with the cell lock held so
    /// events are ordered like the mutations they describe.
    pub(crate) fn publish(&self, state: &CellState) {
        let event = StatusEvent {
            state: state.record.state,
            exit_code: state.record.exit_code,
            generation: state.generation,
            removed: false,
        };
        self.status.send_replace(event);
    }

    pub(crate) fn publish_removed(&self) {
        self.status.send_modify(|event| event.removed = true);
    }
}

impl std::fmt::Debug for ContainerCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerCell")
            .field("id", &self.id)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

/// Shared handle to an exec instance record.
#[derive(Debug)]
pub struct ExecCell {
    instance: Mutex<ExecInstance>,
}

impl ExecCell {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ExecInstance> {
        self.instance.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current record.
    #[must_use]
    pub fn snapshot(&self) -> ExecInstance {
        self.lock().clone()
    }
}

/// Container counts for `/info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContainerCounts {
    /// All containers.
    pub total: usize,
    /// Running.
    pub running: usize,
    /// Paused.
    pub paused: usize,
    /// Everything else.
    pub stopped: usize,
}

impl ContainerCounts {
    /// Containers holding a live process.
    #[must_use]
    pub const fn active(&self) -> usize {
        self.running + self.paused
    }
}

/// One step of an image removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageDeletion {
    /// A tag was removed.
    Untagged(String),
    /// The image record was deleted.
    Deleted(String),
}

#[derive(Default)]
struct Registry {
    containers: HashMap<String, Arc<ContainerCell>>,
    names: HashMap<String, String>,
    images: HashMap<String, Image>,
    tags: HashMap<String, String>,
    execs: HashMap<String, Arc<ExecCell>>,
}

impl Registry {
    fn resolve_container(&self, reference: &str) -> Result<&Arc<ContainerCell>> {
        if let Some(cell) = self.containers.get(reference) {
            return Ok(cell);
        }
        if let Some(cell) = self
            .names
            .get(&canonical_name(reference))
            .and_then(|id| self.containers.get(id))
        {
            return Ok(cell);
        }
        if reference.len() >= MIN_PREFIX_LEN && is_hex(reference) {
            let mut matches = self
                .containers
                .iter()
                .filter(|(id, _)| id.starts_with(reference))
                .map(|(_, cell)| cell);
            if let Some(first) = matches.next() {
                return if matches.next().is_none() {
                    Ok(first)
                } else {
                    Err(CoreError::Ambiguous {
                        kind: ObjectKind::Container,
                        id: reference.to_string(),
                    })
                };
            }
        }
        Err(CoreError::container_not_found(reference))
    }

    fn resolve_image_id(&self, reference: &str) -> Result<String> {
        if self.images.contains_key(reference) {
            return Ok(reference.to_string());
        }
        let digest = format!("sha256:{reference}");
        if self.images.contains_key(&digest) {
            return Ok(digest);
        }
        if let Some(id) = self.tags.get(&normalize_reference(reference)) {
            return Ok(id.clone());
        }
        let bare = reference.strip_prefix("sha256:").unwrap_or(reference);
        if bare.len() >= MIN_PREFIX_LEN && is_hex(bare) {
            let mut matches = self
                .images
                .keys()
                .filter(|id| id.trim_start_matches("sha256:").starts_with(bare));
            if let Some(first) = matches.next() {
                return if matches.next().is_none() {
                    Ok(first.clone())
                } else {
                    Err(CoreError::Ambiguous {
                        kind: ObjectKind::Image,
                        id: reference.to_string(),
                    })
                };
            }
        }
        Err(CoreError::image_not_found(reference))
    }
}

/// The in-memory registry.
#[derive(Default)]
pub struct Store {
    registry: RwLock<Registry>,
    events: EventBus,
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus carrying container and image events.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Containers
    // ------------------------------------------------------------------

    /// Inserts a new container.
    ///
    /// # Errors
    ///
    /// Fails with a name conflict if any container holds the name. A name is
    /// held until its container is removed.
    pub fn put_container(&self, container: Container) -> Result<Arc<ContainerCell>> {
        let mut registry = self.write();
        if registry.containers.contains_key(&container.id) {
            return Err(CoreError::internal(format!(
                "duplicate container id {}",
                container.id
            )));
        }
        if let Some(holder) = registry.names.get(&container.name) {
            return Err(CoreError::NameConflict {
                name: container.name.clone(),
                holder: holder.clone(),
            });
        }
        let cell = Arc::new(ContainerCell::new(container));
        let name = cell.lock().record.name.clone();
        registry.names.insert(name, cell.id().to_string());
        registry
            .containers
            .insert(cell.id().to_string(), Arc::clone(&cell));
        Ok(cell)
    }

    /// Resolves a container by full id, name, or unique id prefix of at least
    /// 12 hex characters.
    ///
    /// # Errors
    ///
    /// Fails with not found, or ambiguous when a prefix matches several ids.
    pub fn get_container(&self, reference: &str) -> Result<Arc<ContainerCell>> {
        self.read().resolve_container(reference).map(Arc::clone)
    }

    /// Looks up a container by exact id.
    #[must_use]
    pub fn container_by_id(&self, id: &str) -> Option<Arc<ContainerCell>> {
        self.read().containers.get(id).cloned()
    }

    /// Snapshot of containers matching `filter`, newest first.
    #[must_use]
    pub fn list_containers(&self, filter: &ContainerFilter) -> Vec<Container> {
        let cells: Vec<Arc<ContainerCell>> = self.read().containers.values().cloned().collect();
        let mut containers: Vec<Container> = cells
            .iter()
            .map(|cell| cell.snapshot())
            .filter(|c| filter.matches(c))
            .collect();
        containers.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        containers
    }

    /// Deletes a container record, its name and its exec instances.
    ///
    /// Without `force`, only created and terminal containers may be removed.
    ///
    /// # Errors
    ///
    /// Fails with not found, or a state conflict for an active container.
    pub fn remove_container(&self, reference: &str, force: bool) -> Result<Arc<ContainerCell>> {
        let mut registry = self.write();
        let cell = Arc::clone(registry.resolve_container(reference)?);
        let name = {
            let state = cell.lock();
            if !force && state.record.state.is_active() {
                return Err(CoreError::state_conflict(format!(
                    "You cannot remove a running container {}. Stop the container before \
                     attempting removal or force remove",
                    short_id(cell.id())
                )));
            }
            state.record.name.clone()
        };
        registry.containers.remove(cell.id());
        if registry.names.get(&name).is_some_and(|id| id == cell.id()) {
            registry.names.remove(&name);
        }
        registry
            .execs
            .retain(|_, exec| exec.lock().container_id != cell.id());
        Ok(cell)
    }

    /// Gives a container a new canonical name. Returns the cell and the old
    /// name.
    ///
    /// # Errors
    ///
    /// Fails with not found, a validation error when the name is unchanged,
    /// or a name conflict when another container holds it.
    pub fn rename_container(
        &self,
        reference: &str,
        new_name: &str,
    ) -> Result<(Arc<ContainerCell>, String)> {
        let mut registry = self.write();
        let cell = Arc::clone(registry.resolve_container(reference)?);
        if let Some(holder) = registry.names.get(new_name) {
            if holder == cell.id() {
                return Err(CoreError::validation(format!(
                    "Renaming a container with the same name as its current name: {new_name}"
                )));
            }
            return Err(CoreError::NameConflict {
                name: new_name.to_string(),
                holder: holder.clone(),
            });
        }
        let old_name = {
            let mut state = cell.lock();
            std::mem::replace(&mut state.record.name, new_name.to_string())
        };
        if registry.names.get(&old_name).is_some_and(|id| id == cell.id()) {
            registry.names.remove(&old_name);
        }
        registry
            .names
            .insert(new_name.to_string(), cell.id().to_string());
        Ok((cell, old_name))
    }

    /// Container totals by state.
    #[must_use]
    pub fn container_counts(&self) -> ContainerCounts {
        let cells: Vec<Arc<ContainerCell>> = self.read().containers.values().cloned().collect();
        let mut counts = ContainerCounts {
            total: cells.len(),
            ..ContainerCounts::default()
        };
        for cell in cells {
            match cell.current_state() {
                ContainerState::Running => counts.running += 1,
                ContainerState::Paused => counts.paused += 1,
                _ => counts.stopped += 1,
            }
        }
        counts
    }

    /// All container cells, for shutdown.
    #[must_use]
    pub fn container_cells(&self) -> Vec<Arc<ContainerCell>> {
        self.read().containers.values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Images
    // ------------------------------------------------------------------

    /// Inserts or merges an image record and indexes its tags.
    ///
    /// A tag previously pointing at another image moves to this one.
    pub fn put_image(&self, image: Image) -> Image {
        let mut registry = self.write();
        for tag in &image.tags {
            if let Some(previous) = registry.tags.insert(tag.clone(), image.id.clone()) {
                if previous != image.id {
                    if let Some(old) = registry.images.get_mut(&previous) {
                        old.tags.remove(tag);
                    }
                }
            }
        }
        let stored = registry
            .images
            .entry(image.id.clone())
            .and_modify(|existing| existing.tags.extend(image.tags.iter().cloned()))
            .or_insert(image);
        stored.clone()
    }

    /// Resolves an image by id, digest, tag, or unique id prefix.
    ///
    /// # Errors
    ///
    /// Fails with not found or ambiguous.
    pub fn get_image(&self, reference: &str) -> Result<Image> {
        let registry = self.read();
        let id = registry.resolve_image_id(reference)?;
        registry
            .images
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::image_not_found(reference))
    }

    /// Snapshot of all images, newest first.
    #[must_use]
    pub fn list_images(&self) -> Vec<Image> {
        let mut images: Vec<Image> = self.read().images.values().cloned().collect();
        images.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        images
    }

    /// Adds a tag to an existing image.
    ///
    /// # Errors
    ///
    /// Fails if the source image is unknown.
    pub fn tag_image(&self, reference: &str, new_tag: &str) -> Result<Image> {
        let mut image = self.get_image(reference)?;
        let tag = normalize_reference(new_tag);
        image.tags.clear();
        image.tags.insert(tag.clone());
        let image = self.put_image(image);
        self.events.publish(Event::image("tag", &image.id, &tag));
        Ok(image)
    }

    /// Removes a tag or an image.
    ///
    /// Removing by tag when the image carries other tags only untags it.
    /// Deleting an image still referenced by a container requires `force`.
    ///
    /// # Errors
    ///
    /// Fails with not found, or a conflict when the image is in use.
    pub fn remove_image(&self, reference: &str, force: bool) -> Result<Vec<ImageDeletion>> {
        let steps = self.delete_image(reference, force)?;
        self.publish_deletions(&steps);
        Ok(steps)
    }

    fn delete_image(&self, reference: &str, force: bool) -> Result<Vec<ImageDeletion>> {
        let mut registry = self.write();
        let id = registry.resolve_image_id(reference)?;
        let normalized = normalize_reference(reference);
        let by_tag = registry.tags.get(&normalized) == Some(&id);

        let tag_count = registry.images.get(&id).map_or(0, |i| i.tags.len());
        if by_tag && tag_count > 1 {
            registry.tags.remove(&normalized);
            if let Some(image) = registry.images.get_mut(&id) {
                image.tags.remove(&normalized);
            }
            return Ok(vec![ImageDeletion::Untagged(normalized)]);
        }

        if !force {
            let user = registry
                .containers
                .values()
                .find(|cell| cell.lock().record.image_id == id);
            if let Some(cell) = user {
                return Err(CoreError::state_conflict(format!(
                    "conflict: unable to delete {} - image is being used by container {}",
                    short_id(&id),
                    short_id(cell.id())
                )));
            }
        }

        let Some(image) = registry.images.remove(&id) else {
            return Err(CoreError::image_not_found(reference));
        };
        let mut steps = Vec::with_capacity(image.tags.len() + 1);
        for tag in image.tags {
            registry.tags.remove(&tag);
            steps.push(ImageDeletion::Untagged(tag));
        }
        steps.push(ImageDeletion::Deleted(id));
        Ok(steps)
    }

    /// Deletes images no container refers to. With `dangling_only`, images
    /// that still carry a tag are kept. Returns the steps taken and the bytes
    /// reclaimed.
    pub fn prune_images(&self, dangling_only: bool) -> (Vec<ImageDeletion>, i64) {
        let (steps, reclaimed) = self.delete_unused_images(dangling_only);
        self.publish_deletions(&steps);
        (steps, reclaimed)
    }

    fn delete_unused_images(&self, dangling_only: bool) -> (Vec<ImageDeletion>, i64) {
        let mut registry = self.write();
        let in_use: HashSet<String> = registry
            .containers
            .values()
            .map(|cell| cell.lock().record.image_id.clone())
            .collect();
        let mut victims: Vec<String> = registry
            .images
            .values()
            .filter(|image| !in_use.contains(&image.id))
            .filter(|image| !dangling_only || image.tags.is_empty())
            .map(|image| image.id.clone())
            .collect();
        victims.sort();

        let mut steps = Vec::new();
        let mut reclaimed = 0;
        for id in victims {
            let Some(image) = registry.images.remove(&id) else {
                continue;
            };
            for tag in image.tags {
                registry.tags.remove(&tag);
                steps.push(ImageDeletion::Untagged(tag));
            }
            reclaimed += image.size;
            steps.push(ImageDeletion::Deleted(id));
        }
        (steps, reclaimed)
    }

    fn publish_deletions(&self, steps: &[ImageDeletion]) {
        for step in steps {
            let event = match step {
                ImageDeletion::Untagged(tag) => Event::image("untag", tag, tag),
                ImageDeletion::Deleted(id) => Event::image("delete", id, id),
            };
            self.events.publish(event);
        }
    }

    /// Number of images.
    #[must_use]
    pub fn image_count(&self) -> usize {
        self.read().images.len()
    }

    // ------------------------------------------------------------------
    // Exec instances
    // ------------------------------------------------------------------

    /// Registers an exec instance for an existing container.
    ///
    /// # Errors
    ///
    /// Fails with not found if the parent container is gone.
    pub fn put_exec(&self, instance: ExecInstance) -> Result<Arc<ExecCell>> {
        let mut registry = self.write();
        if !registry.containers.contains_key(&instance.container_id) {
            return Err(CoreError::container_not_found(&instance.container_id));
        }
        let id = instance.id.clone();
        let cell = Arc::new(ExecCell {
            instance: Mutex::new(instance),
        });
        registry.execs.insert(id, Arc::clone(&cell));
        Ok(cell)
    }

    /// Looks up an exec instance, re-resolving its parent.
    ///
    /// # Errors
    ///
    /// Fails with not found if the exec or its parent container is gone.
    pub fn get_exec(&self, id: &str) -> Result<Arc<ExecCell>> {
        let registry = self.read();
        let cell = registry
            .execs
            .get(id)
            .ok_or_else(|| CoreError::exec_not_found(id))?;
        let parent = cell.lock().container_id.clone();
        if !registry.containers.contains_key(&parent) {
            return Err(CoreError::exec_not_found(id));
        }
        Ok(Arc::clone(cell))
    }

    /// Exec ids belonging to a container.
    #[must_use]
    pub fn exec_ids_for(&self, container_id: &str) -> Vec<String> {
        self.read()
            .execs
            .iter()
            .filter(|(_, cell)| cell.lock().container_id == container_id)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
