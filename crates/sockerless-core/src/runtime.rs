//! Runtime facade shared by the HTTP surface.

use crate::event::{Event, EventBus};
use crate::exec::ExecManager;
use crate::image::{normalize_reference, Image};
use crate::manager::{ContainerManager, LifecycleConfig};
use crate::process::ProcessFactory;
use crate::store::Store;
use std::sync::Arc;

/// Store, engines and process factory of one backend.
pub struct Runtime {
    store: Arc<Store>,
    containers: ContainerManager,
    execs: ExecManager,
    factory: Option<Arc<dyn ProcessFactory>>,
}

impl Runtime {
    /// Creates a runtime. Without a factory, create and inspect work but
    /// start and exec fail with factory unavailable.
    #[must_use]
    pub fn new(factory: Option<Arc<dyn ProcessFactory>>, config: LifecycleConfig) -> Self {
        let store = Arc::new(Store::new());
        Self {
            containers: ContainerManager::new(Arc::clone(&store), factory.clone(), config),
            execs: ExecManager::new(Arc::clone(&store), factory.clone()),
            store,
            factory,
        }
    }

    /// The shared store.
    #[must_use]
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Container and image events.
    #[must_use]
    pub fn event_bus(&self) -> &EventBus {
        self.store.events()
    }

    /// Container lifecycle engine.
    #[must_use]
    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    /// Exec engine.
    #[must_use]
    pub fn execs(&self) -> &ExecManager {
        &self.execs
    }

    /// The process factory, if one is configured.
    #[must_use]
    pub fn factory(&self) -> Option<&Arc<dyn ProcessFactory>> {
        self.factory.as_ref()
    }

    /// Driver name reported to clients.
    #[must_use]
    pub fn driver_name(&self) -> &str {
        self.factory.as_ref().map_or("none", |f| f.name())
    }

    /// Registers an image reference. Returns the record and whether it was
    /// new.
    pub fn pull_image(&self, reference: &str) -> (Image, bool) {
        let normalized = normalize_reference(reference);
        match self.store.get_image(&normalized) {
            Ok(image) => (image, false),
            Err(_) => {
                let image = self.store.put_image(Image::from_reference(&normalized));
                tracing::info!(image = %normalized, id = %image.id, "image registered");
                self.store
                    .events()
                    .publish(Event::image("pull", &image.id, &normalized));
                (image, true)
            }
        }
    }

    /// Stops running containers and releases the factory.
    pub async fn shutdown(&self) {
        self.containers.shutdown().await;
    }
}
