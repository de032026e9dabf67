//! Snapshot class lookup and default-class selection.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, SnapshotError};
use crate::store::{ListParams, ResourceStore};
use crate::types::{ANN_DEFAULT_SNAPSHOT_CLASS, Resource, SnapshotClass};

/// A class kind that can be marked as the default for its driver.
pub trait DefaultableClass: Resource {
    /// Annotation that marks the default class; its value must be `"true"`.
    const DEFAULT_ANNOTATION: &'static str;

    fn driver(&self) -> &str;

    fn is_default(&self) -> bool {
        self.meta().annotation(Self::DEFAULT_ANNOTATION) == Some("true")
    }
}

impl DefaultableClass for SnapshotClass {
    const DEFAULT_ANNOTATION: &'static str = ANN_DEFAULT_SNAPSHOT_CLASS;

    fn driver(&self) -> &str {
        &self.driver
    }
}

/// Pick the single default class for `driver` out of `classes`.
pub fn select_default<'a, C, I>(classes: I, driver: &str) -> Result<C>
where
    C: DefaultableClass + 'a,
    I: IntoIterator<Item = &'a C>,
{
    let defaults: Vec<&C> = classes
        .into_iter()
        .filter(|c| c.driver() == driver && c.is_default())
        .collect();
    match defaults.as_slice() {
        [] => Err(SnapshotError::NoDefaultClass(driver.to_owned())),
        [class] => Ok((*class).clone()),
        many => Err(SnapshotError::AmbiguousDefaultClass {
            driver: driver.to_owned(),
            count: many.len(),
        }),
    }
}

/// Resolves explicit and default classes against the store.
pub struct ClassResolver<C: DefaultableClass> {
    store: Arc<dyn ResourceStore<C>>,
    _kind: PhantomData<fn() -> C>,
}

impl<C: DefaultableClass> ClassResolver<C> {
    /// Resolve classes stored in `store`.
    pub fn new(store: Arc<dyn ResourceStore<C>>) -> Self {
        Self {
            store,
            _kind: PhantomData,
        }
    }

    /// Fetch a class by name.
    pub async fn get(&self, name: &str) -> Result<C> {
        self.store
            .get(None, name)
            .await?
            .ok_or_else(|| SnapshotError::ClassNotFound(name.to_owned()))
    }

    /// The unique class annotated as default for `driver`.
    pub async fn resolve_default(&self, driver: &str) -> Result<C> {
        let classes = self.store.list(&ListParams::default()).await?;
        let class = select_default(&classes, driver)?;
        debug!(class = %class.meta().name, driver, "resolved default snapshot class");
        Ok(class)
    }

    /// The explicitly named class, or the default for `driver` when `name`
    /// is unset.
    pub async fn resolve(&self, name: Option<&str>, driver: &str) -> Result<C> {
        match name.filter(|n| !n.is_empty()) {
            Some(name) => self.get(name).await,
            None => self.resolve_default(driver).await,
        }
    }
}
