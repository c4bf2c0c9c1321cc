//! Composition roots
//!
//! A composition root groups the registrations for one area of an
//! application. Roots are collected into a registry and applied to a
//! container in priority order, so foundational registrations land before
//! the features that consume them.

use tracing::info;

use crate::container::ServiceContainer;
use crate::error::DiResult;

pub trait CompositionRoot: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower runs earlier. Defaults to 100.
    fn priority(&self) -> u32 {
        100
    }

    fn compose(&self, container: &ServiceContainer) -> DiResult<()>;
}

/// Collects composition roots and applies them in priority order.
#[derive(Default)]
pub struct CompositionRootRegistry {
    roots: Vec<Box<dyn CompositionRoot>>,
}

impl CompositionRootRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, root: impl CompositionRoot + 'static) -> &mut Self {
        self.roots.push(Box::new(root));
        self
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Apply every root to `container`, lowest priority first. Ties keep
    /// insertion order.
    pub fn compose_all(&self, container: &ServiceContainer) -> DiResult<()> {
        let mut ordered: Vec<&Box<dyn CompositionRoot>> = self.roots.iter().collect();
        ordered.sort_by_key(|root| root.priority());
        for root in ordered {
            info!(root = root.name(), priority = root.priority(), "composing");
            root.compose(container)?;
        }
        Ok(())
    }
}
