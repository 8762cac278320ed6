//! The descriptor registry.
//!
//! Descriptors are collected with a [`RegistryBuilder`], validated once by
//! [`RegistryBuilder::seal`], and never change afterwards. A sealed registry
//! is handed to sessions explicitly. [`bootstrap`] additionally installs one
//! registry process-wide for callers that want a single startup call.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::descriptor::Descriptor;
use crate::entity::Entity;
use crate::error::{DescriptorError, DescriptorErrorKind, Error, Result};

/// Read-only mapping from entity to descriptor.
#[derive(Debug)]
pub struct DescriptorRegistry {
    descriptors: Vec<Arc<Descriptor>>,
    by_name: HashMap<&'static str, usize>,
    by_type: HashMap<TypeId, usize>,
}

impl DescriptorRegistry {
    /// Descriptor registered under `entity`.
    pub fn get(&self, entity: &str) -> Option<&Arc<Descriptor>> {
        self.by_name.get(entity).map(|&i| &self.descriptors[i])
    }

    /// Descriptor registered under `entity`, or an unknown-entity error.
    pub fn descriptor(&self, entity: &str) -> Result<&Arc<Descriptor>> {
        self.get(entity).ok_or_else(|| Error::unknown_entity(entity))
    }

    /// Descriptor for the Rust type `T`.
    pub fn of<T: Entity>(&self) -> Result<&Arc<Descriptor>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| Error::unknown_entity(T::ENTITY_NAME))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Descriptor>> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptors ordered so that referenced entities precede the entities
    /// referencing them. Registration order breaks ties; members of a cycle
    /// keep their registration order.
    pub fn dependency_order(&self) -> Vec<Arc<Descriptor>> {
        let mut placed = vec![false; self.descriptors.len()];
        let mut ordered = Vec::with_capacity(self.descriptors.len());
        loop {
            let mut progressed = false;
            for (i, desc) in self.descriptors.iter().enumerate() {
                if placed[i] {
                    continue;
                }
                let ready = desc
                    .referenced_entities()
                    .filter_map(|target| self.by_name.get(target))
                    .all(|&dep| placed[dep]);
                if ready {
                    placed[i] = true;
                    ordered.push(Arc::clone(desc));
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        for (i, desc) in self.descriptors.iter().enumerate() {
            if !placed[i] {
                ordered.push(Arc::clone(desc));
            }
        }
        ordered
    }
}

/// Collects descriptors before sealing them into a [`DescriptorRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    descriptors: Vec<Descriptor>,
    errors: Vec<Error>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and add the descriptor of `T`.
    pub fn register<T: Entity>(mut self) -> Self {
        match T::descriptor().build() {
            Ok(descriptor) => self.descriptors.push(descriptor),
            Err(err) => self.errors.push(err),
        }
        self
    }

    /// Add an already built descriptor.
    pub fn register_descriptor(mut self, descriptor: Descriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    fn registry_error(entity: &str, kind: DescriptorErrorKind, message: String) -> Error {
        Error::Descriptor(DescriptorError {
            kind,
            entity: entity.to_string(),
            message,
        })
    }

    /// Validate all descriptors and freeze them.
    ///
    /// Fails on the first build error, on duplicate entity names or types,
    /// and on references to entities that were never registered.
    pub fn seal(mut self) -> Result<Arc<DescriptorRegistry>> {
        if !self.errors.is_empty() {
            return Err(self.errors.remove(0));
        }

        let mut by_name = HashMap::with_capacity(self.descriptors.len());
        let mut by_type = HashMap::with_capacity(self.descriptors.len());
        for (i, desc) in self.descriptors.iter().enumerate() {
            if by_name.insert(desc.entity(), i).is_some()
                || by_type.insert(desc.type_id(), i).is_some()
            {
                return Err(Self::registry_error(
                    desc.entity(),
                    DescriptorErrorKind::Duplicate,
                    format!("entity '{}' registered twice", desc.entity()),
                ));
            }
        }
        for desc in &self.descriptors {
            for mapping in desc.mappings() {
                if let Some(target) = mapping.reference_target() {
                    if !by_name.contains_key(target) {
                        return Err(Self::registry_error(
                            desc.entity(),
                            DescriptorErrorKind::UnknownEntity,
                            format!(
                                "attribute '{}' references unregistered entity '{}'",
                                mapping.attribute(),
                                target
                            ),
                        ));
                    }
                }
            }
        }

        tracing::debug!(
            descriptors = self.descriptors.len(),
            "Descriptor registry sealed"
        );
        Ok(Arc::new(DescriptorRegistry {
            descriptors: self.descriptors.into_iter().map(Arc::new).collect(),
            by_name,
            by_type,
        }))
    }
}

static GLOBAL_REGISTRY: OnceLock<Arc<DescriptorRegistry>> = OnceLock::new();

/// Seal `builder` and install the result as the process-wide registry.
///
/// Only the first call succeeds; later calls fail without replacing it.
pub fn bootstrap(builder: RegistryBuilder) -> Result<Arc<DescriptorRegistry>> {
    let registry = builder.seal()?;
    GLOBAL_REGISTRY
        .set(Arc::clone(&registry))
        .map_err(|_| {
            RegistryBuilder::registry_error(
                "*",
                DescriptorErrorKind::Registry,
                "descriptor registry already bootstrapped".to_string(),
            )
        })?;
    tracing::info!(descriptors = registry.len(), "Descriptor registry bootstrapped");
    Ok(registry)
}

/// The process-wide registry installed by [`bootstrap`], if any.
pub fn registry() -> Option<Arc<DescriptorRegistry>> {
    GLOBAL_REGISTRY.get().cloned()
}
