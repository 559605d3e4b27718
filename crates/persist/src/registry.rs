//! Class-path resolution for entities restored by spawning.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use keepsake_common::Capabilities;
use keepsake_kernel::EntityTemplate;

use crate::error::{PersistError, Result};

type Factory = Arc<dyn Fn() -> EntityTemplate + Send + Sync>;

#[derive(Clone)]
struct TypeEntry {
    capabilities: Capabilities,
    factory: Factory,
}

/// Maps class paths to factories plus the protocols the type declares.
/// Lookups fall back to a redirect table for renamed classes, and fail
/// closed.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, TypeEntry>,
    redirects: BTreeMap<String, String>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .field("redirects", &self.redirects)
            .finish()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type whose factory builds a template for it. The type's
    /// capabilities are taken from a template built now.
    pub fn register<F>(&mut self, class_path: impl Into<String>, factory: F)
    where
        F: Fn() -> EntityTemplate + Send + Sync + 'static,
    {
        let capabilities = factory().capabilities;
        self.types.insert(
            class_path.into(),
            TypeEntry {
                capabilities,
                factory: Arc::new(factory),
            },
        );
    }

    /// Register a type that always spawns from a copy of `template`.
    pub fn register_template(&mut self, template: EntityTemplate) {
        let class_path = template.class_path.clone();
        self.register(class_path, move || template.clone());
    }

    pub fn add_redirect(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.redirects.insert(from.into(), to.into());
    }

    pub fn with_redirects(mut self, redirects: &BTreeMap<String, String>) -> Self {
        for (from, to) in redirects {
            self.redirects.insert(from.clone(), to.clone());
        }
        self
    }

    pub fn contains(&self, class_path: &str) -> bool {
        self.types.contains_key(class_path)
    }

    /// Resolve `class_path` to a spawnable template.
    ///
    /// Direct lookup first, then the redirect table. The resolved type must
    /// declare [`Capabilities::SUPPORTS_PERSISTENCE`].
    pub fn resolve(&self, class_path: &str) -> Result<EntityTemplate> {
        if class_path.is_empty() {
            return Err(PersistError::ResolveClass {
                class: String::new(),
            });
        }
        let (resolved, entry) = match self.types.get(class_path) {
            Some(entry) => (class_path, entry),
            None => {
                let redirected = self.redirects.get(class_path).map(String::as_str);
                match redirected.and_then(|to| self.types.get(to).map(|e| (to, e))) {
                    Some(found) => {
                        tracing::debug!(from = class_path, to = found.0, "class redirected");
                        found
                    }
                    None => {
                        return Err(PersistError::ResolveClass {
                            class: class_path.to_owned(),
                        });
                    }
                }
            }
        };
        if !entry
            .capabilities
            .contains(Capabilities::SUPPORTS_PERSISTENCE)
        {
            tracing::warn!(class = resolved, "class does not support persistence");
            return Err(PersistError::ResolveClass {
                class: class_path.to_owned(),
            });
        }
        let mut template = (entry.factory)();
        template.class_path = resolved.to_owned();
        Ok(template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keepsake_common::Value;

    fn registry() -> TypeRegistry {
        let mut r = TypeRegistry::new();
        r.register("/Game/Bot", || {
            let mut t = EntityTemplate::new("/Game/Bot");
            t.fields.insert("Health".into(), Value::Int(100));
            t
        });
        r.register_template(
            EntityTemplate::new("/Game/Decal").with_capabilities(Capabilities::MOVABLE),
        );
        r.add_redirect("/Game/OldBot", "/Game/Bot");
        r.add_redirect("/Game/Dangling", "/Game/Gone");
        r
    }

    #[test]
    fn direct_lookup_builds_fresh_template() {
        let t = registry().resolve("/Game/Bot").unwrap();
        assert_eq!(t.class_path, "/Game/Bot");
        assert_eq!(t.fields.get("Health"), Some(&Value::Int(100)));
    }

    #[test]
    fn redirects_are_the_secondary_lookup() {
        let t = registry().resolve("/Game/OldBot").unwrap();
        assert_eq!(t.class_path, "/Game/Bot");
    }

    #[test]
    fn resolution_fails_closed() {
        let r = registry();
        for class in ["", "/Game/Nope", "/Game/Dangling", "/Game/Decal"] {
            assert!(
                matches!(r.resolve(class), Err(PersistError::ResolveClass { .. })),
                "{class} should not resolve"
            );
        }
    }

    #[test]
    fn settings_redirects_merge_in() {
        let mut table = BTreeMap::new();
        table.insert("/Game/Legacy".to_owned(), "/Game/Bot".to_owned());
        let r = registry().with_redirects(&table);
        assert!(r.resolve("/Game/Legacy").is_ok());
    }
}
