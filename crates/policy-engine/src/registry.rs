//! Versioned type registry
//!
//! Maps `{canonical_name}_{version}` to a governed type, plus named
//! transforms between type versions used to migrate persisted state. The
//! registry is an explicit object shared through `Arc`, never a global.

use policy_lang::PolicyClass;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::error::{PolicyError, Result};
use crate::state::PolicyState;

/// Builtin governed types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    ExactMatch,
    OutputPolicy,
    OutputPolicyExecuteCount,
    OutputPolicyExecuteOnce,
}

impl BuiltinKind {
    pub const ALL: [BuiltinKind; 4] = [
        BuiltinKind::ExactMatch,
        BuiltinKind::OutputPolicy,
        BuiltinKind::OutputPolicyExecuteCount,
        BuiltinKind::OutputPolicyExecuteOnce,
    ];

    pub fn canonical_name(self) -> &'static str {
        match self {
            BuiltinKind::ExactMatch => "ExactMatch",
            BuiltinKind::OutputPolicy => "OutputPolicy",
            BuiltinKind::OutputPolicyExecuteCount => "OutputPolicyExecuteCount",
            BuiltinKind::OutputPolicyExecuteOnce => "OutputPolicyExecuteOnce",
        }
    }
}

#[derive(Debug, Clone)]
pub enum GovernedType {
    Builtin(BuiltinKind),
    Custom(Arc<PolicyClass>),
}

impl GovernedType {
    pub fn canonical_name(&self) -> &str {
        match self {
            GovernedType::Builtin(kind) => kind.canonical_name(),
            GovernedType::Custom(class) => &class.name,
        }
    }

    pub fn as_custom(&self) -> Option<&Arc<PolicyClass>> {
        match self {
            GovernedType::Custom(class) => Some(class),
            GovernedType::Builtin(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeKey {
    pub canonical_name: String,
    pub version: u32,
}

impl TypeKey {
    pub fn new(canonical_name: impl Into<String>, version: u32) -> Self {
        Self {
            canonical_name: canonical_name.into(),
            version,
        }
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.canonical_name, self.version)
    }
}

pub type TransformFn = Arc<dyn Fn(PolicyState) -> Result<PolicyState> + Send + Sync>;

#[derive(Default)]
pub struct TypeRegistry {
    types: RwLock<BTreeMap<TypeKey, GovernedType>>,
    transforms: RwLock<BTreeMap<(TypeKey, TypeKey), TransformFn>>,
}

impl TypeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every builtin registered at version 1
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for kind in BuiltinKind::ALL {
            registry.register(kind.canonical_name(), 1, GovernedType::Builtin(kind));
        }
        registry
    }

    /// Returns the previously registered type under the same key, if any
    pub fn register(&self, canonical_name: &str, version: u32, ty: GovernedType) -> Option<GovernedType> {
        let key = TypeKey::new(canonical_name, version);
        debug!(%key, "registering governed type");
        self.types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, ty)
    }

    pub fn lookup(&self, canonical_name: &str, version: u32) -> Option<GovernedType> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeKey::new(canonical_name, version))
            .cloned()
    }

    /// Highest registered version of a type
    pub fn latest(&self, canonical_name: &str) -> Option<(u32, GovernedType)> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| k.canonical_name == canonical_name)
            .max_by_key(|(k, _)| k.version)
            .map(|(k, v)| (k.version, v.clone()))
    }

    pub fn keys(&self) -> Vec<TypeKey> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn register_transform(&self, from: TypeKey, to: TypeKey, transform: TransformFn) {
        debug!(%from, %to, "registering transform");
        self.transforms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((from, to), transform);
    }

    pub fn lookup_transform(&self, from: &TypeKey, to: &TypeKey) -> Option<TransformFn> {
        self.transforms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(from.clone(), to.clone()))
            .cloned()
    }

    /// Apply the registered `from -> to` transform
    pub fn migrate(&self, state: PolicyState, from: &TypeKey, to: &TypeKey) -> Result<PolicyState> {
        let transform = self
            .lookup_transform(from, to)
            .ok_or_else(|| PolicyError::Store(format!("no transform registered from {} to {}", from, to)))?;
        transform(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::{OutputPolicyExecuteCount, OutputPolicyExecuteOnce};

    #[test]
    fn test_builtins_at_version_one() {
        let registry = TypeRegistry::with_builtins();
        for kind in BuiltinKind::ALL {
            let ty = registry.lookup(kind.canonical_name(), 1).unwrap();
            assert_eq!(ty.canonical_name(), kind.canonical_name());
        }
        assert!(registry.lookup("ExactMatch", 2).is_none());
        assert!(TypeRegistry::new().keys().is_empty());
    }

    #[test]
    fn test_latest_version() {
        let registry = TypeRegistry::with_builtins();
        registry.register("OutputPolicy", 3, GovernedType::Builtin(BuiltinKind::OutputPolicy));
        assert_eq!(registry.latest("OutputPolicy").map(|(v, _)| v), Some(3));
        assert!(registry.latest("Nope").is_none());
    }

    #[test]
    fn test_migrate_with_transform() {
        let registry = TypeRegistry::with_builtins();
        let from = TypeKey::new("OutputPolicyExecuteOnce", 1);
        let to = TypeKey::new("OutputPolicyExecuteCount", 1);
        registry.register_transform(
            from.clone(),
            to.clone(),
            Arc::new(|state| match state {
                PolicyState::OutputPolicyExecuteOnce(once) => Ok(PolicyState::OutputPolicyExecuteCount(
                    OutputPolicyExecuteCount::new(once.limit() + 2, vec![]),
                )),
                other => Ok(other),
            }),
        );

        let migrated = registry
            .migrate(
                PolicyState::OutputPolicyExecuteOnce(OutputPolicyExecuteOnce::new(vec![])),
                &from,
                &to,
            )
            .unwrap();
        match migrated {
            PolicyState::OutputPolicyExecuteCount(p) => assert_eq!(p.limit(), 3),
            other => panic!("unexpected state {:?}", other.kind()),
        }

        let missing = registry.migrate(
            PolicyState::OutputPolicyExecuteOnce(OutputPolicyExecuteOnce::new(vec![])),
            &to,
            &from,
        );
        assert!(missing.is_err());
    }
}
