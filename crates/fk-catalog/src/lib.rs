#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use fk_core::{ElementType, EngineKind, ExecutionMode, LayoutDesc, MemoryLayout, OperatorKind};
use tracing::{debug, warn};

/// `(element type, memory layout)` pair a kernel implementation is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DispatchKey {
    pub dtype: ElementType,
    pub layout: MemoryLayout,
}

impl DispatchKey {
    #[must_use]
    pub const fn new(dtype: ElementType, layout: MemoryLayout) -> Self {
        Self { dtype, layout }
    }

    #[must_use]
    pub fn for_layout(desc: &LayoutDesc) -> Self {
        Self::new(desc.dtype(), desc.layout())
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dtype, self.layout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FamilyKey {
    pub op: OperatorKind,
    pub engine: EngineKind,
}

impl fmt::Display for FamilyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.op, self.engine)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogError {
    DuplicateRegistration {
        op: OperatorKind,
        engine: EngineKind,
        key: DispatchKey,
    },
    NotRegistered {
        op: OperatorKind,
        engine: EngineKind,
        key: DispatchKey,
    },
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateRegistration { op, engine, key } => write!(
                f,
                "duplicate implementation registration for op={op} engine={engine} key={key}"
            ),
            Self::NotRegistered { op, engine, key } => write!(
                f,
                "no implementation registered for op={op} engine={engine} key={key}"
            ),
        }
    }
}

impl std::error::Error for CatalogError {}

type FamilyTable<F> = BTreeMap<FamilyKey, BTreeMap<DispatchKey, F>>;

/// Registration phase of the catalog. Only [`CatalogBuilder::freeze`] hands out
/// something that can be looked up.
#[derive(Debug, Clone)]
pub struct CatalogBuilder<F> {
    mode: ExecutionMode,
    families: FamilyTable<F>,
    overwrites: usize,
}

impl<F> CatalogBuilder<F> {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            families: BTreeMap::new(),
            overwrites: 0,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Strict mode rejects a second factory for the same key; hardened mode
    /// keeps the last one.
    pub fn register(
        &mut self,
        op: OperatorKind,
        engine: EngineKind,
        key: DispatchKey,
        factory: F,
    ) -> Result<(), CatalogError> {
        let table = self.families.entry(FamilyKey { op, engine }).or_default();
        if table.contains_key(&key) {
            match self.mode {
                ExecutionMode::Strict => {
                    return Err(CatalogError::DuplicateRegistration { op, engine, key });
                }
                ExecutionMode::Hardened => {
                    warn!(%op, %engine, %key, "overwriting duplicate implementation registration");
                    self.overwrites += 1;
                }
            }
        }
        table.insert(key, factory);
        Ok(())
    }

    pub fn register_all<I>(
        &mut self,
        op: OperatorKind,
        engine: EngineKind,
        keys: I,
        factory: F,
    ) -> Result<usize, CatalogError>
    where
        I: IntoIterator<Item = DispatchKey>,
        F: Clone,
    {
        let mut registered = 0usize;
        for key in keys {
            self.register(op, engine, key, factory.clone())?;
            registered += 1;
        }
        debug!(%op, %engine, registered, "registered implementation family");
        Ok(registered)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.families.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn freeze(self) -> ImplementationCatalog<F> {
        let catalog = ImplementationCatalog {
            families: self.families,
            overwrites: self.overwrites,
        };
        debug!(
            entries = catalog.len(),
            families = catalog.families.len(),
            overwrites = catalog.overwrites,
            "implementation catalog frozen"
        );
        catalog
    }
}

/// Read-only view of every registered implementation factory.
#[derive(Debug, Clone)]
pub struct ImplementationCatalog<F> {
    families: FamilyTable<F>,
    overwrites: usize,
}

impl<F> ImplementationCatalog<F> {
    /// Entries for one operator/engine pair, ordered by dispatch key.
    #[must_use]
    pub fn lookup(&self, op: OperatorKind, engine: EngineKind) -> Vec<(DispatchKey, &F)> {
        self.families
            .get(&FamilyKey { op, engine })
            .map(|table| table.iter().map(|(key, factory)| (*key, factory)).collect())
            .unwrap_or_default()
    }

    pub fn find(
        &self,
        op: OperatorKind,
        engine: EngineKind,
        key: DispatchKey,
    ) -> Result<&F, CatalogError> {
        self.families
            .get(&FamilyKey { op, engine })
            .and_then(|table| table.get(&key))
            .ok_or(CatalogError::NotRegistered { op, engine, key })
    }

    #[must_use]
    pub fn contains(&self, op: OperatorKind, engine: EngineKind, key: DispatchKey) -> bool {
        self.find(op, engine, key).is_ok()
    }

    #[must_use]
    pub fn keys(&self, op: OperatorKind, engine: EngineKind) -> Vec<DispatchKey> {
        self.lookup(op, engine)
            .into_iter()
            .map(|(key, _)| key)
            .collect()
    }

    #[must_use]
    pub fn families(&self) -> Vec<FamilyKey> {
        self.families.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.families.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Duplicate registrations that were resolved by last-write-wins.
    #[must_use]
    pub fn overwrites(&self) -> usize {
        self.overwrites
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use fk_core::{ElementType, EngineKind, ExecutionMode, MemoryLayout, OperatorKind};
    use proptest::prelude::*;

    use super::{CatalogBuilder, CatalogError, DispatchKey, ImplementationCatalog};

    type Factory = fn() -> &'static str;

    fn f32_factory() -> &'static str {
        "f32"
    }

    fn f16_factory() -> &'static str {
        "f16"
    }

    fn other_factory() -> &'static str {
        "other"
    }

    const LAYOUT_A: MemoryLayout = MemoryLayout::bfyx;

    fn two_entry_builder(mode: ExecutionMode) -> CatalogBuilder<Factory> {
        let mut builder = CatalogBuilder::<Factory>::new(mode);
        builder
            .register(
                OperatorKind::Gather,
                EngineKind::Ocl,
                DispatchKey::new(ElementType::F32, LAYOUT_A),
                f32_factory,
            )
            .expect("first registration");
        builder
            .register(
                OperatorKind::Gather,
                EngineKind::Ocl,
                DispatchKey::new(ElementType::F16, LAYOUT_A),
                f16_factory,
            )
            .expect("second registration");
        builder
    }

    #[test]
    fn lookup_returns_exactly_registered_entries() {
        let catalog = two_entry_builder(ExecutionMode::Strict).freeze();
        let keys = catalog.keys(OperatorKind::Gather, EngineKind::Ocl);
        assert_eq!(
            keys,
            vec![
                DispatchKey::new(ElementType::F32, LAYOUT_A),
                DispatchKey::new(ElementType::F16, LAYOUT_A),
            ]
        );
        assert!(catalog.lookup(OperatorKind::Gather, EngineKind::Cpu).is_empty());
    }

    #[test]
    fn third_distinct_key_grows_family_by_one() {
        let mut builder = two_entry_builder(ExecutionMode::Strict);
        builder
            .register(
                OperatorKind::Gather,
                EngineKind::Ocl,
                DispatchKey::new(ElementType::I32, LAYOUT_A),
                other_factory,
            )
            .expect("third registration");
        let catalog = builder.freeze();
        assert_eq!(catalog.lookup(OperatorKind::Gather, EngineKind::Ocl).len(), 3);
    }

    #[test]
    fn strict_mode_rejects_duplicates() {
        let mut builder = two_entry_builder(ExecutionMode::Strict);
        let key = DispatchKey::new(ElementType::F32, LAYOUT_A);
        let err = builder
            .register(OperatorKind::Gather, EngineKind::Ocl, key, other_factory)
            .expect_err("duplicate must fail in strict mode");
        assert_eq!(
            err,
            CatalogError::DuplicateRegistration {
                op: OperatorKind::Gather,
                engine: EngineKind::Ocl,
                key,
            }
        );
        let catalog = builder.freeze();
        let factory = catalog
            .find(OperatorKind::Gather, EngineKind::Ocl, key)
            .expect("original entry survives");
        assert_eq!(factory(), "f32");
    }

    #[test]
    fn hardened_mode_keeps_last_write() {
        let mut builder = two_entry_builder(ExecutionMode::Hardened);
        let key = DispatchKey::new(ElementType::F32, LAYOUT_A);
        builder
            .register(OperatorKind::Gather, EngineKind::Ocl, key, other_factory)
            .expect("hardened mode overwrites");
        let catalog = builder.freeze();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.overwrites(), 1);
        let factory = catalog
            .find(OperatorKind::Gather, EngineKind::Ocl, key)
            .expect("entry present");
        assert_eq!(factory(), "other");
    }

    #[test]
    fn find_reports_missing_key() {
        let catalog = two_entry_builder(ExecutionMode::Strict).freeze();
        let key = DispatchKey::new(ElementType::I64, LAYOUT_A);
        let err = catalog
            .find(OperatorKind::Gather, EngineKind::Ocl, key)
            .expect_err("i64 is not registered");
        assert!(err.to_string().contains("i64:bfyx"));
        assert!(!catalog.contains(OperatorKind::Gather, EngineKind::Ocl, key));
    }

    #[test]
    fn engines_are_separate_families() {
        let mut builder = two_entry_builder(ExecutionMode::Strict);
        builder
            .register(
                OperatorKind::Gather,
                EngineKind::Cpu,
                DispatchKey::new(ElementType::F32, LAYOUT_A),
                other_factory,
            )
            .expect("same key, other engine");
        let catalog = builder.freeze();
        assert_eq!(catalog.families().len(), 2);
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn register_all_counts_entries() {
        let mut builder = CatalogBuilder::<Factory>::new(ExecutionMode::Strict);
        let keys = MemoryLayout::all()
            .iter()
            .map(|layout| DispatchKey::new(ElementType::U8, *layout));
        let registered = builder
            .register_all(OperatorKind::Gather, EngineKind::Ocl, keys, other_factory)
            .expect("distinct keys");
        assert_eq!(registered, MemoryLayout::all().len());
        assert_eq!(builder.len(), registered);
    }

    #[test]
    fn frozen_catalog_is_shared_across_threads() {
        let catalog: Arc<ImplementationCatalog<Factory>> =
            Arc::new(two_entry_builder(ExecutionMode::Strict).freeze());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let catalog = Arc::clone(&catalog);
                std::thread::spawn(move || {
                    catalog
                        .find(
                            OperatorKind::Gather,
                            EngineKind::Ocl,
                            DispatchKey::new(ElementType::F16, LAYOUT_A),
                        )
                        .map(|factory| factory())
                })
            })
            .collect();
        for handle in handles {
            let name = handle
                .join()
                .expect("reader thread should not panic")
                .expect("entry present");
            assert_eq!(name, "f16");
        }
    }

    proptest! {
        #[test]
        fn prop_lookup_matches_distinct_key_set(
            picks in proptest::collection::vec((0usize..6, 0usize..19), 0..40),
        ) {
            let mut builder = CatalogBuilder::<Factory>::new(ExecutionMode::Hardened);
            let mut expected = BTreeSet::new();
            for (dtype_index, layout_index) in picks {
                let key = DispatchKey::new(
                    ElementType::all()[dtype_index],
                    MemoryLayout::all()[layout_index],
                );
                builder
                    .register(OperatorKind::Gather, EngineKind::Ocl, key, other_factory)
                    .expect("hardened registration never fails");
                expected.insert(key);
            }
            let catalog = builder.freeze();
            let observed: BTreeSet<_> = catalog
                .keys(OperatorKind::Gather, EngineKind::Ocl)
                .into_iter()
                .collect();
            prop_assert_eq!(observed, expected);
        }
    }
}
