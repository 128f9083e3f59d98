use std::collections::BTreeMap;

use tracing::{error, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceKind {
    Texture,
    Buffer,
    Shader,
    Program,
    VertexArray,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateId(String),
    UnknownId(String),
    Disposed,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateId(id) => write!(f, "resource id already registered: {id}"),
            RegistryError::UnknownId(id) => write!(f, "unknown resource id: {id}"),
            RegistryError::Disposed => write!(f, "registry already disposed"),
        }
    }
}

impl std::error::Error for RegistryError {}

type DisposeFn = Box<dyn FnOnce() -> Result<(), String>>;

struct ResourceEntry {
    id: String,
    kind: ResourceKind,
    size_bytes: usize,
    dispose: Option<DisposeFn>,
}

/// Ordered registry of disposable GPU objects.
///
/// Registration order is teardown order reversed: the last-created resource
/// is destroyed first, mirroring the stack-like dependency order of GPU
/// objects (a vertex array dies before the buffers it references).
///
/// Disposal failures are caught and logged per resource; one failing delete
/// never blocks cleanup of the rest.
pub struct ResourceRegistry {
    entries: Vec<ResourceEntry>,
    disposed: bool,
    disposed_ids: Vec<String>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            disposed: false,
            disposed_ids: Vec::new(),
        }
    }

    /// Registers a resource with its dispose callback.
    ///
    /// Duplicate ids are rejected (logged, the existing entry wins). After
    /// `dispose_all` the registry is dead and every register fails loudly.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        kind: ResourceKind,
        size_bytes: usize,
        dispose: impl FnOnce() -> Result<(), String> + 'static,
    ) -> Result<(), RegistryError> {
        let id = id.into();
        if self.disposed {
            error!(id = id.as_str(), "register on a disposed registry");
            return Err(RegistryError::Disposed);
        }
        if self.entries.iter().any(|e| e.id == id) {
            warn!(id = id.as_str(), "duplicate resource id ignored");
            return Err(RegistryError::DuplicateId(id));
        }
        self.entries.push(ResourceEntry {
            id,
            kind,
            size_bytes,
            dispose: Some(Box::new(dispose)),
        });
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Disposes one resource and removes it from the registry.
    pub fn dispose(&mut self, id: &str) -> Result<(), RegistryError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id)
            .ok_or_else(|| RegistryError::UnknownId(id.to_string()))?;
        let mut entry = self.entries.remove(index);
        Self::run_dispose(&mut entry);
        self.disposed_ids.push(entry.id);
        Ok(())
    }

    /// Disposes everything in reverse registration order and permanently
    /// marks the registry disposed.
    pub fn dispose_all(&mut self) {
        while let Some(mut entry) = self.entries.pop() {
            Self::run_dispose(&mut entry);
            self.disposed_ids.push(entry.id);
        }
        self.disposed = true;
    }

    /// Resource counts per kind, for diagnostics.
    pub fn count_by_kind(&self) -> BTreeMap<ResourceKind, usize> {
        let mut out = BTreeMap::new();
        for entry in &self.entries {
            *out.entry(entry.kind).or_insert(0) += 1;
        }
        out
    }

    /// Rough GPU memory estimate across live resources.
    pub fn estimated_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    /// Drains the ids disposed since the last call (observer hook).
    pub fn take_disposed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.disposed_ids)
    }

    fn run_dispose(entry: &mut ResourceEntry) {
        if let Some(dispose) = entry.dispose.take()
            && let Err(reason) = dispose()
        {
            warn!(
                id = entry.id.as_str(),
                reason = reason.as_str(),
                "resource disposal failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RegistryError, ResourceKind, ResourceRegistry};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn dispose_all_runs_in_reverse_registration_order() {
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let mut reg = ResourceRegistry::new();

        for (id, name) in [("buf", "buf"), ("tex", "tex"), ("vao", "vao")] {
            let order = Rc::clone(&order);
            reg.register(id, ResourceKind::Buffer, 0, move || {
                order.borrow_mut().push(name);
                Ok(())
            })
            .unwrap();
        }

        reg.dispose_all();
        assert_eq!(*order.borrow(), vec!["vao", "tex", "buf"]);
        assert!(reg.is_disposed());
        assert_eq!(reg.take_disposed(), vec!["vao", "tex", "buf"]);
    }

    #[test]
    fn a_throwing_disposer_does_not_stop_the_rest() {
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let mut reg = ResourceRegistry::new();

        {
            let order = Rc::clone(&order);
            reg.register("a", ResourceKind::Texture, 0, move || {
                order.borrow_mut().push("a");
                Ok(())
            })
            .unwrap();
        }
        reg.register("b", ResourceKind::Texture, 0, || {
            Err("driver delete failed".to_string())
        })
        .unwrap();
        {
            let order = Rc::clone(&order);
            reg.register("c", ResourceKind::Texture, 0, move || {
                order.borrow_mut().push("c");
                Ok(())
            })
            .unwrap();
        }

        reg.dispose_all();
        // "b" failed but "a" still ran, and each disposer ran exactly once.
        assert_eq!(*order.borrow(), vec!["c", "a"]);
    }

    #[test]
    fn duplicate_ids_are_rejected_without_replacing() {
        let calls = Rc::new(RefCell::new(0));
        let mut reg = ResourceRegistry::new();

        {
            let calls = Rc::clone(&calls);
            reg.register("tex", ResourceKind::Texture, 4, move || {
                *calls.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();
        }
        let err = reg
            .register("tex", ResourceKind::Texture, 8, || Ok(()))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateId("tex".to_string()));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.estimated_bytes(), 4);

        reg.dispose_all();
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn register_after_dispose_all_fails_loudly() {
        let mut reg = ResourceRegistry::new();
        reg.dispose_all();
        let err = reg
            .register("late", ResourceKind::Buffer, 0, || Ok(()))
            .unwrap_err();
        assert_eq!(err, RegistryError::Disposed);
    }

    #[test]
    fn single_dispose_removes_and_reports() {
        let mut reg = ResourceRegistry::new();
        reg.register("buf", ResourceKind::Buffer, 16, || Ok(()))
            .unwrap();
        reg.register("tex", ResourceKind::Texture, 64, || Ok(()))
            .unwrap();

        reg.dispose("buf").unwrap();
        assert!(!reg.contains("buf"));
        assert_eq!(reg.take_disposed(), vec!["buf"]);
        assert_eq!(reg.estimated_bytes(), 64);

        let err = reg.dispose("buf").unwrap_err();
        assert_eq!(err, RegistryError::UnknownId("buf".to_string()));
    }

    #[test]
    fn counts_by_kind_for_diagnostics() {
        let mut reg = ResourceRegistry::new();
        reg.register("b1", ResourceKind::Buffer, 0, || Ok(())).unwrap();
        reg.register("b2", ResourceKind::Buffer, 0, || Ok(())).unwrap();
        reg.register("p", ResourceKind::Program, 0, || Ok(())).unwrap();

        let counts = reg.count_by_kind();
        assert_eq!(counts.get(&ResourceKind::Buffer), Some(&2));
        assert_eq!(counts.get(&ResourceKind::Program), Some(&1));
        assert_eq!(counts.get(&ResourceKind::Texture), None);
    }
}
