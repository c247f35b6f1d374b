use std::sync::Arc;

/// A named concurrency budget shared by every task that declares it.
///
/// A resource is declared once, when the build document is loaded, and
/// referenced by [`Arc`] handle from the task templates and every concrete
/// task instantiated from them. The capacity bounds how many admitted tasks
/// may hold a unit of the resource at the same instant; the executor is the
/// bookkeeper.
#[derive(Debug)]
pub struct Resource {
    name: String,
    capacity: usize,
}

impl Resource {
    /// Capacity must be at least 1; the document loader rejects anything
    /// else before a `Resource` is constructed.
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            capacity,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
