use std::{fmt, sync::Arc};

/// An ordered set of upgrade components keyed by protocol id.
///
/// Order is preference: a dialer proposes protocols in insertion order.
pub struct Registry<T: ?Sized> {
    entries: Arc<Vec<(String, Arc<T>)>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Registry {
            entries: Arc::new(Vec::new()),
        }
    }

    /// Appends a component. Returns `false` if the protocol id is taken.
    pub fn insert(&mut self, protocol: impl Into<String>, component: Arc<T>) -> bool {
        let protocol = protocol.into();
        if self.get(&protocol).is_some() {
            tracing::warn!(protocol=%protocol, "Ignoring duplicate registration");
            return false;
        }
        Arc::make_mut(&mut self.entries).push((protocol, component));
        true
    }

    pub fn get(&self, protocol: &str) -> Option<&Arc<T>> {
        self.entries
            .iter()
            .find(|(id, _)| id == protocol)
            .map(|(_, component)| component)
    }

    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Registry {
            entries: self.entries.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.protocols()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_insertion_order_and_rejects_duplicates() {
        let mut registry: Registry<str> = Registry::new();
        assert!(registry.insert("/b", Arc::from("b")));
        assert!(registry.insert("/a", Arc::from("a")));
        assert!(!registry.insert("/b", Arc::from("again")));

        assert_eq!(registry.protocols().collect::<Vec<_>>(), ["/b", "/a"]);
        assert_eq!(registry.get("/b").map(|c| &**c), Some("b"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn clones_do_not_observe_later_inserts() {
        let mut registry: Registry<str> = Registry::new();
        registry.insert("/a", Arc::from("a"));
        let snapshot = registry.clone();
        registry.insert("/b", Arc::from("b"));
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.len(), 2);
    }
}
