//! Type aliases for the shared-state shapes used across the workspace.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A read-write locked map, used for listener registries.
pub type ThreadSafeRwMap<K, V> = Arc<RwLock<HashMap<K, V>>>;

/// Create an empty [`ThreadSafeRwMap`].
pub fn thread_safe_rw_map<K, V>() -> ThreadSafeRwMap<K, V> {
    Arc::new(RwLock::new(HashMap::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rw_map_is_shared() {
        let map: ThreadSafeRwMap<String, u8> = thread_safe_rw_map();
        let clone = Arc::clone(&map);
        clone.write().insert("a".to_string(), 1);
        assert_eq!(map.read().get("a"), Some(&1));
    }
}
