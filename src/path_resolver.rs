//! Translation between slash-paths and stored directory ids.

use crate::entry::now;
use crate::error::PathError;
use crate::store::Store;

pub struct PathResolver<'a> {
    store: &'a Store,
}

impl<'a> PathResolver<'a> {
    pub fn new(store: &'a Store) -> Self {
        PathResolver { store }
    }

    /// Splits `path` on `/`, ignoring empty segments (so leading, trailing, and duplicated
    /// separators collapse), and walks from the virtual root (id 0) down. When `create_missing`
    /// is true, absent intermediate directories are inserted empty; otherwise resolution fails
    /// at the first missing segment.
    pub fn descend(&self, path: &str, create_missing: bool) -> Result<u32, PathError> {
        let mut id = 0u32;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match self.store.get_dir_by_name(segment, id).map_err(|e| PathError::NotFound(e.to_string()))? {
                Some(dir) => id = dir.id,
                None => {
                    if create_missing {
                        id = self
                            .store
                            .insert_dir(id, segment, 0, now())
                            .map_err(|e| PathError::NotFound(e.to_string()))?;
                    } else {
                        return Err(PathError::NotFound(path.to_string()));
                    }
                }
            }
        }
        Ok(id)
    }

    /// Walks `parent` links upward from `id`, prepending `/name` at each step, stopping at (and
    /// excluding) `down_to_id`'s own name.
    pub fn ascend(&self, id: u32, down_to_id: u32) -> Result<String, PathError> {
        if id == down_to_id {
            return Ok(String::new());
        }
        let dir = self
            .store
            .get_dir_by_id(id)
            .map_err(|e| PathError::NotFound(e.to_string()))?
            .ok_or(PathError::Corrupt(id))?;
        let prefix = self.ascend(dir.parent, down_to_id)?;
        Ok(format!("{prefix}/{}", dir.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fscrawl.sqlite3");
        let store = Store::open(&path, "dirs", "files", false).unwrap();
        (store, dir)
    }

    #[test]
    fn descend_creates_missing_segments() {
        let (store, _tmp) = temp_store();
        let resolver = PathResolver::new(&store);
        let id = resolver.descend("music/rock", true).unwrap();
        assert_ne!(id, 0);
        let again = resolver.descend("music/rock", false).unwrap();
        assert_eq!(id, again);
    }

    #[test]
    fn descend_without_create_fails_on_missing() {
        let (store, _tmp) = temp_store();
        let resolver = PathResolver::new(&store);
        let err = resolver.descend("nope", false).unwrap_err();
        assert!(matches!(err, PathError::NotFound(_)));
    }

    #[test]
    fn descend_ignores_embedded_and_duplicate_slashes() {
        let (store, _tmp) = temp_store();
        let resolver = PathResolver::new(&store);
        let a = resolver.descend("//music//rock//", true).unwrap();
        let b = resolver.descend("music/rock", false).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ascend_rebuilds_path_excluding_down_to_id() {
        let (store, _tmp) = temp_store();
        let resolver = PathResolver::new(&store);
        let id = resolver.descend("music/rock", true).unwrap();
        let path = resolver.ascend(id, 0).unwrap();
        assert_eq!(path, "/music/rock");
    }
}
