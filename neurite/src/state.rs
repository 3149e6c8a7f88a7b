use neurite_db::Db;

/// Shared state handed to every request handler.
///
/// The object store is the only mutable shared state in the server; the
/// configuration lives inside it as the `(config,)` record and is re-read
/// where needed, so a config change is visible to the next request without
/// coordination.
#[derive(Clone)]
pub struct AppState {
    pub db: Db,
}

impl AppState {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}
