use std::collections::HashSet;
use std::sync::Arc;

use taskvault::config::StoreConfig;
use taskvault::events::EventBus;
use taskvault::store::TaskStore;
use taskvault::task::TaskDraft;

pub async fn open_store(dir: &std::path::Path) -> TaskStore {
    let config = StoreConfig {
        persistence_directory: dir.to_path_buf(),
        ..StoreConfig::default()
    };
    TaskStore::open(config, Arc::new(EventBus::new())).await.unwrap()
}

pub async fn open_store_with(dir: &std::path::Path, f: impl FnOnce(&mut StoreConfig)) -> TaskStore {
    let mut config = StoreConfig {
        persistence_directory: dir.to_path_buf(),
        ..StoreConfig::default()
    };
    f(&mut config);
    TaskStore::open(config, Arc::new(EventBus::new())).await.unwrap()
}

pub fn draft(name: &str, priority: i64) -> TaskDraft {
    TaskDraft {
        name: name.to_string(),
        description: String::new(),
        task_type: "build".to_string(),
        priority,
        status: None,
        tags: HashSet::new(),
        dependencies: HashSet::new(),
    }
}
