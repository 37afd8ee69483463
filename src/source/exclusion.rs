use super::ScanError;
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Point lookup deciding whether a row is excluded from derived output.
/// Eventually consistent; read-only from the pipeline's point of view.
pub trait ExclusionLookup: Send + Sync {
    fn excluded<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, ScanError>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoExclusions;

impl ExclusionLookup for NoExclusions {
    fn excluded<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, Result<bool, ScanError>> {
        Box::pin(async { Ok(false) })
    }
}

/// Exclusion set held in memory. Clones share the same set, so an operator
/// handle can update it while pipelines read it.
#[derive(Debug, Default, Clone)]
pub struct StaticExclusions {
    keys: Arc<RwLock<HashSet<String>>>,
}

impl StaticExclusions {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: Arc::new(RwLock::new(keys.into_iter().map(Into::into).collect())),
        }
    }

    pub fn insert(&self, key: impl Into<String>) {
        self.keys
            .write()
            .expect("exclusion set lock poisoned")
            .insert(key.into());
    }

    pub fn remove(&self, key: &str) -> bool {
        self.keys
            .write()
            .expect("exclusion set lock poisoned")
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.keys.read().expect("exclusion set lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExclusionLookup for StaticExclusions {
    fn excluded<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, ScanError>> {
        let hit = self
            .keys
            .read()
            .map(|keys| keys.contains(key))
            .map_err(|_| ScanError::Lookup("exclusion set lock poisoned".into()));
        Box::pin(async move { hit })
    }
}
