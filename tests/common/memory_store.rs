//! In-memory object store with a shared call journal.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::error::ErrorResponse;
use kube::{Resource, ResourceExt};

use mysql_operator::error::{Error, Result};
use mysql_operator::store::{matches_selector, ObjectStore, Propagation};

/// Ordered record of every mutating call, shared by all fakes of a test.
#[derive(Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Index of the first entry equal to `entry`.
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    /// Entries starting with `prefix`, in order.
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }
}

pub fn api_error(code: u16, reason: &str, message: impl Into<String>) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: reason.to_string(),
        code,
    }))
}

type WriteHook<K> = Box<dyn Fn(&mut K) + Send + Sync>;
type DeleteHook<K> = Box<dyn Fn(&K) -> Option<K> + Send + Sync>;
type RejectHook<K> = Box<dyn Fn(&K, &K) -> bool + Send + Sync>;

/// [`ObjectStore`] over a map, stamping uid, resourceVersion and generation
/// like the API server does. Replacing with a stale resourceVersion fails
/// with 409.
pub struct MemoryStore<K> {
    objects: Mutex<BTreeMap<String, K>>,
    journal: Journal,
    counter: AtomicU64,
    on_write: Mutex<Option<WriteHook<K>>>,
    on_delete: Mutex<Option<DeleteHook<K>>>,
    reject_replace: Mutex<Option<RejectHook<K>>>,
}

impl<K> MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new(journal: Journal) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            journal,
            counter: AtomicU64::new(1),
            on_write: Mutex::new(None),
            on_delete: Mutex::new(None),
            reject_replace: Mutex::new(None),
        }
    }

    fn kind() -> String {
        let kind: Cow<'_, str> = K::kind(&());
        kind.to_lowercase()
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    fn stamp_new(&self, obj: &mut K) {
        let n = self.next();
        let kind = Self::kind();
        let meta = obj.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(format!("{}-uid-{}", kind, n));
        }
        meta.resource_version = Some(n.to_string());
        meta.generation = Some(1);
    }

    /// Put an object in place without journaling, as test setup.
    pub fn seed(&self, mut obj: K) -> K {
        let name = obj.name_any();
        let existing = self.objects.lock().unwrap().get(&name).cloned();
        match existing {
            Some(existing) => {
                let meta = obj.meta_mut();
                meta.uid = existing.meta().uid.clone();
                meta.generation = existing.meta().generation;
                meta.resource_version = Some(self.next().to_string());
            }
            None => self.stamp_new(&mut obj),
        }
        self.objects.lock().unwrap().insert(name, obj.clone());
        obj
    }

    /// Mutate a stored object without journaling. The resourceVersion moves
    /// like for any other write, so older copies turn stale.
    pub fn update(&self, name: &str, f: impl FnOnce(&mut K)) {
        let n = self.next();
        if let Some(obj) = self.objects.lock().unwrap().get_mut(name) {
            f(obj);
            obj.meta_mut().resource_version = Some(n.to_string());
        }
    }

    /// Drop a stored object without journaling or hooks.
    pub fn delete_now(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().remove(name)
    }

    pub fn get_now(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn all(&self) -> Vec<K> {
        self.objects.lock().unwrap().values().cloned().collect()
    }

    /// Runs after every create and replace, like a controller reacting to
    /// the write.
    pub fn on_write(&self, hook: impl Fn(&mut K) + Send + Sync + 'static) {
        *self.on_write.lock().unwrap() = Some(Box::new(hook));
    }

    /// Runs after a delete; a returned object takes the deleted one's place.
    pub fn on_delete(&self, hook: impl Fn(&K) -> Option<K> + Send + Sync + 'static) {
        *self.on_delete.lock().unwrap() = Some(Box::new(hook));
    }

    /// Rejects a replace with 422 when the hook returns true for
    /// `(live, replacement)`.
    pub fn reject_replace(&self, hook: impl Fn(&K, &K) -> bool + Send + Sync + 'static) {
        *self.reject_replace.lock().unwrap() = Some(Box::new(hook));
    }

    /// 409 when `obj` carries a resourceVersion other than the stored one.
    fn check_version(&self, live: &K, obj: &K) -> Result<()> {
        let Some(expected) = obj.meta().resource_version.as_ref() else {
            return Ok(());
        };
        if live.meta().resource_version.as_ref() == Some(expected) {
            return Ok(());
        }
        let name = obj.name_any();
        self.journal.record(format!("conflict {}/{}", Self::kind(), name));
        Err(api_error(
            409,
            "Conflict",
            format!("Operation cannot be fulfilled on {}: the object has been modified", name),
        ))
    }

    fn run_write_hook(&self, obj: &mut K) {
        if let Some(hook) = self.on_write.lock().unwrap().as_ref() {
            hook(obj);
        }
    }
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.get_now(name))
    }

    async fn list(&self, selector: &BTreeMap<String, String>) -> Result<Vec<K>> {
        Ok(self
            .all()
            .into_iter()
            .filter(|obj| matches_selector(obj.meta().labels.as_ref(), selector))
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        if self.get_now(&name).is_some() {
            return Err(api_error(409, "AlreadyExists", format!("{} exists", name)));
        }
        let mut created = obj.clone();
        self.stamp_new(&mut created);
        self.run_write_hook(&mut created);
        self.objects.lock().unwrap().insert(name.clone(), created.clone());
        self.journal.record(format!("create {}/{}", Self::kind(), name));
        Ok(created)
    }

    async fn replace(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let Some(live) = self.get_now(&name) else {
            return Err(api_error(404, "NotFound", format!("{} not found", name)));
        };
        self.check_version(&live, obj)?;
        if let Some(reject) = self.reject_replace.lock().unwrap().as_ref() {
            if reject(&live, obj) {
                self.journal.record(format!("rejected {}/{}", Self::kind(), name));
                return Err(api_error(422, "Invalid", format!("{} is invalid: spec: Forbidden", name)));
            }
        }

        let mut replaced = obj.clone();
        let n = self.next();
        let meta = replaced.meta_mut();
        meta.uid = live.meta().uid.clone();
        meta.resource_version = Some(n.to_string());
        meta.generation = Some(live.meta().generation.unwrap_or(1) + 1);
        self.run_write_hook(&mut replaced);
        self.objects.lock().unwrap().insert(name.clone(), replaced.clone());
        self.journal.record(format!("replace {}/{}", Self::kind(), name));
        Ok(replaced)
    }

    async fn replace_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let Some(live) = self.get_now(&name) else {
            return Err(api_error(404, "NotFound", format!("{} not found", name)));
        };
        self.check_version(&live, obj)?;
        let mut replaced = obj.clone();
        replaced.meta_mut().resource_version = Some(self.next().to_string());
        self.objects.lock().unwrap().insert(name.clone(), replaced.clone());
        self.journal.record(format!("replace_status {}/{}", Self::kind(), name));
        Ok(replaced)
    }

    async fn delete(&self, name: &str, propagation: Propagation) -> Result<()> {
        let Some(deleted) = self.objects.lock().unwrap().remove(name) else {
            return Err(api_error(404, "NotFound", format!("{} not found", name)));
        };
        let suffix = match propagation {
            Propagation::Default => "",
            Propagation::Orphan => " orphan",
        };
        self.journal.record(format!("delete {}/{}{}", Self::kind(), name, suffix));

        let replacement = self.on_delete.lock().unwrap().as_ref().and_then(|hook| hook(&deleted));
        if let Some(mut replacement) = replacement {
            replacement.meta_mut().uid = None;
            self.stamp_new(&mut replacement);
            self.objects.lock().unwrap().insert(name.to_string(), replacement);
        }
        Ok(())
    }
}
