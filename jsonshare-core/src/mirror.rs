//! Observable in-memory copy of a shared document.
//!
//! Every mutating method applies the change first, then calls each
//! registered listener synchronously, in registration order. Mutations that
//! leave the document unchanged do not notify.

use std::fmt;

use serde_json::Value;

use crate::types::Document;

/// What a single mutation did to the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorChange {
    Set { key: String },
    Removed { key: String },
    /// Several keys may have changed at once (replace, merge, update).
    Replaced,
}

/// Listeners see the change and the document as it is after the change.
///
/// They run while the owner holds the mirror, so they must not re-enter it.
pub type Listener = Box<dyn Fn(&MirrorChange, &Document) + Send + Sync>;

pub struct Mirror {
    data: Document,
    listeners: Vec<Listener>,
}

impl Mirror {
    pub fn new(data: Document) -> Self {
        Self {
            data,
            listeners: Vec::new(),
        }
    }

    pub fn subscribe<F>(&mut self, listener: F)
    where
        F: Fn(&MirrorChange, &Document) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn document(&self) -> &Document {
        &self.data
    }

    pub fn snapshot(&self) -> Document {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Set `key` to `value`. Returns `true` if the mirror changed.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        if self.data.get(&key) == Some(&value) {
            return false;
        }
        self.data.insert(key.clone(), value);
        self.emit(&MirrorChange::Set { key });
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.data.remove(key)?;
        self.emit(&MirrorChange::Removed {
            key: key.to_owned(),
        });
        Some(removed)
    }

    /// Replace the entire key set; keys absent from `document` are dropped.
    pub fn replace(&mut self, document: Document) -> bool {
        if self.data == document {
            return false;
        }
        self.data = document;
        self.emit(&MirrorChange::Replaced);
        true
    }

    /// Shallow-merge `document` over the current content.
    pub fn merge(&mut self, document: Document) -> bool {
        self.update(|data| {
            for (key, value) in document {
                data.insert(key, value);
            }
        })
    }

    /// Apply an arbitrary edit; listeners fire once if anything changed.
    pub fn update<F>(&mut self, edit: F) -> bool
    where
        F: FnOnce(&mut Document),
    {
        let mut next = self.data.clone();
        edit(&mut next);
        self.replace(next)
    }

    fn emit(&self, change: &MirrorChange) {
        for listener in &self.listeners {
            listener(change, &self.data);
        }
    }
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new(Document::new())
    }
}

impl fmt::Debug for Mirror {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mirror")
            .field("data", &self.data)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn recording_mirror() -> (Mirror, Arc<Mutex<Vec<MirrorChange>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut mirror = Mirror::default();
        let sink = seen.clone();
        mirror.subscribe(move |change, _| sink.lock().unwrap().push(change.clone()));
        (mirror, seen)
    }

    #[test]
    fn set_notifies_with_key() {
        let (mut mirror, seen) = recording_mirror();
        assert!(mirror.set("theme", json!("dark")));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[MirrorChange::Set {
                key: "theme".into()
            }]
        );
        assert_eq!(mirror.get("theme"), Some(&json!("dark")));
    }

    #[test]
    fn setting_same_value_is_silent() {
        let (mut mirror, seen) = recording_mirror();
        mirror.set("n", json!(1));
        assert!(!mirror.set("n", json!(1)));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn removing_absent_key_is_silent() {
        let (mut mirror, seen) = recording_mirror();
        assert!(mirror.remove("missing").is_none());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn replace_drops_missing_keys() {
        let (mut mirror, seen) = recording_mirror();
        mirror.set("a", json!(1));
        mirror.set("b", json!(2));

        let mut next = Document::new();
        next.insert("b".into(), json!(3));
        assert!(mirror.replace(next));

        assert_eq!(Value::Object(mirror.snapshot()), json!({"b": 3}));
        assert_eq!(seen.lock().unwrap().last(), Some(&MirrorChange::Replaced));
    }

    #[test]
    fn update_notifies_once_for_many_edits() {
        let (mut mirror, seen) = recording_mirror();
        mirror.update(|doc| {
            doc.insert("x".into(), json!(1));
            doc.insert("y".into(), json!(2));
            doc.insert("z".into(), json!(3));
        });
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(mirror.len(), 3);
    }

    #[test]
    fn listener_observes_post_change_document() {
        let mut mirror = Mirror::default();
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        mirror.subscribe(move |_, doc| *sink.lock().unwrap() = doc.get("k").cloned());
        mirror.set("k", json!("v"));
        assert_eq!(*observed.lock().unwrap(), Some(json!("v")));
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut mirror = Mirror::default();
        for tag in ["first", "second"] {
            let order = order.clone();
            mirror.subscribe(move |_, _| order.lock().unwrap().push(tag));
        }
        mirror.set("k", json!(true));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }
}
