//! Thread-local keyword contexts
//!
//! Keywords that need per-worker state register a constructor/destructor pair
//! with the detection context. Every worker context then owns one instance per
//! registration, addressed by the dense slot id handed out at registration.

use crate::detect::DetectError;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque per-worker state owned by a keyword
pub type KeywordThreadCtx = Box<dyn Any + Send>;

/// Constructor/destructor pair for a keyword's per-worker state
pub trait ThreadKeyword: Send + Sync {
    /// Build a fresh instance for one worker. `None` aborts the construction of
    /// that worker context.
    fn init_thread_ctx(&self) -> Option<KeywordThreadCtx>;

    /// Tear down an instance built by [`ThreadKeyword::init_thread_ctx`]
    fn free_thread_ctx(&self, ctx: KeywordThreadCtx) {
        drop(ctx);
    }
}

/// [`ThreadKeyword`] built from a pair of closures
pub struct KeywordFns<I, F> {
    init: I,
    free: F,
}

impl<I, F> KeywordFns<I, F>
where
    I: Fn() -> Option<KeywordThreadCtx> + Send + Sync,
    F: Fn(KeywordThreadCtx) + Send + Sync,
{
    pub fn new(init: I, free: F) -> Self {
        Self { init, free }
    }
}

impl<I, F> ThreadKeyword for KeywordFns<I, F>
where
    I: Fn() -> Option<KeywordThreadCtx> + Send + Sync,
    F: Fn(KeywordThreadCtx) + Send + Sync,
{
    fn init_thread_ctx(&self) -> Option<KeywordThreadCtx> {
        (self.init)()
    }

    fn free_thread_ctx(&self, ctx: KeywordThreadCtx) {
        (self.free)(ctx)
    }
}

/// One registered keyword
#[derive(Clone)]
pub struct KeywordRegistration {
    pub name: String,
    pub keyword: Arc<dyn ThreadKeyword>,
    /// Dense id, assigned in registration order
    pub slot: usize,
}

impl fmt::Debug for KeywordRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeywordRegistration")
            .field("name", &self.name)
            .field("slot", &self.slot)
            .finish()
    }
}

/// Append-only list of keyword registrations
#[derive(Debug, Default)]
pub struct KeywordList {
    entries: Vec<KeywordRegistration>,
}

impl KeywordList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a keyword and return its slot id
    pub fn register(&mut self, name: &str, keyword: Arc<dyn ThreadKeyword>) -> Result<usize, DetectError> {
        if name.trim().is_empty() {
            return Err(DetectError::KeywordRegistration(
                "keyword name must not be empty".to_string(),
            ));
        }

        self.entries.try_reserve(1)?;
        let slot: usize = self.entries.len();
        self.entries.push(KeywordRegistration {
            name: name.to_string(),
            keyword,
            slot,
        });

        Ok(slot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&KeywordRegistration> {
        self.entries.get(slot)
    }

    /// Registrations in slot order
    pub fn iter(&self) -> std::slice::Iter<'_, KeywordRegistration> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_keyword() -> Arc<dyn ThreadKeyword> {
        Arc::new(KeywordFns::new(
            || Some(Box::new(0u64) as KeywordThreadCtx),
            |ctx: KeywordThreadCtx| drop(ctx),
        ))
    }

    #[test]
    fn test_slots_are_dense_in_registration_order() {
        let mut list: KeywordList = KeywordList::new();
        assert_eq!(list.register("byte_test", counter_keyword()).unwrap(), 0);
        assert_eq!(list.register("lua", counter_keyword()).unwrap(), 1);
        assert_eq!(list.register("byte_test", counter_keyword()).unwrap(), 2);

        let names: Vec<&str> = list.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["byte_test", "lua", "byte_test"]);
        assert_eq!(list.get(1).map(|r| r.slot), Some(1));
        assert!(list.get(3).is_none());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut list: KeywordList = KeywordList::new();
        assert!(matches!(
            list.register("  ", counter_keyword()),
            Err(DetectError::KeywordRegistration(_))
        ));
        assert!(list.is_empty());
    }
}
