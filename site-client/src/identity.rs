//! Pseudonymous visitor and session identifiers.
//!
//! Ids are the current time in milliseconds, base36-encoded, followed by nine random base36
//! characters. They are fine for counting visitors and NOT suitable for anything security related.

use std::sync::Arc;

use rand::Rng;
use site_types::{SessionId, VisitorId};
use stash::{MemoryStorage, Stash};

pub const VISITOR_ID_KEY: &str = "visitor_id";
pub const SESSION_ID_KEY: &str = "session_id";

const RANDOM_SUFFIX_LEN: usize = 9;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub fn generate_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u64;
    let mut id = to_base36(millis);
    let mut rng = rand::thread_rng();
    id.extend((0..RANDOM_SUFFIX_LEN).map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char));
    id
}

/// Whether `id` looks like something [`generate_id`] produced.
pub fn is_generated_id(id: &str) -> bool {
    id.len() > RANDOM_SUFFIX_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_digit() || b.is_ascii_lowercase())
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

pub struct Identity {
    persistent: Arc<Stash>,
    // session scope: lives exactly as long as this value
    session: Stash,
}

impl Identity {
    pub fn new(persistent: Arc<Stash>) -> Self {
        Self {
            persistent,
            session: Stash::new(MemoryStorage::default()),
        }
    }

    /// The visitor id stored for this data directory, minted on first use.
    pub fn visitor_id(&self) -> VisitorId {
        VisitorId::new(get_or_create(&self.persistent, VISITOR_ID_KEY))
    }

    /// The id of the current session, minted on first use.
    pub fn session_id(&self) -> SessionId {
        SessionId::new(get_or_create(&self.session, SESSION_ID_KEY))
    }
}

fn get_or_create(stash: &Stash, key: &str) -> String {
    if let Some(id) = stash.get::<String>(key).filter(|id| !id.is_empty()) {
        return id;
    }
    // re-checked under the stash lock in case another caller minted it first
    let (id, _) = stash.update(key, |id: &mut String| {
        if id.is_empty() {
            *id = generate_id();
            log::info!("Generated new {key}: {id}");
        }
        id.clone()
    });
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash::{Storage, StorageError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_generated_id_format() {
        let id = generate_id();
        assert!(is_generated_id(&id), "{id}");
        // current millis take 8 base36 digits until the year 2059
        assert_eq!(id.len(), 8 + RANDOM_SUFFIX_LEN);
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_700_000_000_000), "loyw3v28");
    }

    #[test]
    fn test_visitor_id_is_stable() {
        let stash = Arc::new(Stash::in_memory());
        let identity = Identity::new(Arc::clone(&stash));

        let first = identity.visitor_id();
        assert!(is_generated_id(first.as_str()));
        assert_eq!(identity.visitor_id(), first);

        // a new identity over the same storage sees the same visitor, but a new session
        let again = Identity::new(Arc::clone(&stash));
        assert_eq!(again.visitor_id(), first);
        assert_ne!(again.session_id(), identity.session_id());
    }

    #[derive(Default)]
    struct CountingStorage {
        inner: MemoryStorage,
        writes: Arc<AtomicUsize>,
    }

    impl Storage for CountingStorage {
        fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
            self.inner.get_item(key)
        }

        fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.inner.set_item(key, value)
        }

        fn remove_item(&self, key: &str) -> Result<(), StorageError> {
            self.inner.remove_item(key)
        }

        fn keys(&self) -> Result<Vec<String>, StorageError> {
            self.inner.keys()
        }
    }

    #[test]
    fn test_known_visitor_id_is_not_rewritten() {
        let storage = CountingStorage::default();
        let writes = Arc::clone(&storage.writes);
        let identity = Identity::new(Arc::new(Stash::new(storage)));

        let first = identity.visitor_id();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        for _ in 0..10 {
            assert_eq!(identity.visitor_id(), first);
        }
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_session_id_is_stable_within_session() {
        let identity = Identity::new(Arc::new(Stash::in_memory()));
        assert_eq!(identity.session_id(), identity.session_id());
    }

    #[test]
    fn test_session_id_is_not_persisted() {
        let stash = Arc::new(Stash::in_memory());
        let identity = Identity::new(Arc::clone(&stash));
        identity.session_id();
        assert_eq!(stash.get::<String>(SESSION_ID_KEY), None);
    }
}
