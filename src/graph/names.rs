//! Name encoding.
//!
//! Attribute names are stored in records as 32-bit codes. The mapping lives
//! in the main database so it is persisted with the rest of the metadata:
//!
//! ```text
//! \0nm32:<name>    -> code     (decimal)
//! \0nm32#:<code>   -> name
//! \0nm32counter    -> next free code
//! ```
//!
//! Encoding is monotonic: once a name has a code it keeps it, and codes are
//! never handed out twice.

use crate::cluster::util::to_u64;
use crate::error::{GraphError, Result};
use crate::storage::MainDb;

const NAME_PREFIX: &str = "\u{0}nm32:";
const CODE_PREFIX: &str = "\u{0}nm32#:";
const COUNTER_KEY: &str = "\u{0}nm32counter";

/// Encoder over a mutable main database.
pub struct NamesManager<'a> {
    db: &'a mut MainDb,
}

impl<'a> NamesManager<'a> {
    pub fn new(db: &'a mut MainDb) -> Self {
        Self { db }
    }

    /// Encode a name. With `create` unset this is a read-only probe and
    /// returns `None` for unknown names.
    pub fn encode32(&mut self, name: &str, create: bool) -> Result<Option<u32>> {
        if let Some(code) = lookup32(self.db, name) {
            return Ok(Some(code));
        }
        if !create {
            return Ok(None);
        }

        let next = self.db.get(COUNTER_KEY).map(to_u64).unwrap_or(1);
        let code = u32::try_from(next)
            .map_err(|_| GraphError::Storage("Name code space exhausted".to_string()))?;

        self.db.insert(format!("{}{}", NAME_PREFIX, name), code.to_string());
        self.db.insert(format!("{}{}", CODE_PREFIX, code), name.to_string());
        self.db.insert(COUNTER_KEY.to_string(), (next + 1).to_string());

        Ok(Some(code))
    }

    pub fn decode32(&self, code: u32) -> Option<String> {
        decode32(self.db, code)
    }
}

/// Code of an already encoded name.
pub fn lookup32(db: &MainDb, name: &str) -> Option<u32> {
    db.get(&format!("{}{}", NAME_PREFIX, name))
        .and_then(|code| code.parse::<u32>().ok())
}

/// Name behind a code.
pub fn decode32(db: &MainDb, code: u32) -> Option<String> {
    db.get(&format!("{}{}", CODE_PREFIX, code)).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_does_not_allocate() {
        let mut db = MainDb::new();
        let mut nm = NamesManager::new(&mut db);
        assert_eq!(nm.encode32("age", false).unwrap(), None);
        assert!(db.is_empty());
    }

    #[test]
    fn test_encode_is_stable() {
        let mut db = MainDb::new();
        let mut nm = NamesManager::new(&mut db);

        let age = nm.encode32("age", true).unwrap().unwrap();
        let name = nm.encode32("colour", true).unwrap().unwrap();
        assert_ne!(age, name);
        assert_eq!(nm.encode32("age", true).unwrap(), Some(age));
        assert_eq!(nm.encode32("age", false).unwrap(), Some(age));
        assert_eq!(nm.decode32(name), Some("colour".to_string()));
    }

    #[test]
    fn test_codes_never_reused() {
        let mut db = MainDb::new();
        let first = NamesManager::new(&mut db).encode32("a", true).unwrap().unwrap();

        // Removing the name mapping must not free its code
        db.remove(&format!("{}a", NAME_PREFIX));
        let second = NamesManager::new(&mut db).encode32("b", true).unwrap().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_lookup_and_decode_free_functions() {
        let mut db = MainDb::new();
        let code = NamesManager::new(&mut db).encode32("mood", true).unwrap().unwrap();
        assert_eq!(lookup32(&db, "mood"), Some(code));
        assert_eq!(decode32(&db, code), Some("mood".to_string()));
        assert_eq!(decode32(&db, code + 100), None);
    }
}
