//! String values: the short/long split described in spec §3.
//!
//! > *Short* (length <= 40): interned in a global string table; pointer
//! > equality <=> content equality.
//! > *Long*: not interned; length and hash stored explicitly; hash computed
//! > lazily.
//!
//! Only the *contract* that equal short strings share identity is in scope
//! (spec §1); the interning table implementation here is a plain `HashMap`
//! rather than the original's open-addressed `stringtable`, which is fine
//! because nothing outside this module observes the table's internals.

use std::cell::Cell;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::gc::{GcHeader, GcTag};

/// Short strings this long or shorter are interned (spec §3).
pub const SHORT_STRING_LIMIT: usize = 40;

struct TStringInner {
    header: GcHeader,
    data: Box<str>,
    is_short: bool,
    hash: Cell<Option<u64>>,
}

/// A reference-counted AQL string. Cloning is cheap (bumps the `Rc`).
#[derive(Clone)]
pub struct TString(Rc<TStringInner>);

impl TString {
    /// Build a string without going through the interning table (spec §3
    /// "Long: ... not interned"). For runtime-produced strings — the result
    /// of `..`/`+` concatenation, `tostring` — identity dedup buys nothing
    /// and there's no `StringTable` handle at the call site anyway; content
    /// equality (`TString::eq`) still works regardless of interning.
    pub fn owned(s: impl Into<Box<str>>) -> Self {
        TString::new_long(s)
    }

    fn new_long(s: impl Into<Box<str>>) -> Self {
        TString(Rc::new(TStringInner {
            header: GcHeader::new(GcTag::LongString),
            data: s.into(),
            is_short: false,
            hash: Cell::new(None),
        }))
    }

    pub fn as_str(&self) -> &str {
        &self.0.data
    }

    pub fn len(&self) -> usize {
        self.0.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.data.is_empty()
    }

    pub fn is_short(&self) -> bool {
        self.0.is_short
    }

    /// Content hash, computed lazily and cached — matches spec §3's "hash
    /// computed lazily" note for long strings; short strings benefit from
    /// caching too since `addk`'s constant-table dedup hashes every literal.
    pub fn hash_value(&self) -> u64 {
        if let Some(h) = self.0.hash.get() {
            return h;
        }
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.data.hash(&mut hasher);
        let h = hasher.finish();
        self.0.hash.set(Some(h));
        h
    }
}

impl PartialEq for TString {
    fn eq(&self, other: &Self) -> bool {
        if self.0.is_short && other.0.is_short {
            // Pointer equality <=> content equality for interned strings.
            Rc::ptr_eq(&self.0, &other.0)
        } else {
            self.0.data == other.0.data
        }
    }
}
impl Eq for TString {}

impl Hash for TString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_value().hash(state);
    }
}

impl std::fmt::Debug for TString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0.data)
    }
}

impl std::fmt::Display for TString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.data)
    }
}

/// Global short-string intern table, owned by `GlobalState`.
pub struct StringTable {
    table: HashMap<Box<str>, Rc<TStringInner>>,
}

impl Default for StringTable {
    fn default() -> Self {
        StringTable { table: HashMap::new() }
    }
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern (or create, for long strings) a `TString` from raw content.
    /// Strings of length <= [`SHORT_STRING_LIMIT`] are deduplicated by
    /// content and share an `Rc`, so subsequent calls with equal content
    /// return pointer-equal `TString`s.
    pub fn intern(&mut self, s: &str) -> TString {
        if s.len() > SHORT_STRING_LIMIT {
            return TString::new_long(s);
        }
        if let Some(existing) = self.table.get(s) {
            return TString(Rc::clone(existing));
        }
        let inner = Rc::new(TStringInner {
            header: GcHeader::new(GcTag::LongString),
            data: s.into(),
            is_short: true,
            hash: Cell::new(None),
        });
        self.table.insert(s.into(), Rc::clone(&inner));
        TString(inner)
    }

    /// Number of distinct short strings currently interned. Exposed for
    /// tests and diagnostics only.
    pub fn len(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_strings_intern_by_identity() {
        let mut t = StringTable::new();
        let a = t.intern("hello");
        let b = t.intern("hello");
        assert_eq!(a, b);
        assert!(Rc::ptr_eq(&a.0, &b.0));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn long_strings_compare_by_content_not_identity() {
        let mut t = StringTable::new();
        let long = "x".repeat(SHORT_STRING_LIMIT + 1);
        let a = t.intern(&long);
        let b = t.intern(&long);
        assert_eq!(a, b);
        assert!(!Rc::ptr_eq(&a.0, &b.0));
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn distinct_content_is_not_equal() {
        let mut t = StringTable::new();
        let a = t.intern("foo");
        let b = t.intern("bar");
        assert_ne!(a, b);
    }
}
