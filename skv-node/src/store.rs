//! # Keyspace Store
//!
//! Numbered logical databases of byte keys with optional expiry. Expired
//! entries are dropped lazily when a command touches them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default number of logical databases.
pub const DEFAULT_DATABASES: usize = 16;

pub const ERR_NOT_INTEGER: &str = "value is not an integer or out of range";
pub const ERR_NO_SUCH_KEY: &str = "no such key";
pub const ERR_INVALID_EXPIRE: &str = "invalid expire time";

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

/// Conditions for a SET.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SetCondition {
    #[default]
    Always,
    /// NX: only when absent.
    IfAbsent,
    /// XX: only when present.
    IfPresent,
}

type Keyspace = HashMap<Vec<u8>, Entry>;

/// All databases of one node plus its command log.
pub struct Store {
    dbs: Vec<Mutex<Keyspace>>,
    password: Option<String>,
    log: Mutex<Vec<String>>,
}

impl Store {
    pub fn new(databases: usize, password: Option<String>) -> Self {
        Store {
            dbs: (0..databases.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            password,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn databases(&self) -> usize {
        self.dbs.len()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Appends an upper-cased command name to the log.
    pub fn record(&self, command: &[u8]) {
        self.log.lock().push(String::from_utf8_lossy(command).to_ascii_uppercase());
    }

    /// Every command received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    fn with_db<T>(&self, db: usize, f: impl FnOnce(&mut Keyspace, Instant) -> T) -> T {
        let mut keyspace = self.dbs[db.min(self.dbs.len() - 1)].lock();
        f(&mut keyspace, Instant::now())
    }

    pub fn get(&self, db: usize, key: &[u8]) -> Option<Vec<u8>> {
        self.with_db(db, |keyspace, now| live(keyspace, key, now).map(|entry| entry.value.clone()))
    }

    pub fn exists(&self, db: usize, key: &[u8]) -> bool {
        self.with_db(db, |keyspace, now| live(keyspace, key, now).is_some())
    }

    /// Stores a value. Returns false when the condition was not met.
    pub fn set(
        &self,
        db: usize,
        key: &[u8],
        value: &[u8],
        ttl: Option<Duration>,
        condition: SetCondition,
    ) -> Result<bool, &'static str> {
        self.with_db(db, |keyspace, now| {
            let expires_at = match ttl {
                Some(ttl) => Some(now.checked_add(ttl).ok_or(ERR_INVALID_EXPIRE)?),
                None => None,
            };
            let present = live(keyspace, key, now).is_some();
            let allowed = match condition {
                SetCondition::Always => true,
                SetCondition::IfAbsent => !present,
                SetCondition::IfPresent => present,
            };
            if allowed {
                keyspace.insert(
                    key.to_vec(),
                    Entry {
                        value: value.to_vec(),
                        expires_at,
                    },
                );
            }
            Ok(allowed)
        })
    }

    /// Sets a TTL; non-positive seconds delete the key. Returns true when
    /// the key existed.
    pub fn expire(&self, db: usize, key: &[u8], seconds: i64) -> Result<bool, &'static str> {
        self.with_db(db, |keyspace, now| {
            if live(keyspace, key, now).is_none() {
                return Ok(false);
            }
            if seconds <= 0 {
                keyspace.remove(key);
                return Ok(true);
            }
            let deadline = now
                .checked_add(Duration::from_secs(seconds as u64))
                .ok_or(ERR_INVALID_EXPIRE)?;
            if let Some(entry) = keyspace.get_mut(key) {
                entry.expires_at = Some(deadline);
            }
            Ok(true)
        })
    }

    /// Remaining TTL in seconds: -2 missing, -1 no expiry.
    pub fn ttl(&self, db: usize, key: &[u8]) -> i64 {
        self.with_db(db, |keyspace, now| match live(keyspace, key, now) {
            None => -2,
            Some(Entry { expires_at: None, .. }) => -1,
            Some(Entry {
                expires_at: Some(deadline),
                ..
            }) => {
                let remaining = deadline.saturating_duration_since(now);
                // Round up so a fresh EX 10 reports 10.
                (remaining.as_millis() as i64 + 999) / 1000
            }
        })
    }

    /// Adds `delta` to an integer value, creating it at 0 when missing.
    pub fn incr_by(&self, db: usize, key: &[u8], delta: i64) -> Result<i64, &'static str> {
        self.with_db(db, |keyspace, now| {
            let current = match live(keyspace, key, now) {
                Some(entry) => parse_integer(&entry.value).ok_or(ERR_NOT_INTEGER)?,
                None => 0,
            };
            let next = current.checked_add(delta).ok_or(ERR_NOT_INTEGER)?;
            let expires_at = keyspace.get(key).and_then(|entry| entry.expires_at);
            keyspace.insert(
                key.to_vec(),
                Entry {
                    value: next.to_string().into_bytes(),
                    expires_at,
                },
            );
            Ok(next)
        })
    }

    /// Removes keys; returns how many existed.
    pub fn delete(&self, db: usize, keys: &[Vec<u8>]) -> i64 {
        self.with_db(db, |keyspace, now| {
            keys.iter()
                .filter(|key| live(keyspace, key, now).is_some() && keyspace.remove(key.as_slice()).is_some())
                .count() as i64
        })
    }

    pub fn count_existing(&self, db: usize, keys: &[Vec<u8>]) -> i64 {
        self.with_db(db, |keyspace, now| {
            keys.iter().filter(|key| live(keyspace, key, now).is_some()).count() as i64
        })
    }

    pub fn keys(&self, db: usize, pattern: &[u8]) -> Vec<Vec<u8>> {
        self.with_db(db, |keyspace, now| {
            keyspace.retain(|_, entry| !entry.is_expired(now));
            let mut keys: Vec<Vec<u8>> = keyspace.keys().filter(|key| glob_match(pattern, key)).cloned().collect();
            keys.sort();
            keys
        })
    }

    /// Moves a value (and its TTL) to a new key, replacing any value there.
    pub fn rename(&self, db: usize, old: &[u8], new: &[u8]) -> Result<(), &'static str> {
        self.with_db(db, |keyspace, now| {
            if live(keyspace, old, now).is_none() {
                return Err(ERR_NO_SUCH_KEY);
            }
            let entry = keyspace.remove(old).ok_or(ERR_NO_SUCH_KEY)?;
            keyspace.insert(new.to_vec(), entry);
            Ok(())
        })
    }

    pub fn flush(&self, db: usize) {
        self.with_db(db, |keyspace, _| keyspace.clear());
    }

    pub fn len(&self, db: usize) -> usize {
        self.with_db(db, |keyspace, now| {
            keyspace.retain(|_, entry| !entry.is_expired(now));
            keyspace.len()
        })
    }
}

/// Returns the entry when present and not expired, dropping it otherwise.
fn live<'a>(keyspace: &'a mut Keyspace, key: &[u8], now: Instant) -> Option<&'a Entry> {
    if keyspace.get(key).is_some_and(|entry| entry.is_expired(now)) {
        keyspace.remove(key);
        return None;
    }
    keyspace.get(key)
}

/// Strict decimal integer: optional '-', digits only.
fn parse_integer(value: &[u8]) -> Option<i64> {
    if value.first() == Some(&b'+') {
        return None;
    }
    std::str::from_utf8(value).ok()?.parse::<i64>().ok()
}

/// Glob matching with `*`, `?`, `[...]` classes (`^` negation, ranges) and
/// `\` escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Backtrack point for the most recent '*'.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = match_class(pattern, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                literal => {
                    if literal == text[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }
        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&b| b == b'*')
}

/// Evaluates a `[...]` class starting at `start`; returns whether `ch`
/// matched and the index after the class, or None when unterminated.
fn match_class(pattern: &[u8], start: usize, ch: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < pattern.len() {
        let mut c = pattern[i];
        if c == b']' && !first {
            return Some((matched != negate, i + 1));
        }
        first = false;
        if c == b'\\' && i + 1 < pattern.len() {
            i += 1;
            c = pattern[i];
        }
        if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
            let (lo, hi) = (c.min(pattern[i + 2]), c.max(pattern[i + 2]));
            if (lo..=hi).contains(&ch) {
                matched = true;
            }
            i += 3;
        } else {
            if c == ch {
                matched = true;
            }
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_respects_conditions() {
        let store = Store::new(2, None);
        assert_eq!(store.set(0, b"k", b"1", None, SetCondition::IfAbsent), Ok(true));
        assert_eq!(store.set(0, b"k", b"2", None, SetCondition::IfAbsent), Ok(false));
        assert_eq!(store.set(0, b"k", b"3", None, SetCondition::IfPresent), Ok(true));
        assert_eq!(store.get(0, b"k"), Some(b"3".to_vec()));
        assert_eq!(store.get(1, b"k"), None);
    }

    #[test]
    fn expired_entries_disappear() {
        let store = Store::new(1, None);
        store.set(0, b"k", b"v", Some(Duration::from_millis(0)), SetCondition::Always).unwrap();
        assert_eq!(store.get(0, b"k"), None);
        assert_eq!(store.ttl(0, b"k"), -2);
    }

    #[test]
    fn incr_rejects_non_integers() {
        let store = Store::new(1, None);
        assert_eq!(store.incr_by(0, b"n", 2), Ok(2));
        store.set(0, b"f", b"5.0", None, SetCondition::Always).unwrap();
        assert_eq!(store.incr_by(0, b"f", 1), Err(ERR_NOT_INTEGER));
        store.set(0, b"max", i64::MAX.to_string().as_bytes(), None, SetCondition::Always).unwrap();
        assert_eq!(store.incr_by(0, b"max", 1), Err(ERR_NOT_INTEGER));
    }

    #[test]
    fn rename_moves_value_and_ttl() {
        let store = Store::new(1, None);
        store.set(0, b"a", b"v", Some(Duration::from_secs(100)), SetCondition::Always).unwrap();
        store.rename(0, b"a", b"b").unwrap();
        assert_eq!(store.get(0, b"a"), None);
        assert_eq!(store.get(0, b"b"), Some(b"v".to_vec()));
        assert!(store.ttl(0, b"b") > 0);
        assert_eq!(store.rename(0, b"missing", b"c"), Err(ERR_NO_SUCH_KEY));
    }

    #[test]
    fn unrepresentable_expiry_is_rejected() {
        let store = Store::new(1, None);
        let forever = Duration::from_secs(i64::MAX as u64);
        assert_eq!(store.set(0, b"k", b"v", Some(forever), SetCondition::Always), Err(ERR_INVALID_EXPIRE));
        assert_eq!(store.get(0, b"k"), None);

        store.set(0, b"k", b"v", None, SetCondition::Always).unwrap();
        assert_eq!(store.expire(0, b"k", i64::MAX), Err(ERR_INVALID_EXPIRE));
        assert_eq!(store.ttl(0, b"k"), -1);
        assert_eq!(store.expire(0, b"k", 30), Ok(true));
        assert_eq!(store.expire(0, b"missing", 30), Ok(false));
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match(b"app:1:*", b"app:1:user:7"));
        assert!(!glob_match(b"app:1:*", b"app:2:user:7"));
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[^e]llo", b"hello"));
        assert!(glob_match(b"h[a-c]llo", b"hbllo"));
        assert!(glob_match(b"a\\*b", b"a*b"));
        assert!(!glob_match(b"a\\*b", b"axb"));
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"*:*:end", b"x:y:z:end"));
    }
}
