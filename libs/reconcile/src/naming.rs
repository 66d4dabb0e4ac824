//! Replica name generation.
//!
//! Replica names have the form `<group>-replica-<suffix>`. The suffix source
//! is injected so the reconciler stays deterministic under test.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// Length of generated random suffixes.
pub const DEFAULT_SUFFIX_LENGTH: usize = 8;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Attempts per name before giving up on avoiding a collision.
const MAX_ATTEMPTS: usize = 16;

/// Source of replica name suffixes.
pub trait NameGenerator: Send + Sync {
    /// Produce a fresh suffix.
    fn suffix(&self) -> String;

    /// Full replica name for a group.
    fn replica_name(&self, group: &str) -> String {
        format!("{}-replica-{}", group, self.suffix())
    }
}

/// Random lowercase suffixes. 26^8 possibilities per name.
#[derive(Debug, Clone)]
pub struct RandomNames {
    length: usize,
}

impl RandomNames {
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(1),
        }
    }
}

impl Default for RandomNames {
    fn default() -> Self {
        Self::new(DEFAULT_SUFFIX_LENGTH)
    }
}

impl NameGenerator for RandomNames {
    fn suffix(&self) -> String {
        let mut rng = rand::rng();
        (0..self.length)
            .map(|_| LETTERS[rng.random_range(0..LETTERS.len())] as char)
            .collect()
    }
}

/// Deterministic suffixes `00000000`, `00000001`, ... for tests and replays.
#[derive(Debug, Default)]
pub struct SequentialNames {
    counter: AtomicU64,
}

impl SequentialNames {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameGenerator for SequentialNames {
    fn suffix(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{:08}", n)
    }
}

/// Generate `count` replica names for `group` that collide neither with
/// `existing` nor with each other.
///
/// A candidate that collides is regenerated a bounded number of times; with a
/// generator that keeps colliding the last candidate is kept and the backend
/// rejects the duplicate.
pub fn unique_names<G>(
    generator: &G,
    group: &str,
    existing: &HashSet<String>,
    count: usize,
) -> Vec<String>
where
    G: NameGenerator + ?Sized,
{
    let mut taken: HashSet<String> = HashSet::with_capacity(count);
    let mut names = Vec::with_capacity(count);

    for _ in 0..count {
        let mut candidate = generator.replica_name(group);
        for _ in 1..MAX_ATTEMPTS {
            if !existing.contains(&candidate) && !taken.contains(&candidate) {
                break;
            }
            candidate = generator.replica_name(group);
        }
        taken.insert(candidate.clone());
        names.push(candidate);
    }

    names
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_random_suffix_shape() {
        let names = RandomNames::default();
        let suffix = names.suffix();
        assert_eq!(suffix.len(), DEFAULT_SUFFIX_LENGTH);
        assert!(suffix.bytes().all(|b| b.is_ascii_lowercase()));
    }

    #[test]
    fn test_replica_name_format() {
        let names = SequentialNames::new();
        assert_eq!(names.replica_name("web"), "web-replica-00000000");
        assert_eq!(names.replica_name("web"), "web-replica-00000001");
    }

    #[test]
    fn test_unique_names_skip_existing() {
        let names = SequentialNames::new();
        let existing: HashSet<String> = ["web-replica-00000000", "web-replica-00000002"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let generated = unique_names(&names, "web", &existing, 2);
        assert_eq!(
            generated,
            vec!["web-replica-00000001", "web-replica-00000003"]
        );
    }

    /// Replays a fixed list of suffixes.
    struct Scripted(Mutex<Vec<&'static str>>);

    impl NameGenerator for Scripted {
        fn suffix(&self) -> String {
            self.0.lock().unwrap().remove(0).to_string()
        }
    }

    #[test]
    fn test_unique_names_no_duplicates_within_batch() {
        let names = Scripted(Mutex::new(vec!["aaaa", "aaaa", "bbbb", "aaaa", "cccc"]));
        let generated = unique_names(&names, "db", &HashSet::new(), 3);
        assert_eq!(
            generated,
            vec!["db-replica-aaaa", "db-replica-bbbb", "db-replica-cccc"]
        );
    }

    #[test]
    fn test_random_names_rarely_collide() {
        let generated = unique_names(&RandomNames::default(), "g", &HashSet::new(), 500);
        let distinct: HashSet<_> = generated.iter().collect();
        assert_eq!(distinct.len(), 500);
    }
}
