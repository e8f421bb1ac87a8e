//! Key-layout metadata and key extraction from argument vectors.

/// Key position layout of one command, indices counted over the full argument vector including
/// the command name at position 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySpec {
    /// First key position; `0` means the command has no keys.
    pub first_key: u32,
    /// Last key position; `-1` means keys run to the end of the arguments.
    pub last_key: i32,
    /// Distance between consecutive keys (`2` for `MSET`-style key/value interleaving).
    pub key_step: u32,
}

impl KeySpec {
    /// Layout for a command without keys.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            first_key: 0,
            last_key: 0,
            key_step: 0,
        }
    }

    /// Layout with explicit positions; `key_step` of zero is normalized to one.
    #[must_use]
    pub const fn new(first_key: u32, last_key: i32, key_step: u32) -> Self {
        Self {
            first_key,
            last_key,
            key_step: if key_step == 0 { 1 } else { key_step },
        }
    }

    /// Whether this command references keys at all.
    #[must_use]
    pub fn has_keys(&self) -> bool {
        self.first_key > 0
    }

    /// Resolves the concrete key index range for an argument vector of `arg_count` entries.
    #[must_use]
    pub fn key_range(&self, arg_count: usize) -> Option<KeyRange> {
        if !self.has_keys() {
            return None;
        }
        let start = self.first_key as usize;
        let end = if self.last_key < 0 {
            arg_count
        } else {
            (self.last_key as usize + 1).min(arg_count)
        };
        if start >= end {
            return None;
        }
        Some(KeyRange {
            start,
            end,
            step: self.key_step as usize,
        })
    }

    /// Extracts the key arguments referenced by this layout.
    #[must_use]
    pub fn extract_keys(&self, args: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let Some(range) = self.key_range(args.len()) else {
            return Vec::new();
        };
        args[range.start..range.end]
            .iter()
            .step_by(range.step)
            .cloned()
            .collect()
    }
}

/// Extracts the keys referenced by one command, honoring the dynamic layout of `EVAL`-style
/// commands whose key count is carried in the arguments themselves.
#[must_use]
pub fn determine_keys(name: &str, spec: &KeySpec, args: &[Vec<u8>]) -> Vec<Vec<u8>> {
    if matches!(name, "EVAL" | "EVALSHA") {
        let declared = args
            .get(2)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|text| text.parse::<usize>().ok())
            .unwrap_or(0);
        let start = 3.min(args.len());
        let end = (3 + declared).min(args.len());
        return args[start..end].to_vec();
    }
    spec.extract_keys(args)
}

/// Resolved key index range: `[start, end)` stepping by `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange {
    /// First key index.
    pub start: usize,
    /// One past the last possible key index.
    pub end: usize,
    /// Distance between consecutive keys.
    pub step: usize,
}

impl KeyRange {
    /// Iterates the key indices in this range.
    pub fn indices(&self) -> impl Iterator<Item = usize> + use<> {
        (self.start..self.end).step_by(self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::KeySpec;
    use googletest::prelude::*;
    use rstest::rstest;

    fn args(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|part| part.as_bytes().to_vec()).collect()
    }

    #[rstest]
    fn single_key_layout_extracts_one_key() {
        let spec = KeySpec::new(1, 1, 1);
        let keys = spec.extract_keys(&args(&["SET", "k", "v"]));
        assert_that!(keys, eq(&vec![b"k".to_vec()]));
    }

    #[rstest]
    fn open_ended_layout_extracts_all_trailing_keys() {
        let spec = KeySpec::new(1, -1, 1);
        let keys = spec.extract_keys(&args(&["MGET", "a", "b", "c"]));
        assert_that!(keys, eq(&vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]));
    }

    #[rstest]
    fn interleaved_layout_skips_values() {
        let spec = KeySpec::new(1, -1, 2);
        let keys = spec.extract_keys(&args(&["MSET", "a", "1", "b", "2"]));
        assert_that!(keys, eq(&vec![b"a".to_vec(), b"b".to_vec()]));
    }

    #[rstest]
    fn keyless_layout_yields_nothing() {
        let spec = KeySpec::none();
        assert_that!(spec.has_keys(), eq(false));
        assert_that!(spec.extract_keys(&args(&["PING"])).is_empty(), eq(true));
    }

    #[rstest]
    fn eval_keys_follow_the_declared_count() {
        let spec = KeySpec::none();
        let argv = args(&["EVAL", "return 1", "2", "k1", "k2", "extra"]);
        let keys = super::determine_keys("EVAL", &spec, &argv);
        assert_that!(keys, eq(&vec![b"k1".to_vec(), b"k2".to_vec()]));
    }
}
