//! Script identity: 40-character lowercase hexadecimal SHA-1 digests.

use sha1::{Digest, Sha1};

/// Computes the canonical digest of a script body.
#[must_use]
pub fn script_digest(body: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    let mut text = String::with_capacity(digest.len() * 2);
    for byte in digest {
        text.push_str(&format!("{byte:02x}"));
    }
    text
}

/// Returns whether `text` has the exact shape of a script digest.
#[must_use]
pub fn is_sha_digest(text: &str) -> bool {
    text.len() == 40
        && text
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

#[cfg(test)]
mod tests {
    use super::{is_sha_digest, script_digest};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn digest_is_forty_lowercase_hex_characters() {
        let digest = script_digest("return 1");
        assert_that!(digest.len(), eq(40_usize));
        assert_that!(is_sha_digest(&digest), eq(true));
    }

    #[rstest]
    fn digest_is_stable_for_equal_bodies() {
        assert_that!(script_digest("return 1"), eq(&script_digest("return 1")));
        assert_that!(
            script_digest("return 1") == script_digest("return 2"),
            eq(false)
        );
    }

    #[rstest]
    #[case("")]
    #[case("zz")]
    #[case("ABCDEF0123456789ABCDEF0123456789ABCDEF01")]
    fn digest_shape_rejects_non_lowercase_hex(#[case] input: &str) {
        assert_that!(is_sha_digest(input), eq(false));
    }
}
