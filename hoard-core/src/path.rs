//! Content addressing: map a logical key to a sharded on-disk path.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

/// Width of each shard directory name, in hex chars.
pub const SHARD_WIDTH: usize = 5;

/// Maps a logical key to where it lives under a namespace directory.
pub type PathTransform = fn(&str) -> PathKey;

/// Location of one stored object: the shard directories and the leaf file name.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PathKey {
    segments: Vec<String>,
    full_key: String,
}

impl PathKey {
    pub fn new(segments: Vec<String>, full_key: String) -> Self {
        Self { segments, full_key }
    }

    /// Shard directories, outermost first.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Leaf file name.
    pub fn full_key(&self) -> &str {
        &self.full_key
    }

    /// Shard directories joined with `/`.
    pub fn pathname(&self) -> String {
        self.segments.join("/")
    }

    /// Outermost shard directory, the bucket removed by a delete.
    pub fn first_segment(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Directory part as a relative path.
    pub fn dir(&self) -> PathBuf {
        self.segments.iter().collect()
    }

    /// Directory plus leaf file, relative.
    pub fn file(&self) -> PathBuf {
        self.dir().join(&self.full_key)
    }
}

/// SHA-1 the key, hex-encode it and split the digest into 5-char shard dirs.
pub fn cas_path(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));
    let segments = digest
        .as_bytes()
        .chunks(SHARD_WIDTH)
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    PathKey::new(segments, digest)
}

/// Key used verbatim as both the directory and the file name.
pub fn plain_path(key: &str) -> PathKey {
    PathKey::new(vec![key.to_string()], key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_path_known_key() {
        let p = cas_path("momsMagic");
        assert_eq!(p.pathname(), "e859f/351e1/a12eb/03d6b/424d9/e93d1/2b099/d7d7d");
        assert_eq!(p.full_key(), "e859f351e1a12eb03d6b424d9e93d12b099d7d7d");
        assert_eq!(p.first_segment(), Some("e859f"));
    }

    #[test]
    fn cas_path_segments_rebuild_digest() {
        for key in ["", "a", "picture_1.png", "some/odd key"] {
            let p = cas_path(key);
            assert_eq!(p, cas_path(key));
            assert_eq!(p.segments().len(), 8);
            assert!(p.segments().iter().all(|s| s.len() == SHARD_WIDTH));
            assert_eq!(p.segments().concat(), p.full_key());
        }
    }

    #[test]
    fn file_path_layout() {
        let p = cas_path("momsMagic");
        let expected: PathBuf = [
            "e859f", "351e1", "a12eb", "03d6b", "424d9", "e93d1", "2b099", "d7d7d",
            "e859f351e1a12eb03d6b424d9e93d12b099d7d7d",
        ]
        .iter()
        .collect();
        assert_eq!(p.file(), expected);
    }

    #[test]
    fn plain_path_uses_key() {
        let p = plain_path("notes");
        assert_eq!(p.pathname(), "notes");
        assert_eq!(p.file(), PathBuf::from("notes").join("notes"));
    }
}
