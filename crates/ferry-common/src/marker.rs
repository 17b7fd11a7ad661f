//! Naming scheme for the auxiliary blobs kept next to regular files on the
//! relay: placeholders, locks and messages.
//!
//! Markers are named after the regular file they annotate, with a configured
//! prefix and suffix wrapped around the final path component. The directory
//! part is preserved verbatim, so a marker always lives next to its file.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::Error;

/// Splits a relay path into its directory part and final component.
///
/// Relay paths are `/`-separated regardless of the local platform.
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

fn rejoin(dir: &str, base: &str) -> String {
    if dir.is_empty() {
        base.to_owned()
    } else {
        format!("{dir}/{base}")
    }
}

/// Prefix/suffix pair wrapped around a filename to form a marker name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Affixes {
    prefix: String,
    suffix: String,
}

impl Affixes {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    fn encode(&self, base: &str) -> String {
        format!("{}{}{}", self.prefix, base, self.suffix)
    }

    fn matches(&self, base: &str) -> bool {
        base.len() > self.prefix.len() + self.suffix.len()
            && base.starts_with(&self.prefix)
            && base.ends_with(&self.suffix)
    }

    fn decode<'a>(&self, base: &'a str) -> Option<&'a str> {
        if self.matches(base) {
            Some(&base[self.prefix.len()..base.len() - self.suffix.len()])
        } else {
            None
        }
    }
}

/// How message names are stamped.
///
/// A stamp is an extra `.`-separated segment between the filename and the
/// message suffix; it may not itself contain `.`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MessageStamp {
    /// No stamp segment.
    #[default]
    Plain,
    /// UTC epoch seconds at encoding time.
    Timestamped,
}

impl MessageStamp {
    fn stamp(&self) -> Option<String> {
        match self {
            Self::Plain => None,
            Self::Timestamped => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default();
                Some(now.as_secs().to_string())
            }
        }
    }
}

/// Maps regular filenames to placeholder, lock and message names and back.
///
/// All naming functions are idempotent: feeding a marker name back in
/// returns it unchanged.
#[derive(Clone, Debug)]
pub struct MarkerCodec {
    placeholder: Affixes,
    lock: Affixes,
    message: Affixes,
    stamp: MessageStamp,
}

impl Default for MarkerCodec {
    fn default() -> Self {
        Self {
            placeholder: Affixes::new(".", ".placeholder"),
            lock: Affixes::new(".", ".lock"),
            message: Affixes::new(".", ".message"),
            stamp: MessageStamp::Plain,
        }
    }
}

impl MarkerCodec {
    pub fn new(placeholder: Affixes, lock: Affixes, message: Affixes, stamp: MessageStamp) -> Self {
        Self {
            placeholder,
            lock,
            message,
            stamp,
        }
    }

    /// Name of the placeholder blob for `path`.
    pub fn placeholder_name(&self, path: &str) -> String {
        let (dir, base) = split_path(path);
        if self.placeholder.matches(base) {
            path.to_owned()
        } else {
            rejoin(dir, &self.placeholder.encode(base))
        }
    }

    /// Name of the lock blob for `path`.
    pub fn lock_name(&self, path: &str) -> String {
        let (dir, base) = split_path(path);
        if self.lock.matches(base) {
            path.to_owned()
        } else {
            rejoin(dir, &self.lock.encode(base))
        }
    }

    /// Name of the message blob for `path`, including the stamp segment when
    /// stamping is configured. Stamps containing `.` are rejected.
    pub fn message_name(&self, path: &str) -> Result<String, Error> {
        let (dir, base) = split_path(path);
        if self.message.matches(base) {
            return Ok(path.to_owned());
        }
        let stamped = match self.stamp.stamp() {
            None => base.to_owned(),
            Some(stamp) => {
                if stamp.contains('.') {
                    return Err(Error::InvalidMarker(format!(
                        "'.' in message stamp '{stamp}'"
                    )));
                }
                format!("{base}.{stamp}")
            }
        };
        Ok(rejoin(dir, &self.message.encode(&stamped)))
    }

    pub fn is_placeholder(&self, path: &str) -> bool {
        self.placeholder.matches(split_path(path).1)
    }

    pub fn is_lock(&self, path: &str) -> bool {
        self.lock.matches(split_path(path).1)
    }

    pub fn is_message(&self, path: &str) -> bool {
        self.message.matches(split_path(path).1)
    }

    pub fn is_marker(&self, path: &str) -> bool {
        let base = split_path(path).1;
        self.lock.matches(base) || self.placeholder.matches(base) || self.message.matches(base)
    }

    /// Recovers the regular filename from a placeholder name.
    pub fn from_placeholder(&self, path: &str) -> Result<String, Error> {
        let (dir, base) = split_path(path);
        self.placeholder
            .decode(base)
            .map(|stem| rejoin(dir, stem))
            .ok_or_else(|| Error::InvalidMarker(format!("'{path}' is not a placeholder name")))
    }

    /// Recovers the regular filename from a lock name.
    pub fn from_lock(&self, path: &str) -> Result<String, Error> {
        let (dir, base) = split_path(path);
        self.lock
            .decode(base)
            .map(|stem| rejoin(dir, stem))
            .ok_or_else(|| Error::InvalidMarker(format!("'{path}' is not a lock name")))
    }

    /// Recovers the regular filename from a message name, stripping the stamp
    /// segment when stamping is configured.
    pub fn from_message(&self, path: &str) -> Result<String, Error> {
        let (dir, base) = split_path(path);
        let stem = self
            .message
            .decode(base)
            .ok_or_else(|| Error::InvalidMarker(format!("'{path}' is not a message name")))?;
        let stem = match self.stamp {
            MessageStamp::Plain => stem,
            MessageStamp::Timestamped => {
                stem.rsplit_once('.')
                    .map(|(name, _stamp)| name)
                    .ok_or_else(|| {
                        Error::InvalidMarker(format!("missing stamp segment in '{path}'"))
                    })?
            }
        };
        Ok(rejoin(dir, stem))
    }

    /// Recovers the regular filename from any marker name.
    pub fn from_marker(&self, path: &str) -> Result<String, Error> {
        let base = split_path(path).1;
        if self.lock.matches(base) {
            self.from_lock(path)
        } else if self.placeholder.matches(base) {
            self.from_placeholder(path)
        } else if self.message.matches(base) {
            self.from_message(path)
        } else {
            Err(Error::InvalidMarker(format!(
                "'{path}' is not a marker name"
            )))
        }
    }

    /// Refuses regular filenames that would collide with marker names.
    ///
    /// This is the ingest-side guarantee that marker names stay injective:
    /// a user file that classifies as a marker is never accepted for
    /// transfer.
    pub fn check_regular(&self, path: &str) -> Result<(), Error> {
        if self.is_marker(path) {
            Err(Error::ReservedName(path.to_owned()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("hello.txt")]
    #[case("sub/dir/hello.txt")]
    #[case("no-extension")]
    fn name_decode_roundtrip(#[case] path: &str) {
        let codec = MarkerCodec::default();

        let placeholder = codec.placeholder_name(path);
        assert!(codec.is_placeholder(&placeholder));
        assert_eq!(codec.from_placeholder(&placeholder).unwrap(), path);

        let lock = codec.lock_name(path);
        assert!(codec.is_lock(&lock));
        assert_eq!(codec.from_lock(&lock).unwrap(), path);

        let message = codec.message_name(path).unwrap();
        assert!(codec.is_message(&message));
        assert_eq!(codec.from_message(&message).unwrap(), path);
    }

    #[test]
    fn naming_is_idempotent() {
        let codec = MarkerCodec::default();
        let once = codec.placeholder_name("a/b.txt");
        assert_eq!(codec.placeholder_name(&once), once);
        let once = codec.lock_name("a/b.txt");
        assert_eq!(codec.lock_name(&once), once);
    }

    #[test]
    fn directory_part_is_preserved() {
        let codec = MarkerCodec::default();
        assert_eq!(codec.lock_name("music/a.flac"), "music/.a.flac.lock");
        assert_eq!(codec.placeholder_name("x"), ".x.placeholder");
    }

    #[test]
    fn stamped_messages_roundtrip() {
        let codec = MarkerCodec::new(
            Affixes::new(".", ".placeholder"),
            Affixes::new(".", ".lock"),
            Affixes::new(".", ".message"),
            MessageStamp::Timestamped,
        );
        let name = codec.message_name("notes.txt").unwrap();
        assert!(codec.is_message(&name));
        assert_eq!(codec.from_message(&name).unwrap(), "notes.txt");
    }

    #[test]
    fn classifiers_reject_plain_names() {
        let codec = MarkerCodec::default();
        assert!(!codec.is_marker("hello.txt"));
        assert!(!codec.is_lock(".hidden"));
        // The marker wrapping must leave a non-empty stem.
        assert!(!codec.is_lock("..lock"));
    }

    #[test]
    fn reserved_names_are_refused() {
        let codec = MarkerCodec::default();
        assert!(codec.check_regular("docs/report.pdf").is_ok());
        assert!(matches!(
            codec.check_regular("docs/.foo.lock"),
            Err(Error::ReservedName(_))
        ));
        assert!(matches!(
            codec.check_regular(".x.placeholder"),
            Err(Error::ReservedName(_))
        ));
    }

    #[test]
    fn markers_of_markers_stay_distinct() {
        let codec = MarkerCodec::default();
        // A lock wrapped around an odd user filename never classifies as a
        // placeholder, and vice versa.
        let lock = codec.lock_name(".weird.placeholder");
        assert!(codec.is_lock(&lock));
        assert!(!codec.is_placeholder(&lock));
        let placeholder = codec.placeholder_name("ordinary");
        assert!(!codec.is_lock(&placeholder));
    }
}
