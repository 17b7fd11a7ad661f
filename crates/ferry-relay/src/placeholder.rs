//! Placeholder blobs: delivery bookkeeping for one relay file.

/// Decoded placeholder body.
///
/// Line 1 carries the pushed file's last-modified time; every further line
/// is the identifier of a client that already pulled the file. Readers are
/// only ever appended, and only under the file's lock.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaceholderMeta {
    pub last_modified: Option<String>,
    pub readers: Vec<String>,
}

impl PlaceholderMeta {
    pub fn parse(body: &str) -> Self {
        let mut lines = body.lines();
        let last_modified = match lines.next() {
            None | Some("") => None,
            Some(first) => Some(first.to_owned()),
        };
        Self {
            last_modified,
            readers: lines.map(str::to_owned).collect(),
        }
    }

    /// Last-modified time as UTC epoch seconds, when it parses as such.
    pub fn last_modified_secs(&self) -> Option<u64> {
        self.last_modified.as_deref()?.trim().parse().ok()
    }

    pub fn has_reader(&self, client: &str) -> bool {
        self.readers.iter().any(|reader| reader == client)
    }

    /// Number of recorded pulls.
    pub fn reads(&self) -> usize {
        self.readers.len()
    }
}
