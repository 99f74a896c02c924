//! Remote metadata to POSIX attributes

use std::time::SystemTime;

use chrono::{NaiveDateTime, Utc};
use tracing::debug;

use crate::remote::{EntryKind, Metadata};

/// Timestamp layouts the remote uses for modification times
const TIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%d %H:%M:%S"];

const FOLDER_PERM: u16 = 0o755;
const FILE_PERM: u16 = 0o644;

/// POSIX view of one remote entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    pub kind: EntryKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: SystemTime,
    pub atime: SystemTime,
}

impl FileAttributes {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let now = SystemTime::now();
        let (size, perm, nlink) = match metadata.kind {
            EntryKind::Folder => (0, FOLDER_PERM, 2),
            EntryKind::File => (metadata.size, FILE_PERM, 1),
        };
        let mtime = metadata
            .modified
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(now);

        // The remote has no owners; everything belongs to whoever mounted it
        let (uid, gid) = unsafe { (libc::geteuid(), libc::getegid()) };

        Self {
            kind: metadata.kind,
            size,
            perm,
            nlink,
            uid,
            gid,
            mtime,
            atime: now,
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }
}

/// Parse a remote timestamp, accepting either known layout as UTC
pub fn parse_timestamp(value: &str) -> Option<SystemTime> {
    let parsed = TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok());
    match parsed {
        Some(naive) => Some(SystemTime::from(naive.and_utc())),
        None => {
            debug!(value, "unrecognized timestamp, using current time");
            None
        }
    }
}

/// Format a time in the remote's primary layout
pub fn format_timestamp(time: chrono::DateTime<Utc>) -> String {
    time.format(TIME_FORMATS[0]).to_string()
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn test_both_timestamp_formats_agree() {
        let iso = parse_timestamp("2024-01-02T03:04:05Z").unwrap();
        let spaced = parse_timestamp("2024-01-02 03:04:05").unwrap();
        assert_eq!(iso, spaced);
        assert_eq!(iso, UNIX_EPOCH + Duration::from_secs(1_704_164_645));
    }

    #[test]
    fn test_bad_timestamp() {
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_folder_attributes() {
        let attrs = FileAttributes::from_metadata(&Metadata::folder("/docs"));
        assert!(attrs.is_folder());
        assert_eq!(attrs.size, 0);
        assert_eq!(attrs.perm, 0o755);
        assert_eq!(attrs.nlink, 2);
        assert_eq!(attrs.uid, unsafe { libc::geteuid() });
    }

    #[test]
    fn test_file_attributes() {
        let metadata = Metadata::file("/a.txt", 42).with_modified("2024-01-02 03:04:05");
        let attrs = FileAttributes::from_metadata(&metadata);
        assert_eq!(attrs.size, 42);
        assert_eq!(attrs.perm, 0o644);
        assert_eq!(attrs.nlink, 1);
        assert_eq!(attrs.mtime, parse_timestamp("2024-01-02T03:04:05Z").unwrap());
    }

    #[test]
    fn test_missing_mtime_uses_now() {
        let before = SystemTime::now();
        let attrs = FileAttributes::from_metadata(&Metadata::file("/a", 1));
        assert!(attrs.mtime >= before);
    }

    #[test]
    fn test_format_round_trips_through_parse() {
        let time = chrono::DateTime::from_timestamp(1_704_164_645, 0).unwrap();
        assert_eq!(format_timestamp(time), "2024-01-02T03:04:05Z");
    }
}
