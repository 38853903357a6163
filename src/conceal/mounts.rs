//! Mount table parsing and the "is this root-related?" rules
//!
//! Input is `/proc/<pid>/mountinfo`:
//!
//! ```text
//! 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
//! (1)(2) (3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
//! ```
//!
//! Field 4 is the source (root of the mount within its filesystem), field 5
//! the mount point, and the filesystem type follows the `-` separator.

use tracing::{debug, warn};

/// Where su installs itself
pub const PRIVILEGED_ROOTS: &[&str] = &["/sbin", "/root/sbin", "/data/adb/su"];

/// Substring of a mount source that identifies the su implementation
pub const SOURCE_MARKER: &str = "/adb/su";

/// Mount points under these trees are overlays on the system partitions
pub const TARGET_MARKERS: &[&str] = &["/system/", "/vendor/", "/original/"];

/// In-memory filesystem used to shadow whole partitions
pub const MEMORY_FS_TYPE: &str = "tmpfs";

/// Partition mount points that should never be a tmpfs
pub const CORE_PARTITIONS: &[&str] = &["/system", "/vendor", "/oem", "/odm"];

/// One line of a mount table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fs_type: String,
}

impl MountEntry {
    /// Parse one mountinfo line. Lines with fewer than 9 fields are ignored.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            return None;
        }

        let fs_type = match fields.iter().position(|f| *f == "-") {
            Some(sep) if sep > 5 => fields.get(sep + 1).copied()?,
            _ => fields[8],
        };

        Some(Self {
            source: unescape(fields[3]),
            target: unescape(fields[4]),
            fs_type: fs_type.to_string(),
        })
    }

    /// Does this mount expose root to whoever can see it?
    pub fn is_root_related(&self) -> bool {
        let target = self.target.as_str();

        if PRIVILEGED_ROOTS.iter().any(|root| is_at_or_under(target, root)) {
            return true;
        }
        if self.source.contains(SOURCE_MARKER) {
            return true;
        }
        if TARGET_MARKERS.iter().any(|marker| target.contains(marker)) {
            return true;
        }
        self.fs_type == MEMORY_FS_TYPE && CORE_PARTITIONS.contains(&target)
    }
}

fn is_at_or_under(path: &str, root: &str) -> bool {
    match path.strip_prefix(root) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash
fn unescape(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3
        && (b'0'..=b'3').contains(&digits[0])
        && digits[1..].iter().all(|d| (b'0'..=b'7').contains(d))
}

/// Parse a whole mount table, skipping malformed lines
pub fn parse_mountinfo(text: &str) -> Vec<MountEntry> {
    text.lines().filter_map(MountEntry::parse).collect()
}

/// Unmount every root-related entry, in table order.
///
/// `unmount` performs the actual (forced, detaching) unmount. Returns the
/// targets that were unmounted successfully; failures are logged and skipped.
pub fn unmount_root_related<F>(entries: &[MountEntry], pid: i32, mut unmount: F) -> Vec<String>
where
    F: FnMut(&str) -> nix::Result<()>,
{
    let mut removed = Vec::new();
    for entry in entries.iter().filter(|e| e.is_root_related()) {
        match unmount(&entry.target) {
            Ok(()) => {
                debug!(pid, target = %entry.target, "unmounted");
                removed.push(entry.target.clone());
            }
            Err(e) => {
                warn!(pid, target = %entry.target, error = %e, "unmount failed");
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    fn line(source: &str, target: &str, fs_type: &str) -> String {
        format!(
            "100 20 0:44 {} {} rw,relatime shared:5 - {} none rw",
            source, target, fs_type
        )
    }

    fn entry(source: &str, target: &str, fs_type: &str) -> MountEntry {
        MountEntry::parse(&line(source, target, fs_type)).unwrap()
    }

    #[test]
    fn test_parse_fields() {
        let e = MountEntry::parse(
            "36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue",
        )
        .unwrap();
        assert_eq!(e.source, "/mnt1");
        assert_eq!(e.target, "/mnt2");
        assert_eq!(e.fs_type, "ext3");
    }

    #[test]
    fn test_parse_without_optional_fields() {
        let e = MountEntry::parse("22 1 0:21 / /vendor ro - tmpfs tmpfs ro").unwrap();
        assert_eq!(e.target, "/vendor");
        assert_eq!(e.fs_type, "tmpfs");
    }

    #[test]
    fn test_parse_rejects_short_lines() {
        assert!(MountEntry::parse("1 2 3 4 5").is_none());
        assert!(MountEntry::parse("").is_none());
        assert_eq!(parse_mountinfo("garbage\n\n").len(), 0);
    }

    #[test]
    fn test_parse_unescapes_paths() {
        let e = entry("/", "/mnt/with\\040space", "ext4");
        assert_eq!(e.target, "/mnt/with space");
        assert_eq!(unescape("/no/escape"), "/no/escape");
        assert_eq!(unescape("/odd\\9"), "/odd\\9");
    }

    #[test]
    fn test_privileged_roots_match_exact_and_nested() {
        assert!(entry("/", "/sbin", "rootfs").is_root_related());
        assert!(entry("/", "/sbin/supersu", "rootfs").is_root_related());
        assert!(entry("/", "/root/sbin", "ext4").is_root_related());
        assert!(entry("/", "/data/adb/su", "ext4").is_root_related());
        assert!(entry("/", "/data/adb/su/bin", "ext4").is_root_related());
        assert!(!entry("/", "/sbinx", "ext4").is_root_related());
        assert!(!entry("/", "/data/adb/superuser", "ext4").is_root_related());
    }

    #[test]
    fn test_source_and_target_markers() {
        assert!(entry("/adb/su/lib", "/some/where", "ext4").is_root_related());
        assert!(entry("/", "/system/xbin/su", "ext4").is_root_related());
        assert!(entry("/", "/vendor/bin/x", "ext4").is_root_related());
        assert!(entry("/", "/mnt/original/app", "ext4").is_root_related());
        assert!(!entry("/", "/system", "ext4").is_root_related());
    }

    #[test]
    fn test_tmpfs_only_on_core_partitions() {
        assert!(entry("/", "/vendor", "tmpfs").is_root_related());
        assert!(entry("/", "/system", "tmpfs").is_root_related());
        assert!(entry("/", "/oem", "tmpfs").is_root_related());
        assert!(entry("/", "/odm", "tmpfs").is_root_related());
        assert!(!entry("/", "/cache", "tmpfs").is_root_related());
        assert!(!entry("/", "/dev", "tmpfs").is_root_related());
    }

    #[test]
    fn test_unmounts_exactly_root_related_entries() {
        let table = format!(
            "{}\n{}\n",
            line("/", "/data/adb/su/bin", "ext4"),
            line("/", "/data/app/com.example", "ext4")
        );
        let entries = parse_mountinfo(&table);
        assert_eq!(entries.len(), 2);

        let mut seen = Vec::new();
        let removed = unmount_root_related(&entries, 100, |target| {
            seen.push(target.to_string());
            Ok(())
        });
        assert_eq!(seen, vec!["/data/adb/su/bin"]);
        assert_eq!(removed, vec!["/data/adb/su/bin"]);
    }

    #[test]
    fn test_tmpfs_vendor_unmounted_but_cache_kept() {
        let table = format!(
            "{}\n{}\n",
            line("/", "/vendor", "tmpfs"),
            line("/", "/cache", "tmpfs")
        );
        let mut seen = Vec::new();
        unmount_root_related(&parse_mountinfo(&table), 100, |target| {
            seen.push(target.to_string());
            Ok(())
        });
        assert_eq!(seen, vec!["/vendor"]);
    }

    #[test]
    fn test_failed_unmount_is_not_reported() {
        let entries = vec![entry("/", "/sbin", "rootfs"), entry("/", "/sbin/su", "rootfs")];
        let removed = unmount_root_related(&entries, 1, |target| {
            if target == "/sbin/su" {
                Err(Errno::EINVAL)
            } else {
                Ok(())
            }
        });
        assert_eq!(removed, vec!["/sbin"]);
    }
}
