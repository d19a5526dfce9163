//! Identifies the process touching a monitored file.
//!
//! On Linux the `/proc/<pid>/fd` tables are scanned for an open handle on
//! the path; the matching process is then described via `sysinfo` (name,
//! pid, user, command line, parent). Capture is best effort: short-lived
//! accessors are often gone before the scan runs, and other users'
//! processes may be unreadable without privileges. Unsupported platforms
//! simply yield nothing.

use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};
use sysinfo::{Pid, System, Users};
use tracing::debug;

const CMDLINE_LIMIT: usize = 500;

/// Attributes of the process found holding a monitored file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub process_name: String,
    pub process_id: u32,
    pub process_user: Option<String>,
    pub process_cmdline: Option<String>,
    pub parent_id: Option<u32>,
    pub parent_name: Option<String>,
}

impl ProcessInfo {
    /// Merges the captured attributes into an event metadata map.
    pub fn apply_to(&self, metadata: &mut Map<String, Value>) {
        metadata.insert("process_name".into(), Value::String(self.process_name.clone()));
        metadata.insert("process_id".into(), Value::from(self.process_id));
        if let Some(user) = &self.process_user {
            metadata.insert("process_user".into(), Value::String(user.clone()));
        }
        if let Some(cmdline) = &self.process_cmdline {
            metadata.insert("process_cmdline".into(), Value::String(cmdline.clone()));
        }
        if let Some(parent_id) = self.parent_id {
            metadata.insert("parent_id".into(), Value::from(parent_id));
        }
        if let Some(parent_name) = &self.parent_name {
            metadata.insert("parent_name".into(), Value::String(parent_name.clone()));
        }
    }
}

/// Finds a process with an open handle on `path` and describes it.
pub fn capture_for_path(path: &Path) -> Option<ProcessInfo> {
    let pid = pid_holding_file(path)?;
    describe(pid)
}

/// Scans `/proc/<pid>/fd` for a descriptor resolving to `path`.
#[cfg(target_os = "linux")]
fn pid_holding_file(path: &Path) -> Option<u32> {
    let target = path.canonicalize().ok()?;
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        // Unreadable fd tables (other users' processes) are skipped.
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(link) = std::fs::read_link(fd.path()) {
                if link == target {
                    return Some(pid);
                }
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn pid_holding_file(path: &Path) -> Option<u32> {
    debug!(path = %path.display(), "process capture not supported on this platform");
    None
}

/// Resolves the attributes of one pid.
fn describe(pid: u32) -> Option<ProcessInfo> {
    let sys = System::new_all();
    let process = sys.process(Pid::from_u32(pid))?;

    let users = Users::new_with_refreshed_list();
    let process_user = process
        .user_id()
        .and_then(|uid| users.get_user_by_id(uid))
        .map(|user| user.name().to_string());

    let cmdline = process
        .cmd()
        .iter()
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ");
    let process_cmdline = if cmdline.is_empty() {
        None
    } else {
        let mut cmdline = cmdline;
        // Stay on a char boundary when clamping.
        let mut end = CMDLINE_LIMIT.min(cmdline.len());
        while !cmdline.is_char_boundary(end) {
            end -= 1;
        }
        cmdline.truncate(end);
        Some(cmdline)
    };

    let parent = process.parent();
    let parent_name = parent
        .and_then(|ppid| sys.process(ppid))
        .map(|proc| proc.name().to_string_lossy().into_owned());

    let info = ProcessInfo {
        process_name: process.name().to_string_lossy().into_owned(),
        process_id: pid,
        process_user,
        process_cmdline,
        parent_id: parent.map(|ppid| ppid.as_u32()),
        parent_name,
    };
    debug!(pid, name = %info.process_name, "captured accessing process");
    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn finds_process_holding_the_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let decoy = dir.path().join("held.txt");
        std::fs::write(&decoy, "decoy").unwrap();

        // Hold a handle open so the fd scan can see it (the holder is this
        // test process).
        let _handle = std::fs::File::open(&decoy).unwrap();
        let info = capture_for_path(&decoy).expect("open handle should be found");
        assert_eq!(info.process_id, std::process::id());
        assert!(!info.process_name.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn unheld_file_yields_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let decoy = dir.path().join("idle.txt");
        std::fs::write(&decoy, "decoy").unwrap();
        assert!(capture_for_path(&decoy).is_none());
    }

    #[test]
    fn describe_reports_the_current_process() {
        let info = describe(std::process::id()).expect("own process is visible");
        assert_eq!(info.process_id, std::process::id());
        assert!(!info.process_name.is_empty());
    }

    #[test]
    fn apply_to_skips_absent_fields() {
        let info = ProcessInfo {
            process_name: "cat".into(),
            process_id: 42,
            process_user: None,
            process_cmdline: Some("cat /srv/decoys/payroll.xlsx".into()),
            parent_id: None,
            parent_name: None,
        };
        let mut metadata = Map::new();
        info.apply_to(&mut metadata);
        assert_eq!(metadata["process_name"], "cat");
        assert_eq!(metadata["process_id"], 42);
        assert!(!metadata.contains_key("process_user"));
        assert!(metadata.contains_key("process_cmdline"));
    }
}
