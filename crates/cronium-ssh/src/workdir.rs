//! Per-execution remote working directories.
//!
//! Each run gets `<root>/<prefix>_<unix-millis>_<suffix>`. The random suffix
//! keeps two runs started in the same millisecond apart.

use crate::escape::quote;
use std::time::Duration;

/// Input payload read by `input()`.
pub const INPUT_FILE: &str = "input.json";
/// Event metadata read by `event()`.
pub const EVENT_FILE: &str = "event.json";
/// Variable snapshot, rewritten by `setVariable()`.
pub const VARIABLES_FILE: &str = "variables.json";
/// Written by `output()`.
pub const OUTPUT_FILE: &str = "output.json";
/// Written by `setCondition()`.
pub const CONDITION_FILE: &str = "condition.json";

/// A remote working directory path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    path: String,
}

impl WorkDir {
    /// Fresh, unique directory name under `root`.
    pub fn generate(root: &str, prefix: &str) -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let root = root.trim_end_matches('/');
        Self {
            path: format!("{root}/{prefix}_{millis}_{}", &suffix[..12]),
        }
    }

    /// Absolute path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Absolute path of `name` inside the directory.
    pub fn file(&self, name: &str) -> String {
        format!("{}/{name}", self.path)
    }

    /// Command that creates the directory.
    pub fn create_command(&self) -> String {
        format!("mkdir -p {}", quote(&self.path))
    }

    /// Command that removes the directory.
    pub fn remove_command(&self) -> String {
        format!("rm -rf {}", quote(&self.path))
    }

    /// Command that kills processes whose command line names the directory.
    ///
    /// The leading character is bracketed so the pattern never matches the
    /// shell running `pkill` itself.
    pub fn kill_command(&self) -> String {
        let mut chars = self.path.chars();
        let pattern = match chars.next() {
            Some(first) => format!("[{first}]{}", chars.as_str()),
            None => String::new(),
        };
        format!("pkill -f {} 2>/dev/null || true", quote(&pattern))
    }
}

/// Command that deletes leftover `<prefix>_*` directories older than `age`.
///
/// Always exits 0.
pub fn sweep_command(root: &str, prefix: &str, age: Duration) -> String {
    let minutes = age.as_secs().div_ceil(60).max(1);
    format!(
        "find {} -maxdepth 1 -type d -name {} -mmin +{minutes} -exec rm -rf {{}} + 2>/dev/null || true",
        quote(root),
        quote(&format!("{prefix}_*")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_name_shape() {
        let dir = WorkDir::generate("/tmp/", "cronium");
        let name = dir.path().strip_prefix("/tmp/cronium_").expect("prefix");
        let (millis, suffix) = name.split_once('_').expect("suffix");
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(suffix.len(), 12);
        assert_eq!(dir.file(OUTPUT_FILE), format!("{}/output.json", dir.path()));
    }

    #[test]
    fn test_names_are_unique() {
        let names: std::collections::HashSet<String> = (0..200)
            .map(|_| WorkDir::generate("/tmp", "cronium").path().to_string())
            .collect();
        assert_eq!(names.len(), 200);
    }

    #[test]
    fn test_commands_are_quoted() {
        let dir = WorkDir {
            path: "/tmp/cronium_1_abc".into(),
        };
        assert_eq!(dir.create_command(), "mkdir -p '/tmp/cronium_1_abc'");
        assert_eq!(dir.remove_command(), "rm -rf '/tmp/cronium_1_abc'");
        assert_eq!(
            dir.kill_command(),
            "pkill -f '[/]tmp/cronium_1_abc' 2>/dev/null || true"
        );
    }

    #[test]
    fn test_sweep_command() {
        let cmd = sweep_command("/tmp", "cronium", Duration::from_secs(3600));
        assert_eq!(
            cmd,
            "find '/tmp' -maxdepth 1 -type d -name 'cronium_*' -mmin +60 -exec rm -rf {} + 2>/dev/null || true"
        );
        assert!(sweep_command("/tmp", "c", Duration::from_secs(5)).contains("-mmin +1 "));
    }
}
