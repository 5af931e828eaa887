use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaseSensitivity {
    #[default]
    Sensitive,
    /// Names compare case-insensitively but keep the case they were created with.
    Insensitive,
}

/// Path normalization rules, fixed for the lifetime of a mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathPolicy {
    pub case: CaseSensitivity,
    /// Also treat `\` as a separator (drive-letter style mounts).
    pub accept_backslash: bool,
}

impl PathPolicy {
    fn is_separator(&self, c: char) -> bool {
        c == '/' || (self.accept_backslash && c == '\\')
    }

    /// Split a path into its normalized components. Empty and `.` components
    /// are dropped; `..` removes the previous component and stops at the root.
    pub fn components(&self, path: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for part in path.split(|c| self.is_separator(c)) {
            match part {
                "" | "." => {}
                ".." => {
                    out.pop();
                }
                name => out.push(name.to_string()),
            }
        }
        out
    }

    /// Split a path into its parent components and final name.
    pub fn split_parent(&self, path: &str) -> FsResult<(Vec<String>, String)> {
        let mut parts = self.components(path);
        match parts.pop() {
            Some(name) => Ok((parts, name)),
            None => Err(FsError::InvalidArgument(format!(
                "{:?} names the root directory",
                path
            ))),
        }
    }

    /// Lookup key for a child name within a directory.
    pub fn key(&self, name: &str) -> String {
        match self.case {
            CaseSensitivity::Sensitive => name.to_string(),
            CaseSensitivity::Insensitive => name.to_lowercase(),
        }
    }

    /// Reject names that cannot be stored as a single directory entry.
    pub fn validate_name(&self, name: &str) -> FsResult<()> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.chars().any(|c| self.is_separator(c) || c == '\0')
        {
            return Err(FsError::InvalidArgument(format!("invalid name {:?}", name)));
        }
        Ok(())
    }

    /// Render components as an absolute `/`-separated path.
    pub fn join(components: &[String]) -> String {
        if components.is_empty() {
            "/".to_string()
        } else {
            let mut s = String::new();
            for c in components {
                s.push('/');
                s.push_str(c);
            }
            s
        }
    }
}
