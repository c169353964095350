use serde::{Deserialize, Serialize};

/// Branch permission and attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BranchPerm {
    /// Writable, link whiteouts.
    ReadWrite,
    /// Read-only, no whiteouts.
    ReadOnly,
    /// Natively read-only, no whiteouts.
    ReadOnlyNative,
    /// Writable, whiteouts are never hard links.
    ReadWriteNoLinkWhiteout,
    /// Read-only, but whiteouts on it are honoured.
    ReadOnlyWhiteoutable,
    /// Natively read-only, whiteouts honoured.
    ReadOnlyNativeWhiteoutable,
}

impl BranchPerm {
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            BranchPerm::ReadWrite | BranchPerm::ReadWriteNoLinkWhiteout
        )
    }

    pub fn is_whiteoutable(self) -> bool {
        matches!(
            self,
            BranchPerm::ReadWrite
                | BranchPerm::ReadOnlyWhiteoutable
                | BranchPerm::ReadOnlyNativeWhiteoutable
        )
    }

    /// Whether whiteouts on this branch may be hard links to a shared template.
    pub fn links_whiteouts(self) -> bool {
        self == BranchPerm::ReadWrite
    }

    /// Natively read-only branches never change underneath us, so they are
    /// not worth watching for notifications.
    pub fn is_hnotifyable(self) -> bool {
        !matches!(
            self,
            BranchPerm::ReadOnlyNative | BranchPerm::ReadOnlyNativeWhiteoutable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BranchPerm::ReadWrite => "rw",
            BranchPerm::ReadOnly => "ro",
            BranchPerm::ReadOnlyNative => "rr",
            BranchPerm::ReadWriteNoLinkWhiteout => "rw+nolwh",
            BranchPerm::ReadOnlyWhiteoutable => "ro+wh",
            BranchPerm::ReadOnlyNativeWhiteoutable => "rr+wh",
        }
    }
}

impl std::fmt::Display for BranchPerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for BranchPerm {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "rw" => Ok(BranchPerm::ReadWrite),
            "ro" => Ok(BranchPerm::ReadOnly),
            "rr" => Ok(BranchPerm::ReadOnlyNative),
            "rw+nolwh" => Ok(BranchPerm::ReadWriteNoLinkWhiteout),
            "ro+wh" => Ok(BranchPerm::ReadOnlyWhiteoutable),
            "rr+wh" => Ok(BranchPerm::ReadOnlyNativeWhiteoutable),
            _ => Err(format!(
                "Invalid branch permission '{}'. Must be one of: rw, ro, rr, rw+nolwh, ro+wh, rr+wh",
                s
            )),
        }
    }
}

impl TryFrom<String> for BranchPerm {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BranchPerm> for String {
    fn from(perm: BranchPerm) -> Self {
        perm.as_str().to_string()
    }
}
