//! Write-only byte-buffer endpoints for policy management.
//!
//! Three endpoints (`.load`, `.replace`, `.remove`) accept a whole policy
//! buffer in a single write at offset 0, check privilege, and hand the bytes
//! to a [`PolicyManager`]. Results come back kernel style: the number of bytes
//! consumed, or a negative errno.

use parking_lot::Mutex;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyEndpoint {
    Load,
    Replace,
    Remove,
}

impl PolicyEndpoint {
    pub const ALL: [PolicyEndpoint; 3] = [
        PolicyEndpoint::Load,
        PolicyEndpoint::Replace,
        PolicyEndpoint::Remove,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PolicyEndpoint::Load => ".load",
            PolicyEndpoint::Replace => ".replace",
            PolicyEndpoint::Remove => ".remove",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.name() == name)
    }

    /// `.remove` takes a profile name, which the manager reads as a C string.
    fn nul_terminated(self) -> bool {
        self == PolicyEndpoint::Remove
    }
}

/// Receives policy buffers. Each call returns the number of bytes consumed.
pub trait PolicyManager: Send + Sync {
    fn load(&self, data: &[u8]) -> Result<usize>;
    fn replace(&self, data: &[u8]) -> Result<usize>;
    fn remove(&self, name: &[u8]) -> Result<usize>;
}

pub trait PrivilegeCheck: Send + Sync {
    fn may_manage_policy(&self) -> bool;
}

/// Grants policy management to processes running with effective uid 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct EffectiveRoot;

impl PrivilegeCheck for EffectiveRoot {
    fn may_manage_policy(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}

pub struct PolicyFs {
    manager: Box<dyn PolicyManager>,
    privilege: Box<dyn PrivilegeCheck>,
    registered: Mutex<bool>,
}

impl PolicyFs {
    pub fn new(manager: Box<dyn PolicyManager>) -> Self {
        Self::with_privilege(manager, Box::new(EffectiveRoot))
    }

    pub fn with_privilege(
        manager: Box<dyn PolicyManager>,
        privilege: Box<dyn PrivilegeCheck>,
    ) -> Self {
        PolicyFs {
            manager,
            privilege,
            registered: Mutex::new(false),
        }
    }

    /// Register the endpoints. Fails with `-EEXIST` if they already are.
    pub fn create(&self) -> std::result::Result<(), i32> {
        let mut registered = self.registered.lock();
        if *registered {
            return Err(-libc::EEXIST);
        }
        *registered = true;
        tracing::debug!("Registered policy endpoints");
        Ok(())
    }

    pub fn destroy(&self) {
        let mut registered = self.registered.lock();
        if *registered {
            *registered = false;
            tracing::debug!("Removed policy endpoints");
        }
    }

    pub fn is_registered(&self) -> bool {
        *self.registered.lock()
    }

    /// Handle one write to `endpoint`.
    pub fn write(&self, endpoint: PolicyEndpoint, buf: &[u8], pos: u64) -> isize {
        if !self.is_registered() {
            return -(libc::ENOENT as isize);
        }
        if pos != 0 {
            return -(libc::ESPIPE as isize);
        }
        if !self.privilege.may_manage_policy() {
            tracing::warn!("Denied {} write: insufficient privilege", endpoint.name());
            return -(libc::EACCES as isize);
        }

        let data = match copy_buffer(buf, endpoint.nul_terminated()) {
            Some(data) => data,
            None => return -(libc::ENOMEM as isize),
        };

        let result = match endpoint {
            PolicyEndpoint::Load => self.manager.load(&data),
            PolicyEndpoint::Replace => self.manager.replace(&data),
            PolicyEndpoint::Remove => self.manager.remove(&data),
        };

        match result {
            Ok(consumed) => {
                tracing::debug!("{}: {} bytes consumed", endpoint.name(), consumed);
                isize::try_from(consumed).unwrap_or(isize::MAX)
            }
            Err(e) => {
                tracing::debug!("{} failed: {}", endpoint.name(), e);
                -(e.errno() as isize)
            }
        }
    }
}

/// Copy the caller's bytes into an owned buffer, optionally NUL-terminated.
/// `None` when the buffer cannot be allocated. Empty writes are passed on;
/// the manager decides what they mean.
fn copy_buffer(buf: &[u8], nul: bool) -> Option<Vec<u8>> {
    let len = buf.len().checked_add(usize::from(nul))?;
    let mut data = Vec::new();
    data.try_reserve_exact(len).ok()?;
    data.extend_from_slice(buf);
    if nul {
        data.push(0);
    }
    Some(data)
}
