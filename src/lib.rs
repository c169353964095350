pub mod branch;
pub mod config;
pub mod error;
pub mod policyfs;
pub mod union;
pub mod whiteout;
pub mod xino;

pub use branch::{
    Access, Branch, BranchId, BranchPerm, BranchRef, BranchSpec, BranchStack, BranchState,
    BranchWatch, TruncOutcome, XinoOptions,
};
pub use config::{load_config, load_config_from, save_config, Config};
pub use error::{Result, StackfsError};
pub use policyfs::{PolicyEndpoint, PolicyFs, PolicyManager, PrivilegeCheck};
pub use union::UnionFs;
pub use whiteout::{WhSlot, WhiteoutSet};
pub use xino::{CompactStats, Liveness, TreeScan, XinoFile, Xib};
