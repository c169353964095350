pub mod paths;
pub mod persistence;
pub mod schema;

pub use paths::*;
pub use persistence::*;
pub use schema::*;

fn default_xino_enabled() -> bool {
    true
}

fn default_share_colocated() -> bool {
    false
}

fn default_ephemeral() -> bool {
    false
}

fn default_trunc_init_blocks() -> u64 {
    crate::xino::XINO_TRUNC_INIT
}

fn default_trunc_step_blocks() -> u64 {
    crate::xino::XINO_TRUNC_STEP
}

fn default_auto_truncate() -> bool {
    true
}
