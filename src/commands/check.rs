use serde::Serialize;
use std::path::PathBuf;

use crate::branch::BranchPerm;
use crate::config::{load_config, load_config_from};
use crate::error::Result;
use crate::union::UnionFs;

#[derive(Debug, Serialize)]
struct BranchRow {
    bindex: usize,
    id: u32,
    perm: BranchPerm,
    fs_type: String,
    root: String,
    default_write: bool,
    xino: Option<String>,
}

pub fn run_check(config: Option<PathBuf>, json: bool) -> Result<()> {
    let config = match config {
        Some(path) => load_config_from(&path)?,
        None => load_config()?,
    };
    let union = UnionFs::open(&config)?;

    let (ids, default_write) = {
        let stack = union.stack().read();
        (stack.ids(), stack.default_write())
    };

    let mut rows = Vec::with_capacity(ids.len());
    for (bindex, id) in ids.into_iter().enumerate() {
        let xino = union.xino_path(id)?;
        let stack = union.stack().read();
        let Some(branch) = stack.branch(bindex) else {
            continue;
        };
        rows.push(BranchRow {
            bindex,
            id: id.get(),
            perm: branch.perm(),
            fs_type: branch.mount().fs_type().to_string(),
            root: branch.root().display().to_string(),
            default_write: default_write == Some(id),
            xino: xino.map(|p| p.display().to_string()),
        });
    }

    if json {
        println!("{}", serde_json::to_string(&rows)?);
        return Ok(());
    }

    println!("Branch stack ({} branches):", rows.len());
    println!();
    for row in &rows {
        let marker = if row.default_write { "*" } else { " " };
        println!(
            "{} {:>3}  b{:<5} {:<9} {:<12} {}",
            marker, row.bindex, row.id, row.perm, row.fs_type, row.root
        );
        if let Some(xino) = &row.xino {
            println!("        xino: {}", xino);
        }
    }
    Ok(())
}
