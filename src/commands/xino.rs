use std::path::Path;

use crate::cli::XinoAction;
use crate::error::{Result, StackfsError};
use crate::xino::{Liveness, TreeScan, XinoFile};

pub fn handle_xino_command(action: XinoAction) -> Result<()> {
    match action {
        XinoAction::Dump { file, json } => dump(&file, json),
        XinoAction::Stat { file } => stat(&file),
        XinoAction::Compact { file, root } => compact(&file, &root),
    }
}

/// Open an existing xino file; maintenance commands never create one.
fn open_existing(file: &Path) -> Result<std::sync::Arc<XinoFile>> {
    if !file.is_file() {
        return Err(StackfsError::NotFound(format!(
            "xino file {} does not exist",
            file.display()
        )));
    }
    XinoFile::open(file, false)
}

fn dump(file: &Path, json: bool) -> Result<()> {
    let xino = open_existing(file)?;
    let entries = xino.entries()?;

    if json {
        let entries: Vec<_> = entries
            .iter()
            .map(|(h_ino, ino)| serde_json::json!({ "native": h_ino, "union": ino }))
            .collect();
        println!("{}", serde_json::to_string(&entries)?);
    } else {
        for (h_ino, ino) in entries {
            println!("{}\t{}", h_ino, ino);
        }
    }
    Ok(())
}

fn stat(file: &Path) -> Result<()> {
    let xino = open_existing(file)?;
    println!("File: {}", xino.path().display());
    println!("Entries: {}", xino.entries()?.len());
    println!("Size: {} bytes", xino.size()?);
    println!("Blocks: {}", xino.blocks()?);
    Ok(())
}

fn compact(file: &Path, root: &Path) -> Result<()> {
    let xino = open_existing(file)?;
    let root = std::fs::canonicalize(root)?;
    let root_ino = std::os::unix::fs::MetadataExt::ino(&std::fs::metadata(&root)?);

    let stats = xino.compact_with(|| {
        let live = TreeScan.live_set(&root)?;
        Ok(move |h_ino| h_ino == root_ino || live.contains(&h_ino))
    })?;

    println!(
        "Kept {} mappings, dropped {} ({} -> {} blocks)",
        stats.kept, stats.dropped, stats.blocks_before, stats.blocks_after
    );
    Ok(())
}
