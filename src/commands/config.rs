use crate::cli::ConfigAction;
use crate::config::{get_config_path, get_xino_dir, load_config};
use crate::error::Result;

pub fn handle_config_command(action: Option<ConfigAction>) -> Result<()> {
    match action {
        Some(ConfigAction::Path) => {
            let config_path = get_config_path()?;
            println!("Config location: {}", config_path.display());
        }
        None | Some(ConfigAction::Show) => {
            let config_path = get_config_path()?;
            let config = load_config()?;
            println!("Config file: {}", config_path.display());
            println!();
            println!("Current configuration:");
            println!("  Xino:");
            println!("    enabled: {}", config.xino.get_enabled());
            match get_xino_dir(&config)? {
                Some(dir) => println!("    dir: {}", dir.display()),
                None => println!("    dir: (disabled)"),
            }
            println!("    share_colocated: {}", config.xino.get_share_colocated());
            println!("    ephemeral: {}", config.xino.get_ephemeral());
            println!(
                "    trunc_init_blocks: {}",
                config.xino.get_trunc_init_blocks()
            );
            println!(
                "    trunc_step_blocks: {}",
                config.xino.get_trunc_step_blocks()
            );
            println!("    auto_truncate: {}", config.xino.get_auto_truncate());
            println!("  Branches:");
            if config.branches.is_empty() {
                println!("    (none)");
            }
            for branch in &config.branches {
                match branch.id {
                    Some(id) => println!("    {} ({}, id {})", branch.path, branch.perm, id),
                    None => println!("    {} ({})", branch.path, branch.perm),
                }
            }
        }
    }
    Ok(())
}
