//! Installer: default config plus executable hook scripts.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::Result;

use calm_config::CalmConfig;

const HOOKS: &[(&str, &str)] = &[
    (
        "session_start.sh",
        "#!/bin/sh\n# Emitted by `calm install`. Run at the start of each agent session.\nexec calm hook session-start\n",
    ),
    (
        "pre_tool.sh",
        "#!/bin/sh\n# Emitted by `calm install`. Run before each tool call.\nexec calm hook pre-tool\n",
    ),
    (
        "check_in.sh",
        "#!/bin/sh\n# Emitted by `calm install`. Run after the agent checks in.\nexec calm hook check-in\n",
    ),
];

pub fn run(config: &CalmConfig) -> Result<()> {
    fs::create_dir_all(&config.calm_dir)?;

    let config_path = config.calm_dir.join("config.yaml");
    if config_path.exists() {
        println!("config exists: {}", config_path.display());
    } else {
        config.save_to(&config_path)?;
        println!("config written: {}", config_path.display());
    }

    let hooks_dir = config.calm_dir.join("hooks");
    fs::create_dir_all(&hooks_dir)?;
    for (name, body) in HOOKS {
        let path = hooks_dir.join(name);
        write_executable(&path, body)?;
        println!("hook written: {}", path.display());
    }

    println!();
    println!("next steps:");
    println!("- start the service: calm start");
    println!("- wire the scripts in {} into your agent's hook configuration", hooks_dir.display());
    Ok(())
}

fn write_executable(path: &Path, body: &str) -> Result<()> {
    fs::write(path, body)?;
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_writes_config_and_executable_hooks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = CalmConfig::default();
        config.calm_dir = dir.path().to_path_buf();

        run(&config)?;
        assert!(dir.path().join("config.yaml").exists());
        for (name, _) in HOOKS {
            let path = dir.path().join("hooks").join(name);
            let mode = fs::metadata(&path)?.permissions().mode();
            assert_eq!(mode & 0o111, 0o111, "{name} should be executable");
        }

        // Second run leaves the existing config alone.
        fs::write(dir.path().join("config.yaml"), "batch_size: 99\n")?;
        run(&config)?;
        let raw = fs::read_to_string(dir.path().join("config.yaml"))?;
        assert!(raw.contains("batch_size: 99"));
        Ok(())
    }
}
