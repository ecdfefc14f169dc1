use stackconf::{manifest, Config, Theme};

fn main() -> stackconf::Result<()> {
    let manifest_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "./stack.toml".to_string());

    let config = Config::builder()
        .sections(manifest::load_sections(&manifest_path)?)
        .build()?;

    if !config.root_mode() {
        eprintln!("Inspection needs root; rerun with sudo.");
        return Ok(());
    }

    let report = config.inspect()?;
    print!("{}", report.render(config.theme()));

    if std::env::args().any(|arg| arg == "--prune") {
        let removed = config.remove_stale()?;
        println!("Removed {} stale entries", removed.len());
    } else if !report.stale.is_empty() {
        println!("Run again with --prune to remove stale entries");
    }

    if matches!(config.theme(), Theme::Simple) {
        println!("Set STACKCONF_THEME=colors for colored output");
    }

    Ok(())
}
