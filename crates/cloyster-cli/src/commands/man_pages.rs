use super::EXIT_SUCCESS;
use clap::CommandFactory;
use std::path::Path;

/// Write `cloyster.1` and one `cloyster-<command>.1` per subcommand into `dir`.
pub fn run<C: CommandFactory>(dir: &Path) -> Result<u8, String> {
    std::fs::create_dir_all(dir).map_err(|e| format!("failed to create dir: {e}"))?;
    let cmd = C::command();
    render(clap_mangen::Man::new(cmd.clone()), &dir.join("cloyster.1"))?;
    for sub in cmd.get_subcommands() {
        let path = dir.join(format!("cloyster-{}.1", sub.get_name()));
        render(clap_mangen::Man::new(sub.clone()), &path)?;
    }
    println!("man pages written to {}", dir.display());
    Ok(EXIT_SUCCESS)
}

fn render(man: clap_mangen::Man, path: &Path) -> Result<(), String> {
    let mut buf = Vec::new();
    man.render(&mut buf)
        .map_err(|e| format!("man page render failed: {e}"))?;
    std::fs::write(path, &buf).map_err(|e| format!("failed to write {}: {e}", path.display()))
}
