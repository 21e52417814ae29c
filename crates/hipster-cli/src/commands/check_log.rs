use hipster_plugins::analyzer::check_log_file;
use std::path::Path;

pub async fn run(path: &Path) -> anyhow::Result<()> {
    let verdict = check_log_file(path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
    if !verdict.passed() {
        anyhow::bail!("{}", verdict);
    }
    println!("{}", verdict);
    Ok(())
}
