#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use carrier::Carrier;

const CONFIG_ENV: &str = "CARRIER_CONFIG";
const CONFIG_FILE: &str = "carrier.config.ron";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path()?;
    Carrier::load(&path)?.run().await
}

/// The config file, first of: the path given as the only argument, the
/// `CARRIER_CONFIG` environment variable, `./carrier.config.ron`, then
/// `/etc/carrier/carrier.config.ron`. An explicit path must exist.
fn config_path() -> anyhow::Result<PathBuf> {
    let explicit = std::env::args_os()
        .nth(1)
        .map(|arg| (PathBuf::from(arg), "command line"))
        .or_else(|| std::env::var_os(CONFIG_ENV).map(|var| (PathBuf::from(var), CONFIG_ENV)));

    if let Some((path, source)) = explicit {
        anyhow::ensure!(
            path.is_file(),
            "Config file {} from {source} does not exist",
            path.display()
        );
        return Ok(path);
    }

    let candidates = [
        PathBuf::from(".").join(CONFIG_FILE),
        PathBuf::from("/etc/carrier").join(CONFIG_FILE),
    ];
    if let Some(found) = candidates.iter().find(|path| path.is_file()) {
        return Ok(found.clone());
    }

    anyhow::bail!(
        "No config file given and none found at {}; pass a path or set {CONFIG_ENV}",
        candidates
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(" or ")
    )
}
