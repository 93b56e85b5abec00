//! Update orchestration: plan, download, verify, apply

use std::cmp::Ordering;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::checksums::{parse_checksums, sha256_file};
use crate::error::{Error, Result};
use crate::github::{
    auth_token, expected_binary_asset_name, fetch_latest_release, find_asset, Asset,
    CHECKSUMS_ASSET,
};
use crate::version::compare_versions;

#[derive(Debug, Clone)]
pub struct Options {
    /// Only report whether an update exists.
    pub check: bool,
    /// Allow reinstall/downgrade.
    pub force: bool,
    /// Resolve the plan but download/replace nothing.
    pub dry_run: bool,
    /// Overall deadline for the whole operation.
    pub timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            check: false,
            force: false,
            dry_run: false,
            timeout: Duration::from_secs(120),
        }
    }
}

/// What an update would do, resolved from release metadata.
#[derive(Debug, Clone)]
pub struct Plan {
    pub current_version: String,
    pub latest_version: String,
    pub binary_asset: Asset,
    pub checksums_asset: Asset,
    pub executable_path: PathBuf,
}

/// Resolve the latest release into a concrete plan for this platform.
pub async fn build_plan(client: &reqwest::Client, current_version: &str) -> Result<Plan> {
    let release = fetch_latest_release(client).await?;

    let bin_name = expected_binary_asset_name()?;
    let binary_asset = find_asset(&release.assets, &bin_name)
        .ok_or_else(|| Error::MissingAsset {
            release: release.tag_name.clone(),
            asset: bin_name.clone(),
        })?
        .clone();
    let checksums_asset = find_asset(&release.assets, CHECKSUMS_ASSET)
        .ok_or_else(|| Error::MissingAsset {
            release: release.tag_name.clone(),
            asset: CHECKSUMS_ASSET.into(),
        })?
        .clone();

    let executable_path = std::env::current_exe()?.canonicalize()?;

    Ok(Plan {
        current_version: current_version.trim().to_string(),
        latest_version: release.tag_name.trim().to_string(),
        binary_asset,
        checksums_asset,
        executable_path,
    })
}

/// Whether `current` should be replaced by `latest`, and whether the two were
/// actually comparable. Dev and unparsable builds always count as outdated so
/// an explicit `update` run can recover them.
pub fn needs_update(current: &str, latest: &str) -> (bool, bool) {
    let current = current.trim();
    if current.is_empty() || current == "dev" {
        return (true, false);
    }
    match compare_versions(current, latest) {
        Some(ordering) => (ordering == Ordering::Less, true),
        None => (true, false),
    }
}

/// Run an update. Returns the plan and, for `--check`, whether an update is
/// available; otherwise whether the executable was replaced.
pub async fn update(current_version: &str, opts: Options) -> Result<(Plan, bool)> {
    let timeout = if opts.timeout.is_zero() {
        Duration::from_secs(120)
    } else {
        opts.timeout
    };
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    let plan = build_plan(&client, current_version).await?;
    let (needs, comparable) = needs_update(&plan.current_version, &plan.latest_version);

    if !needs && !opts.force {
        return Ok((plan, false));
    }
    if comparable && !opts.force {
        if let Some(Ordering::Greater) =
            compare_versions(&plan.current_version, &plan.latest_version)
        {
            return Err(Error::WouldDowngrade {
                current: plan.current_version.clone(),
                latest: plan.latest_version.clone(),
            });
        }
    }
    if opts.check || opts.dry_run {
        return Ok((plan, needs));
    }

    let checksums_file = download_to_temp(&client, &plan.checksums_asset.browser_download_url)
        .await?;
    let sums = parse_checksums(&std::fs::read(checksums_file.path())?)?;
    let want = sums
        .get(&plan.binary_asset.name)
        .ok_or_else(|| Error::Checksums(format!("no entry for {:?}", plan.binary_asset.name)))?;

    let binary_file = download_to_temp(&client, &plan.binary_asset.browser_download_url).await?;
    let got = sha256_file(binary_file.path())?;
    if !got.eq_ignore_ascii_case(want) {
        return Err(Error::ChecksumMismatch {
            name: plan.binary_asset.name.clone(),
            got,
            want: want.clone(),
        });
    }

    apply(&plan.executable_path, binary_file.path())?;
    info!(
        from = %plan.current_version,
        to = %plan.latest_version,
        "executable replaced"
    );
    Ok((plan, true))
}

async fn download_to_temp(
    client: &reqwest::Client,
    url: &str,
) -> Result<tempfile::NamedTempFile> {
    let mut req = client.get(url);
    if let Some(token) = auth_token() {
        req = req.bearer_auth(token);
    }
    let mut resp = req.send().await?;
    if !resp.status().is_success() {
        return Err(Error::Github(format!(
            "download {url} returned {}",
            resp.status()
        )));
    }

    let mut file = tempfile::NamedTempFile::new()?;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk)?;
    }
    file.flush()?;
    Ok(file)
}

/// Replace the running executable: copy the new binary next to the target
/// (same filesystem, so the rename is atomic), keep the old one as `.old`,
/// and roll back if the final rename fails.
#[cfg(unix)]
fn apply(exe_path: &Path, new_bin: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(exe_path)?;
    let mut mode = meta.permissions().mode();
    if mode & 0o111 == 0 {
        mode |= 0o755;
    }

    let dir = exe_path.parent().unwrap_or_else(|| Path::new("."));
    let staged = dir.join(format!(".clipal-new-{}", std::process::id()));
    if let Err(e) = stage_copy(&staged, new_bin, mode) {
        let _ = std::fs::remove_file(&staged);
        return Err(e);
    }

    let backup = exe_path.with_extension("old");
    let _ = std::fs::remove_file(&backup);

    if let Err(e) = std::fs::rename(exe_path, &backup) {
        let _ = std::fs::remove_file(&staged);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&staged, exe_path) {
        let _ = std::fs::rename(&backup, exe_path);
        let _ = std::fs::remove_file(&staged);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(unix)]
fn stage_copy(dst: &Path, src: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::copy(src, dst)?;
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn apply(_exe_path: &Path, _new_bin: &Path) -> Result<()> {
    Err(Error::UnsupportedPlatform(format!(
        "in-place replace on {}",
        std::env::consts::OS
    )))
}
