//! GitHub release metadata

use serde::Deserialize;

use crate::error::{Error, Result};

const OWNER: &str = "lansespirit";
const REPO: &str = "clipal";

/// Name of the checksum manifest attached to every release.
pub const CHECKSUMS_ASSET: &str = "checksums.txt";

#[derive(Debug, Clone, Deserialize)]
pub struct Asset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

/// Fetch the latest release for the clipal repository.
pub async fn fetch_latest_release(client: &reqwest::Client) -> Result<Release> {
    let url = format!("https://api.github.com/repos/{OWNER}/{REPO}/releases/latest");
    let mut req = client
        .get(&url)
        .header(reqwest::header::ACCEPT, "application/vnd.github+json")
        .header(reqwest::header::USER_AGENT, "clipal-updater");
    if let Some(token) = auth_token() {
        req = req.bearer_auth(token);
    }

    let resp = req.send().await?;
    if !resp.status().is_success() {
        return Err(Error::Github(format!(
            "releases/latest returned {}",
            resp.status()
        )));
    }

    let release: Release = resp.json().await?;
    if release.tag_name.trim().is_empty() {
        return Err(Error::Github("release has empty tag_name".into()));
    }
    Ok(release)
}

/// Optional token for a higher API rate limit; asset downloads are public.
pub(crate) fn auth_token() -> Option<String> {
    for key in ["GITHUB_TOKEN", "GH_TOKEN"] {
        if let Ok(v) = std::env::var(key) {
            if !v.trim().is_empty() {
                return Some(v);
            }
        }
    }
    None
}

/// Release asset name for the running platform, e.g. `clipal-linux-amd64`.
pub(crate) fn expected_binary_asset_name() -> Result<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => {
            return Err(Error::UnsupportedPlatform(format!(
                "{}/{other}",
                std::env::consts::OS
            )))
        }
    };
    match std::env::consts::OS {
        "linux" => Ok(format!("clipal-linux-{arch}")),
        "macos" => Ok(format!("clipal-darwin-{arch}")),
        "windows" => Ok(format!("clipal-windows-{arch}.exe")),
        other => Err(Error::UnsupportedPlatform(format!("{other}/{arch}"))),
    }
}

pub(crate) fn find_asset<'a>(assets: &'a [Asset], want: &str) -> Option<&'a Asset> {
    assets.iter().find(|a| a.name == want)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_deserializes_github_shape() {
        let json = r#"{
            "tag_name": "v0.3.0",
            "assets": [
                {"name": "clipal-linux-amd64", "browser_download_url": "https://example.com/a", "size": 123},
                {"name": "checksums.txt", "browser_download_url": "https://example.com/c"}
            ],
            "prerelease": false
        }"#;
        let release: Release = serde_json::from_str(json).unwrap();
        assert_eq!(release.tag_name, "v0.3.0");
        assert_eq!(release.assets.len(), 2);
        assert_eq!(release.assets[0].size, 123);
        assert_eq!(release.assets[1].size, 0);
    }

    #[test]
    fn find_asset_by_exact_name() {
        let assets = vec![
            Asset {
                name: "checksums.txt".into(),
                browser_download_url: String::new(),
                size: 0,
            },
            Asset {
                name: "clipal-linux-amd64".into(),
                browser_download_url: String::new(),
                size: 0,
            },
        ];
        assert!(find_asset(&assets, "clipal-linux-amd64").is_some());
        assert!(find_asset(&assets, "clipal-linux").is_none());
    }

    #[test]
    fn binary_asset_name_is_platform_shaped() {
        let name = expected_binary_asset_name().unwrap();
        assert!(name.starts_with("clipal-"), "got {name}");
    }
}
