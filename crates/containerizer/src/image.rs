//! Image resolution: explicit URL, then per-config default, then a
//! host-derived `<distro>:<release>` fallback, each optionally prefixed with
//! an `index`/`account` scheme.
//!
//! Grounded on `examples/original_source/deimos/docker.py`
//! (`matching_image_for_host`, `image_token`) and
//! `examples/original_source/deimos/containerizer/docker.py`
//! (`Docker.determine_image`, `Docker.image_from_system_context`).

use std::{fs, path::Path};

use crate::config::IndexSettings;
use crate::Error;

const DEFAULT_OS_RELEASE: &str = "/etc/os-release";

/// Decide the image to run: explicit URL wins, then the per-config default,
/// then a host-derived default. Both the explicit URL and the configured
/// default are parsed as `docker:///...` references; the host-derived
/// fallback is composed directly as a bare image name.
pub fn determine_image(
    image_url: &str,
    needs_observer: bool,
    image_default: Option<&str>,
    index: &IndexSettings,
) -> Result<String, Error> {
    if !image_url.is_empty() {
        return Ok(launchspec::url_to_image(image_url)?);
    }
    if let Some(default) = image_default {
        return Ok(launchspec::url_to_image(default)?);
    }
    image_from_system_context(needs_observer, index)
}

/// Compose `<index>/<account>/<distro>:<release>` from `/etc/os-release`,
/// using `account_libmesos` in place of `account` when the adapter itself
/// needs the image (no framework executor present).
pub fn image_from_system_context(needs_observer: bool, index: &IndexSettings) -> Result<String, Error> {
    image_from_os_release(Path::new(DEFAULT_OS_RELEASE), needs_observer, index)
}

fn image_from_os_release(path: &Path, needs_observer: bool, index: &IndexSettings) -> Result<String, Error> {
    let contents = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let (id, version) = parse_os_release(&contents);
    let name = match (id, version) {
        (Some(id), Some(version)) => format!("{}:{}", id.to_lowercase(), version.to_lowercase()),
        (Some(id), None) => id.to_lowercase(),
        _ => return Err(Error::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, "missing ID in os-release"))),
    };

    let account = if !needs_observer {
        index.account_libmesos.as_deref().or(index.account.as_deref())
    } else {
        index.account.as_deref()
    };
    Ok(image_token(&name, account, index.index.as_deref()))
}

/// `ID=value` / `VERSION_ID=value` lines from an `/etc/os-release`-shaped
/// file, tolerating optional double-quoting around the value.
fn parse_os_release(contents: &str) -> (Option<String>, Option<String>) {
    let mut id = None;
    let mut version = None;
    for line in contents.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key {
            "ID" => id = Some(value),
            "VERSION_ID" => version = Some(value),
            _ => {}
        }
    }
    (id, version)
}

/// Join `[index, account, name]`, dropping any that are absent, with `/`.
fn image_token(name: &str, account: Option<&str>, index: Option<&str>) -> String {
    [index, account, Some(name)]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::TempDir;

    #[test]
    fn parses_id_and_version_with_quotes() {
        let (id, version) = parse_os_release("NAME=\"Alpine Linux\"\nID=alpine\nVERSION_ID=3.18.2\n");
        assert_eq!(id.as_deref(), Some("alpine"));
        assert_eq!(version.as_deref(), Some("3.18.2"));
    }

    #[test]
    fn token_joins_present_parts_only() {
        assert_eq!(image_token("alpine:3.18", None, None), "alpine:3.18");
        assert_eq!(image_token("alpine:3.18", Some("acct"), None), "acct/alpine:3.18");
        assert_eq!(image_token("alpine:3.18", Some("acct"), Some("registry.example.com")), "registry.example.com/acct/alpine:3.18");
    }

    #[test]
    fn determine_image_prefers_explicit_url() -> Result<()> {
        let image = determine_image("docker:///ubuntu:22.04", true, Some("docker:///alpine:3.18"), &IndexSettings::default())?;
        assert_eq!(image, "ubuntu:22.04");
        Ok(())
    }

    #[test]
    fn determine_image_falls_back_to_configured_default() -> Result<()> {
        let image = determine_image("", true, Some("docker:///alpine:3.18"), &IndexSettings::default())?;
        assert_eq!(image, "alpine:3.18");
        Ok(())
    }

    #[test]
    fn host_derived_default_uses_account_libmesos_when_no_observer_needed() -> Result<()> {
        let dir = TempDir::new()?;
        let release = dir.path().join("os-release");
        fs::write(&release, "ID=alpine\nVERSION_ID=3.18\n")?;
        let index = IndexSettings {
            index: Some("reg".into()),
            account: Some("acct".into()),
            account_libmesos: Some("libmesos".into()),
        };
        let image = image_from_os_release(&release, false, &index)?;
        assert_eq!(image, "reg/libmesos/alpine:3.18");

        let image = image_from_os_release(&release, true, &index)?;
        assert_eq!(image, "reg/acct/alpine:3.18");
        Ok(())
    }
}
