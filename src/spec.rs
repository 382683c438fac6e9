//! Declarative build spec.
//!
//! A build spec is a TOML file describing everything one appliance image
//! needs: the base distribution, external artifacts, files to install,
//! commands to run inside the chroot, and packaging details. The spec is
//! immutable for the duration of a build.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Complete description of one appliance image build.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSpec {
    /// Product name, used in the archive name (`<product>-<version>.tar.gz`).
    pub product: String,

    /// Base distribution to bootstrap into the tree. Omit to start from an
    /// empty root (the artifacts and install directives supply everything).
    pub base: Option<BaseSpec>,

    /// External artifacts to fetch and stage.
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,

    /// Local files to install into the tree.
    #[serde(default)]
    pub install: Vec<InstallDirective>,

    /// In-chroot configuration phase.
    #[serde(default)]
    pub chroot: ChrootSpec,

    /// Packaging phase.
    #[serde(default)]
    pub package: PackageSpec,

    /// Pseudo filesystems bound into the tree while configuring.
    #[serde(default = "default_pseudo_filesystems")]
    pub pseudo_filesystems: Vec<String>,
}

/// Base distribution descriptor, handed to the bootstrapper verbatim.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseSpec {
    /// Bootstrapper binary (e.g. `debootstrap`).
    pub bootstrapper: String,
    /// Distribution suite (e.g. `bookworm`).
    pub suite: String,
    /// Package mirror URL. The bootstrapper's default applies when omitted.
    pub mirror: Option<String>,
    /// Bootstrap variant (e.g. `minbase`).
    pub variant: Option<String>,
}

/// One external artifact: where it comes from, how to verify it, and where
/// it lands inside the tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactSpec {
    /// Artifact name, unique within the spec.
    pub name: String,
    /// HTTP(S) URL or local path.
    pub source: String,
    /// Expected SHA-256 of the fetched bytes (lowercase hex). Fetches are
    /// verified and cached against this; omit to skip verification.
    pub sha256: Option<String>,
    /// Destination inside the tree. A file path, or a directory when
    /// `unpack` is set.
    pub dest: String,
    /// Mode bits for the installed file, octal string (e.g. `"0755"`).
    pub mode: Option<String>,
    /// Extract the artifact (gzipped tar) into `dest` instead of copying it.
    #[serde(default)]
    pub unpack: bool,
}

/// A local file copied into the tree with declared mode and ownership.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallDirective {
    /// Source file on the host.
    pub src: String,
    /// Destination inside the tree.
    pub dst: String,
    /// Mode bits, octal string (e.g. `"0644"`). Source permissions are kept
    /// when omitted.
    pub mode: Option<String>,
    /// Numeric ownership as `uid:gid`. Left untouched when omitted.
    pub owner: Option<String>,
}

/// In-chroot configuration commands and their environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChrootSpec {
    #[serde(default)]
    pub commands: Vec<ChrootCommand>,

    /// Host environment variables passed through to in-chroot commands.
    /// Everything else is cleared.
    #[serde(default = "default_env_allow")]
    pub env_allow: Vec<String>,

    /// Extra environment set for every in-chroot command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for ChrootSpec {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            env_allow: default_env_allow(),
            env: BTreeMap::new(),
        }
    }
}

/// One command executed inside the staged tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChrootCommand {
    /// Program and arguments, absolute path inside the tree.
    pub argv: Vec<String>,
    /// Log and continue on non-zero exit instead of aborting the build.
    #[serde(default)]
    pub best_effort: bool,
}

/// Packaging options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSpec {
    /// Transient paths (relative to the tree root) removed before archiving,
    /// in addition to the staged resolv.conf.
    #[serde(default)]
    pub scrub: Vec<String>,
}

fn default_pseudo_filesystems() -> Vec<String> {
    vec!["proc".to_string(), "sys".to_string(), "dev".to_string()]
}

fn default_env_allow() -> Vec<String> {
    vec!["PATH".to_string()]
}

impl BuildSpec {
    /// Load and validate a build spec from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading build spec '{}'", path.display()))?;
        let spec: BuildSpec = toml::from_str(&text)
            .with_context(|| format!("parsing build spec '{}'", path.display()))?;
        spec.validate()
            .with_context(|| format!("invalid build spec '{}'", path.display()))?;
        Ok(spec)
    }

    /// Validate cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.product.trim().is_empty() {
            bail!("product name is empty");
        }

        let mut seen = std::collections::BTreeSet::new();
        for artifact in &self.artifacts {
            if !seen.insert(artifact.name.as_str()) {
                bail!("duplicate artifact name: {}", artifact.name);
            }
            if let Some(mode) = &artifact.mode {
                parse_mode(mode)
                    .with_context(|| format!("artifact '{}' mode", artifact.name))?;
            }
            if artifact.unpack && artifact.mode.is_some() {
                bail!(
                    "artifact '{}': mode does not apply to unpacked archives",
                    artifact.name
                );
            }
        }

        for directive in &self.install {
            if let Some(mode) = &directive.mode {
                parse_mode(mode).with_context(|| format!("install '{}' mode", directive.dst))?;
            }
            if let Some(owner) = &directive.owner {
                parse_owner(owner)
                    .with_context(|| format!("install '{}' owner", directive.dst))?;
            }
        }

        for command in &self.chroot.commands {
            if command.argv.is_empty() {
                bail!("chroot command with empty argv");
            }
        }

        Ok(())
    }
}

/// Parse an octal mode string like `"0755"`.
pub fn parse_mode(s: &str) -> Result<u32> {
    let digits = s.trim_start_matches("0o");
    let mode = u32::from_str_radix(digits, 8)
        .with_context(|| format!("invalid octal mode '{s}'"))?;
    if mode > 0o7777 {
        bail!("mode out of range: '{s}'");
    }
    Ok(mode)
}

/// Parse numeric ownership `uid:gid`.
pub fn parse_owner(s: &str) -> Result<(u32, u32)> {
    let (uid, gid) = s
        .split_once(':')
        .with_context(|| format!("owner '{s}' is not of the form uid:gid"))?;
    let uid = uid
        .parse::<u32>()
        .with_context(|| format!("invalid uid in owner '{s}'"))?;
    let gid = gid
        .parse::<u32>()
        .with_context(|| format!("invalid gid in owner '{s}'"))?;
    Ok((uid, gid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mode_accepts_common_forms() {
        assert_eq!(parse_mode("0755").unwrap(), 0o755);
        assert_eq!(parse_mode("644").unwrap(), 0o644);
        assert_eq!(parse_mode("0o600").unwrap(), 0o600);
    }

    #[test]
    fn parse_mode_rejects_garbage() {
        assert!(parse_mode("rwxr-xr-x").is_err());
        assert!(parse_mode("99999").is_err());
    }

    #[test]
    fn parse_owner_roundtrip() {
        assert_eq!(parse_owner("0:0").unwrap(), (0, 0));
        assert_eq!(parse_owner("1000:100").unwrap(), (1000, 100));
        assert!(parse_owner("root:root").is_err());
        assert!(parse_owner("1000").is_err());
    }

    #[test]
    fn minimal_spec_gets_defaults() {
        let spec: BuildSpec = toml::from_str(r#"product = "sector-dns""#).unwrap();
        spec.validate().unwrap();
        assert_eq!(spec.pseudo_filesystems, ["proc", "sys", "dev"]);
        assert_eq!(spec.chroot.env_allow, ["PATH"]);
        assert!(spec.artifacts.is_empty());
        assert!(spec.base.is_none());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<BuildSpec, _> = toml::from_str(
            r#"
            product = "x"
            bogus = true
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_artifact_names_are_rejected() {
        let spec: BuildSpec = toml::from_str(
            r#"
            product = "x"

            [[artifacts]]
            name = "coredns"
            source = "/tmp/a"
            dest = "usr/local/bin/coredns"

            [[artifacts]]
            name = "coredns"
            source = "/tmp/b"
            dest = "usr/local/bin/coredns2"
            "#,
        )
        .unwrap();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn empty_argv_is_rejected() {
        let spec: BuildSpec = toml::from_str(
            r#"
            product = "x"

            [[chroot.commands]]
            argv = []
            "#,
        )
        .unwrap();
        assert!(spec.validate().is_err());
    }
}
