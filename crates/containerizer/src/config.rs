//! Runtime-parameter option bags, analogous to `deimos.config`'s
//! `Hooks`/`Containers`/`DockerIndex` sections -- but populated by the `cli`
//! crate from flags/env vars rather than an INI file, since the
//! configuration-file loader itself is out of scope (SPEC_FULL.md §1, §11).

use std::path::PathBuf;

/// Operator-configured commands fired (as detached children, failures
/// ignored) on launch and destroy. Grounded on `deimos.config.Hooks`.
#[derive(Clone, Debug, Default)]
pub struct Hooks {
    pub onlaunch: Vec<String>,
    pub ondestroy: Vec<String>,
}

/// Image-naming overrides. Grounded on `deimos.config.Containers`/`Image`
/// and `deimos.docker.matching_image_for_host`/`image_token`.
#[derive(Clone, Debug, Default)]
pub struct ContainerSettings {
    /// A `docker:///...` URL used whenever the descriptor specifies none.
    /// Wins over the host-derived default but loses to an explicit URL.
    pub image_default: Option<String>,
    /// Optional path to a `.dockercfg` to stage into the sandbox before
    /// `run` is invoked. Grounded on `Docker.place_dockercfg`.
    pub dockercfg: Option<PathBuf>,
}

/// `index`/`account` prefixing for the host-derived default image, e.g.
/// `<index>/<account>/<distro>:<release>`. `account_libmesos` overrides
/// `account` specifically when the adapter itself needs an image (no
/// framework executor, i.e. `needs_observer`). Grounded on
/// `deimos.docker.image_token`.
#[derive(Clone, Debug, Default)]
pub struct IndexSettings {
    pub index: Option<String>,
    pub account: Option<String>,
    pub account_libmesos: Option<String>,
}
