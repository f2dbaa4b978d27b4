//! Command-line options.

use std::path::PathBuf;

use structopt::StructOpt;

/// CLI configuration flags, top-level.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "d8-mirror",
    about = "Mirror a platform distribution into an air-gapped registry"
)]
pub enum CliOptions {
    /// Download platform releases, security databases and modules into a
    /// transportable bundle
    #[structopt(name = "pull")]
    Pull(PullOptions),

    /// Upload a previously pulled bundle into a destination registry
    #[structopt(name = "push")]
    Push(PushOptions),
}

/// CLI configuration flags shared by both commands.
#[derive(Debug, StructOpt)]
pub struct CommonOptions {
    /// Talk plain HTTP to the registry
    #[structopt(long = "insecure")]
    pub insecure: bool,

    /// Skip registry TLS certificate verification
    #[structopt(long = "tls-skip-verify")]
    pub tls_skip_verify: bool,

    /// Base directory for transient working data
    #[structopt(long = "tmp-dir")]
    pub tmp_dir: Option<PathBuf>,

    /// Split bundle files into chunks of this many GiB (0 disables chunking)
    #[structopt(long = "images-bundle-chunk-size")]
    pub images_bundle_chunk_size: Option<u64>,
}

/// CLI configuration flags, pull command.
#[derive(Debug, StructOpt)]
pub struct PullOptions {
    #[structopt(flatten)]
    pub common: CommonOptions,

    /// Source registry repository path
    #[structopt(long = "source", default_value = "registry.deckhouse.io/deckhouse/ee")]
    pub source: String,

    /// Product license token, sent as a bearer credential
    #[structopt(long = "license")]
    pub license: Option<String>,

    /// Source registry login for basic authentication
    #[structopt(long = "source-login")]
    pub source_login: Option<String>,

    /// Source registry password for basic authentication
    #[structopt(long = "source-password")]
    pub source_password: Option<String>,

    /// Oldest release to include when walking release channels
    #[structopt(long = "since-version")]
    pub since_version: Option<String>,

    /// Pull exactly this build instead of walking release channels
    #[structopt(long = "deckhouse-tag")]
    pub deckhouse_tag: Option<String>,

    /// Module to mirror: `name` or `name@constraint` (repeatable)
    #[structopt(long = "include-module")]
    pub include_module: Vec<String>,

    /// Module to skip (repeatable; ignored when include-module is given)
    #[structopt(long = "exclude-module")]
    pub exclude_module: Vec<String>,

    /// Repository path suffix where modules live
    #[structopt(long = "modules-path-suffix", default_value = "modules")]
    pub modules_path_suffix: String,

    /// Skip platform releases
    #[structopt(long = "no-platform")]
    pub no_platform: bool,

    /// Skip security vulnerability databases
    #[structopt(long = "no-security-db")]
    pub no_security_db: bool,

    /// Skip modules
    #[structopt(long = "no-modules")]
    pub no_modules: bool,

    /// Write GOST R 34.11-2012 checksums next to bundle files
    #[structopt(long = "gost-digest")]
    pub gost_digest: bool,

    /// Overwrite bundle files left by a previous run
    #[structopt(long = "force")]
    pub force: bool,

    /// Discard partially pulled working data instead of resuming into it
    #[structopt(long = "no-pull-resume")]
    pub no_pull_resume: bool,

    /// Directory receiving the bundle files
    #[structopt(name = "images-bundle-path", default_value = ".")]
    pub images_bundle_path: PathBuf,
}

/// CLI configuration flags, push command.
#[derive(Debug, StructOpt)]
pub struct PushOptions {
    #[structopt(flatten)]
    pub common: CommonOptions,

    /// Destination registry repository path
    #[structopt(long = "registry")]
    pub registry: String,

    /// Destination registry login for basic authentication
    #[structopt(long = "registry-login")]
    pub registry_login: Option<String>,

    /// Destination registry password for basic authentication
    #[structopt(long = "registry-password")]
    pub registry_password: Option<String>,

    /// Repository path suffix where modules live
    #[structopt(long = "modules-path-suffix", default_value = "modules")]
    pub modules_path_suffix: String,

    /// Directory holding the bundle files
    #[structopt(long = "images-bundle-path", default_value = ".")]
    pub images_bundle_path: PathBuf,
}
