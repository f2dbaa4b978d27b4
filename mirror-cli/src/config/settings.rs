//! Application settings assembled from CLI options and the environment.

use std::path::PathBuf;

use anyhow::{bail, ensure, Context};
use smart_default::SmartDefault;
use structopt::StructOpt;

use commons::{overlay_if_some, MergeOptions};
use mirror::filter::ModuleFilter;
use mirror::registry::AuthMode;
use mirror::transfer::Parallelism;

use super::cli::{CliOptions, CommonOptions, PullOptions, PushOptions};

const GIB: u64 = 1024 * 1024 * 1024;

/// Credential and verbosity fallbacks sourced from the environment.
#[derive(Debug, Default, Clone)]
pub struct Environment {
    pub license_token: Option<String>,
    pub source_login: Option<String>,
    pub source_password: Option<String>,
    pub registry_login: Option<String>,
    pub registry_password: Option<String>,
    pub debug_log: Option<String>,
}

impl Environment {
    /// Read the recognized environment variables.
    pub fn lookup() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Environment {
            license_token: var("D8_MIRROR_LICENSE_TOKEN"),
            source_login: var("D8_MIRROR_SOURCE_LOGIN"),
            source_password: var("D8_MIRROR_SOURCE_PASSWORD"),
            registry_login: var("D8_MIRROR_REGISTRY_LOGIN"),
            registry_password: var("D8_MIRROR_REGISTRY_PASSWORD"),
            debug_log: var("MIRROR_DEBUG_LOG"),
        }
    }
}

/// Runtime settings shared by both commands (validated config).
#[derive(Debug, SmartDefault)]
pub struct CommonSettings {
    /// Global log level.
    #[default(log::LevelFilter::Info)]
    pub verbosity: log::LevelFilter,

    pub insecure: bool,
    pub tls_skip_verify: bool,

    /// Transient working directory base.
    #[default(std::env::temp_dir().join("d8-mirror"))]
    pub tmp_dir: PathBuf,

    /// Bundle chunk size in bytes; zero disables chunking.
    pub chunk_size: u64,

    #[default(Parallelism { images: 5, blobs: 4 })]
    pub parallelism: Parallelism,
}

impl MergeOptions<&CommonOptions> for CommonSettings {
    fn try_merge(&mut self, options: &CommonOptions) -> anyhow::Result<()> {
        self.insecure = options.insecure;
        self.tls_skip_verify = options.tls_skip_verify;
        overlay_if_some!(self.tmp_dir, options.tmp_dir.clone());
        if let Some(gib) = options.images_bundle_chunk_size {
            self.chunk_size = gib
                .checked_mul(GIB)
                .context("images-bundle-chunk-size is too large")?;
        }
        Ok(())
    }
}

impl MergeOptions<&Environment> for CommonSettings {
    fn try_merge(&mut self, env: &Environment) -> anyhow::Result<()> {
        if let Some(level) = &env.debug_log {
            self.verbosity =
                commons::de::loglevel_from_env(level).context("parse MIRROR_DEBUG_LOG")?;
        }
        Ok(())
    }
}

/// Credential fragments before resolution into an auth mode.
#[derive(Default)]
pub struct CredentialOptions {
    pub license: Option<String>,
    pub login: Option<String>,
    pub password: Option<String>,
}

// Secrets stay out of debug dumps.
impl std::fmt::Debug for CredentialOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mark = |set: bool| if set { "<redacted>" } else { "<unset>" };
        f.debug_struct("CredentialOptions")
            .field("license", &mark(self.license.is_some()))
            .field("login", &self.login)
            .field("password", &mark(self.password.is_some()))
            .finish()
    }
}

impl CredentialOptions {
    /// Resolve into an auth mode; a license token wins over a login pair.
    fn try_resolve(&self) -> anyhow::Result<AuthMode> {
        if let Some(token) = &self.license {
            return Ok(AuthMode::License {
                token: token.clone(),
            });
        }
        match (&self.login, &self.password) {
            (Some(username), Some(password)) => Ok(AuthMode::Basic {
                username: username.clone(),
                password: password.clone(),
            }),
            (Some(username), None) => bail!("no password given for user '{}'", username),
            (None, Some(_)) => bail!("a password without a login is unusable"),
            (None, None) => Ok(AuthMode::Anonymous),
        }
    }
}

/// Runtime settings for the pull command.
#[derive(Debug, SmartDefault)]
pub struct PullSettings {
    pub common: CommonSettings,
    pub source: String,
    pub credentials: CredentialOptions,
    #[default(AuthMode::Anonymous)]
    pub auth: AuthMode,
    pub since_version: Option<semver::Version>,
    pub deckhouse_tag: Option<String>,
    pub filter: ModuleFilter,
    #[default("modules".to_string())]
    pub modules_path_suffix: String,
    pub no_platform: bool,
    pub no_security_db: bool,
    pub no_modules: bool,
    pub gost_digest: bool,
    pub force: bool,
    #[default(true)]
    pub resume: bool,
    pub bundle_dir: PathBuf,
}

impl MergeOptions<PullOptions> for PullSettings {
    fn try_merge(&mut self, options: PullOptions) -> anyhow::Result<()> {
        ensure!(
            options.deckhouse_tag.is_none() || options.since_version.is_none(),
            "deckhouse-tag and since-version are mutually exclusive"
        );
        ensure!(
            options.license.is_none() || options.source_login.is_none(),
            "license and source-login are mutually exclusive"
        );
        ensure!(
            options.source_password.is_none() || options.source_login.is_some(),
            "source-password requires source-login"
        );

        self.common.try_merge(&options.common)?;
        self.source = options.source;
        overlay_if_some!(self.credentials.license, options.license);
        overlay_if_some!(self.credentials.login, options.source_login);
        overlay_if_some!(self.credentials.password, options.source_password);

        self.since_version = match &options.since_version {
            Some(raw) => Some(
                mirror::versions::parse_version(raw)
                    .with_context(|| format!("invalid since-version '{}'", raw))?,
            ),
            None => None,
        };
        self.deckhouse_tag = options.deckhouse_tag;
        self.filter =
            ModuleFilter::from_include_exclude(&options.include_module, &options.exclude_module)?;
        self.modules_path_suffix = options.modules_path_suffix;
        self.no_platform = options.no_platform;
        self.no_security_db = options.no_security_db;
        self.no_modules = options.no_modules;
        self.gost_digest = options.gost_digest;
        self.force = options.force;
        self.resume = !options.no_pull_resume;
        self.bundle_dir = options.images_bundle_path;
        Ok(())
    }
}

impl MergeOptions<&Environment> for PullSettings {
    fn try_merge(&mut self, env: &Environment) -> anyhow::Result<()> {
        self.common.try_merge(env)?;
        // The environment only fills credential gaps the CLI left open.
        if self.credentials.license.is_none() && self.credentials.login.is_none() {
            overlay_if_some!(self.credentials.license, env.license_token.clone());
        }
        if self.credentials.license.is_none() {
            overlay_if_some!(self.credentials.login, env.source_login.clone());
            overlay_if_some!(self.credentials.password, env.source_password.clone());
        }
        Ok(())
    }
}

impl PullSettings {
    /// Validate and build runtime settings.
    fn try_validate(mut self) -> anyhow::Result<Self> {
        self.auth = self.credentials.try_resolve()?;
        ensure!(!self.source.is_empty(), "empty source registry");
        Ok(self)
    }
}

/// Runtime settings for the push command.
#[derive(Debug, SmartDefault)]
pub struct PushSettings {
    pub common: CommonSettings,
    pub registry: String,
    pub credentials: CredentialOptions,
    #[default(AuthMode::Anonymous)]
    pub auth: AuthMode,
    #[default("modules".to_string())]
    pub modules_path_suffix: String,
    pub bundle_dir: PathBuf,
}

impl MergeOptions<PushOptions> for PushSettings {
    fn try_merge(&mut self, options: PushOptions) -> anyhow::Result<()> {
        ensure!(
            options.registry_password.is_none() || options.registry_login.is_some(),
            "registry-password requires registry-login"
        );

        self.common.try_merge(&options.common)?;
        self.registry = options.registry;
        overlay_if_some!(self.credentials.login, options.registry_login);
        overlay_if_some!(self.credentials.password, options.registry_password);
        self.modules_path_suffix = options.modules_path_suffix;
        self.bundle_dir = options.images_bundle_path;
        Ok(())
    }
}

impl MergeOptions<&Environment> for PushSettings {
    fn try_merge(&mut self, env: &Environment) -> anyhow::Result<()> {
        self.common.try_merge(env)?;
        if self.credentials.login.is_none() {
            overlay_if_some!(self.credentials.login, env.registry_login.clone());
            overlay_if_some!(self.credentials.password, env.registry_password.clone());
        }
        Ok(())
    }
}

impl PushSettings {
    /// Validate and build runtime settings.
    fn try_validate(mut self) -> anyhow::Result<Self> {
        self.auth = self.credentials.try_resolve()?;
        ensure!(!self.registry.is_empty(), "empty destination registry");
        Ok(self)
    }
}

/// Validated runtime settings for one invocation.
#[derive(Debug)]
pub enum AppSettings {
    Pull(PullSettings),
    Push(PushSettings),
}

impl AppSettings {
    /// Lookup all optional configs, merge them with defaults, and
    /// transform into valid runtime settings.
    pub fn assemble() -> anyhow::Result<Self> {
        let cli_opts = CliOptions::from_args();
        Self::from_options(cli_opts, &Environment::lookup())
    }

    /// Merge CLI options with environment fallbacks and validate.
    pub fn from_options(options: CliOptions, env: &Environment) -> anyhow::Result<Self> {
        match options {
            CliOptions::Pull(pull_opts) => {
                let mut settings = PullSettings::default();
                settings.try_merge(pull_opts)?;
                settings.try_merge(env)?;
                Ok(AppSettings::Pull(settings.try_validate()?))
            }
            CliOptions::Push(push_opts) => {
                let mut settings = PushSettings::default();
                settings.try_merge(push_opts)?;
                settings.try_merge(env)?;
                Ok(AppSettings::Push(settings.try_validate()?))
            }
        }
    }

    pub fn verbosity(&self) -> log::LevelFilter {
        match self {
            AppSettings::Pull(settings) => settings.common.verbosity,
            AppSettings::Push(settings) => settings.common.verbosity,
        }
    }
}
