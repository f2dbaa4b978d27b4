//! The `d8-mirror` command: pull a platform distribution into a portable
//! bundle, and push that bundle into an air-gapped registry.

use log::debug;

use mirror::ops::{self, PullContext, PushContext};
use mirror::registry::{ImageRepo, RegistryClient, RegistryConfig};

mod config;

use config::AppSettings;

fn main() {
    let settings = match AppSettings::assemble() {
        Ok(settings) => settings,
        Err(err) => fail(&err),
    };

    env_logger::Builder::from_default_env()
        .filter_level(settings.verbosity())
        .init();
    debug!("application settings:\n{:#?}", &settings);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => fail(&anyhow::Error::from(err)),
    };

    if let Err(err) = runtime.block_on(run(settings)) {
        fail(&err);
    }
}

fn fail(err: &anyhow::Error) -> ! {
    eprint!("{}", commons::format_error_report(err));
    std::process::exit(1);
}

async fn run(settings: AppSettings) -> anyhow::Result<()> {
    match settings {
        AppSettings::Pull(pull) => {
            let client = build_client(
                &pull.source,
                &RegistryConfig {
                    insecure: pull.common.insecure,
                    skip_tls_verify: pull.common.tls_skip_verify,
                    auth: pull.auth.clone(),
                    blob_concurrency: pull.common.parallelism.blobs,
                },
            )?;
            let ctx = PullContext {
                client,
                working_dir: pull.common.tmp_dir.join("pull"),
                bundle_dir: pull.bundle_dir.clone(),
                chunk_size: pull.common.chunk_size,
                parallelism: pull.common.parallelism,
                deckhouse_tag: pull.deckhouse_tag.clone(),
                since_version: pull.since_version.clone(),
                ignore_suspend: false,
                filter: pull.filter.clone(),
                modules_path_suffix: pull.modules_path_suffix.clone(),
                skip_platform: pull.no_platform,
                skip_security_db: pull.no_security_db,
                skip_modules: pull.no_modules,
                gost_digest: pull.gost_digest,
                force: pull.force,
                resume: pull.resume,
            };
            ops::run_pull(&ctx).await
        }
        AppSettings::Push(push) => {
            let client = build_client(
                &push.registry,
                &RegistryConfig {
                    insecure: push.common.insecure,
                    skip_tls_verify: push.common.tls_skip_verify,
                    auth: push.auth.clone(),
                    blob_concurrency: push.common.parallelism.blobs,
                },
            )?;
            let ctx = PushContext {
                client,
                working_dir: push.common.tmp_dir.join("push"),
                bundle_dir: push.bundle_dir.clone(),
                parallelism: push.common.parallelism,
                modules_path_suffix: push.modules_path_suffix.clone(),
            };
            ops::run_push(&ctx).await
        }
    }
}

fn build_client(base: &str, config: &RegistryConfig) -> anyhow::Result<Box<dyn ImageRepo>> {
    Ok(Box::new(RegistryClient::new(base, config)?))
}
