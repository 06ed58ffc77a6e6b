use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};

use consign::{
    config::Config,
    pipeline,
    registry::HttpRegistry,
    report::JsonlReportSink,
    repos,
    sign::SignRequest,
    signer::{CosignSigner, FileSignatureStore, SignOptions, SignOutcome},
    sigstore::SigstoreClient,
    snapshot::Snapshot,
};

/// consignctl
#[derive(Debug, Parser)]
#[clap(name = "consignctl", version)]
pub struct App {
    /// Path to a TOML configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Args)]
struct SignArgs {
    /// Key the signing backend signs with
    #[clap(long)]
    signing_key: String,
    #[clap(long)]
    task_id: Option<u64>,
    #[clap(long)]
    chunk_size: Option<usize>,
    /// Log what would be signed without signing anything
    #[clap(long)]
    dry_run: bool,
}

impl SignArgs {
    fn options(&self, config: &Config) -> SignOptions {
        SignOptions {
            chunk_size: self.chunk_size.unwrap_or(config.signing.chunk_size),
            task_id: self.task_id.unwrap_or(config.signing.task_id),
            dry_run: self.dry_run,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve and sign explicit image references
    SignContainers {
        /// `registry/image:tag` or `registry/image@digest` references
        references: Vec<String>,
        /// Identity to anchor the signatures under; give one per
        /// reference, a single one for all, or none
        #[clap(long)]
        identity: Vec<String>,
        #[clap(flatten)]
        sign: SignArgs,
    },
    /// Sign every live tag of the given repositories
    SignRepos {
        /// `registry/namespace/name` repositories
        #[clap(long)]
        repo: Vec<String>,
        /// File with one repository per line
        #[clap(long)]
        repo_file: Option<PathBuf>,
        /// Registry host each identity is anchored under
        #[clap(long)]
        identity_base: Vec<String>,
        #[clap(flatten)]
        sign: SignArgs,
    },
    /// Sign every component image of a release snapshot
    SignSnapshot {
        /// Snapshot JSON document
        file: PathBuf,
        #[clap(flatten)]
        sign: SignArgs,
    },
    /// Verify references against both trust sources and append a report row
    Verify {
        references: Vec<String>,
        #[clap(long)]
        identity: Vec<String>,
        /// Public key cosign verifies against
        #[clap(long)]
        public_key: PathBuf,
    },
    /// List a namespace's tags by last-modified window
    LatestRepoTags {
        namespace: String,
        /// RFC 3339 lower bound
        #[clap(long)]
        not_before: Option<String>,
        /// RFC 3339 upper bound
        #[clap(long)]
        not_after: Option<String>,
    },
}

fn zip_identities(references: &[String], identities: &[String]) -> Result<Vec<Option<String>>> {
    match identities.len() {
        0 => Ok(vec![None; references.len()]),
        1 => Ok(vec![Some(identities[0].clone()); references.len()]),
        n if n == references.len() => Ok(identities.iter().cloned().map(Some).collect()),
        n => bail!(
            "got {n} identities for {} references; give one per reference, one for all, or none",
            references.len()
        ),
    }
}

fn parse_bound(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("invalid RFC 3339 timestamp {raw:?}"))?;
            Ok(Some(parsed.with_timezone(&Utc)))
        }
        None => Ok(None),
    }
}

fn print_outcome(outcome: &SignOutcome, dry_run: bool) {
    let verb = if dry_run { "would sign" } else { "signed" };
    println!(
        "{verb} {} entries in {} chunks",
        outcome.signed.len(),
        outcome.chunk_states.len()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = App::parse();

    let config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("can't read config file {path:?}"))?;
            Config::from_toml(&content).with_context(|| format!("can't parse {path:?}"))?
        }
        None => Config::default(),
    };

    let mut registry = HttpRegistry::new(&config.registry.host);
    if let (Some(username), Some(password)) =
        (&config.registry.username, &config.registry.password)
    {
        registry = registry.with_basic_auth(username, password);
    }
    let registry = Arc::new(registry);

    match args.cmd {
        Command::SignContainers {
            ref references,
            ref identity,
            ref sign,
        } => {
            let identities = zip_identities(references, identity)?;
            let requests: Vec<SignRequest> = references
                .iter()
                .zip(identities)
                .map(|(reference, identity)| {
                    SignRequest::new(reference, identity, &sign.signing_key)
                })
                .collect();
            let backend = Arc::new(
                CosignSigner::new(&config.registry.host).with_binary(&config.signing.binary),
            );
            let store = Arc::new(FileSignatureStore::open(&config.signing.store_path).await?);
            let outcome = pipeline::sign_requests(
                &registry,
                &backend,
                &store,
                requests,
                sign.options(&config),
                config.executors(),
            )
            .await?;
            print_outcome(&outcome, sign.dry_run);
        }
        Command::SignRepos {
            ref repo,
            ref repo_file,
            ref identity_base,
            ref sign,
        } => {
            let backend = Arc::new(
                CosignSigner::new(&config.registry.host).with_binary(&config.signing.binary),
            );
            let store = Arc::new(FileSignatureStore::open(&config.signing.store_path).await?);
            let outcome = pipeline::sign_repos(
                &registry,
                &backend,
                &store,
                repo,
                repo_file.as_deref(),
                identity_base,
                &sign.signing_key,
                sign.options(&config),
                config.executors(),
            )
            .await?;
            print_outcome(&outcome, sign.dry_run);
        }
        Command::SignSnapshot { ref file, ref sign } => {
            let content = std::fs::read_to_string(file)
                .with_context(|| format!("can't read snapshot {file:?}"))?;
            let snapshot = Snapshot::parse(&content)
                .with_context(|| format!("can't parse snapshot {file:?}"))?;
            let backend = Arc::new(
                CosignSigner::new(&config.registry.host).with_binary(&config.signing.binary),
            );
            let store = Arc::new(FileSignatureStore::open(&config.signing.store_path).await?);
            let outcome = pipeline::sign_snapshot(
                &registry,
                &backend,
                &store,
                &snapshot,
                &sign.signing_key,
                sign.options(&config),
                config.executors(),
            )
            .await?;
            print_outcome(&outcome, sign.dry_run);
        }
        Command::Verify {
            ref references,
            ref identity,
            ref public_key,
        } => {
            if config.verify.sigstore_base_url.is_empty() {
                bail!("verify.sigstore_base_url is not configured");
            }
            let identities = zip_identities(references, identity)?;
            let requests: Vec<SignRequest> = references
                .iter()
                .zip(identities)
                .map(|(reference, identity)| SignRequest::new(reference, identity, ""))
                .collect();
            let legacy = SigstoreClient::new(&config.verify.sigstore_base_url);
            let cosign = config.verify.client(public_key);
            let sink = JsonlReportSink::new(&config.report.path);
            let row = pipeline::verify_and_report(
                &registry,
                &legacy,
                &cosign,
                &sink,
                requests,
                &config.verify_options(),
                config.executors().preprocess,
            )
            .await?;
            println!("{}", serde_json::to_string(&row)?);
        }
        Command::LatestRepoTags {
            ref namespace,
            ref not_before,
            ref not_after,
        } => {
            let not_before = parse_bound(not_before.as_deref())?;
            let not_after = parse_bound(not_after.as_deref())?;
            let lines =
                repos::latest_repo_tags(&*registry, namespace, not_before, not_after).await?;
            for line in lines {
                println!("{line}");
            }
        }
    }
    Ok(())
}
