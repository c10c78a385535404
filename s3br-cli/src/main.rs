use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use std::future::Future;
use std::io::{BufRead, Write};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit code for any failure, including being interrupted
const FAILURE_EXIT_CODE: i32 = 127;

/// Incremental backup and restore of S3 buckets.
///
/// All copies are server-side, nothing is downloaded to the machine running this tool.
#[derive(Parser, Debug)]
#[clap(author, version, long_version = LONG_VERSION, about, long_about = None)]
struct Args {
    /// Operation to perform
    #[clap(subcommand)]
    command: Command,

    /// Log more; repeat for even more (-v for info, -vv for debug).  Ignored if RUST_LOG is set.
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(flatten)]
    config: s3br::Config,
}

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_CARGO_TARGET_TRIPLE"),
    ")"
);

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up the source bucket into the destination bucket.
    ///
    /// Objects missing from the destination are copied.  Objects in both buckets are copied again
    /// if they differ in size, or were modified within the `--last-modified-since` window.
    Backup {
        /// Bucket to back up
        #[clap(short = 's', long, env = "SOURCE_BUCKET")]
        source_bucket: String,

        /// Bucket to hold the backup
        #[clap(short = 'd', long, env = "DESTINATION_BUCKET")]
        destination_bucket: String,

        /// Copy every object, skipping the comparison with what's already in the destination
        #[clap(short = 'a', long, env = "ALL")]
        all: bool,

        /// Tag objects in the destination whose source object was deleted with `Deleted=True` and
        /// `DeletedAt=<time>`
        #[clap(long, env = "TAG_DELETED")]
        tag_deleted: bool,
    },

    /// Restore a backup into the destination bucket.
    ///
    /// Waits for the destination bucket to be created if it doesn't exist yet, and for archived
    /// objects to be thawed before copying them.
    Restore {
        /// Bucket holding the backup
        #[clap(short = 's', long, env = "SOURCE_BUCKET")]
        source_bucket: String,

        /// Bucket to restore into
        #[clap(short = 'd', long, env = "DESTINATION_BUCKET")]
        destination_bucket: String,

        /// Restore every object, even those tagged as deleted
        #[clap(short = 'a', long, env = "ALL")]
        all: bool,

        /// Don't restore objects tagged `Deleted=True` by the backup
        #[clap(long, env = "CHECK_DELETED_TAG")]
        check_deleted_tag: bool,
    },

    /// Delete every object (under `--prefix`, if set) in a bucket.
    ///
    /// This can't be undone.
    Purge {
        /// Bucket to delete objects from
        #[clap(short = 'b', long, env = "BUCKET")]
        bucket: String,

        /// Also delete every old version and delete marker
        #[clap(long)]
        versions: bool,

        /// Delete the bucket itself once it's empty.  Ignored if a prefix is set.
        #[clap(long)]
        delete_bucket: bool,

        /// Don't ask for confirmation
        #[clap(short = 'y', long)]
        yes: bool,
    },
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose);

    if let Err(e) = color_eyre::install() {
        eprintln!("Failed to install error reporting hooks: {e}");
    }

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("Failed to start the tokio runtime")
        .and_then(|runtime| {
            let result = runtime.block_on(async move {
                let cancel = CancellationToken::new();
                tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

                run(args, cancel).await
            });

            // An interrupted purge confirmation leaves a blocking thread waiting on stdin
            runtime.shutdown_background();

            result
        });

    if let Err(report) = result {
        eprintln!("Error: {report:?}");
        std::process::exit(FAILURE_EXIT_CODE);
    }
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    // The AWS SDK is very chatty at debug level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("aws=warn,hyper=warn,h2=warn,{level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Cancel `cancel` when the user presses Ctrl-C.
///
/// Spawned before anything else happens, so that Ctrl-C never kills the process outright.
async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(err = %e, "Unable to listen for Ctrl-C");
        return;
    }

    info!("Ctrl-C received; aborting");
    cancel.cancel();
}

/// Completes once `cancel` is cancelled; the abort signal of a running job
fn aborted(cancel: &CancellationToken) -> impl Future<Output = ()> {
    let cancel = cancel.clone();
    async move { cancel.cancelled().await }
}

/// Run one step of the setup of a job, failing right away if the user presses Ctrl-C first
async fn interruptible<T, E>(
    cancel: &CancellationToken,
    step: impl Future<Output = Result<T, E>>,
) -> color_eyre::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::select! {
        result = step => Ok(result?),
        _ = cancel.cancelled() => Err(eyre!("Interrupted")),
    }
}

async fn run(args: Args, cancel: CancellationToken) -> color_eyre::Result<()> {
    debug!(?args, "Starting");

    let config = args.config;
    let factory = interruptible(&cancel, s3br::ObjectStorageFactory::new(config.clone())).await?;

    match args.command {
        Command::Backup {
            source_bucket,
            destination_bucket,
            all,
            tag_deleted,
        } => {
            let job = interruptible(&cancel, async {
                s3br::BackupJobBuilder::from_factory(
                    &factory,
                    config,
                    &source_bucket,
                    &destination_bucket,
                )
                .await?
                .all(all)
                .tag_deleted(tag_deleted)
                .build()
                .await
            })
            .await?;

            info!(
                to_copy = job.objects_to_copy(),
                to_compare = job.objects_to_compare(),
                "Backup planned"
            );

            let summary = job.run(aborted(&cancel)).await?;

            println!(
                "Backed up {source_bucket} to {destination_bucket}: {} objects listed, {} copied, {} tagged as deleted, {} abandoned",
                summary.source_objects,
                summary.copied(),
                summary.tagged_deleted(),
                summary.abandoned()
            );
        }
        Command::Restore {
            source_bucket,
            destination_bucket,
            all,
            check_deleted_tag,
        } => {
            let job = interruptible(&cancel, async {
                s3br::RestoreJobBuilder::from_factory(
                    &factory,
                    config,
                    &source_bucket,
                    &destination_bucket,
                )
                .await?
                .all(all)
                .check_deleted_tag(check_deleted_tag)
                .build()
                .await
            })
            .await?;

            let summary = job.run(aborted(&cancel)).await?;

            println!(
                "Restored {source_bucket} to {destination_bucket}: {} objects listed, {} restored, {} skipped as deleted, {} abandoned",
                summary.source_objects,
                summary.restored(),
                summary.skipped_deleted(),
                summary.abandoned()
            );
        }
        Command::Purge {
            bucket,
            versions,
            delete_bucket,
            yes,
        } => {
            let job = interruptible(
                &cancel,
                s3br::PurgeJob::from_factory(&factory, &config, &bucket),
            )
            .await?
            .include_versions(versions)
            .delete_bucket(delete_bucket);

            if !yes {
                let prefix = config.prefix.clone();
                let target = bucket.clone();
                let confirmation =
                    tokio::task::spawn_blocking(move || confirm(&target, prefix.as_deref()));

                if !interruptible(&cancel, confirmation).await?? {
                    return Err(eyre!("Purge of bucket '{bucket}' cancelled"));
                }
            }

            let summary = job.run(aborted(&cancel)).await?;

            println!(
                "Purged {}: {} deleted{}",
                bucket,
                summary.deleted,
                if summary.bucket_deleted {
                    ", bucket deleted"
                } else {
                    ""
                }
            );
        }
    }

    Ok(())
}

/// Ask the user to confirm a purge by typing the bucket name
fn confirm(bucket: &str, prefix: Option<&str>) -> color_eyre::Result<bool> {
    let target = match prefix {
        Some(prefix) => format!("every object with prefix '{prefix}' in bucket '{bucket}'"),
        None => format!("every object in bucket '{bucket}'"),
    };

    print!("This will permanently delete {target}.\nType the bucket name to continue: ");
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;

    Ok(answer.trim() == bucket)
}
