//! Strata - S3-compatible object storage
//!
//! Serves buckets from a local data directory with SigV4 authentication and
//! per-bucket ACLs, and manages credentials, buckets and grants from the
//! command line.

mod commands;
mod config;
mod router;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use strata_s3::{S3State, StrataS3};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::PresignTarget;
use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(about = "S3-compatible object storage", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./strata.toml when present)
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for buckets, ACLs and credentials
    #[arg(long, global = true, env = "STRATA_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "STRATA_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the S3 server (default)
    Serve(ServeArgs),

    /// Manage access keys
    Credentials {
        #[command(subcommand)]
        command: CredentialsCommand,
    },

    /// Manage buckets
    Bucket {
        #[command(subcommand)]
        command: BucketCommand,
    },

    /// Give an access key a permission on a bucket
    Grant {
        bucket: String,
        access_key: String,
        /// READ, WRITE, READ_ACP, WRITE_ACP or FULL_CONTROL
        #[arg(long, default_value = "READ")]
        permission: String,
    },

    /// Print a presigned URL for an object
    Presign {
        bucket: String,
        key: String,
        #[arg(long)]
        access_key: String,
        /// Validity in seconds, at most 604800
        #[arg(long, default_value_t = 3600)]
        expires: i64,
        #[arg(long, default_value = "GET")]
        method: String,
        /// Base URL clients use to reach the server
        #[arg(long, default_value = "http://localhost:9000")]
        endpoint: String,
    },
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// Port to listen on
    #[arg(short, long, env = "STRATA_PORT")]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "STRATA_HOST")]
    host: Option<String>,

    /// Accept the raw Authorization header as an access key. Development only.
    #[arg(long)]
    insecure_bypass_signatures: bool,
}

#[derive(Subcommand, Debug)]
enum CredentialsCommand {
    /// Generate a new access key and secret
    Create {
        #[arg(long)]
        name: String,
    },
    /// List access keys
    List,
}

#[derive(Subcommand, Debug)]
enum BucketCommand {
    /// Create a bucket owned by an access key
    Create {
        name: String,
        #[arg(long)]
        owner: String,
        /// Canned ACL: private, public-read, public-write or public-read-write
        #[arg(long)]
        acl: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("strata={},tower_http=debug", cli.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    let stores = StrataS3::open(&config.storage.data_dir);

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(config, stores, args).await?,
        Command::Credentials {
            command: CredentialsCommand::Create { name },
        } => {
            let credential = commands::create_credentials(&stores, &name).await?;
            println!("Access key: {}", credential.access_key_id);
            println!("Secret key: {}", credential.secret_key);
        }
        Command::Credentials {
            command: CredentialsCommand::List,
        } => {
            for (access_key, name) in commands::list_credentials(&stores).await? {
                println!("{access_key}\t{name}");
            }
        }
        Command::Bucket {
            command: BucketCommand::Create { name, owner, acl },
        } => {
            let bucket = commands::create_bucket(&stores, &name, &owner, acl.as_deref()).await?;
            println!("Created bucket {} ({})", bucket.name, bucket.acl.as_canned());
        }
        Command::Grant {
            bucket,
            access_key,
            permission,
        } => {
            let grant = commands::grant(&stores, &bucket, &access_key, &permission).await?;
            println!("Granted {} on {bucket} to {}", grant.permission, grant.grantee_id);
        }
        Command::Presign {
            bucket,
            key,
            access_key,
            expires,
            method,
            endpoint,
        } => {
            let target = PresignTarget {
                endpoint: &endpoint,
                method: &method,
                bucket: &bucket,
                key: &key,
                access_key: &access_key,
                expires_secs: expires,
            };
            println!("{}", commands::presign(&stores, &config.scope(), &target).await?);
        }
    }

    Ok(())
}

async fn serve(mut config: Config, stores: StrataS3, args: ServeArgs) -> anyhow::Result<()> {
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if args.insecure_bypass_signatures {
        config.auth.insecure_bypass_signatures = true;
    }

    info!("Starting Strata...");
    info!("  Data directory: {}", config.storage.data_dir.display());
    info!("  Signing scope: {}/{}", config.auth.region, config.auth.service);
    if config.auth.insecure_bypass_signatures {
        warn!("  SIGNATURE VERIFICATION IS DISABLED. Do not expose this server.");
    }

    let s3_config = config.s3_config();
    let state: S3State = stores.into_state(&s3_config);
    let app = router::create_router(Arc::new(state), config.server.max_body_bytes);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
