//! deskpool operator CLI.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use deskpool::{
    auth::{
        AuthTokenGateway, IdentityStore, InMemoryIdentityStore, PostgresIdentityStore,
        QuotaOverride, generate_session_password,
    },
    cluster::{ClusterClient, InMemoryCluster, KubeCluster, ListenerControl, MappingTable},
    config::{ClusterBackend, Config, StoreBackend},
    naming,
    orchestrator::{EnvironmentOrchestrator, ProvisionOptions},
    ports::{PortAllocator, StoreMappingTable},
    store::{InMemoryStore, PostgresStore, SharedStore},
};

#[derive(Parser, Debug)]
#[command(name = "deskpool")]
#[command(about = "Manage per-user remote desktop environments")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision a user's environment (no-op if already running)
    Create {
        #[arg(long)]
        user: String,
        /// Map an SSH port on the routing layer
        #[arg(long)]
        ssh: bool,
        /// Serve raw VNC on a NodePort
        #[arg(long)]
        direct_port: bool,
        #[arg(long)]
        cpu_limit: Option<String>,
        #[arg(long)]
        memory_limit: Option<String>,
        #[arg(long)]
        storage: Option<String>,
    },
    /// Tear down a user's environment
    Delete {
        #[arg(long)]
        user: String,
        /// Also delete the user's storage claim
        #[arg(long)]
        purge_storage: bool,
    },
    /// Show an environment's descriptor
    Status {
        #[arg(long)]
        user: String,
        /// Show live compute-unit state instead
        #[arg(long)]
        detail: bool,
    },
    /// Print recent compute-unit output
    Logs {
        #[arg(long)]
        user: String,
        #[arg(long)]
        tail: Option<u32>,
    },
    /// Recreate the compute unit with a new session password
    Restart {
        #[arg(long)]
        user: String,
    },
    /// Return a user's port mappings to the pools
    ReleasePorts {
        #[arg(long)]
        user: String,
    },
    /// List every managed environment
    List,
    /// Delete environments older than the given age, keeping storage
    Cleanup {
        /// Defaults to STALE_AFTER_SECS
        #[arg(long)]
        max_age_hours: Option<u64>,
    },
    /// Revoke an API token
    Revoke {
        #[arg(long, env = "DESK_REVOKE_TOKEN", hide_env_values = true)]
        token: String,
    },
    /// Create the backing tables
    Migrate,
}

struct Runtime {
    config: Config,
    postgres: Option<PostgresStore>,
    orchestrator: EnvironmentOrchestrator,
    auth: AuthTokenGateway,
}

fn build(config: Config) -> anyhow::Result<Runtime> {
    let (store, postgres, identities): (SharedStore, Option<PostgresStore>, Arc<dyn IdentityStore>) =
        match config.store.backend {
            StoreBackend::Memory => {
                tracing::warn!("Using in-process store; state is lost on exit");
                let store: SharedStore = Arc::new(InMemoryStore::new());
                let identities: Arc<dyn IdentityStore> = Arc::new(InMemoryIdentityStore::new());
                (store, None, identities)
            }
            StoreBackend::Postgres => {
                let url = config
                    .store
                    .database_url
                    .as_ref()
                    .context("DATABASE_URL is required for the postgres store")?;
                let pg = PostgresStore::connect(url, config.store.pool_max_size)?;
                let identities: Arc<dyn IdentityStore> =
                    Arc::new(PostgresIdentityStore::new(pg.pool().clone()));
                let store: SharedStore = Arc::new(PostgresStore::new(pg.pool().clone()));
                (store, Some(pg), identities)
            }
        };

    let (cluster, mapping, listener): (
        Arc<dyn ClusterClient>,
        Arc<dyn MappingTable>,
        Arc<dyn ListenerControl>,
    ) = match config.cluster.backend {
        ClusterBackend::Kube => {
            let kube = Arc::new(KubeCluster::new(&config.cluster)?);
            let cluster: Arc<dyn ClusterClient> = kube.clone();
            let mapping: Arc<dyn MappingTable> = kube.clone();
            let listener: Arc<dyn ListenerControl> = kube;
            (cluster, mapping, listener)
        }
        ClusterBackend::Memory => {
            tracing::warn!("Using in-process cluster; nothing is provisioned");
            let mem = Arc::new(InMemoryCluster::new());
            let cluster: Arc<dyn ClusterClient> = mem.clone();
            let mapping: Arc<dyn MappingTable> = mem.clone();
            let listener: Arc<dyn ListenerControl> = mem;
            (cluster, mapping, listener)
        }
    };

    let ports = Arc::new(PortAllocator::new(
        mapping,
        Arc::new(StoreMappingTable::direct(store.clone())),
        listener,
        config.cluster.namespace.clone(),
        config.ports.clone(),
    ));
    let orchestrator = EnvironmentOrchestrator::new(
        cluster,
        ports,
        store.clone(),
        config.cluster.namespace.clone(),
        config.environment.clone(),
    );
    let auth = AuthTokenGateway::new(store, identities, config.auth.clone());

    Ok(Runtime {
        config,
        postgres,
        orchestrator,
        auth,
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deskpool=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    let config = Config::from_env()?;
    let rt = build(config)?;
    let orchestrator = &rt.orchestrator;

    match args.command {
        Command::Create {
            user,
            ssh,
            direct_port,
            cpu_limit,
            memory_limit,
            storage,
        } => {
            if !naming::is_valid_user_id(&user) {
                anyhow::bail!("user id {user:?} cannot name cluster resources");
            }
            let quota = QuotaOverride {
                cpu_limit,
                memory_limit,
                storage,
                ..QuotaOverride::default()
            }
            .apply_to(&rt.config.auth.default_quota);
            let options = ProvisionOptions {
                quota,
                ssh,
                direct_port,
            };
            let password = SecretString::from(generate_session_password());
            let outcome = orchestrator.create(&user, &password, &options).await?;
            if outcome.is_provisioned() {
                eprintln!("Session password: {}", password.expose_secret());
            }
            print_json(outcome.descriptor())?;
        }
        Command::Delete {
            user,
            purge_storage,
        } => {
            if !orchestrator.delete(&user, !purge_storage).await? {
                anyhow::bail!("no environment for user {user}");
            }
            tracing::info!(user_id = %user, "Deleted");
        }
        Command::Status { user, detail } => {
            if detail {
                print_json(&orchestrator.status_detail(&user).await?)?;
            } else {
                match orchestrator.get(&user).await? {
                    Some(descriptor) => print_json(&descriptor)?,
                    None => anyhow::bail!("no environment for user {user}"),
                }
            }
        }
        Command::Logs { user, tail } => {
            println!("{}", orchestrator.logs(&user, tail).await?);
        }
        Command::Restart { user } => {
            let password = SecretString::from(generate_session_password());
            let descriptor = orchestrator
                .restart(&user, &password, &rt.config.auth.default_quota)
                .await?;
            eprintln!("Session password: {}", password.expose_secret());
            print_json(&descriptor)?;
        }
        Command::ReleasePorts { user } => {
            let released = orchestrator.release_ports(&user).await?;
            print_json(&released)?;
        }
        Command::List => {
            print_json(&orchestrator.list().await?)?;
        }
        Command::Cleanup { max_age_hours } => {
            let max_age = max_age_hours
                .map(|h| Duration::from_secs(h * 3600))
                .unwrap_or(rt.config.environment.stale_after);
            let removed = orchestrator.cleanup_stale(max_age).await?;
            if let Some(pg) = &rt.postgres {
                let purged = pg.purge_expired().await?;
                tracing::info!(purged, "Purged expired store rows");
            }
            println!("{removed}");
        }
        Command::Revoke { token } => {
            rt.auth.revoke(&token).await?;
            tracing::info!("Token revoked");
        }
        Command::Migrate => {
            let Some(pg) = &rt.postgres else {
                anyhow::bail!("migrations need STORE_BACKEND=postgres");
            };
            pg.run_migrations().await?;
            PostgresIdentityStore::new(pg.pool().clone())
                .run_migrations()
                .await?;
            tracing::info!("Migrations complete");
        }
    }

    Ok(())
}
