use crate::{
    core::{FunctionEvent, LogRecord, TenantPlan},
    http::{self, Admin, Api, Auth, HttpMetrics, Readiness},
    log::{memory::Broker, Client},
    logging::{LogFilter, LogFormat},
    store::{self, Backoff, Consumer, SharedStore, State, Store, Watchdog, Writer},
};
use anyhow::{anyhow, ensure, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{net::SocketAddr, path::PathBuf};
use tokio::{sync::watch, time::Duration};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "tenant-controller", about = "A multi-tenant control plane sidecar")]
pub struct Args {
    #[clap(
        long,
        default_value = "tenant=info,warn",
        env = "TENANT_CONTROLLER_LOG"
    )]
    log_level: LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    #[clap(long, default_value = "0.0.0.0:8964")]
    api_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    /// The topic holding tenant plans.
    #[clap(
        long,
        default_value = "persistent://public/default/tenants-management",
        env = "TENANT_TOPIC"
    )]
    tenant_topic: String,

    /// The topic on which function workers publish function metadata.
    #[clap(
        long,
        default_value = "persistent://public/functions/metadata",
        env = "FUNCTION_TOPIC"
    )]
    function_topic: String,

    /// Runs against an in-process broker. Its topics do not outlive the process or reach other
    /// instances, so this is only suitable for development and tests.
    #[clap(long, env = "IN_MEMORY_BROKER")]
    in_memory_broker: bool,

    /// How long a write waits for the broker's acknowledgement.
    #[clap(long, default_value = "5000")]
    write_timeout_ms: u64,

    /// Verifies bearer tokens with this HS256 secret.
    #[clap(long, env = "JWT_SECRET", conflicts_with = "jwt_public_key")]
    jwt_secret: Option<String>,

    /// Verifies bearer tokens with the RS256 public key in this PEM file.
    #[clap(long, env = "JWT_PUBLIC_KEY")]
    jwt_public_key: Option<PathBuf>,

    /// Token subjects that may manage every tenant.
    #[clap(long, env = "SUPER_ROLES", value_delimiter = ',')]
    super_roles: Vec<String>,

    #[clap(long, default_value = "200")]
    max_concurrent_requests: usize,

    #[clap(long, default_value = "100")]
    restart_backoff_min_ms: u64,

    #[clap(long, default_value = "30000")]
    restart_backoff_max_ms: u64,

    /// A consumer that stayed up this long resets the restart backoff.
    #[clap(long, default_value = "30000")]
    restart_healthy_after_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            api_addr,
            admin_addr,
            tenant_topic,
            function_topic,
            in_memory_broker,
            write_timeout_ms,
            jwt_secret,
            jwt_public_key,
            super_roles,
            max_concurrent_requests,
            restart_backoff_min_ms,
            restart_backoff_max_ms,
            restart_healthy_after_ms,
        } = self;

        log_format.try_init(&log_level)?;

        let broker = memory_broker(in_memory_broker)?;

        let backoff = Backoff {
            min: Duration::from_millis(restart_backoff_min_ms),
            max: Duration::from_millis(restart_backoff_max_ms),
            healthy_after: Duration::from_millis(restart_healthy_after_ms),
        };
        ensure!(
            !backoff.min.is_zero() && backoff.min <= backoff.max,
            "invalid restart backoff: {backoff:?}"
        );

        let auth = match (jwt_secret, jwt_public_key) {
            (Some(secret), _) => Auth::hs256(secret.as_bytes(), super_roles),
            (None, Some(path)) => {
                let pem = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Auth::rs256_pem(&pem, super_roles)
                    .with_context(|| format!("invalid public key in {}", path.display()))?
            }
            (None, None) => {
                warn!("No token verification key configured; authentication is disabled");
                Auth::disabled()
            }
        };

        let mut prom = <Registry>::default();
        let store_metrics = store::Metrics::register(prom.sub_registry_with_prefix("store"));
        let http_metrics = HttpMetrics::register(prom.sub_registry_with_prefix("http"));

        let (signal, drain) = drain::channel();

        let tenants = Store::<TenantPlan>::shared("tenants", store_metrics.kind("tenants"));
        let (tenants_state, tenants_synced) = supervise::<TenantPlan>(
            &broker,
            &tenant_topic,
            tenants.clone(),
            backoff,
            drain.clone(),
        );

        let functions = Store::shared("functions", store_metrics.kind("functions"));
        let (functions_state, functions_synced) = supervise::<FunctionEvent>(
            &broker,
            &function_topic,
            functions.clone(),
            backoff,
            drain.clone(),
        );

        let producer = broker
            .producer(&tenant_topic)
            .await
            .with_context(|| format!("failed to create a producer for {tenant_topic}"))?;
        let writer = Writer::new(
            producer,
            tenants,
            Duration::from_millis(write_timeout_ms),
        );
        let api = Api::new(
            writer,
            functions,
            auth,
            max_concurrent_requests,
            http_metrics,
        );
        let mut api = tokio::spawn(
            http::serve("api", api_addr, api, drain.clone()).instrument(info_span!("api")),
        );

        let ready = Readiness::default()
            .with_store(tenants_state, tenants_synced)
            .with_store(functions_state, functions_synced);
        let admin = Admin::new(ready, prom);
        let mut admin =
            tokio::spawn(http::serve("admin", admin_addr, admin, drain).instrument(info_span!("admin")));

        // Block on the shutdown signal. Once it fires, wait for the supervisors and servers to
        // release before exiting.
        tokio::select! {
            res = shutdown() => res?,
            res = &mut api => return Err(exited("api", res)),
            res = &mut admin => return Err(exited("admin", res)),
        }

        info!("Draining");
        signal.drain().await;
        let _ = tokio::join!(api, admin);
        info!("Shutdown complete");
        Ok(())
    }
}

/// Returns the broker that holds every topic.
///
/// Only the in-process broker is linked into this build, so it must be asked for explicitly.
fn memory_broker(enabled: bool) -> Result<Broker> {
    ensure!(
        enabled,
        "no broker is configured; pass --in-memory-broker to keep topics in this process"
    );
    warn!("Using an in-process broker; topics are lost when the process exits");
    Ok(Broker::new())
}

/// Spawns a watchdog that keeps a consumer replaying `topic` into `store`.
///
/// Returns the consumer's state and the store's synced flag.
fn supervise<R: LogRecord>(
    broker: &Broker,
    topic: &str,
    store: SharedStore<R::Document>,
    backoff: Backoff,
    drain: drain::Watch,
) -> (watch::Receiver<State>, watch::Receiver<bool>) {
    let kind = store.kind();
    let synced = store.synced();
    let watchdog = Watchdog::new(kind, backoff, store.metrics());
    let state = watchdog.state();
    let consumer = Consumer::<_, R>::new(broker.clone(), topic, store);
    tokio::spawn(
        watchdog
            .supervise(move || consumer.clone().run(), drain)
            .instrument(info_span!("consumer", %kind, %topic)),
    );
    (state, synced)
}

#[cfg(unix)]
async fn shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    info!("Received shutdown signal");
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    Ok(())
}

fn exited(
    server: &str,
    res: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> anyhow::Error {
    match res {
        Ok(Ok(())) => anyhow!("{server} server exited unexpectedly"),
        Ok(Err(error)) => anyhow::Error::new(error).context(format!("{server} server failed")),
        Err(error) => anyhow::Error::new(error).context(format!("{server} server panicked")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["tenant-controller"]).unwrap();
        assert_eq!(args.tenant_topic, "persistent://public/default/tenants-management");
        assert_eq!(args.function_topic, "persistent://public/functions/metadata");
        assert_eq!(args.max_concurrent_requests, 200);
        assert_eq!(args.log_format, LogFormat::Plain);
        assert!(args.jwt_secret.is_none());
        assert!(args.super_roles.is_empty());
        assert!(!args.in_memory_broker);
    }

    #[test]
    fn requires_a_broker() {
        assert!(memory_broker(false).is_err());
        assert!(memory_broker(true).is_ok());

        let args =
            Args::try_parse_from(["tenant-controller", "--in-memory-broker"]).unwrap();
        assert!(args.in_memory_broker);
    }

    #[test]
    fn super_roles_are_comma_separated() {
        let args = Args::try_parse_from([
            "tenant-controller",
            "--jwt-secret=s3cr3t",
            "--super-roles=admin,superuser",
        ])
        .unwrap();
        assert_eq!(args.super_roles, ["admin", "superuser"]);
    }

    #[test]
    fn rejects_conflicting_keys() {
        let res = Args::try_parse_from([
            "tenant-controller",
            "--jwt-secret=s3cr3t",
            "--jwt-public-key=/etc/jwt/public.pem",
        ]);
        assert!(res.is_err());
    }
}
