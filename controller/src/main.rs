use std::{path::PathBuf, sync::Arc};

use is_terminal::IsTerminal;
use kube::{config::KubeConfigOptions, runtime::events::Recorder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use controller::*;

fn main() {
    use clap::{
        crate_authors, crate_description, crate_name, crate_version, Arg, ArgAction, Command,
        ValueHint,
    };
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about(crate_description!())
        .subcommand_required(true)
        .subcommands([Command::new("run").about("run the sync agent").args([
            Arg::new("platform_kubeconfig")
                .long("platform-kubeconfig")
                .visible_alias("kcp-kubeconfig")
                .env("PLATFORM_KUBECONFIG")
                .help("kubeconfig for the platform plane, rooted at the workspace holding the export")
                .value_hint(ValueHint::FilePath)
                .required(true),
            Arg::new("apiexport_ref")
                .long("apiexport-ref")
                .env("APIEXPORT_REF")
                .help("name of the export object on the platform; doubles as the projected API group")
                .required(true),
            Arg::new("agent_name")
                .long("agent-name")
                .env("AGENT_NAME")
                .help(concat!(
                    "identity of this agent, written onto every synced object.\n",
                    "Defaults to `<apiexport-ref>-syncagent`. Must not change after first registration.",
                )),
            Arg::new("namespace")
                .long("namespace")
                .env("NAMESPACE")
                .help("service-side namespace used for leader election and the object state store")
                .default_value("sync-agent-system"),
            Arg::new("published_resource_selector")
                .long("published-resource-selector")
                .env("PUBLISHED_RESOURCE_SELECTOR")
                .help("label selector restricting which PublishedResources this agent processes"),
            Arg::new("leader_elect")
                .long("enable-leader-election")
                .help("Flag for if leader election is needed. Currently does nothing.")
                .hide(true)
                .action(ArgAction::SetTrue),
            Arg::new("kubeconfig_host_override")
                .long("kubeconfig-host-override")
                .help("override the platform address from the kubeconfig (for tunneled setups)"),
            Arg::new("kubeconfig_ca_file_override")
                .long("kubeconfig-ca-file-override")
                .help("override the platform CA bundle from the kubeconfig (for tunneled setups)")
                .value_hint(ValueHint::FilePath),
            Arg::new("introspection_address")
                .long("introspection-bind-address")
                .help("address to bind for the HTTP introspection server")
                .default_value("[::]:8089"),
        ])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(Error::from(e)),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    _leader_elect: bool,
    agent_name: Option<String>,
    apiexport_ref: String,
    introspection_address: std::net::SocketAddr,
    kubeconfig_ca_file_override: Option<PathBuf>,
    kubeconfig_host_override: Option<String>,
    namespace: String,
    platform_kubeconfig: PathBuf,
    published_resource_selector: Option<String>,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = std::net::AddrParseError;

    fn try_from(m: &clap::ArgMatches) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            _leader_elect: m.get_flag("leader_elect"),
            agent_name: m.get_one::<String>("agent_name").cloned(),
            apiexport_ref: m.get_one::<String>("apiexport_ref").unwrap().clone(),
            introspection_address: m
                .get_one::<String>("introspection_address")
                .unwrap()
                .parse()?,
            kubeconfig_ca_file_override: m
                .get_one::<String>("kubeconfig_ca_file_override")
                .map(Into::into),
            kubeconfig_host_override: m.get_one::<String>("kubeconfig_host_override").cloned(),
            namespace: m.get_one::<String>("namespace").unwrap().clone(),
            platform_kubeconfig: m.get_one::<String>("platform_kubeconfig").unwrap().into(),
            published_resource_selector: m
                .get_one::<String>("published_resource_selector")
                .cloned(),
        })
    }
}

impl Args {
    fn options(&self) -> Result<AgentOptions> {
        let agent_name = self
            .agent_name
            .clone()
            .unwrap_or_else(|| format!("{}-syncagent", self.apiexport_ref).replace('.', "-"));
        if !is_dns_label(&agent_name) {
            return Err(Error::BadName(format!(
                "agent name {agent_name:?} is not a valid DNS label"
            )));
        }
        if !is_dns_label(&self.namespace) {
            return Err(Error::BadName(format!(
                "namespace {:?} is not a valid DNS label",
                self.namespace,
            )));
        }
        Ok(AgentOptions {
            agent_name,
            apiexport_ref: self.apiexport_ref.clone(),
            namespace: self.namespace.clone(),
            published_resource_selector: self.published_resource_selector.clone(),
        })
    }
}

fn startup(args: Args) -> controller::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;
    let prom = PrometheusBuilder::new().with_http_listener(args.introspection_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
    });
    let ctlstop = token.clone();
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        token.cancel();
    });
    rt.block_on(run(args, ctlstop))
}

async fn run(args: Args, token: CancellationToken) -> controller::Result<()> {
    use tokio::task;

    let options = args.options()?;

    let config = kube::Config::infer().await?;
    let client = kube::client::ClientBuilder::try_from(config.clone())?.build();

    let platform_config = platform_config(&args).await?;
    let platform = kube::client::ClientBuilder::try_from(platform_config.clone())?.build();

    info!(
        agent = options.agent_name,
        export = options.apiexport_ref,
        "setup done, starting controllers"
    );
    let recorder = Recorder::new(client.clone(), REPORTER.clone());
    let ctx = Arc::new(Context {
        client,
        platform,
        recorder,
        options,
    });

    let mut ctrls = task::JoinSet::new();
    ctrls.spawn(publications::controller(token.clone(), ctx.clone())?);
    ctrls.spawn(exports::controller(token.clone(), ctx.clone())?);
    ctrls.spawn(supervisor::controller(
        token.clone(),
        ctx.clone(),
        platform_config,
    )?);

    while let Some(res) = ctrls.join_next().await {
        match res {
            Err(e) => error!("error starting controller: {e}"),
            Ok(res) => {
                if let Err(e) = res {
                    error!("error from controller: {e}");
                    token.cancel();
                }
            }
        };
    }
    Ok(())
}

/// Platform_config loads the platform kubeconfig and applies the host and CA
/// overrides before building a client config.
async fn platform_config(args: &Args) -> controller::Result<kube::Config> {
    let mut kc = kube::config::Kubeconfig::read_from(&args.platform_kubeconfig)?;
    for named in &mut kc.clusters {
        let Some(cluster) = &mut named.cluster else {
            continue;
        };
        if let Some(host) = &args.kubeconfig_host_override {
            cluster.server = Some(host.clone());
        }
        if let Some(ca) = &args.kubeconfig_ca_file_override {
            cluster.certificate_authority = Some(ca.display().to_string());
            cluster.certificate_authority_data = None;
        }
    }
    Ok(kube::Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await?)
}
