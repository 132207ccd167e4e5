use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crossbeam_channel::Receiver;
use harmoniq_media_broker::loopback::{LoopbackPlugin, LoopbackProvider, RelayProvider};
use harmoniq_media_broker::{
    lifecycle, BrokerConfig, CapabilityInstance, CapabilityKind, CapabilityTags, Completion,
    CrashEventSink, CrashEventTarget, CrashHelper, Decryptor, MediaPluginService, NodeId,
    PluginCrashedEvent, PluginId, ProcessRole, Result as BrokerResult, ServiceEnvironment,
    StaticSandbox, VideoDecoder, VideoEncoder,
};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Acquire(args) => execute_acquire(args),
        Commands::CrashDemo(args) => execute_crash_demo(args),
        Commands::Catalog => {
            println!("{}", serde_json::to_string_pretty(&default_catalog())?);
            Ok(())
        }
    }
}

#[derive(Parser)]
#[command(author, version, about = "Media plugin broker tools for Harmoniq Studio")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a capability from an in-process plugin host.
    Acquire(AcquireArgs),
    /// Acquire decoders for several windows, crash their plugin and print the events.
    CrashDemo(CrashDemoArgs),
    /// Print the built-in plugin catalog as JSON.
    Catalog,
}

#[derive(Args)]
struct HostArgs {
    /// Plugin catalog (JSON list of plugins). Defaults to the built-in catalog.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Role of this process when talking to plugin hosts.
    #[arg(long, value_enum, default_value_t = RoleArg::Supervisor)]
    role: RoleArg,
    /// Pretend the platform cannot sandbox media plugins.
    #[arg(long)]
    no_sandbox: bool,
    /// How long to wait for the plugin host, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[derive(Args)]
struct AcquireArgs {
    /// Capability to request.
    #[arg(value_enum)]
    kind: KindArg,
    /// Capability tag the plugin must advertise. Repeat for several tags.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Origin node the request is made for.
    #[arg(long, default_value = "harmoniq-cli")]
    node: String,
    /// Decryptor the decoder should be paired with.
    #[arg(long, default_value_t = 0)]
    decryptor_id: u32,
    #[command(flatten)]
    host: HostArgs,
}

#[derive(Args)]
struct CrashDemoArgs {
    /// Capability tag used for every decoder request.
    #[arg(long, default_value = "h264")]
    tag: String,
    /// Number of windows that each hold a decoder.
    #[arg(long, default_value_t = 2)]
    windows: u64,
    #[command(flatten)]
    host: HostArgs,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Decoder,
    Encoder,
    Decryptor,
}

impl From<KindArg> for CapabilityKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Decoder => CapabilityKind::VideoDecoder,
            KindArg::Encoder => CapabilityKind::VideoEncoder,
            KindArg::Decryptor => CapabilityKind::Decryptor,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Supervisor,
    Subordinate,
}

impl From<RoleArg> for ProcessRole {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Supervisor => ProcessRole::Supervisor,
            RoleArg::Subordinate => ProcessRole::Subordinate,
        }
    }
}

fn default_catalog() -> Vec<LoopbackPlugin> {
    vec![
        LoopbackPlugin::new("fake-video")
            .with_tag("h264")
            .with_tag("vp8")
            .with_capability(CapabilityKind::VideoDecoder)
            .with_capability(CapabilityKind::VideoEncoder),
        LoopbackPlugin::new("fake-cdm")
            .with_tag("clearkey")
            .with_capability(CapabilityKind::Decryptor)
            .with_capability(CapabilityKind::VideoDecoder),
    ]
}

fn load_catalog(path: Option<&PathBuf>) -> Result<Vec<LoopbackPlugin>> {
    let Some(path) = path else {
        return Ok(default_catalog());
    };
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read plugin catalog {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("{} is not a valid plugin catalog", path.display()))
}

/// Writes every crash event to stdout as a JSON line.
struct StdoutSink;

impl CrashEventSink for StdoutSink {
    fn deliver(&self, target: &CrashEventTarget, event: &PluginCrashedEvent) -> Result<()> {
        #[derive(Serialize)]
        struct Line<'a> {
            target: &'a CrashEventTarget,
            event: &'a PluginCrashedEvent,
        }
        println!("{}", serde_json::to_string(&Line { target, event })?);
        Ok(())
    }
}

/// Stand-in for an application window holding a media element.
struct WindowHelper {
    window_id: u64,
}

impl CrashHelper for WindowHelper {
    fn crash_event_target(&self) -> Option<CrashEventTarget> {
        Some(CrashEventTarget {
            window_id: self.window_id,
            document_id: Some(self.window_id),
        })
    }
}

/// Installs the process-wide service backed by loopback plugin hosts.
fn start_service(
    host: &HostArgs,
) -> Result<(lifecycle::ShutdownGuard, Arc<MediaPluginService>, Arc<LoopbackProvider>)> {
    let catalog = load_catalog(host.catalog.as_ref())?;
    let supervisor =
        Arc::new(LoopbackProvider::spawn(catalog).context("failed to start plugin launcher")?);
    let subordinate =
        Arc::new(RelayProvider::spawn(supervisor.clone()).context("failed to start relay")?);

    let environment = ServiceEnvironment {
        config: BrokerConfig::default(),
        role: Arc::new(ProcessRole::from(host.role)),
        supervisor: supervisor.clone(),
        subordinate,
        sandbox: Arc::new(StaticSandbox(!host.no_sandbox)),
        events: Arc::new(StdoutSink),
    };
    let guard = lifecycle::install(environment).context("failed to install media service")?;
    let service = lifecycle::get_or_create().context("failed to start media service")?;
    info!(role = ?service.role(), "media plugin service ready");
    Ok((guard, service, supervisor))
}

fn wait_for<T>(receiver: Receiver<BrokerResult<Arc<T>>>, timeout: Duration) -> Result<PluginId>
where
    T: CapabilityInstance + ?Sized,
{
    let outcome = receiver
        .recv_timeout(timeout)
        .map_err(|_| anyhow!("plugin host did not answer within {timeout:?}"))?;
    let instance = outcome.context("acquisition failed")?;
    Ok(instance.plugin_id())
}

fn acquire(
    service: &Arc<MediaPluginService>,
    kind: CapabilityKind,
    tags: CapabilityTags,
    node: NodeId,
    decryptor_id: u32,
    helper: Option<Arc<dyn CrashHelper>>,
    timeout: Duration,
) -> Result<PluginId> {
    let target = Arc::clone(service);
    // Rejections are reported through the completion as well.
    let log_rejection = move |result: BrokerResult<()>| {
        if let Err(err) = result {
            debug!(%kind, "acquisition rejected: {err}");
        }
    };
    match kind {
        CapabilityKind::VideoDecoder => {
            let (completion, receiver) = Completion::<Arc<dyn VideoDecoder>>::channel();
            service.dispatch(move || {
                log_rejection(target.acquire_decoder(tags, node, decryptor_id, helper, completion))
            })?;
            wait_for(receiver, timeout)
        }
        CapabilityKind::VideoEncoder => {
            let (completion, receiver) = Completion::<Arc<dyn VideoEncoder>>::channel();
            service.dispatch(move || {
                log_rejection(target.acquire_encoder(tags, node, helper, completion))
            })?;
            wait_for(receiver, timeout)
        }
        CapabilityKind::Decryptor => {
            let (completion, receiver) = Completion::<Arc<dyn Decryptor>>::channel();
            service.dispatch(move || {
                log_rejection(target.acquire_decryptor(tags, node, helper, completion))
            })?;
            wait_for(receiver, timeout)
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcquireReport {
    kind: CapabilityKind,
    role: ProcessRole,
    plugin_id: PluginId,
    plugin_name: Option<String>,
}

fn execute_acquire(args: AcquireArgs) -> Result<()> {
    let kind = CapabilityKind::from(args.kind);
    let timeout = Duration::from_millis(args.host.timeout_ms);
    let (_guard, service, launcher) = start_service(&args.host)?;

    let plugin_id = acquire(
        &service,
        kind,
        args.tags.into_iter().collect(),
        NodeId::new(args.node),
        args.decryptor_id,
        None,
        timeout,
    )
    .with_context(|| format!("could not acquire a {kind}"))?;

    let report = AcquireReport {
        kind,
        role: service.role(),
        plugin_id,
        plugin_name: launcher.plugin_name(plugin_id),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn execute_crash_demo(args: CrashDemoArgs) -> Result<()> {
    if args.windows == 0 {
        bail!("--windows must be at least 1");
    }
    let timeout = Duration::from_millis(args.host.timeout_ms);
    let (_guard, service, launcher) = start_service(&args.host)?;

    let mut plugin_id = None;
    for window_id in 1..=args.windows {
        let helper: Arc<dyn CrashHelper> = Arc::new(WindowHelper { window_id });
        let acquired = acquire(
            &service,
            CapabilityKind::VideoDecoder,
            CapabilityTags::new([args.tag.as_str()]),
            NodeId::from("crash-demo"),
            0,
            Some(helper),
            timeout,
        )
        .with_context(|| format!("window {window_id} could not acquire a decoder"))?;
        plugin_id = Some(acquired);
    }
    let plugin_id = plugin_id.context("no decoder acquired")?;

    let plugin_name = launcher
        .crash(plugin_id)
        .with_context(|| format!("plugin {plugin_id} is not running"))?;
    let report = service.run_plugin_crash_callbacks(plugin_id, &plugin_name);
    info!(
        delivered = report.delivered,
        skipped = report.skipped,
        failed = report.failed,
        "crash callbacks finished"
    );
    Ok(())
}
