use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use ganglion::{
    config::AppConf,
    lifecycle::Module,
    net::{local::LocalTransport, Transport},
    roles::{Generator, Reverser, Validator},
    Result,
};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Runs generators, reversers and a validator against each other in one
/// process and reports what the validator saw.
#[derive(Parser, Debug)]
#[command(name = "ganglion", version, about, long_about = None)]
struct Cli {
    /// JSON application config; every field is optional
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    generators: Option<usize>,

    #[arg(long)]
    reversers: Option<usize>,

    /// Requests per second
    #[arg(long)]
    rate: Option<f64>,

    /// How long to run, in seconds
    #[arg(long)]
    duration: Option<f64>,
}

impl Cli {
    fn app_conf(&self) -> Result<AppConf> {
        let mut conf = match &self.config {
            Some(path) => AppConf::from_file(path)?,
            None => AppConf::default(),
        };
        if let Some(n) = self.generators {
            conf.generators = n;
        }
        if let Some(n) = self.reversers {
            conf.reversers = n;
        }
        if let Some(rate) = self.rate {
            conf.validator.request_rate_hz = rate;
        }
        if let Some(secs) = self.duration {
            conf.duration_ms = (secs.max(0.) * 1000.) as u64;
        }
        Ok(conf)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn start_all<M: Module>(modules: &mut [M]) -> Result<()> {
    for module in modules {
        module.start().await?;
    }
    Ok(())
}

async fn stop_all<M: Module>(modules: &mut [M]) {
    for module in modules {
        if let Err(e) = module.stop().await {
            warn!(module = module.name(), "could not stop: {}", e);
        }
    }
}

/// Returns false if any round trip came back different.
async fn run(cli: &Cli) -> Result<bool> {
    let conf = cli.app_conf()?;
    let topology = conf.topology()?;

    let transport = LocalTransport::new();
    for endpoint in topology.endpoints() {
        transport.declare(&endpoint, conf.mailbox_capacity);
    }
    let shared: Arc<dyn Transport> = Arc::new(transport);

    let mut generators = Vec::with_capacity(topology.generators.len());
    for (i, gc) in topology.generators.into_iter().enumerate() {
        let mut generator =
            Generator::new(format!("generator{}", i), shared.clone());
        generator.configure(gc).await?;
        generators.push(generator);
    }
    let mut reversers = Vec::with_capacity(topology.reversers.len());
    for (i, rc) in topology.reversers.into_iter().enumerate() {
        let mut reverser =
            Reverser::new(format!("reverser{}", i), shared.clone());
        reverser.configure(rc).await?;
        reversers.push(reverser);
    }
    let mut validator = Validator::new("validator", shared.clone());
    validator.configure(topology.validator).await?;

    // consumers first, so nothing is sent before someone is listening
    let started = async {
        start_all(&mut generators).await?;
        start_all(&mut reversers).await?;
        validator.start().await
    }
    .await;
    if let Err(e) = started {
        stop_all(&mut reversers).await;
        stop_all(&mut generators).await;
        return Err(e);
    }

    info!(duration_ms = conf.duration_ms, "running");
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(conf.duration_ms)) => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    // producers of requests first, then whoever answers them
    stop_all(std::slice::from_mut(&mut validator)).await;
    stop_all(&mut reversers).await;
    stop_all(&mut generators).await;

    let validated = validator.info();
    let report = json!({
        "validator": validated,
        "reversers": reversers
            .iter()
            .map(|r| json!({ "name": r.name(), "counters": r.info() }))
            .collect::<Vec<_>>(),
        "generators": generators
            .iter()
            .map(|g| json!({ "name": g.name(), "counters": g.info() }))
            .collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(validated.mismatched_pairs.total == 0)
}
