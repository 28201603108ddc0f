use std::{path::PathBuf, sync::Arc};

use clap::{ArgAction, Parser};
use template_trainer::{
    report::save_best, Category, EndpointMode, Evaluator, HttpBackend, HttpBackendConfig,
    InferenceBackend, LaunchSpec, Optimizer, RunReport, ServerSession, TemplateResolver,
    TestSuite, TrainerConfig,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "template-trainer")]
#[command(about = "Score a chat template on tool-calling cases and optionally evolve a better one")]
struct Args {
    /// Base URL of a running llama.cpp-compatible server
    #[arg(long)]
    url: Option<String>,

    /// Model name sent with requests; also picks the family for `--template auto`
    #[arg(long)]
    model: Option<String>,

    /// Launch llama-server with this GGUF file instead of using a running server
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// llama-server executable used with --model-path
    #[arg(long, default_value = "llama-server")]
    server_binary: String,

    /// First port for launched servers (one per parallel session)
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// builtin:<name>, hf:<owner/repo>, a file path, a built-in name, or auto
    #[arg(long, default_value = "auto")]
    template: String,

    /// Test suite file or directory (defaults to the built-in suite)
    #[arg(long)]
    suite: Option<PathBuf>,

    /// Only run these categories (comma separated)
    #[arg(long, value_delimiter = ',')]
    categories: Vec<Category>,

    /// Run the generational optimizer starting from the selected template
    #[arg(long)]
    optimize: bool,

    #[arg(long)]
    generations: Option<usize>,

    /// Search seed (recorded in the results)
    #[arg(long)]
    seed: Option<u64>,

    /// Variants evaluated concurrently, one server session each
    #[arg(long)]
    parallelism: Option<usize>,

    /// completion (render locally) or chat (server-side template)
    #[arg(long)]
    mode: Option<EndpointMode>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Overall score in [0, 1] required for exit code 0
    #[arg(long)]
    threshold: Option<f64>,

    /// YAML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "results")]
    output_dir: PathBuf,

    /// -v for debug, -vv for trace
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn resolve_config(&self) -> Result<TrainerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => TrainerConfig::load(path)?.apply_env(),
            None => TrainerConfig::from_env(),
        };

        if let Some(url) = &self.url {
            config.server.endpoint.base_url = url.clone();
        }
        if let Some(model) = &self.model {
            config.server.endpoint.model = Some(model.clone());
        }
        if let Some(generations) = self.generations {
            config.optimizer.generations = generations;
        }
        if let Some(seed) = self.seed {
            config.optimizer.seed = seed;
        }
        if let Some(parallelism) = self.parallelism {
            config.optimizer.parallelism = parallelism.max(1);
        }
        if let Some(mode) = self.mode {
            config.evaluation.mode = mode;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.evaluation.request_timeout_ms = timeout_ms;
        }
        if let Some(threshold) = self.threshold {
            config.success_threshold = threshold;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "info,template_trainer=debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_sessions(
    args: &Args,
    config: &TrainerConfig,
) -> Result<Vec<ServerSession>, Box<dyn std::error::Error>> {
    let count = if args.optimize {
        config.optimizer.parallelism.max(1)
    } else {
        1
    };

    let mut sessions = Vec::with_capacity(count);
    for index in 0..count {
        let (endpoint, session_config) = match &args.model_path {
            Some(model_path) => {
                let port = args.port + index as u16;
                let endpoint = HttpBackendConfig {
                    base_url: format!("http://127.0.0.1:{port}"),
                    ..config.server.endpoint.clone()
                };
                let launch = LaunchSpec::llama_server(args.server_binary.clone(), model_path, port);
                (endpoint, config.server.session.clone().with_launch(launch))
            }
            None => (config.server.endpoint.clone(), config.server.session.clone()),
        };
        let backend: Arc<dyn InferenceBackend> = Arc::new(HttpBackend::from_config(endpoint)?);
        sessions.push(ServerSession::new(backend, session_config));
    }
    Ok(sessions)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.resolve_config()?;

    let suite = match &args.suite {
        Some(path) => TestSuite::load(path)?,
        None => TestSuite::builtin()?,
    }
    .filter_categories(&args.categories);
    if suite.is_empty() {
        eprintln!("No test cases matched.");
        std::process::exit(2);
    }

    let mut resolver = TemplateResolver::new();
    if let Some(model) = &config.server.endpoint.model {
        resolver = resolver.with_model_hint(model.clone());
    }
    let seed_template = resolver.resolve(&args.template).await?;

    let mut sessions = build_sessions(&args, &config)?;
    for session in sessions.iter_mut() {
        session.start().await?;
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; finishing with the best template so far");
            on_interrupt.cancel();
        }
    });

    let evaluator = Evaluator::new(config.evaluation.clone());
    let endpoint = config.server.endpoint.base_url.clone();
    let mode = config.evaluation.mode;

    let outcome = if args.optimize {
        let optimizer =
            Optimizer::new(config.optimizer.clone(), evaluator).with_cancellation(cancel.clone());
        optimizer
            .run(
                &mut sessions,
                vec![(args.template.clone(), seed_template)],
                &suite,
            )
            .await
            .map(|run| {
                let report = RunReport::from_optimization(&endpoint, &args.template, mode, &run);
                (report, Some(run))
            })
    } else {
        let evaluation = evaluator.evaluate(&mut sessions[0], &seed_template, &suite).await;
        Ok((
            RunReport::from_evaluation(&endpoint, &args.template, mode, &evaluation),
            None,
        ))
    };

    for session in sessions.iter_mut() {
        session.stop().await;
    }
    let (report, run) = outcome?;

    let results_path = report.write_json(&args.output_dir)?;
    println!("{}", report.render_summary()?);
    println!("Results: {}", results_path.display());

    if let Some(run) = &run {
        let saved = save_best(&args.output_dir, run)?;
        println!(
            "Best template: {} (diff: {})",
            saved.template.display(),
            saved.diff.display()
        );
    }

    if report.score / 100.0 >= config.success_threshold {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
