use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use tern_agent::cli::{Args, Mode, parse_args, print_help};
use tern_agent::config::{self, Env};
use tern_agent::error::AgentError;
use tern_agent::llm::missing_adapter_stream_fn;
use tern_agent::modes::{run_headless_mode, run_json_mode, run_rpc_mode};
use tern_agent::runtime::session::{AgentRuntime, RuntimeOptions};
use tern_agent::settings::Settings;
use tern_agent::trace::buffer::{self as trace_buffer, TraceBuffer, TraceConfig};

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_ABORT: i32 = 130;

fn init_logging(settings: &Settings) {
    use tracing_subscriber::EnvFilter;

    let filter = settings
        .log
        .level
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::from_default_env());

    match settings
        .log
        .file
        .as_ref()
        .and_then(|path| std::fs::File::create(path).ok())
    {
        Some(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

fn build_runtime(
    args: &Args,
    settings: Settings,
    env: Env,
    base_dir: &Path,
) -> Result<AgentRuntime, AgentError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let sessions_root = args
        .session_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| config::sessions_root(base_dir, &cwd));

    let mut env = env;
    if let Some(model) = &args.model {
        env.model = Some(model.clone());
    }
    if args.verbose {
        env.stream_verbose = true;
    }

    AgentRuntime::new(RuntimeOptions {
        sessions_root,
        cwd: cwd.display().to_string(),
        settings,
        env,
        stream_fn: missing_adapter_stream_fn(),
        tools: Vec::new(),
        system_prompt: String::new(),
        session_id: args.session.clone(),
        exporter: None,
    })
}

async fn run(args: Args) -> Result<i32, AgentError> {
    let base_dir = config::resolve_base_dir(None);
    let settings = Settings::load(&config::settings_file(&base_dir))?;
    init_logging(&settings);

    let env = Env::from_process();
    if let Some(port) = args.http_port {
        // The metrics endpoint is owned by the embedder; record the
        // request so operators can see it was understood.
        tracing::info!(port, "metrics port requested; no endpoint in this build");
    }

    let trace_dir = args
        .trace_dir
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| config::trace_dir(&base_dir));
    let buffer = Arc::new(TraceBuffer::new(trace_dir, TraceConfig::default()));
    trace_buffer::set_active(buffer.clone());
    let shutdown = CancellationToken::new();
    let flush_task = trace_buffer::spawn_flush_task(buffer, shutdown.clone());

    let runtime = build_runtime(&args, settings, env, &base_dir)?;

    let interrupted = {
        let runtime = runtime.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                runtime.abort();
                shutdown.cancel();
            }
        })
    };

    let mode_result = match args.mode {
        Mode::Rpc => run_rpc_mode(runtime).await,
        Mode::Json => run_json_mode(runtime, &args.messages).await,
        Mode::Headless => {
            let prompt = args.messages.join(" ");
            run_headless_mode(runtime, &prompt).await
        }
    };

    let was_interrupted = shutdown.is_cancelled();
    shutdown.cancel();
    let _ = flush_task.await;
    trace_buffer::clear_active();
    interrupted.abort();

    match mode_result {
        Ok(()) if was_interrupted => Ok(EXIT_ABORT),
        Ok(()) => Ok(EXIT_OK),
        Err(e) if e.kind == tern_agent::ErrorKind::Aborted => Ok(EXIT_ABORT),
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn main() {
    let raw_args: Vec<String> = std::env::args().skip(1).collect();
    let args = parse_args(&raw_args);

    if args.help {
        print_help();
        std::process::exit(EXIT_OK);
    }
    if args.version {
        println!("{} {}", config::APP_NAME, config::VERSION);
        std::process::exit(EXIT_OK);
    }
    if let Some(invalid) = &args.invalid {
        eprintln!("{invalid}");
        print_help();
        std::process::exit(EXIT_FATAL);
    }

    let code = match run(args).await.context("fatal error") {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}
