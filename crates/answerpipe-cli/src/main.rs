use anyhow::Result;
use answerpipe::core::EngineId;
use answerpipe::{Config, Pipeline};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "answerpipe")]
#[command(about = "Answer questions from live web search, with verified citations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Answer one question (json by default).
    Answer(AnswerCmd),
    /// Diagnose configuration issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct AnswerCmd {
    /// The question, in natural language.
    query: String,
    /// Config file (json). Defaults to ANSWERPIPE_CONFIG, then the user config dir.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    /// Include the run report (decision, selection, engine statuses, loop trace) in json output.
    #[arg(long)]
    report: bool,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Config file (json).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// Opt-in env-file loader (ANSWERPIPE_ENV_FILE). Never overrides the process env and never
/// logs values.
fn load_env_file() {
    let Some(p) = answerpipe::local::env("ANSWERPIPE_ENV_FILE") else {
        return;
    };
    let Ok(txt) = std::fs::read_to_string(&p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let s = s.strip_prefix("export ").unwrap_or(s);
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v);
        }
    }
}

/// Logs go to stderr so stdout stays a clean JSON contract.
fn init_tracing(level: Option<&str>) {
    let directive = answerpipe::local::env("ANSWERPIPE_LOG")
        .or_else(|| level.map(str::to_string))
        .unwrap_or_else(|| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_new(&directive)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

async fn run_answer(args: AnswerCmd) -> Result<()> {
    let cfg = Config::load(args.config.as_deref())?;
    init_tracing(cfg.log_level.as_deref());
    let pipeline = Pipeline::from_config(Arc::new(cfg))?;
    let report = pipeline.answer_with_report(&args.query).await?;

    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("{}", report.answer.text);
            if !report.answer.citations.is_empty() {
                println!();
                for (i, c) in report.answer.citations.iter().enumerate() {
                    println!("[{}] {} <{}>", i + 1, c.title, c.url);
                }
            }
            if report.answer.low_confidence {
                eprintln!("note: low confidence (state={:?})", report.state);
            }
        }
        _ => {
            let mut payload = serde_json::json!({
                "schema_version": 1,
                "kind": "answer",
                "ok": true,
                "name": "answerpipe",
                "version": env!("CARGO_PKG_VERSION"),
                "query": report.query,
                "answer": report.answer,
                "state": report.state,
                "elapsed_ms": report.elapsed_ms,
            });
            if args.report {
                payload["report"] = serde_json::to_value(&report)?;
            }
            println!("{payload}");
        }
    }
    Ok(())
}

fn run_doctor(args: DoctorCmd) {
    let t0 = std::time::Instant::now();
    let (cfg, config_error) = match Config::load(args.config.as_deref()) {
        Ok(c) => (c, None),
        Err(e) => (Config::default(), Some(e.to_string())),
    };

    let engines = cfg.configured_engines();
    let generic = engines.contains(&EngineId::Generic);
    let answer_box = engines.contains(&EngineId::AnswerBox);
    let locale = engines.contains(&EngineId::Locale);
    let mut checks: Vec<serde_json::Value> = Vec::new();
    checks.push(serde_json::json!({
        "name": "config_valid",
        "ok": config_error.is_none(),
        "error": config_error,
    }));
    checks.push(serde_json::json!({
        "name": "llm_configured",
        "ok": cfg.llm_configured(),
        "hint": if cfg.llm_configured() {
            ""
        } else {
            "Set ANSWERPIPE_OPENAI_API_KEY (or OPENAI_API_KEY), or point llm.base_url at a compatible server."
        },
    }));
    checks.push(serde_json::json!({
        "name": "search_backends",
        "ok": !engines.is_empty(),
        "engines": engines,
        "hint": if engines.is_empty() {
            "Configure at least one of Google CSE, SerpApi or Naver credentials."
        } else {
            ""
        },
    }));

    let ok = checks.iter().all(|c| c["ok"].as_bool().unwrap_or(false));
    let payload = serde_json::json!({
        "schema_version": 1,
        "kind": "doctor",
        "ok": ok,
        "name": "answerpipe",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": {
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
        },
        "elapsed_ms": t0.elapsed().as_millis(),
        "configured": {
            "llm": {
                "provider": cfg.llm.provider,
                "model": cfg.llm.model,
                "ready": cfg.llm_configured(),
            },
            "engines": {
                "generic": generic,
                "generic_api": cfg.google_cse_configured(),
                "answer_box": answer_box,
                "locale": locale,
            },
            "render": cfg.render.enabled,
            "config_path": answerpipe::config::default_config_path(),
        },
        "checks": checks,
    });

    match args.output.to_ascii_lowercase().as_str() {
        "text" => {
            println!("answerpipe {}", env!("CARGO_PKG_VERSION"));
            println!("engines: generic={generic} answer_box={answer_box} locale={locale}");
            println!("render: {}", cfg.render.enabled);
            println!("llm: {} ready={}", cfg.llm.model, cfg.llm_configured());
            println!("checks:");
            if let Some(arr) = payload["checks"].as_array() {
                for c in arr {
                    let name = c["name"].as_str().unwrap_or("?");
                    let ok = c["ok"].as_bool().unwrap_or(false);
                    println!("- {}: {}", name, if ok { "ok" } else { "fail" });
                }
            }
        }
        _ => println!("{payload}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    let cli = Cli::parse();

    match cli.command {
        Commands::Answer(args) => run_answer(args).await?,
        Commands::Doctor(args) => run_doctor(args),
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "answerpipe",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("answerpipe {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }
    Ok(())
}
