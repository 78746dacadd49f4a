//! Agentic execution orchestrator.
//!
//! Drives an external code-modification agent through propose, review, and
//! apply phases for one request. Configuration and run logs live under
//! `.orchestrator/` in the project root.

use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

use orchestrator::core::plan::execution_order;
use orchestrator::core::types::{SessionPolicy, WorkflowResult};
use orchestrator::execution::Session;
use orchestrator::exit_codes;
use orchestrator::io::agent::ClaudeCliAgent;
use orchestrator::io::cancel::CancelToken;
use orchestrator::io::config::load_config;
use orchestrator::io::context::Collaborators;
use orchestrator::io::init::{InitOptions, OrchestratorPaths, init_orchestrator};
use orchestrator::io::operator::ConsoleOperator;
use orchestrator::io::plan_store::load_plan;
use orchestrator::io::run_log::{RunLog, new_run_id};
use orchestrator::io::sink::ConsoleSink;
use orchestrator::io::verify::{CommandVerifier, Verifier};
use orchestrator::logging;
use orchestrator::workflow::{Workflow, WorkflowRequest};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Propose, review, and apply agent code changes with a human in the loop"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.orchestrator/config.toml` and supporting files.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one request against a project.
    Run {
        /// What the agent should do.
        query: String,
        /// Project root the agent works in.
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// Use this plan file instead of the decomposition collaborator.
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Approve every proposal without asking.
        #[arg(short, long)]
        yes: bool,
        /// Show agent reasoning as it streams.
        #[arg(short, long)]
        verbose: bool,
        /// Print the final result as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Validate a plan file and print its execution order.
    CheckPlan {
        file: PathBuf,
    },
}

struct RunArgs {
    query: String,
    project: PathBuf,
    plan: Option<PathBuf>,
    yes: bool,
    verbose: bool,
    json: bool,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Run {
            query,
            project,
            plan,
            yes,
            verbose,
            json,
        } => cmd_run(RunArgs {
            query,
            project,
            plan,
            yes,
            verbose,
            json,
        }),
        Command::CheckPlan { file } => cmd_check_plan(&file),
    }
}

fn cmd_init(force: bool) -> Result<i32> {
    let root = std::env::current_dir().context("resolve current directory")?;
    let paths = init_orchestrator(&root, &InitOptions { force })?;
    println!("initialized {}", paths.dir.display());
    Ok(exit_codes::OK)
}

fn cmd_check_plan(file: &Path) -> Result<i32> {
    let plan = load_plan(file)?;
    if !plan.is_complex {
        println!("plan is not complex: the request runs as a single task");
    }
    let order = execution_order(&plan)?;
    for (idx, task) in order.iter().enumerate() {
        println!("{}. [{}] {}", idx + 1, task.id, task.description);
    }
    Ok(exit_codes::OK)
}

fn cmd_run(args: RunArgs) -> Result<i32> {
    let project = args
        .project
        .canonicalize()
        .with_context(|| format!("resolve project path {}", args.project.display()))?;
    let paths = OrchestratorPaths::new(&project);
    let cfg = load_config(&paths.config_path)?;

    let mut collaborators =
        Collaborators::from_config(&cfg.collaborators, &project, cfg.output_limit_bytes);
    if let Some(plan_path) = &args.plan {
        collaborators = collaborators.with_plan(load_plan(plan_path)?);
    }
    let agent = ClaudeCliAgent {
        binary: cfg.agent.binary.clone(),
        extra_args: cfg.agent.extra_args.clone(),
        model: cfg.agent.model.clone(),
    };
    let verifier = (!cfg.verify.command.is_empty()).then(|| CommandVerifier {
        argv: cfg.verify.command.clone(),
    });
    let run_log = match RunLog::create(&project, new_run_id()) {
        Ok(log) => Some(log),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "run log unavailable, continuing without it");
            None
        }
    };

    let cancel = CancelToken::new();
    install_interrupt_listener(cancel.clone());

    let stdin = io::stdin();
    let mut operator = ConsoleOperator::new(stdin.lock(), io::stderr());
    let mut sink = ConsoleSink::new(io::stderr());
    let mut session = Session {
        agent: &agent,
        operator: &mut operator,
        sink: &mut sink,
        cancel: &cancel,
        policy: SessionPolicy {
            approve_all: cfg.approve_all || args.yes,
            verbose: cfg.verbose || args.verbose,
        },
    };
    let workflow = Workflow {
        config: &cfg,
        collaborators: &collaborators,
        verifier: verifier.as_ref().map(|v| v as &dyn Verifier),
        run_log: run_log.as_ref(),
    };
    let result = workflow.run(
        &mut session,
        &WorkflowRequest {
            query: args.query,
            project,
        },
    );

    if args.json {
        let payload = serde_json::to_string_pretty(&result).context("serialize result")?;
        println!("{payload}");
    } else {
        print_result(&result);
    }
    Ok(exit_codes::for_result(&result, cancel.is_cancelled()))
}

/// Ctrl-C stops the active agent; with no agent running it exits the program.
fn install_interrupt_listener(cancel: CancelToken) {
    let spawned = thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(%err, "interrupt listener unavailable");
                    return;
                }
            };
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if cancel.interrupt() {
                        debug!("interrupt: stopping active agent");
                        eprintln!("\nInterrupted, stopping the agent...");
                    } else {
                        eprintln!();
                        process::exit(exit_codes::CANCELLED);
                    }
                }
            });
        });
    if let Err(err) = spawned {
        warn!(%err, "failed to spawn interrupt listener");
    }
}

fn print_result(result: &WorkflowResult) {
    let response = result.response.trim();
    if !response.is_empty() {
        println!("{response}\n");
    }
    println!("{}", result.summary);
    if !result.files_modified.is_empty() {
        println!("Files modified:");
        for file in &result.files_modified {
            println!("  {file}");
        }
    }
    if let Some(err) = &result.error {
        eprintln!("error: {err}");
    }
    if let Some(run_id) = &result.run_id {
        eprintln!("run log: .orchestrator/runs/{run_id}");
    }
}
