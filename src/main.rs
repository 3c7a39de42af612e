use std::path::Path;
use std::sync::Arc;

use chatpilot::config::Config;
use chatpilot::runtime::Orchestrator;
use chatpilot::throttle::SafetyThrottle;
use chatpilot::{accounts, db, logging};
use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(
    name = "chatpilot",
    version = VERSION,
    about = "Chat automation: worker supervision, AI replies and pattern playback"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Start workers for active accounts and route events until Ctrl-C
    Start {
        /// Only start these sessions (repeatable)
        #[arg(long = "session")]
        sessions: Vec<String>,
    },
    /// Sync accounts from session files and list them
    Accounts,
    /// List stored patterns
    Patterns,
    /// Run a pattern once for an account
    RunPattern {
        pattern_id: i64,
        account_id: i64,
        /// Chat used by actions without a target
        #[arg(long)]
        chat: Option<String>,
    },
    /// Show limits and recent executions for an account
    Stats { account_id: i64 },
    /// Print the tail of the newest log file
    Logs {
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
    /// Show version
    Version,
}

fn print_version() {
    println!("chatpilot {VERSION}");
}

fn open_database(config: &Config) -> anyhow::Result<Arc<db::Database>> {
    Ok(Arc::new(db::Database::new(&config.runtime_data_dir())?))
}

async fn list_accounts(config: &Config) -> anyhow::Result<()> {
    let database = open_database(config)?;
    let accounts =
        accounts::sync_from_sessions(database.clone(), Path::new(&config.sessions_dir)).await?;
    if accounts.is_empty() {
        println!("No sessions found in {}", config.sessions_dir);
        return Ok(());
    }
    for account in database.list_accounts()? {
        let name = account
            .username
            .as_deref()
            .or(account.first_name.as_deref())
            .unwrap_or("-");
        println!(
            "{:>4}  {:<24} {:<16} active={} ai={}",
            account.id, account.session_id, name, account.is_active, account.ai_enabled
        );
    }
    Ok(())
}

fn list_patterns(config: &Config) -> anyhow::Result<()> {
    let database = open_database(config)?;
    let patterns = database.list_patterns()?;
    if patterns.is_empty() {
        println!("No patterns");
    }
    for pattern in patterns {
        println!(
            "{:>4}  {:<24} actions={} repeat={} active={}",
            pattern.id,
            pattern.name,
            pattern.actions.len(),
            pattern.repeat_count,
            pattern.is_active
        );
    }
    Ok(())
}

fn print_stats(config: &Config, account_id: i64) -> anyhow::Result<()> {
    let database = open_database(config)?;
    let Some(account) = database.get_account(account_id)? else {
        anyhow::bail!("account {account_id} not found");
    };
    println!("Account {} ({})", account.id, account.session_id);
    let limits = SafetyThrottle::new(config.safety.clone(), Some(database.clone())).limits();
    println!(
        "Limits: {} actions/h, {} messages/h, delay {}-{} ms",
        limits.actions_per_hour,
        limits.messages_per_hour,
        limits.min_delay_ms,
        limits.max_delay_ms
    );
    println!("Recent executions:");
    for execution in database.list_executions(Some(account_id), 10)? {
        println!(
            "  #{:<5} pattern={:<4} {:<9} action={} repeat={} {}",
            execution.id,
            execution.pattern_id,
            execution.status.as_str(),
            execution.current_action,
            execution.current_repeat + 1,
            execution.error_message.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn print_logs(config: &Config, lines: usize) -> anyhow::Result<()> {
    let dir = logging::log_dir(&config.runtime_data_dir());
    for line in logging::tail_logs(&dir, lines)? {
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        MainCommand::Version => {
            print_version();
            Ok(())
        }
        MainCommand::Logs { lines } => print_logs(&Config::load()?, lines),
        MainCommand::Accounts => list_accounts(&Config::load()?).await,
        MainCommand::Patterns => list_patterns(&Config::load()?),
        MainCommand::Stats { account_id } => print_stats(&Config::load()?, account_id),
        MainCommand::RunPattern {
            pattern_id,
            account_id,
            chat,
        } => {
            logging::init_console_logging();
            let orchestrator = Orchestrator::new(Config::load()?)?;
            let account = orchestrator
                .db
                .get_account(account_id)?
                .ok_or_else(|| anyhow::anyhow!("account {account_id} not found"))?;
            let router = orchestrator.spawn_router();
            orchestrator.supervisor.start(&account.session_id).await?;
            let result = orchestrator.run_pattern(pattern_id, account_id, chat).await;
            orchestrator.shutdown().await;
            if let Some(handle) = router {
                handle.abort();
            }
            let execution_id = result?;
            println!("Execution {execution_id} completed");
            Ok(())
        }
        MainCommand::Start { sessions } => {
            let config = Config::load()?;
            let _log_guard = if std::env::var("CHATPILOT_DAEMON").is_ok() {
                Some(logging::init_logging(&config.runtime_data_dir())?)
            } else {
                logging::init_console_logging();
                None
            };
            info!(version = VERSION, "Starting chatpilot");
            let orchestrator = Orchestrator::new(config)?;
            orchestrator.run_until_ctrl_c(&sessions).await
        }
    }
}
