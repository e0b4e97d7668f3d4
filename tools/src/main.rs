//! recon-runner: headless reconciliation runner.
//!
//! Usage:
//!   recon-runner --seed 12345 --refs 200 --business-date 2026-03-16 --db recon.db
//!   recon-runner --scenario 3 --business-date 2026-03-16
//!   recon-runner --seed 12345 --ipc-mode

use anyhow::{Context, Result};
use chrono::NaiveDate;
use recon_core::{
    command::OperatorCommand,
    config::ReconConfig,
    daily_ops::DailyOpsSummary,
    engine::ReconEngine,
    exception::ExceptionCase,
    feedback::FeedbackMetrics,
    monthly_close::MonthlyCloseBatch,
    run::ReconRun,
    scenario::{scenario3, Scenario, ScenarioBuilder},
    store::ReconStore,
};
use std::env;
use std::io::{self, BufRead, Write};

const ACTOR: &str = "recon-runner";

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    GetState,
    Command {
        cmd: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Quit,
}

#[derive(serde::Serialize)]
struct UiState {
    run: ReconRun,
    daily: DailyOpsSummary,
    exceptions: Vec<ExceptionCase>,
    monthly: Vec<MonthlyCloseBatch>,
    feedback: FeedbackMetrics,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let seed = parse_arg(&args, "--seed", 42u64);
    let refs = parse_arg(&args, "--refs", 50usize);
    let fault_rate = parse_arg(&args, "--fault-rate", 0.1f64);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = str_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = str_arg(&args, "--data-dir").unwrap_or("./data");
    let scenario_name = str_arg(&args, "--scenario");
    let business_date = match str_arg(&args, "--business-date") {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("--business-date '{s}' is not YYYY-MM-DD"))?,
        None => chrono::Utc::now().date_naive(),
    };

    if !ipc_mode {
        println!("recon-runner");
        println!("  seed:          {seed}");
        println!("  refs:          {refs}");
        println!("  business date: {business_date}");
        println!("  db:            {db}");
        println!("  data_dir:      {data_dir}");
        println!();
    }

    let config = ReconConfig::load(data_dir)?;
    let store = if db == ":memory:" { ReconStore::in_memory()? } else { ReconStore::open(db)? };
    let engine = ReconEngine::build(store, config)?;

    let scenario: Scenario = match scenario_name {
        Some("3") | Some("scenario3") => scenario3(business_date),
        Some(other) => anyhow::bail!("unknown scenario '{other}'"),
        None => ScenarioBuilder::new(seed, business_date).refs(refs).fault_rate(fault_rate).build(),
    };
    let run = scenario.run_through(&engine, ACTOR)?;

    if ipc_mode {
        run_ipc_loop(&engine, &run.id)?;
    } else {
        print_summary(&engine, &scenario, &run)?;
    }

    Ok(())
}

/// One JSON request per stdin line, one JSON response per stdout line.
fn run_ipc_loop(engine: &ReconEngine, run_id: &str) -> Result<()> {
    let mut out = io::stdout().lock();
    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<IpcCommand>(&line) {
            Err(e) => error_reply(&e),
            Ok(IpcCommand::Quit) => break,
            Ok(IpcCommand::GetState) => serde_json::to_value(build_ui_state(engine, run_id)?)?,
            Ok(IpcCommand::Command { cmd, payload }) => match handle_command(engine, &cmd, payload) {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::warn!("command {cmd} rejected: {e:#}");
                    error_reply(&format!("{e:#}"))
                }
            },
        };
        writeln!(out, "{reply}")?;
        out.flush()?;
    }
    Ok(())
}

fn error_reply(e: &dyn std::fmt::Display) -> serde_json::Value {
    serde_json::json!({ "error": e.to_string() })
}

/// Merge `cmd` into the payload object and decode it as an `OperatorCommand`.
fn handle_command(engine: &ReconEngine, cmd: &str, payload: serde_json::Value) -> Result<serde_json::Value> {
    let mut body = match payload {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => serde_json::Map::new(),
        other => anyhow::bail!("payload must be an object, got {other}"),
    };
    body.insert("cmd".to_string(), serde_json::Value::String(cmd.to_string()));
    let command: OperatorCommand =
        serde_json::from_value(serde_json::Value::Object(body)).with_context(|| format!("bad '{cmd}' payload"))?;
    let outcome = engine.apply(command, ACTOR)?;
    Ok(serde_json::to_value(outcome)?)
}

fn build_ui_state(engine: &ReconEngine, run_id: &str) -> Result<UiState> {
    Ok(UiState {
        run: engine.get_run(run_id)?,
        daily: engine.daily_ops(run_id)?,
        exceptions: engine.list_exceptions(run_id)?,
        monthly: engine.list_monthly_close()?,
        feedback: engine.feedback_metrics(Some(run_id))?,
    })
}

fn print_summary(engine: &ReconEngine, scenario: &Scenario, run: &ReconRun) -> Result<()> {
    let daily = engine.daily_ops(&run.id)?;
    let exceptions = engine.list_exceptions(&run.id)?;

    println!("=== RUN SUMMARY ===");
    println!("  run:            {} ({})", run.run_number, run.id);
    println!("  status:         {} / {}", run.status, run.stage);
    println!("  total:          {}", run.counters.total);
    println!("  good:           {}", run.counters.good);
    println!("  doubtful:       {}", run.counters.doubtful);
    println!("  exceptions:     {}", run.counters.exceptions);
    println!("  expected good:  {}", scenario.expected_good());
    println!("  next action:    {:?}", daily.next_action);

    println!();
    println!("=== EXCEPTIONS ===");
    if exceptions.is_empty() {
        println!("  (none)");
    }
    for case in &exceptions {
        let codes: Vec<&str> = case.reason_codes.iter().map(|c| c.as_str()).collect();
        println!("  {:<24} {:<6} {}", case.merchant_ref, case.severity.as_str(), codes.join(","));
    }

    if !daily.notification_targets.is_empty() {
        println!();
        println!("=== NOTIFY ===");
        for t in &daily.notification_targets {
            println!("  {:<22} {} ref(s)", t.label, t.count);
        }
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}

fn str_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}
