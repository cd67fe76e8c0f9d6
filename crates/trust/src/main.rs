//! trust - Progressive trust for Sitepilot's autonomous fixes
//!
//! "Earn autonomy one level at a time."

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use trust::{
    audit::{AuditCursor, AuditQuery, ImpactMetrics},
    config::EngineConfig,
    eligibility::Basis,
    engine::{OutcomeReport, TrustEngine},
    ledger::TrustRecord,
    level::{ExecutionMode, Outcome, TrustLevel},
    policy::PolicyTable,
};

/// trust - Progressive trust for Sitepilot's autonomous fixes
#[derive(Parser)]
#[command(name = "trust")]
#[command(version = "1.0.0")]
#[command(about = "Progressive trust for Sitepilot's autonomous fixes")]
#[command(long_about = "Progressive trust for Sitepilot's autonomous fixes.\n\n\
    Every website and action category starts at level 1 (suggest-only).\n\
    Sustained success earns level 2 (assisted) and then level 3 (autonomous).\n\
    Consecutive failures cost a level and mark the category degraded\n\
    until it succeeds again.")]
pub struct Cli {
    /// Config file (defaults to ~/.config/sitepilot/trust.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the config
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Policy table, overriding the config
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether an action may run unattended
    #[command(about = "Check whether an action may run unattended")]
    Check {
        website: String,
        action_code: String,
        category: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Record the outcome of an attempted action
    #[command(about = "Record the outcome of an attempted action")]
    Record {
        website: String,
        action_code: String,
        category: String,

        /// success, failure or denied
        outcome: String,

        /// How the action ran: autonomous or assisted (denied outcomes are always denied)
        #[arg(long, default_value = "assisted")]
        mode: String,

        /// Evidence supporting the action (repeatable)
        #[arg(long = "evidence")]
        evidence: Vec<String>,

        /// Error message for failures
        #[arg(long)]
        error: Option<String>,

        /// Who executed the action
        #[arg(long, default_value = "operator")]
        by: String,

        /// JSON snapshot before the action
        #[arg(long)]
        impact_before: Option<String>,

        /// JSON snapshot after the action
        #[arg(long)]
        impact_after: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show trust records for a website
    #[command(about = "Show trust records for a website")]
    Show {
        website: String,

        /// Only this category
        category: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Query the execution audit log
    #[command(about = "Query the execution audit log")]
    History {
        website: String,

        /// Filter by category
        #[arg(long)]
        category: Option<String>,

        /// Filter by outcome
        #[arg(long)]
        outcome: Option<String>,

        /// Show entries since (e.g., "1h", "1d", "1w")
        #[arg(long)]
        since: Option<String>,

        /// Limit number of results
        #[arg(long)]
        limit: Option<usize>,

        /// Resume from a cursor printed by a previous page
        #[arg(long)]
        before: Option<i64>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show audit statistics for a website
    #[command(about = "Show audit statistics")]
    Stats {
        website: String,

        /// Only this category
        #[arg(long)]
        category: Option<String>,
    },

    /// Set a trust level by hand
    #[command(about = "Set a trust level by hand (audited)")]
    Override {
        website: String,
        category: String,

        /// 1 (suggest-only), 2 (assisted) or 3 (autonomous)
        level: String,

        /// Why the level is being changed
        #[arg(long)]
        reason: Option<String>,
    },

    /// Initialize default configuration
    #[command(about = "Write default config and a starter policy table")]
    Init {
        /// Force overwrite existing files
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Check {
            website,
            action_code,
            category,
            json,
        } => cmd_check(&cli.policy, config, website, action_code, category, json),
        Commands::Record {
            website,
            action_code,
            category,
            outcome,
            mode,
            evidence,
            error,
            by,
            impact_before,
            impact_after,
            json,
        } => {
            let report = build_report(
                website,
                action_code,
                category,
                &outcome,
                &mode,
                evidence,
                error,
                by,
                impact_before,
                impact_after,
            )?;
            cmd_record(&cli.policy, config, report, json)
        }
        Commands::Show {
            website,
            category,
            json,
        } => cmd_show(&cli.policy, config, website, category, json),
        Commands::History {
            website,
            category,
            outcome,
            since,
            limit,
            before,
            json,
        } => cmd_history(&cli.policy, config, website, category, outcome, since, limit, before, json),
        Commands::Stats { website, category } => cmd_stats(&cli.policy, config, website, category),
        Commands::Override {
            website,
            category,
            level,
            reason,
        } => cmd_override(&cli.policy, config, website, category, level, reason),
        Commands::Init { force } => {
            let config_path = cli
                .config
                .clone()
                .unwrap_or_else(|| sitepilot_core::Paths::new().config_file("trust"));
            let policy_path = cli.policy.clone().unwrap_or_else(|| config.policy_path());
            cmd_init(&config_path, &policy_path, force)
        }
    }
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(db) = &cli.db {
        config.storage.path = Some(db.to_string_lossy().to_string());
    }
    Ok(config)
}

fn open_engine(policy_override: &Option<PathBuf>, config: EngineConfig) -> Result<TrustEngine> {
    let policy_path = policy_override.clone().unwrap_or_else(|| config.policy_path());
    let policy = PolicyTable::load_from(&policy_path)?;
    if policy.is_empty() {
        tracing::warn!(path = %policy_path.display(), "policy table is empty; every action will be denied");
    }
    TrustEngine::open(config, policy)
}

fn cmd_check(
    policy: &Option<PathBuf>,
    config: EngineConfig,
    website: String,
    action_code: String,
    category: String,
    json_output: bool,
) -> Result<()> {
    let engine = open_engine(policy, config)?;
    let result = engine.check_eligibility(&website, &action_code, &category);

    if json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let verdict = if result.allowed { "ALLOW" } else { "DENY" };
        println!("{}: {} on {} ({})", verdict, action_code, website, category);
        println!("  Basis: {:?}", result.basis);
        println!("  Reason: {}", result.reason);
        println!("  Execution mode: {}", result.execution_mode());
    }

    // Exit with appropriate code
    match (result.allowed, result.basis) {
        (true, _) => std::process::exit(0),
        (false, Basis::Unavailable) => std::process::exit(2),
        (false, _) => std::process::exit(1),
    }
}

#[allow(clippy::too_many_arguments)]
fn build_report(
    website: String,
    action_code: String,
    category: String,
    outcome: &str,
    mode: &str,
    evidence: Vec<String>,
    error: Option<String>,
    by: String,
    impact_before: Option<String>,
    impact_after: Option<String>,
) -> Result<OutcomeReport> {
    let outcome = Outcome::from_str(outcome)
        .with_context(|| format!("Unknown outcome: {} (expected success, failure or denied)", outcome))?;
    let mode = ExecutionMode::from_str(mode)
        .with_context(|| format!("Unknown execution mode: {}", mode))?;

    let mut report = OutcomeReport::new(&website, &action_code, &category, outcome).executed_by(&by);
    if outcome != Outcome::Denied {
        report = report.mode(mode);
    }
    for item in evidence {
        report = report.evidence(item);
    }
    if let Some(message) = error {
        report = report.error(&message);
    }

    if impact_before.is_some() || impact_after.is_some() {
        let parse = |raw: Option<String>| -> Result<Option<serde_json::Value>> {
            raw.map(|s| serde_json::from_str(&s).context("Impact snapshot must be valid JSON"))
                .transpose()
        };
        report = report.impact(ImpactMetrics {
            before: parse(impact_before)?,
            after: parse(impact_after)?,
            extra: serde_json::Map::new(),
        });
    }

    Ok(report)
}

fn cmd_record(
    policy: &Option<PathBuf>,
    config: EngineConfig,
    report: OutcomeReport,
    json_output: bool,
) -> Result<()> {
    let engine = open_engine(policy, config)?;
    let recorded = engine.record_outcome(report)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&recorded)?);
        return Ok(());
    }

    println!(
        "Recorded {} for {} ({})",
        recorded.audit_record.outcome, recorded.audit_record.action_code, recorded.audit_record.id
    );
    if let Some(event) = &recorded.transition {
        println!("  Transition: {:?}", event.transition);
        println!("  Evidence: {} audit records", event.evidence.len());
    }
    print_record(&recorded.record);

    Ok(())
}

fn cmd_show(
    policy: &Option<PathBuf>,
    config: EngineConfig,
    website: String,
    category: Option<String>,
    json_output: bool,
) -> Result<()> {
    let engine = open_engine(policy, config)?;
    let records = match category {
        Some(category) => vec![engine.get_trust_record(&website, &category)?],
        None => engine.list_trust_records(&website)?,
    };

    if json_output {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No trust records for {}", website);
        return Ok(());
    }

    println!(
        "{:<16} {:<14} {:>6} {:>8} {:>8} {:>7} {}",
        "CATEGORY", "LEVEL", "CONF", "SUCCESS", "FAILURE", "STREAK", "HEALTH"
    );
    println!("{}", "-".repeat(75));

    for record in records {
        let level = format!("{} {}", record.trust_level, record.trust_level.as_str());
        let health = if record.is_degraded { "DEGRADED" } else { "ok" };
        println!(
            "{:<16} {:<14} {:>5}% {:>8} {:>8} {:>7} {}",
            record.action_category,
            level,
            record.confidence,
            record.success_count,
            record.failure_count,
            record.consecutive_failures,
            health
        );
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_history(
    policy: &Option<PathBuf>,
    config: EngineConfig,
    website: String,
    category: Option<String>,
    outcome: Option<String>,
    since: Option<String>,
    limit: Option<usize>,
    before: Option<i64>,
    json_output: bool,
) -> Result<()> {
    let limit = config.audit.clamp_limit(limit);
    let engine = open_engine(policy, config)?;

    let mut query = AuditQuery::for_website(&website).limit(limit);
    if let Some(category) = &category {
        query = query.category(category);
    }
    if let Some(outcome) = &outcome {
        let outcome = Outcome::from_str(outcome)
            .with_context(|| format!("Unknown outcome: {}", outcome))?;
        query = query.outcome(outcome);
    }
    if let Some(since) = &since {
        query = query.since(parse_duration(since)?);
    }
    if let Some(seq) = before {
        query = query.before(AuditCursor(seq));
    }

    let page = engine.query_audit(&query)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    if page.records.is_empty() {
        println!("No audit entries found");
        return Ok(());
    }

    println!(
        "{:<17} {:<14} {:<32} {:<11} {:<9} {}",
        "TIME", "CATEGORY", "ACTION", "MODE", "OUTCOME", "BY"
    );
    println!("{}", "-".repeat(100));

    for record in &page.records {
        let time_str = record.executed_at.format("%Y-%m-%d %H:%M").to_string();
        let action_short = if record.action_code.chars().count() > 30 {
            let head: String = record.action_code.chars().take(27).collect();
            format!("{}...", head)
        } else {
            record.action_code.clone()
        };

        println!(
            "{:<17} {:<14} {:<32} {:<11} {:<9} {}",
            time_str,
            record.action_category,
            action_short,
            record.execution_mode,
            record.outcome,
            record.executed_by
        );
    }

    if let Some(AuditCursor(seq)) = page.next_cursor {
        println!();
        println!("More entries: --before {}", seq);
    }

    Ok(())
}

fn cmd_stats(
    policy: &Option<PathBuf>,
    config: EngineConfig,
    website: String,
    category: Option<String>,
) -> Result<()> {
    let engine = open_engine(policy, config)?;
    let stats = engine.audit_stats(&website, category.as_deref())?;

    println!("Trust Statistics: {}", website);
    println!("{}", "=".repeat(40));
    println!();
    println!("Total attempts: {}", stats.total);
    println!("  Succeeded: {}", stats.successes);
    println!("  Failed: {}", stats.failures);
    println!("  Denied: {}", stats.denied);
    println!();
    println!("Autonomous: {}", stats.autonomous);
    println!("Assisted: {}", stats.assisted);
    println!();
    println!("Autonomy rate: {:.1}%", stats.autonomy_rate());

    Ok(())
}

fn cmd_override(
    policy: &Option<PathBuf>,
    config: EngineConfig,
    website: String,
    category: String,
    level: String,
    reason: Option<String>,
) -> Result<()> {
    let level = TrustLevel::from_str(&level)
        .with_context(|| format!("Unknown trust level: {} (expected 1, 2 or 3)", level))?;
    let engine = open_engine(policy, config)?;
    let change = engine.admin_set_trust_level(&website, &category, level, reason.as_deref())?;

    println!(
        "Set {} / {} from level {} to level {}",
        website, category, change.previous_level, change.record.trust_level
    );
    println!("  Audit record: {}", change.audit_record.id);
    if change.record.is_degraded {
        println!("  Note: category is still degraded until its next success");
    }

    Ok(())
}

fn cmd_init(config_path: &Path, policy_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        println!("Config already exists at {:?}", config_path);
        println!("Use --force to overwrite");
    } else {
        EngineConfig::default().save_to(config_path)?;
        println!("Created default trust config at {:?}", config_path);
    }

    if policy_path.exists() && !force {
        println!("Policy table already exists at {:?}", policy_path);
    } else {
        PolicyTable::starter().save_to(policy_path)?;
        println!("Created starter policy table at {:?}", policy_path);
    }

    Ok(())
}

fn print_record(record: &TrustRecord) {
    println!(
        "  Level: {} ({})",
        record.trust_level,
        record.trust_level.as_str()
    );
    println!(
        "  Confidence: {}% over {} outcomes",
        record.confidence,
        record.sample_size()
    );
    println!("  Failure streak: {}", record.consecutive_failures);
    if record.is_degraded {
        let since = record
            .degraded_since
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("  DEGRADED since {}", since);
    }
}

/// Parse a duration string like "1h", "1d", "1w" into a DateTime
fn parse_duration(s: &str) -> Result<chrono::DateTime<Utc>> {
    let s = s.trim();
    let Some((split, _)) = s.char_indices().last() else {
        anyhow::bail!("Empty duration");
    };
    let (num, unit) = s.split_at(split);
    let num: i64 = num
        .parse()
        .with_context(|| format!("Invalid duration: {}", s))?;

    let duration = match unit {
        "h" => Duration::hours(num),
        "d" => Duration::days(num),
        "w" => Duration::weeks(num),
        "m" => Duration::minutes(num),
        _ => anyhow::bail!("Unknown duration unit: {}", unit),
    };

    Ok(Utc::now() - duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_duration() {
        let now = Utc::now();
        let since = parse_duration("2h").unwrap();
        assert!(since <= now - Duration::hours(2) + Duration::seconds(5));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("1µ").is_err());
        assert!(parse_duration("µ").is_err());
        assert!(parse_duration("3y").is_err());
    }

    #[test]
    fn test_init_writes_policy_to_override() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("trust.yaml");
        let policy_path = dir.path().join("policies").join("custom.yaml");

        cmd_init(&config_path, &policy_path, false).unwrap();

        assert!(config_path.exists());
        let policy = PolicyTable::load_from(&policy_path).unwrap();
        assert_eq!(policy.len(), PolicyTable::starter().len());
    }
}
