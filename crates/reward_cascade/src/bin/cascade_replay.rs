use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use reward_cascade::collaborators::{
    InMemoryPurchaseHistory, InMemoryReferralDirectory, InMemoryWalletLedger,
};
use reward_cascade::{
    CascadeConfig, CascadeInvariantReport, CascadeStore, PointsEarnedEvent, PointsOutcome,
    RewardCascade,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CliOptions {
    events_path: PathBuf,
    config_path: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    referrals: Vec<(String, String)>,
    contributions: Vec<(String, String, u64)>,
}

#[derive(Debug, Default, Serialize)]
struct ReplaySummary {
    ok: bool,
    events_read: usize,
    accumulated: usize,
    assigned: usize,
    already_numbered: usize,
    reward_points_credited: usize,
    duplicates: usize,
    failed: Vec<String>,
    resumed_cascades: usize,
    audit: CascadeInvariantReport,
}

fn main() {
    let raw_args: Vec<String> = env::args().skip(1).collect();
    if raw_args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        return;
    }

    let options = match parse_options(raw_args.iter().map(|arg| arg.as_str())) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{err}");
            print_help();
            process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run_replay(options) {
        Ok(summary) => {
            match serde_json::to_string_pretty(&summary) {
                Ok(json) => println!("{json}"),
                Err(err) => {
                    eprintln!("cascade_replay failed: serialize summary: {err}");
                    process::exit(1);
                }
            }
            if !summary.ok {
                process::exit(2);
            }
        }
        Err(err) => {
            eprintln!("cascade_replay failed: {err}");
            process::exit(1);
        }
    }
}

fn run_replay(options: CliOptions) -> Result<ReplaySummary, String> {
    let config = match options.config_path.as_deref() {
        Some(path) => CascadeConfig::load(path).map_err(|err| err.to_string())?,
        None => CascadeConfig::default(),
    };
    let store = match options.state_dir.as_deref() {
        Some(dir) => CascadeStore::open(dir)
            .map_err(|err| format!("open state dir {} failed: {}", dir.display(), err))?,
        None => CascadeStore::in_memory(),
    };

    let referrals = Arc::new(InMemoryReferralDirectory::new());
    for (customer_id, referrer_id) in &options.referrals {
        referrals
            .register(customer_id.as_str(), referrer_id.as_str())
            .map_err(|err| err.to_string())?;
    }
    let purchases = Arc::new(InMemoryPurchaseHistory::new());
    for (customer_id, merchant_id, points) in &options.contributions {
        purchases.record_contribution(customer_id.as_str(), merchant_id.as_str(), *points);
    }

    let cascade = RewardCascade::new(
        config,
        Arc::new(store),
        Arc::new(InMemoryWalletLedger::new()),
        referrals,
        purchases,
    )
    .map_err(|err| err.to_string())?;

    let mut summary = ReplaySummary {
        resumed_cascades: cascade
            .resume_pending_cascades()
            .map_err(|err| format!("resume pending cascades failed: {err}"))?
            .len(),
        ..ReplaySummary::default()
    };
    for (line_no, event) in read_events(&options.events_path)? {
        summary.events_read += 1;
        match cascade.apply_event(&event) {
            Ok(PointsOutcome::Accumulated { .. }) => summary.accumulated += 1,
            Ok(PointsOutcome::Assigned { .. }) => summary.assigned += 1,
            Ok(PointsOutcome::AlreadyNumbered { .. }) => summary.already_numbered += 1,
            Ok(PointsOutcome::RewardPointsCredited { .. }) => summary.reward_points_credited += 1,
            Ok(PointsOutcome::Duplicate { .. }) => summary.duplicates += 1,
            Err(err) => {
                tracing::warn!(line = line_no, error = %err, "event failed");
                summary.failed.push(format!("line {line_no}: {err}"));
            }
        }
    }

    summary.audit = cascade
        .audit()
        .map_err(|err| format!("audit failed: {err}"))?;
    summary.ok = summary.failed.is_empty() && summary.audit.is_ok();
    Ok(summary)
}

fn read_events(path: &Path) -> Result<Vec<(usize, PointsEarnedEvent)>, String> {
    let content = fs::read_to_string(path)
        .map_err(|err| format!("read events {} failed: {}", path.display(), err))?;
    parse_events(content.as_str())
}

fn parse_events(content: &str) -> Result<Vec<(usize, PointsEarnedEvent)>, String> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<PointsEarnedEvent>(line)
                .map(|event| (index + 1, event))
                .map_err(|err| format!("events line {} is not a points event: {}", index + 1, err))
        })
        .collect()
}

fn parse_options<'a>(args: impl Iterator<Item = &'a str>) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut events_path = None;
    let mut iter = args.peekable();

    while let Some(arg) = iter.next() {
        match arg {
            "--events" => {
                events_path = Some(PathBuf::from(parse_required_value(&mut iter, "--events")?));
            }
            "--config" => {
                let raw = parse_required_value(&mut iter, "--config")?;
                options.config_path = Some(PathBuf::from(raw));
            }
            "--state-dir" => {
                let raw = parse_required_value(&mut iter, "--state-dir")?;
                options.state_dir = Some(PathBuf::from(raw));
            }
            "--referral" => {
                let raw = parse_required_value(&mut iter, "--referral")?;
                options.referrals.push(parse_referral_spec(raw.as_str())?);
            }
            "--contribution" => {
                let raw = parse_required_value(&mut iter, "--contribution")?;
                options
                    .contributions
                    .push(parse_contribution_spec(raw.as_str())?);
            }
            _ => return Err(format!("unknown option: {arg}")),
        }
    }

    options.events_path = events_path.ok_or_else(|| "--events is required".to_string())?;
    Ok(options)
}

fn parse_required_value<'a, I>(
    iter: &mut std::iter::Peekable<I>,
    flag: &str,
) -> Result<String, String>
where
    I: Iterator<Item = &'a str>,
{
    let Some(value) = iter.next() else {
        return Err(format!("{flag} requires a value"));
    };
    let value = value.trim();
    if value.is_empty() {
        return Err(format!("{flag} requires a non-empty value"));
    }
    Ok(value.to_string())
}

fn parse_referral_spec(raw: &str) -> Result<(String, String), String> {
    let (customer_id, referrer_id) = raw
        .split_once(':')
        .ok_or_else(|| "--referral must be in <customer:referrer> format".to_string())?;
    let customer_id = customer_id.trim();
    let referrer_id = referrer_id.trim();
    if customer_id.is_empty() || referrer_id.is_empty() {
        return Err("--referral customer and referrer cannot be empty".to_string());
    }
    Ok((customer_id.to_string(), referrer_id.to_string()))
}

fn parse_contribution_spec(raw: &str) -> Result<(String, String, u64), String> {
    let mut parts = raw.split(':');
    let (Some(customer_id), Some(merchant_id), Some(points), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err("--contribution must be in <customer:merchant:points> format".to_string());
    };
    let customer_id = customer_id.trim();
    let merchant_id = merchant_id.trim();
    if customer_id.is_empty() || merchant_id.is_empty() {
        return Err("--contribution customer and merchant cannot be empty".to_string());
    }
    let points = points
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|value| *value > 0)
        .ok_or_else(|| "--contribution points must be a positive integer".to_string())?;
    Ok((customer_id.to_string(), merchant_id.to_string(), points))
}

fn print_help() {
    println!(
        "Usage: cascade_replay --events <path> [options]\n\n\
Replays points events (one JSON object per line) through the reward cascade\n\
and prints a summary with the invariant audit.\n\n\
Options:\n\
  --events <path>                        points events, JSON lines (required)\n\
  --config <path>                        cascade config TOML (default: built-in tables)\n\
  --state-dir <dir>                      persist cascade state under <dir> (default: in memory)\n\
  --referral <customer:referrer>         register a referrer (repeatable)\n\
  --contribution <customer:merchant:n>   record merchant contribution points (repeatable)\n\
  -h, --help                             show help\n\n\
Log level follows RUST_LOG (default: {DEFAULT_LOG_FILTER})."
    );
}

#[cfg(test)]
mod tests {
    use super::{parse_contribution_spec, parse_events, parse_options, parse_referral_spec};

    #[test]
    fn parse_options_requires_events() {
        let err = parse_options(std::iter::empty()).expect_err("events missing");
        assert!(err.contains("--events"));
    }

    #[test]
    fn parse_options_reads_custom_values() {
        let options = parse_options(
            [
                "--events",
                "events.jsonl",
                "--config",
                "cascade.toml",
                "--state-dir",
                "state",
                "--referral",
                "c-1:x",
                "--contribution",
                "c-1:m-a:3000",
                "--contribution",
                "c-1:m-b:1000",
            ]
            .into_iter(),
        )
        .expect("parse should succeed");

        assert_eq!(options.events_path.to_string_lossy(), "events.jsonl");
        assert_eq!(
            options
                .config_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            Some("cascade.toml".to_string())
        );
        assert_eq!(options.referrals, vec![("c-1".to_string(), "x".to_string())]);
        assert_eq!(options.contributions.len(), 2);
        assert_eq!(options.contributions[1].2, 1_000);
    }

    #[test]
    fn parse_options_rejects_unknown_option() {
        let err = parse_options(["--events", "e.jsonl", "--verbose"].into_iter())
            .expect_err("unknown option");
        assert!(err.contains("--verbose"));
    }

    #[test]
    fn specs_reject_malformed_values() {
        assert!(parse_referral_spec("c-1").is_err());
        assert!(parse_referral_spec("c-1: ").is_err());
        assert!(parse_contribution_spec("c-1:m-a").is_err());
        assert!(parse_contribution_spec("c-1:m-a:0").is_err());
        assert!(parse_contribution_spec("c-1:m-a:10:extra").is_err());
    }

    #[test]
    fn events_skip_blank_lines_and_keep_line_numbers() {
        let events = parse_events(
            "{\"customer_id\":\"c-1\",\"points\":700}\n\n\
             {\"event_id\":\"evt-2\",\"customer_id\":\"c-2\",\"points\":40,\"is_reward_points\":true}\n",
        )
        .expect("parse events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, 1);
        assert_eq!(events[1].0, 3);
        assert!(events[1].1.is_reward_points);
        assert!(parse_events("{\"points\":1}").is_err());
    }
}
