use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Arg, Command};
use fedimod::client::HttpModerationApi;
use fedimod::domains::DomainTracker;
use fedimod::enforcement::Enforcer;
use fedimod::jobs::{JobContext, JobRunner};
use fedimod::reporting::{ReportPipeline, ReportingOptions};
use fedimod::rule_store::RuleStore;
use fedimod::scanner::{ScanLimits, Scanner};
use fedimod::store::Store;
use fedimod::Config;
use log::LevelFilter;

#[tokio::main]
async fn main() {
    let matches = Command::new("fedimod")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Automated moderation sidecar for federated social instances")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/fedimod.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and the stored ruleset")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show rule trigger statistics and domain alerts")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("process-expired")
                .long("process-expired")
                .help("Reverse expired temporary actions once and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("invalidate-cache")
                .long("invalidate-cache")
                .help("Flag every cached content scan for rescan and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(path) = matches.get_one::<String>("generate-config") {
        generate_default_config(path);
        return;
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    let store = match Store::open(&config.db_path) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error opening database {}: {e}", config.db_path);
            process::exit(1);
        }
    };
    let rules = Arc::new(RuleStore::new(
        store.clone(),
        Duration::from_secs(300),
        config.report_threshold,
    ));

    if matches.get_flag("test-config") {
        test_config(&config, &rules);
        return;
    }

    if matches.get_flag("invalidate-cache") {
        match store.mark_all_scans_stale() {
            Ok(count) => println!("✅ {count} cached scans flagged for rescan"),
            Err(e) => {
                eprintln!("❌ Failed to invalidate cache: {e}");
                process::exit(1);
            }
        }
        return;
    }

    if matches.get_flag("stats") {
        show_stats(&store);
        return;
    }

    let api = match HttpModerationApi::new(&config) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            eprintln!("Error building API client: {e}");
            process::exit(1);
        }
    };

    let enforcer = Arc::new(Enforcer::new(store.clone(), api.clone(), config.dry_run));

    if matches.get_flag("process-expired") {
        match enforcer.process_expired_actions().await {
            Ok(reversed) => println!("✅ Reversed {reversed} expired actions"),
            Err(e) => {
                eprintln!("❌ Failed to process expired actions: {e}");
                process::exit(1);
            }
        }
        return;
    }

    let scanner = Arc::new(Scanner::new(
        store.clone(),
        api.clone(),
        rules.clone(),
        ScanLimits {
            max_pages_per_poll: config.max_pages_per_poll,
            batch_size: config.batch_size,
            max_statuses_to_fetch: config.max_statuses_to_fetch,
            scan_cache_ttl_days: config.scan_cache_ttl_days,
        },
    ));
    let domains = Arc::new(DomainTracker::new(
        store.clone(),
        config.defederation_threshold,
    ));
    let pipeline = Arc::new(ReportPipeline::new(
        store.clone(),
        api,
        rules,
        enforcer.clone(),
        domains,
        ReportingOptions {
            policy_version: config.policy_version.clone(),
            report_category: config.report_category.clone(),
            forward_remote_reports: config.forward_remote_reports,
            dry_run: config.dry_run,
        },
    ));

    let ctx = Arc::new(JobContext {
        store,
        scanner,
        pipeline,
        enforcer,
        panic_stop: config.panic_stop,
    });

    log::info!(
        "starting fedimod against {} (dry_run={})",
        config.instance_base,
        config.dry_run
    );
    let runner = JobRunner::new(
        ctx,
        config.workers,
        Duration::from_secs(config.poll_interval_seconds),
        Duration::from_secs(config.expiry_sweep_interval_seconds),
    );
    if let Err(e) = runner.run().await {
        log::error!("runner error: {e:#}");
        process::exit(1);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config, rules: &RuleStore) {
    println!("🔍 Testing configuration...");
    println!();
    println!("Instance: {}", config.instance_base);
    println!("Database: {}", config.db_path);
    println!("Dry run: {}", config.dry_run);
    println!("Report threshold: {}", config.report_threshold);
    println!("Defederation threshold: {}", config.defederation_threshold);
    println!();

    match rules.snapshot() {
        Ok(snapshot) => {
            println!("Enabled rules: {}", snapshot.rules.len());
            for loaded in &snapshot.rules {
                println!(
                    "  Rule {}: {} (weight {})",
                    loaded.rule.id,
                    loaded.rule.key(),
                    loaded.rule.weight
                );
            }
            println!("Ruleset fingerprint: {}", snapshot.fingerprint);
            println!("✅ All rule patterns compiled successfully");
        }
        Err(e) => {
            println!("❌ Configuration validation failed:");
            println!("Error: {e}");
            process::exit(1);
        }
    }
}

fn show_stats(store: &Store) {
    println!("📊 Rule Statistics");
    println!("═══════════════════════════════════════");
    match store.rule_trigger_stats() {
        Ok(stats) => {
            if stats.is_empty() {
                println!("📭 No rules defined yet");
            }
            for stat in stats {
                let state = if stat.enabled { "enabled" } else { "disabled" };
                let last = stat
                    .last_triggered_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "  {} [{}] {}: {} triggers, last {}",
                    stat.id, state, stat.name, stat.trigger_count, last
                );
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to read rule statistics: {e}");
            process::exit(1);
        }
    }

    println!();
    println!("🌐 Domain Alerts");
    println!("═══════════════════════════════════════");
    match store.list_domain_alerts(20) {
        Ok(alerts) => {
            if alerts.is_empty() {
                println!("📭 No domain violations recorded");
            }
            for alert in alerts {
                let marker = if alert.is_defederated { "⛔" } else { "  " };
                println!(
                    "{marker} {}: {} violations (threshold {})",
                    alert.domain, alert.violation_count, alert.defederation_threshold
                );
            }
        }
        Err(e) => {
            eprintln!("❌ Failed to read domain alerts: {e}");
            process::exit(1);
        }
    }
}
