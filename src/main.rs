mod cli;

use std::sync::Arc;

use copyforge::config::Config;
use copyforge::credits::CreditsMonitor;
use copyforge::http::ApiClient;
use log::warn;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = cli::build_cli();
    let matches = cmd.get_matches();
    let log_level = matches.get_one::<String>("log-level").cloned();
    let version_flag = matches.get_flag("version");
    let json_flag = matches.get_flag("json");

    cli::init_logging(log_level.as_deref());

    if version_flag {
        println!("copyforge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cfg = Config::from_env();
    let client = Arc::new(ApiClient::new(cfg)?);
    if client.auth().is_expired() {
        warn!("session token is expired; the API will answer 401 until it is refreshed");
    }

    let monitor = CreditsMonitor::new(Arc::clone(&client));
    monitor.start().await;

    let credits = monitor.credits();
    let gate = monitor.gate();
    if json_flag {
        let snapshot = serde_json::json!({
            "credits": credits,
            "gate": gate,
        });
        println!("{snapshot}");
    } else {
        println!(
            "trial credits: {} (free trial: {})",
            credits.trial_remaining, credits.is_free_trial
        );
        println!("real credits:  {}", credits.real_remaining);
        if gate.visible {
            println!("gate: {}: {}", gate.title, gate.message);
        }
    }
    Ok(())
}
