use std::time::Duration;

use phone_home::{CancellationToken, Notification};
use serde_json::json;
use tracing::info;

#[allow(clippy::disallowed_methods)]
fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let cxl = CancellationToken::new();
    let agent = phone_home::install(cxl.clone(), "smoke-test", env!("CARGO_PKG_VERSION"))
        .expect("failed to install agent");
    if !agent.config().enabled() {
        info!("Set PHONE_HOME_ID and PHONE_HOME_URL to report somewhere");
    }

    agent.on_notifications_changed(|notifications: &[Notification]| {
        for notification in notifications {
            info!(?notification, "Notification");
        }

        Ok(())
    });

    info!("Agent running. Reporting for 15s...");

    for i in 0..15u32 {
        agent.accept_counters(json!({ "ticks": i, "host": "dev" }));
        agent.accept_metrics(json!({ "temperature": 60.0 + f64::from(i) * 0.5 }));
        if i % 5 == 0 {
            agent.accept_error(anyhow::anyhow!("tick {i} failed"));
        }

        std::thread::sleep(Duration::from_secs(1));
    }

    info!("Done. Waiting 3s for in-flight reports...");
    std::thread::sleep(Duration::from_secs(3));

    cxl.cancel();
    agent.close();
}
