use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};
use uuid::Uuid;

use interpretix_messaging::ViewConfig;
use interpretix_realtime::RealtimeConfig;
use interpretix_realtime::health::HealthConfig;
use interpretix_supabase::SupabaseConfig;

pub struct Config {
    /// `None` in offline mode.
    pub supabase: Option<SupabaseConfig>,
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pub channel_name: String,
    pub page_size: usize,
    pub debounce: Duration,
    pub cooldown: Duration,
    pub reconnect_base: Duration,
    pub monitor_interval: Duration,
    pub report_status: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let offline = env_flag("INTERPRETIX_OFFLINE");

        let supabase = if offline {
            None
        } else {
            let url = required("INTERPRETIX_SUPABASE_URL")?;
            let key = required("INTERPRETIX_SUPABASE_KEY")?;
            let mut config = SupabaseConfig::new(url, key);
            if let Ok(token) = std::env::var("INTERPRETIX_ACCESS_TOKEN") {
                config = config.with_access_token(token);
            }
            Some(config)
        };

        let user_id = match std::env::var("INTERPRETIX_USER_ID") {
            Ok(id) => id.parse().context("INTERPRETIX_USER_ID is not a uuid")?,
            Err(_) if offline => Uuid::new_v4(),
            Err(_) => bail!("INTERPRETIX_USER_ID is required"),
        };
        let channel_id = match std::env::var("INTERPRETIX_CHANNEL_ID") {
            Ok(id) => id.parse().context("INTERPRETIX_CHANNEL_ID is not a uuid")?,
            Err(_) if offline => Uuid::new_v4(),
            Err(_) => bail!("INTERPRETIX_CHANNEL_ID is required"),
        };

        Ok(Self {
            supabase,
            user_id,
            channel_id,
            channel_name: std::env::var("INTERPRETIX_CHANNEL_NAME").unwrap_or_else(|_| "general".into()),
            page_size: parse_or("INTERPRETIX_PAGE_SIZE", 100)?,
            debounce: Duration::from_millis(parse_or("INTERPRETIX_DEBOUNCE_MS", 100)?),
            cooldown: Duration::from_millis(parse_or("INTERPRETIX_COOLDOWN_MS", 1000)?),
            reconnect_base: Duration::from_millis(parse_or("INTERPRETIX_RECONNECT_BASE_MS", 1000)?),
            monitor_interval: Duration::from_secs(parse_or("INTERPRETIX_MONITOR_SECS", 30)?),
            report_status: env_flag("INTERPRETIX_REPORT_STATUS"),
        })
    }

    pub fn realtime(&self) -> RealtimeConfig {
        RealtimeConfig {
            default_debounce: self.debounce,
        }
    }

    pub fn view(&self) -> ViewConfig {
        let mut view = ViewConfig {
            cooldown: self.cooldown,
            health: HealthConfig {
                base_reconnect_delay: self.reconnect_base,
                check_interval: self.reconnect_base,
            },
            ..Default::default()
        };
        view.engine.page_size = self.page_size;
        view
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{} is required (or set INTERPRETIX_OFFLINE=1)", name))
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn parse_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        Err(_) => Ok(default),
    }
}
