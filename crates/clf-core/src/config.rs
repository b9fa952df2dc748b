use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    errors::Error,
    quota::{Limits, Thresholds},
    Result,
};

/// System prompt used when `FORMAT_PROMPT` is not set.
const DEFAULT_FORMAT_PROMPT: &str = "\
You are an automotive expert with deep knowledge of car makes and models.
Extract the relevant details from the text and rewrite it as: (
    1. Make: (keep the exact spelling, e.g. Mercedes-Benz, BMW, Audi)
    2. Model: (full model name with every letter and digit, e.g. X3 30i, M5 Competition)
    3. VIN: (digits and letters only, no spaces)
    4. Mileage:
    5. Year:
    6. Price:
    7. Contact: )
Rules:
- Keep the exact spelling of the make (Mercedes-Benz, not Mercedes-Benx)
- Keep every letter and digit of the model name (X3 30i, not just X3)
- If the text contains several links, list all of them
- If there are several contacts, list all of them
- Put a dash (-) wherever a detail is missing
- Do not invent information
- Do not change the output format";

/// Typed configuration, loaded from the environment (with `.env` support).
#[derive(Clone, Debug)]
pub struct Config {
    // GigaChat API
    pub auth_url: String,
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub oauth_scope: String,
    pub model: String,
    pub temperature: f64,
    pub api_timeout: Duration,
    /// The GigaChat endpoints present a certificate chain rooted in the
    /// Russian trust store, which most systems do not carry.
    pub accept_invalid_certs: bool,

    // Token quotas
    pub request_token_limit: u64,
    pub daily_token_limit: u64,
    pub monthly_token_limit: u64,
    pub warning_threshold: u32,
    pub critical_threshold: u32,

    // Paths
    pub save_dir: PathBuf,
    pub stats_file: PathBuf,

    // Formatting
    pub format_prompt: String,

    // Watch mode
    pub poll_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required credentials
        let client_id = env_str("SBER_CLIENT_ID").and_then(non_empty).ok_or_else(|| {
            Error::Config("SBER_CLIENT_ID environment variable is required".to_string())
        })?;
        let client_secret = env_str("SBER_CLIENT_SECRET")
            .and_then(non_empty)
            .ok_or_else(|| {
                Error::Config("SBER_CLIENT_SECRET environment variable is required".to_string())
            })?;

        // API endpoints
        let auth_url = env_str("SBER_AUTH_URL")
            .unwrap_or_else(|| "https://ngw.devices.sberbank.ru:9443/api/v2/oauth".to_string());
        let api_url = env_str("SBER_API_URL").unwrap_or_else(|| {
            "https://gigachat.devices.sberbank.ru/api/v1/chat/completions".to_string()
        });
        let oauth_scope = env_str("SBER_OAUTH_SCOPE").unwrap_or_else(|| "GIGACHAT_API_PERS".to_string());
        let model = env_str("SBER_MODEL").unwrap_or_else(|| "GigaChat:latest".to_string());
        let temperature = env_f64("SBER_TEMPERATURE").unwrap_or(0.7);
        let api_timeout = Duration::from_millis(env_u64("SBER_API_TIMEOUT_MS").unwrap_or(30_000));
        let accept_invalid_certs = env_bool("SBER_ACCEPT_INVALID_CERTS").unwrap_or(true);

        // Token quotas
        let request_token_limit = env_u64("SINGLE_REQUEST_LIMIT").unwrap_or(2_000);
        let daily_token_limit = env_u64("DAILY_TOKEN_LIMIT").unwrap_or(10_000);
        let monthly_token_limit = env_u64("MONTHLY_TOKEN_LIMIT").unwrap_or(100_000);
        if request_token_limit == 0 || daily_token_limit == 0 || monthly_token_limit == 0 {
            return Err(Error::Config("token limits must be positive".to_string()));
        }

        let warning_threshold = env_u32("WARNING_THRESHOLD").unwrap_or(80);
        let critical_threshold = env_u32("CRITICAL_THRESHOLD").unwrap_or(90);

        // Paths
        let save_dir = env_path("SAVE_DIR")
            .unwrap_or_else(|| env::current_dir().unwrap_or_default().join("saved"));
        let stats_file =
            env_path("TOKEN_STATS_FILE").unwrap_or_else(|| PathBuf::from("token_stats.json"));

        let format_prompt = env_str("FORMAT_PROMPT")
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_FORMAT_PROMPT.to_string());

        let poll_interval = Duration::from_millis(env_u64("POLL_INTERVAL_MS").unwrap_or(60_000));

        Ok(Self {
            auth_url,
            api_url,
            client_id,
            client_secret,
            oauth_scope,
            model,
            temperature,
            api_timeout,
            accept_invalid_certs,
            request_token_limit,
            daily_token_limit,
            monthly_token_limit,
            warning_threshold,
            critical_threshold,
            save_dir,
            stats_file,
            format_prompt,
            poll_interval,
        })
    }

    pub fn limits(&self) -> Limits {
        Limits {
            request: self.request_token_limit,
            daily: self.daily_token_limit,
            monthly: self.monthly_token_limit,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            warning_percent: self.warning_threshold,
            critical_percent: self.critical_threshold,
        }
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_str(key).and_then(|s| s.trim().parse::<f64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
