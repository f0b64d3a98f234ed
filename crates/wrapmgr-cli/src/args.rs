use anyhow::{Context, Result};
use argh::FromArgs;
use std::str::FromStr;
use std::time::Duration;
use wrapmgr_manager::{ManagerConfig, MaintenanceConfig};

/// Default RPC address clients connect to.
pub const DEFAULT_ADDR: &str = "127.0.0.1:18923";

#[derive(FromArgs, Debug)]
/// wrapmgr - decryption worker pool manager
pub struct Cli {
    #[argh(subcommand)]
    pub command: Commands,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Serve(ServeArgs),
    Status(StatusArgs),
    M3u8(M3u8Args),
    Lyrics(LyricsArgs),
    Login(LoginArgs),
    Logout(LogoutArgs),
}

// Every option falls back to a WRAPMGR_* environment variable, then to the
// built-in default.
#[derive(FromArgs, Debug, Default)]
#[argh(subcommand, name = "serve")]
/// run the wrapper manager
pub struct ServeArgs {
    /// rpc bind address [WRAPMGR_BIND, default 127.0.0.1:18923]
    #[argh(option, short = 'b')]
    pub bind: Option<String>,

    /// admin HTTP bind address, disabled when unset [WRAPMGR_ADMIN_BIND]
    #[argh(option, long = "admin-bind")]
    pub admin_bind: Option<String>,

    /// worker host [WRAPMGR_WORKER_HOST, default 127.0.0.1]
    #[argh(option, long = "worker-host")]
    pub worker_host: Option<String>,

    /// worker decrypt port [WRAPMGR_DECRYPT_PORT, default 10020]
    #[argh(option, long = "decrypt-port")]
    pub decrypt_port: Option<u16>,

    /// worker M3U8 port [WRAPMGR_M3U8_PORT, default 20020]
    #[argh(option, long = "m3u8-port")]
    pub m3u8_port: Option<u16>,

    /// worker account port [WRAPMGR_ACCOUNT_PORT, default 30020]
    #[argh(option, long = "account-port")]
    pub account_port: Option<u16>,

    /// seconds between health checks [WRAPMGR_HEALTH_INTERVAL, default 30]
    #[argh(option, long = "health-interval")]
    pub health_interval_secs: Option<u64>,

    /// disable health checks and automatic restarts
    #[argh(switch, long = "disable-health-check")]
    pub disable_health_check: bool,

    /// remove instances idle for this many seconds [WRAPMGR_IDLE_LIMIT]
    #[argh(option, long = "idle-limit")]
    pub idle_limit_secs: Option<u64>,

    /// region given to accounts signed in over RPC [WRAPMGR_REGION, default us]
    #[argh(option, long = "region")]
    pub region: Option<String>,

    /// catalog API base URL [WRAPMGR_CATALOG_URL]
    #[argh(option, long = "catalog-url")]
    pub catalog_url: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "status")]
/// show pool status as JSON
pub struct StatusArgs {
    /// manager RPC address [WRAPMGR_ADDR, default 127.0.0.1:18923]
    #[argh(option, short = 'a')]
    pub addr: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "m3u8")]
/// resolve the playlist URL of a song
pub struct M3u8Args {
    /// song id
    #[argh(positional)]
    pub adam_id: String,

    /// manager RPC address [WRAPMGR_ADDR, default 127.0.0.1:18923]
    #[argh(option, short = 'a')]
    pub addr: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "lyrics")]
/// print the lyrics TTML of a song
pub struct LyricsArgs {
    /// song id
    #[argh(positional)]
    pub adam_id: String,

    /// lyrics language, e.g. en-US
    #[argh(option, short = 'l', default = "String::new()")]
    pub language: String,

    /// preferred storefront region
    #[argh(option, short = 'r', default = "String::new()")]
    pub region: String,

    /// manager RPC address [WRAPMGR_ADDR, default 127.0.0.1:18923]
    #[argh(option, short = 'a')]
    pub addr: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "login")]
/// sign an account in, prompting for a two-factor code if asked
pub struct LoginArgs {
    /// account name
    #[argh(positional)]
    pub username: String,

    /// account password [WRAPMGR_PASSWORD]
    #[argh(option, short = 'p')]
    pub password: Option<String>,

    /// manager RPC address [WRAPMGR_ADDR, default 127.0.0.1:18923]
    #[argh(option, short = 'a')]
    pub addr: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "logout")]
/// take an account offline
pub struct LogoutArgs {
    /// account name
    #[argh(positional)]
    pub username: String,

    /// manager RPC address [WRAPMGR_ADDR, default 127.0.0.1:18923]
    #[argh(option, short = 'a')]
    pub addr: Option<String>,
}

/// Looks a variable up in the process environment.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Flag value, else the environment variable.
fn pick<E>(flag: Option<String>, var: &str, env: &E) -> Option<String>
where
    E: Fn(&str) -> Option<String>,
{
    flag.or_else(|| env(var))
}

/// Typed flag value, else the parsed environment variable.
fn pick_parsed<T, E>(flag: Option<T>, var: &str, env: &E) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    E: Fn(&str) -> Option<String>,
{
    if flag.is_some() {
        return Ok(flag);
    }
    env(var)
        .map(|raw| raw.parse::<T>().with_context(|| format!("invalid {}: {}", var, raw)))
        .transpose()
}

/// RPC address for a client command.
pub fn resolve_addr<E>(flag: Option<String>, env: &E) -> String
where
    E: Fn(&str) -> Option<String>,
{
    pick(flag, "WRAPMGR_ADDR", env).unwrap_or_else(|| DEFAULT_ADDR.to_string())
}

impl ServeArgs {
    /// Builds the manager configuration from flags, then `env`, then defaults.
    pub fn to_config<E>(&self, env: &E) -> Result<ManagerConfig>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut config = ManagerConfig::default();

        if let Some(bind) = pick(self.bind.clone(), "WRAPMGR_BIND", env) {
            config.rpc_bind = bind;
        }
        config.admin_bind = pick(self.admin_bind.clone(), "WRAPMGR_ADMIN_BIND", env);

        if let Some(host) = pick(self.worker_host.clone(), "WRAPMGR_WORKER_HOST", env) {
            config.proxy.host = host;
        }
        if let Some(port) = pick_parsed(self.decrypt_port, "WRAPMGR_DECRYPT_PORT", env)? {
            config.proxy.decrypt_port = port;
        }
        if let Some(port) = pick_parsed(self.m3u8_port, "WRAPMGR_M3U8_PORT", env)? {
            config.proxy.m3u8_port = port;
        }
        if let Some(port) = pick_parsed(self.account_port, "WRAPMGR_ACCOUNT_PORT", env)? {
            config.proxy.account_port = port;
        }

        if let Some(secs) =
            pick_parsed(self.health_interval_secs, "WRAPMGR_HEALTH_INTERVAL", env)?
        {
            anyhow::ensure!(secs > 0, "health interval must be at least 1 second");
            config.health.check_interval = Duration::from_secs(secs);
        }
        config.health_enabled = !self.disable_health_check;

        let idle_limit = pick_parsed(self.idle_limit_secs, "WRAPMGR_IDLE_LIMIT", env)?;
        config.maintenance = MaintenanceConfig {
            instance_idle_limit: idle_limit.map(Duration::from_secs),
            ..config.maintenance
        };

        if let Some(region) = pick(self.region.clone(), "WRAPMGR_REGION", env) {
            config.login.default_region = region;
        }
        if let Some(url) = pick(self.catalog_url.clone(), "WRAPMGR_CATALOG_URL", env) {
            config.catalog.base_url = url;
        }

        Ok(config)
    }
}
