use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;

use apollo_passport::config::{resolve_layered, resolve_secret};
use apollo_passport::server::{AppState, create_router};
use apollo_passport::token::DEFAULT_TOKEN_TTL_SECS;
use apollo_passport::{
    ApolloPassport, ConfigSource, GraphqlOptions, MemoryUserStore, OptionsSource, PassportOptions,
    PassportSettings, TokenService,
};

const APP_NAME: &str = "apollo-passport";

/// Prefix of environment overrides, e.g. `APOLLO_PASSPORT__SERVER__PORT`.
const ENV_PREFIX: &str = "APOLLO_PASSPORT";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common)?;
    ctx.init_logging();
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Token { command } => handle_token(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Apollo Passport - authentication server for GraphQL APIs.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Config file, or a directory containing `config.toml`
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// More logging; repeat for trace
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,
    /// Format for printed configuration and claims
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    output: OutputFormat,
    /// Report file changes without writing them
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
    Yaml,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve(ServeCommand),
    /// Write a default config file with a fresh JWT secret
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Issue and inspect session tokens
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Bind address (overrides `server.host`)
    #[arg(long)]
    host: Option<String>,
    /// Port (overrides `server.port`)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration with the secret redacted
    Show,
    /// Print the config file path
    Path,
    /// Overwrite the config file with defaults and a new secret
    Reset,
}

#[derive(Debug, Subcommand)]
enum TokenCommand {
    /// Sign a token for a user id
    Issue(TokenIssueCommand),
    /// Verify a token and print its claims
    Verify(TokenVerifyCommand),
}

#[derive(Debug, Clone, Args)]
struct TokenIssueCommand {
    /// User id to put in the `userId` claim
    #[arg(long)]
    user_id: String,
    /// Optional `displayName` claim
    #[arg(long)]
    display_name: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct TokenVerifyCommand {
    /// The token to verify
    token: String,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = config_file_path(common.config.as_deref())?;
        if !config_file.exists() && !common.dry_run {
            write_default_config(&config_file)?;
        }
        let config = load_config(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    /// `log` records from the token and context paths are bridged into the
    /// tracing subscriber. If one is already installed, `env_logger` takes them.
    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.log_level();
        let directive = level.as_str().to_ascii_lowercase();
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("apollo_passport={directive},tower_http={directive}"))
        });

        let registry = tracing_subscriber::registry().with(filter);
        let installed = match self.common.log_format {
            LogFormat::Json => registry.with(fmt::layer().json().with_writer(io::stderr)).try_init(),
            LogFormat::Pretty => registry
                .with(
                    fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(io::stderr().is_terminal()),
                )
                .try_init(),
        };
        if installed.is_err() {
            env_logger::Builder::new()
                .filter_level(level)
                .try_init()
                .ok();
        }
    }

    fn log_level(&self) -> LevelFilter {
        if self.common.quiet {
            return LevelFilter::Error;
        }
        match self.common.verbose {
            0 => self.config.logging.level.parse().unwrap_or(LevelFilter::Info),
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn print<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let rendered = match self.common.output {
            OutputFormat::Text | OutputFormat::Json => {
                serde_json::to_string_pretty(value).context("rendering JSON")?
            }
            OutputFormat::Yaml => serde_yaml::to_string(value).context("rendering YAML")?,
        };
        println!("{}", rendered.trim_end());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    server: ServerConfig,
    passport: PassportSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
    /// Origins allowed by CORS. Empty means localhost only.
    allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            allowed_origins: Vec::new(),
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    let path = &ctx.config_file;
    if path.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        ));
    }
    if ctx.common.dry_run {
        info!("dry-run: would write {}", path.display());
        return Ok(());
    }
    write_default_config(path)?;
    info!("wrote {}", path.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let mut shown = ctx.config.clone();
            if shown.passport.jwt_secret.is_some() {
                shown.passport.jwt_secret = Some("<redacted>".to_string());
            }
            if ctx.common.output == OutputFormat::Text {
                let rendered = toml::to_string_pretty(&shown).context("rendering TOML")?;
                print!("{rendered}");
                return Ok(());
            }
            ctx.print(&shown)
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!("dry-run: would reset {}", ctx.config_file.display());
                return Ok(());
            }
            write_default_config(&ctx.config_file)
        }
    }
}

fn token_service(config: &AppConfig) -> Result<TokenService> {
    let secret = resolve_secret(config.passport.jwt_secret.as_deref())?
        .ok_or_else(|| anyhow!("passport.jwt_secret is not set"))?;
    let ttl = config.passport.token_ttl_secs.unwrap_or(DEFAULT_TOKEN_TTL_SECS);
    Ok(TokenService::new(&secret, chrono::Duration::seconds(ttl)))
}

fn handle_token(ctx: &RuntimeContext, command: TokenCommand) -> Result<()> {
    let tokens = token_service(&ctx.config)?;
    match command {
        TokenCommand::Issue(cmd) => {
            let mut props = Map::new();
            props.insert("userId".to_string(), Value::String(cmd.user_id));
            if let Some(name) = cmd.display_name {
                props.insert("displayName".to_string(), Value::String(name));
            }
            let token = tokens.sign(props).context("signing token")?;
            println!("{token}");
            Ok(())
        }
        TokenCommand::Verify(cmd) => {
            let claims = tokens
                .verify(&cmd.token)
                .map_err(|e| anyhow!("token rejected: {e}"))?;
            ctx.print(&claims)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);

    let mut options =
        PassportOptions::from_settings(&ctx.config.passport).db(Arc::new(MemoryUserStore::new()));
    if resolve_layered(
        options.root_url.as_deref(),
        &ConfigSource::default_root_url_sources(),
    )
    .is_none()
    {
        let fallback = format!("http://{host}:{port}/");
        warn!("No ROOT_URL configured, using {fallback}");
        options = options.root_url(fallback);
    }

    let mut passport = ApolloPassport::new(options).context("Invalid passport configuration")?;
    passport
        .use_module("local")
        .context("registering local strategy")?;
    info!(
        "Auth routes under {}/<provider>",
        passport.config().auth_url_root()
    );

    let state = AppState::new(
        Arc::new(passport),
        OptionsSource::fixed(GraphqlOptions::default()),
    )
    .with_allowed_origins(ctx.config.server.allowed_origins.clone());
    let app = create_router(state);

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await
        .context("running server")?;

    Ok(())
}

/// Defaults, then the TOML file, then `APOLLO_PASSPORT__*` variables.
/// `APOLLO_PASSPORT__SERVER__ALLOWED_ORIGINS` takes a comma-separated list.
fn load_config(path: &Path) -> Result<AppConfig> {
    Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("server.allowed_origins"),
        )
        .build()
        .and_then(|config| config.try_deserialize::<AppConfig>())
        .with_context(|| format!("loading config from {}", path.display()))
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let mut config = AppConfig::default();
    config.passport.jwt_secret = Some(PassportSettings::generate_jwt_secret());
    let body = toml::to_string_pretty(&config).context("rendering default config")?;
    fs::write(path, format!("# {APP_NAME} configuration\n\n{body}"))
        .with_context(|| format!("writing {}", path.display()))
}

/// `--config` may name a file or a directory; `~` and `$VARS` are expanded.
/// Without it the file lives under the platform config dir.
fn config_file_path(override_path: Option<&Path>) -> Result<PathBuf> {
    let Some(path) = override_path else {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .ok_or_else(|| anyhow!("unable to determine configuration directory"))?;
        return Ok(base.join(APP_NAME).join("config.toml"));
    };

    let text = path
        .to_str()
        .ok_or_else(|| anyhow!("config path is not valid UTF-8: {}", path.display()))?;
    let expanded = PathBuf::from(shellexpand::full(text).context("expanding config path")?.as_ref());
    if expanded.is_dir() {
        Ok(expanded.join("config.toml"))
    } else {
        Ok(expanded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(config: PathBuf) -> CommonOpts {
        CommonOpts {
            config: Some(config),
            quiet: true,
            verbose: 0,
            log_format: LogFormat::Pretty,
            output: OutputFormat::Text,
            dry_run: false,
        }
    }

    #[test]
    fn test_default_config_written_and_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RuntimeContext::new(common(dir.path().to_path_buf())).unwrap();

        assert_eq!(ctx.config_file, dir.path().join("config.toml"));
        let written = fs::read_to_string(&ctx.config_file).unwrap();
        assert!(written.starts_with("# apollo-passport configuration"));

        let secret = ctx.config.passport.jwt_secret.clone().expect("generated secret");
        assert_eq!(secret.len(), 64);
        assert_eq!(ctx.config.server.port, 4000);
        assert_eq!(ctx.config.logging.level, "info");
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = common(dir.path().to_path_buf());
        opts.dry_run = true;

        let ctx = RuntimeContext::new(opts).unwrap();
        assert!(!ctx.config_file.exists());
        assert!(ctx.config.passport.jwt_secret.is_none());
    }

    #[test]
    fn test_config_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            r#"
[server]
port = 9999
allowed_origins = ["https://app.example.com"]

[passport]
jwt_secret = "file-secret-that-is-at-least-32-characters"
root_url = "https://app.example.com"
auth_path = "/auth"
"#,
        )
        .unwrap();

        let ctx = RuntimeContext::new(common(path)).unwrap();
        assert_eq!(ctx.config.server.port, 9999);
        assert_eq!(ctx.config.server.allowed_origins, ["https://app.example.com"]);
        assert_eq!(ctx.config.passport.auth_path.as_deref(), Some("/auth"));

        let tokens = token_service(&ctx.config).unwrap();
        let mut props = Map::new();
        props.insert("userId".to_string(), Value::from("u1"));
        let token = tokens.sign(props).unwrap();
        assert_eq!(
            tokens.verify(&token).unwrap().user_id(),
            Some(&Value::from("u1"))
        );
    }

    #[test]
    fn test_quiet_overrides_config_level() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = RuntimeContext::new(common(dir.path().to_path_buf())).unwrap();
        assert_eq!(ctx.log_level(), LevelFilter::Error);

        let mut opts = common(dir.path().to_path_buf());
        opts.quiet = false;
        opts.verbose = 2;
        let ctx = RuntimeContext::new(opts).unwrap();
        assert_eq!(ctx.log_level(), LevelFilter::Trace);
    }

    #[test]
    fn test_token_service_requires_secret() {
        let config = AppConfig::default();
        assert!(token_service(&config).is_err());
    }

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from([
            APP_NAME,
            "--output",
            "yaml",
            "token",
            "issue",
            "--user-id",
            "u1",
            "--display-name",
            "Ada",
        ])
        .unwrap();
        assert_eq!(cli.common.output, OutputFormat::Yaml);
        assert!(matches!(
            cli.command,
            Command::Token {
                command: TokenCommand::Issue(TokenIssueCommand { ref user_id, .. })
            } if user_id == "u1"
        ));
    }
}
