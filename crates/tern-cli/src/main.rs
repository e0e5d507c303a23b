//! Tern CLI
//!
//! Consumer, provider and non-interactive provider front ends for the Tern
//! reactor.

mod config;
mod output;
mod provider;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tern_codec::{DirectoryRefresh, DirectoryRequest, LoginRequest, LoginRole};
use tern_reactor::{
    AcceptOptions, CallbackReturn, ConsumerRole, DictionaryDownloadMode, DispatchOptions,
    NiProviderRole, Reactor, ReactorError, Role,
};
use tern_transport::Server;
use tracing_subscriber::EnvFilter;

use config::Config;

/// Tern - connection reactor for market-data sessions
#[derive(Parser)]
#[command(name = "tern")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (default: ~/.config/tern/config.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect as a consumer and print every event as a JSON line
    Consume {
        /// Host to connect to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port or service name (overrides config)
        #[arg(long)]
        service: Option<String>,

        /// Download dictionaries after the directory
        #[arg(long)]
        dictionaries: bool,

        /// Stop after this many seconds (0 runs until the channel is down)
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Accept consumers and answer their administrative requests
    Provide {
        /// Listen address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,

        /// Stop after this many seconds (0 runs forever)
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Connect as a non-interactive provider and publish a directory
    NiProvide {
        /// Host to connect to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port or service name (overrides config)
        #[arg(long)]
        service: Option<String>,

        /// Stop after this many seconds (0 runs until the channel is down)
        #[arg(long, default_value_t = 0)]
        duration: u64,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::resolve(cli.config.as_deref())?;
    match &cli.command {
        Commands::Consume {
            host,
            service,
            dictionaries,
            ..
        } => {
            override_target(&mut config, host.as_deref(), service.as_deref());
            config.role.download_dictionaries |= *dictionaries;
        }
        Commands::NiProvide { host, service, .. } => {
            override_target(&mut config, host.as_deref(), service.as_deref());
        }
        Commands::Provide { bind, .. } => {
            if let Some(bind) = bind {
                config.server.listen_addr = bind.clone();
            }
        }
        Commands::Config => {}
    }
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Consume { duration, .. } => consume(&config, limit(duration)),
        Commands::Provide { duration, .. } => provide(&config, limit(duration)),
        Commands::NiProvide { duration, .. } => ni_provide(&config, limit(duration)),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn override_target(config: &mut Config, host: Option<&str>, service: Option<&str>) {
    if let Some(host) = host {
        config.connection.host = host.to_string();
    }
    if let Some(service) = service {
        config.connection.service = service.to_string();
    }
}

fn limit(secs: u64) -> Option<Instant> {
    (secs > 0).then(|| Instant::now() + Duration::from_secs(secs))
}

fn login_request(config: &Config, role: LoginRole) -> LoginRequest {
    let mut request = LoginRequest::new(config.role.login_stream_id, &config.role.user_name)
        .with_role(role);
    request.application_id = config.role.application_id.clone();
    request
}

/// Dispatch until `deadline`, or until `done` reports true
fn run(reactor: &Reactor, deadline: Option<Instant>, done: impl Fn() -> bool) -> anyhow::Result<()> {
    let opts = DispatchOptions::default();
    while !done() && deadline.is_none_or(|d| Instant::now() < d) {
        if reactor.wait(Duration::from_millis(200)) {
            reactor.dispatch(&opts)?;
        }
    }
    Ok(())
}

fn shutdown(reactor: &Reactor) -> anyhow::Result<()> {
    for channel in reactor.channels() {
        match reactor.close_channel(channel) {
            Ok(()) | Err(ReactorError::UnknownChannel(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    reactor.destroy()?;
    Ok(())
}

fn print_events(role: Role) -> Role {
    role.on_default_msg(|_, event| {
        println!("{}", output::msg_event(event, None));
        CallbackReturn::Success
    })
    .on_channel_event(|_, event| {
        println!("{}", output::channel_event(event));
        CallbackReturn::Success
    })
}

/// Connect as a consumer
fn consume(config: &Config, deadline: Option<Instant>) -> anyhow::Result<()> {
    let mut consumer = ConsumerRole::default()
        .with_login_request(login_request(config, LoginRole::Consumer))
        .on_login(|_, event| {
            println!("{}", output::msg_event(&event.base, Some(&event.rdm.clone().into())));
            CallbackReturn::Success
        })
        .on_directory(|_, event| {
            println!("{}", output::msg_event(&event.base, Some(&event.rdm.clone().into())));
            CallbackReturn::Success
        })
        .on_dictionary(|_, event| {
            println!("{}", output::msg_event(&event.base, Some(&event.rdm.clone().into())));
            CallbackReturn::Success
        });
    if config.role.directory_stream_id > 0 {
        consumer = consumer.with_directory_request(DirectoryRequest::new(
            config.role.directory_stream_id,
        ));
    }
    if config.role.download_dictionaries {
        consumer = consumer.with_dictionary_download(DictionaryDownloadMode::FirstAvailable);
    }

    let reactor = Reactor::new(config.reactor.clone())?;
    let channel = reactor.connect(&config.connect_options(), print_events(Role::consumer(consumer)))?;
    tracing::info!(
        "Consuming from {}:{} on channel {}",
        config.connection.host,
        config.connection.service,
        channel
    );

    run(&reactor, deadline, || {
        reactor
            .channel_info(channel)
            .map(|info| info.state == tern_reactor::SessionState::Down)
            .unwrap_or(true)
    })?;
    shutdown(&reactor)
}

/// Accept consumers as an interactive provider
fn provide(config: &Config, deadline: Option<Instant>) -> anyhow::Result<()> {
    let server = Server::bind(&config.bind_options()?)?;
    tracing::info!("Providing {:?} on {}", config.role.services, server.local_addr()?);

    let reactor = Reactor::new(config.reactor.clone())?;
    let role = provider::role(provider::services(&config.role.services));
    let opts = DispatchOptions::default();

    while deadline.is_none_or(|d| Instant::now() < d) {
        loop {
            match reactor.accept(&server, &AcceptOptions::default(), role.clone()) {
                Ok(channel) => tracing::info!("Accepted channel {}", channel),
                Err(ReactorError::NoPendingConnection) => break,
                Err(e) => return Err(e.into()),
            }
        }
        if reactor.wait(Duration::from_millis(50)) {
            reactor.dispatch(&opts)?;
        }
    }

    shutdown(&reactor)
}

/// Connect as a non-interactive provider
fn ni_provide(config: &Config, deadline: Option<Instant>) -> anyhow::Result<()> {
    let mut ni = NiProviderRole::default()
        .with_login_request(login_request(config, LoginRole::Provider));
    if !config.role.services.is_empty() {
        ni = ni.with_directory_refresh(DirectoryRefresh::publishing(
            -1,
            provider::services(&config.role.services),
        ));
    }

    let reactor = Reactor::new(config.reactor.clone())?;
    let channel = reactor.connect(&config.connect_options(), print_events(Role::ni_provider(ni)))?;
    tracing::info!("Publishing {:?} on channel {}", config.role.services, channel);

    run(&reactor, deadline, || {
        reactor
            .channel_info(channel)
            .map(|info| info.state == tern_reactor::SessionState::Down)
            .unwrap_or(true)
    })?;
    shutdown(&reactor)
}
