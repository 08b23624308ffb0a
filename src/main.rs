use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use offgrid::cache::{CacheStore, SqliteStorage};
use offgrid::config::Config;
use offgrid::control::{self, ControlMessage};
use offgrid::http::{FetchMode, Request, Response};
use offgrid::interceptor::{Event, Interceptor, Outcome};
use offgrid::lifecycle::LifecycleState;
use offgrid::transport::{HttpTransport, Transport};

#[derive(Parser, Debug)]
#[command(name = "offgrid")]
#[command(about = "Offline-first request interception with versioned caches")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offgrid/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest and activate this version
  Install,
  /// Delete stale generations for an installed version
  Activate,
  /// Route one request through the interceptor and write the body to stdout
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Accept header to send (use text/html to allow the offline document)
    #[arg(long)]
    accept: Option<String>,
  },
  /// Post a JSON control message, e.g. '{"type":"FORCE_ACTIVATE"}'
  Message { json: String },
  /// Fetch URLs into the runtime cache
  CacheUrls {
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// List stored generations
  Generations,
}

type App = Interceptor<SqliteStorage, HttpTransport>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = offgrid::logging::init(&config.log);

  let storage = SqliteStorage::open(&config.database_path()?)?;
  let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
  let app = Interceptor::new(&config, CacheStore::new(storage), Arc::clone(&transport))?;

  match args.command {
    Command::Install => install(&app).await?,
    Command::Activate => activate(&app).await?,
    Command::Fetch {
      url,
      method,
      accept,
    } => {
      let mut request = Request::parse(&method, config.resolve(&url)?.as_str())?;
      if let Some(accept) = accept {
        request = request.with_header("accept", accept);
      }
      fetch(&app, transport.as_ref(), request).await?;
    }
    Command::Message { json } => {
      let payload: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("invalid message JSON: {}", e))?;
      app.start().await?;

      let (sender, inbox) = control::channel();
      if !sender.post(&payload) {
        eprintln!("message ignored");
      }
      drop(sender);
      app.serve_messages(inbox).await;
    }
    Command::CacheUrls { urls } => {
      app.start().await?;
      if let Outcome::Cached(report) = app
        .dispatch(Event::Message(ControlMessage::CacheUrls { urls }))
        .await?
      {
        for url in &report.cached {
          println!("cached  {}", url);
        }
        for (url, reason) in &report.failed {
          println!("failed  {} ({})", url, reason);
        }
      }
    }
    Command::Generations => {
      let current = [
        config.precache_generation().name(),
        config.runtime_generation().name(),
      ];
      for name in app.store().generation_names().await? {
        let entries = app.store().entry_urls(&name).await?.len();
        let marker = if current.contains(&name) { "*" } else { " " };
        println!("{} {:<40} {} entries", marker, name, entries);
      }
    }
  }

  app.settle().await;
  Ok(())
}

async fn install(app: &App) -> Result<()> {
  if let Outcome::Installed { assets } = app.dispatch(Event::Install).await? {
    println!("precached {} assets", assets);
  }
  if app.lifecycle().ready_to_activate() {
    activate(app).await?;
  }
  Ok(())
}

async fn activate(app: &App) -> Result<()> {
  if app.lifecycle().resume().await? != LifecycleState::Installed {
    return Err(eyre!("version {} is not installed", app.lifecycle().version()));
  }

  if let Outcome::Activated(report) = app.dispatch(Event::Activate).await? {
    for name in &report.deleted {
      println!("deleted {}", name);
    }
    println!("active: {}", app.lifecycle().version());
  }
  Ok(())
}

async fn fetch(app: &App, transport: &HttpTransport, request: Request) -> Result<()> {
  app.start().await?;

  let response = match app.dispatch(Event::Fetch(request.clone())).await? {
    Outcome::Served(served) => {
      eprintln!("{} ({:?})", served.response.status(), served.source);
      served.response
    }
    _ => {
      let response = transport.fetch(&request, FetchMode::Default).await?;
      eprintln!("{} (passthrough)", response.status());
      response
    }
  };

  write_body(response)
}

fn write_body(response: Response) -> Result<()> {
  let mut stdout = std::io::stdout().lock();
  stdout.write_all(&response.into_body())?;
  stdout.flush()?;
  Ok(())
}
