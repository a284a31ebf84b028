use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stickersync::cache::{collections, SqliteStore};
use stickersync::config::Config;
use stickersync::connectivity::{spawn_probe, ConnectivityMonitor};
use stickersync::model::{AlbumSummary, Asset, ProfileUpdate, Sticker};
use stickersync::remote::{RemoteEndpoint, RestRemote};
use stickersync::sync::{SyncOrchestrator, SyncSettings, WriteOutcome};

type Orchestrator = SyncOrchestrator<SqliteStore, RestRemote>;

#[derive(Parser, Debug)]
#[command(name = "stickersync")]
#[command(about = "Offline-first sticker album client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stickersync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Start with connectivity forced off
  #[arg(long)]
  offline: bool,

  /// Keep the cache and queue in memory only
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show an album (yours by default)
  Album { owner: Option<String> },
  /// Mark a sticker as collected
  Collect {
    id: u32,
    #[arg(short, long)]
    notes: Option<String>,
  },
  /// Mark a sticker as not collected
  Remove { id: u32 },
  /// Attach a photo to a sticker
  Photo { id: u32, file: PathBuf },
  /// Show a profile (yours by default)
  Profile { user: Option<String> },
  /// Change your username
  Rename { username: String },
  /// List your connections
  Friends { owner: Option<String> },
  /// List writes waiting to be synced
  Pending,
  /// Replay queued writes now
  Sync,
  /// Drop cached data (everything by default)
  Clear { collection: Option<String> },
  /// Keep syncing in the background until interrupted
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_logging()?;

  let config = Config::load(args.config.as_deref())?;
  let user_id = config.user_id.clone();

  let mut remote = RestRemote::new(&config.remote)?;
  if let Some(token) = Config::get_access_token() {
    remote = remote.with_access_token(token);
  }

  let store = match (&config.cache.path, args.ephemeral) {
    (_, true) => SqliteStore::in_memory(),
    (Some(path), false) => SqliteStore::at(path),
    (None, false) => SqliteStore::open_default()?,
  };

  let connectivity = ConnectivityMonitor::new(!args.offline);
  if !args.offline {
    let online = match remote.health().await {
      Ok(()) => true,
      Err(e) => !e.is_transient(),
    };
    connectivity.set_online(online);
  }

  let orchestrator = SyncOrchestrator::from_store(
    store,
    remote,
    connectivity,
    SyncSettings::from_config(&config),
  );

  let me = || {
    user_id
      .clone()
      .ok_or_else(|| eyre!("No user id. Set user_id in the config file."))
  };

  match args.command {
    Command::Album { owner } => {
      let me = me()?;
      let result = match owner {
        Some(friend) if friend != me => {
          let album = orchestrator.get_connection_entities(&me, &friend).await;
          print_album(&album);
          None
        }
        _ => Some(orchestrator.load_entities(&me).await),
      };
      if let Some(result) = result {
        print_album(&result.data);
        println!("source: {:?}", result.source);
      }
    }
    Command::Collect { id, notes } => {
      let mut sticker = Sticker::collected(id);
      if let Some(notes) = notes {
        sticker = sticker.with_notes(notes);
      }
      report(orchestrator.update_entity(&me()?, sticker).await);
    }
    Command::Remove { id } => {
      report(orchestrator.delete_entity(&me()?, id).await);
    }
    Command::Photo { id, file } => {
      let asset = read_asset(&file)?;
      report(orchestrator.upload_asset(&me()?, id, asset).await);
    }
    Command::Profile { user } => {
      let user = match user {
        Some(user) => user,
        None => me()?,
      };
      match orchestrator.get_profile(&user).await {
        Some(profile) => {
          println!("{} ({})", profile.username, profile.id);
          if let Some(name) = profile.full_name {
            println!("name: {}", name);
          }
        }
        None => println!("No profile found for {}", user),
      }
    }
    Command::Rename { username } => {
      let update = ProfileUpdate {
        username: Some(username),
        ..Default::default()
      };
      report(orchestrator.update_profile(&me()?, update).await);
    }
    Command::Friends { owner } => {
      let owner = match owner {
        Some(owner) => owner,
        None => me()?,
      };
      let friends = orchestrator.get_connections(&owner).await;
      if friends.is_empty() {
        println!("No connections");
      }
      for friend in friends {
        println!("{}\t{}", friend.id, friend.username);
      }
    }
    Command::Pending => {
      let pending = orchestrator.queue().pending()?;
      if pending.is_empty() {
        println!("Nothing waiting to sync");
      }
      for m in pending {
        println!("#{}\t{}\t{}", m.id, m.kind().as_str(), m.stream_key());
      }
    }
    Command::Sync => sync_once(&orchestrator).await?,
    Command::Clear { collection } => {
      let targets: Vec<&str> = match collection.as_deref() {
        Some(name) => vec![collections::ALL
          .iter()
          .copied()
          .find(|c| *c == name)
          .ok_or_else(|| eyre!("Unknown collection: {}", name))?],
        None => collections::ALL.to_vec(),
      };
      for collection in targets {
        orchestrator.cache().clear(collection)?;
        println!("Cleared {}", collection);
      }
    }
    Command::Watch => watch(&orchestrator, &config).await?,
  }

  orchestrator.wait_background().await;
  Ok(())
}

fn init_logging() -> Result<WorkerGuard> {
  let log_dir = SqliteStore::default_path()?
    .parent()
    .map(Path::to_path_buf)
    .ok_or_else(|| eyre!("Could not determine log directory"))?;
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(&log_dir, "stickersync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(EnvFilter::try_from_env("STICKERSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
    .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
    .init();

  Ok(guard)
}

fn read_asset(path: &Path) -> Result<Asset> {
  let bytes = std::fs::read(path)
    .map_err(|e| eyre!("Failed to read photo {}: {}", path.display(), e))?;
  let content_type = match path.extension().and_then(|e| e.to_str()) {
    Some("png") => "image/png",
    Some("webp") => "image/webp",
    _ => "image/jpeg",
  };
  Ok(Asset {
    content_type: content_type.to_string(),
    bytes,
  })
}

fn print_album(album: &[Sticker]) {
  let summary = AlbumSummary::of(album);
  println!(
    "{}/{} collected, {} missing",
    summary.collected, summary.total, summary.missing
  );
  for sticker in album.iter().filter(|s| s.collected) {
    let mut line = format!("#{}", sticker.id);
    if let Some(notes) = &sticker.notes {
      line.push_str(&format!("  {}", notes));
    }
    if sticker.photo_url.is_some() {
      line.push_str("  [photo]");
    }
    println!("{}", line);
  }
}

fn report(outcome: WriteOutcome) {
  match outcome {
    WriteOutcome::Synced => println!("Saved"),
    WriteOutcome::Queued => println!("Saved locally, will sync when online"),
    WriteOutcome::Rejected { reason } => println!("Rejected: {}", reason),
    WriteOutcome::Failed { reason } => println!("Not saved: {}", reason),
  }
}

async fn sync_once(orchestrator: &Orchestrator) -> Result<()> {
  if !orchestrator.is_online() {
    println!("Offline, {} writes waiting", orchestrator.queue().len()?);
    return Ok(());
  }
  let report = orchestrator.sync_now().await?;
  println!(
    "applied {}, rejected {}, still queued {}",
    report.applied,
    report.rejected.len(),
    report.deferred
  );
  for rejected in report.rejected {
    println!(
      "  dropped {} #{}: {}",
      rejected.mutation.kind().as_str(),
      rejected.mutation.id,
      rejected.reason
    );
  }
  Ok(())
}

async fn watch(orchestrator: &Orchestrator, config: &Config) -> Result<()> {
  let probe = spawn_probe(
    orchestrator.connectivity().clone(),
    Arc::clone(orchestrator.remote()),
    Duration::from_secs(config.sync.probe_interval_secs),
  );
  let notifier = orchestrator.on_connectivity_change(|online| {
    println!("{}", if online { "online" } else { "offline" });
  });
  let sync = orchestrator.spawn_auto_sync();

  println!(
    "Watching ({}), Ctrl-C to stop",
    if orchestrator.is_online() { "online" } else { "offline" }
  );
  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  probe.abort();
  notifier.abort();
  sync.abort();
  Ok(())
}
