use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use hubcache::cache::{CacheLayer, CacheStorage, NoopStorage, RefreshPolicy, SqliteStorage};
use hubcache::category::{CategoryFilter, PayloadNormalizer};
use hubcache::config::{Config, ResourceConfig};
use hubcache::http::{CachingClient, HttpClient, HttpRequest, InterceptRule, ReqwestClient};
use hubcache::logging;
use hubcache::scheduler::{Fetcher, RefreshScheduler};

type Storage = Arc<dyn CacheStorage>;
type Client = CachingClient<ReqwestClient, Storage>;

#[derive(Parser, Debug)]
#[command(name = "hubcache")]
#[command(about = "Stale-while-revalidate cache for content hub APIs")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hubcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Refresh every resource, then keep them warm until Ctrl-C
  Warm,
  /// Print a resource's payload
  Get {
    key: String,
    /// Bypass the cache and fetch now
    #[arg(long)]
    refresh: bool,
    /// Only print records in this category
    #[arg(long)]
    category: Option<String>,
  },
  /// Print record counts per category for a resource
  Counts { key: String },
  /// Remove cached entries
  Clear {
    #[arg(required_unless_present = "all")]
    key: Option<String>,
    #[arg(long, conflicts_with = "key")]
    all: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let storage: Storage = if config.cache.enabled {
    let storage = match &config.cache.path {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open()?,
    };
    Arc::new(storage)
  } else {
    Arc::new(NoopStorage::default())
  };
  let layer = CacheLayer::new(storage).with_policy(RefreshPolicy::from(&config.cache));

  let vocabulary = Arc::new(config.vocabulary.build()?);
  let normalizer = PayloadNormalizer::new(Arc::clone(&vocabulary), &config.vocabulary.field)
    .with_id_field(&config.vocabulary.id_field);

  let client = CachingClient::new(
    ReqwestClient::new()?,
    layer.clone(),
    InterceptRule::from(&config.intercept),
  )
  .with_normalizer(normalizer.clone());

  match args.command {
    Command::Warm => warm(&config, &client, layer).await,
    Command::Get {
      key,
      refresh,
      category,
    } => {
      let payload = get(&client, config.resource(&key)?, refresh).await?;
      match category {
        Some(selected) => {
          let records = normalizer.records(&payload);
          let matching =
            CategoryFilter::new(&vocabulary).filter(&records, Some(selected.as_str()));
          print_json(&serde_json::to_value(matching)?)
        }
        None => print_json(&payload),
      }
    }
    Command::Counts { key } => {
      let payload = get(&client, config.resource(&key)?, false).await?;
      let records = normalizer.records(&payload);
      let counts = CategoryFilter::new(&vocabulary).counts(&records);
      for entry in counts.iter() {
        println!("{}\t{}", entry.category, entry.count);
      }
      Ok(())
    }
    Command::Clear { key, all } => {
      if all {
        layer.clear_all()?;
        info!("Cleared all cache entries");
        return Ok(());
      }

      let key = key.ok_or_else(|| eyre!("Nothing to clear"))?;
      let request = HttpRequest::get(&config.resource(&key)?.url)?;
      layer.clear(&client.cache_key(&request))?;
      info!(resource = %key, "Cleared cache entry");
      Ok(())
    }
  }
}

/// Refresh everything once, then run the scheduler until interrupted.
async fn warm(config: &Config, client: &Client, layer: CacheLayer<Storage>) -> Result<()> {
  let mut scheduler = RefreshScheduler::from_config(layer, &config.cache);

  for resource in &config.resources {
    let request = HttpRequest::get(&resource.url)?;
    let key = client.cache_key(&request);
    let fetcher: Fetcher = {
      let client = client.clone();
      Arc::new(move || client.fetch_payload(&request))
    };

    if resource.privileged {
      scheduler.register_privileged(&key, fetcher)?;
    } else {
      scheduler.register(&key, fetcher)?;
    }
    info!(resource = %resource.key, key = %key, "Registered resource");
  }

  for (key, result) in scheduler.refresh_all().await {
    if let Err(error) = result {
      warn!(key = %key, %error, "Initial refresh failed");
    }
  }

  scheduler.start();
  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
  scheduler.stop();

  Ok(())
}

/// Fetch a resource through the caching client, exactly as any caller would.
async fn get(client: &Client, resource: &ResourceConfig, refresh: bool) -> Result<Value> {
  let mut request = HttpRequest::get(&resource.url)?;
  if refresh {
    request = request.with_query(&client.rule().refresh_param, "1");
  }
  let key = client.cache_key(&request);

  let response = if resource.privileged {
    let privileged = client.clone().privileged();
    privileged.send(request).await?
  } else {
    client.send(request).await?
  };

  if !response.is_success() {
    return Err(eyre!("{} returned {}", resource.url, response.status()));
  }
  info!(
    resource = %resource.key,
    cache = response.cache_status().unwrap_or("BYPASS"),
    "Fetched resource"
  );

  // A stale read leaves a refresh running; let it land before the process exits
  client.cache().settle(&key).await;
  response.json()
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
