use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Result, eyre};
use futures_util::future::join_all;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use imgpipe::application::{ImageDispatcher, TaskFactory};
use imgpipe::domain::entities::{ImagePayload, LoadRequest, LoadedImage, WorkHandle};
use imgpipe::domain::errors::LoadFailure;
use imgpipe::domain::ports::ImageTarget;
use imgpipe::infrastructure::config::parse_source;
use imgpipe::infrastructure::{AppConfig, CliArgs, Command, ImageService, StorageManager};

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    if let Some(log_path) = &config.log_path {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false);

        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .init();

        info!(path = %log_path.display(), "Logging initialized");
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}

/// Prints loaded images to stdout.
struct ConsoleTarget {
    source: String,
}

impl ImageTarget for ConsoleTarget {
    fn set_image(&self, image: &LoadedImage) {
        match &image.payload {
            ImagePayload::Decoded(decoded) => println!(
                "{}: {}x{} from {} [{}]",
                self.source,
                decoded.width(),
                decoded.height(),
                image.origin,
                image.key
            ),
            ImagePayload::Encoded(bytes) => println!(
                "{}: {} bytes from {} [{}]",
                self.source,
                bytes.len(),
                image.origin,
                image.key
            ),
        }
    }

    fn set_empty(&self) {
        println!("{}: nothing to load", self.source);
    }
}

fn report(source: &str, outcome: &Result<Option<WorkHandle>, LoadFailure>) -> bool {
    match outcome {
        Ok(Some(work)) => {
            info!(source = source, key = %work.key(), "Load finished");
            true
        }
        Ok(None) => {
            println!("{source}: skipped");
            true
        }
        Err(failure) => {
            eprintln!("{source}: {failure}");
            false
        }
    }
}

fn summarize(outcomes: &[bool]) -> Result<()> {
    let failed = outcomes.iter().filter(|ok| !**ok).count();
    if failed == 0 {
        Ok(())
    } else {
        Err(eyre!("{failed} of {} loads failed", outcomes.len()))
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let storage = StorageManager::new()?;
    let mut config = storage.load_config(args.config.as_deref())?;
    config.merge_with_args(&args);

    init_logging(&config)?;
    info!(version = imgpipe::VERSION, "Starting {}", imgpipe::NAME);

    let service = ImageService::from_config(config.engine.clone()).await?;
    let factory = TaskFactory::new(config.defaults.priority, config.defaults.cache);
    let dispatcher = ImageDispatcher::new(Arc::new(service.clone()), factory);
    let dispatcher = &dispatcher;

    match args.command {
        Command::Load(load) => {
            let loads = load.requests().into_iter().zip(&load.sources).map(
                |(request, source)| async move {
                    let target: Arc<dyn ImageTarget> = Arc::new(ConsoleTarget {
                        source: source.clone(),
                    });
                    let outcome = dispatcher.load_into_async(request, &target).await;
                    report(source, &outcome)
                },
            );
            summarize(&join_all(loads).await)
        }
        Command::Preload(load) => {
            let loads = load.requests().into_iter().zip(&load.sources).map(
                |(request, source)| async move {
                    let outcome = dispatcher.preload_async(request).await;
                    if matches!(outcome, Ok(Some(_))) {
                        println!("{source}: cached");
                    }
                    report(source, &outcome)
                },
            );
            summarize(&join_all(loads).await)
        }
        Command::Download { sources, priority } => {
            let loads = sources.iter().map(|source| async move {
                let mut request = LoadRequest::new(parse_source(source));
                if let Some(priority) = priority {
                    request = request.with_priority(priority);
                }
                let outcome = dispatcher.download_only_async(request).await;
                if matches!(outcome, Ok(Some(_))) {
                    println!("{source}: downloaded");
                }
                report(source, &outcome)
            });
            summarize(&join_all(loads).await)
        }
        Command::Invalidate {
            sources,
            tier,
            transform,
        } => {
            for source in &sources {
                let request = transform.apply(LoadRequest::new(parse_source(source)));
                dispatcher.invalidate(request, tier).await?;
                println!("{source}: invalidated ({tier})");
            }
            Ok(())
        }
        Command::Clear { tier } => {
            service.clear(tier).await?;
            println!("Cleared {tier} cache");
            Ok(())
        }
        Command::Stats { json } => {
            let stats = service.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{stats}");
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    run(CliArgs::parse()).await
}
