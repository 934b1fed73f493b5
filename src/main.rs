use anyhow::{anyhow, bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yaolist_objstore::config;
use yaolist_objstore::storage::{Operation, StorageBindings, TransferConfig};
use yaolist_objstore::transfer::{TransferOrchestrator, UploadSource};
use yaolist_objstore::{build_registry, ObjectReference};

const USAGE: &str = "usage:
  yaolist-objstore presign <base> <relative> <name> <read|write> [ttl_secs]
  yaolist-objstore transfer-config <base> <relative> <name> <read|write> [content_length]
  yaolist-objstore upload <transfer_config.json> <file>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration / 加载配置
    let app_config = config::load_config().map_err(|e| anyhow!(e))?;

    // Initialize tracing / 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| app_config.log_filter.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let registry = build_registry(&app_config).context("binding storage providers")?;
    let bindings = registry.resolve().context("resolving storage providers")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let output = match args.first().map(String::as_str) {
        Some("presign") => presign(&bindings, &args[1..], app_config.default_ttl_secs)?,
        Some("transfer-config") => transfer_config(&bindings, &args[1..]).await?,
        Some("upload") => upload(&args[1..]).await?,
        _ => bail!("{}", USAGE),
    };
    println!("{}", output);
    Ok(())
}

/// `<base> <relative> <name> <read|write>` / 解析对象与操作
fn parse_target(args: &[String]) -> anyhow::Result<(ObjectReference, Operation)> {
    let [base, relative, name, operation, ..] = args else {
        bail!("{}", USAGE);
    };
    let reference = ObjectReference::new(base.as_str(), relative.as_str(), name.as_str());
    reference.validate()?;
    let operation: Operation = operation.parse().map_err(|e: String| anyhow!(e))?;
    Ok((reference, operation))
}

fn presign(bindings: &StorageBindings, args: &[String], default_ttl: u64) -> anyhow::Result<String> {
    let (reference, operation) = parse_target(args)?;
    let ttl = match args.get(4) {
        Some(ttl) => ttl.parse::<u64>().with_context(|| format!("invalid ttl {}", ttl))?,
        None => default_ttl,
    };
    let authorization = bindings
        .presigned_url_provider()?
        .issue(&reference, operation, Duration::from_secs(ttl))?;
    tracing::info!("Issued {} grant for {} until {}", operation.as_str(), reference, authorization.expires_at);
    Ok(serde_json::to_string_pretty(&authorization)?)
}

async fn transfer_config(bindings: &StorageBindings, args: &[String]) -> anyhow::Result<String> {
    let (reference, operation) = parse_target(args)?;
    let provider = bindings.client_storage()?;
    let config = match (operation, args.get(4)) {
        (Operation::Write, Some(length)) => {
            let length = length
                .parse::<u64>()
                .with_context(|| format!("invalid content length {}", length))?;
            provider.get_upload_config(&reference, length).await?
        }
        _ => provider.get_config(&reference, operation).await?,
    };
    Ok(serde_json::to_string_pretty(&config)?)
}

/// Upload a file with a previously issued transfer config / 使用传输配置上传文件
async fn upload(args: &[String]) -> anyhow::Result<String> {
    let [config_path, file_path, ..] = args else {
        bail!("{}", USAGE);
    };
    let raw = tokio::fs::read_to_string(config_path)
        .await
        .with_context(|| format!("reading {}", config_path))?;
    let config: TransferConfig = serde_json::from_str(&raw).context("parsing transfer config")?;
    let file = tokio::fs::File::open(file_path)
        .await
        .with_context(|| format!("opening {}", file_path))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling upload");
                cancel.cancel();
            }
        });
    }

    let orchestrator = TransferOrchestrator::new().with_progress(Arc::new(|completed: u64, read: u64| {
        tracing::info!("Uploaded {} bytes ({} read)", completed, read);
    }));
    let report = orchestrator
        .upload(&config, UploadSource::from_reader(file), cancel)
        .await?;
    Ok(serde_json::to_string_pretty(&serde_json::json!({
        "parts": report.parts,
        "bytes": report.bytes,
    }))?)
}
