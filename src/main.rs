use std::env;
use std::path::Path;
use std::sync::Arc;

use modtrans::{
    AppConfig, EventSender, GeminiClient, ProjectStore, RedbStore, TranslationService,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("modtrans=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: modtrans <project.redb> [row-id ...]");
        std::process::exit(2);
    }

    let config = AppConfig::load_or_default("modtrans.toml")?;
    let store = Arc::new(RedbStore::open(Path::new(&args[1]))?);
    let client = Arc::new(GeminiClient::new(&config.model)?);
    let service = TranslationService::new(store.clone(), client, config);

    let ids: Vec<i64> = if args.len() > 2 {
        args[2..]
            .iter()
            .map(|raw| raw.parse::<i64>())
            .collect::<Result<_, _>>()?
    } else {
        store
            .all_rows()
            .await?
            .into_iter()
            .filter(|row| row.status.is_translatable())
            .map(|row| row.id)
            .collect()
    };
    if ids.is_empty() {
        tracing::info!("nothing to translate");
        return Ok(());
    }

    let (events, mut rx) = EventSender::channel();
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            tracing::debug!(row_id = event.row_id, status = ?event.status, "row updated");
        }
    });

    let report = service.translate_ids(&ids, events).await?;
    progress.await?;

    println!(
        "translated {} of {} rows ({} from memory, {} failed, {} skipped, {} session terms)",
        report.translated,
        report.requested,
        report.tm_hits,
        report.failed,
        report.skipped,
        report.session_terms
    );
    Ok(())
}
