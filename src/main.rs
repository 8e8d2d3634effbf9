use std::sync::Arc;

use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use news_vibe::classifier::{Classifier, GeminiClassifier};
use news_vibe::config::{Config, EnvConfig};
use news_vibe::db::Database;
use news_vibe::fetcher::{start_background_refresh, Fetcher};
use news_vibe::routes::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "news_vibe=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let env = EnvConfig::from_env();
    let config = Config::load(&env.sources_config)?;
    info!(
        "Loaded {} sources and {} default categories from {}",
        config.sources.len(),
        config.categories.len(),
        env.sources_config
    );

    // Initialize database
    let db = Database::new(&env.database_url).await?;
    db.initialize().await?;
    if db.seed_categories(&config.categories).await? {
        info!("Seeded {} default categories", config.categories.len());
    }
    db.sync_sources(&config.sources).await?;
    info!("Database initialized");

    let db = Arc::new(db);

    // Create classifier and fetcher
    let classifier: Option<Arc<dyn Classifier>> = match &env.gemini_api_key {
        Some(key) => {
            let gemini = GeminiClassifier::new(key.clone())?
                .with_model(env.gemini_model.clone())
                .with_base_url(env.gemini_base_url.clone());
            info!("Using Gemini model {} for classification", env.gemini_model);
            Some(Arc::new(gemini))
        }
        None => {
            warn!("GEMINI_API_KEY not set; headlines will only be classified by source hint");
            None
        }
    };
    let fetcher = Arc::new(Fetcher::new(db.clone(), classifier)?);

    // Start background refresh task
    if config.refresh_interval > 0 {
        let bg_fetcher = fetcher.clone();
        let refresh_interval = config.refresh_interval;
        tokio::spawn(async move {
            start_background_refresh(bg_fetcher, refresh_interval).await;
        });
    } else {
        info!("Background refresh disabled; use POST /api/refresh");
    }

    // Create app state
    let state = Arc::new(AppState {
        db: db.clone(),
        fetcher: fetcher.clone(),
    });

    // Build router
    let app = routes::router(state)
        .nest_service("/static", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http());

    // Start server
    let listener = tokio::net::TcpListener::bind(&env.bind_addr).await?;
    info!("Server starting on http://{}", env.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
