use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use askama::Template;
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::db::{Article, ArticleFilter, Category, Database};
use crate::fetcher::Fetcher;

const FEED_PAGE_LIMIT: i64 = 200;
const DEFAULT_API_LIMIT: i64 = 50;
const MAX_API_LIMIT: i64 = 200;
const SNIPPET_CHARS: usize = 240;

pub struct AppState {
    pub db: Arc<Database>,
    pub fetcher: Arc<Fetcher>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/refresh", post(refresh))
        .route("/api/refresh/status", get(refresh_status))
        .route("/api/articles", get(list_articles))
        .route("/api/articles/:id/toggle-saved", post(toggle_saved))
        .route("/api/categories", get(list_categories).post(create_category))
        .route("/api/categories/:id", delete(delete_category))
        .route("/api/sources", get(list_sources))
        .with_state(state)
}

// Template structs
#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub categories: Vec<Category>,
    pub sections: Vec<CategorySection>,
    pub total: usize,
    pub refreshing: bool,
}

pub struct CategorySection {
    pub name: String,
    pub articles: Vec<ArticleView>,
}

pub struct ArticleView {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub source: String,
    pub snippet: String,
    pub published: String,
    pub is_saved: bool,
}

impl From<Article> for ArticleView {
    fn from(article: Article) -> Self {
        let published = article
            .published_at
            .as_deref()
            .unwrap_or(article.created_at.as_str())
            .chars()
            .take(10)
            .collect();

        Self {
            id: article.id,
            snippet: snippet(article.summary.as_deref().unwrap_or("")),
            title: article.title,
            url: article.url,
            source: article.source_name,
            published,
            is_saved: article.is_saved,
        }
    }
}

/// Strip markup from a feed summary and shorten it for display.
pub fn snippet(summary: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    let tags = TAGS.get_or_init(|| Regex::new(r"<[^>]*>").unwrap());

    let text = tags.replace_all(summary, " ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if text.chars().count() > SNIPPET_CHARS {
        let cut: String = text.chars().take(SNIPPET_CHARS).collect();
        format!("{}…", cut.trim_end())
    } else {
        text
    }
}

// Wrapper for HTML responses
struct HtmlTemplate<T>(T);

impl<T: Template> IntoResponse for HtmlTemplate<T> {
    fn into_response(self) -> Response {
        match self.0.render() {
            Ok(html) => Html(html).into_response(),
            Err(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to render template: {}", err),
            )
                .into_response(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Internal(err) => {
                tracing::error!("Request failed: {:#}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// Route handlers
pub async fn index(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let categories = state.db.get_categories().await?;
    let articles = state
        .db
        .list_articles(&ArticleFilter {
            limit: FEED_PAGE_LIMIT,
            ..Default::default()
        })
        .await?;
    let total = articles.len();

    let mut grouped: BTreeMap<String, Vec<ArticleView>> = categories
        .iter()
        .map(|c| (c.name.clone(), Vec::new()))
        .collect();
    for article in articles {
        grouped
            .entry(article.category.clone())
            .or_default()
            .push(article.into());
    }

    let sections = grouped
        .into_iter()
        .map(|(name, articles)| CategorySection { name, articles })
        .collect();

    Ok(HtmlTemplate(IndexTemplate {
        categories,
        sections,
        total,
        refreshing: state.fetcher.is_refreshing().await,
    }))
}

pub async fn refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Claim the cycle here so a second request sees it before the task runs
    if !state.fetcher.try_begin_refresh().await {
        return Json(json!({
            "status": "already_running",
            "message": "A news refresh is already in progress",
        }));
    }

    let fetcher = state.fetcher.clone();
    tokio::spawn(async move {
        if let Err(e) = fetcher.run_claimed_refresh().await {
            tracing::error!("Manual refresh failed: {}", e);
        }
    });

    Json(json!({
        "status": "refresh_started",
        "message": "News refresh started in background",
    }))
}

pub async fn refresh_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "refreshing": state.fetcher.is_refreshing().await,
        "last_report": state.fetcher.last_report().await,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ArticlesQuery {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub saved_only: bool,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    DEFAULT_API_LIMIT
}

impl ArticlesQuery {
    fn into_filter(self) -> Result<ArticleFilter, AppError> {
        if self.limit < 0 {
            return Err(AppError::BadRequest("limit must not be negative".to_string()));
        }

        Ok(ArticleFilter {
            category: self.category.filter(|c| !c.is_empty()),
            saved_only: self.saved_only,
            limit: self.limit.min(MAX_API_LIMIT),
        })
    }
}

pub async fn list_articles(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ArticlesQuery>, QueryRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Query(query) = query?;
    let articles = state.db.list_articles(&query.into_filter()?).await?;

    Ok(Json(json!({
        "count": articles.len(),
        "articles": articles,
    })))
}

pub async fn toggle_saved(
    State(state): State<Arc<AppState>>,
    Path(article_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let is_saved = state
        .db
        .toggle_saved(article_id)
        .await?
        .ok_or(AppError::NotFound("Article"))?;

    Ok(Json(json!({ "id": article_id, "is_saved": is_saved })))
}

pub async fn list_categories(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let categories = state.db.get_categories().await?;
    Ok(Json(json!({ "categories": categories })))
}

#[derive(Debug, Deserialize)]
pub struct CreateCategory {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

pub async fn create_category(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateCategory>,
) -> Result<impl IntoResponse, AppError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Category name must not be empty".to_string()));
    }
    if state.db.get_category_by_name(name).await?.is_some() {
        return Err(AppError::BadRequest(
            "Category with this name already exists".to_string(),
        ));
    }

    let category = state.db.create_category(name, body.description.trim()).await?;
    tracing::info!("Created category '{}'", category.name);
    Ok((StatusCode::CREATED, Json(category)))
}

pub async fn delete_category(
    State(state): State<Arc<AppState>>,
    Path(category_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    if !state.db.delete_category(category_id).await? {
        return Err(AppError::NotFound("Category"));
    }

    tracing::info!("Deleted category {} and its articles", category_id);
    Ok(Json(json!({ "message": "Category deleted successfully" })))
}

pub async fn list_sources(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let sources = state.db.get_all_sources().await?;
    Ok(Json(json!({ "sources": sources })))
}

pub async fn health() -> impl IntoResponse {
    Html("OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CategoryConfig, SourceConfig};
    use crate::db::NewArticle;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn create_test_app() -> (Router, Arc<Database>) {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.initialize().await.unwrap();
        db.seed_categories(&[
            CategoryConfig {
                name: "AI".to_string(),
                description: "Artificial intelligence".to_string(),
            },
            CategoryConfig {
                name: "Robotics".to_string(),
                description: String::new(),
            },
        ])
        .await
        .unwrap();
        let db = Arc::new(db);

        let fetcher = Arc::new(Fetcher::new(db.clone(), None).unwrap());
        let state = Arc::new(AppState {
            db: db.clone(),
            fetcher,
        });

        (router(state), db)
    }

    async fn setup_test_data(db: &Database) {
        for i in 1..=8 {
            let category = if i % 2 == 0 { "AI" } else { "Robotics" };
            db.insert_article(&NewArticle {
                title: format!("Article {}", i),
                url: format!("https://article{}.com", i),
                source_id: None,
                source_name: "Test Feed".to_string(),
                category: category.to_string(),
                summary: Some(format!("<p>Points: {}</p>", i * 10)),
                published_at: Some(chrono::Utc::now()),
            })
            .await
            .unwrap();
        }
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let (status, body) = send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    mod health_tests {
        use super::*;

        #[tokio::test]
        async fn test_health_endpoint() {
            let (app, _db) = create_test_app().await;

            let (status, body) = send(
                app,
                Request::builder().uri("/health").body(Body::empty()).unwrap(),
            )
            .await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(&body[..], b"OK");
        }
    }

    mod index_tests {
        use super::*;

        #[tokio::test]
        async fn test_index_empty() {
            let (app, _db) = create_test_app().await;

            let (status, body) =
                send(app, Request::builder().uri("/").body(Body::empty()).unwrap()).await;

            assert_eq!(status, StatusCode::OK);
            let body_str = String::from_utf8(body).unwrap();
            assert!(body_str.contains("Robotics"));
        }

        #[tokio::test]
        async fn test_index_groups_articles_by_category() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (status, body) =
                send(app, Request::builder().uri("/").body(Body::empty()).unwrap()).await;

            assert_eq!(status, StatusCode::OK);
            let body_str = String::from_utf8(body).unwrap();
            assert!(body_str.contains("Article 1"));
            assert!(body_str.contains("Article 8"));
            assert!(body_str.contains(r#"data-category="AI""#));
            assert!(body_str.contains("Points: 80"));
            assert!(!body_str.contains("<p>Points"));
        }

        #[tokio::test]
        async fn test_index_escapes_titles() {
            let (app, db) = create_test_app().await;
            db.insert_article(&NewArticle {
                title: "<script>alert(1)</script>".to_string(),
                url: "https://evil.example.com".to_string(),
                source_id: None,
                source_name: "Evil".to_string(),
                category: "AI".to_string(),
                summary: None,
                published_at: None,
            })
            .await
            .unwrap();

            let (_, body) = send(app, Request::builder().uri("/").body(Body::empty()).unwrap()).await;
            let body_str = String::from_utf8(body).unwrap();

            assert!(!body_str.contains("<script>alert(1)</script>"));
        }
    }

    mod articles_api_tests {
        use super::*;

        #[tokio::test]
        async fn test_list_articles_default() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (status, json) = get_json(app, "/api/articles").await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["count"], 8);
            assert_eq!(json["articles"].as_array().unwrap().len(), 8);
            assert_eq!(json["articles"][0]["title"], "Article 8");
            assert_eq!(json["articles"][0]["source"], "Test Feed");
            assert_eq!(json["articles"][0]["is_saved"], false);
        }

        #[tokio::test]
        async fn test_list_articles_respects_limit() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (status, json) = get_json(app, "/api/articles?limit=3").await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["count"], 3);
        }

        #[tokio::test]
        async fn test_list_articles_filters_category() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (_, json) = get_json(app, "/api/articles?category=AI&limit=2").await;

            let articles = json["articles"].as_array().unwrap();
            assert_eq!(articles.len(), 2);
            assert!(articles.iter().all(|a| a["category"] == "AI"));
        }

        #[tokio::test]
        async fn test_list_articles_unknown_category_is_empty() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;

            let (status, json) = get_json(app, "/api/articles?category=Sports").await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["count"], 0);
        }

        #[tokio::test]
        async fn test_invalid_limit_rejected() {
            let (app, _db) = create_test_app().await;

            let (status, json) = get_json(app.clone(), "/api/articles?limit=lots").await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(json["error"].is_string());

            let (status, json) = get_json(app.clone(), "/api/articles?saved_only=maybe").await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(json["error"]
                .as_str()
                .unwrap()
                .to_lowercase()
                .contains("query string"));

            let (status, json) = get_json(app, "/api/articles?limit=-1").await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(json["error"].as_str().unwrap().contains("limit"));
        }

        #[tokio::test]
        async fn test_toggle_saved_round_trip() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;
            let id = db
                .list_articles(&ArticleFilter {
                    limit: 1,
                    ..Default::default()
                })
                .await
                .unwrap()[0]
                .id;

            let (status, body) = send(
                app.clone(),
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/articles/{}/toggle-saved", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            let json: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["is_saved"], true);

            let (_, json) = get_json(app, "/api/articles?saved_only=true").await;
            assert_eq!(json["count"], 1);
            assert_eq!(json["articles"][0]["id"], id);
        }

        #[tokio::test]
        async fn test_toggle_saved_missing_article() {
            let (app, _db) = create_test_app().await;

            let (status, _) = send(
                app,
                Request::builder()
                    .method("POST")
                    .uri("/api/articles/999/toggle-saved")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

            assert_eq!(status, StatusCode::NOT_FOUND);
        }
    }

    mod category_api_tests {
        use super::*;

        fn post_category(body: Value) -> Request<Body> {
            Request::builder()
                .method("POST")
                .uri("/api/categories")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap()
        }

        #[tokio::test]
        async fn test_list_categories_sorted() {
            let (app, _db) = create_test_app().await;

            let (status, json) = get_json(app, "/api/categories").await;

            assert_eq!(status, StatusCode::OK);
            let names: Vec<_> = json["categories"]
                .as_array()
                .unwrap()
                .iter()
                .map(|c| c["name"].as_str().unwrap().to_string())
                .collect();
            assert_eq!(names, vec!["AI", "Robotics"]);
        }

        #[tokio::test]
        async fn test_create_category() {
            let (app, db) = create_test_app().await;

            let (status, body) = send(
                app,
                post_category(serde_json::json!({ "name": " Space ", "description": "Rockets" })),
            )
            .await;

            assert_eq!(status, StatusCode::CREATED);
            let json: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["name"], "Space");
            assert!(db.get_category_by_name("Space").await.unwrap().is_some());
        }

        #[tokio::test]
        async fn test_create_duplicate_category_rejected() {
            let (app, _db) = create_test_app().await;

            let (status, body) = send(app, post_category(serde_json::json!({ "name": "AI" }))).await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
            let json: Value = serde_json::from_slice(&body).unwrap();
            assert!(json["error"].as_str().unwrap().contains("already exists"));
        }

        #[tokio::test]
        async fn test_create_blank_category_rejected() {
            let (app, _db) = create_test_app().await;

            let (status, _) = send(app, post_category(serde_json::json!({ "name": "   " }))).await;

            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn test_delete_category_cascades() {
            let (app, db) = create_test_app().await;
            setup_test_data(&db).await;
            let ai = db.get_category_by_name("AI").await.unwrap().unwrap();

            let (status, _) = send(
                app,
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/categories/{}", ai.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(db.count_articles().await.unwrap(), 4);
        }

        #[tokio::test]
        async fn test_delete_missing_category() {
            let (app, _db) = create_test_app().await;

            let (status, _) = send(
                app,
                Request::builder()
                    .method("DELETE")
                    .uri("/api/categories/12345")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

            assert_eq!(status, StatusCode::NOT_FOUND);
        }
    }

    mod refresh_tests {
        use super::*;
        use std::time::Duration;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        #[tokio::test]
        async fn test_refresh_endpoint() {
            let (app, _db) = create_test_app().await;

            let (status, body) = send(
                app,
                Request::builder()
                    .method("POST")
                    .uri("/api/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

            assert_eq!(status, StatusCode::OK);
            let json: Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["status"], "refresh_started");
        }

        fn post_refresh() -> Request<Body> {
            Request::builder()
                .method("POST")
                .uri("/api/refresh")
                .body(Body::empty())
                .unwrap()
        }

        #[tokio::test]
        async fn test_back_to_back_refresh_reports_already_running() {
            let upstream = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/slow.xml"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string("<rss version=\"2.0\"><channel><title>Slow</title></channel></rss>")
                        .set_delay(Duration::from_millis(500)),
                )
                .mount(&upstream)
                .await;

            let (app, db) = create_test_app().await;
            db.sync_sources(&[SourceConfig {
                name: "Slow".to_string(),
                url: format!("{}/slow.xml", upstream.uri()),
                category_hint: Some("ai".to_string()),
                weight: 1.0,
                min_score: 0,
            }])
            .await
            .unwrap();

            let (_, first) = send(app.clone(), post_refresh()).await;
            let (_, second) = send(app.clone(), post_refresh()).await;

            let first: Value = serde_json::from_slice(&first).unwrap();
            let second: Value = serde_json::from_slice(&second).unwrap();
            assert_eq!(first["status"], "refresh_started");
            assert_eq!(second["status"], "already_running");

            // Once the cycle finishes the endpoint accepts a new one
            let mut done = false;
            for _ in 0..100 {
                let (_, json) = get_json(app.clone(), "/api/refresh/status").await;
                if json["refreshing"] == false && !json["last_report"].is_null() {
                    done = true;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(done);

            let (_, third) = send(app, post_refresh()).await;
            let third: Value = serde_json::from_slice(&third).unwrap();
            assert_eq!(third["status"], "refresh_started");
        }

        #[tokio::test]
        async fn test_refresh_status_endpoint() {
            let (app, _db) = create_test_app().await;

            let (status, json) = get_json(app, "/api/refresh/status").await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["refreshing"], false);
            assert!(json["last_report"].is_null());
        }
    }

    mod sources_api_tests {
        use super::*;

        #[tokio::test]
        async fn test_list_sources() {
            let (app, db) = create_test_app().await;
            db.sync_sources(&[SourceConfig {
                name: "HN".to_string(),
                url: "https://hnrss.org/frontpage".to_string(),
                category_hint: Some("tech".to_string()),
                weight: 1.0,
                min_score: 100,
            }])
            .await
            .unwrap();

            let (status, json) = get_json(app, "/api/sources").await;

            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["sources"][0]["name"], "HN");
            assert_eq!(json["sources"][0]["min_score"], 100);
            assert!(json["sources"][0]["last_error"].is_null());
        }
    }

    mod query_tests {
        use super::*;

        #[test]
        fn test_articles_query_defaults() {
            let query: ArticlesQuery = serde_urlencoded::from_str("").unwrap();
            assert_eq!(query.limit, DEFAULT_API_LIMIT);
            assert!(query.category.is_none());
            assert!(!query.saved_only);
        }

        #[test]
        fn test_articles_query_caps_limit() {
            let query: ArticlesQuery =
                serde_urlencoded::from_str("limit=5000&category=AI&saved_only=true").unwrap();
            let filter = query.into_filter().unwrap();
            assert_eq!(filter.limit, MAX_API_LIMIT);
            assert_eq!(filter.category.as_deref(), Some("AI"));
            assert!(filter.saved_only);
        }

        #[test]
        fn test_empty_category_means_all() {
            let query: ArticlesQuery = serde_urlencoded::from_str("category=").unwrap();
            assert!(query.into_filter().unwrap().category.is_none());
        }

        #[test]
        fn test_snippet_strips_tags_and_truncates() {
            assert_eq!(snippet("<p>Hello <b>world</b></p>"), "Hello world");
            let long = "word ".repeat(100);
            let cut = snippet(&long);
            assert!(cut.ends_with('…'));
            assert!(cut.chars().count() <= SNIPPET_CHARS + 1);
        }
    }
}
