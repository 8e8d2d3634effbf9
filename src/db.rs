use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};

use crate::config::{CategoryConfig, SourceConfig};

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub category_hint: Option<String>,
    pub weight: f64,
    pub min_score: i64,
    pub last_fetched: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub source_id: Option<i64>,
    #[serde(rename = "source")]
    pub source_name: String,
    pub category: String,
    pub summary: Option<String>,
    pub is_saved: bool,
    pub published_at: Option<String>,
    pub created_at: String,
}

/// An article ready to be stored, produced by the refresh cycle.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub title: String,
    pub url: String,
    pub source_id: Option<i64>,
    pub source_name: String,
    pub category: String,
    pub summary: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ArticleFilter {
    pub category: Option<String>,
    pub saved_only: bool,
    pub limit: i64,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to ":memory:" is its own database, so pin the pool to one.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options.connect(database_url).await?;

        Ok(Self { pool })
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                category_hint TEXT,
                weight REAL NOT NULL DEFAULT 1.0,
                min_score INTEGER NOT NULL DEFAULT 0,
                last_fetched TEXT,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                source_id INTEGER REFERENCES sources(id) ON DELETE SET NULL,
                source_name TEXT NOT NULL,
                category TEXT NOT NULL REFERENCES categories(name) ON DELETE CASCADE,
                summary TEXT,
                is_saved INTEGER NOT NULL DEFAULT 0,
                published_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_articles_category_created
            ON articles(category, created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_articles_saved
            ON articles(is_saved)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inserts the given categories only if the table is empty, so categories
    /// managed through the API survive restarts. Returns whether seeding happened.
    pub async fn seed_categories(&self, defaults: &[CategoryConfig]) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM categories")
            .fetch_one(&mut *tx)
            .await?;
        if count > 0 {
            return Ok(false);
        }

        for category in defaults {
            sqlx::query(
                "INSERT INTO categories (name, description) VALUES (?, ?) ON CONFLICT(name) DO NOTHING",
            )
            .bind(category.name.trim())
            .bind(&category.description)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn get_categories(&self) -> anyhow::Result<Vec<Category>> {
        let categories = sqlx::query_as::<_, Category>("SELECT * FROM categories ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(categories)
    }

    pub async fn get_category(&self, category_id: i64) -> anyhow::Result<Option<Category>> {
        let category = sqlx::query_as::<_, Category>("SELECT * FROM categories WHERE id = ?")
            .bind(category_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(category)
    }

    pub async fn get_category_by_name(&self, name: &str) -> anyhow::Result<Option<Category>> {
        let category = sqlx::query_as::<_, Category>("SELECT * FROM categories WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(category)
    }

    pub async fn create_category(&self, name: &str, description: &str) -> anyhow::Result<Category> {
        let category = sqlx::query_as::<_, Category>(
            "INSERT INTO categories (name, description) VALUES (?, ?) RETURNING *",
        )
        .bind(name)
        .bind(description)
        .fetch_one(&self.pool)
        .await?;
        Ok(category)
    }

    /// Deletes a category together with every article filed under it.
    pub async fn delete_category(&self, category_id: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(category_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn sync_sources(&self, configs: &[SourceConfig]) -> anyhow::Result<()> {
        for config in configs {
            sqlx::query(
                r#"
                INSERT INTO sources (name, url, category_hint, weight, min_score)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(url) DO UPDATE SET
                    name = excluded.name,
                    category_hint = excluded.category_hint,
                    weight = excluded.weight,
                    min_score = excluded.min_score
                "#,
            )
            .bind(&config.name)
            .bind(&config.url)
            .bind(config.category_hint.as_deref())
            .bind(config.weight)
            .bind(config.min_score)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn get_all_sources(&self) -> anyhow::Result<Vec<Source>> {
        let sources = sqlx::query_as::<_, Source>("SELECT * FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    pub async fn get_source(&self, source_id: i64) -> anyhow::Result<Option<Source>> {
        let source = sqlx::query_as::<_, Source>("SELECT * FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    pub async fn update_source_fetched(
        &self,
        source_id: i64,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE sources SET last_fetched = ?, last_error = ? WHERE id = ?")
            .bind(&now)
            .bind(error)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn article_exists(&self, url: &str) -> anyhow::Result<bool> {
        let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM articles WHERE url = ?)")
            .bind(url)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Stores a new article. Articles are never rewritten, so a URL that is
    /// already present leaves the table untouched and yields `false`.
    pub async fn insert_article(&self, article: &NewArticle) -> anyhow::Result<bool> {
        // Fixed-width timestamps keep lexical order equal to chronological order.
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let published_at = article.published_at.map(|p| p.to_rfc3339());

        let result = sqlx::query(
            r#"
            INSERT INTO articles
                (title, url, source_id, source_name, category, summary, published_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
            "#,
        )
        .bind(&article.title)
        .bind(&article.url)
        .bind(article.source_id)
        .bind(&article.source_name)
        .bind(&article.category)
        .bind(article.summary.as_deref())
        .bind(published_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_article(&self, article_id: i64) -> anyhow::Result<Option<Article>> {
        let article = sqlx::query_as::<_, Article>("SELECT * FROM articles WHERE id = ?")
            .bind(article_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(article)
    }

    pub async fn list_articles(&self, filter: &ArticleFilter) -> anyhow::Result<Vec<Article>> {
        let articles = sqlx::query_as::<_, Article>(
            r#"
            SELECT * FROM articles
            WHERE (?1 IS NULL OR category = ?1)
              AND (?2 = 0 OR is_saved = 1)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3
            "#,
        )
        .bind(filter.category.as_deref())
        .bind(filter.saved_only)
        .bind(filter.limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    pub async fn count_articles(&self) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Flips the saved flag, returning the new value or `None` for an unknown id.
    pub async fn toggle_saved(&self, article_id: i64) -> anyhow::Result<Option<bool>> {
        let saved: Option<(bool,)> = sqlx::query_as(
            "UPDATE articles SET is_saved = NOT is_saved WHERE id = ? RETURNING is_saved",
        )
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(saved.map(|(s,)| s))
    }
}
