//! End-to-end tests against a live PostgreSQL server.
//!
//! These run only when `TEST_INTEGRATION` is set and `DATABASE_URL` points
//! at a server the tests may freely create and drop tables in.

use chrono::{DateTime, TimeZone, Utc};
use data_types::Point;
use postgres_sink::{Error, PostgresSink, SinkConfig};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::env;

// Skip the test unless the environment asks for integration coverage.
macro_rules! maybe_skip_integration {
    () => {{
        dotenv::dotenv().ok();

        let required_vars = ["DATABASE_URL"];
        let unset_vars: Vec<_> = required_vars
            .iter()
            .filter_map(|&name| match env::var(name) {
                Ok(_) => None,
                Err(_) => Some(name),
            })
            .collect();
        let unset_var_names = unset_vars.join(", ");

        let force = env::var("TEST_INTEGRATION");

        if force.is_ok() && !unset_var_names.is_empty() {
            panic!(
                "TEST_INTEGRATION is set, but variable(s) {} need to be set",
                unset_var_names
            );
        } else if force.is_err() {
            eprintln!(
                "skipping Postgres integration test - set {}TEST_INTEGRATION to run",
                if unset_var_names.is_empty() {
                    String::new()
                } else {
                    format!("{} and ", unset_var_names)
                }
            );
            return;
        }
    }};
}

async fn setup(tables: &[&str]) -> (PgPool, String) {
    let dsn = env::var("DATABASE_URL").unwrap();
    let pool = PgPool::connect(&dsn).await.expect("connect to test db");
    for table in tables {
        sqlx::query(&format!(r#"DROP TABLE IF EXISTS "{table}""#))
            .execute(&pool)
            .await
            .expect("prepare db");
    }
    (pool, dsn)
}

async fn connected_sink(config: SinkConfig) -> PostgresSink {
    let mut sink = PostgresSink::new(config);
    sink.connect().await.expect("sink connect");
    sink
}

fn config(dsn: &str) -> SinkConfig {
    SinkConfig {
        connection: dsn.to_string(),
        ..Default::default()
    }
}

async fn column_type(pool: &PgPool, table: &str, column: &str) -> Option<String> {
    sqlx::query(
        "SELECT data_type::text FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = $1 AND column_name = $2",
    )
    .bind(table)
    .bind(column)
    .fetch_optional(pool)
    .await
    .unwrap()
    .map(|row| row.get(0))
}

async fn row_count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query(&format!(r#"SELECT count(*) FROM "{table}""#))
        .fetch_one(pool)
        .await
        .unwrap()
        .get(0)
}

#[tokio::test]
async fn single_point_creates_inline_table() {
    maybe_skip_integration!();
    let (pool, dsn) = setup(&["e2e_cpu"]).await;

    // 123456789ns of fractional time; only the first six digits may
    // survive.
    let t = Utc.timestamp_opt(1_600_000_000, 123_456_789).unwrap();
    let point = Point::new("e2e_cpu", t)
        .with_tag("host", "a")
        .with_field("load", 0.5);

    let mut sink = connected_sink(config(&dsn)).await;
    sink.write(&[point]).await.expect("write");
    sink.close().await;

    assert_eq!(
        column_type(&pool, "e2e_cpu", "time").await.as_deref(),
        Some("timestamp with time zone")
    );
    assert_eq!(
        column_type(&pool, "e2e_cpu", "host").await.as_deref(),
        Some("text")
    );
    assert_eq!(
        column_type(&pool, "e2e_cpu", "load").await.as_deref(),
        Some("double precision")
    );

    let row = sqlx::query(r#"SELECT time, host, load FROM "e2e_cpu""#)
        .fetch_one(&pool)
        .await
        .unwrap();
    let stored: DateTime<Utc> = row.get(0);
    assert_eq!(
        stored,
        Utc.timestamp_opt(1_600_000_000, 123_456_000).unwrap(),
        "timestamps are truncated to microseconds"
    );
    assert_eq!(row.get::<String, _>(1), "a");
    assert_eq!(row.get::<f64, _>(2), 0.5);
}

#[tokio::test]
async fn new_field_extends_the_table_between_writes() {
    maybe_skip_integration!();
    let (pool, dsn) = setup(&["e2e_evolve"]).await;
    let mut sink = connected_sink(config(&dsn)).await;

    let first = Point::new("e2e_evolve", Utc::now())
        .with_tag("host", "a")
        .with_field("load", 0.5);
    sink.write(&[first]).await.expect("first write");

    let second = Point::new("e2e_evolve", Utc::now())
        .with_tag("host", "a")
        .with_field("load", 0.7)
        .with_field("temp", 42_i64);
    sink.write(&[second]).await.expect("second write");
    sink.close().await;

    assert_eq!(
        column_type(&pool, "e2e_evolve", "temp").await.as_deref(),
        Some("bigint")
    );
    let nulls: i64 = sqlx::query(r#"SELECT count(*) FROM "e2e_evolve" WHERE temp IS NULL"#)
        .fetch_one(&pool)
        .await
        .unwrap()
        .get(0);
    assert_eq!(nulls, 1, "the first row predates the temp column");
    assert_eq!(row_count(&pool, "e2e_evolve").await, 2);
}

#[tokio::test]
async fn repeated_tag_sets_share_one_surrogate_id() {
    maybe_skip_integration!();
    let (pool, dsn) = setup(&["e2e_fk", "e2e_fk_tag"]).await;

    let mut sink = connected_sink(SinkConfig {
        tags_as_foreignkeys: true,
        ..config(&dsn)
    })
    .await;

    let point = || {
        Point::new("e2e_fk", Utc::now())
            .with_tag("host", "a")
            .with_tag("env", "prod")
            .with_field("load", 0.5)
    };
    sink.write(&[point(), point(), point()]).await.expect("write");

    assert_eq!(row_count(&pool, "e2e_fk").await, 3);
    assert_eq!(row_count(&pool, "e2e_fk_tag").await, 1);

    let tag_row = sqlx::query(r#"SELECT tag_id, host, env FROM "e2e_fk_tag""#)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(tag_row.get::<i32, _>(0), 1);
    assert_eq!(tag_row.get::<String, _>(1), "a");
    assert_eq!(tag_row.get::<String, _>(2), "prod");

    let distinct: i64 = sqlx::query(r#"SELECT count(DISTINCT tag_id) FROM "e2e_fk""#)
        .fetch_one(&pool)
        .await
        .unwrap()
        .get(0);
    assert_eq!(distinct, 1);

    // A divergent tag set gets its own row and id.
    let stage = Point::new("e2e_fk", Utc::now())
        .with_tag("host", "a")
        .with_tag("env", "stage")
        .with_field("load", 0.6);
    sink.write(&[stage]).await.expect("write divergent tag set");
    sink.close().await;

    assert_eq!(row_count(&pool, "e2e_fk_tag").await, 2);
    let latest: i32 = sqlx::query(r#"SELECT tag_id FROM "e2e_fk_tag" WHERE env = 'stage'"#)
        .fetch_one(&pool)
        .await
        .unwrap()
        .get(0);
    assert_eq!(latest, 2);
    let referenced: i64 = sqlx::query(r#"SELECT count(*) FROM "e2e_fk" WHERE tag_id = 2"#)
        .fetch_one(&pool)
        .await
        .unwrap()
        .get(0);
    assert_eq!(referenced, 1);
}

#[tokio::test]
async fn externally_dropped_table_is_recreated() {
    maybe_skip_integration!();
    let (pool, dsn) = setup(&["e2e_dropped"]).await;
    let mut sink = connected_sink(config(&dsn)).await;

    let point = || Point::new("e2e_dropped", Utc::now()).with_field("load", 0.5);
    sink.write(&[point()]).await.expect("first write");

    sqlx::query(r#"DROP TABLE "e2e_dropped""#)
        .execute(&pool)
        .await
        .unwrap();

    sink.write(&[point()]).await.expect("write after drop");
    sink.close().await;

    assert_eq!(row_count(&pool, "e2e_dropped").await, 1);
}

#[tokio::test]
async fn incompatible_existing_column_fails_without_side_effects() {
    maybe_skip_integration!();
    let (pool, dsn) = setup(&["e2e_bad"]).await;
    sqlx::query(r#"CREATE TABLE "e2e_bad"("time" timestamptz, "load" text)"#)
        .execute(&pool)
        .await
        .unwrap();

    let mut sink = connected_sink(config(&dsn)).await;
    let point = Point::new("e2e_bad", Utc::now()).with_field("load", 0.5);
    let err = sink.write(&[point]).await.unwrap_err();
    sink.close().await;

    assert!(matches!(err, Error::SchemaMismatch { .. }), "got {err}");
    assert_eq!(row_count(&pool, "e2e_bad").await, 0);
    assert_eq!(
        column_type(&pool, "e2e_bad", "load").await.as_deref(),
        Some("text"),
        "no ALTER was issued"
    );
}

#[tokio::test]
async fn writing_the_same_batch_twice_is_idempotent_schema_wise() {
    maybe_skip_integration!();
    let (pool, dsn) = setup(&["e2e_idem"]).await;
    let mut sink = connected_sink(config(&dsn)).await;

    let batch = || {
        vec![Point::new("e2e_idem", Utc::now())
            .with_tag("host", "a")
            .with_field("load", 0.5)]
    };
    sink.write(&batch()).await.expect("first write");
    sink.write(&batch()).await.expect("second write");
    sink.close().await;

    let columns: Vec<String> = sqlx::query(
        "SELECT column_name::text FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = 'e2e_idem' ORDER BY ordinal_position",
    )
    .fetch_all(&pool)
    .await
    .unwrap()
    .into_iter()
    .map(|row| row.get(0))
    .collect();
    assert_eq!(columns, ["time", "host", "load"]);
    assert_eq!(row_count(&pool, "e2e_idem").await, 2);
}

#[tokio::test]
async fn hostile_names_are_persisted_verbatim() {
    maybe_skip_integration!();
    let (pool, dsn) = setup(&["e2e weird"]).await;
    let mut sink = connected_sink(config(&dsn)).await;

    let point = Point::new("e2e weird", Utc::now())
        .with_tag("select", "keyword")
        .with_tag(r#"we"ird"#, "quoted")
        .with_field(r"back\slash", 1_i64);
    sink.write(&[point]).await.expect("write");
    sink.close().await;

    for column in ["select", r#"we"ird"#, r"back\slash"] {
        assert!(
            column_type(&pool, "e2e weird", column).await.is_some(),
            "column {column:?} should exist verbatim"
        );
    }
    assert_eq!(row_count(&pool, "e2e weird").await, 1);
}

#[tokio::test]
async fn jsonb_modes_store_documents() {
    maybe_skip_integration!();
    let (pool, dsn) = setup(&["e2e_json"]).await;

    let mut sink = connected_sink(SinkConfig {
        tags_as_jsonb: true,
        fields_as_jsonb: true,
        ..config(&dsn)
    })
    .await;

    let point = Point::new("e2e_json", Utc::now())
        .with_tag("host", "a")
        .with_field("load", 0.5)
        .with_field("up", true);
    sink.write(&[point]).await.expect("write");
    sink.close().await;

    assert_eq!(
        column_type(&pool, "e2e_json", "tags").await.as_deref(),
        Some("jsonb")
    );
    let row = sqlx::query(r#"SELECT tags, fields FROM "e2e_json""#)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(
        row.get::<serde_json::Value, _>(0),
        serde_json::json!({"host": "a"})
    );
    assert_eq!(
        row.get::<serde_json::Value, _>(1),
        serde_json::json!({"load": 0.5, "up": true})
    );
}
