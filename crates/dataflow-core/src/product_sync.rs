//! Example pipeline: sync active products into the `product_exports` table.
//!
//! Demonstrates the engine end-to-end: a scoped Postgres source, a pure
//! transform (price to integer cents, category to slug), collision
//! detection keyed on `product_id`, and a Postgres sink.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::collision::{CollisionDetector, CollisionStage, WritePolicy};
use crate::config::{
    PostgresSinkConfig, PostgresSourceConfig, RuntimeConfig, ScopeFilter, SinkConfig, SourceConfig,
};
use crate::connector::Record;
use crate::db::DbPool;
use crate::error::{FlowError, Result};
use crate::flows::{self, FlowDefinition, FlowStatus, NewFlow};
use crate::pipeline::{FlowPipeline, FlowRegistry, Transform};

pub const FLOW_NAME: &str = "product_sync_flow";

/// Fields participating in change detection, i.e. everything the transform
/// derives from the product.
pub const MAPPED_FIELDS: &[&str] = &["product_id", "name", "sku", "price_cents", "category_slug"];

const UNCATEGORIZED: &str = "uncategorized";

pub struct ProductTransform;

impl Transform for ProductTransform {
    fn apply(&self, record: &Record) -> Result<Record> {
        let id = require_i64(record, "id")?;
        let name = require_str(record, "name")?;
        let sku = require_str(record, "sku")?;
        let price = record.get("price").unwrap_or(&Value::Null);
        let price_cents = price_to_cents(price)?;
        let category_slug = category_slug(record.get("category"))?;

        // exported_at is deliberately absent: the sink table stamps it with
        // a database default, keeping this function pure.
        Ok(json!({
            "product_id": id,
            "name": name,
            "sku": sku,
            "price_cents": price_cents,
            "category_slug": category_slug,
        }))
    }
}

/// Monetary amounts become integer minor units by truncating the decimal
/// text. Never route through f64 arithmetic: `19.99 * 100.0` is
/// `1998.999…`, which truncates to the wrong cent.
pub fn price_to_cents(value: &Value) -> Result<i64> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => {
            return Err(FlowError::Transform(format!(
                "price must be numeric, got {other}"
            )))
        }
    };

    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.as_str()),
    };
    let (whole_text, frac_text) = match unsigned.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (unsigned, ""),
    };

    let all_digits =
        |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !all_digits(whole_text) || !(frac_text.is_empty() || all_digits(frac_text)) {
        return Err(FlowError::Transform(format!("invalid price '{text}'")));
    }

    let whole: i64 = whole_text
        .parse()
        .map_err(|_| FlowError::Transform(format!("price '{text}' out of range")))?;

    let mut frac_digits: String = frac_text.chars().take(2).collect();
    while frac_digits.len() < 2 {
        frac_digits.push('0');
    }
    let frac: i64 = frac_digits
        .parse()
        .map_err(|_| FlowError::Transform(format!("invalid price '{text}'")))?;

    let cents = whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(frac))
        .ok_or_else(|| FlowError::Transform(format!("price '{text}' out of range")))?;
    Ok(if negative { -cents } else { cents })
}

/// Null or missing categories map to the `"uncategorized"` sentinel rather
/// than propagating null into a required field.
fn category_slug(category: Option<&Value>) -> Result<String> {
    match category {
        None | Some(Value::Null) => Ok(UNCATEGORIZED.to_string()),
        Some(Value::String(s)) => {
            let slug = slugify(s);
            if slug.is_empty() {
                Ok(UNCATEGORIZED.to_string())
            } else {
                Ok(slug)
            }
        }
        Some(other) => Err(FlowError::Transform(format!(
            "category must be a string, got {other}"
        ))),
    }
}

/// Lowercase, alphanumeric runs separated by single dashes.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Looks up the latest export for a product by its business key.
pub struct ProductExportCollision {
    pool: DbPool,
}

impl ProductExportCollision {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CollisionDetector for ProductExportCollision {
    async fn find_previous(&self, record: &Record) -> Result<Option<Record>> {
        let product_id = require_i64(record, "product_id")?;
        let row = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT to_jsonb(t.*)
            FROM product_exports t
            WHERE t.product_id = $1
            ORDER BY t.exported_at DESC, t.id DESC
            LIMIT 1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    fn mapped_fields(&self) -> &[&'static str] {
        MAPPED_FIELDS
    }
}

pub fn pipeline(pool: &DbPool, policy: WritePolicy) -> FlowPipeline {
    FlowPipeline::new(Box::new(ProductTransform)).with_collision(CollisionStage {
        detector: Box::new(ProductExportCollision::new(pool.clone())),
        policy,
    })
}

pub fn definition() -> NewFlow {
    NewFlow {
        name: FLOW_NAME.to_string(),
        source: SourceConfig::Postgres(PostgresSourceConfig {
            table: "products".to_string(),
            scope: Some(ScopeFilter {
                column: "active".to_string(),
                equals: Value::Bool(true),
            }),
            batch_size: 100,
        }),
        sink: SinkConfig::Postgres(PostgresSinkConfig {
            table: "product_exports".to_string(),
        }),
        runtime: RuntimeConfig::default(),
        status: FlowStatus::Active,
    }
}

/// Idempotent startup registration: persist the definition and install the
/// pipeline logic under the flow's name. Re-runs are no-ops, so the policy
/// defaults to skipping unchanged records.
pub async fn register(pool: &DbPool, registry: &mut FlowRegistry) -> Result<FlowDefinition> {
    let flow = flows::find_or_create(pool, &definition()).await?;
    registry.insert(FLOW_NAME, pipeline(pool, WritePolicy::SkipUnchanged));
    Ok(flow)
}

fn require_i64(record: &Record, field: &str) -> Result<i64> {
    record
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| FlowError::Transform(format!("record is missing integer field '{field}'")))
}

fn require_str<'a>(record: &'a Record, field: &str) -> Result<&'a str> {
    record
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| FlowError::Transform(format!("record is missing string field '{field}'")))
}
