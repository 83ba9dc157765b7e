//! User-authored rules: a boolean predicate over articles plus a list of
//! actions. The same evaluator backs the filtered-articles endpoint and
//! rule application, so a filter preview and the rule it becomes can never
//! disagree.
//!
//! Evaluation is strictly left-to-right: each condition carries the
//! `logic` (`and`/`or`) that joins it to the running result — there is no
//! operator precedence. An empty condition list matches everything, and a
//! condition naming an unknown field evaluates to true; both defaults are
//! load-bearing for "apply to all" rules.

use chrono::TimeZone;
use serde::{Deserialize, Serialize};

use crate::storage::{Database, RuleArticle, SettingKey};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub actions: Vec<RuleAction>,
    /// Run this rule over newly ingested articles automatically
    #[serde(default)]
    pub apply_on_ingest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub value: String,
    /// Multi-select variant of `value`; any match counts
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub negate: bool,
    /// How this condition joins the result so far (`and` / `or`);
    /// meaningless on the first condition
    #[serde(default = "default_logic")]
    pub logic: String,
}

fn default_logic() -> String {
    "and".to_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Favorite,
    Unfavorite,
    Hide,
    Unhide,
    MarkRead,
    MarkUnread,
}

// ============================================================================
// Evaluation
// ============================================================================

/// Evaluate a condition list against one article, left-to-right.
pub fn evaluate(conditions: &[Condition], article: &RuleArticle) -> bool {
    let mut iter = conditions.iter();
    let Some(first) = iter.next() else {
        return true; // no conditions: match all
    };

    let mut result = evaluate_one(first, article);
    for condition in iter {
        let value = evaluate_one(condition, article);
        result = if condition.logic.eq_ignore_ascii_case("or") {
            result || value
        } else {
            result && value
        };
    }
    result
}

fn evaluate_one(condition: &Condition, article: &RuleArticle) -> bool {
    let outcome = match condition.field.as_str() {
        "feed_name" | "feed-name" => text_match(condition, &article.feed_name),
        "feed_category" | "feed-category" => text_match(condition, &article.feed_category),
        "article_title" | "article-title" | "title" => text_match(condition, &article.title),
        "published_after" | "published-after" => date_only(article.published)
            .zip(parse_date(&condition.value))
            .map(|(article_day, rule_day)| article_day > rule_day)
            .unwrap_or(true),
        // Inclusive of the named day
        "published_before" | "published-before" => date_only(article.published)
            .zip(parse_date(&condition.value))
            .map(|(article_day, rule_day)| article_day <= rule_day)
            .unwrap_or(true),
        "is_read" | "is-read" => article.read == (condition.value.trim() == "true"),
        "is_favorite" | "is-favorite" | "is_favourite" => {
            article.favorite == (condition.value.trim() == "true")
        }
        // Unknown fields are permissive
        _ => true,
    };

    if condition.negate {
        !outcome
    } else {
        outcome
    }
}

fn text_match(condition: &Condition, haystack: &str) -> bool {
    let haystack = haystack.to_lowercase();
    match condition.operator.as_str() {
        "exact" => haystack == condition.value.to_lowercase(),
        // Multi-select: any of the listed values contained
        "any_of" | "any-of" | "in" => condition
            .values
            .iter()
            .any(|v| haystack.contains(&v.to_lowercase())),
        // `contains` is the default operator
        _ => {
            if condition.values.is_empty() {
                haystack.contains(&condition.value.to_lowercase())
            } else {
                condition
                    .values
                    .iter()
                    .any(|v| haystack.contains(&v.to_lowercase()))
            }
        }
    }
}

/// Stored instants compare date-only, as UTC truncated to days.
fn date_only(timestamp: i64) -> Option<chrono::NaiveDate> {
    chrono::Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|dt| dt.date_naive())
}

fn parse_date(value: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

// ============================================================================
// Application
// ============================================================================

/// Rules as stored in the `rules` setting blob.
pub async fn load_rules(db: &Database) -> anyhow::Result<Vec<Rule>> {
    let raw = db.get_setting(SettingKey::Rules).await?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&raw)?)
}

/// Apply one rule, optionally restricted to the given article ids (the
/// ingest path passes the fresh rows). Returns how many articles matched.
pub async fn apply_rule(
    db: &Database,
    rule: &Rule,
    article_ids: Option<&[i64]>,
) -> anyhow::Result<u64> {
    let articles = db.get_articles_for_rules(article_ids).await?;
    let mut affected = 0u64;

    for article in &articles {
        if !evaluate(&rule.conditions, article) {
            continue;
        }
        affected += 1;
        for action in &rule.actions {
            dispatch(db, *action, article.id).await?;
        }
    }

    Ok(affected)
}

async fn dispatch(db: &Database, action: RuleAction, article_id: i64) -> anyhow::Result<()> {
    match action {
        RuleAction::Favorite => db.set_article_favorite(article_id, true).await?,
        RuleAction::Unfavorite => db.set_article_favorite(article_id, false).await?,
        RuleAction::Hide => db.set_article_hidden(article_id, true).await?,
        RuleAction::Unhide => db.set_article_hidden(article_id, false).await?,
        RuleAction::MarkRead => {
            db.mark_article_read(article_id, true).await?;
        }
        RuleAction::MarkUnread => {
            db.mark_article_read(article_id, false).await?;
        }
    }
    Ok(())
}

/// Ingest hook: run every rule flagged `apply_on_ingest` over the new rows.
pub async fn apply_ingest_rules(db: &Database, article_ids: &[i64]) {
    if article_ids.is_empty() {
        return;
    }
    let rules = match load_rules(db).await {
        Ok(rules) => rules,
        Err(e) => {
            tracing::warn!(error = %e, "rules blob failed to parse, skipping ingest rules");
            return;
        }
    };

    for rule in rules.iter().filter(|r| r.apply_on_ingest) {
        match apply_rule(db, rule, Some(article_ids)).await {
            Ok(affected) if affected > 0 => {
                tracing::info!(rule = %rule.name, affected = affected, "ingest rule applied");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(rule = %rule.name, error = %e, "ingest rule failed"),
        }
    }
}
