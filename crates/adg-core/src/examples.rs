//! Few-shot example repository: insertion under a hard cap, selection
//! strategies, and rendering for the classifier.

use chrono::{DateTime, Utc};

use crate::{
    domain::{ChatId, Label, UserId},
    settings::SelectMode,
    store::{Example, ModerationStore},
    text::truncate_chars,
    Result,
};

pub const PREVIEW_CHARS: usize = 180;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddExampleOutcome {
    Added(i64),
    HardcapReached,
    EmptyText,
}

pub async fn add_example(
    store: &dyn ModerationStore,
    chat_id: ChatId,
    text: &str,
    user_id: Option<UserId>,
    label: Label,
    hardcap: usize,
) -> Result<AddExampleOutcome> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(AddExampleOutcome::EmptyText);
    }
    let count = store.count_examples(chat_id).await?;
    if count >= hardcap as i64 {
        return Ok(AddExampleOutcome::HardcapReached);
    }
    let id = store.insert_example(chat_id, text, user_id, label).await?;
    tracing::info!(chat_id = chat_id.0, id, label = %label, "example added");
    Ok(AddExampleOutcome::Added(id))
}

/// Pick up to `limit` examples for a classification call.
pub async fn select_examples(
    store: &dyn ModerationStore,
    chat_id: ChatId,
    mode: SelectMode,
    limit: usize,
) -> Result<Vec<Example>> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    match mode {
        SelectMode::Latest => store.recent_examples(chat_id, None, limit, &[]).await,
        SelectMode::Balanced => select_balanced(store, chat_id, limit).await,
    }
}

async fn select_balanced(
    store: &dyn ModerationStore,
    chat_id: ChatId,
    limit: usize,
) -> Result<Vec<Example>> {
    let half_ad = limit / 2;
    let half_not = limit - half_ad;

    let mut picked = store
        .recent_examples(chat_id, Some(Label::Ad), half_ad, &[])
        .await?;
    picked.extend(
        store
            .recent_examples(chat_id, Some(Label::NotAd), half_not, &[])
            .await?,
    );

    let remain = limit.saturating_sub(picked.len());
    if remain > 0 {
        let exclude: Vec<i64> = picked.iter().map(|e| e.id).collect();
        picked.extend(
            store
                .recent_examples(chat_id, None, remain, &exclude)
                .await?,
        );
    }

    picked.sort_by(|a, b| b.id.cmp(&a.id));
    picked.dedup_by_key(|e| e.id);
    picked.truncate(limit);
    Ok(picked)
}

/// `example N:\n[LABEL]\ntext` blocks separated by a blank line.
pub fn render_examples(examples: &[Example]) -> String {
    examples
        .iter()
        .enumerate()
        .map(|(i, e)| format!("example {}:\n[{}]\n{}", i + 1, e.label, e.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExamplePreview {
    pub id: i64,
    pub preview: String,
    pub label: Label,
    pub created_at: DateTime<Utc>,
}

pub async fn list_examples(
    store: &dyn ModerationStore,
    chat_id: ChatId,
    limit: usize,
) -> Result<Vec<ExamplePreview>> {
    let rows = store.recent_examples(chat_id, None, limit, &[]).await?;
    Ok(rows
        .into_iter()
        .map(|e| ExamplePreview {
            id: e.id,
            preview: truncate_chars(&e.text, PREVIEW_CHARS),
            label: e.label,
            created_at: e.created_at,
        })
        .collect())
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExampleStats {
    pub ad: i64,
    pub not_ad: i64,
}

impl ExampleStats {
    pub fn total(&self) -> i64 {
        self.ad + self.not_ad
    }

    pub fn ad_percent(&self) -> f64 {
        percent(self.ad, self.total())
    }

    pub fn not_ad_percent(&self) -> f64 {
        percent(self.not_ad, self.total())
    }
}

fn percent(part: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

pub async fn example_stats(store: &dyn ModerationStore, chat_id: ChatId) -> Result<ExampleStats> {
    let mut stats = ExampleStats::default();
    for (label, n) in store.example_label_counts(chat_id).await? {
        match label {
            Label::Ad => stats.ad += n,
            Label::NotAd => stats.not_ad += n,
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    const CHAT: ChatId = ChatId(-100);

    async fn seed(store: &MemoryStore, labels: &[Label]) {
        for (i, label) in labels.iter().enumerate() {
            store
                .insert_example(CHAT, &format!("sample {i}"), None, *label)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn balanced_is_even_when_both_labels_are_plentiful() {
        let store = MemoryStore::default();
        let mut labels = vec![Label::Ad; 8];
        labels.extend(vec![Label::NotAd; 8]);
        seed(&store, &labels).await;

        for limit in [1usize, 4, 7, 10] {
            let picked = select_examples(&store, CHAT, SelectMode::Balanced, limit)
                .await
                .unwrap();
            assert!(picked.len() <= limit);
            let ads = picked.iter().filter(|e| e.label == Label::Ad).count() as i64;
            let nots = picked.len() as i64 - ads;
            assert!((ads - nots).abs() <= 1, "limit={limit} ads={ads} nots={nots}");
        }
    }

    #[tokio::test]
    async fn balanced_backfills_from_majority_label() {
        let store = MemoryStore::default();
        let mut labels = vec![Label::Ad; 1];
        labels.extend(vec![Label::NotAd; 9]);
        seed(&store, &labels).await;

        let picked = select_examples(&store, CHAT, SelectMode::Balanced, 6)
            .await
            .unwrap();
        assert_eq!(picked.len(), 6);
        assert_eq!(picked.iter().filter(|e| e.label == Label::Ad).count(), 1);
        let ids: Vec<i64> = picked.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn latest_ignores_labels() {
        let store = MemoryStore::default();
        seed(&store, &[Label::Ad, Label::Ad, Label::NotAd, Label::Ad]).await;
        let picked = select_examples(&store, CHAT, SelectMode::Latest, 2)
            .await
            .unwrap();
        assert_eq!(
            picked.iter().map(|e| e.text.as_str()).collect::<Vec<_>>(),
            vec!["sample 3", "sample 2"]
        );
    }

    #[tokio::test]
    async fn hardcap_refuses_new_examples() {
        let store = MemoryStore::default();
        for _ in 0..2 {
            let out = add_example(&store, CHAT, "buy now", None, Label::Ad, 2)
                .await
                .unwrap();
            assert!(matches!(out, AddExampleOutcome::Added(_)));
        }
        let out = add_example(&store, CHAT, "buy now", None, Label::Ad, 2)
            .await
            .unwrap();
        assert_eq!(out, AddExampleOutcome::HardcapReached);
    }

    #[test]
    fn render_numbers_examples() {
        let mk = |id, label, text: &str| Example {
            id,
            chat_id: CHAT,
            text: text.to_string(),
            label,
            user_id: None,
            created_at: Utc::now(),
        };
        let out = render_examples(&[mk(2, Label::Ad, "cheap phones"), mk(1, Label::NotAd, "hi all")]);
        assert_eq!(out, "example 1:\n[AD]\ncheap phones\n\nexample 2:\n[NOT_AD]\nhi all");
    }

    #[tokio::test]
    async fn stats_report_percentages() {
        let store = MemoryStore::default();
        seed(&store, &[Label::Ad, Label::NotAd, Label::NotAd, Label::NotAd]).await;
        let stats = example_stats(&store, CHAT).await.unwrap();
        assert_eq!(stats.total(), 4);
        assert!((stats.ad_percent() - 25.0).abs() < 1e-9);
    }
}
