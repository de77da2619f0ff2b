//! Unwindowed per-key aggregation, the bounded Top-N accumulator and store materialization.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sluice_core::{metrics, Context, KvState, Operator, Record, Result};
use tracing::instrument;

type Init<A> = Box<dyn Fn() -> A + Send + Sync>;
type Aggregator<A> = Box<dyn Fn(&[u8], &serde_json::Value, A) -> A + Send + Sync>;

/// Running per-key aggregate stored in a `KvState`; forwards every updated value.
///
/// The accumulator for a key is materialized by `init` on first touch and replaced by
/// `aggregator(key, value, previous)` afterwards. Requires records to be partitioned
/// by the aggregation key.
pub struct Aggregate<A> {
    name: String,
    store: Arc<dyn KvState>,
    init: Init<A>,
    aggregator: Aggregator<A>,
}

impl<A> Aggregate<A>
where
    A: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new<I, F>(name: impl Into<String>, store: Arc<dyn KvState>, init: I, aggregator: F) -> Self
    where
        I: Fn() -> A + Send + Sync + 'static,
        F: Fn(&[u8], &serde_json::Value, A) -> A + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            store,
            init: Box::new(init),
            aggregator: Box::new(aggregator),
        }
    }

    /// Applies one input to the accumulator of `key` and returns the new value.
    pub async fn apply(&self, key: &[u8], value: &serde_json::Value) -> Result<A> {
        let prev = match self.store.get(key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => (self.init)(),
        };
        let next = (self.aggregator)(key, value, prev);
        self.store.put(key, serde_json::to_vec(&next)?).await?;
        Ok(next)
    }
}

#[async_trait]
impl<A> Operator for Aggregate<A>
where
    A: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[instrument(name = "aggregate_on_element", skip_all)]
    async fn on_element(&mut self, ctx: &mut dyn Context, rec: Record) -> Result<()> {
        metrics::OP_THROUGHPUT
            .with_label_values(&[self.name.as_str(), "receive"])
            .inc();
        let next = self.apply(&rec.key, &rec.value).await?;
        ctx.collect(Record::new(
            self.name.clone(),
            rec.key,
            serde_json::to_value(&next)?,
            rec.event_time,
        ));
        metrics::OP_THROUGHPUT
            .with_label_values(&[self.name.as_str(), "emit"])
            .inc();
        Ok(())
    }
}

/// Bounded ranked collection: keeps at most `capacity` entries, best first.
///
/// Entries that compare equal keep their insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopN<T> {
    capacity: usize,
    entries: Vec<T>,
}

impl<T> TopN<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity + 1),
        }
    }

    /// `rank(a, b) == Less` means `a` ranks ahead of `b`.
    pub fn insert_by<F>(&mut self, item: T, rank: F)
    where
        F: Fn(&T, &T) -> Ordering,
    {
        let at = self
            .entries
            .iter()
            .position(|existing| rank(&item, existing) == Ordering::Less)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, item);
        self.entries.truncate(self.capacity);
    }

    /// Ranks by `score`, highest first.
    pub fn insert_by_score<K, F>(&mut self, item: T, score: F)
    where
        K: Ord,
        F: Fn(&T) -> K,
    {
        self.insert_by(item, |a, b| score(b).cmp(&score(a)));
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn into_vec(self) -> Vec<T> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Writes each record's value to `store` under its key and forwards the record.
///
/// A `null` value deletes the key.
pub struct Materialize {
    store: Arc<dyn KvState>,
}

impl Materialize {
    pub fn new(store: Arc<dyn KvState>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Operator for Materialize {
    async fn on_element(&mut self, ctx: &mut dyn Context, rec: Record) -> Result<()> {
        if rec.value.is_null() {
            self.store.delete(&rec.key).await?;
        } else {
            self.store.put(&rec.key, serde_json::to_vec(&rec.value)?).await?;
        }
        ctx.collect(rec);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{CollectingContext, EventTime};
    use sluice_state::InMemoryState;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Score {
        player: String,
        score: i64,
    }

    fn score(player: &str, score: i64) -> Score {
        Score {
            player: player.into(),
            score,
        }
    }

    #[test]
    fn top_three_keeps_highest_scores() {
        let mut top = TopN::new(3);
        for s in [50, 80, 30, 90] {
            top.insert_by_score(s, |v| *v);
        }
        assert_eq!(top.entries(), &[90, 80, 50]);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let mut top = TopN::new(3);
        for (p, s) in [("ann", 70), ("bob", 90), ("cy", 70), ("dee", 70)] {
            top.insert_by_score(score(p, s), |v| v.score);
        }
        let names: Vec<_> = top.entries().iter().map(|s| s.player.as_str()).collect();
        assert_eq!(names, vec!["bob", "ann", "cy"]);
    }

    #[tokio::test]
    async fn aggregate_emits_every_update_and_persists() {
        let store = Arc::new(InMemoryState::new());
        let mut op = Aggregate::new(
            "high-scores",
            store.clone(),
            || TopN::<Score>::new(3),
            |_key, value, mut top: TopN<Score>| {
                if let Ok(s) = serde_json::from_value::<Score>(value.clone()) {
                    top.insert_by_score(s, |v| v.score);
                }
                top
            },
        );
        let mut ctx = CollectingContext::default();
        for (p, s) in [("ann", 50), ("bob", 80), ("cy", 30), ("dee", 90)] {
            let rec = Record::new("score-events", "1", serde_json::to_value(score(p, s)).unwrap(), EventTime(0));
            op.on_element(&mut ctx, rec).await.unwrap();
        }
        assert_eq!(ctx.out.len(), 4);
        let last: TopN<Score> = serde_json::from_value(ctx.out[3].value.clone()).unwrap();
        let scores: Vec<_> = last.entries().iter().map(|s| s.score).collect();
        assert_eq!(scores, vec![90, 80, 50]);

        let stored: TopN<Score> = serde_json::from_slice(&store.get(b"1").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored, last);
    }

    #[tokio::test]
    async fn materialize_puts_and_tombstones() {
        let store = Arc::new(InMemoryState::new());
        let mut op = Materialize::new(store.clone());
        let mut ctx = CollectingContext::default();
        op.on_element(&mut ctx, Record::new("t", "k", serde_json::json!({"n": 1}), EventTime(0)))
            .await
            .unwrap();
        assert!(store.get(b"k").await.unwrap().is_some());
        op.on_element(&mut ctx, Record::new("t", "k", serde_json::Value::Null, EventTime(1)))
            .await
            .unwrap();
        assert!(store.get(b"k").await.unwrap().is_none());
        assert_eq!(ctx.out.len(), 2);
    }
}
