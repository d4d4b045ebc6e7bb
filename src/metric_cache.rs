use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::{DateRange, MetricSeries};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
  connection_id: i64,
  range: DateRange,
  metric_keys: Vec<String>,
}

impl CacheKey {
  fn new(connection_id: i64, range: DateRange, metric_keys: &[String]) -> Self {
    let mut metric_keys = metric_keys.to_vec();
    metric_keys.sort();
    metric_keys.dedup();
    Self {
      connection_id,
      range,
      metric_keys,
    }
  }
}

struct Entry {
  stored_at: Instant,
  series: Vec<MetricSeries>,
}

/// Complete fetch results per (connection, range, keys). Partial fetches are never stored.
pub struct MetricCache {
  ttl: Duration,
  entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl MetricCache {
  pub fn new(ttl: Duration) -> Self {
    Self {
      ttl,
      entries: Mutex::new(HashMap::new()),
    }
  }

  pub fn get(&self, connection_id: i64, range: DateRange, metric_keys: &[String]) -> Option<Vec<MetricSeries>> {
    let key = CacheKey::new(connection_id, range, metric_keys);
    let mut entries = self.entries.lock().ok()?;
    match entries.get(&key) {
      Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(reorder(&entry.series, metric_keys)),
      Some(_) => {
        entries.remove(&key);
        None
      }
      None => None,
    }
  }

  pub fn put(&self, connection_id: i64, range: DateRange, metric_keys: &[String], series: Vec<MetricSeries>) {
    if self.ttl.is_zero() {
      return;
    }
    let key = CacheKey::new(connection_id, range, metric_keys);
    if let Ok(mut entries) = self.entries.lock() {
      entries.retain(|_, entry| entry.stored_at.elapsed() < self.ttl);
      entries.insert(
        key,
        Entry {
          stored_at: Instant::now(),
          series,
        },
      );
    }
  }

  /// Drops everything cached for a connection, e.g. after it is superseded.
  pub fn invalidate_connection(&self, connection_id: i64) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.retain(|key, _| key.connection_id != connection_id);
    }
  }

  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// The key set is order-insensitive; callers get series back in the order they asked for.
fn reorder(series: &[MetricSeries], metric_keys: &[String]) -> Vec<MetricSeries> {
  metric_keys
    .iter()
    .filter_map(|key| series.iter().find(|s| &s.metric_key == key).cloned())
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::models::{MetricPoint, Provider};
  use chrono::NaiveDate;

  fn range() -> DateRange {
    DateRange::new(
      NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
      NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
    )
    .unwrap()
  }

  fn series(key: &str) -> MetricSeries {
    MetricSeries {
      provider: Provider::Aggregator,
      account_id: "acct".to_string(),
      metric_key: key.to_string(),
      points: vec![MetricPoint {
        date: range().start,
        value: Some(1.0),
      }],
    }
  }

  #[test]
  fn hit_ignores_key_order() {
    let cache = MetricCache::new(Duration::from_secs(60));
    let keys = vec!["clicks".to_string(), "spend".to_string()];
    cache.put(7, range(), &keys, vec![series("clicks"), series("spend")]);

    let reversed = vec!["spend".to_string(), "clicks".to_string()];
    let hit = cache.get(7, range(), &reversed).unwrap();
    assert_eq!(hit[0].metric_key, "spend");
    assert_eq!(hit[1].metric_key, "clicks");
    assert!(cache.get(8, range(), &keys).is_none());
  }

  #[test]
  fn zero_ttl_disables_caching() {
    let cache = MetricCache::new(Duration::ZERO);
    let keys = vec!["clicks".to_string()];
    cache.put(1, range(), &keys, vec![series("clicks")]);
    assert!(cache.is_empty());
  }

  #[test]
  fn invalidate_drops_only_that_connection() {
    let cache = MetricCache::new(Duration::from_secs(60));
    let keys = vec!["clicks".to_string()];
    cache.put(1, range(), &keys, vec![series("clicks")]);
    cache.put(2, range(), &keys, vec![series("clicks")]);
    cache.invalidate_connection(1);
    assert!(cache.get(1, range(), &keys).is_none());
    assert!(cache.get(2, range(), &keys).is_some());
  }
}
