use dashmap::DashMap;
use std::hash::Hash;

/// Clone every value out of `map`.
///
/// Session code awaits constantly; working on a snapshot means no shard
/// lock is held across an `.await`.
pub fn values<K, V>(map: &DashMap<K, V>) -> Vec<V>
where
    K: Eq + Hash,
    V: Clone,
{
    map.iter().map(|e| e.value().clone()).collect()
}
