//! Dynamic playlist extension.

use std::collections::HashSet;
use std::sync::Arc;

use common::{fold, Track};
use parking_lot::RwLock;

/// Suggests tracks similar to a set of seeds. Lookups may block; the engine
/// service runs them on a worker under a deadline.
#[cfg_attr(test, mockall::automock)]
pub trait DynamicExtender: Send + Sync {
    /// Up to `count` URIs, or `None` when no suggestion can be made.
    fn similar(&self, seeds: &[Arc<Track>], count: usize) -> Option<Vec<String>>;
}

/// Offline extender over the local catalog. Candidates sharing an artist
/// with a seed rank before those sharing only a genre; within a rank,
/// less-played tracks come first.
pub struct LocalExtender {
    catalog: Arc<RwLock<Vec<Arc<Track>>>>,
}

impl LocalExtender {
    pub fn new(catalog: Arc<RwLock<Vec<Arc<Track>>>>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> Arc<RwLock<Vec<Arc<Track>>>> {
        Arc::clone(&self.catalog)
    }
}

fn folded(values: &[String]) -> HashSet<String> {
    values.iter().map(|value| fold(value)).collect()
}

impl DynamicExtender for LocalExtender {
    fn similar(&self, seeds: &[Arc<Track>], count: usize) -> Option<Vec<String>> {
        if seeds.is_empty() || count == 0 {
            return None;
        }
        let seed_uris: HashSet<&str> = seeds.iter().map(|track| track.loc()).collect();
        let mut artists = HashSet::new();
        let mut genres = HashSet::new();
        for seed in seeds {
            artists.extend(folded(seed.artists()));
            genres.extend(folded(seed.get("genre").unwrap_or_default()));
        }

        let catalog = self.catalog.read();
        let mut ranked: Vec<(u8, u64, &str)> = catalog
            .iter()
            .filter(|track| !seed_uris.contains(track.loc()))
            .filter_map(|track| {
                let rank = if !folded(track.artists()).is_disjoint(&artists) {
                    0
                } else if !folded(track.get("genre").unwrap_or_default()).is_disjoint(&genres) {
                    1
                } else {
                    return None;
                };
                Some((rank, track.playcount(), track.loc()))
            })
            .collect();
        ranked.sort();
        let picked: Vec<String> = ranked
            .into_iter()
            .take(count)
            .map(|(_, _, loc)| loc.to_string())
            .collect();
        (!picked.is_empty()).then_some(picked)
    }
}
